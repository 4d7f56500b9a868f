//! Object manager — chain resolution and object lifecycle.
//!
//! Resolution maps `(repository, image, table)` to the snapshot-first object
//! chain recorded in the catalog and verifies every member still exists.
//! Lifetime is reference-counted: each `(image, table)` pointer takes one
//! reference on every chain member, and [`ObjectManager::gc`] sweeps objects
//! with none left. The sweep takes an exclusive lock on the object table,
//! which chain resolution also reads, so readers cannot race a deletion.

use tracing::info;
use uuid::Uuid;

use crate::catalog::{self, META_SCHEMA};
use crate::engine::SqlEngine;
use crate::error::StrataError;
use crate::fragments;
use crate::repository::Repository;

/// Prefix distinguishing staging tables from content-addressed objects.
pub const STAGING_PREFIX: &str = "tmp_";

/// A locally unique staging-table identifier. Never collides with a content
/// address: those are bare 64-char hex.
pub fn get_random_object_id() -> String {
    format!("{STAGING_PREFIX}{}", Uuid::new_v4().simple())
}

pub struct ObjectManager<'e, E: SqlEngine> {
    engine: &'e mut E,
}

impl<'e, E: SqlEngine> ObjectManager<'e, E> {
    pub fn new(engine: &'e mut E) -> Self {
        ObjectManager { engine }
    }

    /// Resolve one table at one image to `(snapshot, diff chain)` in
    /// application order.
    pub fn resolve(
        &mut self,
        repo: &Repository,
        image_hash: &str,
        table: &str,
    ) -> Result<(String, Vec<String>), StrataError> {
        let (_, chain) = catalog::get_table_pointer(self.engine, repo, image_hash, table)?;
        if chain.is_empty() {
            return Err(StrataError::InvalidReference(format!(
                "empty object chain for '{table}' at {repo}:{image_hash}"
            )));
        }
        // Touch every member's catalog row: a missing object surfaces here
        // rather than mid-query, and the read blocks behind a running GC.
        for object_id in &chain {
            catalog::get_object(self.engine, object_id)?;
        }
        let mut chain = chain.into_iter();
        let snapshot = chain.next().expect("chain is non-empty");
        Ok((snapshot, chain.collect()))
    }

    /// Delete every unreferenced object. Runs in its own transaction under
    /// an exclusive lock on the object table; concurrent resolutions wait.
    pub fn gc(&mut self) -> Result<Vec<String>, StrataError> {
        self.engine.begin()?;
        let swept = (|| -> Result<Vec<String>, StrataError> {
            self.engine.lock_table(META_SCHEMA, "objects")?;
            let unreferenced = catalog::unreferenced_objects(self.engine)?;
            fragments::delete_objects(self.engine, &unreferenced)?;
            Ok(unreferenced)
        })();
        match swept {
            Ok(ids) => {
                self.engine.commit_tx()?;
                info!(swept = ids.len(), "object GC finished");
                Ok(ids)
            }
            Err(err) => {
                let _ = self.engine.rollback();
                Err(err)
            }
        }
    }
}
