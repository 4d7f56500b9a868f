//! Checkout engine — materializing images into working schemas.
//!
//! `init` seeds a repository with its root image; `checkout` rebuilds the
//! working schema from an image's table pointers and re-attaches change
//! tracking. Every checkout runs in one transaction: any failure rolls the
//! working schema back to the prior state.

use tracing::info;

use crate::catalog::{self, object_table};
use crate::engine::{Engine, SqlEngine};
use crate::error::StrataError;
use crate::fragments;
use crate::image::{self, HEAD_TAG, Image, LATEST_TAG, ROOT_IMAGE_HASH};
use crate::object_manager::ObjectManager;
use crate::repository::Repository;
use crate::schema::TableSchema;
use crate::sql::{join_idents, qualified};

/// Advisory-lock class guarding a repository's working schema.
pub const CHECKOUT_LOCK_CLASS: i32 = 8342;

/// Initialize a repository: meta schema, working schema, root image, and the
/// `HEAD`/`latest` tags pointing at it.
pub fn init<E: SqlEngine>(engine: &mut E, repo: &Repository) -> Result<Image, StrataError> {
    catalog::ensure_metadata_schema(engine)?;
    if catalog::read_tag(engine, repo, HEAD_TAG).is_ok() {
        return Err(StrataError::InvalidReference(format!(
            "repository {repo} is already initialized"
        )));
    }

    engine.begin()?;
    let seeded = (|| -> Result<Image, StrataError> {
        engine.create_schema(&repo.working_schema())?;
        let root = Image {
            namespace: repo.namespace.clone(),
            repository: repo.name.clone(),
            hash: ROOT_IMAGE_HASH.to_string(),
            parent: None,
            created_at: chrono::Utc::now(),
            comment: Some("Initial empty image".to_string()),
        };
        catalog::insert_image(engine, &root)?;
        catalog::write_tag(engine, repo, HEAD_TAG, ROOT_IMAGE_HASH)?;
        catalog::write_tag(engine, repo, LATEST_TAG, ROOT_IMAGE_HASH)?;
        Ok(root)
    })();
    match seeded {
        Ok(root) => {
            engine.commit_tx()?;
            info!(repository = %repo, "initialized repository");
            Ok(root)
        }
        Err(err) => {
            let _ = engine.rollback();
            Err(err)
        }
    }
}

/// Check out an image into the repository's working schema.
///
/// Refuses with [`StrataError::DirtyWorkspace`] when pending changes exist
/// and `force` is not set, and with [`StrataError::WorkspaceBusy`] when
/// another session holds the workspace.
pub fn checkout<E: Engine>(
    engine: &mut E,
    repo: &Repository,
    image_hash: &str,
    force: bool,
) -> Result<(), StrataError> {
    engine.begin()?;
    let result = checkout_inner(engine, repo, image_hash, force);
    match result {
        Ok(()) => {
            engine.commit_tx()?;
            info!(repository = %repo, image = image_hash, "checked out image");
            Ok(())
        }
        Err(err) => {
            let _ = engine.rollback();
            Err(err)
        }
    }
}

fn checkout_inner<E: Engine>(
    engine: &mut E,
    repo: &Repository,
    image_hash: &str,
    force: bool,
) -> Result<(), StrataError> {
    if !engine.try_advisory_xact_lock(CHECKOUT_LOCK_CLASS, &repo.lock_key())? {
        return Err(StrataError::WorkspaceBusy(repo.to_string()));
    }
    catalog::get_image(engine, repo, image_hash)?;

    let workspace = repo.working_schema();
    if !force && engine.has_pending_changes(&workspace)? {
        return Err(StrataError::DirtyWorkspace(repo.to_string()));
    }

    // Detach tracking and drop the tracked tables; anything untracked in the
    // working schema is not ours to touch.
    let tracked: Vec<(String, String)> = engine
        .get_tracked_tables()?
        .into_iter()
        .filter(|(schema, _)| *schema == workspace)
        .collect();
    engine.untrack_tables(&tracked)?;
    for (_, table) in &tracked {
        engine.delete_table(&workspace, table)?;
    }

    engine.create_schema(&workspace)?;
    let tables = catalog::tables_for_image(engine, repo, image_hash)?;
    let mut to_track = Vec::with_capacity(tables.len());
    for (table, spec, chain) in &tables {
        engine.with_savepoint("strata_materialize", |e| {
            ObjectManager::new(e).resolve(repo, image_hash, table)?;
            materialize_chain(e, spec, chain, &workspace, table)
        })?;
        to_track.push((workspace.clone(), table.clone()));
    }

    // Tracking attaches after materialization so the copy itself does not
    // land in the audit log.
    engine.track_tables(&to_track)?;
    engine.discard_pending_changes(&workspace, None)?;
    catalog::write_tag(engine, repo, HEAD_TAG, image_hash)
}

/// Materialize one table of one image into an arbitrary target table.
pub fn materialize_table<E: Engine>(
    engine: &mut E,
    repo: &Repository,
    image_hash: &str,
    table: &str,
    target_schema: &str,
    target_table: &str,
) -> Result<(), StrataError> {
    let (spec, chain) = catalog::get_table_pointer(engine, repo, image_hash, table)?;
    ObjectManager::new(engine).resolve(repo, image_hash, table)?;
    materialize_chain(engine, &spec, &chain, target_schema, target_table)
}

/// Rebuild a chain: create the target from the spec, copy the snapshot in,
/// then apply each diff in order.
pub fn materialize_chain<E: SqlEngine>(
    engine: &mut E,
    spec: &TableSchema,
    chain: &[String],
    target_schema: &str,
    target_table: &str,
) -> Result<(), StrataError> {
    let (snapshot, diffs) = chain.split_first().ok_or_else(|| {
        StrataError::InvalidReference("cannot materialize an empty chain".to_string())
    })?;
    engine.create_table(target_schema, target_table, spec, false, false)?;
    let columns = join_idents(None, &spec.column_names());
    engine.execute(&format!(
        "INSERT INTO {} ({columns}) SELECT {columns} FROM {}",
        qualified(target_schema, target_table),
        object_table(snapshot)
    ))?;
    fragments::apply_fragments(engine, diffs, target_schema, target_table)
}

/// Drop a repository's working schema and tracking without touching its
/// images. The inverse of `checkout`.
pub fn uncheckout<E: Engine>(
    engine: &mut E,
    repo: &Repository,
    force: bool,
) -> Result<(), StrataError> {
    let workspace = repo.working_schema();
    if !force && engine.has_pending_changes(&workspace)? {
        return Err(StrataError::DirtyWorkspace(repo.to_string()));
    }
    let tracked: Vec<(String, String)> = engine
        .get_tracked_tables()?
        .into_iter()
        .filter(|(schema, _)| *schema == workspace)
        .collect();
    engine.untrack_tables(&tracked)?;
    engine.delete_schema(&workspace)?;
    catalog::delete_tag(engine, repo, HEAD_TAG)?;
    info!(repository = %repo, "working schema dropped");
    Ok(())
}

/// Convenience: resolve any reference and check it out.
pub fn checkout_ref<E: Engine>(
    engine: &mut E,
    repo: &Repository,
    reference: &str,
    force: bool,
) -> Result<String, StrataError> {
    let image_hash = image::resolve_ref(engine, repo, reference)?;
    checkout(engine, repo, &image_hash, force)?;
    Ok(image_hash)
}
