//! Commit engine — turning pending changes into new images.
//!
//! A commit walks the working schema against the parent image: tables with
//! pending changes get a fresh diff fragment appended to their chain, new
//! tables are snapshotted, unchanged tables reuse the parent's pointer
//! verbatim, dropped tables are omitted. The new image hash digests the
//! parent, the sorted table-pointer map, the timestamp and the comment.
//!
//! Commits on one repository are serialized by an advisory lock; a second
//! committer does not wait but fails with `ConcurrentCommit` and must
//! rebase. The whole commit is one transaction: either the image is visible
//! in the graph or nothing is.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use tracing::info;

use crate::catalog::{self, META_SCHEMA};
use crate::checkout::materialize_chain;
use crate::engine::Engine;
use crate::error::StrataError;
use crate::fragments::FragmentStore;
use crate::image::{self, HEAD_TAG, Image, LATEST_TAG, image_digest};
use crate::object_manager::get_random_object_id;
use crate::repository::Repository;
use crate::schema::TableSchema;

/// Advisory-lock class serializing commits per repository.
pub const COMMIT_LOCK_CLASS: i32 = 8341;

/// Commit behavior knobs.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub comment: Option<String>,
    /// Fail with `NoPendingChanges` instead of producing an image that
    /// shares every pointer with its parent.
    pub reject_empty: bool,
    /// Maximum diff-chain length before a table is rewritten as a fresh
    /// snapshot. `None` (the default) never compacts.
    pub snap_threshold: Option<usize>,
}

impl CommitOptions {
    pub fn with_comment(comment: impl Into<String>) -> Self {
        CommitOptions {
            comment: Some(comment.into()),
            ..Default::default()
        }
    }
}

/// Commit the working schema's pending changes on top of `HEAD`.
pub fn commit<E: Engine>(
    engine: &mut E,
    repo: &Repository,
    options: &CommitOptions,
) -> Result<Image, StrataError> {
    engine.begin()?;
    match commit_inner(engine, repo, options) {
        Ok(image) => {
            engine.commit_tx()?;
            info!(repository = %repo, image = %image.hash, "committed");
            Ok(image)
        }
        Err(err) => {
            let _ = engine.rollback();
            Err(err)
        }
    }
}

fn commit_inner<E: Engine>(
    engine: &mut E,
    repo: &Repository,
    options: &CommitOptions,
) -> Result<Image, StrataError> {
    if !engine.try_advisory_xact_lock(COMMIT_LOCK_CLASS, &repo.lock_key())? {
        return Err(StrataError::ConcurrentCommit(repo.to_string()));
    }

    let head_hash = image::head(engine, repo)?;
    let workspace = repo.working_schema();

    let parent_tables: BTreeMap<String, (TableSchema, Vec<String>)> =
        catalog::tables_for_image(engine, repo, &head_hash)?
            .into_iter()
            .map(|(name, spec, chain)| (name, (spec, chain)))
            .collect();
    let current_tables = engine.get_all_tables(&workspace)?;
    let changed: HashSet<String> = engine
        .get_changed_tables(&workspace)?
        .into_iter()
        .collect();

    let mut new_tables: BTreeMap<String, (TableSchema, Vec<String>)> = BTreeMap::new();
    let mut dirty = false;

    for table in &current_tables {
        match parent_tables.get(table) {
            Some((spec, parent_chain)) => {
                let live_spec = engine.get_full_table_schema(&workspace, table)?;
                if live_spec != *spec {
                    return Err(StrataError::SchemaMismatch(format!(
                        "schema of '{table}' changed since {head_hash}; \
                         schema evolution across a chain is not supported"
                    )));
                }
                let mut chain = parent_chain.clone();
                if changed.contains(table) {
                    let changeset = engine.get_pending_changes(&workspace, table)?;
                    if !changeset.is_empty() {
                        dirty = true;
                        chain = engine.with_savepoint("strata_commit_table", |e| {
                            let mut chain = parent_chain.clone();
                            let diff =
                                FragmentStore::new(e).put_diff(&changeset.records(), spec)?;
                            chain.push(diff);
                            maybe_compact(e, spec, chain, options)
                        })?;
                    }
                }
                new_tables.insert(table.clone(), (spec.clone(), chain));
            }
            None => {
                dirty = true;
                let (spec, chain) = engine.with_savepoint("strata_commit_table", |e| {
                    let snapshot = FragmentStore::new(e).put_snapshot(&workspace, table)?;
                    let spec = e.get_full_table_schema(&workspace, table)?;
                    Ok((spec, vec![snapshot]))
                })?;
                new_tables.insert(table.clone(), (spec, chain));
            }
        }
    }
    // Tables present in the parent but gone from the workspace are dropped
    // from the new image simply by not being written.
    if parent_tables.keys().any(|name| !new_tables.contains_key(name)) {
        dirty = true;
    }

    if !dirty && options.reject_empty {
        return Err(StrataError::NoPendingChanges(repo.to_string()));
    }

    let created_at = Utc::now();
    let chains: BTreeMap<String, Vec<String>> = new_tables
        .iter()
        .map(|(name, (_, chain))| (name.clone(), chain.clone()))
        .collect();
    let hash = image_digest(
        Some(&head_hash),
        &chains,
        &created_at,
        options.comment.as_deref(),
    );

    let new_image = Image {
        namespace: repo.namespace.clone(),
        repository: repo.name.clone(),
        hash: hash.clone(),
        parent: Some(head_hash),
        created_at,
        comment: options.comment.clone(),
    };
    catalog::insert_image(engine, &new_image)?;
    for (table, (spec, chain)) in &new_tables {
        catalog::set_table_pointer(engine, repo, &hash, table, spec, chain)?;
    }

    // Newly committed tables start tracking here; re-tracking the rest is
    // idempotent.
    let to_track: Vec<(String, String)> = current_tables
        .iter()
        .map(|table| (workspace.clone(), table.clone()))
        .collect();
    engine.track_tables(&to_track)?;
    engine.discard_pending_changes(&workspace, None)?;

    catalog::write_tag(engine, repo, HEAD_TAG, &hash)?;
    catalog::write_tag(engine, repo, LATEST_TAG, &hash)?;
    Ok(new_image)
}

/// Rewrite a chain as a single fresh snapshot when it outgrew the
/// configured threshold. Invisible to callers: the table's content is
/// unchanged.
fn maybe_compact<E: Engine>(
    engine: &mut E,
    spec: &TableSchema,
    chain: Vec<String>,
    options: &CommitOptions,
) -> Result<Vec<String>, StrataError> {
    let Some(threshold) = options.snap_threshold else {
        return Ok(chain);
    };
    if chain.len().saturating_sub(1) <= threshold {
        return Ok(chain);
    }
    let staging = get_random_object_id();
    materialize_chain(engine, spec, &chain, META_SCHEMA, &staging)?;
    let snapshot = FragmentStore::new(engine).put_snapshot(META_SCHEMA, &staging)?;
    engine.delete_table(META_SCHEMA, &staging)?;
    info!(chain_len = chain.len(), snapshot = %snapshot, "compacted diff chain");
    Ok(vec![snapshot])
}

/// The aggregate status of the working schema: tables with pending changes
/// and their `(inserted, deleted, updated)` counts.
pub fn status<E: Engine>(
    engine: &mut E,
    repo: &Repository,
) -> Result<Vec<(String, (usize, usize, usize))>, StrataError> {
    let workspace = repo.working_schema();
    let mut report = Vec::new();
    for table in engine.get_changed_tables(&workspace)? {
        let counts = engine.get_pending_change_counts(&workspace, &table)?;
        report.push((table, counts));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = CommitOptions::default();
        assert!(options.comment.is_none());
        assert!(!options.reject_empty);
        assert!(options.snap_threshold.is_none());
    }

    #[test]
    fn test_with_comment() {
        let options = CommitOptions::with_comment("import");
        assert_eq!(options.comment.as_deref(), Some("import"));
        assert!(!options.reject_empty);
    }
}
