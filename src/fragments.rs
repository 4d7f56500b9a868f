//! Fragment store — the on-disk representation of objects.
//!
//! Each object is one storage table in the meta schema. Snapshot objects
//! carry the logical table's rows, schema and primary key verbatim. Diff
//! objects carry one row per change record: the change-key columns plus an
//! action discriminator and a JSONB payload of affected non-key columns.
//!
//! Object IDs are SHA-256 digests of canonical content: the schema spec plus
//! the row stream in change-key order (snapshots), or the schema spec plus
//! the records sorted by change key (diffs). Identical content always yields
//! the same ID, so re-storing is a no-op.
//!
//! Applying a diff runs all DELETEs, then UPDATEs, then INSERTs, which keeps
//! primary keys unique even when one fragment rewrites several rows.

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::catalog::{self, META_SCHEMA, ObjectKind, object_table, object_table_name};
use crate::change::{ChangeAction, ChangePayload, ChangeRecord};
use crate::engine::{ObjectEngine, SqlEngine};
use crate::error::StrataError;
use crate::schema::{TableSchema, normalize_type};
use crate::sql::{fmt_literal, join_idents, key_predicate, qualified, quote_ident, quote_literal};

/// Action discriminator column of diff storage tables.
pub const ACTION_COL: &str = "__strata_action";

/// Payload column of diff storage tables.
pub const PAYLOAD_COL: &str = "__strata_payload";

/// High-level store facade over an engine handle.
pub struct FragmentStore<'e, E: SqlEngine> {
    engine: &'e mut E,
}

impl<'e, E: SqlEngine> FragmentStore<'e, E> {
    pub fn new(engine: &'e mut E) -> Self {
        FragmentStore { engine }
    }

    /// Store the current contents of a table as a snapshot object and return
    /// its ID. The source table is left untouched.
    pub fn put_snapshot(&mut self, schema: &str, table: &str) -> Result<String, StrataError> {
        if !self.engine.table_exists(schema, table)? {
            return Err(StrataError::InvalidReference(format!(
                "no such table: {schema}.{table}"
            )));
        }
        let spec = self.engine.get_full_table_schema(schema, table)?;
        let object_id = snapshot_digest(self.engine, schema, table, &spec)?;
        if catalog::object_exists(self.engine, &object_id)? {
            debug!(%object_id, "snapshot content already stored");
            return Ok(object_id);
        }
        self.engine.copy_table(
            schema,
            table,
            META_SCHEMA,
            &object_table_name(&object_id),
            true,
        )?;
        let size = relation_size(self.engine, &object_id)?;
        catalog::register_object(self.engine, &object_id, ObjectKind::Snapshot, size, &spec)?;
        debug!(%object_id, size, "stored snapshot object");
        Ok(object_id)
    }

    /// Store a coalesced changeset as a diff object and return its ID.
    pub fn put_diff(
        &mut self,
        records: &[ChangeRecord],
        spec: &TableSchema,
    ) -> Result<String, StrataError> {
        let object_id = diff_digest(records, spec);
        if catalog::object_exists(self.engine, &object_id)? {
            debug!(%object_id, "diff content already stored");
            return Ok(object_id);
        }

        let table_name = object_table_name(&object_id);
        self.engine.execute(&diff_table_sql(spec, &table_name))?;
        if let Some(insert) = diff_rows_sql(spec, &table_name, records) {
            self.engine.execute(&insert)?;
        }
        let size = relation_size(self.engine, &object_id)?;
        catalog::register_object(self.engine, &object_id, ObjectKind::Diff, size, spec)?;
        debug!(%object_id, size, records = records.len(), "stored diff object");
        Ok(object_id)
    }

    /// Apply one diff object to a target table.
    pub fn apply_diff(
        &mut self,
        object_id: &str,
        target_schema: &str,
        target_table: &str,
    ) -> Result<(), StrataError> {
        apply_fragments(
            self.engine,
            std::slice::from_ref(&object_id.to_string()),
            target_schema,
            target_table,
        )
    }

    /// The schema spec an object was stored with.
    pub fn object_schema(&mut self, object_id: &str) -> Result<TableSchema, StrataError> {
        Ok(catalog::get_object(self.engine, object_id)?.schema_spec)
    }

    /// On-disk footprint of an object, in bytes.
    pub fn size_bytes(&mut self, object_id: &str) -> Result<i64, StrataError> {
        Ok(catalog::get_object(self.engine, object_id)?.size_bytes)
    }

    /// Drop objects' storage tables and metadata. GC-only: the caller holds
    /// the object-table lock.
    pub fn delete(&mut self, object_ids: &[String]) -> Result<(), StrataError> {
        delete_objects(self.engine, object_ids)
    }
}

// ── digests ──────────────────────────────────────────────────────────────

/// Digest of (schema spec, row stream in change-key order).
fn snapshot_digest<E: SqlEngine>(
    engine: &mut E,
    schema: &str,
    table: &str,
    spec: &TableSchema,
) -> Result<String, StrataError> {
    let mut hasher = Sha256::new();
    hasher.update(spec.canonical_json().as_bytes());
    hasher.update(b"\n");
    let sql = format!(
        "SELECT row_to_json(t)::text FROM {} t ORDER BY {}",
        qualified(schema, table),
        join_idents(None, &spec.change_key_columns())
    );
    for cell in engine.query_column(&sql)? {
        let row = cell.ok_or_else(|| StrataError::engine("NULL row in snapshot stream"))?;
        hasher.update(row.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest of (schema spec, records sorted by change key). Pure: record order
/// in the input does not matter.
pub fn diff_digest(records: &[ChangeRecord], spec: &TableSchema) -> String {
    let mut sorted: Vec<&ChangeRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.canonical_key());

    let mut hasher = Sha256::new();
    hasher.update(spec.canonical_json().as_bytes());
    hasher.update(b"\n");
    for record in sorted {
        let line = serde_json::json!([record.key, record.action.as_i16(), record.payload]);
        hasher.update(line.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

// ── diff storage DDL / DML ───────────────────────────────────────────────

/// DDL for a diff storage table: the change-key columns of the logical
/// schema plus the action and payload columns.
pub fn diff_table_sql(spec: &TableSchema, table_name: &str) -> String {
    let key = spec.change_key_columns();
    let mut cols: Vec<String> = spec
        .columns()
        .iter()
        .filter(|c| key.contains(&c.name))
        .map(|c| format!("{} {}", quote_ident(&c.name), c.col_type))
        .collect();
    cols.push(format!("{} SMALLINT NOT NULL", quote_ident(ACTION_COL)));
    cols.push(format!("{} JSONB", quote_ident(PAYLOAD_COL)));
    // Keyless tables use the whole (possibly NULL-bearing) row as change key
    // and cannot carry a primary key.
    if !spec.pk_columns().is_empty() {
        cols.push(format!("PRIMARY KEY ({})", join_idents(None, &key)));
    }
    format!(
        "CREATE TABLE {} ({})",
        qualified(META_SCHEMA, table_name),
        cols.join(", ")
    )
}

/// Multi-row insert of change records into a diff storage table.
pub fn diff_rows_sql(
    spec: &TableSchema,
    table_name: &str,
    records: &[ChangeRecord],
) -> Option<String> {
    if records.is_empty() {
        return None;
    }
    let key = spec.change_key_columns();
    let mut columns = key.clone();
    columns.push(ACTION_COL.to_string());
    columns.push(PAYLOAD_COL.to_string());

    let rows: Vec<String> = records
        .iter()
        .map(|record| {
            let mut cells: Vec<String> = record.key.iter().map(fmt_literal).collect();
            cells.push(record.action.as_i16().to_string());
            cells.push(match &record.payload {
                Some(payload) => quote_literal(
                    &serde_json::to_string(payload).expect("payload serializes"),
                ),
                None => "NULL".to_string(),
            });
            format!("({})", cells.join(", "))
        })
        .collect();

    Some(format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified(META_SCHEMA, table_name),
        join_idents(None, &columns),
        rows.join(", ")
    ))
}

/// `DELETE` statement removing every DELETE-record key from the target.
pub fn delete_phase_sql(
    target: &str,
    key_cols: &[String],
    records: &[&ChangeRecord],
) -> Option<String> {
    if records.is_empty() {
        return None;
    }
    let all_single_nonnull =
        key_cols.len() == 1 && records.iter().all(|r| !r.key[0].is_null());
    let predicate = if all_single_nonnull {
        format!(
            "{} IN ({})",
            quote_ident(&key_cols[0]),
            records
                .iter()
                .map(|r| fmt_literal(&r.key[0]))
                .collect::<Vec<_>>()
                .join(", ")
        )
    } else {
        records
            .iter()
            .map(|r| format!("({})", key_predicate(key_cols, &r.key)))
            .collect::<Vec<_>>()
            .join(" OR ")
    };
    Some(format!("DELETE FROM {target} WHERE {predicate}"))
}

/// `UPDATE` statement for one UPDATE record. `None` when the payload is
/// empty (nothing to set).
pub fn update_phase_sql(
    target: &str,
    key_cols: &[String],
    record: &ChangeRecord,
) -> Option<String> {
    let payload = record.payload.as_ref()?;
    if payload.is_empty() {
        return None;
    }
    let sets: Vec<String> = payload
        .columns
        .iter()
        .zip(&payload.values)
        .map(|(c, v)| format!("{} = {}", quote_ident(c), fmt_literal(v)))
        .collect();
    Some(format!(
        "UPDATE {target} SET {} WHERE {}",
        sets.join(", "),
        key_predicate(key_cols, &record.key)
    ))
}

/// `INSERT` statements for INSERT records, batched per payload column set.
pub fn insert_phase_sql(
    target: &str,
    key_cols: &[String],
    records: &[&ChangeRecord],
) -> Vec<String> {
    let mut batches: Vec<(Vec<String>, Vec<String>)> = Vec::new();
    for record in records {
        let payload_cols = record
            .payload
            .as_ref()
            .map(|p| p.columns.clone())
            .unwrap_or_default();
        let mut columns = key_cols.to_vec();
        columns.extend(payload_cols);

        let mut cells: Vec<String> = record.key.iter().map(fmt_literal).collect();
        if let Some(payload) = &record.payload {
            cells.extend(payload.values.iter().map(fmt_literal));
        }
        let row = format!("({})", cells.join(", "));

        match batches.iter_mut().find(|(cols, _)| *cols == columns) {
            Some((_, rows)) => rows.push(row),
            None => batches.push((columns, vec![row])),
        }
    }
    batches
        .into_iter()
        .map(|(columns, rows)| {
            format!(
                "INSERT INTO {target} ({}) VALUES {}",
                join_idents(None, &columns),
                rows.join(", ")
            )
        })
        .collect()
}

// ── object-engine operations ─────────────────────────────────────────────

/// Apply diff fragments to a target table, in chain order.
pub fn apply_fragments<E: SqlEngine>(
    engine: &mut E,
    object_ids: &[String],
    target_schema: &str,
    target_table: &str,
) -> Result<(), StrataError> {
    if object_ids.is_empty() {
        return Ok(());
    }
    let target_types = engine.get_column_names_types(target_schema, target_table)?;
    let target = qualified(target_schema, target_table);

    for object_id in object_ids {
        let meta = catalog::get_object(engine, object_id)?;
        if meta.kind != ObjectKind::Diff {
            return Err(StrataError::InvalidReference(format!(
                "object {object_id} is a snapshot, not a diff"
            )));
        }
        check_schema_compat(&meta.schema_spec, &target_types, &target)?;

        let key_cols = meta.schema_spec.change_key_columns();
        let records = read_diff_records(engine, object_id, &meta.schema_spec)?;
        debug!(%object_id, records = records.len(), target = %target, "applying diff");

        let deletes: Vec<&ChangeRecord> = records
            .iter()
            .filter(|r| r.action == ChangeAction::Delete)
            .collect();
        let updates: Vec<&ChangeRecord> = records
            .iter()
            .filter(|r| r.action == ChangeAction::Update)
            .collect();
        let inserts: Vec<&ChangeRecord> = records
            .iter()
            .filter(|r| r.action == ChangeAction::Insert)
            .collect();

        if let Some(sql) = delete_phase_sql(&target, &key_cols, &deletes) {
            engine.execute(&sql)?;
        }
        for record in updates {
            if let Some(sql) = update_phase_sql(&target, &key_cols, record) {
                engine.execute(&sql)?;
            }
        }
        for sql in insert_phase_sql(&target, &key_cols, &inserts) {
            engine.execute(&sql)?;
        }
    }
    Ok(())
}

fn check_schema_compat(
    spec: &TableSchema,
    target_types: &[(String, String)],
    target: &str,
) -> Result<(), StrataError> {
    for column in spec.columns() {
        let found = target_types
            .iter()
            .find(|(name, _)| *name == column.name);
        match found {
            Some((_, col_type)) if normalize_type(col_type) == column.col_type => {}
            Some((_, col_type)) => {
                return Err(StrataError::SchemaMismatch(format!(
                    "column '{}' is {} in {target} but {} in the object",
                    column.name, col_type, column.col_type
                )));
            }
            None => {
                return Err(StrataError::SchemaMismatch(format!(
                    "column '{}' is missing from {target}",
                    column.name
                )));
            }
        }
    }
    Ok(())
}

/// Read a diff object's records back out of its storage table.
pub fn read_diff_records<E: SqlEngine>(
    engine: &mut E,
    object_id: &str,
    spec: &TableSchema,
) -> Result<Vec<ChangeRecord>, StrataError> {
    let key_cols = spec.change_key_columns();
    let sql = format!(
        "SELECT row_to_json(t)::text FROM {} t",
        object_table(object_id)
    );
    let mut records = Vec::new();
    for cell in engine.query_column(&sql)? {
        let raw = cell.ok_or_else(|| StrataError::engine("NULL row in diff object"))?;
        let row = match catalog::parse_json_text(&raw)? {
            Value::Object(map) => map,
            _ => return Err(StrataError::engine("diff row is not a JSON object")),
        };
        let key = key_cols
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        let action = ChangeAction::from_i16(
            row.get(ACTION_COL)
                .and_then(Value::as_i64)
                .ok_or_else(|| StrataError::engine("diff row without action"))? as i16,
        )?;
        let payload = match row.get(PAYLOAD_COL) {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<ChangePayload>(value.clone())
                    .map_err(|e| StrataError::engine(format!("bad diff payload: {e}")))?,
            ),
        };
        records.push(ChangeRecord {
            key,
            action,
            payload,
        });
    }
    Ok(records)
}

/// Move a staging table into the object store under `object_id`, consuming
/// the staging table.
pub fn store_object<E: SqlEngine>(
    engine: &mut E,
    object_id: &str,
    source_schema: &str,
    source_table: &str,
) -> Result<(), StrataError> {
    let table_name = object_table_name(object_id);
    if engine.table_exists(META_SCHEMA, &table_name)? {
        // Content already stored under this address.
        return engine.delete_table(source_schema, source_table);
    }
    if source_schema != META_SCHEMA {
        engine.execute(&format!(
            "ALTER TABLE {} SET SCHEMA {}",
            qualified(source_schema, source_table),
            quote_ident(META_SCHEMA)
        ))?;
    }
    engine.execute(&format!(
        "ALTER TABLE {} RENAME TO {}",
        qualified(META_SCHEMA, source_table),
        quote_ident(&table_name)
    ))
}

/// Render an object as replayable SQL: storage DDL plus one insert per row.
pub fn dump_object<E: SqlEngine>(engine: &mut E, object_id: &str) -> Result<String, StrataError> {
    let meta = catalog::get_object(engine, object_id)?;
    let table_name = object_table_name(object_id);
    let table = object_table(object_id);

    let mut statements = vec![match meta.kind {
        ObjectKind::Snapshot => {
            meta.schema_spec
                .create_table_sql(META_SCHEMA, &table_name, false, false)
        }
        ObjectKind::Diff => diff_table_sql(&meta.schema_spec, &table_name),
    }];

    let sql = format!("SELECT row_to_json(t)::text FROM {table} t");
    for cell in engine.query_column(&sql)? {
        let row = cell.ok_or_else(|| StrataError::engine("NULL row in object dump"))?;
        statements.push(format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, {})",
            quote_literal(&row)
        ));
    }
    Ok(statements.join(";\n"))
}

/// Drop objects' storage tables and catalog rows.
pub fn delete_objects<E: SqlEngine>(
    engine: &mut E,
    object_ids: &[String],
) -> Result<(), StrataError> {
    for object_id in object_ids {
        engine.delete_table(META_SCHEMA, &object_table_name(object_id))?;
    }
    catalog::delete_object_rows(engine, object_ids)
}

/// Replay objects from `source` into `target`, skipping ones the target
/// already holds.
pub fn transfer_objects<S: ObjectEngine, T: SqlEngine>(
    source: &mut S,
    target: &mut T,
    object_ids: &[String],
) -> Result<(), StrataError> {
    catalog::ensure_metadata_schema(target)?;
    for object_id in object_ids {
        if catalog::object_exists(target, object_id)? {
            continue;
        }
        let meta = catalog::get_object(source, object_id)?;
        let dump = dump_object(source, object_id)?;
        target.run_sql(&dump)?;
        catalog::register_object(target, object_id, meta.kind, meta.size_bytes, &meta.schema_spec)?;
    }
    Ok(())
}

fn relation_size<E: SqlEngine>(engine: &mut E, object_id: &str) -> Result<i64, StrataError> {
    let sql = format!(
        "SELECT pg_total_relation_size({})::bigint",
        quote_literal(&object_table(object_id))
    );
    engine
        .query_scalar(&sql)?
        .unwrap_or_else(|| "0".to_string())
        .parse::<i64>()
        .map_err(|e| StrataError::engine(format!("bad relation size: {e}")))
}
