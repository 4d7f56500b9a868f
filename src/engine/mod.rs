//! Engine contracts.
//!
//! The relational engine is an external collaborator; this module defines the
//! contracts the core consumes and implements everything that can be derived
//! from plain SQL over `information_schema` as provided methods, so a backend
//! only supplies `run_sql` plus its engine-specific extensions.
//!
//! There is no ambient "current engine": an engine handle is constructed
//! explicitly (see [`postgres::PgEngine`]) and passed down every call path.
//!
//! Result shapes: `run_sql` returns the full row/column grid (MANY_MANY);
//! [`SqlEngine::execute`], [`SqlEngine::query_scalar`],
//! [`SqlEngine::query_row`] and [`SqlEngine::query_column`] are the NONE,
//! ONE_ONE, ONE_MANY and MANY_ONE projections of it.

pub mod postgres;

use crate::change::Changeset;
use crate::error::StrataError;
use crate::schema::{ColumnSpec, TableSchema, normalize_type};
use crate::sql::{join_idents, qualified, quote_ident, quote_literal};
use crate::{catalog, fragments};

/// Query results as text cells: one `Vec` per row, `None` for NULL.
pub type Rows = Vec<Vec<Option<String>>>;

/// Blocking SQL execution plus schema/table management.
pub trait SqlEngine {
    /// Run one SQL statement and return all result rows as text cells.
    /// Statements without a result set return an empty grid.
    fn run_sql(&mut self, sql: &str) -> Result<Rows, StrataError>;

    // ── transaction control ──────────────────────────────────────────────

    /// Open a transaction if one is not already open.
    fn begin(&mut self) -> Result<(), StrataError> {
        self.run_sql("BEGIN").map(|_| ())
    }

    /// Commit the current transaction.
    fn commit_tx(&mut self) -> Result<(), StrataError> {
        self.run_sql("COMMIT").map(|_| ())
    }

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<(), StrataError> {
        self.run_sql("ROLLBACK").map(|_| ())
    }

    /// Run `body` under a named savepoint: released on success, rolled back
    /// to (and then released) on error, leaving the enclosing transaction
    /// intact either way.
    fn with_savepoint<T>(
        &mut self,
        name: &str,
        body: impl FnOnce(&mut Self) -> Result<T, StrataError>,
    ) -> Result<T, StrataError>
    where
        Self: Sized,
    {
        self.execute(&format!("SAVEPOINT {}", quote_ident(name)))?;
        match body(self) {
            Ok(value) => {
                self.execute(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.execute(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)));
                let _ = self.execute(&format!("RELEASE SAVEPOINT {}", quote_ident(name)));
                Err(err)
            }
        }
    }

    // ── result-shape helpers ─────────────────────────────────────────────

    /// Run a statement, discarding any result (the NONE shape).
    fn execute(&mut self, sql: &str) -> Result<(), StrataError> {
        self.run_sql(sql).map(|_| ())
    }

    /// First cell of the first row, if any (the ONE_ONE shape).
    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, StrataError> {
        Ok(self
            .run_sql(sql)?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .flatten())
    }

    /// First row, if any (the ONE_MANY shape).
    fn query_row(&mut self, sql: &str) -> Result<Option<Vec<Option<String>>>, StrataError> {
        Ok(self.run_sql(sql)?.into_iter().next())
    }

    /// First cell of every row (the MANY_ONE shape).
    fn query_column(&mut self, sql: &str) -> Result<Vec<Option<String>>, StrataError> {
        Ok(self
            .run_sql(sql)?
            .into_iter()
            .map(|row| row.into_iter().next().flatten())
            .collect())
    }

    // ── schema and table management ──────────────────────────────────────

    fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool, StrataError> {
        // The server truncates identifiers to 63 bytes on creation.
        let table = &table[..table.len().min(63)];
        let sql = format!(
            "SELECT 1 FROM information_schema.tables \
             WHERE table_schema = {} AND table_name = {}",
            quote_literal(schema),
            quote_literal(table)
        );
        Ok(self.query_scalar(&sql)?.is_some())
    }

    fn schema_exists(&mut self, schema: &str) -> Result<bool, StrataError> {
        let sql = format!(
            "SELECT 1 FROM information_schema.schemata WHERE schema_name = {}",
            quote_literal(schema)
        );
        Ok(self.query_scalar(&sql)?.is_some())
    }

    fn create_schema(&mut self, schema: &str) -> Result<(), StrataError> {
        self.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
    }

    fn delete_schema(&mut self, schema: &str) -> Result<(), StrataError> {
        self.execute(&format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            quote_ident(schema)
        ))
    }

    /// Create a table from a schema spec.
    fn create_table(
        &mut self,
        schema: &str,
        table: &str,
        spec: &TableSchema,
        unlogged: bool,
        temporary: bool,
    ) -> Result<(), StrataError> {
        self.execute(&spec.create_table_sql(schema, table, unlogged, temporary))
    }

    fn delete_table(&mut self, schema: &str, table: &str) -> Result<(), StrataError> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", qualified(schema, table)))
    }

    fn get_all_tables(&mut self, schema: &str) -> Result<Vec<String>, StrataError> {
        let sql = format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = {} AND table_type = 'BASE TABLE' ORDER BY table_name",
            quote_literal(schema)
        );
        Ok(self.query_column(&sql)?.into_iter().flatten().collect())
    }

    /// Copy a table within this engine, optionally reapplying the source's
    /// primary key on the target.
    fn copy_table(
        &mut self,
        source_schema: &str,
        source_table: &str,
        target_schema: &str,
        target_table: &str,
        with_pk: bool,
    ) -> Result<(), StrataError> {
        let source = qualified(source_schema, source_table);
        let target = qualified(target_schema, target_table);
        if self.table_exists(target_schema, target_table)? {
            self.execute(&format!("INSERT INTO {target} SELECT * FROM {source}"))?;
        } else {
            self.execute(&format!("CREATE TABLE {target} AS SELECT * FROM {source}"))?;
        }
        if with_pk {
            let pks: Vec<String> = self
                .get_primary_keys(source_schema, source_table)?
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            if !pks.is_empty() {
                self.execute(&format!(
                    "ALTER TABLE {target} ADD PRIMARY KEY ({})",
                    join_idents(None, &pks)
                ))?;
            }
        }
        Ok(())
    }

    /// `(column_name, column_type)` for the table's primary key, in key order.
    fn get_primary_keys(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<(String, String)>, StrataError> {
        let sql = format!(
            "SELECT kcu.column_name, col.data_type \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             JOIN information_schema.columns col \
               ON col.table_schema = kcu.table_schema \
              AND col.table_name = kcu.table_name \
              AND col.column_name = kcu.column_name \
             WHERE tc.constraint_type = 'PRIMARY KEY' \
               AND tc.table_schema = {} AND tc.table_name = {} \
             ORDER BY kcu.ordinal_position",
            quote_literal(schema),
            quote_literal(table)
        );
        self.run_sql(&sql)?.into_iter().map(two_text_cells).collect()
    }

    /// `(column_name, column_type)` for every column, in ordinal order.
    fn get_column_names_types(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<(String, String)>, StrataError> {
        let sql = format!(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position",
            quote_literal(schema),
            quote_literal(table)
        );
        self.run_sql(&sql)?.into_iter().map(two_text_cells).collect()
    }

    /// The full schema spec of a table: `(ordinal, name, type, is_pk)`.
    fn get_full_table_schema(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<TableSchema, StrataError> {
        let pks: Vec<String> = self
            .get_primary_keys(schema, table)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let sql = format!(
            "SELECT ordinal_position, column_name, data_type \
             FROM information_schema.columns \
             WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position",
            quote_literal(schema),
            quote_literal(table)
        );
        let mut columns = Vec::new();
        for row in self.run_sql(&sql)? {
            let mut cells = row.into_iter();
            let ordinal = required(cells.next())?
                .parse::<i32>()
                .map_err(|e| StrataError::engine(format!("bad ordinal: {e}")))?;
            let name = required(cells.next())?;
            let col_type = normalize_type(&required(cells.next())?);
            let is_pk = pks.contains(&name);
            columns.push(ColumnSpec {
                ordinal,
                name,
                col_type,
                is_pk,
            });
        }
        Ok(TableSchema::new(columns))
    }

    /// Take an exclusive lock on a table, released at transaction end.
    fn lock_table(&mut self, schema: &str, table: &str) -> Result<(), StrataError> {
        self.execute(&format!(
            "LOCK TABLE {} IN ACCESS EXCLUSIVE MODE",
            qualified(schema, table)
        ))
    }

    /// Try to take a transaction-scoped advisory lock on `(class, key)`.
    /// Returns `false` without blocking when another session holds it.
    fn try_advisory_xact_lock(&mut self, class: i32, key: &str) -> Result<bool, StrataError> {
        let sql = format!(
            "SELECT pg_try_advisory_xact_lock({class}, hashtext({}))",
            quote_literal(key)
        );
        Ok(self.query_scalar(&sql)?.as_deref() == Some("t"))
    }
}

fn required(cell: Option<Option<String>>) -> Result<String, StrataError> {
    cell.flatten()
        .ok_or_else(|| StrataError::engine("unexpected NULL in catalog query result"))
}

fn two_text_cells(row: Vec<Option<String>>) -> Result<(String, String), StrataError> {
    let mut cells = row.into_iter();
    Ok((required(cells.next())?, required(cells.next())?))
}

/// Row-level change tracking on a working schema.
pub trait ChangeEngine: SqlEngine {
    /// Install mutation capture on the given `(schema, table)` pairs.
    fn track_tables(&mut self, tables: &[(String, String)]) -> Result<(), StrataError>;

    /// Remove mutation capture and drop any pending records for the tables.
    fn untrack_tables(&mut self, tables: &[(String, String)]) -> Result<(), StrataError>;

    /// All `(schema, table)` pairs currently tracked.
    fn get_tracked_tables(&mut self) -> Result<Vec<(String, String)>, StrataError>;

    /// Whether any tracked table in the schema has pending changes.
    fn has_pending_changes(&mut self, schema: &str) -> Result<bool, StrataError>;

    /// Drop pending records for one table, or the whole schema.
    fn discard_pending_changes(
        &mut self,
        schema: &str,
        table: Option<&str>,
    ) -> Result<(), StrataError>;

    /// The coalesced pending changeset for one tracked table.
    fn get_pending_changes(&mut self, schema: &str, table: &str)
    -> Result<Changeset, StrataError>;

    /// Aggregate form: `(inserted, deleted, updated)` record counts.
    fn get_pending_change_counts(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<(usize, usize, usize), StrataError>
    where
        Self: Sized,
    {
        Ok(self.get_pending_changes(schema, table)?.counts())
    }

    /// Tracked tables in the schema with pending changes.
    fn get_changed_tables(&mut self, schema: &str) -> Result<Vec<String>, StrataError>;

    /// The change key of a table: primary keys, or every column when the
    /// table has none.
    fn get_change_key(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<(String, String)>, StrataError>
    where
        Self: Sized,
    {
        let pks = self.get_primary_keys(schema, table)?;
        if pks.is_empty() {
            self.get_column_names_types(schema, table)
        } else {
            Ok(pks)
        }
    }
}

/// Storing, applying and transferring content-addressed objects.
///
/// Every operation is derived from SQL, so the trait ships with default
/// implementations; a backend with a native object format can override them.
pub trait ObjectEngine: SqlEngine {
    /// Move a staging table into the object store under `object_id`. The
    /// staging table is consumed.
    fn store_object(
        &mut self,
        object_id: &str,
        source_schema: &str,
        source_table: &str,
    ) -> Result<(), StrataError>
    where
        Self: Sized,
    {
        fragments::store_object(self, object_id, source_schema, source_table)
    }

    /// Render an object as replayable SQL (DDL plus inserts).
    fn dump_object(&mut self, object_id: &str) -> Result<String, StrataError>
    where
        Self: Sized,
    {
        fragments::dump_object(self, object_id)
    }

    /// Drop objects' storage and metadata. Only the GC path may call this,
    /// with the object-table lock held.
    fn delete_objects(&mut self, object_ids: &[String]) -> Result<(), StrataError>
    where
        Self: Sized,
    {
        fragments::delete_objects(self, object_ids)
    }

    /// Apply diff fragments to a target table, in chain order.
    fn apply_fragments(
        &mut self,
        object_ids: &[String],
        target_schema: &str,
        target_table: &str,
    ) -> Result<(), StrataError>
    where
        Self: Sized,
    {
        fragments::apply_fragments(self, object_ids, target_schema, target_table)
    }

    fn get_object_schema(&mut self, object_id: &str) -> Result<TableSchema, StrataError>
    where
        Self: Sized,
    {
        Ok(catalog::get_object(self, object_id)?.schema_spec)
    }

    /// On-disk footprint of the object, in bytes.
    fn get_object_size(&mut self, object_id: &str) -> Result<i64, StrataError>
    where
        Self: Sized,
    {
        Ok(catalog::get_object(self, object_id)?.size_bytes)
    }

    /// Replay objects from this engine onto `remote`.
    fn upload_objects<R: ObjectEngine>(
        &mut self,
        object_ids: &[String],
        remote: &mut R,
    ) -> Result<(), StrataError>
    where
        Self: Sized,
    {
        fragments::transfer_objects(self, remote, object_ids)
    }

    /// Replay objects from `remote` into this engine. Returns the IDs that
    /// were actually transferred (already-present objects are skipped).
    fn download_objects<R: ObjectEngine>(
        &mut self,
        object_ids: &[String],
        remote: &mut R,
    ) -> Result<Vec<String>, StrataError>
    where
        Self: Sized,
    {
        let missing: Vec<String> = object_ids
            .iter()
            .filter(|id| !catalog::object_exists(self, id).unwrap_or(false))
            .cloned()
            .collect();
        fragments::transfer_objects(remote, self, &missing)?;
        Ok(missing)
    }
}

/// The full engine surface the core operates against.
pub trait Engine: SqlEngine + ChangeEngine + ObjectEngine {}

impl<T: SqlEngine + ChangeEngine + ObjectEngine> Engine for T {}

#[cfg(test)]
pub(crate) mod test_support {
    //! A scripted fake engine: records every statement it is handed and
    //! replies from a queue of canned results. Lets the SQL-assembling layers
    //! be exercised without a server.

    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct FakeEngine {
        pub statements: Vec<String>,
        pub replies: VecDeque<Rows>,
        pub fail_on: Option<String>,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a canned result for the next statement that produces rows.
        pub fn push_reply(&mut self, rows: Rows) {
            self.replies.push_back(rows);
        }

        pub fn saw(&self, needle: &str) -> bool {
            self.statements.iter().any(|s| s.contains(needle))
        }
    }

    impl SqlEngine for FakeEngine {
        fn run_sql(&mut self, sql: &str) -> Result<Rows, StrataError> {
            self.statements.push(sql.to_string());
            if let Some(marker) = &self.fail_on {
                if sql.contains(marker.as_str()) {
                    return Err(StrataError::engine(format!("scripted failure at: {sql}")));
                }
            }
            Ok(self.replies.pop_front().unwrap_or_default())
        }
    }

    impl ObjectEngine for FakeEngine {}

    pub fn text_row(cells: &[&str]) -> Vec<Option<String>> {
        cells.iter().map(|c| Some(c.to_string())).collect()
    }
}
