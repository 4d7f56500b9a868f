//! Layered query engine.
//!
//! Answers `SELECT cols FROM image.table WHERE quals` against any image
//! without materializing the full table. With a bare snapshot the query goes
//! straight to the snapshot's storage table. With a diff chain, rows
//! accumulate in a private staging table:
//!
//! 1. (skipped when every qual touches only change-key columns) every
//!    snapshot row whose key some diff UPDATEs is copied in and marked
//!    `keep_pk` — it may fail the quals now and be rescued by that update,
//!    so it must not be filtered until the chain has been applied;
//! 2. every snapshot row satisfying the quals is copied in unmarked;
//! 3. each diff but the last is applied, deleting unmarked rows that no
//!    longer satisfy the quals;
//! 4. the final diff is applied with no trailing filter — the upstream
//!    executor re-applies the quals to whatever we return, so a last pass
//!    would be redundant work.
//!
//! Results stream through a server-side cursor owned by [`LayeredCursor`];
//! dropping the cursor (exhausted or cancelled) drops the staging table and
//! rolls back its transaction.

use std::borrow::BorrowMut;
use std::collections::VecDeque;
use std::marker::PhantomData;

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::catalog::{self, META_SCHEMA, object_table};
use crate::engine::SqlEngine;
use crate::error::StrataError;
use crate::fragments::{ACTION_COL, apply_fragments};
use crate::object_manager::get_random_object_id;
use crate::qual::{self, Qual};
use crate::repository::Repository;
use crate::schema::TableSchema;
use crate::sql::{expand_placeholders, join_idents, qualified, quote_ident};

/// Marker column on staging tables: TRUE for rows held back from mid-chain
/// qual filtering because an UPDATE may still rescue them.
pub const KEEP_PK_COL: &str = "__strata_keep_pk";

const DEFAULT_BATCH_SIZE: u32 = 1000;

/// One layered read against one table at one image.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub repository: Repository,
    pub image_hash: String,
    pub table: String,
    /// Projected columns; empty means all.
    pub columns: Vec<String>,
    pub quals: Vec<Qual>,
    pub batch_size: u32,
}

impl QueryRequest {
    pub fn new(
        repository: Repository,
        image_hash: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        QueryRequest {
            repository,
            image_hash: image_hash.into(),
            table: table.into(),
            columns: Vec::new(),
            quals: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_quals(mut self, quals: Vec<Qual>) -> Self {
        self.quals = quals;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Run a layered query on a borrowed engine handle.
pub fn query<'e, E: SqlEngine>(
    engine: &'e mut E,
    request: &QueryRequest,
) -> Result<LayeredCursor<E, &'e mut E>, StrataError> {
    open(engine, request)
}

/// Run a layered query on an owned engine handle (the FDW path: the cursor
/// carries its connection for as long as rows flow).
pub fn query_owned<E: SqlEngine>(
    engine: E,
    request: &QueryRequest,
) -> Result<LayeredCursor<E, E>, StrataError> {
    open(engine, request)
}

fn open<E: SqlEngine, H: BorrowMut<E>>(
    mut holder: H,
    request: &QueryRequest,
) -> Result<LayeredCursor<E, H>, StrataError> {
    match setup_cursor(holder.borrow_mut(), request) {
        Ok((cursor, staging)) => Ok(LayeredCursor {
            engine: holder,
            cursor,
            staging,
            buffer: VecDeque::new(),
            batch_size: request.batch_size,
            open: true,
            _engine: PhantomData,
        }),
        Err(err) => {
            let engine: &mut E = holder.borrow_mut();
            let _ = engine.rollback();
            Err(err)
        }
    }
}

/// Build the staging state and declare the result cursor. Returns the
/// cursor name and the staging table to drop, if one was needed.
fn setup_cursor<E: SqlEngine>(
    engine: &mut E,
    request: &QueryRequest,
) -> Result<(String, Option<String>), StrataError> {
    let repo = &request.repository;
    engine.begin()?;

    if !catalog::image_exists(engine, repo, &request.image_hash)? {
        return Err(StrataError::MissingImage(format!(
            "{repo}:{}",
            request.image_hash
        )));
    }
    let (spec, chain) =
        catalog::get_table_pointer(engine, repo, &request.image_hash, &request.table)?;
    if chain.is_empty() {
        return Err(StrataError::InvalidReference(format!(
            "empty object chain for '{}' at {repo}:{}",
            request.table, request.image_hash
        )));
    }
    for object_id in &chain {
        catalog::get_object(engine, object_id)?;
    }
    let snapshot = chain[0].clone();
    let diffs = &chain[1..];

    let columns = if request.columns.is_empty() {
        spec.column_names()
    } else {
        for column in &request.columns {
            if !spec.has_column(column) {
                return Err(StrataError::InvalidReference(format!(
                    "no column '{column}' in '{}'",
                    request.table
                )));
            }
        }
        request.columns.clone()
    };

    // Quals we cannot (or dare not) push stay behind; the executor
    // re-filters everything we return, so dropping them is always sound.
    let (pushable, passed_through) = qual::partition_supported(&request.quals);
    let pushable: Vec<Qual> = pushable
        .into_iter()
        .filter(|q| spec.has_column(q.field()))
        .collect();
    if !passed_through.is_empty() {
        debug!(
            skipped = passed_through.len(),
            "unsupported quals left for the executor"
        );
    }
    let qual_where =
        qual::quals_to_sql(&pushable).map(|(sql, values)| expand_placeholders(&sql, &values));

    let cursor = format!("strata_cur_{}", Uuid::new_v4().simple());

    if diffs.is_empty() {
        // Fast path: a bare snapshot answers the query directly.
        let mut select = format!(
            "SELECT {} FROM {}",
            join_idents(None, &columns),
            object_table(&snapshot)
        );
        if let Some(where_clause) = &qual_where {
            select.push_str(&format!(" WHERE {where_clause}"));
        }
        declare_cursor(engine, &cursor, &select)?;
        debug!(%cursor, %snapshot, "layered query on snapshot fast path");
        return Ok((cursor, None));
    }

    let key_cols = spec.change_key_columns();
    let pk_only = qual::pk_only(&pushable, &key_cols);
    let staging = get_random_object_id();
    for sql in staging_ddl(&snapshot, &staging, &spec) {
        engine.execute(&sql)?;
    }
    debug!(%cursor, %staging, pk_only, diffs = diffs.len(), "layered query staging");

    // Step A: hold on to any snapshot row a chain UPDATE touches. Since
    // updates never move change keys, a key-only predicate makes this pass
    // unnecessary.
    if !pk_only {
        for diff in diffs {
            engine.execute(&step_a_sql(&snapshot, diff, &staging, &spec))?;
        }
    }

    // Step B: the rows that currently satisfy the quals.
    engine.execute(&step_b_sql(&snapshot, &staging, &spec, qual_where.as_deref()))?;

    // Step C: apply all but the final diff, filtering unmarked rows that
    // fell out of the predicate.
    for diff in &diffs[..diffs.len() - 1] {
        apply_fragments(engine, std::slice::from_ref(diff), META_SCHEMA, &staging)?;
        if let Some(where_clause) = &qual_where {
            engine.execute(&step_c_delete_sql(&staging, where_clause))?;
        }
    }

    // Step D: final diff, no trailing filter.
    apply_fragments(
        engine,
        std::slice::from_ref(&diffs[diffs.len() - 1]),
        META_SCHEMA,
        &staging,
    )?;

    let select = format!(
        "SELECT {} FROM {}",
        join_idents(None, &columns),
        qualified(META_SCHEMA, &staging)
    );
    declare_cursor(engine, &cursor, &select)?;
    Ok((cursor, Some(staging)))
}

fn declare_cursor<E: SqlEngine>(
    engine: &mut E,
    cursor: &str,
    select: &str,
) -> Result<(), StrataError> {
    engine.execute(&format!(
        "DECLARE {} NO SCROLL CURSOR FOR SELECT row_to_json(q)::text FROM ({select}) q",
        quote_ident(cursor)
    ))
}

// ── staging SQL builders ─────────────────────────────────────────────────

/// DDL bootstrapping the staging table: snapshot-shaped, plus the keep
/// marker, plus the snapshot's primary key.
pub fn staging_ddl(snapshot_id: &str, staging: &str, spec: &TableSchema) -> Vec<String> {
    let staging_table = qualified(META_SCHEMA, staging);
    let mut statements = vec![
        format!(
            "CREATE TABLE {staging_table} AS SELECT * FROM {} WITH NO DATA",
            object_table(snapshot_id)
        ),
        format!(
            "ALTER TABLE {staging_table} ADD COLUMN {} BOOLEAN DEFAULT TRUE",
            quote_ident(KEEP_PK_COL)
        ),
    ];
    let pks = spec.pk_columns();
    if !pks.is_empty() {
        statements.push(format!(
            "ALTER TABLE {staging_table} ADD PRIMARY KEY ({})",
            join_idents(None, &pks)
        ));
    }
    statements
}

/// Copy rows the given diff UPDATEs into staging, marked `keep_pk = TRUE`.
/// Earlier copies win (`ON CONFLICT DO NOTHING` keeps the first).
pub fn step_a_sql(snapshot_id: &str, diff_id: &str, staging: &str, spec: &TableSchema) -> String {
    let snap = object_table(snapshot_id);
    let diff = object_table(diff_id);
    let all_cols = spec.column_names();
    let join_condition = spec
        .change_key_columns()
        .iter()
        .map(|c| format!("{snap}.{col} = {diff}.{col}", col = quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let snap_cols = join_idents(Some(&snap), &all_cols);

    format!(
        "INSERT INTO {} ({}, {}) \
         (SELECT {snap_cols}, TRUE FROM {snap} JOIN {diff} ON {join_condition} \
          WHERE {diff}.{} = 2) \
         ON CONFLICT DO NOTHING",
        qualified(META_SCHEMA, staging),
        join_idents(None, &all_cols),
        quote_ident(KEEP_PK_COL),
        quote_ident(ACTION_COL),
    )
}

/// Copy the snapshot rows satisfying the quals into staging, unmarked. Rows
/// already present from step A keep their marker.
pub fn step_b_sql(
    snapshot_id: &str,
    staging: &str,
    spec: &TableSchema,
    qual_where: Option<&str>,
) -> String {
    let all_cols = spec.column_names();
    let filter = match qual_where {
        Some(where_clause) => format!(" WHERE {where_clause}"),
        None => String::new(),
    };
    format!(
        "INSERT INTO {} ({}, {}) \
         (SELECT {}, FALSE FROM {}{filter}) \
         ON CONFLICT DO NOTHING",
        qualified(META_SCHEMA, staging),
        join_idents(None, &all_cols),
        quote_ident(KEEP_PK_COL),
        join_idents(None, &all_cols),
        object_table(snapshot_id),
    )
}

/// Remove unmarked staging rows that stopped satisfying the quals. Marked
/// rows are never filtered mid-chain: a later UPDATE may restore them.
pub fn step_c_delete_sql(staging: &str, qual_where: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {} = FALSE AND NOT ({qual_where})",
        qualified(META_SCHEMA, staging),
        quote_ident(KEEP_PK_COL)
    )
}

// ── the cursor ───────────────────────────────────────────────────────────

/// A lazy, finite, non-restartable row stream.
///
/// Owns the staging table and the transaction it lives in; both are released
/// when the stream is exhausted and, via `Drop`, when the caller cancels
/// early. Rows are `{column_name: value}` maps with unspecified ordering
/// between rows.
pub struct LayeredCursor<E: SqlEngine, H: BorrowMut<E>> {
    engine: H,
    cursor: String,
    staging: Option<String>,
    buffer: VecDeque<Map<String, Value>>,
    batch_size: u32,
    open: bool,
    _engine: PhantomData<fn() -> E>,
}

impl<E: SqlEngine, H: BorrowMut<E>> std::fmt::Debug for LayeredCursor<E, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredCursor")
            .field("cursor", &self.cursor)
            .field("staging", &self.staging)
            .field("batch_size", &self.batch_size)
            .field("open", &self.open)
            .finish()
    }
}

impl<E: SqlEngine, H: BorrowMut<E>> LayeredCursor<E, H> {
    /// Fetch the next batch into the buffer; returns how many rows arrived.
    fn fetch_batch(&mut self) -> Result<usize, StrataError> {
        let sql = format!(
            "FETCH FORWARD {} FROM {}",
            self.batch_size,
            quote_ident(&self.cursor)
        );
        let engine: &mut E = self.engine.borrow_mut();
        let rows = engine.run_sql(&sql)?;
        let fetched = rows.len();
        for row in rows {
            let text = row
                .into_iter()
                .next()
                .flatten()
                .ok_or_else(|| StrataError::engine("cursor returned an empty row"))?;
            match catalog::parse_json_text(&text)? {
                Value::Object(map) => self.buffer.push_back(map),
                _ => return Err(StrataError::engine("cursor row is not a JSON object")),
            }
        }
        Ok(fetched)
    }

    /// Close the cursor, drop the staging table and roll the staging
    /// transaction back. Idempotent; never fails.
    fn finish(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let staging = self.staging.take();
        let engine: &mut E = self.engine.borrow_mut();
        let _ = engine.execute(&format!("CLOSE {}", quote_ident(&self.cursor)));
        if let Some(staging) = staging {
            let _ = engine.execute(&format!(
                "DROP TABLE IF EXISTS {}",
                qualified(META_SCHEMA, &staging)
            ));
        }
        let _ = engine.rollback();
    }
}

impl<E: SqlEngine, H: BorrowMut<E>> Iterator for LayeredCursor<E, H> {
    type Item = Result<Map<String, Value>, StrataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.buffer.pop_front() {
            return Some(Ok(row));
        }
        if !self.open {
            return None;
        }
        match self.fetch_batch() {
            Ok(0) => {
                self.finish();
                None
            }
            Ok(_) => self.buffer.pop_front().map(Ok),
            Err(err) => {
                self.finish();
                Some(Err(err))
            }
        }
    }
}

impl<E: SqlEngine, H: BorrowMut<E>> Drop for LayeredCursor<E, H> {
    fn drop(&mut self) {
        self.finish();
    }
}
