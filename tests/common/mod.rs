//! Shared helpers for end-to-end tests against a live PostgreSQL engine.
//!
//! Connection parameters come from the `ENGINE_*` environment variables
//! (`EngineConfig::from_env`); every test gets a uniquely named repository
//! and cleans it up on drop. The suites are `#[ignore]`d so plain
//! `cargo test` passes without a server; run them with `cargo test --
//! --ignored`.

// Not every suite uses every helper.
#![allow(dead_code)]

use serde_json::{Map, Value};

use pg_strata::checkout;
use pg_strata::commit::{self, CommitOptions};
use pg_strata::engine::SqlEngine;
use pg_strata::image::Image;
use pg_strata::layered::{self, QueryRequest};
use pg_strata::object_manager::get_random_object_id;
use pg_strata::qual::{AnyOrAll, Qual};
use pg_strata::{EngineConfig, PgEngine, Repository};

pub struct E2eDb {
    pub engine: PgEngine,
    pub repo: Repository,
}

impl E2eDb {
    /// Connect and initialize a fresh uniquely-named repository.
    pub fn new(prefix: &str) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let config = EngineConfig::from_env().expect("engine configuration");
        let engine =
            PgEngine::connect(&config).expect("connect to PostgreSQL (set ENGINE_* env vars)");
        let token = get_random_object_id();
        let repo = Repository::new("e2e", format!("{prefix}_{}", &token[4..16]))
            .expect("repository name");
        let mut db = E2eDb { engine, repo };
        checkout::init(&mut db.engine, &db.repo).expect("init repository");
        db
    }

    pub fn execute(&mut self, sql: &str) {
        self.engine.execute(sql).unwrap_or_else(|e| panic!("execute '{sql}': {e}"));
    }

    pub fn query_scalar(&mut self, sql: &str) -> String {
        self.engine
            .query_scalar(sql)
            .unwrap_or_else(|e| panic!("query '{sql}': {e}"))
            .unwrap_or_else(|| panic!("no rows from '{sql}'"))
    }

    pub fn count(&mut self, table: &str) -> i64 {
        self.query_scalar(&format!("SELECT count(*) FROM {table}"))
            .parse()
            .expect("count")
    }

    /// Working-schema-qualified table reference.
    pub fn table(&self, name: &str) -> String {
        format!("\"{}\".\"{name}\"", self.repo.working_schema())
    }

    pub fn commit(&mut self, comment: &str) -> Image {
        commit::commit(
            &mut self.engine,
            &self.repo,
            &CommitOptions::with_comment(comment),
        )
        .expect("commit")
    }

    pub fn checkout(&mut self, image_hash: &str) {
        checkout::checkout(&mut self.engine, &self.repo, image_hash, false).expect("checkout");
    }

    /// Run a layered query and re-apply the quals to the returned rows the
    /// way the upstream executor does (pushed-down predicates are a hint,
    /// not a contract).
    pub fn layered(
        &mut self,
        image_hash: &str,
        table: &str,
        columns: &[&str],
        quals: &[Qual],
    ) -> Vec<Map<String, Value>> {
        let request = QueryRequest::new(self.repo.clone(), image_hash, table)
            .with_columns(columns.iter().copied())
            .with_quals(quals.to_vec());
        let cursor = layered::query(&mut self.engine, &request).expect("layered query");
        let rows: Vec<Map<String, Value>> =
            cursor.collect::<Result<_, _>>().expect("layered stream");
        executor_filter(rows, quals)
    }

    /// Sorted `(column → value)` rows of a plain SELECT, for comparisons.
    pub fn select_rows(&mut self, sql: &str) -> Vec<String> {
        let mut rows: Vec<String> = self
            .engine
            .query_column(&format!(
                "SELECT row_to_json(q)::text FROM ({sql}) q"
            ))
            .expect("select")
            .into_iter()
            .flatten()
            .collect();
        rows.sort();
        rows
    }
}

impl Drop for E2eDb {
    fn drop(&mut self) {
        // Best effort: release the working schema and the repository's
        // catalog rows so repeated runs do not accumulate state.
        let _ = self.engine.rollback();
        let ws = self.repo.working_schema();
        let _ = self.engine.delete_schema(&ws);
        if let Ok(images) = pg_strata::catalog::list_images(&mut self.engine, &self.repo) {
            for image in &images {
                let _ = pg_strata::catalog::drop_table_pointers_for_image(
                    &mut self.engine,
                    &self.repo,
                    &image.hash,
                );
            }
            for image in &images {
                let _ = pg_strata::catalog::delete_tag(&mut self.engine, &self.repo, "HEAD");
                let _ = pg_strata::catalog::delete_tag(&mut self.engine, &self.repo, "latest");
                let _ =
                    pg_strata::catalog::delete_image_row(&mut self.engine, &self.repo, &image.hash);
            }
        }
        let _ = pg_strata::object_manager::ObjectManager::new(&mut self.engine).gc();
    }
}

/// Emulate the executor: keep only rows satisfying every qual.
pub fn executor_filter(
    rows: Vec<Map<String, Value>>,
    quals: &[Qual],
) -> Vec<Map<String, Value>> {
    rows.into_iter()
        .filter(|row| quals.iter().all(|q| qual_matches(row, q)))
        .collect()
}

fn qual_matches(row: &Map<String, Value>, qual: &Qual) -> bool {
    match qual {
        Qual::Scalar { field, op, value } => {
            compare(row.get(field).unwrap_or(&Value::Null), op, value)
        }
        Qual::List {
            field,
            op,
            quantifier,
            values,
        } => {
            let cell = row.get(field).unwrap_or(&Value::Null);
            match quantifier {
                AnyOrAll::Any => values.iter().any(|v| compare(cell, op, v)),
                AnyOrAll::All => values.iter().all(|v| compare(cell, op, v)),
            }
        }
    }
}

fn compare(cell: &Value, op: &str, value: &Value) -> bool {
    match op {
        "=" => cell == value,
        "<>" | "!=" => cell != value,
        ">" | ">=" | "<" | "<=" => {
            let ordering = match (cell.as_f64(), value.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => match (cell.as_str(), value.as_str()) {
                    (Some(a), Some(b)) => Some(a.cmp(b)),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else { return false };
            match op {
                ">" => ordering.is_gt(),
                ">=" => ordering.is_ge(),
                "<" => ordering.is_lt(),
                _ => ordering.is_le(),
            }
        }
        _ => panic!("test executor does not model operator '{op}'"),
    }
}

/// Pull one column out of result rows, sorted, for set comparisons.
pub fn column_values(rows: &[Map<String, Value>], column: &str) -> Vec<Value> {
    let mut values: Vec<Value> = rows
        .iter()
        .map(|r| r.get(column).cloned().unwrap_or(Value::Null))
        .collect();
    values.sort_by_key(|v| v.to_string());
    values
}
