//! The PostgreSQL engine.
//!
//! [`PgEngine`] wraps one blocking client connection. SQL arrives as
//! complete statements (identifiers quoted, values rendered as literals) and
//! results come back as text cells, which is all the core needs: reads that
//! carry row data go through `row_to_json`.
//!
//! Change tracking is trigger-based: tracked tables get a row-level AFTER
//! trigger appending `(schema, table, action, old_row, new_row)` to
//! `pgstrata_audit.change_log`; coalescing the log into change records is
//! pure Rust in [`crate::change`].

use postgres::{Client, NoTls, SimpleQueryMessage};
use serde_json::Value;
use tracing::{debug, trace};

use crate::change::{AuditEvent, AuditOp, Changeset};
use crate::config::EngineConfig;
use crate::engine::{ChangeEngine, ObjectEngine, Rows, SqlEngine};
use crate::error::StrataError;
use crate::sql::{qualified, quote_ident, quote_literal};

/// Schema holding the audit log and its trigger function.
pub const AUDIT_SCHEMA: &str = "pgstrata_audit";

/// The audit log table.
pub const AUDIT_TABLE: &str = "change_log";

/// Name of the per-table capture trigger.
pub const AUDIT_TRIGGER: &str = "pgstrata_audit_trigger";

const AUDIT_DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS pgstrata_audit",
    "CREATE TABLE IF NOT EXISTS pgstrata_audit.change_log (
        change_id    BIGSERIAL PRIMARY KEY,
        table_schema TEXT NOT NULL,
        table_name   TEXT NOT NULL,
        action       TEXT NOT NULL CHECK (action IN ('INSERT', 'UPDATE', 'DELETE')),
        old_row      JSONB,
        new_row      JSONB,
        changed_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_strata_change_log_table
        ON pgstrata_audit.change_log (table_schema, table_name)",
    "CREATE OR REPLACE FUNCTION pgstrata_audit.record_change() RETURNS trigger
     LANGUAGE plpgsql AS $$
     BEGIN
         INSERT INTO pgstrata_audit.change_log
             (table_schema, table_name, action, old_row, new_row)
         VALUES (
             TG_TABLE_SCHEMA,
             TG_TABLE_NAME,
             TG_OP,
             CASE WHEN TG_OP = 'INSERT' THEN NULL ELSE to_jsonb(OLD) END,
             CASE WHEN TG_OP = 'DELETE' THEN NULL ELSE to_jsonb(NEW) END
         );
         RETURN NULL;
     END
     $$",
];

/// A blocking connection to one PostgreSQL engine.
pub struct PgEngine {
    client: Client,
    name: String,
    in_transaction: bool,
}

impl PgEngine {
    /// Connect with the given configuration.
    pub fn connect(config: &EngineConfig) -> Result<Self, StrataError> {
        let mut pg = postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .user(&config.user)
            .dbname(&config.dbname)
            .application_name("pg_strata");
        if !config.password.is_empty() {
            pg.password(&config.password);
        }
        let client = pg.connect(NoTls)?;
        debug!(
            host = %config.host,
            port = config.port,
            dbname = %config.dbname,
            engine = %config.engine_name,
            "connected to engine"
        );
        Ok(PgEngine {
            client,
            name: config.engine_name.clone(),
            in_transaction: false,
        })
    }

    /// The configured engine name (`LOCAL` unless overridden).
    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_audit_infra(&mut self) -> Result<(), StrataError> {
        for ddl in AUDIT_DDL {
            self.execute(ddl)?;
        }
        Ok(())
    }

    fn audit_infra_exists(&mut self) -> Result<bool, StrataError> {
        self.table_exists(AUDIT_SCHEMA, AUDIT_TABLE)
    }
}

impl SqlEngine for PgEngine {
    fn run_sql(&mut self, sql: &str) -> Result<Rows, StrataError> {
        trace!(sql, "run_sql");
        let messages = self.client.simple_query(sql)?;
        let mut rows: Rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                rows.push(
                    (0..row.len())
                        .map(|i| row.get(i).map(|cell| cell.to_string()))
                        .collect(),
                );
            }
        }
        Ok(rows)
    }

    fn begin(&mut self) -> Result<(), StrataError> {
        if self.in_transaction {
            return Ok(());
        }
        self.run_sql("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit_tx(&mut self) -> Result<(), StrataError> {
        self.run_sql("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StrataError> {
        self.run_sql("ROLLBACK")?;
        self.in_transaction = false;
        Ok(())
    }
}

impl ChangeEngine for PgEngine {
    fn track_tables(&mut self, tables: &[(String, String)]) -> Result<(), StrataError> {
        if tables.is_empty() {
            return Ok(());
        }
        self.ensure_audit_infra()?;
        for (schema, table) in tables {
            let target = qualified(schema, table);
            self.execute(&format!(
                "DROP TRIGGER IF EXISTS {} ON {target}",
                quote_ident(AUDIT_TRIGGER)
            ))?;
            self.execute(&format!(
                "CREATE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {target} \
                 FOR EACH ROW EXECUTE FUNCTION {}.record_change()",
                quote_ident(AUDIT_TRIGGER),
                quote_ident(AUDIT_SCHEMA)
            ))?;
            debug!(%schema, %table, "tracking table");
        }
        Ok(())
    }

    fn untrack_tables(&mut self, tables: &[(String, String)]) -> Result<(), StrataError> {
        let have_audit = self.audit_infra_exists()?;
        for (schema, table) in tables {
            if self.table_exists(schema, table)? {
                self.execute(&format!(
                    "DROP TRIGGER IF EXISTS {} ON {}",
                    quote_ident(AUDIT_TRIGGER),
                    qualified(schema, table)
                ))?;
            }
            if have_audit {
                self.execute(&format!(
                    "DELETE FROM {} WHERE table_schema = {} AND table_name = {}",
                    qualified(AUDIT_SCHEMA, AUDIT_TABLE),
                    quote_literal(schema),
                    quote_literal(table)
                ))?;
            }
            debug!(%schema, %table, "untracked table");
        }
        Ok(())
    }

    fn get_tracked_tables(&mut self) -> Result<Vec<(String, String)>, StrataError> {
        let sql = format!(
            "SELECT event_object_schema, event_object_table \
             FROM information_schema.triggers WHERE trigger_name = {} \
             GROUP BY 1, 2 ORDER BY 1, 2",
            quote_literal(AUDIT_TRIGGER)
        );
        let mut tracked = Vec::new();
        for row in self.run_sql(&sql)? {
            let mut cells = row.into_iter();
            let schema = cells
                .next()
                .flatten()
                .ok_or_else(|| StrataError::engine("NULL trigger schema"))?;
            let table = cells
                .next()
                .flatten()
                .ok_or_else(|| StrataError::engine("NULL trigger table"))?;
            tracked.push((schema, table));
        }
        Ok(tracked)
    }

    fn has_pending_changes(&mut self, schema: &str) -> Result<bool, StrataError> {
        if !self.audit_infra_exists()? {
            return Ok(false);
        }
        let sql = format!(
            "SELECT 1 FROM {} WHERE table_schema = {} LIMIT 1",
            qualified(AUDIT_SCHEMA, AUDIT_TABLE),
            quote_literal(schema)
        );
        Ok(self.query_scalar(&sql)?.is_some())
    }

    fn discard_pending_changes(
        &mut self,
        schema: &str,
        table: Option<&str>,
    ) -> Result<(), StrataError> {
        if !self.audit_infra_exists()? {
            return Ok(());
        }
        let mut sql = format!(
            "DELETE FROM {} WHERE table_schema = {}",
            qualified(AUDIT_SCHEMA, AUDIT_TABLE),
            quote_literal(schema)
        );
        if let Some(table) = table {
            sql.push_str(&format!(" AND table_name = {}", quote_literal(table)));
        }
        self.execute(&sql)
    }

    fn get_pending_changes(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<Changeset, StrataError> {
        let spec = self.get_full_table_schema(schema, table)?;
        if !self.audit_infra_exists()? {
            return Ok(Changeset::new(spec.change_key_columns()));
        }
        let sql = format!(
            "SELECT action, old_row::text, new_row::text FROM {} \
             WHERE table_schema = {} AND table_name = {} ORDER BY change_id",
            qualified(AUDIT_SCHEMA, AUDIT_TABLE),
            quote_literal(schema),
            quote_literal(table)
        );
        let mut events = Vec::new();
        for row in self.run_sql(&sql)? {
            let mut cells = row.into_iter();
            let action = cells
                .next()
                .flatten()
                .ok_or_else(|| StrataError::engine("audit row without action"))?;
            events.push(audit_event(
                &action,
                cells.next().flatten().as_deref(),
                cells.next().flatten().as_deref(),
            )?);
        }
        Changeset::from_audit(&spec, events)
    }

    fn get_changed_tables(&mut self, schema: &str) -> Result<Vec<String>, StrataError> {
        if !self.audit_infra_exists()? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT table_name FROM {} WHERE table_schema = {} ORDER BY table_name",
            qualified(AUDIT_SCHEMA, AUDIT_TABLE),
            quote_literal(schema)
        );
        Ok(self.query_column(&sql)?.into_iter().flatten().collect())
    }
}

impl ObjectEngine for PgEngine {}

/// Build one audit event from the raw log cells.
fn audit_event(
    action: &str,
    old_row: Option<&str>,
    new_row: Option<&str>,
) -> Result<AuditEvent, StrataError> {
    Ok(AuditEvent {
        op: action.parse::<AuditOp>()?,
        old_row: parse_row(old_row)?,
        new_row: parse_row(new_row)?,
    })
}

fn parse_row(raw: Option<&str>) -> Result<Option<serde_json::Map<String, Value>>, StrataError> {
    let Some(raw) = raw else { return Ok(None) };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(Value::Null) => Ok(None),
        Ok(_) => Err(StrataError::engine("audit row image is not a JSON object")),
        Err(err) => Err(StrataError::engine(format!("bad audit row image: {err}"))),
    }
}
