//! Foreign-data-wrapper boundary.
//!
//! A foreign server hands us an option map (connection parameters plus the
//! repository/image/table coordinates), a column set and a qual list; we
//! hand back a lazy row stream. The scan owns its own engine connection —
//! rows keep flowing for as long as the executor pulls, and dropping the
//! scan releases the staging table, the transaction and the connection.

use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::engine::postgres::PgEngine;
use crate::error::StrataError;
use crate::layered::{self, LayeredCursor, QueryRequest};
use crate::qual::Qual;
use crate::repository::Repository;

/// Options from the `CREATE FOREIGN TABLE` statement. Connection fields
/// default to the (FDW-side) engine configuration.
#[derive(Debug, Clone)]
pub struct FdwOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub namespace: String,
    pub repository: String,
    pub image_hash: String,
    pub table: String,
}

impl FdwOptions {
    /// Parse an option map, defaulting connection fields from the process
    /// environment.
    pub fn from_map(options: &HashMap<String, String>) -> Result<Self, StrataError> {
        Self::from_map_with(options, &EngineConfig::from_env()?.for_fdw())
    }

    /// Parse an option map against an explicit fallback configuration.
    pub fn from_map_with(
        options: &HashMap<String, String>,
        fallback: &EngineConfig,
    ) -> Result<Self, StrataError> {
        let get = |key: &str| options.get(key).cloned();
        let required = |key: &str| {
            get(key).ok_or_else(|| StrataError::Config(format!("missing FDW option '{key}'")))
        };

        let port = match get("port") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| StrataError::Config(format!("bad FDW port: '{raw}'")))?,
            None => fallback.port,
        };
        let image_hash = required("image_hash")?.to_lowercase();
        if image_hash.len() != 64 || !image_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StrataError::InvalidReference(format!(
                "'{image_hash}' is not a 64-character hex image hash"
            )));
        }

        Ok(FdwOptions {
            host: get("host").unwrap_or_else(|| fallback.host.clone()),
            port,
            user: get("user").unwrap_or_else(|| fallback.user.clone()),
            password: get("password").unwrap_or_else(|| fallback.password.clone()),
            dbname: get("dbname").unwrap_or_else(|| fallback.dbname.clone()),
            namespace: required("namespace")?,
            repository: required("repository")?,
            image_hash,
            table: required("table")?,
        })
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            dbname: self.dbname.clone(),
            admin_user: None,
            admin_password: None,
            fdw_host: self.host.clone(),
            fdw_port: self.port,
            object_path: None,
            namespace: Some(self.namespace.clone()),
            engine_name: "FDW".to_string(),
        }
    }
}

/// The row stream handed to the foreign scan.
pub type FdwScan = LayeredCursor<PgEngine, PgEngine>;

/// Open a scan: connect, resolve, stage, stream.
///
/// `columns` empty means all columns. Unsupported quals are accepted and
/// ignored — the executor re-applies every qual to the returned rows.
pub fn execute(
    options: &FdwOptions,
    columns: Vec<String>,
    quals: Vec<Qual>,
) -> Result<FdwScan, StrataError> {
    let engine = PgEngine::connect(&options.engine_config())?;
    let repository = Repository::new(&options.namespace, &options.repository)?;
    let request = QueryRequest::new(repository, options.image_hash.clone(), options.table.clone())
        .with_columns(columns)
        .with_quals(quals);
    layered::query_owned(engine, &request)
}
