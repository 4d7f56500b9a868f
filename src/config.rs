//! Engine configuration.
//!
//! All settings come from `ENGINE_*` environment variables. Construction goes
//! through an injectable lookup function so precedence and defaults stay
//! unit-testable without mutating the process environment.
//!
//! The FDW host/port fall back to the engine host/port when unset: the
//! foreign-data-wrapper side of a query may reach the engine over a different
//! network path than an interactive client.

use crate::error::StrataError;

/// Default engine name when `ENGINE` is unset.
pub const LOCAL_ENGINE: &str = "LOCAL";

/// Connection and identity settings for one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Engine host (`ENGINE_HOST`, default `localhost`).
    pub host: String,
    /// Engine port (`ENGINE_PORT`, default `5432`).
    pub port: u16,
    /// Role used for normal operations (`ENGINE_USER`, default `postgres`).
    pub user: String,
    /// Password for `user` (`ENGINE_PWD`, default empty).
    pub password: String,
    /// Database name (`ENGINE_DB_NAME`, default `postgres`).
    pub dbname: String,
    /// Superuser role for administrative setup (`ENGINE_ADMIN_USER`).
    pub admin_user: Option<String>,
    /// Password for `admin_user` (`ENGINE_ADMIN_PWD`).
    pub admin_password: Option<String>,
    /// Host the FDW connects back through (`ENGINE_FDW_HOST`).
    pub fdw_host: String,
    /// Port the FDW connects back through (`ENGINE_FDW_PORT`).
    pub fdw_port: u16,
    /// Filesystem path for object dumps (`ENGINE_OBJECT_PATH`).
    pub object_path: Option<String>,
    /// Default namespace for repositories (`NAMESPACE`).
    pub namespace: Option<String>,
    /// Name of the current engine (`ENGINE`, default `LOCAL`).
    pub engine_name: String,
}

impl EngineConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, StrataError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StrataError> {
        let host = lookup("ENGINE_HOST").unwrap_or_else(|| "localhost".to_string());
        let port = parse_port("ENGINE_PORT", lookup("ENGINE_PORT"), 5432)?;
        let fdw_host = lookup("ENGINE_FDW_HOST").unwrap_or_else(|| host.clone());
        let fdw_port = parse_port("ENGINE_FDW_PORT", lookup("ENGINE_FDW_PORT"), port)?;

        Ok(EngineConfig {
            host,
            port,
            user: lookup("ENGINE_USER").unwrap_or_else(|| "postgres".to_string()),
            password: lookup("ENGINE_PWD").unwrap_or_default(),
            dbname: lookup("ENGINE_DB_NAME").unwrap_or_else(|| "postgres".to_string()),
            admin_user: lookup("ENGINE_ADMIN_USER"),
            admin_password: lookup("ENGINE_ADMIN_PWD"),
            fdw_host,
            fdw_port,
            object_path: lookup("ENGINE_OBJECT_PATH"),
            namespace: lookup("NAMESPACE"),
            engine_name: lookup("ENGINE").unwrap_or_else(|| LOCAL_ENGINE.to_string()),
        })
    }

    /// A copy of this configuration that connects through the FDW host/port.
    pub fn for_fdw(&self) -> Self {
        let mut cfg = self.clone();
        cfg.host = self.fdw_host.clone();
        cfg.port = self.fdw_port;
        cfg
    }
}

fn parse_port(key: &str, value: Option<String>, default: u16) -> Result<u16, StrataError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| StrataError::Config(format!("{key} is not a valid port: '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 5432);
        assert_eq!(cfg.user, "postgres");
        assert_eq!(cfg.password, "");
        assert_eq!(cfg.dbname, "postgres");
        assert_eq!(cfg.engine_name, LOCAL_ENGINE);
        assert!(cfg.admin_user.is_none());
        assert!(cfg.namespace.is_none());
    }

    #[test]
    fn test_fdw_defaults_follow_engine() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[
            ("ENGINE_HOST", "db.internal"),
            ("ENGINE_PORT", "5678"),
        ]))
        .unwrap();
        assert_eq!(cfg.fdw_host, "db.internal");
        assert_eq!(cfg.fdw_port, 5678);
    }

    #[test]
    fn test_fdw_overrides_win() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[
            ("ENGINE_HOST", "db.internal"),
            ("ENGINE_FDW_HOST", "127.0.0.1"),
            ("ENGINE_FDW_PORT", "5999"),
        ]))
        .unwrap();
        assert_eq!(cfg.fdw_host, "127.0.0.1");
        assert_eq!(cfg.fdw_port, 5999);

        let fdw = cfg.for_fdw();
        assert_eq!(fdw.host, "127.0.0.1");
        assert_eq!(fdw.port, 5999);
        assert_eq!(fdw.user, cfg.user);
    }

    #[test]
    fn test_invalid_port_is_a_config_error() {
        let err = EngineConfig::from_lookup(lookup_from(&[("ENGINE_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, StrataError::Config(_)), "got: {err:?}");
        assert!(err.to_string().contains("ENGINE_PORT"));
    }

    #[test]
    fn test_full_lookup() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[
            ("ENGINE_HOST", "h"),
            ("ENGINE_PORT", "1111"),
            ("ENGINE_USER", "u"),
            ("ENGINE_PWD", "secret"),
            ("ENGINE_DB_NAME", "d"),
            ("ENGINE_ADMIN_USER", "root"),
            ("ENGINE_ADMIN_PWD", "toor"),
            ("ENGINE_OBJECT_PATH", "/var/lib/strata"),
            ("NAMESPACE", "acme"),
            ("ENGINE", "remote_a"),
        ]))
        .unwrap();
        assert_eq!(cfg.user, "u");
        assert_eq!(cfg.password, "secret");
        assert_eq!(cfg.dbname, "d");
        assert_eq!(cfg.admin_user.as_deref(), Some("root"));
        assert_eq!(cfg.admin_password.as_deref(), Some("toor"));
        assert_eq!(cfg.object_path.as_deref(), Some("/var/lib/strata"));
        assert_eq!(cfg.namespace.as_deref(), Some("acme"));
        assert_eq!(cfg.engine_name, "remote_a");
    }
}
