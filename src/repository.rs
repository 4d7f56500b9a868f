//! Repository identity.
//!
//! A repository is a named container `(namespace, repository)`. Its working
//! schema — the schema a checkout materializes into and change tracking
//! watches — is named `namespace/repository`, which is a perfectly ordinary
//! (quoted) PostgreSQL schema name.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::StrataError;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z0-9_-]+$").expect("static regex compiles"));

/// A named repository within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repository {
    pub namespace: String,
    pub name: String,
}

impl Repository {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, StrataError> {
        let namespace = namespace.into();
        let name = name.into();
        for part in [&namespace, &name] {
            if !NAME_RE.is_match(part) {
                return Err(StrataError::InvalidReference(format!(
                    "'{part}' is not a valid repository name (allowed: [A-Za-z0-9_-]+)"
                )));
            }
        }
        Ok(Repository { namespace, name })
    }

    /// The schema checkouts materialize into.
    pub fn working_schema(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The key under which commit/checkout advisory locks are taken.
    pub fn lock_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
