//! Error types for pg_strata.
//!
//! All failures are represented by [`StrataError`]. Errors are propagated via
//! `Result<T, StrataError>` throughout the codebase; per-statement failures
//! inside a savepointed block roll back to the savepoint and re-emit as
//! [`StrataError::EngineError`], carrying the original driver diagnostic.
//!
//! # Error Classification
//!
//! Errors are classified into four categories:
//! - **User** — refused operations, bad references, bad configuration.
//! - **Conflict** — lost races on the workspace or the image graph.
//! - **Storage** — referenced entities absent or incompatible.
//! - **Engine** — underlying relational-engine failures.

use std::fmt;

/// Primary error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    // ── User errors ──────────────────────────────────────────────────────
    /// Checkout or commit refused because uncommitted changes exist.
    #[error("uncommitted changes in '{0}' (commit or discard them, or pass force)")]
    DirtyWorkspace(String),

    /// Commit requested on a clean workspace while configured to reject it.
    #[error("no pending changes to commit in '{0}'")]
    NoPendingChanges(String),

    /// Malformed hash, unknown table in an image, reserved tag, cyclic parent.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A referenced tag does not exist in the repository.
    #[error("tag not found: {0}")]
    MissingTag(String),

    /// Bad or missing configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    // ── Conflicts ────────────────────────────────────────────────────────
    /// A concurrent checkout holds the working schema of the same repository.
    #[error("workspace of '{0}' is held by another session")]
    WorkspaceBusy(String),

    /// A commit lost the race for the image graph; the caller must rebase.
    #[error("concurrent commit on '{0}': rebase required")]
    ConcurrentCommit(String),

    // ── Storage errors ───────────────────────────────────────────────────
    /// A referenced content-addressed object is absent from the store.
    #[error("object not found: {0}")]
    MissingObject(String),

    /// A referenced image is absent from the repository.
    #[error("image not found: {0}")]
    MissingImage(String),

    /// An object's schema spec is incompatible with its target table.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    // ── Engine errors ────────────────────────────────────────────────────
    /// Underlying relational-engine failure, with the original diagnostic.
    #[error("engine error: {message}")]
    EngineError {
        message: String,
        #[source]
        source: Option<postgres::Error>,
    },
}

impl From<postgres::Error> for StrataError {
    fn from(err: postgres::Error) -> Self {
        StrataError::EngineError {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl StrataError {
    /// An engine error that did not originate from the driver (e.g. an
    /// unparseable result or an unexpected result shape).
    pub fn engine(message: impl Into<String>) -> Self {
        StrataError::EngineError {
            message: message.into(),
            source: None,
        }
    }

    /// Whether the operation can be retried verbatim with a chance of
    /// success. Only a busy workspace qualifies; a lost commit race needs a
    /// rebase first and everything else needs user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::WorkspaceBusy(_))
    }

    /// Classify the error for reporting.
    pub fn kind(&self) -> StrataErrorKind {
        match self {
            StrataError::DirtyWorkspace(_)
            | StrataError::NoPendingChanges(_)
            | StrataError::InvalidReference(_)
            | StrataError::MissingTag(_)
            | StrataError::Config(_) => StrataErrorKind::User,

            StrataError::WorkspaceBusy(_) | StrataError::ConcurrentCommit(_) => {
                StrataErrorKind::Conflict
            }

            StrataError::MissingObject(_)
            | StrataError::MissingImage(_)
            | StrataError::SchemaMismatch(_) => StrataErrorKind::Storage,

            StrataError::EngineError { .. } => StrataErrorKind::Engine,
        }
    }
}

/// Classification of error severity/kind for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrataErrorKind {
    User,
    Conflict,
    Storage,
    Engine,
}

impl fmt::Display for StrataErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrataErrorKind::User => write!(f, "USER"),
            StrataErrorKind::Conflict => write!(f, "CONFLICT"),
            StrataErrorKind::Storage => write!(f, "STORAGE"),
            StrataErrorKind::Engine => write!(f, "ENGINE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            StrataError::DirtyWorkspace("a/b".into()).kind(),
            StrataErrorKind::User
        );
        assert_eq!(
            StrataError::ConcurrentCommit("a/b".into()).kind(),
            StrataErrorKind::Conflict
        );
        assert_eq!(
            StrataError::MissingObject("ab12".into()).kind(),
            StrataErrorKind::Storage
        );
        assert_eq!(StrataError::engine("boom").kind(), StrataErrorKind::Engine);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(StrataError::WorkspaceBusy("a/b".into()).is_retryable());

        assert!(!StrataError::ConcurrentCommit("a/b".into()).is_retryable());
        assert!(!StrataError::DirtyWorkspace("a/b".into()).is_retryable());
        assert!(!StrataError::engine("boom").is_retryable());
    }

    #[test]
    fn test_engine_error_without_source() {
        let err = StrataError::engine("cursor returned an empty row");
        match &err {
            StrataError::EngineError { message, source } => {
                assert_eq!(message, "cursor returned an empty row");
                assert!(source.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_display_carries_context() {
        let msg = StrataError::MissingImage("cafe".into()).to_string();
        assert!(msg.contains("cafe"), "message should name the image: {msg}");

        let msg = StrataError::WorkspaceBusy("ns/repo".into()).to_string();
        assert!(msg.contains("ns/repo"));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(StrataErrorKind::User.to_string(), "USER");
        assert_eq!(StrataErrorKind::Conflict.to_string(), "CONFLICT");
        assert_eq!(StrataErrorKind::Storage.to_string(), "STORAGE");
        assert_eq!(StrataErrorKind::Engine.to_string(), "ENGINE");
    }
}
