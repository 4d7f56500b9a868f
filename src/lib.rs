//! Layered, content-addressed version control for PostgreSQL tables.
//!
//! A versioned table is a chain of immutable fragments: one full snapshot
//! plus zero or more diffs, each stored as a content-addressed object inside
//! the engine. Commits capture row-level changes from tracked tables into
//! new diff fragments and link them into the image graph; checkouts
//! rematerialize any image into the repository's working schema; the layered
//! query engine ([`layered`]) answers predicate reads against any image by
//! selectively accumulating rows in a staging table instead of materializing
//! the whole chain.
//!
//! The relational engine itself is an external collaborator behind the
//! [`engine`] traits; [`engine::postgres::PgEngine`] is the PostgreSQL
//! implementation. There is no ambient global engine: handles are explicit
//! everywhere.

pub mod catalog;
pub mod change;
pub mod checkout;
pub mod commit;
pub mod config;
pub mod engine;
pub mod error;
pub mod fdw;
pub mod fragments;
pub mod image;
pub mod layered;
pub mod object_manager;
pub mod qual;
pub mod repository;
pub mod schema;
pub mod sql;

pub use crate::config::EngineConfig;
pub use crate::engine::postgres::PgEngine;
pub use crate::error::{StrataError, StrataErrorKind};
pub use crate::repository::Repository;
