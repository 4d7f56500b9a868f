//! Metadata catalog — the persisted state of every repository.
//!
//! All state lives in the `pgstrata_meta` schema: `images` (the commit
//! graph), `tables` (per-image table pointers), `objects` (content-addressed
//! object metadata and refcounts) and `tags` (mutable aliases, including the
//! reserved `HEAD` and `latest`). Object row data itself lives in one storage
//! table per object, managed by [`crate::fragments`].

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::engine::SqlEngine;
use crate::error::StrataError;
use crate::image::Image;
use crate::repository::Repository;
use crate::schema::TableSchema;
use crate::sql::{qualified, quote_literal};

/// Schema holding all catalog tables and object storage tables.
pub const META_SCHEMA: &str = "pgstrata_meta";

const CATALOG_DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS pgstrata_meta",
    "CREATE TABLE IF NOT EXISTS pgstrata_meta.images (
        namespace   TEXT NOT NULL,
        repository  TEXT NOT NULL,
        image_hash  TEXT NOT NULL CHECK (length(image_hash) = 64),
        parent_hash TEXT,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        comment     TEXT,
        PRIMARY KEY (namespace, repository, image_hash)
    )",
    "CREATE TABLE IF NOT EXISTS pgstrata_meta.tables (
        namespace    TEXT NOT NULL,
        repository   TEXT NOT NULL,
        image_hash   TEXT NOT NULL,
        table_name   TEXT NOT NULL,
        schema_spec  JSONB NOT NULL,
        object_chain JSONB NOT NULL,
        PRIMARY KEY (namespace, repository, image_hash, table_name),
        FOREIGN KEY (namespace, repository, image_hash)
            REFERENCES pgstrata_meta.images (namespace, repository, image_hash)
            ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS pgstrata_meta.objects (
        object_id   TEXT PRIMARY KEY CHECK (length(object_id) = 64),
        kind        TEXT NOT NULL CHECK (kind IN ('SNAP', 'DIFF')),
        size_bytes  BIGINT NOT NULL DEFAULT 0,
        refcount    BIGINT NOT NULL DEFAULT 0,
        schema_spec JSONB NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS pgstrata_meta.tags (
        namespace  TEXT NOT NULL,
        repository TEXT NOT NULL,
        tag        TEXT NOT NULL,
        image_hash TEXT NOT NULL CHECK (length(image_hash) = 64),
        PRIMARY KEY (namespace, repository, tag)
    )",
    "CREATE INDEX IF NOT EXISTS idx_strata_images_parent
        ON pgstrata_meta.images (namespace, repository, parent_hash)",
];

/// Create the catalog schema and tables if absent. Idempotent.
pub fn ensure_metadata_schema<E: SqlEngine>(engine: &mut E) -> Result<(), StrataError> {
    for ddl in CATALOG_DDL {
        engine.execute(ddl)?;
    }
    Ok(())
}

// ── objects ──────────────────────────────────────────────────────────────

/// The two object flavours in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Snapshot,
    Diff,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Snapshot => "SNAP",
            ObjectKind::Diff => "DIFF",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StrataError> {
        match raw {
            "SNAP" => Ok(ObjectKind::Snapshot),
            "DIFF" => Ok(ObjectKind::Diff),
            other => Err(StrataError::engine(format!("unknown object kind: {other}"))),
        }
    }
}

/// Catalog row for one content-addressed object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub object_id: String,
    pub kind: ObjectKind,
    pub size_bytes: i64,
    pub refcount: i64,
    pub schema_spec: TableSchema,
}

/// Register an object. A re-registration of the same content is a no-op
/// (content addressing: the row is keyed by the digest).
pub fn register_object<E: SqlEngine>(
    engine: &mut E,
    object_id: &str,
    kind: ObjectKind,
    size_bytes: i64,
    schema_spec: &TableSchema,
) -> Result<(), StrataError> {
    engine.execute(&format!(
        "INSERT INTO {}.objects (object_id, kind, size_bytes, schema_spec) \
         VALUES ({}, {}, {}, {}) ON CONFLICT (object_id) DO NOTHING",
        META_SCHEMA,
        quote_literal(object_id),
        quote_literal(kind.as_str()),
        size_bytes,
        quote_literal(&schema_spec.canonical_json()),
    ))
}

pub fn get_object<E: SqlEngine>(
    engine: &mut E,
    object_id: &str,
) -> Result<ObjectMeta, StrataError> {
    let sql = format!(
        "SELECT kind, size_bytes, refcount, schema_spec::text \
         FROM {}.objects WHERE object_id = {}",
        META_SCHEMA,
        quote_literal(object_id)
    );
    let row = engine
        .query_row(&sql)?
        .ok_or_else(|| StrataError::MissingObject(object_id.to_string()))?;
    let mut cells = row.into_iter();
    Ok(ObjectMeta {
        object_id: object_id.to_string(),
        kind: ObjectKind::parse(&text_cell(cells.next())?)?,
        size_bytes: int_cell(cells.next())?,
        refcount: int_cell(cells.next())?,
        schema_spec: parse_json_cell(cells.next())?,
    })
}

pub fn object_exists<E: SqlEngine>(engine: &mut E, object_id: &str) -> Result<bool, StrataError> {
    let sql = format!(
        "SELECT 1 FROM {}.objects WHERE object_id = {}",
        META_SCHEMA,
        quote_literal(object_id)
    );
    Ok(engine.query_scalar(&sql)?.is_some())
}

pub fn bump_refcounts<E: SqlEngine>(
    engine: &mut E,
    object_ids: &[String],
    delta: i64,
) -> Result<(), StrataError> {
    if object_ids.is_empty() {
        return Ok(());
    }
    engine.execute(&format!(
        "UPDATE {}.objects SET refcount = refcount + {} WHERE object_id IN ({})",
        META_SCHEMA,
        delta,
        id_list(object_ids)
    ))
}

/// Objects no table pointer references. The refcount is the fast check; the
/// chain scan is authoritative.
pub fn unreferenced_objects<E: SqlEngine>(engine: &mut E) -> Result<Vec<String>, StrataError> {
    let sql = format!(
        "SELECT o.object_id FROM {meta}.objects o \
         WHERE o.refcount <= 0 AND NOT EXISTS (\
            SELECT 1 FROM {meta}.tables t WHERE t.object_chain ? o.object_id)",
        meta = META_SCHEMA
    );
    Ok(engine.query_column(&sql)?.into_iter().flatten().collect())
}

pub fn delete_object_rows<E: SqlEngine>(
    engine: &mut E,
    object_ids: &[String],
) -> Result<(), StrataError> {
    if object_ids.is_empty() {
        return Ok(());
    }
    engine.execute(&format!(
        "DELETE FROM {}.objects WHERE object_id IN ({})",
        META_SCHEMA,
        id_list(object_ids)
    ))
}

// ── images ───────────────────────────────────────────────────────────────

pub fn insert_image<E: SqlEngine>(engine: &mut E, image: &Image) -> Result<(), StrataError> {
    engine.execute(&format!(
        "INSERT INTO {}.images (namespace, repository, image_hash, parent_hash, created_at, comment) \
         VALUES ({}, {}, {}, {}, {}, {})",
        META_SCHEMA,
        quote_literal(&image.namespace),
        quote_literal(&image.repository),
        quote_literal(&image.hash),
        opt_literal(image.parent.as_deref()),
        quote_literal(&image.created_at.to_rfc3339()),
        opt_literal(image.comment.as_deref()),
    ))
}

pub fn get_image<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    hash: &str,
) -> Result<Image, StrataError> {
    let sql = format!(
        "SELECT parent_hash, created_at, comment FROM {}.images \
         WHERE namespace = {} AND repository = {} AND image_hash = {}",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(hash)
    );
    let row = engine
        .query_row(&sql)?
        .ok_or_else(|| StrataError::MissingImage(format!("{repo}:{hash}")))?;
    let mut cells = row.into_iter();
    Ok(Image {
        namespace: repo.namespace.clone(),
        repository: repo.name.clone(),
        hash: hash.to_string(),
        parent: cells.next().flatten(),
        created_at: parse_timestamptz(&text_cell(cells.next())?)?,
        comment: cells.next().flatten(),
    })
}

pub fn image_exists<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    hash: &str,
) -> Result<bool, StrataError> {
    let sql = format!(
        "SELECT 1 FROM {}.images \
         WHERE namespace = {} AND repository = {} AND image_hash = {}",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(hash)
    );
    Ok(engine.query_scalar(&sql)?.is_some())
}

/// All images of a repository, oldest first.
pub fn list_images<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
) -> Result<Vec<Image>, StrataError> {
    let sql = format!(
        "SELECT image_hash, parent_hash, created_at, comment FROM {}.images \
         WHERE namespace = {} AND repository = {} ORDER BY created_at, image_hash",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name)
    );
    let mut images = Vec::new();
    for row in engine.run_sql(&sql)? {
        let mut cells = row.into_iter();
        images.push(Image {
            namespace: repo.namespace.clone(),
            repository: repo.name.clone(),
            hash: text_cell(cells.next())?,
            parent: cells.next().flatten(),
            created_at: parse_timestamptz(&text_cell(cells.next())?)?,
            comment: cells.next().flatten(),
        });
    }
    Ok(images)
}

/// Whether any image lists `hash` as its parent.
pub fn has_children<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    hash: &str,
) -> Result<bool, StrataError> {
    let sql = format!(
        "SELECT 1 FROM {}.images \
         WHERE namespace = {} AND repository = {} AND parent_hash = {}",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(hash)
    );
    Ok(engine.query_scalar(&sql)?.is_some())
}

pub fn delete_image_row<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    hash: &str,
) -> Result<(), StrataError> {
    engine.execute(&format!(
        "DELETE FROM {}.images \
         WHERE namespace = {} AND repository = {} AND image_hash = {}",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(hash)
    ))
}

/// Resolve a hash prefix to the full image hash; the prefix must match
/// exactly one image.
pub fn resolve_hash_prefix<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    prefix: &str,
) -> Result<String, StrataError> {
    if !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StrataError::InvalidReference(format!(
            "'{prefix}' is not a hexadecimal image hash prefix"
        )));
    }
    let sql = format!(
        "SELECT image_hash FROM {}.images \
         WHERE namespace = {} AND repository = {} AND image_hash LIKE {} LIMIT 2",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(&format!("{}%", prefix.to_lowercase())),
    );
    let matches: Vec<String> = engine.query_column(&sql)?.into_iter().flatten().collect();
    match matches.len() {
        0 => Err(StrataError::MissingImage(format!("{repo}:{prefix}"))),
        1 => Ok(matches.into_iter().next().expect("one match")),
        _ => Err(StrataError::InvalidReference(format!(
            "image hash prefix '{prefix}' is ambiguous in {repo}"
        ))),
    }
}

// ── table pointers ───────────────────────────────────────────────────────

/// Write one table pointer and take a reference on every object in its
/// chain.
pub fn set_table_pointer<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    image_hash: &str,
    table: &str,
    schema_spec: &TableSchema,
    chain: &[String],
) -> Result<(), StrataError> {
    let chain_json =
        serde_json::to_string(chain).map_err(|e| StrataError::engine(e.to_string()))?;
    engine.execute(&format!(
        "INSERT INTO {}.tables \
         (namespace, repository, image_hash, table_name, schema_spec, object_chain) \
         VALUES ({}, {}, {}, {}, {}, {})",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(image_hash),
        quote_literal(table),
        quote_literal(&schema_spec.canonical_json()),
        quote_literal(&chain_json),
    ))?;
    bump_refcounts(engine, chain, 1)
}

/// The schema spec and snapshot-first object chain of one table at one
/// image.
pub fn get_table_pointer<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    image_hash: &str,
    table: &str,
) -> Result<(TableSchema, Vec<String>), StrataError> {
    let sql = format!(
        "SELECT schema_spec::text, object_chain::text FROM {}.tables \
         WHERE namespace = {} AND repository = {} AND image_hash = {} AND table_name = {}",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(image_hash),
        quote_literal(table)
    );
    let row = engine.query_row(&sql)?.ok_or_else(|| {
        StrataError::InvalidReference(format!(
            "table '{table}' does not exist in image {repo}:{image_hash}"
        ))
    })?;
    let mut cells = row.into_iter();
    Ok((parse_json_cell(cells.next())?, parse_json_cell(cells.next())?))
}

/// `(table_name, schema_spec, chain)` for every table in an image.
pub fn tables_for_image<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    image_hash: &str,
) -> Result<Vec<(String, TableSchema, Vec<String>)>, StrataError> {
    let sql = format!(
        "SELECT table_name, schema_spec::text, object_chain::text FROM {}.tables \
         WHERE namespace = {} AND repository = {} AND image_hash = {} ORDER BY table_name",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(image_hash)
    );
    let mut tables = Vec::new();
    for row in engine.run_sql(&sql)? {
        let mut cells = row.into_iter();
        tables.push((
            text_cell(cells.next())?,
            parse_json_cell(cells.next())?,
            parse_json_cell(cells.next())?,
        ));
    }
    Ok(tables)
}

/// Drop every table pointer of an image, releasing one reference per chain
/// membership.
pub fn drop_table_pointers_for_image<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    image_hash: &str,
) -> Result<(), StrataError> {
    for (_, _, chain) in tables_for_image(engine, repo, image_hash)? {
        bump_refcounts(engine, &chain, -1)?;
    }
    engine.execute(&format!(
        "DELETE FROM {}.tables \
         WHERE namespace = {} AND repository = {} AND image_hash = {}",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(image_hash)
    ))
}

// ── tags ─────────────────────────────────────────────────────────────────

/// Upsert a tag. No name validation here: callers gate reserved names.
pub fn write_tag<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    tag: &str,
    image_hash: &str,
) -> Result<(), StrataError> {
    engine.execute(&format!(
        "INSERT INTO {}.tags (namespace, repository, tag, image_hash) \
         VALUES ({}, {}, {}, {}) \
         ON CONFLICT (namespace, repository, tag) DO UPDATE SET image_hash = EXCLUDED.image_hash",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(tag),
        quote_literal(image_hash),
    ))
}

pub fn read_tag<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    tag: &str,
) -> Result<String, StrataError> {
    let sql = format!(
        "SELECT image_hash FROM {}.tags \
         WHERE namespace = {} AND repository = {} AND tag = {}",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(tag)
    );
    engine
        .query_scalar(&sql)?
        .ok_or_else(|| StrataError::MissingTag(format!("{repo}:{tag}")))
}

pub fn delete_tag<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    tag: &str,
) -> Result<(), StrataError> {
    engine.execute(&format!(
        "DELETE FROM {}.tags WHERE namespace = {} AND repository = {} AND tag = {}",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(tag)
    ))
}

/// All `(tag, image_hash)` pairs of a repository.
pub fn list_tags<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
) -> Result<Vec<(String, String)>, StrataError> {
    let sql = format!(
        "SELECT tag, image_hash FROM {}.tags \
         WHERE namespace = {} AND repository = {} ORDER BY tag",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name)
    );
    let mut tags = Vec::new();
    for row in engine.run_sql(&sql)? {
        let mut cells = row.into_iter();
        tags.push((text_cell(cells.next())?, text_cell(cells.next())?));
    }
    Ok(tags)
}

/// Drop every tag of a repository pointing at `image_hash`.
pub fn delete_tags_for_image<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    image_hash: &str,
) -> Result<(), StrataError> {
    engine.execute(&format!(
        "DELETE FROM {}.tags \
         WHERE namespace = {} AND repository = {} AND image_hash = {}",
        META_SCHEMA,
        quote_literal(&repo.namespace),
        quote_literal(&repo.name),
        quote_literal(image_hash)
    ))
}

// ── cell parsing helpers ─────────────────────────────────────────────────

fn text_cell(cell: Option<Option<String>>) -> Result<String, StrataError> {
    cell.flatten()
        .ok_or_else(|| StrataError::engine("unexpected NULL in catalog row"))
}

fn int_cell(cell: Option<Option<String>>) -> Result<i64, StrataError> {
    text_cell(cell)?
        .parse::<i64>()
        .map_err(|e| StrataError::engine(format!("bad integer in catalog row: {e}")))
}

fn parse_json_cell<T: serde::de::DeserializeOwned>(
    cell: Option<Option<String>>,
) -> Result<T, StrataError> {
    serde_json::from_str(&text_cell(cell)?)
        .map_err(|e| StrataError::engine(format!("bad JSON in catalog row: {e}")))
}

fn opt_literal(value: Option<&str>) -> String {
    match value {
        Some(v) => quote_literal(v),
        None => "NULL".to_string(),
    }
}

fn id_list(ids: &[String]) -> String {
    ids.iter()
        .map(|id| quote_literal(id))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a `timestamptz` as rendered by the server (or as we wrote it).
pub fn parse_timestamptz(raw: &str) -> Result<DateTime<Utc>, StrataError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StrataError::engine(format!("bad timestamp '{raw}': {e}")))
}

// Storage-table naming lives here so the catalog and the fragment store
// agree on it. The server truncates identifiers to 63 bytes, so the table
// name carries a 60-char digest prefix; the full digest stays the object ID.
pub fn object_table_name(object_id: &str) -> String {
    format!("o_{}", &object_id[..object_id.len().min(60)])
}

/// Schema-qualified storage table reference for an object.
pub fn object_table(object_id: &str) -> String {
    qualified(META_SCHEMA, &object_table_name(object_id))
}

/// A throwaway JSON value parse for audit payloads.
pub fn parse_json_text(raw: &str) -> Result<Value, StrataError> {
    serde_json::from_str(raw).map_err(|e| StrataError::engine(format!("bad JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{FakeEngine, text_row};
    use crate::schema::ColumnSpec;
    use chrono::Timelike;

    fn repo() -> Repository {
        Repository::new("acme", "accounts").unwrap()
    }

    fn spec() -> TableSchema {
        TableSchema::new(vec![ColumnSpec {
            ordinal: 1,
            name: "id".into(),
            col_type: "integer".into(),
            is_pk: true,
        }])
    }

    // ── timestamps ──────────────────────────────────────────────────

    #[test]
    fn test_parse_timestamptz_server_format() {
        let ts = parse_timestamptz("2026-08-01 00:31:27.046123+00").unwrap();
        assert_eq!(ts.nanosecond(), 46_123_000);
    }

    #[test]
    fn test_parse_timestamptz_rfc3339() {
        let ts = parse_timestamptz("2026-08-01T00:31:27+00:00").unwrap();
        assert_eq!(ts.second(), 27);
    }

    #[test]
    fn test_parse_timestamptz_rejects_garbage() {
        assert!(parse_timestamptz("yesterday").is_err());
    }

    // ── object naming ───────────────────────────────────────────────

    #[test]
    fn test_object_table_name_fits_identifier_limit() {
        let id = "ab".repeat(32);
        let name = object_table_name(&id);
        assert_eq!(name.len(), 62);
        assert!(name.starts_with("o_ab"));
    }

    // ── SQL assembly against the fake engine ────────────────────────

    #[test]
    fn test_register_object_is_idempotent_upsert() {
        let mut engine = FakeEngine::new();
        register_object(&mut engine, &"a".repeat(64), ObjectKind::Diff, 128, &spec()).unwrap();
        assert!(engine.saw("ON CONFLICT (object_id) DO NOTHING"));
        assert!(engine.saw("'DIFF'"));
    }

    #[test]
    fn test_get_table_pointer_parses_spec_and_chain() {
        let mut engine = FakeEngine::new();
        engine.push_reply(vec![text_row(&[
            r#"[{"ordinal":1,"name":"id","type":"integer","is_pk":true}]"#,
            r#"["aaaa","bbbb"]"#,
        ])]);
        let (spec, chain) = get_table_pointer(&mut engine, &repo(), &"f".repeat(64), "t").unwrap();
        assert_eq!(spec.pk_columns(), vec!["id"]);
        assert_eq!(chain, vec!["aaaa", "bbbb"]);
    }

    #[test]
    fn test_get_table_pointer_missing_is_invalid_reference() {
        let mut engine = FakeEngine::new();
        let err = get_table_pointer(&mut engine, &repo(), &"f".repeat(64), "t").unwrap_err();
        assert!(matches!(err, StrataError::InvalidReference(_)));
    }

    #[test]
    fn test_set_table_pointer_bumps_refcounts() {
        let mut engine = FakeEngine::new();
        let chain = vec!["a".repeat(64), "b".repeat(64)];
        set_table_pointer(&mut engine, &repo(), &"f".repeat(64), "t", &spec(), &chain).unwrap();
        assert!(engine.saw("INSERT INTO pgstrata_meta.tables"));
        assert!(engine.saw("SET refcount = refcount + 1"));
    }

    #[test]
    fn test_unreferenced_objects_checks_chain_membership() {
        let mut engine = FakeEngine::new();
        engine.push_reply(vec![text_row(&["deadbeef"])]);
        let ids = unreferenced_objects(&mut engine).unwrap();
        assert_eq!(ids, vec!["deadbeef"]);
        assert!(engine.saw("t.object_chain ? o.object_id"));
        assert!(engine.saw("refcount <= 0"));
    }

    #[test]
    fn test_read_missing_tag() {
        let mut engine = FakeEngine::new();
        let err = read_tag(&mut engine, &repo(), "v1").unwrap_err();
        assert!(matches!(err, StrataError::MissingTag(_)));
    }

    #[test]
    fn test_write_tag_upserts() {
        let mut engine = FakeEngine::new();
        write_tag(&mut engine, &repo(), "HEAD", &"c".repeat(64)).unwrap();
        assert!(engine.saw("ON CONFLICT (namespace, repository, tag) DO UPDATE"));
    }

    #[test]
    fn test_resolve_hash_prefix_rejects_non_hex() {
        let mut engine = FakeEngine::new();
        let err = resolve_hash_prefix(&mut engine, &repo(), "not-hex!").unwrap_err();
        assert!(matches!(err, StrataError::InvalidReference(_)));
    }

    #[test]
    fn test_resolve_hash_prefix_requires_unique_match() {
        let mut engine = FakeEngine::new();
        engine.push_reply(vec![text_row(&["aa00"]), text_row(&["aa11"])]);
        let err = resolve_hash_prefix(&mut engine, &repo(), "aa").unwrap_err();
        assert!(matches!(err, StrataError::InvalidReference(_)));
    }

    #[test]
    fn test_insert_image_renders_null_parent() {
        let mut engine = FakeEngine::new();
        let image = Image {
            namespace: "acme".into(),
            repository: "accounts".into(),
            hash: "0".repeat(64),
            parent: None,
            created_at: Utc::now(),
            comment: None,
        };
        insert_image(&mut engine, &image).unwrap();
        assert!(engine.statements[0].contains("NULL"));
    }
}
