//! Images, tags and the commit graph.
//!
//! An image is a frozen commit node identified by the SHA-256 of its
//! canonical content (parent hash, table pointer map, timestamp, comment).
//! The parent relation forms a forest per repository; `HEAD` tracks the
//! checked-out image and `latest` the most recently created one. Both are
//! reserved and move only through commit/checkout.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::catalog;
use crate::engine::SqlEngine;
use crate::error::StrataError;
use crate::repository::Repository;

/// Hash of the root image every repository starts from.
pub const ROOT_IMAGE_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Reserved tag tracking the checked-out image.
pub const HEAD_TAG: &str = "HEAD";

/// Reserved tag tracking the most recently created image.
pub const LATEST_TAG: &str = "latest";

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z0-9_-]+$").expect("static regex compiles"));

/// One commit node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub namespace: String,
    pub repository: String,
    /// 64-char lowercase hex.
    pub hash: String,
    /// Absent only on the root image.
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub comment: Option<String>,
}

impl Image {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Digest of an image's canonical content.
///
/// The table map is keyed by table name and serializes sorted, so the digest
/// does not depend on iteration order.
pub fn image_digest(
    parent: Option<&str>,
    tables: &BTreeMap<String, Vec<String>>,
    created_at: &DateTime<Utc>,
    comment: Option<&str>,
) -> String {
    let canonical = serde_json::json!({
        "parent": parent,
        "tables": tables,
        "created_at": created_at.to_rfc3339(),
        "comment": comment,
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

/// Check tag-name syntax (`[A-Za-z0-9_-]+`).
pub fn validate_tag_name(tag: &str) -> Result<(), StrataError> {
    if TAG_RE.is_match(tag) {
        Ok(())
    } else {
        Err(StrataError::InvalidReference(format!(
            "'{tag}' is not a valid tag name (allowed: [A-Za-z0-9_-]+)"
        )))
    }
}

pub fn is_reserved_tag(tag: &str) -> bool {
    tag == HEAD_TAG || tag == LATEST_TAG
}

/// The checked-out image of a repository.
pub fn head<E: SqlEngine>(engine: &mut E, repo: &Repository) -> Result<String, StrataError> {
    catalog::read_tag(engine, repo, HEAD_TAG)
}

/// The most recently created image of a repository.
pub fn latest<E: SqlEngine>(engine: &mut E, repo: &Repository) -> Result<String, StrataError> {
    catalog::read_tag(engine, repo, LATEST_TAG)
}

/// Point a user tag at an image. Reserved tags are refused; those move only
/// through commit and checkout.
pub fn set_tag<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    tag: &str,
    image_hash: &str,
) -> Result<(), StrataError> {
    validate_tag_name(tag)?;
    if is_reserved_tag(tag) {
        return Err(StrataError::InvalidReference(format!(
            "'{tag}' is reserved"
        )));
    }
    if !catalog::image_exists(engine, repo, image_hash)? {
        return Err(StrataError::MissingImage(format!("{repo}:{image_hash}")));
    }
    catalog::write_tag(engine, repo, tag, image_hash)
}

/// Look up a tag.
pub fn get_tag<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    tag: &str,
) -> Result<String, StrataError> {
    catalog::read_tag(engine, repo, tag)
}

/// Resolve a full hash, tag name, or unique hash prefix to an image hash.
pub fn resolve_ref<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    reference: &str,
) -> Result<String, StrataError> {
    let is_hex = !reference.is_empty() && reference.chars().all(|c| c.is_ascii_hexdigit());
    if reference.len() == 64 && is_hex {
        let hash = reference.to_lowercase();
        if catalog::image_exists(engine, repo, &hash)? {
            return Ok(hash);
        }
        return Err(StrataError::MissingImage(format!("{repo}:{reference}")));
    }
    if TAG_RE.is_match(reference) {
        match catalog::read_tag(engine, repo, reference) {
            Ok(hash) => return Ok(hash),
            Err(StrataError::MissingTag(_)) if is_hex => {
                return catalog::resolve_hash_prefix(engine, repo, reference);
            }
            Err(err) => return Err(err),
        }
    }
    Err(StrataError::InvalidReference(format!(
        "'{reference}' is neither an image hash, a hash prefix, nor a tag"
    )))
}

/// Parent of an image, if any.
pub fn parent<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    image_hash: &str,
) -> Result<Option<String>, StrataError> {
    Ok(catalog::get_image(engine, repo, image_hash)?.parent)
}

/// Lazy walk from an image up to the root: the image itself first, then each
/// parent in turn. Finite and not restartable; a parent cycle (corrupted
/// graph) surfaces as `InvalidReference`.
pub fn ancestors<'e, E: SqlEngine>(
    engine: &'e mut E,
    repo: &Repository,
    from: &str,
) -> Ancestors<'e, E> {
    Ancestors {
        engine,
        repo: repo.clone(),
        next: Some(from.to_string()),
        seen: HashSet::new(),
    }
}

pub struct Ancestors<'e, E: SqlEngine> {
    engine: &'e mut E,
    repo: Repository,
    next: Option<String>,
    seen: HashSet<String>,
}

impl<E: SqlEngine> Iterator for Ancestors<'_, E> {
    type Item = Result<Image, StrataError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        if !self.seen.insert(hash.clone()) {
            return Some(Err(StrataError::InvalidReference(format!(
                "parent cycle through image {hash} in {}",
                self.repo
            ))));
        }
        match catalog::get_image(self.engine, &self.repo, &hash) {
            Ok(image) => {
                self.next = image.parent.clone();
                Some(Ok(image))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

/// Delete an image from the graph.
///
/// Refused for the checked-out image and for images with children (the
/// parent relation must stay a forest). Objects whose last reference this
/// releases stay behind as unreferenced rows for the next GC sweep.
pub fn delete_image<E: SqlEngine>(
    engine: &mut E,
    repo: &Repository,
    image_hash: &str,
) -> Result<(), StrataError> {
    if !catalog::image_exists(engine, repo, image_hash)? {
        return Err(StrataError::MissingImage(format!("{repo}:{image_hash}")));
    }
    if let Ok(head_hash) = head(engine, repo) {
        if head_hash == image_hash {
            return Err(StrataError::InvalidReference(format!(
                "image {image_hash} is checked out in {repo}"
            )));
        }
    }
    if catalog::has_children(engine, repo, image_hash)? {
        return Err(StrataError::InvalidReference(format!(
            "image {image_hash} has children in {repo}"
        )));
    }
    catalog::delete_tags_for_image(engine, repo, image_hash)?;
    catalog::drop_table_pointers_for_image(engine, repo, image_hash)?;
    catalog::delete_image_row(engine, repo, image_hash)
}
