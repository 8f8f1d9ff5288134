//! Pluggable named-blob storage.
//!
//! Collection descriptors, view descriptors, document batches and saved
//! reductions all live in a [`BlobStore`] under slash-separated names:
//!
//! - `collections/{cid}`
//! - `collection/{cid}/views/{vid}`
//! - `collection/{cid}/view/{vid}` (saved reduction)
//! - `collection/{cid}/documents/{batch}`
//!
//! The concrete backend is chosen once from [`BlobBackend`] when the
//! database is opened.

mod memory;
mod storage;

pub use memory::MemoryBlobStore;
pub use storage::FsBlobStore;

use crate::config::BlobBackend;
use crate::error::{DbError, Result};
use std::sync::Arc;

/// Named byte-blob storage. Implementations may be slow and may fail.
pub trait BlobStore: Send + Sync {
    /// Names directly under `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Fetch a blob; `None` if it does not exist.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace a blob.
    fn put(&self, name: &str, content: &[u8]) -> Result<()>;

    /// Delete a blob. Returns whether it existed.
    fn delete(&self, name: &str) -> Result<bool>;
}

/// Construct the configured backend.
pub fn open_backend(backend: &BlobBackend) -> Result<Arc<dyn BlobStore>> {
    match backend {
        BlobBackend::Memory => Ok(Arc::new(MemoryBlobStore::new())),
        BlobBackend::Filesystem { path, cache_size } => {
            Ok(Arc::new(FsBlobStore::open(path, *cache_size)?))
        }
    }
}

/// Reject names that could escape the store root or collide with directories.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return Err(DbError::InvalidOperation(format!("invalid blob name: {name:?}")));
    }
    for segment in name.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(DbError::InvalidOperation(format!("invalid blob name: {name:?}")));
        }
    }
    Ok(())
}

/// Collection and view ids become single name segments in the layout above.
pub(crate) fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') || id == "." || id == ".." {
        return Err(DbError::InvalidOperation(format!("invalid {kind} id: {id:?}")));
    }
    Ok(())
}

pub const COLLECTIONS_PREFIX: &str = "collections/";

pub fn collection_key(cid: &str) -> String {
    format!("{COLLECTIONS_PREFIX}{cid}")
}

pub fn views_prefix(cid: &str) -> String {
    format!("collection/{cid}/views/")
}

pub fn view_key(cid: &str, vid: &str) -> String {
    format!("collection/{cid}/views/{vid}")
}

pub fn reduction_key(cid: &str, vid: &str) -> String {
    format!("collection/{cid}/view/{vid}")
}

pub fn documents_prefix(cid: &str) -> String {
    format!("collection/{cid}/documents/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(collection_key("c1"), "collections/c1");
        assert_eq!(reduction_key("c1", "v1"), "collection/c1/view/v1");
        assert_eq!(view_key("c1", "v1"), "collection/c1/views/v1");
        assert!(view_key("c1", "v1").starts_with(&views_prefix("c1")));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("collections/c1").is_ok());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("/abs").is_err());
        assert!(validate_name("a//b").is_err());
        assert!(validate_name("dir/").is_err());
        assert!(validate_name("").is_err());
    }
}
