//! In-memory blob store.

use super::{validate_name, BlobStore};
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Blob store kept entirely in process memory.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.read();
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .filter(|(name, _)| !name[prefix.len()..].contains('/'))
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        validate_name(name)?;
        Ok(self.blobs.read().get(name).cloned())
    }

    fn put(&self, name: &str, content: &[u8]) -> Result<()> {
        validate_name(name)?;
        self.blobs.write().insert(name.to_string(), content.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(self.blobs.write().remove(name).is_some())
    }
}
