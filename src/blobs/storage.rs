//! Filesystem blob store.

use super::{validate_name, BlobStore};
use crate::error::{DbError, Result};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for blob files.
const BLOB_MAGIC: &[u8; 4] = b"RTB\0";

/// Current blob format version.
const BLOB_VERSION: u8 = 1;

/// Extension for blob files on disk.
const BLOB_EXT: &str = "blob";

/// Header (magic, version, length) plus the CRC footer.
const FRAMING_LEN: u64 = 4 + 1 + 8 + 4;

/// Blob storage rooted at a directory, one file per blob.
///
/// File layout: magic, version, little-endian u64 length, content, crc32.
/// Writes go to a temporary file and are renamed into place.
pub struct FsBlobStore {
    /// Base directory for blobs.
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// LRU cache for recently accessed blobs.
    cache: Mutex<LruCache<String, Vec<u8>>>,
}

impl FsBlobStore {
    /// Open (creating if needed) a blob store at the given path.
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock_file = Self::acquire_lock(&path)?;
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            _lock_file: lock_file,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file.try_lock_exclusive().map_err(|_| DbError::Locked)?;
        Ok(lock_file)
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        let mut path = self.path.join(name).into_os_string();
        path.push(".");
        path.push(BLOB_EXT);
        PathBuf::from(path)
    }

    fn read_file(&self, blob_path: &Path) -> Result<Vec<u8>> {
        let mut file = File::open(blob_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != BLOB_MAGIC {
            return Err(DbError::InvalidFormat("Invalid blob magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != BLOB_VERSION {
            return Err(DbError::InvalidFormat(format!(
                "Unsupported blob version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let content_len = u64::from_le_bytes(len_bytes);

        let available = file.metadata()?.len().saturating_sub(FRAMING_LEN);
        if content_len > available {
            return Err(DbError::InvalidFormat(format!(
                "Blob length {content_len} exceeds file size"
            )));
        }

        let mut content = vec![0u8; content_len as usize];
        file.read_exact(&mut content)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&content);
        if stored != computed {
            return Err(DbError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(content)
    }
}

impl BlobStore for FsBlobStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let (dir, stem_prefix) = match prefix.rfind('/') {
            Some(idx) => (&prefix[..=idx], &prefix[idx + 1..]),
            None => ("", prefix),
        };

        let dir_path = self.path.join(dir);
        if !dir_path.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&dir_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_path = entry.path();
            if file_path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXT) {
                continue;
            }
            if let Some(stem) = file_path.file_stem().and_then(|s| s.to_str()) {
                if stem.starts_with(stem_prefix) {
                    names.push(format!("{dir}{stem}"));
                }
            }
        }

        names.sort();
        Ok(names)
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        validate_name(name)?;

        if let Some(cached) = self.cache.lock().get(name).cloned() {
            return Ok(Some(cached));
        }

        let blob_path = self.blob_path(name);
        if !blob_path.exists() {
            return Ok(None);
        }

        let content = self.read_file(&blob_path)?;
        self.cache.lock().put(name.to_string(), content.clone());
        Ok(Some(content))
    }

    fn put(&self, name: &str, content: &[u8]) -> Result<()> {
        validate_name(name)?;

        let blob_path = self.blob_path(name);
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = blob_path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(BLOB_MAGIC)?;
            file.write_all(&[BLOB_VERSION])?;
            file.write_all(&(content.len() as u64).to_le_bytes())?;
            file.write_all(content)?;
            file.write_all(&crc32fast::hash(content).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &blob_path)?;

        self.cache.lock().put(name.to_string(), content.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        self.cache.lock().pop(name);

        let blob_path = self.blob_path(name);
        if blob_path.exists() {
            fs::remove_file(&blob_path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
