//! Database configuration.

use crate::error::Result;
use crate::subscriptions::FrameFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which blob store backs collection and view descriptors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlobBackend {
    /// Process-local, nothing survives a restart.
    Memory,
    /// Files under `path`, with an LRU cache of `cache_size` blobs.
    Filesystem { path: PathBuf, cache_size: usize },
}

/// Encoding used when persisting reductions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionEncoding {
    #[default]
    Json,
    MsgPack,
}

/// Database configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Storage strategy for descriptors, documents and reductions.
    pub blob_backend: BlobBackend,

    /// Require a valid ticket to attach to a view's stream.
    /// Default: false
    pub use_acl_ticket: bool,

    /// Encoding for persisted reductions.
    pub reduction_encoding: ReductionEncoding,

    /// Framing written to subscriber transports.
    pub frame_format: FrameFormat,

    /// Worker threads used to fetch collection descriptors at startup.
    /// Default: 4
    pub load_concurrency: usize,

    /// Upper bound on reduction persistence during shutdown.
    /// Default: 10s
    pub shutdown_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            blob_backend: BlobBackend::Filesystem {
                path: PathBuf::from("./rtdb-data"),
                cache_size: 1000,
            },
            use_acl_ticket: false,
            reduction_encoding: ReductionEncoding::Json,
            frame_format: FrameFormat::Json,
            load_concurrency: 4,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl DatabaseConfig {
    /// In-memory configuration, mostly for tests and embedding.
    pub fn in_memory() -> Self {
        Self {
            blob_backend: BlobBackend::Memory,
            ..Default::default()
        }
    }

    /// Filesystem-backed configuration rooted at `path`.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            blob_backend: BlobBackend::Filesystem {
                path: path.into(),
                cache_size: 1000,
            },
            ..Default::default()
        }
    }

    /// Load a JSON settings file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_file_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            br#"{"use_acl_ticket": true, "blob_backend": {"type": "memory"}, "frame_format": "event_stream"}"#,
        )
        .unwrap();

        let config = DatabaseConfig::from_json_file(&path).unwrap();
        assert!(config.use_acl_ticket);
        assert_eq!(config.blob_backend, BlobBackend::Memory);
        assert_eq!(config.frame_format, FrameFormat::EventStream);
        assert_eq!(config.load_concurrency, 4);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_settings_file() {
        let dir = TempDir::new().unwrap();
        assert!(DatabaseConfig::from_json_file(dir.path().join("nope.json")).is_err());
    }
}
