//! Core types for the document store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generic entity descriptor: an immutable unique id plus a metadata bag.
///
/// Serialized flat, with the id under `_id`, so descriptors written by
/// older deployments (and arbitrary client metadata) round-trip unchanged.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "_id")]
    id: String,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Identity {
    /// Fresh identity with a random id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Identity with a caller-chosen id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: Map::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Builder-style metadata insert.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.id)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// Milliseconds elapsed between `self` and `later` (zero if `later` is earlier).
    pub fn millis_until(self, later: Timestamp) -> u64 {
        ((later.0 - self.0).max(0) / 1000) as u64
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A stored document and when it was inserted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub body: Value,
    pub inserted_at: Timestamp,
}

/// A collection's documents keyed by document id, in id order.
pub type DocumentSet = BTreeMap<String, Document>;

/// Mutable settings of a collection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    /// Document field used as the document id (falls back to `_id`).
    pub key: Option<String>,
    /// Keep documents in memory only; never persist them or their reductions.
    pub transient: bool,
    /// Load order; lower loads first, `None` loads after every prioritized collection.
    pub priority: Option<i64>,
    /// Documents older than this many milliseconds are dropped.
    pub expiration_ms: Option<u64>,
    /// Name of a registered hook applied to each document before insertion.
    pub on_add: Option<String>,
}

/// Persisted form of a collection, stored at `collections/{id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub identity: Identity,
    #[serde(default)]
    pub settings: CollectionSettings,
}

/// How per-key reduce results are combined before finalize.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionShape {
    /// A pass whose emissions all share one key hands finalize that key's
    /// reduced value. Any other pass gets an object keyed by emission key.
    #[default]
    Auto,
    /// Always an object keyed by emission key, even for a single key.
    Keyed,
}

/// Names of the registered pipeline functions a view runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewDefinition {
    pub map: String,
    pub reduce: String,
    pub finalize: Option<String>,
    pub personalize: Option<String>,
    pub shape: ReductionShape,
}

impl ViewDefinition {
    pub fn new(map: impl Into<String>, reduce: impl Into<String>) -> Self {
        Self {
            map: map.into(),
            reduce: reduce.into(),
            finalize: None,
            personalize: None,
            shape: ReductionShape::Auto,
        }
    }

    pub fn finalize(mut self, name: impl Into<String>) -> Self {
        self.finalize = Some(name.into());
        self
    }

    pub fn personalize(mut self, name: impl Into<String>) -> Self {
        self.personalize = Some(name.into());
        self
    }

    /// Keep the keyed object shape regardless of how many keys were emitted.
    pub fn keyed(mut self) -> Self {
        self.shape = ReductionShape::Keyed;
        self
    }
}

/// Persisted form of a view, stored at `collection/{cid}/views/{vid}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewDescriptor {
    pub identity: Identity,
    pub definition: ViewDefinition,
}

/// Point-in-time counters for a collection.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    pub collection_id: String,
    pub documents: usize,
    pub views: usize,
    pub puts: u64,
    pub documents_put: u64,
    pub rejected_documents: u64,
    pub expired_documents: u64,
    pub transient: bool,
    pub priority: Option<i64>,
}

/// Point-in-time counters for a view.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ViewStats {
    pub view_id: String,
    pub subscriptions: usize,
    pub overflowing: usize,
    pub recomputes: u64,
    pub failed_passes: u64,
    pub skipped_documents: u64,
    pub last_recompute_micros: u64,
    pub publishes: u64,
    pub writes: u64,
    pub withheld_writes: u64,
    pub reduction_generation: u64,
    pub reduction_digest: String,
    pub computed_at: Timestamp,
}

/// Database-wide information for admin endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub identity: Identity,
    pub version: String,
    pub started_at: Timestamp,
    pub uptime_ms: u64,
    pub collections: usize,
    pub views: usize,
}
