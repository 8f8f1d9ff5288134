//! # rtdb
//!
//! A real-time document store. Documents go into named collections, views
//! run map/reduce/finalize pipelines over them, and subscribers receive the
//! live (optionally personalized) reduction whenever it changes, as full
//! snapshots or structural deltas.
//!
//! ## Core Concepts
//!
//! - **Collections**: Named document sets with optional expiry and on-add hooks
//! - **Views**: Pipelines of registered functions producing a live reduction
//! - **Subscriptions**: Push delivery with backpressure coalescing
//! - **Tickets**: Optional per-view access tokens
//! - **Bring-up**: Priority-ordered loading so cross-collection views see their inputs
//!
//! ## Example
//!
//! ```ignore
//! use rtdb::{ChannelTransport, CollectionSettings, Database, DatabaseConfig, Emit, Identity,
//!     PipelineRegistry, ViewDefinition};
//!
//! let mut pipelines = PipelineRegistry::with_builtins();
//! pipelines.register_map("by_a", |doc, _| Ok(vec![Emit::new("sum", doc["a"].clone())]));
//!
//! let db = Database::open(DatabaseConfig::at_path("./data"), pipelines)?;
//! let numbers = db.create_collection(None, CollectionSettings::default())?;
//! let view = numbers.add_view(None, ViewDefinition::new("by_a", "sum"))?;
//!
//! // Subscribe
//! let (transport, frames) = ChannelTransport::bounded(16);
//! frames.bind(view.add_subscription(Identity::new(), transport, false)?);
//!
//! // Every put recomputes and publishes
//! numbers.put(vec![json!({"a": 1}), json!({"a": 2})])?;
//! ```

pub mod blobs;
pub mod collection;
pub mod config;
pub mod database;
pub mod diff;
pub mod error;
pub mod loader;
pub mod pipeline;
pub mod subscriptions;
pub mod tickets;
pub mod types;
pub mod view;

// Re-exports
pub use blobs::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use collection::{Collection, PutOutcome};
pub use config::{BlobBackend, DatabaseConfig, ReductionEncoding};
pub use database::{Database, ShutdownReport, StreamRequest};
pub use diff::Delta;
pub use error::{DbError, ErrorResponse, Result};
pub use loader::{LoadPhase, LoadReport};
pub use pipeline::{
    DocumentLookup, Emit, FinalizeFn, MapFn, OnAddFn, PersonalizeFn, Pipeline, PipelineError,
    PipelineRegistry, PipelineResult, Reduction, ReduceFn, ViewEngine,
};
pub use subscriptions::{
    ChannelTransport, Frame, FrameFormat, FrameReceiver, SubscriptionHandle, SubscriptionId,
    Transport, WriteOutcome,
};
pub use tickets::TicketAuthority;
pub use types::{
    CollectionSettings, CollectionStats, DatabaseInfo, Document, DocumentSet, Identity,
    ReductionShape, Timestamp, ViewDefinition, ViewStats,
};
pub use view::View;
