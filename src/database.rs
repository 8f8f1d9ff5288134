//! Database: the collection catalog, bring-up and shutdown.

use crate::blobs::{
    collection_key, documents_prefix, open_backend, validate_id, views_prefix, BlobStore,
};
use crate::collection::Collection;
use crate::config::DatabaseConfig;
use crate::error::{DbError, Result};
use crate::loader::{LoadOrchestrator, LoadReport};
use crate::pipeline::{DocumentLookup, PipelineRegistry};
use crate::subscriptions::{SubscriptionHandle, SubscriptionId, Transport};
use crate::tickets::TicketAuthority;
use crate::types::{CollectionDescriptor, CollectionSettings, DatabaseInfo, DocumentSet, Identity, Timestamp};
use crate::view::View;
use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{error, info, warn};

/// Dependencies injected into every collection and view.
pub(crate) struct Shared {
    pub(crate) config: DatabaseConfig,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) pipelines: PipelineRegistry,
    pub(crate) tickets: TicketAuthority,
    pub(crate) catalog: Weak<Catalog>,
}

/// Live collections in load order, plus a global view index.
///
/// Lookups clone the `Arc` out and release the lock before the caller
/// touches the collection, so a collection may read the catalog while
/// holding its own write lock.
pub(crate) struct Catalog {
    collections: RwLock<Vec<Arc<Collection>>>,
    views: RwLock<HashMap<String, Arc<View>>>,
}

impl Catalog {
    pub(crate) fn new() -> Self {
        Self {
            collections: RwLock::new(Vec::new()),
            views: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn collection(&self, id: &str) -> Option<Arc<Collection>> {
        self.collections
            .read()
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    pub(crate) fn collections(&self) -> Vec<Arc<Collection>> {
        self.collections.read().clone()
    }

    pub(crate) fn insert_collection(&self, collection: Arc<Collection>) -> Result<()> {
        let mut collections = self.collections.write();
        if collections.iter().any(|c| c.id() == collection.id()) {
            return Err(DbError::CollectionExists(collection.id().to_string()));
        }
        collections.push(collection);
        Ok(())
    }

    pub(crate) fn remove_collection(&self, id: &str) -> Option<Arc<Collection>> {
        let mut collections = self.collections.write();
        let idx = collections.iter().position(|c| c.id() == id)?;
        Some(collections.remove(idx))
    }

    pub(crate) fn view(&self, id: &str) -> Option<Arc<View>> {
        self.views.read().get(id).cloned()
    }

    pub(crate) fn view_count(&self) -> usize {
        self.views.read().len()
    }

    pub(crate) fn register_view(&self, view: Arc<View>) {
        self.views.write().insert(view.id().to_string(), view);
    }

    pub(crate) fn unregister_view(&self, id: &str) {
        self.views.write().remove(id);
    }
}

impl DocumentLookup for Catalog {
    fn documents(&self, collection_id: &str) -> Option<Arc<DocumentSet>> {
        self.collection(collection_id).map(|c| c.documents())
    }
}

/// One view in a multi-view stream request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamRequest {
    pub view_id: String,
    #[serde(default)]
    pub ticket: Option<String>,
}

impl StreamRequest {
    pub fn new(view_id: impl Into<String>) -> Self {
        Self {
            view_id: view_id.into(),
            ticket: None,
        }
    }

    pub fn with_ticket(mut self, ticket: impl Into<String>) -> Self {
        self.ticket = Some(ticket.into());
        self
    }
}

/// Outcome of persisting reductions at shutdown.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub saved: usize,
    pub failed: usize,
    /// Collections skipped because they are transient.
    pub skipped_transient: usize,
    /// Persistence did not finish within the configured timeout.
    pub timed_out: bool,
}

/// A real-time document store.
///
/// Opening a database runs the full bring-up: every persisted collection is
/// loaded in priority order, views first and then documents, and any
/// failure refuses the open.
///
/// # Example
///
/// ```ignore
/// let mut pipelines = PipelineRegistry::with_builtins();
/// pipelines.register_map("by_a", |doc, _| Ok(vec![Emit::new("sum", doc["a"].clone())]));
///
/// let db = Database::open(DatabaseConfig::at_path("./data"), pipelines)?;
/// let numbers = db.create_collection(None, CollectionSettings::default())?;
/// let view = numbers.add_view(None, ViewDefinition::new("by_a", "sum"))?;
///
/// numbers.put(vec![json!({"a": 1}), json!({"a": 2})])?;
/// assert_eq!(view.reduction().value, json!(3));
/// ```
pub struct Database {
    identity: Identity,
    shared: Arc<Shared>,
    catalog: Arc<Catalog>,
    started_at: Timestamp,
    load_report: LoadReport,
}

impl Database {
    /// Open the configured blob backend and load everything in it.
    pub fn open(config: DatabaseConfig, pipelines: PipelineRegistry) -> Result<Self> {
        let blobs = open_backend(&config.blob_backend)?;
        Self::with_blob_store(config, blobs, pipelines)
    }

    /// Open over an already constructed blob store.
    pub fn with_blob_store(
        config: DatabaseConfig,
        blobs: Arc<dyn BlobStore>,
        pipelines: PipelineRegistry,
    ) -> Result<Self> {
        let catalog = Arc::new(Catalog::new());
        let shared = Arc::new(Shared {
            tickets: TicketAuthority::new(config.use_acl_ticket),
            config,
            blobs,
            pipelines,
            catalog: Arc::downgrade(&catalog),
        });

        let load_report = LoadOrchestrator::new(Arc::clone(&shared), Arc::clone(&catalog)).run()?;
        info!(
            collections = load_report.order.len(),
            views = load_report.views,
            documents = load_report.documents,
            "database ready"
        );

        Ok(Self {
            identity: Identity::new(),
            shared,
            catalog,
            started_at: Timestamp::now(),
            load_report,
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.shared.config
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.shared.pipelines
    }

    /// What the bring-up loaded.
    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    // --- Collections ---

    pub fn create_collection(
        &self,
        identity: Option<Identity>,
        settings: CollectionSettings,
    ) -> Result<Arc<Collection>> {
        let identity = identity.unwrap_or_default();
        validate_id("collection", identity.id())?;
        if self.catalog.collection(identity.id()).is_some() {
            return Err(DbError::CollectionExists(identity.id().to_string()));
        }
        if let Some(name) = &settings.on_add {
            self.shared.pipelines.on_add(name)?;
        }

        let collection = Arc::new(Collection::new(
            CollectionDescriptor { identity, settings },
            Arc::clone(&self.shared),
        ));
        collection.persist_descriptor()?;
        self.catalog.insert_collection(Arc::clone(&collection))?;
        info!(collection = %collection.id(), "collection created");
        Ok(collection)
    }

    /// Replace a collection's settings and re-persist its descriptor.
    pub fn update_collection(&self, id: &str, settings: CollectionSettings) -> Result<()> {
        let collection = self.collection(id)?;
        if let Some(name) = &settings.on_add {
            self.shared.pipelines.on_add(name)?;
        }
        collection.apply_settings(settings);
        collection.persist_descriptor()
    }

    /// Delete a collection with all its views, documents and saved state.
    pub fn remove_collection(&self, id: &str) -> Result<()> {
        let collection = self.collection(id)?;
        let blobs = &self.shared.blobs;

        let prefixes = [
            documents_prefix(id),
            views_prefix(id),
            format!("collection/{id}/view/"),
        ];
        for prefix in &prefixes {
            for name in blobs.list(prefix)? {
                blobs.delete(&name)?;
            }
        }
        blobs.delete(&collection_key(id))?;

        self.catalog.remove_collection(id);
        collection.destroy();
        info!(collection = %id, "collection removed");
        Ok(())
    }

    pub fn collection(&self, id: &str) -> Result<Arc<Collection>> {
        self.catalog
            .collection(id)
            .ok_or_else(|| DbError::CollectionNotFound(id.to_string()))
    }

    /// Live collections in load order.
    pub fn collections(&self) -> Vec<Arc<Collection>> {
        self.catalog.collections()
    }

    // --- Views and subscriptions ---

    /// Look up a view by id across all collections.
    pub fn view(&self, id: &str) -> Result<Arc<View>> {
        self.catalog
            .view(id)
            .ok_or_else(|| DbError::ViewNotFound(id.to_string()))
    }

    pub fn subscription(&self, view_id: &str, subscription_id: &SubscriptionId) -> Result<Identity> {
        self.view(view_id)?.subscription(subscription_id)
    }

    /// Attach one transport to several views.
    ///
    /// Unknown views and missing or invalid tickets are reported before
    /// anything is subscribed. A view listed more than once is attached once.
    /// If a later subscribe fails, the handles already created are dropped,
    /// which unsubscribes them, but the snapshots they wrote stay written.
    pub fn open_stream(
        &self,
        requests: &[StreamRequest],
        identity: Identity,
        transport: Arc<dyn Transport>,
        delta: bool,
    ) -> Result<Vec<SubscriptionHandle>> {
        let mut views = Vec::with_capacity(requests.len());
        let mut missing = Vec::new();
        for request in requests {
            match self.catalog.view(&request.view_id) {
                Some(view) => views.push(view),
                None => missing.push(request.view_id.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(DbError::ViewsNotFound(missing));
        }

        if self.shared.tickets.is_enforced() {
            let unticketed: Vec<&str> = requests
                .iter()
                .filter(|r| r.ticket.is_none())
                .map(|r| r.view_id.as_str())
                .collect();
            if !unticketed.is_empty() {
                return Err(DbError::TicketRequired(unticketed.join(", ")));
            }

            let invalid: Vec<String> = requests
                .iter()
                .zip(&views)
                .filter(|(r, view)| !view.check_ticket(r.ticket.as_deref().unwrap_or_default()))
                .map(|(r, _)| r.view_id.clone())
                .collect();
            if !invalid.is_empty() {
                return Err(DbError::InvalidTicket(invalid));
            }
        }

        let mut seen = HashSet::with_capacity(views.len());
        let mut handles = Vec::with_capacity(views.len());
        for view in views.iter().filter(|v| seen.insert(v.id().to_string())) {
            handles.push(view.add_subscription(identity.clone(), Arc::clone(&transport), delta)?);
        }
        Ok(handles)
    }

    // --- Maintenance ---

    /// Expire old documents in every collection. Returns the total removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let mut removed = 0;
        for collection in self.collections() {
            removed += collection.expire_documents()?;
        }
        Ok(removed)
    }

    pub fn info(&self) -> DatabaseInfo {
        let now = Timestamp::now();
        DatabaseInfo {
            identity: self.identity.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            uptime_ms: self.started_at.millis_until(now),
            collections: self.catalog.collections.read().len(),
            views: self.catalog.view_count(),
        }
    }

    /// Persist every non-transient view's reduction, bounded by the
    /// configured shutdown timeout. Failures are logged, never returned.
    pub fn shutdown(&self) -> ShutdownReport {
        let collections = self.collections();
        let timeout = self.shared.config.shutdown_timeout();
        let (tx, rx) = bounded(1);

        let spawned = thread::Builder::new()
            .name("rtdb-shutdown".into())
            .spawn(move || {
                let mut report = ShutdownReport::default();
                for collection in collections {
                    if collection.is_transient() {
                        report.skipped_transient += 1;
                        continue;
                    }
                    let (saved, failed) = collection.save_reductions();
                    report.saved += saved;
                    report.failed += failed;
                }
                let _ = tx.send(report);
            });

        if let Err(e) = spawned {
            error!(error = %e, "failed to start shutdown persistence");
            return ShutdownReport::default();
        }

        match rx.recv_timeout(timeout) {
            Ok(report) => {
                info!(saved = report.saved, failed = report.failed, "reductions persisted");
                report
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "shutdown persistence timed out");
                ShutdownReport {
                    timed_out: true,
                    ..Default::default()
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("shutdown persistence thread panicked");
                ShutdownReport::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::MemoryBlobStore;
    use crate::pipeline::Emit;
    use crate::types::ViewDefinition;
    use serde_json::json;

    fn pipelines() -> PipelineRegistry {
        let mut registry = PipelineRegistry::with_builtins();
        registry.register_map("by_a", |doc, _| {
            Ok(vec![Emit::new("sum", doc["a"].clone())])
        });
        registry
    }

    fn open(blobs: Arc<dyn BlobStore>) -> Database {
        Database::with_blob_store(DatabaseConfig::in_memory(), blobs, pipelines()).unwrap()
    }

    #[test]
    fn test_create_and_lookup_collection() {
        let db = open(Arc::new(MemoryBlobStore::new()));
        let c = db
            .create_collection(Some(Identity::with_id("numbers")), CollectionSettings::default())
            .unwrap();
        assert_eq!(db.collection("numbers").unwrap().id(), c.id());
        assert!(matches!(
            db.create_collection(Some(Identity::with_id("numbers")), CollectionSettings::default()),
            Err(DbError::CollectionExists(_))
        ));
        assert!(matches!(db.collection("nope"), Err(DbError::CollectionNotFound(_))));
    }

    #[test]
    fn test_catalog_lookup_sees_documents() {
        let db = open(Arc::new(MemoryBlobStore::new()));
        let c = db
            .create_collection(Some(Identity::with_id("c")), CollectionSettings::default())
            .unwrap();
        c.put(vec![json!({"_id": "d1", "a": 1})]).unwrap();

        assert_eq!(
            db.catalog.document("c", "d1"),
            Some(json!({"_id": "d1", "a": 1}))
        );
        assert!(db.catalog.documents("missing").is_none());
    }

    #[test]
    fn test_remove_collection_deletes_blobs_and_views() {
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let db = open(Arc::clone(&blobs));
        let c = db
            .create_collection(Some(Identity::with_id("c")), CollectionSettings::default())
            .unwrap();
        let view = c
            .add_view(Some(Identity::with_id("v")), ViewDefinition::new("by_a", "sum"))
            .unwrap();
        c.put(vec![json!({"a": 1})]).unwrap();
        view.save_reduction().unwrap();

        db.remove_collection("c").unwrap();
        assert!(db.view("v").is_err());
        assert!(view.is_removed());
        assert!(blobs.list("collections/").unwrap().is_empty());
        assert!(blobs.list("collection/c/documents/").unwrap().is_empty());
        assert!(blobs.list("collection/c/view/").unwrap().is_empty());
    }

    #[test]
    fn test_shutdown_skips_transient() {
        let db = open(Arc::new(MemoryBlobStore::new()));
        let kept = db.create_collection(None, CollectionSettings::default()).unwrap();
        kept.add_view(None, ViewDefinition::new("by_a", "sum")).unwrap();
        let transient = db
            .create_collection(
                None,
                CollectionSettings {
                    transient: true,
                    ..Default::default()
                },
            )
            .unwrap();
        transient.add_view(None, ViewDefinition::new("by_a", "sum")).unwrap();

        let report = db.shutdown();
        assert_eq!(report.saved, 1);
        assert_eq!(report.skipped_transient, 1);
        assert!(!report.timed_out);
    }
}
