//! Collections: documents plus the views defined over them.

use crate::blobs::{collection_key, documents_prefix, validate_id, views_prefix};
use crate::database::Shared;
use crate::error::{DbError, Result};
use crate::pipeline::{guard, DocumentChange, DocumentLookup, NoLookup};
use crate::types::{
    CollectionDescriptor, CollectionSettings, CollectionStats, Document, DocumentSet, Identity,
    Timestamp, ViewDefinition, ViewDescriptor,
};
use crate::view::View;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

/// Result of a `put`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PutOutcome {
    /// Ids of stored documents, in input order.
    pub accepted: Vec<String>,
    /// Documents dropped by the on-add hook or for lacking a usable id.
    pub rejected: usize,
}

/// On-disk form of one `put`.
#[derive(Serialize, Deserialize)]
struct DocumentBatch {
    inserted_at: Timestamp,
    documents: Vec<Value>,
}

/// A named set of documents and its views.
///
/// Mutations (put, clear, expiry, view changes) are serialized by a
/// per-collection lock and each one recomputes and publishes every view
/// before the next starts, so subscribers see updates in commit order.
/// Documents are held as an immutable snapshot that readers clone cheaply.
pub struct Collection {
    id: String,
    identity: RwLock<Identity>,
    settings: RwLock<CollectionSettings>,
    documents: RwLock<Arc<DocumentSet>>,
    views: RwLock<Vec<Arc<View>>>,
    write_lock: Mutex<()>,
    shared: Arc<Shared>,
    puts: AtomicU64,
    documents_put: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
    span: Span,
}

impl Collection {
    pub(crate) fn new(descriptor: CollectionDescriptor, shared: Arc<Shared>) -> Self {
        let id = descriptor.identity.id().to_string();
        let span = info_span!("collection", collection = %id);
        Self {
            id,
            identity: RwLock::new(descriptor.identity),
            settings: RwLock::new(descriptor.settings),
            documents: RwLock::new(Arc::new(DocumentSet::new())),
            views: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
            shared,
            puts: AtomicU64::new(0),
            documents_put: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            span,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    pub fn settings(&self) -> CollectionSettings {
        self.settings.read().clone()
    }

    pub fn descriptor(&self) -> CollectionDescriptor {
        CollectionDescriptor {
            identity: self.identity(),
            settings: self.settings(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.settings.read().transient
    }

    pub fn priority(&self) -> Option<i64> {
        self.settings.read().priority
    }

    pub(crate) fn apply_settings(&self, settings: CollectionSettings) {
        *self.settings.write() = settings;
    }

    pub(crate) fn persist_descriptor(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.descriptor())?;
        self.shared.blobs.put(&collection_key(&self.id), &bytes)
    }

    // --- Documents ---

    /// Current document snapshot.
    pub fn documents(&self) -> Arc<DocumentSet> {
        Arc::clone(&self.documents.read())
    }

    pub fn document(&self, id: &str) -> Option<Value> {
        self.documents.read().get(id).map(|d| d.body.clone())
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace documents, then recompute and publish every view.
    ///
    /// Each document runs through the on-add hook (if configured) and gets
    /// its id from the key field, `_id`, or a fresh UUID. A document the hook
    /// rejects, or with an unusable id, is skipped. Non-transient batches are
    /// persisted before they become visible; a storage failure rejects the
    /// whole call and leaves the collection unchanged.
    pub fn put(&self, documents: Vec<Value>) -> Result<PutOutcome> {
        let _enter = self.span.enter();
        let _lock = self.write_lock.lock();

        let settings = self.settings();
        let hook = match &settings.on_add {
            Some(name) => Some(self.shared.pipelines.on_add(name)?),
            None => None,
        };

        let mut outcome = PutOutcome::default();
        let mut accepted = Vec::with_capacity(documents.len());

        for doc in documents {
            let doc = match &hook {
                Some(hook) => match guard(|| hook.on_add(doc)) {
                    Ok(doc) => doc,
                    Err(e) => {
                        warn!(error = %e, "on_add hook failed, skipping document");
                        outcome.rejected += 1;
                        continue;
                    }
                },
                None => doc,
            };

            match assign_id(doc, settings.key.as_deref()) {
                Ok((id, body)) => accepted.push((id, body)),
                Err(msg) => {
                    warn!(reason = %msg, "rejecting document");
                    outcome.rejected += 1;
                }
            }
        }

        self.puts.fetch_add(1, Ordering::Relaxed);
        self.rejected
            .fetch_add(outcome.rejected as u64, Ordering::Relaxed);
        if accepted.is_empty() {
            return Ok(outcome);
        }

        let now = Timestamp::now();
        if !settings.transient {
            self.persist_batch(now, &accepted)?;
        }

        {
            let mut current = self.documents.write();
            let docs = Arc::make_mut(&mut current);
            for (id, body) in &accepted {
                docs.insert(
                    id.clone(),
                    Document {
                        body: body.clone(),
                        inserted_at: now,
                    },
                );
            }
        }

        outcome.accepted = accepted.into_iter().map(|(id, _)| id).collect();
        self.documents_put
            .fetch_add(outcome.accepted.len() as u64, Ordering::Relaxed);

        if let Err(e) = self.sweep_expired_locked(now) {
            warn!(error = %e, "expiry sweep failed");
        }

        debug!(count = outcome.accepted.len(), "documents put");
        self.refresh_views(&DocumentChange::Put(outcome.accepted.clone()));
        Ok(outcome)
    }

    /// Drop all documents.
    ///
    /// `delete_from_disk` also removes persisted batches. `also_destroy_live`
    /// recomputes and publishes the views now; otherwise they keep serving
    /// their current reduction until the next change (as `reload` relies on).
    pub fn clear(&self, delete_from_disk: bool, also_destroy_live: bool) -> Result<()> {
        let _enter = self.span.enter();
        let _lock = self.write_lock.lock();

        if delete_from_disk {
            for name in self.shared.blobs.list(&documents_prefix(&self.id))? {
                self.shared.blobs.delete(&name)?;
            }
        }

        *self.documents.write() = Arc::new(DocumentSet::new());
        info!(delete_from_disk, also_destroy_live, "collection cleared");

        if also_destroy_live {
            self.refresh_views(&DocumentChange::Cleared);
        }
        Ok(())
    }

    /// Re-read documents from storage: `clear(false, false)` then `load_documents`.
    pub fn reload(&self) -> Result<usize> {
        self.clear(false, false)?;
        self.load_documents()
    }

    /// Merge persisted batches into memory and recompute every view.
    pub fn load_documents(&self) -> Result<usize> {
        self.load_documents_inner(false)
    }

    /// Startup variant: with nothing on disk, views keep any restored reduction.
    pub(crate) fn load_documents_at_startup(&self) -> Result<usize> {
        self.load_documents_inner(true)
    }

    fn load_documents_inner(&self, startup: bool) -> Result<usize> {
        let _enter = self.span.enter();
        let _lock = self.write_lock.lock();

        let settings = self.settings();
        let cutoff = expiry_cutoff(&settings, Timestamp::now());
        let names = self.shared.blobs.list(&documents_prefix(&self.id))?;

        let mut loaded = DocumentSet::new();
        let mut batches = 0;
        let mut expired_batches = 0;
        for name in &names {
            let Some(bytes) = self.shared.blobs.get(name)? else {
                continue;
            };
            let batch: DocumentBatch = serde_json::from_slice(&bytes)
                .map_err(|e| DbError::Deserialization(format!("{name}: {e}")))?;

            if cutoff.is_some_and(|c| batch.inserted_at < c) {
                self.expired
                    .fetch_add(batch.documents.len() as u64, Ordering::Relaxed);
                if let Err(e) = self.shared.blobs.delete(name) {
                    warn!(batch = %name, error = %e, "failed to delete expired batch");
                }
                expired_batches += 1;
                continue;
            }

            batches += 1;
            for body in batch.documents {
                match assign_id(body, settings.key.as_deref()) {
                    Ok((id, body)) => {
                        loaded.insert(
                            id,
                            Document {
                                body,
                                inserted_at: batch.inserted_at,
                            },
                        );
                    }
                    Err(msg) => warn!(batch = %name, reason = %msg, "skipping stored document"),
                }
            }
        }

        let count = loaded.len();
        {
            let mut current = self.documents.write();
            Arc::make_mut(&mut current).extend(loaded);
        }
        debug!(documents = count, batches, expired_batches, "documents loaded");

        // A restored reduction stands in for documents that were never persisted
        if !(startup && names.is_empty()) {
            self.refresh_views(&DocumentChange::Loaded);
        }
        Ok(count)
    }

    /// Drop documents older than the configured expiration and recompute.
    /// Returns how many were removed.
    pub fn expire_documents(&self) -> Result<usize> {
        let _enter = self.span.enter();
        let _lock = self.write_lock.lock();

        let removed = self.sweep_expired_locked(Timestamp::now())?;
        if !removed.is_empty() {
            let count = removed.len();
            self.refresh_views(&DocumentChange::Removed(removed));
            return Ok(count);
        }
        Ok(0)
    }

    fn sweep_expired_locked(&self, now: Timestamp) -> Result<Vec<String>> {
        let Some(cutoff) = expiry_cutoff(&self.settings.read(), now) else {
            return Ok(Vec::new());
        };

        let removed: Vec<String> = {
            let mut current = self.documents.write();
            let stale: Vec<String> = current
                .iter()
                .filter(|(_, d)| d.inserted_at < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            if !stale.is_empty() {
                let docs = Arc::make_mut(&mut current);
                for id in &stale {
                    docs.remove(id);
                }
            }
            stale
        };

        let prefix = documents_prefix(&self.id);
        for name in self.shared.blobs.list(&prefix)? {
            if batch_timestamp(&name[prefix.len()..]).is_some_and(|ts| ts < cutoff) {
                self.shared.blobs.delete(&name)?;
            }
        }

        self.expired
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        Ok(removed)
    }

    fn persist_batch(&self, now: Timestamp, documents: &[(String, Value)]) -> Result<()> {
        let batch = DocumentBatch {
            inserted_at: now,
            documents: documents.iter().map(|(_, body)| body.clone()).collect(),
        };
        let name = format!(
            "{}{:020}-{}",
            documents_prefix(&self.id),
            now.0.max(0),
            Uuid::new_v4().simple()
        );
        self.shared.blobs.put(&name, &serde_json::to_vec(&batch)?)
    }

    /// Recompute and publish every view against the current snapshot.
    /// Must be called with the write lock held.
    fn refresh_views(&self, change: &DocumentChange) {
        let snapshot = self.documents();
        let views = self.views.read().clone();
        let catalog = self.shared.catalog.upgrade();
        let lookup: &dyn DocumentLookup = match &catalog {
            Some(catalog) => catalog.as_ref(),
            None => &NoLookup,
        };

        for view in views {
            view.refresh(change, &snapshot, lookup);
        }
    }

    // --- Views ---

    pub fn views(&self) -> Vec<Arc<View>> {
        self.views.read().clone()
    }

    pub fn view(&self, view_id: &str) -> Result<Arc<View>> {
        self.views
            .read()
            .iter()
            .find(|v| v.id() == view_id)
            .cloned()
            .ok_or_else(|| DbError::ViewNotFound(view_id.to_string()))
    }

    /// Define a new view, compute its initial reduction and persist it.
    pub fn add_view(
        &self,
        identity: Option<Identity>,
        definition: ViewDefinition,
    ) -> Result<Arc<View>> {
        let _enter = self.span.enter();
        let _lock = self.write_lock.lock();

        let identity = identity.unwrap_or_default();
        validate_id("view", identity.id())?;
        let catalog = self.shared.catalog.upgrade();
        let taken = self.views.read().iter().any(|v| v.id() == identity.id())
            || catalog
                .as_ref()
                .is_some_and(|c| c.view(identity.id()).is_some());
        if taken {
            return Err(DbError::ViewExists(identity.id().to_string()));
        }

        let view = Arc::new(View::new(
            &self.id,
            ViewDescriptor {
                identity,
                definition,
            },
            Arc::clone(&self.shared),
        )?);
        view.persist_descriptor()?;

        let snapshot = self.documents();
        let lookup: &dyn DocumentLookup = match &catalog {
            Some(catalog) => catalog.as_ref(),
            None => &NoLookup,
        };
        view.recompute_quiet(&snapshot, lookup);

        self.views.write().push(Arc::clone(&view));
        if let Some(catalog) = &catalog {
            catalog.register_view(Arc::clone(&view));
        }
        info!(view = %view.id(), "view added");
        Ok(view)
    }

    /// Replace a view's pipeline, then recompute and publish it.
    pub fn update_view(&self, view_id: &str, definition: ViewDefinition) -> Result<()> {
        let _enter = self.span.enter();
        let _lock = self.write_lock.lock();

        let view = self.view(view_id)?;
        view.redefine(definition)?;
        view.persist_descriptor()?;

        let snapshot = self.documents();
        let catalog = self.shared.catalog.upgrade();
        let lookup: &dyn DocumentLookup = match &catalog {
            Some(catalog) => catalog.as_ref(),
            None => &NoLookup,
        };
        view.refresh(&DocumentChange::DefinitionChanged, &snapshot, lookup);
        Ok(())
    }

    /// Delete a view, its persisted state and all of its subscriptions.
    pub fn remove_view(&self, view_id: &str) -> Result<()> {
        let _enter = self.span.enter();
        let _lock = self.write_lock.lock();

        let view = self.view(view_id)?;
        view.delete_persisted()?;
        self.views.write().retain(|v| v.id() != view_id);
        if let Some(catalog) = self.shared.catalog.upgrade() {
            catalog.unregister_view(view_id);
        }
        view.close();
        Ok(())
    }

    /// Load persisted view descriptors and restore their saved reductions.
    pub(crate) fn load_views(&self) -> Result<usize> {
        let _enter = self.span.enter();
        let _lock = self.write_lock.lock();

        let catalog = self.shared.catalog.upgrade();
        let mut count = 0;
        for name in self.shared.blobs.list(&views_prefix(&self.id))? {
            let Some(bytes) = self.shared.blobs.get(&name)? else {
                continue;
            };
            let descriptor: ViewDescriptor = serde_json::from_slice(&bytes)
                .map_err(|e| DbError::Deserialization(format!("{name}: {e}")))?;

            let view = Arc::new(View::new(&self.id, descriptor, Arc::clone(&self.shared))?);
            view.load_reduction()?;

            self.views.write().push(Arc::clone(&view));
            if let Some(catalog) = &catalog {
                catalog.register_view(view);
            }
            count += 1;
        }

        debug!(views = count, "views loaded");
        Ok(count)
    }

    /// Persist every view's reduction. Returns `(saved, failed)`.
    pub fn save_reductions(&self) -> (usize, usize) {
        let _enter = self.span.enter();
        let mut saved = 0;
        let mut failed = 0;
        for view in self.views() {
            match view.save_reduction() {
                Ok(()) => saved += 1,
                Err(e) => {
                    failed += 1;
                    warn!(view = %view.id(), error = %e, "failed to save reduction");
                }
            }
        }
        (saved, failed)
    }

    /// Close every view and drop them from the database index.
    pub(crate) fn destroy(&self) {
        let _enter = self.span.enter();
        let _lock = self.write_lock.lock();

        let views: Vec<Arc<View>> = std::mem::take(&mut *self.views.write());
        let catalog = self.shared.catalog.upgrade();
        for view in views {
            if let Some(catalog) = &catalog {
                catalog.unregister_view(view.id());
            }
            view.close();
        }
        *self.documents.write() = Arc::new(DocumentSet::new());
    }

    pub fn stats(&self) -> CollectionStats {
        let settings = self.settings();
        CollectionStats {
            collection_id: self.id.clone(),
            documents: self.len(),
            views: self.views.read().len(),
            puts: self.puts.load(Ordering::Relaxed),
            documents_put: self.documents_put.load(Ordering::Relaxed),
            rejected_documents: self.rejected.load(Ordering::Relaxed),
            expired_documents: self.expired.load(Ordering::Relaxed),
            transient: settings.transient,
            priority: settings.priority,
        }
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.id)
            .field("documents", &self.len())
            .field("views", &self.views.read().len())
            .finish()
    }
}

/// Pick (or assign) a document's id.
fn assign_id(doc: Value, key: Option<&str>) -> std::result::Result<(String, Value), String> {
    let Value::Object(mut map) = doc else {
        return Err("document is not an object".to_string());
    };

    let found = key
        .and_then(|k| map.get(k))
        .or_else(|| map.get("_id"))
        .cloned();

    let id = match found {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => return Err(format!("unusable document id {other}")),
        None => {
            let id = Uuid::new_v4().to_string();
            map.insert("_id".to_string(), Value::String(id.clone()));
            id
        }
    };

    Ok((id, Value::Object(map)))
}

fn expiry_cutoff(settings: &CollectionSettings, now: Timestamp) -> Option<Timestamp> {
    settings
        .expiration_ms
        .map(|ms| Timestamp(now.0 - (ms as i64).saturating_mul(1000)))
}

/// Timestamp prefix of a batch blob name (`{micros:020}-{uuid}`).
fn batch_timestamp(name: &str) -> Option<Timestamp> {
    let (digits, _) = name.split_once('-')?;
    digits.parse().ok().map(Timestamp)
}
