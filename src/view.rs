//! A live map/reduce view over one collection.

use crate::blobs::{reduction_key, view_key};
use crate::config::ReductionEncoding;
use crate::database::Shared;
use crate::error::{DbError, Result};
use crate::pipeline::{DocumentChange, DocumentLookup, Reduction, ViewEngine};
use crate::subscriptions::{SubscriptionBroadcaster, SubscriptionHandle, SubscriptionId, Transport};
use crate::types::{DocumentSet, Identity, ViewDefinition, ViewDescriptor, ViewStats};
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Span};

/// A view: pipeline, live reduction and subscribers.
///
/// Owned by its collection. Subscriptions hold only a weak reference, so a
/// removed view is released even while connections are still open.
pub struct View {
    id: String,
    collection_id: String,
    identity: RwLock<Identity>,
    definition: RwLock<ViewDefinition>,
    engine: ViewEngine,
    broadcaster: SubscriptionBroadcaster,
    shared: Arc<Shared>,
    span: Span,
}

impl View {
    pub(crate) fn new(
        collection_id: &str,
        descriptor: ViewDescriptor,
        shared: Arc<Shared>,
    ) -> Result<Self> {
        let pipeline = shared.pipelines.resolve(&descriptor.definition)?;
        let id = descriptor.identity.id().to_string();
        let span = info_span!("view", view = %id, collection = %collection_id);

        Ok(Self {
            engine: ViewEngine::new(id.clone(), pipeline),
            broadcaster: SubscriptionBroadcaster::new(id.clone(), shared.config.frame_format),
            id,
            collection_id: collection_id.to_string(),
            identity: RwLock::new(descriptor.identity),
            definition: RwLock::new(descriptor.definition),
            shared,
            span,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    /// Set a metadata entry on the view's identity (not persisted until the
    /// view is next updated).
    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.identity.write().set(key, value);
    }

    pub fn definition(&self) -> ViewDefinition {
        self.definition.read().clone()
    }

    pub fn descriptor(&self) -> ViewDescriptor {
        ViewDescriptor {
            identity: self.identity(),
            definition: self.definition(),
        }
    }

    /// Current reduction.
    pub fn reduction(&self) -> Arc<Reduction> {
        self.engine.reduction()
    }

    /// Current reduction as `subscriber` would receive it.
    pub fn personalized(&self, subscriber: &Identity) -> Value {
        self.engine
            .personalizer()
            .personalize(&self.engine.reduction(), subscriber)
    }

    pub fn stats(&self) -> ViewStats {
        let reduction = self.engine.reduction();
        ViewStats {
            view_id: self.id.clone(),
            subscriptions: self.broadcaster.len(),
            overflowing: self.broadcaster.overflowing(),
            recomputes: self.engine.recomputes(),
            failed_passes: self.engine.failed_passes(),
            skipped_documents: self.engine.skipped_documents(),
            last_recompute_micros: self.engine.last_recompute_micros(),
            publishes: self.broadcaster.publishes(),
            writes: self.broadcaster.writes(),
            withheld_writes: self.broadcaster.withheld(),
            reduction_generation: reduction.generation,
            reduction_digest: reduction.digest(),
            computed_at: reduction.computed_at,
        }
    }

    // --- Tickets ---

    /// Access token for this view, generated on first request.
    pub fn issue_ticket(&self) -> String {
        self.shared.tickets.issue(&self.id)
    }

    /// Whether `token` grants access (always true with enforcement off).
    pub fn check_ticket(&self, token: &str) -> bool {
        self.shared.tickets.validate(&self.id, token)
    }

    // --- Subscriptions ---

    /// Attach a subscriber. The current personalized reduction is written
    /// immediately as a full snapshot.
    pub fn add_subscription(
        self: &Arc<Self>,
        identity: Identity,
        transport: Arc<dyn Transport>,
        delta: bool,
    ) -> Result<SubscriptionHandle> {
        let _enter = self.span.enter();
        let id = self
            .broadcaster
            .subscribe(&self.engine, identity, transport, delta)?;
        Ok(SubscriptionHandle::new(id, self.id.clone(), Arc::downgrade(self)))
    }

    /// Remove a subscriber. Idempotent.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.broadcaster.unsubscribe(id)
    }

    /// Transport for `id` has room again.
    pub fn drain(&self, id: &SubscriptionId) -> bool {
        let _enter = self.span.enter();
        self.broadcaster.drain(id)
    }

    /// Identities of current subscribers.
    pub fn subscriptions(&self) -> Vec<Identity> {
        self.broadcaster.identities()
    }

    pub fn subscription(&self, id: &SubscriptionId) -> Result<Identity> {
        self.broadcaster
            .identity(id)
            .ok_or_else(|| DbError::SubscriptionNotFound(id.to_string()))
    }

    pub fn is_removed(&self) -> bool {
        self.broadcaster.is_closed()
    }

    // --- Persistence ---

    /// Persist the current reduction at `collection/{cid}/view/{vid}`.
    pub fn save_reduction(&self) -> Result<()> {
        let _enter = self.span.enter();
        let reduction = self.engine.reduction();
        let bytes = match self.shared.config.reduction_encoding {
            ReductionEncoding::Json => serde_json::to_vec(&*reduction)?,
            ReductionEncoding::MsgPack => rmp_serde::to_vec_named(&*reduction)?,
        };
        let key = reduction_key(&self.collection_id, &self.id);
        self.shared.blobs.put(&key, &bytes)?;
        debug!(key = %key, generation = reduction.generation, "saved reduction");
        Ok(())
    }

    /// Restore a saved reduction, if one exists and decodes. Returns whether
    /// one was installed.
    pub(crate) fn load_reduction(&self) -> Result<bool> {
        let _enter = self.span.enter();
        let key = reduction_key(&self.collection_id, &self.id);
        let Some(bytes) = self.shared.blobs.get(&key)? else {
            return Ok(false);
        };

        let decoded: Result<Reduction> = match self.shared.config.reduction_encoding {
            ReductionEncoding::Json => serde_json::from_slice(&bytes)
                .map_err(|e| DbError::Deserialization(e.to_string())),
            ReductionEncoding::MsgPack => rmp_serde::from_slice(&bytes).map_err(DbError::from),
        };

        match decoded {
            Ok(reduction) => {
                debug!(generation = reduction.generation, "restored saved reduction");
                self.engine.restore(reduction);
                Ok(true)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "ignoring unreadable saved reduction");
                Ok(false)
            }
        }
    }

    pub(crate) fn persist_descriptor(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.descriptor())?;
        self.shared
            .blobs
            .put(&view_key(&self.collection_id, &self.id), &bytes)
    }

    pub(crate) fn delete_persisted(&self) -> Result<()> {
        self.shared
            .blobs
            .delete(&view_key(&self.collection_id, &self.id))?;
        self.shared
            .blobs
            .delete(&reduction_key(&self.collection_id, &self.id))?;
        Ok(())
    }

    // --- Engine ---

    /// Recompute and, on success, publish to subscribers. A failed pass
    /// keeps the previous reduction and publishes nothing.
    pub(crate) fn refresh(
        &self,
        change: &DocumentChange,
        documents: &DocumentSet,
        lookup: &dyn DocumentLookup,
    ) -> bool {
        let _enter = self.span.enter();
        match self.engine.on_document_change(change, documents, lookup) {
            Ok(_) => {
                self.broadcaster.publish(&self.engine);
                true
            }
            Err(_) => false,
        }
    }

    /// Recompute without publishing (bring-up, before anyone can subscribe).
    pub(crate) fn recompute_quiet(
        &self,
        documents: &DocumentSet,
        lookup: &dyn DocumentLookup,
    ) -> bool {
        let _enter = self.span.enter();
        self.engine.recompute(documents, lookup).is_ok()
    }

    /// Swap pipeline functions.
    pub(crate) fn redefine(&self, definition: ViewDefinition) -> Result<()> {
        let pipeline = self.shared.pipelines.resolve(&definition)?;
        self.engine.set_pipeline(pipeline);
        *self.definition.write() = definition;
        Ok(())
    }

    /// Drop every subscriber and refuse new ones.
    pub(crate) fn close(&self) {
        let _enter = self.span.enter();
        let dropped = self.broadcaster.close();
        self.shared.tickets.revoke(&self.id);
        info!(subscriptions = dropped, "view closed");
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id)
            .field("collection_id", &self.collection_id)
            .field("subscriptions", &self.broadcaster.len())
            .field("generation", &self.engine.reduction().generation)
            .finish()
    }
}
