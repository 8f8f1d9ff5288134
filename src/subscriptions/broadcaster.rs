//! Pushes a view's reduction to its subscribers.

use super::handle::SubscriptionId;
use super::transport::{Frame, FrameFormat, Transport, WriteOutcome};
use crate::diff::diff;
use crate::error::{DbError, Result};
use crate::pipeline::{Personalizer, ViewEngine};
use crate::types::Identity;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Internal subscription state.
struct Subscription {
    identity: Identity,
    transport: Arc<dyn Transport>,
    delta: bool,
    /// Last payload the transport accepted (delta mode only).
    last_sent: Option<Value>,
    /// Latest payload withheld while overflowing.
    pending: Option<Value>,
    overflowing: bool,
}

enum Sent {
    Written,
    Withheld,
    Closed,
}

/// Subscriber set and delivery policy for one view.
///
/// Every operation takes the per-view subscriber lock, so subscribe,
/// publish, drain and unsubscribe on one view are mutually exclusive while
/// different views never contend. Transports must not block in `write`.
pub struct SubscriptionBroadcaster {
    view_id: String,
    format: FrameFormat,
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    closed: AtomicBool,
    publishes: AtomicU64,
    writes: AtomicU64,
    withheld: AtomicU64,
}

impl SubscriptionBroadcaster {
    pub fn new(view_id: impl Into<String>, format: FrameFormat) -> Self {
        Self {
            view_id: view_id.into(),
            format,
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            publishes: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            withheld: AtomicU64::new(0),
        }
    }

    /// Register a subscriber and write its first frame, always a full
    /// snapshot of the current personalized reduction.
    pub fn subscribe(
        &self,
        engine: &ViewEngine,
        identity: Identity,
        transport: Arc<dyn Transport>,
        delta: bool,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId(identity.id().to_string());
        let mut subs = self.subscriptions.lock();

        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::ViewNotFound(self.view_id.clone()));
        }
        if subs.contains_key(&id) {
            return Err(DbError::InvalidOperation(format!(
                "subscription {id} already attached to view {}",
                self.view_id
            )));
        }

        // Read the reduction under the lock so a concurrent publish either
        // precedes this snapshot or sees the new subscriber.
        let payload = engine.personalizer().personalize(&engine.reduction(), &identity);
        let mut sub = Subscription {
            identity,
            transport,
            delta,
            last_sent: None,
            pending: None,
            overflowing: false,
        };

        match self.send(&mut sub, payload)? {
            Sent::Closed => Err(DbError::Transport(format!(
                "transport closed before first frame for subscription {id}"
            ))),
            _ => {
                debug!(view = %self.view_id, subscription = %id, delta, "subscribed");
                subs.insert(id.clone(), sub);
                Ok(id)
            }
        }
    }

    /// Deliver the current reduction to every subscriber. Returns the number
    /// of frames written.
    ///
    /// Overflowing subscribers are not written to; their withheld payload is
    /// replaced by the newest one, to be sent on drain.
    pub fn publish(&self, engine: &ViewEngine) -> usize {
        let mut subs = self.subscriptions.lock();
        self.publishes.fetch_add(1, Ordering::Relaxed);
        if subs.is_empty() {
            return 0;
        }

        let reduction = engine.reduction();
        let personalizer: Personalizer = engine.personalizer();
        let mut written = 0;
        let mut gone = Vec::new();

        for (id, sub) in subs.iter_mut() {
            let payload = personalizer.personalize(&reduction, &sub.identity);

            if sub.overflowing {
                sub.pending = Some(payload);
                self.withheld.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match self.send(sub, payload) {
                Ok(Sent::Written) => written += 1,
                Ok(Sent::Withheld) => {
                    debug!(view = %self.view_id, subscription = %id, "subscriber overflowing");
                }
                Ok(Sent::Closed) => gone.push(id.clone()),
                Err(e) => {
                    warn!(view = %self.view_id, subscription = %id, error = %e, "failed to encode frame");
                }
            }
        }

        for id in gone {
            debug!(view = %self.view_id, subscription = %id, "transport closed, removing");
            subs.remove(&id);
        }

        written
    }

    /// The subscriber's transport has room again. Sends the withheld payload,
    /// if any, under the same snapshot/delta policy as `publish`.
    pub fn drain(&self, id: &SubscriptionId) -> bool {
        let mut subs = self.subscriptions.lock();
        let Some(sub) = subs.get_mut(id) else {
            return false;
        };

        let Some(payload) = sub.pending.take() else {
            sub.overflowing = false;
            return false;
        };

        match self.send(sub, payload) {
            Ok(Sent::Written) => {
                debug!(view = %self.view_id, subscription = %id, "drained");
                true
            }
            Ok(Sent::Withheld) => false,
            Ok(Sent::Closed) => {
                subs.remove(id);
                false
            }
            Err(e) => {
                warn!(view = %self.view_id, subscription = %id, error = %e, "failed to encode frame");
                false
            }
        }
    }

    /// Remove a subscriber. Idempotent.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self.subscriptions.lock().remove(id).is_some();
        if removed {
            debug!(view = %self.view_id, subscription = %id, "unsubscribed");
        }
        removed
    }

    /// Drop every subscriber and refuse new ones. Returns how many were dropped.
    pub fn close(&self) -> usize {
        let mut subs = self.subscriptions.lock();
        self.closed.store(true, Ordering::SeqCst);
        let count = subs.len();
        subs.clear();
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn identity(&self, id: &SubscriptionId) -> Option<Identity> {
        self.subscriptions.lock().get(id).map(|s| s.identity.clone())
    }

    pub fn identities(&self) -> Vec<Identity> {
        let subs = self.subscriptions.lock();
        let mut list: Vec<Identity> = subs.values().map(|s| s.identity.clone()).collect();
        list.sort_by(|a, b| a.id().cmp(b.id()));
        list
    }

    pub fn is_overflowing(&self, id: &SubscriptionId) -> Option<bool> {
        self.subscriptions.lock().get(id).map(|s| s.overflowing)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overflowing(&self) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|s| s.overflowing)
            .count()
    }

    pub fn publishes(&self) -> u64 {
        self.publishes.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn withheld(&self) -> u64 {
        self.withheld.load(Ordering::Relaxed)
    }

    /// Write `payload` to one subscriber, as a delta against the last
    /// accepted payload when possible.
    fn send(&self, sub: &mut Subscription, payload: Value) -> Result<Sent> {
        let data = match (&sub.last_sent, sub.delta) {
            (Some(last), true) => serde_json::to_value(diff(last, &payload))?,
            _ => payload.clone(),
        };
        let frame = Frame {
            event: self.view_id.clone(),
            data,
        };
        let bytes = frame.encode(self.format)?;

        match sub.transport.write(&bytes) {
            WriteOutcome::Accepted => {
                sub.last_sent = if sub.delta { Some(payload) } else { None };
                sub.pending = None;
                sub.overflowing = false;
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(Sent::Written)
            }
            WriteOutcome::Backpressure => {
                sub.overflowing = true;
                sub.pending = Some(payload);
                self.withheld.fetch_add(1, Ordering::Relaxed);
                Ok(Sent::Withheld)
            }
            WriteOutcome::Closed => Ok(Sent::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{apply, Delta};
    use crate::pipeline::{DocumentLookup, Emit, NoLookup, PipelineRegistry};
    use crate::types::{Document, DocumentSet, Timestamp, ViewDefinition};
    use serde_json::json;
    use std::collections::VecDeque;

    /// Transport that records accepted frames and replays scripted outcomes.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<WriteOutcome>>,
        frames: Mutex<Vec<Frame>>,
    }

    impl ScriptedTransport {
        fn with_script(outcomes: &[WriteOutcome]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outcomes.iter().copied().collect()),
                frames: Mutex::new(Vec::new()),
            })
        }

        fn data(&self) -> Vec<Value> {
            self.frames.lock().iter().map(|f| f.data.clone()).collect()
        }
    }

    impl Transport for ScriptedTransport {
        fn write(&self, frame: &[u8]) -> WriteOutcome {
            let outcome = self.script.lock().pop_front().unwrap_or(WriteOutcome::Accepted);
            if outcome == WriteOutcome::Accepted {
                self.frames
                    .lock()
                    .push(Frame::decode(frame, FrameFormat::Json).unwrap());
            }
            outcome
        }
    }

    fn engine() -> ViewEngine {
        let mut registry = PipelineRegistry::with_builtins();
        registry.register_map("by_a", |doc: &Value, _: &dyn DocumentLookup| {
            Ok(vec![Emit::new("sum", doc["a"].clone())])
        });
        ViewEngine::new("v1", registry.resolve(&ViewDefinition::new("by_a", "sum")).unwrap())
    }

    fn set_docs(engine: &ViewEngine, values: &[i64]) {
        let docs: DocumentSet = values
            .iter()
            .enumerate()
            .map(|(i, a)| {
                (
                    format!("d{i}"),
                    Document {
                        body: json!({"a": a}),
                        inserted_at: Timestamp::now(),
                    },
                )
            })
            .collect();
        engine.recompute(&docs, &NoLookup).unwrap();
    }

    #[test]
    fn test_snapshot_then_one_write_per_publish() {
        let engine = engine();
        set_docs(&engine, &[1, 2, 3]);
        let broadcaster = SubscriptionBroadcaster::new("v1", FrameFormat::Json);
        let transport = ScriptedTransport::with_script(&[]);

        broadcaster
            .subscribe(&engine, Identity::new(), transport.clone(), false)
            .unwrap();
        set_docs(&engine, &[1, 2, 3, 4]);
        assert_eq!(broadcaster.publish(&engine), 1);

        assert_eq!(transport.data(), vec![json!(6), json!(10)]);
        assert_eq!(broadcaster.writes(), 2);
    }

    #[test]
    fn test_delta_mode_sends_diffs_after_snapshot() {
        let engine = engine();
        set_docs(&engine, &[1]);
        let broadcaster = SubscriptionBroadcaster::new("v1", FrameFormat::Json);
        let transport = ScriptedTransport::with_script(&[]);

        broadcaster
            .subscribe(&engine, Identity::new(), transport.clone(), true)
            .unwrap();
        set_docs(&engine, &[1, 5]);
        broadcaster.publish(&engine);

        let data = transport.data();
        assert_eq!(data[0], json!(1));
        let delta: Delta = serde_json::from_value(data[1].clone()).unwrap();
        assert_eq!(apply(&data[0], &delta).unwrap(), json!(6));
    }

    #[test]
    fn test_overflow_coalesces_to_latest() {
        let engine = engine();
        set_docs(&engine, &[1]);
        let broadcaster = SubscriptionBroadcaster::new("v1", FrameFormat::Json);
        // snapshot accepted, first publish rejected
        let transport = ScriptedTransport::with_script(&[
            WriteOutcome::Accepted,
            WriteOutcome::Backpressure,
        ]);

        let id = broadcaster
            .subscribe(&engine, Identity::new(), transport.clone(), true)
            .unwrap();

        set_docs(&engine, &[1, 1]);
        assert_eq!(broadcaster.publish(&engine), 0);
        assert_eq!(broadcaster.is_overflowing(&id), Some(true));

        set_docs(&engine, &[1, 1, 1]);
        assert_eq!(broadcaster.publish(&engine), 0);
        assert_eq!(transport.data().len(), 1);

        assert!(broadcaster.drain(&id));
        assert_eq!(broadcaster.is_overflowing(&id), Some(false));

        let data = transport.data();
        assert_eq!(data.len(), 2);
        // diffed from the last accepted payload, straight to the latest state
        let delta: Delta = serde_json::from_value(data[1].clone()).unwrap();
        assert_eq!(apply(&data[0], &delta).unwrap(), json!(3));

        assert!(!broadcaster.drain(&id));
    }

    #[test]
    fn test_closed_transport_is_removed() {
        let engine = engine();
        let broadcaster = SubscriptionBroadcaster::new("v1", FrameFormat::Json);
        let transport =
            ScriptedTransport::with_script(&[WriteOutcome::Accepted, WriteOutcome::Closed]);
        let healthy = ScriptedTransport::with_script(&[]);

        broadcaster
            .subscribe(&engine, Identity::new(), transport, false)
            .unwrap();
        broadcaster
            .subscribe(&engine, Identity::new(), healthy.clone(), false)
            .unwrap();

        assert_eq!(broadcaster.publish(&engine), 1);
        assert_eq!(broadcaster.len(), 1);
        assert_eq!(healthy.data().len(), 2);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let engine = engine();
        let broadcaster = SubscriptionBroadcaster::new("v1", FrameFormat::Json);
        let id = broadcaster
            .subscribe(&engine, Identity::new(), ScriptedTransport::with_script(&[]), false)
            .unwrap();

        assert!(broadcaster.unsubscribe(&id));
        assert!(!broadcaster.unsubscribe(&id));
        assert!(broadcaster.is_empty());
    }

    #[test]
    fn test_closed_broadcaster_rejects_subscribers() {
        let engine = engine();
        let broadcaster = SubscriptionBroadcaster::new("v1", FrameFormat::Json);
        broadcaster
            .subscribe(&engine, Identity::new(), ScriptedTransport::with_script(&[]), false)
            .unwrap();

        assert_eq!(broadcaster.close(), 1);
        let err = broadcaster
            .subscribe(&engine, Identity::new(), ScriptedTransport::with_script(&[]), false)
            .unwrap_err();
        assert!(matches!(err, DbError::ViewNotFound(_)));
    }
}
