//! Connection-side handle to a live subscription.

use crate::view::View;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

/// Unique identifier for a subscription (the subscriber identity's id).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Held by the transport layer for as long as the connection lives.
///
/// This is the subscription's cancellation signal: [`close`](Self::close)
/// (or dropping the handle) synchronously removes the subscription from its
/// view. [`drain`](Self::drain) reports that the transport has room again.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    view_id: String,
    view: Weak<View>,
    closed: AtomicBool,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: SubscriptionId, view_id: String, view: Weak<View>) -> Self {
        Self {
            id,
            view_id,
            view,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn view_id(&self) -> &str {
        &self.view_id
    }

    /// Send any withheld payload now. Returns whether a frame was written.
    pub fn drain(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match self.view.upgrade() {
            Some(view) => view.drain(&self.id),
            None => false,
        }
    }

    /// End the subscription. Idempotent, and safe after the view is gone.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(view) = self.view.upgrade() {
            view.unsubscribe(&self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("view_id", &self.view_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
