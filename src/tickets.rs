//! Per-view access tickets.

use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Issues and checks opaque per-view tokens.
///
/// A view's token is generated on first request and kept for the life of
/// the process. With enforcement off every check passes.
pub struct TicketAuthority {
    enforce: bool,
    tokens: RwLock<HashMap<String, String>>,
}

impl TicketAuthority {
    pub fn new(enforce: bool) -> Self {
        Self {
            enforce,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enforced(&self) -> bool {
        self.enforce
    }

    /// Token for `view_id`, generated on first call.
    pub fn issue(&self, view_id: &str) -> String {
        if let Some(token) = self.tokens.read().get(view_id) {
            return token.clone();
        }
        self.tokens
            .write()
            .entry(view_id.to_string())
            .or_insert_with(|| Uuid::new_v4().simple().to_string())
            .clone()
    }

    /// Whether `token` grants access to `view_id`.
    pub fn validate(&self, view_id: &str, token: &str) -> bool {
        if !self.enforce {
            return true;
        }
        self.tokens
            .read()
            .get(view_id)
            .is_some_and(|issued| issued == token)
    }

    /// Forget a view's token.
    pub fn revoke(&self, view_id: &str) {
        self.tokens.write().remove(view_id);
    }
}
