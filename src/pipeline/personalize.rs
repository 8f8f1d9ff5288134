//! Per-subscriber transform of a reduction.

use super::functions::{guard, PersonalizeFn};
use super::engine::Reduction;
use crate::types::Identity;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Applies a view's personalize function, if it has one.
#[derive(Clone)]
pub struct Personalizer {
    func: Option<Arc<dyn PersonalizeFn>>,
}

impl Personalizer {
    pub fn new(func: Option<Arc<dyn PersonalizeFn>>) -> Self {
        Self { func }
    }

    /// Identity transform.
    pub fn none() -> Self {
        Self { func: None }
    }

    /// Subscriber-specific payload. A missing or failing function yields the
    /// reduction unchanged.
    pub fn personalize(&self, reduction: &Reduction, subscriber: &Identity) -> Value {
        let Some(func) = &self.func else {
            return reduction.value.clone();
        };

        match guard(|| func.personalize(&reduction.value, subscriber)) {
            Ok(value) => value,
            Err(e) => {
                warn!(subscription = %subscriber.id(), error = %e, "personalize failed, sending unpersonalized reduction");
                reduction.value.clone()
            }
        }
    }
}
