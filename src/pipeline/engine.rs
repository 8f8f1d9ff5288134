//! Reduction computation for a single view.

use super::functions::{guard, DocumentLookup, Pipeline};
use super::personalize::Personalizer;
use crate::error::{DbError, Result};
use crate::types::{DocumentSet, ReductionShape, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Finalized output of a view's pipeline.
///
/// Never mutated after construction; a recompute swaps in a new `Arc`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reduction {
    pub value: Value,
    /// Increments on every successful recompute.
    pub generation: u64,
    pub computed_at: Timestamp,
    /// Documents that contributed.
    pub documents: usize,
    /// Documents skipped because map failed on them.
    pub skipped: usize,
}

impl Reduction {
    /// Reduction of an empty document set, before any recompute.
    pub fn empty() -> Self {
        Self {
            value: Value::Object(Map::new()),
            generation: 0,
            computed_at: Timestamp::now(),
            documents: 0,
            skipped: 0,
        }
    }

    /// Hex SHA-256 of the JSON encoding of `value`.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.value).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// What changed in a collection to trigger recomputation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DocumentChange {
    Put(Vec<String>),
    Removed(Vec<String>),
    Cleared,
    Loaded,
    DefinitionChanged,
}

/// Owns a view's pipeline and its live reduction.
pub struct ViewEngine {
    view_id: String,
    pipeline: RwLock<Arc<Pipeline>>,
    reduction: RwLock<Arc<Reduction>>,
    recomputes: AtomicU64,
    failed_passes: AtomicU64,
    skipped_documents: AtomicU64,
    last_recompute_micros: AtomicU64,
}

impl ViewEngine {
    pub fn new(view_id: impl Into<String>, pipeline: Pipeline) -> Self {
        Self {
            view_id: view_id.into(),
            pipeline: RwLock::new(Arc::new(pipeline)),
            reduction: RwLock::new(Arc::new(Reduction::empty())),
            recomputes: AtomicU64::new(0),
            failed_passes: AtomicU64::new(0),
            skipped_documents: AtomicU64::new(0),
            last_recompute_micros: AtomicU64::new(0),
        }
    }

    /// Current reduction. Readers never observe a partially built one.
    pub fn reduction(&self) -> Arc<Reduction> {
        Arc::clone(&self.reduction.read())
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline.read())
    }

    /// Swap in new pipeline functions. Takes effect on the next recompute.
    pub fn set_pipeline(&self, pipeline: Pipeline) {
        *self.pipeline.write() = Arc::new(pipeline);
    }

    pub fn personalizer(&self) -> Personalizer {
        Personalizer::new(self.pipeline().personalize.clone())
    }

    /// Install a previously saved reduction (startup restore).
    pub fn restore(&self, reduction: Reduction) {
        *self.reduction.write() = Arc::new(reduction);
    }

    /// React to a committed document change.
    ///
    /// Always a full recompute over the current document set; the result is
    /// a pure function of `documents`, independent of the change history.
    pub fn on_document_change(
        &self,
        change: &DocumentChange,
        documents: &DocumentSet,
        lookup: &dyn DocumentLookup,
    ) -> Result<Arc<Reduction>> {
        debug!(view = %self.view_id, ?change, "recomputing");
        self.recompute(documents, lookup)
    }

    /// Run the pipeline over `documents` and publish the result as the new
    /// reduction. On failure the previous reduction stays in place.
    pub fn recompute(
        &self,
        documents: &DocumentSet,
        lookup: &dyn DocumentLookup,
    ) -> Result<Arc<Reduction>> {
        let started = Instant::now();
        let pipeline = self.pipeline();
        let generation = self.reduction.read().generation + 1;

        let outcome = evaluate(&self.view_id, &pipeline, documents, lookup);
        self.recomputes.fetch_add(1, Ordering::Relaxed);
        self.last_recompute_micros
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        match outcome {
            Ok((value, skipped)) => {
                self.skipped_documents
                    .fetch_add(skipped as u64, Ordering::Relaxed);
                let reduction = Arc::new(Reduction {
                    value,
                    generation,
                    computed_at: Timestamp::now(),
                    documents: documents.len() - skipped,
                    skipped,
                });
                *self.reduction.write() = Arc::clone(&reduction);
                Ok(reduction)
            }
            Err(e) => {
                self.failed_passes.fetch_add(1, Ordering::Relaxed);
                error!(view = %self.view_id, error = %e, "recompute failed, keeping previous reduction");
                Err(e)
            }
        }
    }

    pub fn recomputes(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }

    pub fn failed_passes(&self) -> u64 {
        self.failed_passes.load(Ordering::Relaxed)
    }

    pub fn skipped_documents(&self) -> u64 {
        self.skipped_documents.load(Ordering::Relaxed)
    }

    pub fn last_recompute_micros(&self) -> u64 {
        self.last_recompute_micros.load(Ordering::Relaxed)
    }
}

/// `finalize(reduce(map(documents)))` without touching any engine state.
///
/// Returns the finalized value and the number of documents skipped because
/// their map call failed. With [`ReductionShape::Auto`] a pass that emitted a
/// single key finalizes that key's reduced value directly. Emission keys with a failing reduce are left out of
/// the aggregate. A failing finalize fails the whole pass.
pub fn evaluate(
    view_id: &str,
    pipeline: &Pipeline,
    documents: &DocumentSet,
    lookup: &dyn DocumentLookup,
) -> Result<(Value, usize)> {
    let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut skipped = 0;

    for (doc_id, doc) in documents {
        match guard(|| pipeline.map.map(&doc.body, lookup)) {
            Ok(emits) => {
                for emit in emits {
                    groups.entry(emit.key).or_default().push(emit.value);
                }
            }
            Err(e) => {
                skipped += 1;
                warn!(view = %view_id, document = %doc_id, error = %e, "map failed, skipping document");
            }
        }
    }

    let mut aggregate = Map::new();
    for (key, values) in &groups {
        match guard(|| pipeline.reduce.reduce(key, values)) {
            Ok(value) => {
                aggregate.insert(key.clone(), value);
            }
            Err(e) => {
                warn!(view = %view_id, key = %key, error = %e, "reduce failed, omitting key");
            }
        }
    }
    let aggregate = match pipeline.shape {
        ReductionShape::Auto if groups.len() == 1 && aggregate.len() == 1 => aggregate
            .into_iter()
            .next()
            .map(|(_, value)| value)
            .unwrap_or(Value::Null),
        _ => Value::Object(aggregate),
    };

    let value = match &pipeline.finalize {
        Some(finalize) => guard(|| finalize.finalize(&aggregate))
            .map_err(|e| DbError::Pipeline(format!("finalize: {e}")))?,
        None => aggregate,
    };

    Ok((value, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Emit, NoLookup, PipelineError, PipelineRegistry};
    use crate::types::{Document, ViewDefinition};
    use serde_json::json;

    fn docs(values: &[Value]) -> DocumentSet {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                (
                    format!("d{i}"),
                    Document {
                        body: v.clone(),
                        inserted_at: Timestamp::now(),
                    },
                )
            })
            .collect()
    }

    fn registry() -> PipelineRegistry {
        let mut registry = PipelineRegistry::with_builtins();
        registry.register_map("by_a", |doc: &Value, _: &dyn DocumentLookup| {
            match doc.get("a") {
                Some(a) => Ok(vec![Emit::new("sum", a.clone())]),
                None => Err(PipelineError::new("missing a")),
            }
        });
        registry.register_finalize("broken", |_: &Value| Err(PipelineError::new("nope")));
        registry
    }

    fn engine(definition: ViewDefinition) -> ViewEngine {
        ViewEngine::new("v1", registry().resolve(&definition).unwrap())
    }

    #[test]
    fn test_sum_pipeline() {
        let engine = engine(ViewDefinition::new("by_a", "sum").finalize("identity"));
        let reduction = engine
            .recompute(&docs(&[json!({"a": 1}), json!({"a": 2}), json!({"a": 3})]), &NoLookup)
            .unwrap();

        assert_eq!(reduction.value, json!(6));
        assert_eq!(reduction.generation, 1);
        assert_eq!(reduction.documents, 3);
        assert_eq!(engine.reduction().value, json!(6));
    }

    #[test]
    fn test_failing_document_is_skipped() {
        let engine = engine(ViewDefinition::new("by_a", "sum"));
        let reduction = engine
            .recompute(&docs(&[json!({"a": 1}), json!({"b": 2}), json!({"a": 3})]), &NoLookup)
            .unwrap();

        assert_eq!(reduction.value, json!(4));
        assert_eq!(reduction.skipped, 1);
        assert_eq!(engine.skipped_documents(), 1);
    }

    #[test]
    fn test_failed_pass_keeps_previous_reduction() {
        let engine = engine(ViewDefinition::new("by_a", "sum"));
        engine.recompute(&docs(&[json!({"a": 5})]), &NoLookup).unwrap();

        let broken = registry()
            .resolve(&ViewDefinition::new("by_a", "sum").finalize("broken"))
            .unwrap();
        engine.set_pipeline(broken);

        assert!(engine.recompute(&docs(&[json!({"a": 9})]), &NoLookup).is_err());
        assert_eq!(engine.reduction().value, json!(5));
        assert_eq!(engine.reduction().generation, 1);
        assert_eq!(engine.failed_passes(), 1);
    }

    #[test]
    fn test_digest_tracks_value() {
        let engine = engine(ViewDefinition::new("by_a", "sum"));
        let empty = engine.reduction().digest();
        engine.recompute(&docs(&[json!({"a": 5})]), &NoLookup).unwrap();
        assert_ne!(engine.reduction().digest(), empty);
        assert_eq!(engine.reduction().digest().len(), 64);
    }

    #[test]
    fn test_empty_collection() {
        let engine = engine(ViewDefinition::new("by_a", "sum"));
        let reduction = engine.recompute(&DocumentSet::new(), &NoLookup).unwrap();
        assert_eq!(reduction.value, json!({}));
    }

    #[test]
    fn test_keyed_shape_keeps_single_key_object() {
        let engine = engine(ViewDefinition::new("by_a", "sum").keyed());
        let reduction = engine
            .recompute(&docs(&[json!({"a": 1}), json!({"a": 2})]), &NoLookup)
            .unwrap();
        assert_eq!(reduction.value, json!({"sum": 3}));
    }

    #[test]
    fn test_several_keys_stay_keyed() {
        let mut registry = registry();
        registry.register_map("by_group", |doc: &Value, _: &dyn DocumentLookup| {
            Ok(vec![Emit::new(doc["g"].as_str().unwrap_or("none"), doc["a"].clone())])
        });
        let pipeline = registry
            .resolve(&ViewDefinition::new("by_group", "sum"))
            .unwrap();
        let engine = ViewEngine::new("v1", pipeline);

        let one = engine
            .recompute(&docs(&[json!({"g": "x", "a": 1})]), &NoLookup)
            .unwrap();
        assert_eq!(one.value, json!(1));

        let two = engine
            .recompute(
                &docs(&[json!({"g": "x", "a": 1}), json!({"g": "y", "a": 2})]),
                &NoLookup,
            )
            .unwrap();
        assert_eq!(two.value, json!({"x": 1, "y": 2}));
    }
}
