//! Pipeline function capabilities and the registry that names them.

use crate::error::{DbError, Result};
use crate::types::{DocumentSet, Identity, ReductionShape, ViewDefinition};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by user pipeline code.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PipelineError(pub String);

impl PipelineError {
    pub fn new(msg: impl Into<String>) -> Self {
        PipelineError(msg.into())
    }
}

impl From<&str> for PipelineError {
    fn from(msg: &str) -> Self {
        PipelineError(msg.to_string())
    }
}

impl From<String> for PipelineError {
    fn from(msg: String) -> Self {
        PipelineError(msg)
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// One `(key, value)` emission from a map function.
#[derive(Clone, Debug, PartialEq)]
pub struct Emit {
    pub key: String,
    pub value: Value,
}

impl Emit {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Read access to other collections' documents from inside a pipeline.
pub trait DocumentLookup: Send + Sync {
    /// Current documents of a collection, `None` if it does not exist.
    fn documents(&self, collection_id: &str) -> Option<Arc<DocumentSet>>;

    /// A single document body.
    fn document(&self, collection_id: &str, document_id: &str) -> Option<Value> {
        self.documents(collection_id)?
            .get(document_id)
            .map(|d| d.body.clone())
    }
}

/// Lookup that sees no collections.
pub struct NoLookup;

impl DocumentLookup for NoLookup {
    fn documents(&self, _collection_id: &str) -> Option<Arc<DocumentSet>> {
        None
    }
}

/// `map(document) → zero or more (key, value) emissions`.
pub trait MapFn: Send + Sync {
    fn map(&self, document: &Value, lookup: &dyn DocumentLookup) -> PipelineResult<Vec<Emit>>;
}

/// `reduce(key, values) → aggregated value`.
pub trait ReduceFn: Send + Sync {
    fn reduce(&self, key: &str, values: &[Value]) -> PipelineResult<Value>;
}

/// `finalize(aggregate) → presented value`.
pub trait FinalizeFn: Send + Sync {
    fn finalize(&self, aggregate: &Value) -> PipelineResult<Value>;
}

/// `personalize(reduction, subscriber) → subscriber-specific value`.
pub trait PersonalizeFn: Send + Sync {
    fn personalize(&self, reduction: &Value, subscriber: &Identity) -> PipelineResult<Value>;
}

/// Hook applied to each incoming document before it is stored.
pub trait OnAddFn: Send + Sync {
    fn on_add(&self, document: Value) -> PipelineResult<Value>;
}

impl<F> MapFn for F
where
    F: Fn(&Value, &dyn DocumentLookup) -> PipelineResult<Vec<Emit>> + Send + Sync,
{
    fn map(&self, document: &Value, lookup: &dyn DocumentLookup) -> PipelineResult<Vec<Emit>> {
        self(document, lookup)
    }
}

impl<F> ReduceFn for F
where
    F: Fn(&str, &[Value]) -> PipelineResult<Value> + Send + Sync,
{
    fn reduce(&self, key: &str, values: &[Value]) -> PipelineResult<Value> {
        self(key, values)
    }
}

impl<F> FinalizeFn for F
where
    F: Fn(&Value) -> PipelineResult<Value> + Send + Sync,
{
    fn finalize(&self, aggregate: &Value) -> PipelineResult<Value> {
        self(aggregate)
    }
}

impl<F> PersonalizeFn for F
where
    F: Fn(&Value, &Identity) -> PipelineResult<Value> + Send + Sync,
{
    fn personalize(&self, reduction: &Value, subscriber: &Identity) -> PipelineResult<Value> {
        self(reduction, subscriber)
    }
}

impl<F> OnAddFn for F
where
    F: Fn(Value) -> PipelineResult<Value> + Send + Sync,
{
    fn on_add(&self, document: Value) -> PipelineResult<Value> {
        self(document)
    }
}

/// Run user code, turning a panic into a [`PipelineError`].
pub(crate) fn guard<T>(f: impl FnOnce() -> PipelineResult<T>) -> PipelineResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(PipelineError(format!("panicked: {msg}")))
        }
    }
}

/// Resolved functions for one view.
#[derive(Clone)]
pub struct Pipeline {
    pub map: Arc<dyn MapFn>,
    pub reduce: Arc<dyn ReduceFn>,
    pub finalize: Option<Arc<dyn FinalizeFn>>,
    pub personalize: Option<Arc<dyn PersonalizeFn>>,
    pub shape: ReductionShape,
}

/// Named pipeline functions available to view definitions.
#[derive(Default, Clone)]
pub struct PipelineRegistry {
    maps: HashMap<String, Arc<dyn MapFn>>,
    reduces: HashMap<String, Arc<dyn ReduceFn>>,
    finalizes: HashMap<String, Arc<dyn FinalizeFn>>,
    personalizes: HashMap<String, Arc<dyn PersonalizeFn>>,
    on_adds: HashMap<String, Arc<dyn OnAddFn>>,
}

impl PipelineRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `sum`, `count` and `collect` reducers and
    /// the `identity` finalizer.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_reduce("sum", |_: &str, values: &[Value]| sum(values));
        registry.register_reduce("count", |_: &str, values: &[Value]| {
            Ok(Value::from(values.len() as u64))
        });
        registry.register_reduce("collect", |_: &str, values: &[Value]| {
            Ok(Value::Array(values.to_vec()))
        });
        registry.register_finalize("identity", |v: &Value| Ok(v.clone()));
        registry
    }

    pub fn register_map<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Value, &dyn DocumentLookup) -> PipelineResult<Vec<Emit>> + Send + Sync + 'static,
    {
        self.maps.insert(name.into(), Arc::new(f));
        self
    }

    pub fn register_reduce<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&str, &[Value]) -> PipelineResult<Value> + Send + Sync + 'static,
    {
        self.reduces.insert(name.into(), Arc::new(f));
        self
    }

    pub fn register_finalize<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Value) -> PipelineResult<Value> + Send + Sync + 'static,
    {
        self.finalizes.insert(name.into(), Arc::new(f));
        self
    }

    pub fn register_personalize<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Value, &Identity) -> PipelineResult<Value> + Send + Sync + 'static,
    {
        self.personalizes.insert(name.into(), Arc::new(f));
        self
    }

    pub fn register_on_add<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value) -> PipelineResult<Value> + Send + Sync + 'static,
    {
        self.on_adds.insert(name.into(), Arc::new(f));
        self
    }

    /// Register a map implemented as a type rather than a closure.
    pub fn register_map_impl(&mut self, name: impl Into<String>, f: Arc<dyn MapFn>) -> &mut Self {
        self.maps.insert(name.into(), f);
        self
    }

    /// Resolve every name in a view definition.
    pub fn resolve(&self, definition: &ViewDefinition) -> Result<Pipeline> {
        let map = self
            .maps
            .get(&definition.map)
            .cloned()
            .ok_or_else(|| DbError::PipelineNotRegistered(format!("map:{}", definition.map)))?;
        let reduce = self.reduces.get(&definition.reduce).cloned().ok_or_else(|| {
            DbError::PipelineNotRegistered(format!("reduce:{}", definition.reduce))
        })?;
        let finalize = match &definition.finalize {
            Some(name) => Some(self.finalizes.get(name).cloned().ok_or_else(|| {
                DbError::PipelineNotRegistered(format!("finalize:{name}"))
            })?),
            None => None,
        };
        let personalize = match &definition.personalize {
            Some(name) => Some(self.personalizes.get(name).cloned().ok_or_else(|| {
                DbError::PipelineNotRegistered(format!("personalize:{name}"))
            })?),
            None => None,
        };

        Ok(Pipeline {
            map,
            reduce,
            finalize,
            personalize,
            shape: definition.shape,
        })
    }

    pub fn on_add(&self, name: &str) -> Result<Arc<dyn OnAddFn>> {
        self.on_adds
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::PipelineNotRegistered(format!("on_add:{name}")))
    }
}

fn sum(values: &[Value]) -> PipelineResult<Value> {
    let mut int_total: i64 = 0;
    let mut float_total: f64 = 0.0;
    let mut integral = true;

    for value in values {
        let Value::Number(n) = value else {
            return Err(PipelineError(format!("sum over non-number {value}")));
        };
        match (integral, n.as_i64()) {
            (true, Some(i)) => match int_total.checked_add(i) {
                Some(t) => int_total = t,
                None => {
                    integral = false;
                    float_total = int_total as f64 + i as f64;
                }
            },
            _ => {
                if integral {
                    integral = false;
                    float_total = int_total as f64;
                }
                float_total += n.as_f64().unwrap_or(0.0);
            }
        }
    }

    if integral {
        Ok(Value::from(int_total))
    } else {
        serde_json::Number::from_f64(float_total)
            .map(Value::Number)
            .ok_or_else(|| PipelineError::new("sum is not finite"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_sum() {
        assert_eq!(sum(&[json!(1), json!(2), json!(3)]).unwrap(), json!(6));
        assert_eq!(sum(&[json!(1), json!(0.5)]).unwrap(), json!(1.5));
        assert_eq!(sum(&[]).unwrap(), json!(0));
        assert!(sum(&[json!("x")]).is_err());
    }

    #[test]
    fn test_resolve_reports_missing_names() {
        let registry = PipelineRegistry::with_builtins();
        let err = registry
            .resolve(&ViewDefinition::new("nope", "sum"))
            .err()
            .unwrap();
        assert!(matches!(err, DbError::PipelineNotRegistered(ref n) if n == "map:nope"));
    }

    #[test]
    fn test_resolve_closures() {
        let mut registry = PipelineRegistry::with_builtins();
        registry.register_map("by_a", |doc: &Value, _: &dyn DocumentLookup| {
            Ok(vec![Emit::new("sum", doc["a"].clone())])
        });

        let pipeline = registry
            .resolve(&ViewDefinition::new("by_a", "count").finalize("identity"))
            .unwrap();
        let emits = pipeline.map.map(&json!({"a": 7}), &NoLookup).unwrap();
        assert_eq!(emits, vec![Emit::new("sum", json!(7))]);
        assert_eq!(pipeline.reduce.reduce("sum", &[json!(1), json!(1)]).unwrap(), json!(2));
        assert!(pipeline.personalize.is_none());
    }

    #[test]
    fn test_guard_catches_panics() {
        let result: PipelineResult<()> = guard(|| panic!("boom"));
        assert_eq!(result.unwrap_err(), PipelineError::new("panicked: boom"));

        let ok = guard(|| Ok(5));
        assert_eq!(ok.unwrap(), 5);
    }
}
