//! View pipelines: map → reduce → finalize, then per-subscriber personalize.
//!
//! Pipeline functions are native handlers registered by name in a
//! [`PipelineRegistry`]; view descriptors refer to them by those names so
//! they can be persisted and re-resolved at startup.
//!
//! ```ignore
//! let mut registry = PipelineRegistry::with_builtins();
//! registry.register_map("by_a", |doc: &Value, _: &dyn DocumentLookup| {
//!     Ok(vec![Emit::new("sum", doc["a"].clone())])
//! });
//! let view = collection.add_view(None, ViewDefinition::new("by_a", "sum"))?;
//! ```

mod engine;
mod functions;
mod personalize;

pub use engine::{evaluate, DocumentChange, Reduction, ViewEngine};
pub use functions::{
    DocumentLookup, Emit, FinalizeFn, MapFn, NoLookup, OnAddFn, PersonalizeFn, Pipeline,
    PipelineError, PipelineRegistry, PipelineResult, ReduceFn,
};
pub use personalize::Personalizer;

pub(crate) use functions::guard;
