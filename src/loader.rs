//! Dependency-ordered bring-up.
//!
//! Collections are loaded lowest priority first, and each collection's
//! views and documents are fully loaded before the next one starts. A view
//! that reads another collection through [`DocumentLookup`] therefore sees
//! that collection populated as long as it has a lower priority.
//!
//! [`DocumentLookup`]: crate::pipeline::DocumentLookup

use crate::blobs::{BlobStore, COLLECTIONS_PREFIX};
use crate::collection::Collection;
use crate::database::{Catalog, Shared};
use crate::error::{DbError, Result};
use crate::types::CollectionDescriptor;
use crossbeam_channel::unbounded;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info_span};

/// Bring-up phases, in the order they run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "collection", rename_all = "snake_case")]
pub enum LoadPhase {
    ListCollections,
    GetEachCollectionDescriptor,
    SortByPriority,
    LoadViews(String),
    LoadDocuments(String),
    Ready,
}

/// What a completed bring-up did.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LoadReport {
    /// Collection ids in the order they were loaded.
    pub order: Vec<String>,
    pub views: usize,
    pub documents: usize,
    /// Every phase entered, in order.
    pub phases: Vec<LoadPhase>,
}

/// Runs the bring-up state machine once. Any error aborts it.
pub(crate) struct LoadOrchestrator {
    shared: Arc<Shared>,
    catalog: Arc<Catalog>,
    report: LoadReport,
}

impl LoadOrchestrator {
    pub(crate) fn new(shared: Arc<Shared>, catalog: Arc<Catalog>) -> Self {
        Self {
            shared,
            catalog,
            report: LoadReport::default(),
        }
    }

    pub(crate) fn run(mut self) -> Result<LoadReport> {
        let span = info_span!("load");
        let _enter = span.enter();

        match self.load() {
            Ok(()) => {
                self.enter(LoadPhase::Ready);
                Ok(self.report)
            }
            Err(e) => {
                error!(
                    phase = ?self.report.phases.last(),
                    error = %e,
                    "bring-up aborted"
                );
                Err(e)
            }
        }
    }

    fn load(&mut self) -> Result<()> {
        self.enter(LoadPhase::ListCollections);
        let names = self.shared.blobs.list(COLLECTIONS_PREFIX)?;

        self.enter(LoadPhase::GetEachCollectionDescriptor);
        let mut descriptors = fetch_descriptors(
            self.shared.blobs.as_ref(),
            names,
            self.shared.config.load_concurrency,
        )?;

        self.enter(LoadPhase::SortByPriority);
        sort_by_priority(&mut descriptors);

        let mut collections = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let collection = Arc::new(Collection::new(descriptor, Arc::clone(&self.shared)));
            self.catalog.insert_collection(Arc::clone(&collection))?;
            collections.push(collection);
        }

        for collection in collections {
            let id = collection.id().to_string();

            self.enter(LoadPhase::LoadViews(id.clone()));
            self.report.views += collection.load_views()?;

            self.enter(LoadPhase::LoadDocuments(id.clone()));
            self.report.documents += collection.load_documents_at_startup()?;

            self.report.order.push(id);
        }
        Ok(())
    }

    fn enter(&mut self, phase: LoadPhase) {
        debug!(phase = ?phase, "load phase");
        self.report.phases.push(phase);
    }
}

/// Stable ascending sort; collections without a priority go last.
pub(crate) fn sort_by_priority(descriptors: &mut [CollectionDescriptor]) {
    descriptors.sort_by_key(|d| match d.settings.priority {
        Some(p) => (0, p),
        None => (1, 0),
    });
}

/// Fetch and decode descriptors on up to `concurrency` worker threads.
/// Results keep the listing order; the first failure to arrive is returned.
fn fetch_descriptors(
    blobs: &dyn BlobStore,
    names: Vec<String>,
    concurrency: usize,
) -> Result<Vec<CollectionDescriptor>> {
    let count = names.len();
    if count == 0 {
        return Ok(Vec::new());
    }

    let (job_tx, job_rx) = unbounded::<(usize, String)>();
    let (result_tx, result_rx) = unbounded::<(usize, Result<CollectionDescriptor>)>();
    for job in names.into_iter().enumerate() {
        // The receiver is alive in this scope.
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    let abort = AtomicBool::new(false);
    let workers = concurrency.clamp(1, count);

    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let abort = &abort;
            scope.spawn(move || {
                for (idx, name) in job_rx.iter() {
                    if abort.load(Ordering::SeqCst) {
                        break;
                    }
                    let result = fetch_descriptor(blobs, &name);
                    if result.is_err() {
                        abort.store(true, Ordering::SeqCst);
                    }
                    if result_tx.send((idx, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut slots: Vec<Option<CollectionDescriptor>> = (0..count).map(|_| None).collect();
    for (idx, result) in result_rx.iter() {
        slots[idx] = Some(result?);
    }

    slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| DbError::Storage("descriptor fetch incomplete".into())))
        .collect()
}

fn fetch_descriptor(blobs: &dyn BlobStore, name: &str) -> Result<CollectionDescriptor> {
    let bytes = blobs
        .get(name)?
        .ok_or_else(|| DbError::BlobNotFound(name.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| DbError::Deserialization(format!("{name}: {e}")))
}
