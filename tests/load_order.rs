//! Bring-up ordering and fail-fast tests.

use rtdb::{
    BlobStore, CollectionSettings, Database, DatabaseConfig, DbError, DocumentLookup, Emit,
    Identity, LoadPhase, MemoryBlobStore, PipelineError, PipelineRegistry, ViewDefinition,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn pipelines() -> PipelineRegistry {
    let mut registry = PipelineRegistry::with_builtins();
    registry.register_map("by_a", |doc, _| {
        Ok(vec![Emit::new("sum", doc["a"].clone())])
    });
    // Order value = quantity * price looked up in the "prices" collection
    registry.register_map("order_value", |doc, lookup| {
        let sku = doc["sku"]
            .as_str()
            .ok_or_else(|| PipelineError::new("order without sku"))?;
        let price = lookup
            .document("prices", sku)
            .and_then(|p| p["price"].as_i64())
            .ok_or_else(|| PipelineError::new(format!("no price for {sku}")))?;
        let qty = doc["qty"].as_i64().unwrap_or(1);
        Ok(vec![Emit::new("total", json!(price * qty))])
    });
    registry
}

fn with_priority(priority: Option<i64>) -> CollectionSettings {
    CollectionSettings {
        priority,
        ..Default::default()
    }
}

fn open(blobs: &Arc<dyn BlobStore>) -> rtdb::Result<Database> {
    Database::with_blob_store(DatabaseConfig::in_memory(), Arc::clone(blobs), pipelines())
}

#[test]
fn test_collections_load_in_priority_order() {
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    {
        let db = open(&blobs).unwrap();
        for (id, priority) in [("p3", Some(3)), ("none", None), ("p1", Some(1)), ("p2", Some(2))] {
            db.create_collection(Some(Identity::with_id(id)), with_priority(priority))
                .unwrap();
        }
    }

    let db = open(&blobs).unwrap();
    let report = db.load_report();
    assert_eq!(report.order, ["p1", "p2", "p3", "none"]);

    let ids: Vec<String> = db.collections().iter().map(|c| c.id().to_string()).collect();
    assert_eq!(ids, ["p1", "p2", "p3", "none"]);

    assert_eq!(
        &report.phases[..4],
        &[
            LoadPhase::ListCollections,
            LoadPhase::GetEachCollectionDescriptor,
            LoadPhase::SortByPriority,
            LoadPhase::LoadViews("p1".into()),
        ]
    );
    assert_eq!(report.phases[4], LoadPhase::LoadDocuments("p1".into()));
    assert_eq!(report.phases.last(), Some(&LoadPhase::Ready));
}

#[test]
fn test_cross_collection_view_sees_dependency() {
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    {
        let db = open(&blobs).unwrap();
        // Created in reverse dependency order on purpose
        let orders = db
            .create_collection(Some(Identity::with_id("orders")), with_priority(Some(3)))
            .unwrap();
        db.create_collection(Some(Identity::with_id("misc")), with_priority(Some(2)))
            .unwrap();
        let prices = db
            .create_collection(Some(Identity::with_id("prices")), with_priority(Some(1)))
            .unwrap();

        prices
            .put(vec![
                json!({"_id": "apple", "price": 3}),
                json!({"_id": "pear", "price": 5}),
            ])
            .unwrap();
        let view = orders
            .add_view(Some(Identity::with_id("revenue")), ViewDefinition::new("order_value", "sum"))
            .unwrap();
        orders
            .put(vec![
                json!({"sku": "apple", "qty": 2}),
                json!({"sku": "pear", "qty": 1}),
            ])
            .unwrap();
        assert_eq!(view.reduction().value, json!(11));
    }

    let db = open(&blobs).unwrap();
    let view = db.view("revenue").unwrap();
    assert_eq!(view.reduction().value, json!(11));
    assert_eq!(view.reduction().skipped, 0);
}

#[test]
fn test_corrupt_descriptor_aborts_startup() {
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    {
        let db = open(&blobs).unwrap();
        db.create_collection(Some(Identity::with_id("good")), with_priority(Some(1)))
            .unwrap();
    }
    blobs.put("collections/broken", b"{not json").unwrap();

    assert!(matches!(open(&blobs), Err(DbError::Deserialization(_))));
}

#[test]
fn test_unregistered_view_function_aborts_startup() {
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    {
        let mut registry = pipelines();
        registry.register_map("temporary", |_, _| Ok(Vec::new()));
        let db = Database::with_blob_store(DatabaseConfig::in_memory(), Arc::clone(&blobs), registry)
            .unwrap();
        let c = db.create_collection(None, CollectionSettings::default()).unwrap();
        c.add_view(None, ViewDefinition::new("temporary", "sum")).unwrap();
    }

    // Reopened without "temporary" registered
    assert!(matches!(open(&blobs), Err(DbError::PipelineNotRegistered(_))));
}

#[test]
fn test_unreadable_saved_reduction_is_ignored() {
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    {
        let db = open(&blobs).unwrap();
        let c = db
            .create_collection(Some(Identity::with_id("c")), CollectionSettings::default())
            .unwrap();
        c.add_view(Some(Identity::with_id("v")), ViewDefinition::new("by_a", "sum"))
            .unwrap();
        c.put(vec![json!({"a": 2})]).unwrap();
    }
    blobs.put("collection/c/view/v", b"garbage").unwrap();

    let db = open(&blobs).unwrap();
    assert_eq!(db.view("v").unwrap().reduction().value, json!(2));
}

#[test]
fn test_ids_that_are_not_name_segments_are_rejected() {
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    {
        let db = open(&blobs).unwrap();
        for id in ["a/b", "", ".", ".."] {
            assert!(matches!(
                db.create_collection(Some(Identity::with_id(id)), CollectionSettings::default()),
                Err(DbError::InvalidOperation(_))
            ));
        }

        let c = db
            .create_collection(Some(Identity::with_id("plain")), CollectionSettings::default())
            .unwrap();
        for id in ["x/y", "", ".."] {
            assert!(matches!(
                c.add_view(Some(Identity::with_id(id)), ViewDefinition::new("by_a", "sum")),
                Err(DbError::InvalidOperation(_))
            ));
        }
        assert!(c.views().is_empty());
    }

    assert_eq!(blobs.list("collections/").unwrap(), ["collections/plain"]);
    assert!(blobs.list("collection/plain/views/").unwrap().is_empty());

    let db = open(&blobs).unwrap();
    assert_eq!(db.collections().len(), 1);
    assert!(db.collection("plain").is_ok());
}

#[test]
fn test_filesystem_store_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let _db = Database::open(DatabaseConfig::at_path(&path), pipelines()).unwrap();

    assert!(matches!(
        Database::open(DatabaseConfig::at_path(&path), pipelines()),
        Err(DbError::Locked)
    ));
}
