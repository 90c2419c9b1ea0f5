//! Object store contract tests.
//!
//! The same expectations run against the in-memory and local directory
//! backends.

use super::*;
use std::sync::Arc;
use tempfile::TempDir;

async fn assert_contract(store: &dyn ObjectStore) {
    assert!(!store.exists().await.unwrap());
    store.provision().await.unwrap();
    assert!(store.exists().await.unwrap());

    store.put("X_train.npy", vec![1, 2, 3]).await.unwrap();
    assert_eq!(store.get("X_train.npy").await.unwrap(), vec![1, 2, 3]);

    // Overwrite
    store.put("X_train.npy", vec![9]).await.unwrap();
    assert_eq!(store.get("X_train.npy").await.unwrap(), vec![9]);

    let err = store.get("missing.npy").await.unwrap_err();
    assert!(err.is_not_found(), "expected ObjectNotFound, got {err:?}");
}

// ============================================================================
// Locations
// ============================================================================

#[test]
fn test_location_display() {
    let loc = StorageLocation::new(BackendKind::Bucket, "igz-training", "X_train.npy");
    assert_eq!(loc.to_string(), "s3://igz-training/X_train.npy");

    let loc = StorageLocation::new(BackendKind::Container, "cancer_ds", "data/y_val.npy");
    assert_eq!(loc.to_string(), "azureml://cancer_ds/data/y_val.npy");
}

#[test]
fn test_backend_kind_display() {
    assert_eq!(BackendKind::Bucket.to_string(), "bucket");
    assert_eq!(BackendKind::Container.to_string(), "container");
}

#[test]
fn test_not_found_is_distinct_from_unavailable() {
    let not_found = StoreError::ObjectNotFound(StorageLocation::new(
        BackendKind::Memory,
        "m",
        "k",
    ));
    let unavailable = StoreError::unavailable("get", "m", "connection reset");
    assert!(not_found.is_not_found());
    assert!(!unavailable.is_not_found());
    assert!(unavailable.to_string().contains("connection reset"));
    assert!(unavailable.to_string().contains("get"));
}

// ============================================================================
// Backends
// ============================================================================

#[tokio::test]
async fn test_memory_store_contract() {
    let store = InMemoryObjectStore::new("datasets");
    assert_contract(&store).await;
}

#[tokio::test]
async fn test_local_store_contract() {
    let tmp = TempDir::new().unwrap();
    let store = LocalDirStore::new(tmp.path(), "datasets");
    assert_contract(&store).await;
}

#[tokio::test]
async fn test_local_store_leaves_no_temp_files() {
    let tmp = TempDir::new().unwrap();
    let store = LocalDirStore::new(tmp.path(), "datasets");
    store.provision().await.unwrap();
    store.put("a.npy", vec![0; 1024]).await.unwrap();
    store.put("a.npy", vec![1; 16]).await.unwrap();

    let names: Vec<String> = std::fs::read_dir(store.container_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["a.npy".to_string()]);
}

#[tokio::test]
async fn test_memory_store_get_on_unprovisioned_is_not_found() {
    let store = InMemoryObjectStore::new("fresh");
    let err = store.get("X_train.npy").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_memory_store_unavailable() {
    let store = InMemoryObjectStore::provisioned("down");
    store.set_unavailable("connection refused");
    let err = store.exists().await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable { operation: "exists", .. }));
    let err = store.get("k").await.unwrap_err();
    assert!(!err.is_not_found());
}

#[tokio::test]
async fn test_memory_store_records_calls() {
    let store = InMemoryObjectStore::new("calls");
    store.exists().await.unwrap();
    store.provision().await.unwrap();
    store.put("k", vec![]).await.unwrap();
    store.get("k").await.unwrap();
    assert_eq!(
        store.calls(),
        vec![
            StoreCall::Exists,
            StoreCall::Provision,
            StoreCall::Put("k".into()),
            StoreCall::Get("k".into()),
        ]
    );
}

// ============================================================================
// Directory upload
// ============================================================================

#[tokio::test]
async fn test_upload_dir_flattens_to_base_names() {
    let src = TempDir::new().unwrap();
    std::fs::write(src.path().join("X_train.npy"), b"x").unwrap();
    std::fs::create_dir_all(src.path().join("nested/deeper")).unwrap();
    std::fs::write(src.path().join("nested/deeper/y_train.npy"), b"y").unwrap();

    let store = InMemoryObjectStore::provisioned("flat");
    let uploaded = upload_dir(&store, src.path(), None).await.unwrap();

    assert_eq!(uploaded.len(), 2);
    assert_eq!(store.keys(), vec!["X_train.npy", "y_train.npy"]);
    assert_eq!(store.get("y_train.npy").await.unwrap(), b"y".to_vec());
}

#[tokio::test]
async fn test_upload_dir_same_base_name_last_wins() {
    let src = TempDir::new().unwrap();
    std::fs::create_dir_all(src.path().join("a")).unwrap();
    std::fs::create_dir_all(src.path().join("b")).unwrap();
    std::fs::write(src.path().join("a/data.npy"), b"first").unwrap();
    std::fs::write(src.path().join("b/data.npy"), b"second").unwrap();

    let store = InMemoryObjectStore::provisioned("flat");
    let uploaded = upload_dir(&store, src.path(), None).await.unwrap();

    // Both uploads happen, on the same key; walk order is sorted so b/ lands last.
    assert_eq!(uploaded.len(), 2);
    assert_eq!(store.keys(), vec!["data.npy"]);
    assert_eq!(store.get("data.npy").await.unwrap(), b"second".to_vec());
}

#[tokio::test]
async fn test_upload_dir_with_prefix() {
    let src = TempDir::new().unwrap();
    std::fs::write(src.path().join("X_val.npy"), b"v").unwrap();

    let store = InMemoryObjectStore::provisioned("prefixed");
    let uploaded = upload_dir(&store, src.path(), Some("cancer/")).await.unwrap();
    assert_eq!(uploaded[0].key, "cancer/X_val.npy");
}

#[tokio::test]
async fn test_upload_dir_missing_directory_is_local_io() {
    let store = InMemoryObjectStore::provisioned("nowhere");
    let err = upload_dir(&store, std::path::Path::new("/definitely/not/here"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LocalIo { .. }));
}

#[tokio::test]
async fn test_trait_object_usage() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::provisioned("dyn"));
    store.put("k", vec![7]).await.unwrap();
    assert_eq!(store.location("k").to_string(), "memory://dyn/k");
}
