//! Conditional-write semantics shared by every coordination store backend.

use podnet_ipam::{CoordinationStore, MemoryStore, SqliteStore, StoreError};

async fn check_conditional_writes(store: &dyn CoordinationStore) {
    let v1 = store.create("/t/leases/a", b"one").await.unwrap();
    assert!(matches!(
        store.create("/t/leases/a", b"two").await,
        Err(StoreError::Conflict(_))
    ));

    let v2 = store.compare_and_swap("/t/leases/a", v1, b"two").await.unwrap();
    assert!(v2 > v1);

    // A stale version never wins
    let err = store
        .compare_and_swap("/t/leases/a", v1, b"three")
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(store.get("/t/leases/a").await.unwrap().unwrap().value, b"two");

    assert!(store.compare_and_delete("/t/leases/a", v1).await.is_err());
    store.compare_and_delete("/t/leases/a", v2).await.unwrap();
    assert!(store.get("/t/leases/a").await.unwrap().is_none());
}

async fn check_prefix_listing(store: &dyn CoordinationStore) {
    store.put("/t/nodes/b", b"b").await.unwrap();
    store.put("/t/nodes/a", b"a").await.unwrap();
    store.put("/t/slices/x", b"x").await.unwrap();

    let listed = store.list("/t/nodes/").await.unwrap();
    let keys: Vec<&str> = listed.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, vec!["/t/nodes/a", "/t/nodes/b"]);
    assert!(store.list("/t/none/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_memory_store_conditional_writes() {
    check_conditional_writes(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_sqlite_store_conditional_writes() {
    check_conditional_writes(&SqliteStore::in_memory().unwrap()).await;
}

#[tokio::test]
async fn test_memory_store_prefix_listing() {
    check_prefix_listing(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_sqlite_store_prefix_listing() {
    check_prefix_listing(&SqliteStore::in_memory().unwrap()).await;
}

#[tokio::test]
async fn test_sqlite_store_reopen_keeps_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state/ipam.db");
    {
        let store = SqliteStore::new(&path).unwrap();
        store.put("/t/k", b"v").await.unwrap();
    }
    let store = SqliteStore::new(&path).unwrap();
    assert_eq!(store.get("/t/k").await.unwrap().unwrap().value, b"v");
}
