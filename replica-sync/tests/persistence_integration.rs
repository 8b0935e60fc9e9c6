//! Integration tests for persistence: RocksDB durability, optimistic
//! concurrency between stores sharing one storage, debounced saves and
//! cross-store fan-out.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use replica_sync::{
    MemoryPubSub, MemoryStorage, Model, ModelOptions, RocksStorage, Storage, StorageConfig, Store,
    StoreOptions,
};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration};

fn model(source: &str) -> Model {
    Model::new(ModelOptions {
        source: Some(source.to_string()),
        ..ModelOptions::default()
    })
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Open RocksDB, retrying while a previous handle is still being released.
async fn open_rocks(path: &Path) -> RocksStorage {
    timeout(Duration::from_secs(2), async {
        loop {
            match RocksStorage::open(StorageConfig::for_testing(path)) {
                Ok(storage) => return storage,
                Err(_) => sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("database still locked")
}

#[tokio::test]
async fn test_documents_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let storage = Arc::new(open_rocks(&path).await);
        let store = Store::new(storage.clone(), StoreOptions::for_testing());
        store.init().await.unwrap();
        let writer = model("writer");
        writer.connect(store.connect_local()).await.unwrap();
        writer.add("users", "1", json!({"name": "Ann", "tags": ["a"]})).await.unwrap();
        writer.push("users", "1", "tags", json!("b")).await.unwrap();
        writer.disconnect();
        wait_until(|| store.channel_count() == 0).await;
    }

    let storage = Arc::new(open_rocks(&path).await);
    let stored = storage.get_doc_by_id("users", "1").await.unwrap().unwrap();
    assert_eq!(stored.state, Some(json!({"name": "Ann", "tags": ["a", "b"]})));

    let store = Store::new(storage, StoreOptions::for_testing());
    store.init().await.unwrap();
    let reader = model("reader");
    reader.connect(store.connect_local()).await.unwrap();
    reader.subscribe_doc("users", "1").await.unwrap();
    assert_eq!(
        reader.get("users", "1"),
        Some(json!({"_id": "1", "name": "Ann", "tags": ["a", "b"]}))
    );
}

#[tokio::test]
async fn test_stale_save_reloads_and_retries() {
    // Two stores over one storage, with no bus between them: the second
    // learns about the first one's write only through the version check.
    let storage = MemoryStorage::new();
    let committed = Arc::new(AtomicUsize::new(0));
    let counter = committed.clone();
    let first = Store::new(Arc::new(storage.clone()), StoreOptions::for_testing());
    let second = Store::new(
        Arc::new(storage.clone()),
        StoreOptions::for_testing().with_after_hook(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let alice = model("alice");
    let bob = model("bob");
    alice.connect(first.connect_local()).await.unwrap();
    bob.connect(second.connect_local()).await.unwrap();

    alice.add("users", "1", json!({"name": "Ann"})).await.unwrap();
    bob.subscribe_doc("users", "1").await.unwrap();
    alice.set("users", "1", Some("x"), json!(1)).await.unwrap();

    // Bob's store still saves against the version it loaded.
    bob.set("users", "1", Some("y"), json!(2)).await.unwrap();
    assert_eq!(committed.load(Ordering::SeqCst), 1);

    let stored = storage.get_doc_by_id("users", "1").await.unwrap().unwrap();
    assert_eq!(stored.state, Some(json!({"name": "Ann", "x": 1, "y": 2})));
    assert_eq!(stored.ops.len(), 3);

    // The reload delivered Alice's write to Bob.
    wait_until(|| bob.get("users", "1").is_some_and(|d| d["x"] == json!(1))).await;
}

#[tokio::test]
async fn test_debounced_saves_coalesce() {
    let storage = MemoryStorage::new();
    let options = StoreOptions::for_testing().with_save_debounce(Duration::from_millis(100));
    let store = Store::new(Arc::new(storage.clone()), options);
    let client = model("client");
    client.connect(store.connect_local()).await.unwrap();

    client.add("counters", "c", json!({"n": 0})).await.unwrap();
    for _ in 0..3 {
        client.increment("counters", "c", Some("n"), json!(1)).await.unwrap();
    }
    assert!(storage.get_doc_by_id("counters", "c").await.unwrap().is_none());

    sleep(Duration::from_millis(300)).await;
    let stored = storage.get_doc_by_id("counters", "c").await.unwrap().unwrap();
    assert_eq!(stored.state, Some(json!({"n": 3})));
}

#[tokio::test]
async fn test_pubsub_fans_out_between_stores() {
    let storage = MemoryStorage::new();
    let bus = Arc::new(MemoryPubSub::new(64));
    let first = Store::new(
        Arc::new(storage.clone()),
        StoreOptions::for_testing().with_pubsub(bus.clone()),
    );
    let second = Store::new(
        Arc::new(storage.clone()),
        StoreOptions::for_testing().with_pubsub(bus.clone()),
    );
    first.init().await.unwrap();
    second.init().await.unwrap();

    let writer = model("writer");
    let reader = model("reader");
    writer.connect(first.connect_local()).await.unwrap();
    reader.connect(second.connect_local()).await.unwrap();

    writer.add("users", "1", json!({"n": 1})).await.unwrap();
    reader.subscribe_doc("users", "1").await.unwrap();
    writer.set("users", "1", Some("n"), json!(2)).await.unwrap();

    wait_until(|| reader.get("users", "1").is_some_and(|d| d["n"] == json!(2))).await;
    assert!(bus.stats().messages_sent >= 2);
}

#[tokio::test]
async fn test_after_hook_sees_previous_value() {
    let seen: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let options = StoreOptions::for_testing().with_after_hook(move |_, previous| {
        log.lock().unwrap().push(previous.cloned());
    });
    let store = Store::new(Arc::new(MemoryStorage::new()), options);
    let client = model("client");
    client.connect(store.connect_local()).await.unwrap();

    client.add("users", "1", json!({"name": "Ann"})).await.unwrap();
    client.set("users", "1", Some("name"), json!("Bob")).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], None);
    assert_eq!(seen[1], Some(json!("Ann")));
}
