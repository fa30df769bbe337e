use fetchgate::cache::{DurableStore, StoredRecord, TieredCache};
use fetchgate::{CacheConfig, ManualClock};
use fetchgate_fs::FileStore;
use serde_json::json;
use std::sync::Arc;

const T0: u64 = 1_700_000_000_000;

fn record(data: serde_json::Value) -> StoredRecord {
    StoredRecord { data, timestamp: T0, version: None }
}

#[tokio::test]
async fn stores_loads_and_removes_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path(), "ns").await;
    assert!(store.is_available());
    assert!(store.root().is_dir());

    assert_eq!(store.load("https://api.test/a?b=1").await.unwrap(), None);
    store.store("https://api.test/a?b=1", record(json!({"id": 1}))).await.unwrap();
    let loaded = store.load("https://api.test/a?b=1").await.unwrap().unwrap();
    assert_eq!(loaded.data, json!({"id": 1}));

    store.remove("https://api.test/a?b=1").await.unwrap();
    assert_eq!(store.load("https://api.test/a?b=1").await.unwrap(), None);
    // Removing a missing key is not an error.
    store.remove("https://api.test/a?b=1").await.unwrap();
}

#[tokio::test]
async fn namespaces_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let first = FileStore::open(dir.path(), "one").await;
    let second = FileStore::open(dir.path(), "two").await;

    first.store("k", record(json!(1))).await.unwrap();
    second.store("k", record(json!(2))).await.unwrap();
    first.clear().await.unwrap();

    assert_eq!(first.load("k").await.unwrap(), None);
    assert_eq!(second.load("k").await.unwrap().unwrap().data, json!(2));
}

/// The single record file in a namespace directory.
fn only_file(store: &FileStore) -> std::path::PathBuf {
    let mut files: Vec<_> = std::fs::read_dir(store.root())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    files.pop().unwrap()
}

#[tokio::test]
async fn corrupt_file_is_a_codec_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path(), "ns").await;
    store.store("k", record(json!(1))).await.unwrap();
    std::fs::write(only_file(&store), b"not json").unwrap();

    let err = store.load("k").await.unwrap_err();
    assert!(matches!(err, fetchgate::DurableCacheError::Codec(_)));
}

#[tokio::test]
async fn file_holding_another_key_reads_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path(), "ns").await;
    store.store("k", record(json!(1))).await.unwrap();
    let path = only_file(&store);
    let text = std::fs::read_to_string(&path).unwrap().replace(r#""key":"k""#, r#""key":"other""#);
    std::fs::write(&path, text).unwrap();

    assert_eq!(store.load("k").await.unwrap(), None);
}

#[tokio::test]
async fn long_url_keys_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_at(T0);
    let key = format!("https://api.example.com/v2/search?q={}&page=3&sort=desc", "rust".repeat(200));
    assert!(key.len() > 255);

    let first: TieredCache<String> = TieredCache::new(60_000, Arc::new(clock.clone()))
        .with_durable(Arc::new(FileStore::open(dir.path(), "cache").await));
    first.set(key.clone(), "results".to_string(), T0, None);
    first.flush().await;
    assert!(first.durable_available());
    drop(first);

    let second: TieredCache<String> = TieredCache::new(60_000, Arc::new(clock))
        .with_durable(Arc::new(FileStore::open(dir.path(), "cache").await));
    assert_eq!(second.get(&key).await.expect("persisted entry").data, "results");
}

#[tokio::test]
async fn namespace_comes_from_cache_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig { namespace: "tenant-a".into(), ..CacheConfig::default() };

    let store = FileStore::from_config(dir.path(), &config).await;
    assert_eq!(store.root(), dir.path().join("tenant-a"));

    let default_store = FileStore::from_config(dir.path(), &CacheConfig::default()).await;
    assert_eq!(default_store.root(), dir.path().join(fetchgate::config::DEFAULT_CACHE_NAMESPACE));
}

#[tokio::test]
async fn unusable_directory_reports_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"a file, not a directory").unwrap();

    let store = FileStore::open(&blocker, "ns").await;
    assert!(!store.is_available());
    assert!(store.load("k").await.unwrap_err().is_unavailable());
}

#[tokio::test]
async fn tiered_cache_survives_restart_through_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_at(T0);

    let first: TieredCache<Vec<u32>> = TieredCache::new(60_000, Arc::new(clock.clone()))
        .with_durable(Arc::new(FileStore::open(dir.path(), "cache").await));
    first.set("items", vec![1, 2, 3], T0, Some("v1".into()));
    first.flush().await;
    drop(first);

    let second: TieredCache<Vec<u32>> = TieredCache::new(60_000, Arc::new(clock.clone()))
        .with_durable(Arc::new(FileStore::open(dir.path(), "cache").await));
    let entry = second.get("items").await.expect("persisted entry");
    assert_eq!(entry.data, vec![1, 2, 3]);
    assert_eq!(entry.version.as_deref(), Some("v1"));

    clock.advance(60_000);
    let third: TieredCache<Vec<u32>> = TieredCache::new(60_000, Arc::new(clock.clone()))
        .with_durable(Arc::new(FileStore::open(dir.path(), "cache").await));
    assert!(third.get("items").await.is_none());
}

#[tokio::test]
async fn tiered_cache_degrades_when_directory_is_unusable() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();
    let clock = ManualClock::starting_at(T0);

    let cache: TieredCache<String> = TieredCache::new(60_000, Arc::new(clock))
        .with_durable(Arc::new(FileStore::open(&blocker, "cache").await));
    cache.set("k", "v".to_string(), T0, None);
    cache.flush().await;

    assert!(!cache.durable_available());
    assert_eq!(cache.get("k").await.unwrap().data, "v");
}
