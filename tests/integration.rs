//! End-to-end tests for the resilient data layer.

use async_trait::async_trait;
use bytes::Bytes;
use resilient_store::{
    CacheBackend, CacheConfig, DataError, DataResult, DataService, KvNamespace, MemoryStore,
    NewRecord, PoolConfig, ReadSource, Record, RecordPatch, ResilientService, RetryPolicy,
    ServiceConfig, StaticFallback, StoreError, TtlCache,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::time::Instant;

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn config(attempts: u32) -> ServiceConfig {
    ServiceConfig {
        cache: CacheConfig::new().max_capacity(100),
        retry: RetryPolicy::new()
            .max_attempts(attempts)
            .base_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(300)),
        pool: PoolConfig::new().health_check_interval(Duration::ZERO),
        ..Default::default()
    }
}

fn seeded() -> MemoryStore {
    MemoryStore::with_records([
        Record::new("1", "web-01", object(json!({"ip": "10.0.0.1"}))),
        Record::new("2", "web-02", object(json!({"ip": "10.0.0.2"}))),
    ])
}

fn fallback() -> Arc<StaticFallback> {
    Arc::new(StaticFallback::new(vec![Record::new(
        "f1",
        "legacy-01",
        object(json!({"ip": "192.168.0.1"})),
    )]))
}

#[test]
fn test_ttl_expiration() {
    let cache = TtlCache::default();

    cache.set_with_ttl("k", "v", Duration::from_millis(100));
    assert_eq!(cache.get("k"), Some(Bytes::from("v")));

    thread::sleep(Duration::from_millis(150));

    let misses = cache.stats().misses;
    assert!(cache.get("k").is_none());
    assert_eq!(cache.stats().misses, misses + 1);
}

#[test]
fn test_invalidation() {
    let cache = TtlCache::default();
    cache.set("k", "v");

    assert!(cache.invalidate("k"));
    assert!(cache.get("k").is_none());
}

#[test]
fn test_eviction_removes_single_oldest() {
    let cache = TtlCache::new(CacheConfig::new().max_capacity(10).build());
    for i in 0..11 {
        cache.set(format!("key_{}", i), "value");
    }

    assert!(cache.len() <= 10);
    assert!(!cache.contains("key_0"));
    for i in 1..11 {
        assert!(cache.contains(&format!("key_{}", i)));
    }
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn test_hit_rate_is_exact() {
    let cache = TtlCache::default();
    cache.set("present", "v");

    for _ in 0..7 {
        cache.get("present");
    }
    for _ in 0..3 {
        cache.get("absent");
    }

    let stats = cache.stats();
    assert_eq!(stats.hits, 7);
    assert_eq!(stats.misses, 3);
    assert_eq!(stats.hit_rate, 7.0 / 10.0);
}

#[test]
fn test_concurrent_writes() {
    let cache = TtlCache::new(CacheConfig::new().max_capacity(10_000).build());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    cache.set(format!("thread_{}_key_{}", t, i), "value");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.len(), 400);
}

#[tokio::test(start_paused = true)]
async fn test_retry_count_and_backoff() {
    let store = seeded();
    store.fail_with(Some(StoreError::Query("network error: timeout".to_string())));
    let service = ResilientService::builder(store.clone())
        .config(config(4))
        .build();

    let started = Instant::now();
    let err = service.get_by_key("web-01").await.unwrap_err();

    assert!(matches!(err, DataError::Unavailable { .. }));
    assert_eq!(store.statement_count(), 4);
    // 100ms + 200ms + min(400ms, 300ms)
    assert_eq!(started.elapsed(), Duration::from_millis(600));
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_short_circuits() {
    let store = seeded();
    store.fail_with(Some(StoreError::Query(
        "CHECK constraint failed: records".to_string(),
    )));
    let service = ResilientService::builder(store.clone())
        .config(config(5))
        .build();

    let err = service.get_all().await.unwrap_err();

    assert!(matches!(err, DataError::Validation { .. }));
    assert_eq!(store.statement_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_read_falls_back_when_store_unreachable() {
    let store = seeded();
    store.set_available(false);
    let service = ResilientService::builder(store)
        .config(config(3))
        .fallback(fallback())
        .build();

    let found = service.get_by_key("legacy-01").await.unwrap();
    assert_eq!(found.map(|r| r.id), Some("f1".to_string()));

    assert!(service.get_by_key("web-01").await.unwrap().is_none());

    let all = service.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_read_without_fallback_is_unavailable() {
    let store = seeded();
    store.set_available(false);
    let service = ResilientService::builder(store).config(config(2)).build();

    let err = service.get_by_key("web-01").await.unwrap_err();
    match err {
        DataError::Unavailable { source, .. } => {
            assert!(matches!(*source, DataError::Connection { attempts: 2, .. }));
        }
        other => panic!("expected Unavailable, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cached_reads_survive_outage() {
    let store = seeded();
    let service = ResilientService::builder(store.clone())
        .config(config(2))
        .fallback(fallback())
        .build();

    assert_eq!(service.lookup("web-01").await.unwrap().source, ReadSource::Store);
    store.set_available(false);

    let lookup = service.lookup("web-01").await.unwrap();
    assert_eq!(lookup.source, ReadSource::Cache);
    assert_eq!(lookup.record.unwrap().data["ip"], json!("10.0.0.1"));
}

#[tokio::test(start_paused = true)]
async fn test_writes_never_use_fallback() {
    let store = seeded();
    store.set_available(false);
    let service = ResilientService::builder(store.clone())
        .config(config(2))
        .fallback(fallback())
        .build();

    let create = service.create(NewRecord::new("web-09", Map::new())).await;
    let update = service
        .update("1", RecordPatch::default().data(object(json!({"ip": "0.0.0.0"}))))
        .await;
    let delete = service.delete("1").await;

    assert!(matches!(create, Err(DataError::Unavailable { .. })));
    assert!(matches!(update, Err(DataError::Unavailable { .. })));
    assert!(matches!(delete, Err(DataError::Unavailable { .. })));

    store.set_available(true);
    assert_eq!(store.records().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_uniqueness() {
    let store = seeded();
    let service = ResilientService::builder(store.clone())
        .config(config(2))
        .fallback(fallback())
        .build();

    let dup = service.create(NewRecord::new("web-01", Map::new())).await;
    assert!(matches!(dup, Err(DataError::Conflict { .. })));

    let steal = service
        .update("2", RecordPatch::default().key("web-01"))
        .await;
    assert!(matches!(steal, Err(DataError::Conflict { .. })));

    let same = service
        .update("1", RecordPatch::default().key("web-01"))
        .await
        .unwrap();
    assert_eq!(same.key, "web-01");

    assert!(!service.validate_unique_key("web-02").await.unwrap());
    assert!(service.validate_unique_key("web-03").await.unwrap());

    store.set_available(false);
    let offline_dup = service.create(NewRecord::new("legacy-01", Map::new())).await;
    assert!(matches!(offline_dup, Err(DataError::Conflict { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_update_is_visible_under_both_keys() {
    let store = seeded();
    let service = ResilientService::builder(store)
        .config(config(2))
        .build();

    service.get_by_key("web-01").await.unwrap();
    service.get_by_id("1").await.unwrap();

    let patch = RecordPatch::default()
        .key("web-10")
        .data(object(json!({"ip": "10.0.0.10"})));
    service.update("1", patch).await.unwrap();

    assert!(service.get_by_key("web-01").await.unwrap().is_none());
    let renamed = service.get_by_key("web-10").await.unwrap().unwrap();
    assert_eq!(renamed.data["ip"], json!("10.0.0.10"));
    let by_id = service.get_by_id("1").await.unwrap().unwrap();
    assert_eq!(by_id.key, "web-10");
}

#[tokio::test(start_paused = true)]
async fn test_create_then_read_and_delete() {
    let store = MemoryStore::new();
    let service = ResilientService::builder(store.clone())
        .config(config(2))
        .build();

    let created = service
        .create(NewRecord::new("db-01", object(json!({"role": "primary"}))))
        .await
        .unwrap();
    assert!(!created.id.is_empty());

    let found = service.get_by_key("db-01").await.unwrap().unwrap();
    assert_eq!(found, created);

    service.delete(&created.id).await.unwrap();
    assert!(service.get_by_key("db-01").await.unwrap().is_none());
    assert!(matches!(
        service.delete(&created.id).await,
        Err(DataError::NotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_health_snapshot_and_shutdown() {
    let store = seeded();
    let service = ResilientService::builder(store.clone())
        .config(config(1))
        .build();

    service.warm_up().await.unwrap();
    let snapshot = service.health_snapshot().await;
    assert!(snapshot.store_reachable);
    assert!(!snapshot.fallback_available);
    assert_eq!(snapshot.cache.size, 4);
    assert_eq!(snapshot.pool.total, 1);

    service.shutdown().await;
    assert!(service.manager().is_closing());
    assert_eq!(service.manager().stats().total, 0);
}

#[derive(Default)]
struct MapKv {
    values: Mutex<HashMap<String, Bytes>>,
}

#[async_trait]
impl KvNamespace for MapKv {
    async fn get(&self, key: &str) -> DataResult<Option<Bytes>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes, _ttl: Duration) -> DataResult<()> {
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> DataResult<()> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_kv_namespace_backend() {
    let kv = Arc::new(MapKv::default());
    let store = seeded();
    let service = ResilientService::builder(store.clone())
        .config(config(2))
        .kv_namespace(kv.clone())
        .build();

    service.get_by_key("web-02").await.unwrap();
    assert!(kv.values.lock().unwrap().contains_key("record:secondary:web-02"));

    let lookup = service.lookup("web-02").await.unwrap();
    assert_eq!(lookup.source, ReadSource::Cache);
    assert_eq!(store.statement_count(), 1);

    let stats = service.records().cache().stats();
    assert_eq!(stats.hits, 1);
}

fn short_lived(cleanup: Duration) -> ServiceConfig {
    ServiceConfig {
        cache: CacheConfig::new()
            .default_ttl(Duration::from_millis(20))
            .cleanup_interval(cleanup),
        pool: PoolConfig::new().health_check_interval(Duration::ZERO),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_expired_entries_are_swept_without_reads() {
    let service = ResilientService::builder(seeded())
        .config(short_lived(Duration::from_millis(10)))
        .build();

    service.get_all().await.unwrap();
    assert_eq!(service.records().cache().stats().size, 4);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = service.records().cache().stats();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.expirations, 4);
    assert_eq!(stats.hits + stats.misses, 0);
}

#[tokio::test]
async fn test_zero_cleanup_interval_disables_sweep() {
    let service = ResilientService::builder(seeded())
        .config(short_lived(Duration::ZERO))
        .build();

    service.get_all().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(service.records().cache().stats().size, 4);
}
