//! The resilient orchestrator.
//!
//! [`ResilientService`] composes the connection manager, the cache-aside
//! record service and an optional fallback dataset into the [`DataService`]
//! API. Reads degrade to the fallback when the store fails; writes never
//! do, because the fallback is read-only and a write that pretended to
//! succeed would be lost.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::cache::{select_backend, CacheBackend, KvNamespace, SweepHandle};
use crate::cached::CachedRecords;
use crate::config::ServiceConfig;
use crate::error::{DataError, DataResult};
use crate::fallback::FallbackProvider;
use crate::pool::ConnectionManager;
use crate::record::{Lookup, NewRecord, ReadSource, Record, RecordPatch};
use crate::stats::{PoolStats, StatsSnapshot};
use crate::store::Store;

/// The data API exposed to callers.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn get_by_key(&self, key: &str) -> DataResult<Option<Record>>;

    async fn get_by_id(&self, id: &str) -> DataResult<Option<Record>>;

    async fn get_all(&self) -> DataResult<Vec<Record>>;

    /// Fails with `Conflict` if the key is taken.
    async fn create(&self, record: NewRecord) -> DataResult<Record>;

    /// Fails with `NotFound`, or `Conflict` if the new key belongs to
    /// another record.
    async fn update(&self, id: &str, patch: RecordPatch) -> DataResult<Record>;

    async fn delete(&self, id: &str) -> DataResult<()>;

    /// `true` if no record uses `key`.
    async fn validate_unique_key(&self, key: &str) -> DataResult<bool>;

    async fn health_snapshot(&self) -> HealthSnapshot;
}

/// Overall service condition derived from a [`HealthSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// The store is down but reads are served from the fallback.
    Degraded,
    Unavailable,
}

/// Point-in-time view of every tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub store_reachable: bool,
    pub fallback_available: bool,
    pub cache: StatsSnapshot,
    pub pool: PoolStats,
}

impl HealthSnapshot {
    pub fn status(&self) -> HealthStatus {
        if self.store_reachable {
            HealthStatus::Healthy
        } else if self.fallback_available {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unavailable
        }
    }
}

/// Builder for [`ResilientService`].
pub struct ServiceBuilder<S: Store> {
    store: S,
    config: ServiceConfig,
    fallback: Option<Arc<dyn FallbackProvider>>,
    kv: Option<Arc<dyn KvNamespace>>,
}

impl<S: Store> ServiceBuilder<S> {
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn FallbackProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Cache in a key-value namespace instead of process memory.
    pub fn kv_namespace(mut self, kv: Arc<dyn KvNamespace>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Assemble the layers, leaves first. Background tasks (cache sweep,
    /// connection health sweep) start only when a tokio runtime is running.
    pub fn build(self) -> ResilientService<S> {
        let selected = select_backend(&self.config.cache, self.kv);
        let manager = Arc::new(ConnectionManager::new(
            self.store,
            self.config.retry,
            self.config.pool,
        ));
        manager.start_health_sweep();

        let mut service = ResilientService::new(manager, selected.backend, self.fallback);
        service.sweeper = Mutex::new(selected.sweeper);
        service
    }
}

/// Three-tier read path (cache, store, fallback) over a single store.
pub struct ResilientService<S: Store> {
    manager: Arc<ConnectionManager<S>>,
    records: CachedRecords<S>,
    fallback: Option<Arc<dyn FallbackProvider>>,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl<S: Store> ResilientService<S> {
    pub fn builder(store: S) -> ServiceBuilder<S> {
        ServiceBuilder {
            store,
            config: ServiceConfig::default(),
            fallback: None,
            kv: None,
        }
    }

    /// Compose already-built layers.
    pub fn new(
        manager: Arc<ConnectionManager<S>>,
        cache: Arc<dyn CacheBackend>,
        fallback: Option<Arc<dyn FallbackProvider>>,
    ) -> Self {
        Self {
            records: CachedRecords::new(Arc::clone(&manager), cache),
            manager,
            fallback,
            sweeper: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager<S>> {
        &self.manager
    }

    pub fn records(&self) -> &CachedRecords<S> {
        &self.records
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Read by secondary key and report which tier answered.
    pub async fn lookup(&self, key: &str) -> DataResult<Lookup> {
        match self.records.lookup(key).await {
            Ok(found) => Ok(found),
            Err(err) => self.read_fallback("get_by_key", err, |fallback| {
                let record = fallback.get_by_key(key);
                let source = if record.is_some() {
                    ReadSource::Fallback
                } else {
                    ReadSource::Miss
                };
                Lookup::new(record, source)
            }),
        }
    }

    /// Load every record into the cache. Runs once per service.
    pub async fn warm_up(&self) -> DataResult<usize> {
        self.records.warm_up().await
    }

    /// Stop background work and drain the connection pool.
    pub async fn shutdown(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
        self.manager.shutdown().await;
        info!("data service shut down");
    }

    /// Substitute fallback data for a failed read, if a fallback exists.
    fn read_fallback<T>(
        &self,
        operation: &str,
        err: DataError,
        read: impl FnOnce(&dyn FallbackProvider) -> T,
    ) -> DataResult<T> {
        match &self.fallback {
            Some(fallback) => {
                warn!(operation, error = %err, "store read failed; serving fallback data");
                Ok(read(fallback.as_ref()))
            }
            None if err.is_transport() => Err(DataError::Unavailable {
                operation: operation.to_string(),
                source: Box::new(err),
            }),
            None => Err(err),
        }
    }

    /// Translate a failed write. Transport failures become `Unavailable`,
    /// unless the fallback already shows `key` owned by someone other than
    /// `owner`, in which case the write would have conflicted anyway.
    fn write_error(
        &self,
        operation: &str,
        err: DataError,
        key: Option<&str>,
        owner: Option<&str>,
    ) -> DataError {
        if !err.is_transport() {
            return err;
        }

        if let (Some(key), Some(fallback)) = (key, &self.fallback) {
            if let Some(existing) = fallback.get_by_key(key) {
                if owner != Some(existing.id.as_str()) {
                    warn!(operation, key, "store unreachable; key is taken in fallback data");
                    return DataError::Conflict {
                        key: key.to_string(),
                    };
                }
            }
        }

        warn!(operation, error = %err, "store unreachable; write rejected");
        DataError::Unavailable {
            operation: operation.to_string(),
            source: Box::new(err),
        }
    }
}

#[async_trait]
impl<S: Store> DataService for ResilientService<S> {
    async fn get_by_key(&self, key: &str) -> DataResult<Option<Record>> {
        Ok(self.lookup(key).await?.record)
    }

    async fn get_by_id(&self, id: &str) -> DataResult<Option<Record>> {
        match self.records.get_by_id(id).await {
            Ok(record) => Ok(record),
            Err(err) => self.read_fallback("get_by_id", err, |fallback| fallback.get_by_id(id)),
        }
    }

    async fn get_all(&self) -> DataResult<Vec<Record>> {
        match self.records.get_all().await {
            Ok(records) => Ok(records),
            Err(err) => self.read_fallback("get_all", err, |fallback| fallback.get_all()),
        }
    }

    async fn create(&self, record: NewRecord) -> DataResult<Record> {
        let key = record.key.clone();
        self.records
            .create(record)
            .await
            .map_err(|err| self.write_error("create", err, Some(key.as_str()), None))
    }

    async fn update(&self, id: &str, patch: RecordPatch) -> DataResult<Record> {
        let key = patch.key.clone();
        self.records
            .update(id, patch)
            .await
            .map_err(|err| self.write_error("update", err, key.as_deref(), Some(id)))
    }

    async fn delete(&self, id: &str) -> DataResult<()> {
        self.records
            .delete(id)
            .await
            .map_err(|err| self.write_error("delete", err, None, None))
    }

    async fn validate_unique_key(&self, key: &str) -> DataResult<bool> {
        match self.records.validate_unique_key(key).await {
            Ok(unique) => Ok(unique),
            Err(err) if err.is_transport() => match &self.fallback {
                Some(fallback) => {
                    warn!(key, error = %err, "store unreachable; checking key against fallback data");
                    Ok(fallback.get_by_key(key).is_none())
                }
                None => Err(DataError::Unavailable {
                    operation: "validate_unique_key".to_string(),
                    source: Box::new(err),
                }),
            },
            Err(err) => Err(err),
        }
    }

    async fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            store_reachable: self.manager.ping().await,
            fallback_available: self.fallback.is_some(),
            cache: self.records.cache().stats(),
            pool: self.manager.stats(),
        }
    }
}

impl<S: Store> std::fmt::Debug for ResilientService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientService")
            .field("manager", &self.manager)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, PoolConfig, RetryPolicy};
    use crate::fallback::StaticFallback;
    use crate::memory::MemoryStore;
    use serde_json::Map;
    use std::time::Duration;

    fn config() -> ServiceConfig {
        ServiceConfig {
            cache: CacheConfig::new().max_capacity(100),
            retry: RetryPolicy::new()
                .max_attempts(2)
                .base_delay(Duration::from_millis(10)),
            pool: PoolConfig::new().health_check_interval(Duration::ZERO),
            ..Default::default()
        }
    }

    fn fallback() -> Arc<dyn FallbackProvider> {
        Arc::new(StaticFallback::new(vec![Record::new(
            "f1",
            "web-01",
            Map::new(),
        )]))
    }

    #[test]
    fn test_health_status() {
        let mut snapshot = HealthSnapshot {
            store_reachable: true,
            fallback_available: false,
            cache: StatsSnapshot::default(),
            pool: PoolStats::default(),
        };
        assert_eq!(snapshot.status(), HealthStatus::Healthy);

        snapshot.store_reachable = false;
        assert_eq!(snapshot.status(), HealthStatus::Unavailable);

        snapshot.fallback_available = true;
        assert_eq!(snapshot.status(), HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_reports_fallback_and_miss() {
        let store = MemoryStore::new();
        store.set_available(false);
        let service = ResilientService::builder(store)
            .config(config())
            .fallback(fallback())
            .build();

        let hit = service.lookup("web-01").await.unwrap();
        assert_eq!(hit.source, ReadSource::Fallback);
        assert_eq!(hit.record.unwrap().id, "f1");

        let miss = service.lookup("web-99").await.unwrap();
        assert_eq!(miss.source, ReadSource::Miss);
        assert!(miss.record.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_conflicts_with_fallback_key_when_offline() {
        let store = MemoryStore::new();
        store.set_available(false);
        let service = ResilientService::builder(store)
            .config(config())
            .fallback(fallback())
            .build();

        let taken = service
            .create(NewRecord::new("web-01", Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(taken, DataError::Conflict { .. }));

        let free = service
            .create(NewRecord::new("web-02", Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(free, DataError::Unavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_unique_key_uses_fallback_when_offline() {
        let store = MemoryStore::new();
        store.set_available(false);
        let service = ResilientService::builder(store)
            .config(config())
            .fallback(fallback())
            .build();

        assert!(!service.validate_unique_key("web-01").await.unwrap());
        assert!(service.validate_unique_key("web-02").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_snapshot_when_offline() {
        let store = MemoryStore::new();
        let service = ResilientService::builder(store.clone())
            .config(config())
            .fallback(fallback())
            .build();
        assert_eq!(service.health_snapshot().await.status(), HealthStatus::Healthy);

        store.set_available(false);
        service.manager().sweep().await;
        let snapshot = service.health_snapshot().await;

        assert!(!snapshot.store_reachable);
        assert_eq!(snapshot.status(), HealthStatus::Degraded);
        assert_eq!(snapshot.pool.total, 0);
    }
}
