//! Cache backends.
//!
//! The cache-aside service talks to a [`CacheBackend`]. Two implementations
//! exist: [`TtlCache`], an in-process map with TTL, capacity eviction and a
//! background sweeper, and [`KvCache`], an adapter over an external
//! key-value namespace that handles expiry itself. [`select_backend`] picks
//! one at start-up depending on which capability is available.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::DataResult;
use crate::stats::{CacheStats, StatsSnapshot};
use crate::storage::EntryMap;

/// Capability interface every cache backend provides.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a live value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> DataResult<Option<Bytes>>;

    /// Store a value for `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> DataResult<()>;

    async fn invalidate(&self, key: &str) -> DataResult<()>;

    /// Drop every entry and reset hit/miss counters.
    async fn invalidate_all(&self) -> DataResult<()>;

    /// Insert a batch of entries with the default TTL.
    async fn warm(&self, entries: Vec<(String, Bytes)>) -> DataResult<usize>;

    fn default_ttl(&self) -> Duration;

    fn stats(&self) -> StatsSnapshot;
}

/// An in-memory cache with per-entry TTL and write-order eviction.
///
/// Cloning a `TtlCache` creates a new handle to the same entries.
///
/// ```
/// use resilient_store::{CacheConfig, TtlCache};
/// use std::time::Duration;
///
/// let cache = TtlCache::new(CacheConfig::new().max_capacity(100).build());
/// cache.set_with_ttl("record:primary:1", "payload", Duration::from_secs(60));
/// assert!(cache.get("record:primary:1").is_some());
///
/// cache.invalidate("record:primary:1");
/// assert!(cache.get("record:primary:1").is_none());
/// ```
#[derive(Debug, Clone)]
pub struct TtlCache {
    map: Arc<EntryMap>,
}

impl TtlCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            map: Arc::new(EntryMap::new(config)),
        }
    }

    /// Get a value. An expired entry is removed and counted as a miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.map.get(key)
    }

    /// Store a value with the configured default TTL.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        let ttl = self.map.config().default_ttl;
        self.map.set(key, value, ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: impl Into<Bytes>, ttl: Duration) {
        self.map.set(key, value, ttl);
    }

    /// Returns `true` if the key was stored.
    pub fn invalidate(&self, key: &str) -> bool {
        self.map.invalidate(key)
    }

    pub fn invalidate_all(&self) {
        self.map.invalidate_all();
    }

    pub fn warm<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, Bytes)>,
    {
        self.map.warm(entries)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains(key)
    }

    /// Number of stored entries. May include expired entries that have not
    /// been swept yet.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.map.stats().snapshot()
    }

    /// Get a reference to the live counters.
    pub fn stats_ref(&self) -> Arc<CacheStats> {
        self.map.stats()
    }

    /// Remove expired entries now. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.map.cleanup_expired()
    }

    /// Start a task that removes expired entries every `interval`,
    /// independent of reads.
    ///
    /// The task ends when the returned handle is stopped or dropped, or
    /// when the last `TtlCache` handle goes away. Must be called from
    /// within a tokio runtime.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweepHandle {
        let map: Weak<EntryMap> = Arc::downgrade(&self.map);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(map) = map.upgrade() else {
                    break;
                };
                let removed = map.cleanup_expired();
                if removed > 0 {
                    debug!(removed, "swept expired cache entries");
                }
            }
        });

        SweepHandle { task }
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[async_trait]
impl CacheBackend for TtlCache {
    async fn get(&self, key: &str) -> DataResult<Option<Bytes>> {
        Ok(TtlCache::get(self, key))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> DataResult<()> {
        self.set_with_ttl(key, value, ttl);
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> DataResult<()> {
        TtlCache::invalidate(self, key);
        Ok(())
    }

    async fn invalidate_all(&self) -> DataResult<()> {
        TtlCache::invalidate_all(self);
        Ok(())
    }

    async fn warm(&self, entries: Vec<(String, Bytes)>) -> DataResult<usize> {
        Ok(TtlCache::warm(self, entries))
    }

    fn default_ttl(&self) -> Duration {
        self.map.config().default_ttl
    }

    fn stats(&self) -> StatsSnapshot {
        TtlCache::stats(self)
    }
}

/// Handle to a running background sweep. Stops the sweep when dropped.
#[derive(Debug)]
pub struct SweepHandle {
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An external key-value namespace, such as a distributed KV store.
///
/// The namespace is responsible for expiring values after their TTL.
#[async_trait]
pub trait KvNamespace: Send + Sync {
    async fn get(&self, key: &str) -> DataResult<Option<Bytes>>;
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> DataResult<()>;
    async fn delete(&self, key: &str) -> DataResult<()>;
}

/// Cache backend over a [`KvNamespace`].
///
/// Keys written through this handle are tracked locally so that
/// `invalidate_all` can remove them; keys written by other processes are
/// not visible to it.
pub struct KvCache {
    kv: Arc<dyn KvNamespace>,
    default_ttl: Duration,
    stats: CacheStats,
    written: Mutex<HashSet<String>>,
}

impl KvCache {
    pub fn new(kv: Arc<dyn KvNamespace>, default_ttl: Duration) -> Self {
        Self {
            kv,
            default_ttl,
            stats: CacheStats::new(),
            written: Mutex::new(HashSet::new()),
        }
    }

    fn track(&self, key: &str, present: bool) {
        if let Ok(mut written) = self.written.lock() {
            if present {
                written.insert(key.to_string());
            } else {
                written.remove(key);
            }
            self.stats.set_size(written.len() as u64);
        }
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("default_ttl", &self.default_ttl)
            .field("stats", &self.stats)
            .finish()
    }
}

#[async_trait]
impl CacheBackend for KvCache {
    async fn get(&self, key: &str) -> DataResult<Option<Bytes>> {
        match self.kv.get(key).await {
            Ok(Some(value)) => {
                self.stats.record_hit();
                Ok(Some(value))
            }
            Ok(None) => {
                self.stats.record_miss();
                self.track(key, false);
                Ok(None)
            }
            Err(err) => {
                self.stats.record_miss();
                Err(err)
            }
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> DataResult<()> {
        self.kv.put(key, value, ttl).await?;
        self.stats.record_set();
        self.track(key, true);
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> DataResult<()> {
        self.kv.delete(key).await?;
        self.stats.record_invalidation();
        self.track(key, false);
        Ok(())
    }

    async fn invalidate_all(&self) -> DataResult<()> {
        let keys: Vec<String> = match self.written.lock() {
            Ok(written) => written.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };

        for key in keys {
            if let Err(err) = self.kv.delete(&key).await {
                warn!(key = %key, error = %err, "failed to delete kv cache entry");
            }
        }

        if let Ok(mut written) = self.written.lock() {
            written.clear();
        }
        self.stats.reset();
        Ok(())
    }

    async fn warm(&self, entries: Vec<(String, Bytes)>) -> DataResult<usize> {
        let mut count = 0;
        for (key, value) in entries {
            CacheBackend::set(self, &key, value, self.default_ttl).await?;
            count += 1;
        }
        Ok(count)
    }

    fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// The backend chosen at start-up, plus its sweeper if one was started.
pub struct SelectedCache {
    pub backend: Arc<dyn CacheBackend>,
    pub sweeper: Option<SweepHandle>,
}

/// Pick a cache backend: the KV adapter when a namespace is supplied,
/// otherwise an in-memory [`TtlCache`].
///
/// For the in-memory cache, the background sweeper is started when the
/// config enables it and a tokio runtime is running.
pub fn select_backend(config: &CacheConfig, kv: Option<Arc<dyn KvNamespace>>) -> SelectedCache {
    match kv {
        Some(kv) => {
            debug!("using key-value namespace cache backend");
            SelectedCache {
                backend: Arc::new(KvCache::new(kv, config.default_ttl)),
                sweeper: None,
            }
        }
        None => {
            debug!("using in-memory cache backend");
            let cache = TtlCache::new(config.clone());
            let sweeper = match config.cleanup_interval {
                Some(interval)
                    if config.background_cleanup
                        && tokio::runtime::Handle::try_current().is_ok() =>
                {
                    Some(cache.spawn_sweeper(interval))
                }
                _ => None,
            };
            SelectedCache {
                backend: Arc::new(cache),
                sweeper,
            }
        }
    }
}
