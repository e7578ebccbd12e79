//! Internal storage for the TTL cache.
//!
//! Entries live in an `IndexMap` kept in write order: a re-write moves the
//! key to the back, so the front of the map is always the oldest write.

use bytes::Bytes;
use indexmap::IndexMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::stats::CacheStats;

/// Thread-safe map of cache entries.
///
/// This is the internal implementation; users should use `TtlCache` instead.
#[derive(Debug)]
pub struct EntryMap {
    entries: RwLock<IndexMap<String, CacheEntry>>,
    config: CacheConfig,
    stats: Arc<CacheStats>,
}

impl EntryMap {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
            config,
            stats: Arc::new(CacheStats::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a live value. Expired entries are removed and count as misses.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        {
            let entries = self.read_lock()?;

            if let Some(entry) = entries.get(key) {
                if !entry.is_expired() {
                    self.stats.record_hit();
                    return Some(entry.value().clone());
                }
            } else {
                drop(entries);
                self.stats.record_miss();
                return None;
            }
        }

        self.remove_expired(key);
        self.stats.record_miss();
        None
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Bytes>, ttl: Duration) {
        let entry = CacheEntry::new(value.into(), ttl);
        let key = key.into();

        let mut entries = match self.write_lock() {
            Some(e) => e,
            None => return,
        };

        // Re-writing a key makes it the newest entry.
        entries.shift_remove(&key);
        self.make_room(&mut entries);
        entries.insert(key, entry);

        self.stats.record_set();
        self.stats.set_size(entries.len() as u64);
    }

    /// Insert a batch of entries with the configured default TTL.
    pub fn warm<I>(&self, batch: I) -> usize
    where
        I: IntoIterator<Item = (String, Bytes)>,
    {
        let ttl = self.config.default_ttl;
        let mut count = 0;
        for (key, value) in batch {
            self.set(key, value, ttl);
            count += 1;
        }
        count
    }

    /// Remove a key. Returns `true` if it was stored.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = match self.write_lock() {
            Some(e) => e,
            None => return false,
        };

        let existed = entries.shift_remove(key).is_some();
        if existed {
            self.stats.record_invalidation();
            self.stats.set_size(entries.len() as u64);
        }
        existed
    }

    /// Drop every entry and reset the counters.
    pub fn invalidate_all(&self) {
        if let Some(mut entries) = self.write_lock() {
            entries.clear();
        }
        self.stats.reset();
    }

    pub fn contains(&self, key: &str) -> bool {
        match self.read_lock() {
            Some(entries) => entries.get(key).map_or(false, |e| !e.is_expired()),
            None => false,
        }
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.read_lock().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Remove all expired entries. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Instant::now())
    }

    pub(crate) fn cleanup_expired_at(&self, now: Instant) -> usize {
        let mut entries = match self.write_lock() {
            Some(e) => e,
            None => return 0,
        };

        let initial_len = entries.len();
        entries.retain(|_, entry| {
            let expired = entry.is_expired_at(now);
            if expired {
                self.stats.record_expiration();
            }
            !expired
        });
        self.stats.set_size(entries.len() as u64);

        initial_len - entries.len()
    }

    fn read_lock(&self) -> Option<RwLockReadGuard<'_, IndexMap<String, CacheEntry>>> {
        self.entries.read().ok()
    }

    fn write_lock(&self) -> Option<RwLockWriteGuard<'_, IndexMap<String, CacheEntry>>> {
        self.entries.write().ok()
    }

    fn remove_expired(&self, key: &str) {
        if let Some(mut entries) = self.write_lock() {
            // Another writer may have refreshed the key since the read.
            if entries.get(key).map_or(false, |e| e.is_expired()) {
                entries.shift_remove(key);
                self.stats.record_expiration();
                self.stats.set_size(entries.len() as u64);
            }
        }
    }

    /// At capacity, evict the oldest tenth of the entries (at least one).
    fn make_room(&self, entries: &mut IndexMap<String, CacheEntry>) {
        let Some(max_capacity) = self.config.max_capacity else {
            return;
        };
        if entries.len() < max_capacity {
            return;
        }

        let batch = (max_capacity / 10).max(1);
        let excess = entries.len() + 1 - max_capacity;
        let count = batch.max(excess).min(entries.len());

        for _ in entries.drain(..count) {
            self.stats.record_eviction();
        }
    }
}

impl Default for EntryMap {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
