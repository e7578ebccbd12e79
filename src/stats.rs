//! Statistics for the cache and the connection pool.
//!
//! Cache counters are atomics so they can be bumped on the read path
//! without taking the map lock.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for cache operations.
///
/// Use `TtlCache::stats()` to get a [`StatsSnapshot`].
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Gets that returned a live entry.
    hits: AtomicU64,

    /// Gets that found nothing, or only an expired entry.
    misses: AtomicU64,

    /// Entries removed to make room at capacity.
    evictions: AtomicU64,

    /// Entries removed because their TTL elapsed.
    expirations: AtomicU64,

    /// Entries currently stored, expired ones included until removed.
    size: AtomicU64,

    sets: AtomicU64,

    invalidations: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Relaxed);
    }

    /// Zero every counter. Only `invalidate_all` does this.
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.evictions,
            &self.expirations,
            &self.size,
            &self.sets,
            &self.invalidations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn sets(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// `hits / (hits + misses)`, or 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits(), self.misses())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            expirations: self.expirations(),
            size: self.size(),
            sets: self.sets(),
            invalidations: self.invalidations(),
            hit_rate: self.hit_rate(),
        }
    }
}

pub(crate) fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// A point-in-time copy of the cache counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: u64,
    pub sets: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

/// A point-in-time view of the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PoolStats {
    /// Connections currently pooled.
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    /// Connections opened since start.
    pub created: u64,
    /// Connections dropped for idleness, ill health or capacity.
    pub evicted: u64,
    /// Operation attempts that failed.
    pub failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_initial_stats() {
        let stats = CacheStats::new();
        assert_eq!(stats.hits(), 0);
        assert_eq!(stats.misses(), 0);
        assert_eq!(stats.size(), 0);
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();

        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_reset() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_miss();
        stats.set_size(4);

        stats.reset();

        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    proptest! {
        #[test]
        fn hit_rate_is_exact_fraction(hits in 0u64..500, misses in 0u64..500) {
            let stats = CacheStats::new();
            for _ in 0..hits {
                stats.record_hit();
            }
            for _ in 0..misses {
                stats.record_miss();
            }

            let total = hits + misses;
            let expected = if total == 0 { 0.0 } else { hits as f64 / total as f64 };
            prop_assert_eq!(stats.hit_rate(), expected);
        }
    }
}
