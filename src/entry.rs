//! Cache entry with the metadata needed for TTL checks and write-order
//! eviction.

use bytes::Bytes;
use std::time::{Duration, Instant};

/// A single cache entry: the payload, when it was written, and how long
/// it stays valid.
///
/// An entry is valid while `now - written_at <= ttl`. Invalid entries are
/// logically absent even if they are still physically stored.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub(crate) value: Bytes,
    pub(crate) written_at: Instant,
    pub(crate) ttl: Duration,
}

impl CacheEntry {
    pub fn new(value: Bytes, ttl: Duration) -> Self {
        Self::written_at(value, ttl, Instant::now())
    }

    /// Create an entry with an explicit write time.
    /// This is useful for testing with a controlled clock.
    pub fn written_at(value: Bytes, ttl: Duration, written_at: Instant) -> Self {
        Self {
            value,
            written_at,
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Check if this entry has expired at a given time.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.written_at) > self.ttl
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn age(&self) -> Duration {
        self.written_at.elapsed()
    }
}
