//! # Resilient Store
//!
//! A data-access layer that keeps answering reads while its backing store
//! misbehaves.
//!
//! ## Layers
//!
//! - **TTL cache** ([`TtlCache`]): bounded, write-ordered, per-entry expiry,
//!   hit/miss statistics. A key-value namespace can stand in for it
//!   ([`KvCache`]).
//! - **Connection manager** ([`ConnectionManager`]): retry with capped
//!   exponential backoff, per-attempt timeouts, a small connection pool with
//!   idle and health eviction, and a draining shutdown.
//! - **Cache-aside records** ([`CachedRecords`]): reads populate the cache,
//!   writes invalidate it once the store has accepted them.
//! - **Orchestrator** ([`ResilientService`]): reads fall back to a static
//!   dataset when the store is down; writes never do.
//!
//! ## Quick Start
//!
//! ```rust
//! use resilient_store::{TtlCache, CacheConfig};
//! use std::time::Duration;
//!
//! let cache = TtlCache::new(
//!     CacheConfig::new()
//!         .max_capacity(10_000)
//!         .default_ttl(Duration::from_secs(300))
//!         .build(),
//! );
//!
//! cache.set("record:secondary:web-01", "{}");
//! assert!(cache.get("record:secondary:web-01").is_some());
//! assert!(cache.get("record:secondary:web-02").is_none());
//! assert_eq!(cache.stats().hit_rate, 0.5);
//! ```
//!
//! Composing the full service:
//!
//! ```rust
//! use resilient_store::{DataService, MemoryStore, NewRecord, ResilientService};
//!
//! # async fn demo() -> resilient_store::DataResult<()> {
//! let service = ResilientService::builder(MemoryStore::new()).build();
//!
//! let created = service.create(NewRecord::new("web-01", Default::default())).await?;
//! let found = service.get_by_key("web-01").await?;
//! assert_eq!(found.map(|r| r.id), Some(created.id));
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cached;
pub mod cli;
pub mod config;
pub mod error;
pub mod fallback;
pub mod keys;
pub mod logging;
pub mod memory;
pub mod pool;
pub mod record;
pub mod repository;
pub mod service;
pub mod stats;
pub mod store;

pub use cache::{select_backend, CacheBackend, KvCache, KvNamespace, SweepHandle, TtlCache};
pub use cached::CachedRecords;
pub use cli::{Cli, Command};
pub use config::{CacheConfig, LogFormat, LoggingConfig, PoolConfig, RetryPolicy, ServiceConfig};
pub use error::{DataError, DataResult, StoreError, StoreResult};
pub use fallback::{FallbackProvider, StaticFallback};
pub use memory::MemoryStore;
pub use pool::ConnectionManager;
pub use record::{Lookup, NewRecord, ReadSource, Record, RecordPatch};
pub use service::{DataService, HealthSnapshot, HealthStatus, ResilientService, ServiceBuilder};
pub use stats::{CacheStats, PoolStats, StatsSnapshot};
pub use store::{Store, StoreConnection};

// Internal modules
pub(crate) mod entry;
pub(crate) mod storage;
