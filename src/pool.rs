//! Connection manager: pooled connections, per-attempt timeouts and
//! retry with exponential backoff.
//!
//! Every store operation goes through [`ConnectionManager::execute`]:
//!
//! 1. reuse an idle, healthy pooled connection, or open a new one and
//!    probe it before pooling it;
//! 2. run the operation under the configured timeout;
//! 3. on success hand the connection back, on failure drop it for good;
//! 4. retry transient failures with `min(base * mult^(n-1), max)` delays,
//!    fail permanent ones at once.
//!
//! The pool lock is never held across an await. Anything that awaits while
//! an entry is reserved re-checks the entry afterwards, since other tasks
//! may have changed the pool meanwhile.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{PoolConfig, RetryPolicy};
use crate::error::{DataError, DataResult, StoreResult};
use crate::stats::PoolStats;
use crate::store::{probe, Store};

/// How often shutdown re-checks for in-flight connections.
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct PooledConnection<C> {
    id: u64,
    conn: Arc<C>,
    last_used: Instant,
    healthy: bool,
    in_use: bool,
}

impl<C> PooledConnection<C> {
    fn is_idle_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        !self.in_use && now.saturating_duration_since(self.last_used) > idle_timeout
    }
}

#[derive(Debug)]
struct PoolState<C> {
    entries: Vec<PooledConnection<C>>,
    next_id: u64,
}

impl<C> Default for PoolState<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl<C> PoolState<C> {
    fn position(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    evicted: AtomicU64,
    failures: AtomicU64,
}

/// A connection checked out for one attempt.
///
/// Dropping a lease without releasing it (for instance when the caller's
/// future is cancelled) discards the connection.
struct Lease<'a, S: Store> {
    manager: &'a ConnectionManager<S>,
    /// `None` when the connection is not pooled.
    id: Option<u64>,
    conn: Arc<S::Connection>,
    released: bool,
}

impl<S: Store> Lease<'_, S> {
    fn release(mut self, healthy: bool) {
        self.released = true;
        self.manager.release(self.id, healthy);
    }
}

impl<S: Store> Drop for Lease<'_, S> {
    fn drop(&mut self) {
        if !self.released {
            self.manager.release(self.id, false);
        }
    }
}

/// Retrying, pooling executor for store operations.
pub struct ConnectionManager<S: Store> {
    store: S,
    policy: RetryPolicy,
    config: PoolConfig,
    pool: Mutex<PoolState<S::Connection>>,
    closing: AtomicBool,
    counters: PoolCounters,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Store> ConnectionManager<S> {
    pub fn new(store: S, policy: RetryPolicy, config: PoolConfig) -> Self {
        Self {
            store,
            policy,
            config,
            pool: Mutex::new(PoolState::default()),
            closing: AtomicBool::new(false),
            counters: PoolCounters::default(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` against a live connection, retrying transient
    /// failures.
    ///
    /// `label` names the operation in logs and errors. Permanent failures
    /// come back as [`DataError::Validation`]; transient failures that
    /// outlast every attempt come back as [`DataError::Connection`]
    /// wrapping the last cause.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> DataResult<T>
    where
        T: Send,
        F: FnMut(Arc<S::Connection>) -> Fut + Send,
        Fut: Future<Output = StoreResult<T>> + Send,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.attempt(label, &mut operation).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            self.counters.failures.fetch_add(1, Ordering::Relaxed);

            if !err.is_retryable() {
                debug!(label, attempt, error = %err, "store operation failed permanently");
                return Err(err);
            }

            if attempt >= max_attempts {
                error!(label, attempts = attempt, error = %err, "store operation exhausted retries");
                return Err(DataError::Connection {
                    label: label.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.delay_for(attempt);
            warn!(label, attempt, ?delay, error = %err, "store operation failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    /// Probe the store through [`execute`](Self::execute). Returns whether
    /// it answered.
    pub async fn ping(&self) -> bool {
        self.execute("store.ping", |conn| async move { probe(&*conn).await })
            .await
            .is_ok()
    }

    async fn attempt<T, F, Fut>(&self, label: &str, operation: &mut F) -> DataResult<T>
    where
        F: FnMut(Arc<S::Connection>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let lease = self.acquire().await?;
        let timeout = self.config.operation_timeout;

        match tokio::time::timeout(timeout, operation(Arc::clone(&lease.conn))).await {
            Ok(Ok(value)) => {
                lease.release(true);
                Ok(value)
            }
            Ok(Err(err)) => {
                lease.release(false);
                Err(DataError::classify(err))
            }
            Err(_) => {
                // The in-flight call is abandoned, not cancelled on the store side.
                lease.release(false);
                Err(DataError::Timeout {
                    label: label.to_string(),
                    after: timeout,
                })
            }
        }
    }

    async fn acquire(&self) -> DataResult<Lease<'_, S>> {
        if let Some(lease) = self.checkout_idle() {
            return Ok(lease);
        }

        let timeout = self.config.operation_timeout;
        let opened = tokio::time::timeout(timeout, async {
            let conn = self.store.connect().await?;
            probe(&conn).await?;
            Ok::<_, crate::error::StoreError>(conn)
        })
        .await;

        let conn = match opened {
            Ok(Ok(conn)) => Arc::new(conn),
            Ok(Err(err)) => return Err(DataError::classify(err)),
            Err(_) => {
                return Err(DataError::Timeout {
                    label: "store.connect".to_string(),
                    after: timeout,
                })
            }
        };
        self.counters.created.fetch_add(1, Ordering::Relaxed);

        let id = self.admit(Arc::clone(&conn));
        Ok(Lease {
            manager: self,
            id,
            conn,
            released: false,
        })
    }

    /// Prune dead entries and reserve a reusable one, if any.
    fn checkout_idle(&self) -> Option<Lease<'_, S>> {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let mut pool = self.lock();

        let before = pool.entries.len();
        pool.entries
            .retain(|e| e.in_use || (e.healthy && !e.is_idle_expired(now, idle_timeout)));
        self.record_evictions(before - pool.entries.len());

        let entry = pool.entries.iter_mut().find(|e| e.healthy && !e.in_use)?;
        entry.in_use = true;
        debug!(connection = entry.id, "reusing pooled connection");

        Some(Lease {
            manager: self,
            id: Some(entry.id),
            conn: Arc::clone(&entry.conn),
            released: false,
        })
    }

    /// Add a freshly opened connection to the pool, reserved for the
    /// caller. Returns `None` if it cannot be pooled.
    fn admit(&self, conn: Arc<S::Connection>) -> Option<u64> {
        if self.closing.load(Ordering::Acquire) {
            return None;
        }

        let mut pool = self.lock();
        // Re-checked under the lock: other tasks may have filled the pool
        // while this one was connecting.
        if pool.entries.len() >= self.config.max_size {
            let lru = pool
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.in_use)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i);
            match lru {
                Some(index) => {
                    let evicted = pool.entries.remove(index);
                    debug!(connection = evicted.id, "evicted least recently used connection");
                    self.record_evictions(1);
                }
                None => return None,
            }
        }

        pool.next_id += 1;
        let id = pool.next_id;
        pool.entries.push(PooledConnection {
            id,
            conn,
            last_used: Instant::now(),
            healthy: true,
            in_use: true,
        });
        Some(id)
    }

    fn release(&self, id: Option<u64>, healthy: bool) {
        let Some(id) = id else {
            return;
        };

        let mut pool = self.lock();
        let Some(index) = pool.position(id) else {
            return;
        };

        if healthy {
            let entry = &mut pool.entries[index];
            entry.healthy = true;
            entry.in_use = false;
            entry.last_used = Instant::now();
        } else {
            pool.entries.remove(index);
            self.record_evictions(1);
            debug!(connection = id, "discarded failed connection");
        }
    }

    /// Probe idle connections and evict expired or unhealthy ones.
    /// Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;

        let (mut evicted, reserved) = {
            let mut pool = self.lock();
            let before = pool.entries.len();
            pool.entries
                .retain(|e| e.in_use || (e.healthy && !e.is_idle_expired(now, idle_timeout)));
            let evicted = before - pool.entries.len();

            let reserved: Vec<(u64, Arc<S::Connection>)> = pool
                .entries
                .iter_mut()
                .filter(|e| !e.in_use)
                .map(|e| {
                    e.in_use = true;
                    (e.id, Arc::clone(&e.conn))
                })
                .collect();
            (evicted, reserved)
        };
        self.record_evictions(evicted);

        let timeout = self.config.operation_timeout;
        for (id, conn) in reserved {
            let healthy = matches!(tokio::time::timeout(timeout, probe(&*conn)).await, Ok(Ok(())));

            let mut pool = self.lock();
            // Shutdown may have cleared the pool while the probe ran.
            let Some(index) = pool.position(id) else {
                continue;
            };
            if healthy {
                pool.entries[index].in_use = false;
            } else {
                pool.entries.remove(index);
                self.record_evictions(1);
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, "health sweep evicted connections");
        }
        evicted
    }

    /// Start the periodic health sweep if an interval is configured.
    ///
    /// Does nothing outside a tokio runtime. The task stops on
    /// [`shutdown`](Self::shutdown) or when the manager is dropped.
    pub fn start_health_sweep(self: &Arc<Self>) {
        let Some(interval) = self.config.health_check_interval else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("no tokio runtime; connection health sweep not started");
            return;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.closing.load(Ordering::Acquire) {
                    break;
                }
                manager.sweep().await;
            }
        });

        let mut sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = sweeper.replace(task) {
            previous.abort();
        }
    }

    /// Stop pooling, wait up to the grace period for in-flight connections,
    /// then discard the pool.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = sweeper {
            task.abort();
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            let busy = self.lock().entries.iter().filter(|e| e.in_use).count();
            if busy == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(busy, "shutdown grace period elapsed with connections in use");
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let discarded = {
            let mut pool = self.lock();
            let count = pool.entries.len();
            pool.entries.clear();
            count
        };
        info!(discarded, "connection pool drained");
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let pool = self.lock();
        let in_use = pool.entries.iter().filter(|e| e.in_use).count();
        PoolStats {
            total: pool.entries.len(),
            in_use,
            idle: pool.entries.len() - in_use,
            created: self.counters.created.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    fn record_evictions(&self, count: usize) {
        if count > 0 {
            self.counters
                .evicted
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<S::Connection>> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: Store> Drop for ConnectionManager<S> {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(task) = sweeper.take() {
                task.abort();
            }
        }
    }
}

impl<S: Store> std::fmt::Debug for ConnectionManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
