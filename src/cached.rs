//! Cache-aside record service.
//!
//! Reads check the cache first and populate it on a store hit. Writes go
//! to the store first and, once the store has accepted them, invalidate
//! every cache key that could still describe the affected record. A failed
//! invalidation is logged and otherwise ignored: the write already
//! happened.
//!
//! Store errors are never swallowed here; substituting data is the
//! orchestrator's job.

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::RegexSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheBackend;
use crate::error::{DataError, DataResult};
use crate::keys;
use crate::pool::ConnectionManager;
use crate::record::{validate_key, Lookup, NewRecord, ReadSource, Record, RecordPatch};
use crate::repository;
use crate::store::Store;

/// A unique-constraint violation on the secondary key column.
static KEY_CONSTRAINT: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([r"(?i)\bunique\b.*\brecords\.key\b"]).unwrap_or_else(|_| RegexSet::empty())
});

/// Report a lost race on the secondary key as a conflict. Two writers can
/// both pass the availability check before either reaches the store.
fn key_conflict(err: DataError, key: &str) -> DataError {
    match err {
        DataError::Validation { message } if KEY_CONSTRAINT.is_match(&message) => {
            debug!(key, "store rejected duplicate key");
            DataError::Conflict {
                key: key.to_string(),
            }
        }
        other => other,
    }
}

/// Record operations with cache-aside reads and invalidate-on-write.
pub struct CachedRecords<S: Store> {
    manager: Arc<ConnectionManager<S>>,
    cache: Arc<dyn CacheBackend>,
    warmed: AtomicBool,
    warming: tokio::sync::Mutex<()>,
}

impl<S: Store> CachedRecords<S> {
    pub fn new(manager: Arc<ConnectionManager<S>>, cache: Arc<dyn CacheBackend>) -> Self {
        Self {
            manager,
            cache,
            warmed: AtomicBool::new(false),
            warming: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    pub async fn get_by_key(&self, key: &str) -> DataResult<Option<Record>> {
        Ok(self.lookup(key).await?.record)
    }

    /// Read by secondary key, reporting whether the cache or the store
    /// answered.
    pub async fn lookup(&self, key: &str) -> DataResult<Lookup> {
        if let Some(record) = self.cached(&keys::by_secondary(key)).await {
            return Ok(Lookup::new(Some(record), ReadSource::Cache));
        }

        let record = self.fetch_by_key(key).await?;
        if let Some(record) = &record {
            self.remember(record).await;
        }
        Ok(Lookup::new(record, ReadSource::Store))
    }

    pub async fn get_by_id(&self, id: &str) -> DataResult<Option<Record>> {
        if let Some(record) = self.cached(&keys::by_primary(id)).await {
            return Ok(Some(record));
        }

        let record = self.fetch_by_id(id).await?;
        if let Some(record) = &record {
            self.remember(record).await;
        }
        Ok(record)
    }

    /// Read every record from the store. The aggregate is not cached, but
    /// each record is, so later single-record reads hit.
    pub async fn get_all(&self) -> DataResult<Vec<Record>> {
        let records = self.fetch_all().await?;
        for record in &records {
            self.remember(record).await;
        }
        Ok(records)
    }

    pub async fn create(&self, new: NewRecord) -> DataResult<Record> {
        validate_key(&new.key).map_err(DataError::validation)?;

        if self.fetch_by_key(&new.key).await?.is_some() {
            return Err(DataError::Conflict { key: new.key });
        }

        let record = Record::new(Uuid::new_v4().to_string(), new.key, new.data);
        let meta = self
            .manager
            .execute("records.create", |conn| {
                let record = record.clone();
                async move { repository::insert(&*conn, &record).await }
            })
            .await
            .map_err(|err| key_conflict(err, &record.key))?;
        debug!(id = %record.id, row = ?meta.last_insert_id, "record created");

        self.invalidate([
            keys::by_secondary(&record.key),
            keys::by_primary(&record.id),
            keys::all(),
        ])
        .await;
        Ok(record)
    }

    pub async fn update(&self, id: &str, patch: RecordPatch) -> DataResult<Record> {
        if let Some(key) = &patch.key {
            validate_key(key).map_err(DataError::validation)?;
        }

        let existing = self
            .fetch_by_id(id)
            .await?
            .ok_or_else(|| DataError::NotFound { id: id.to_string() })?;

        if let Some(new_key) = patch.key_change(&existing) {
            if !self.is_key_available(new_key, Some(id)).await? {
                return Err(DataError::Conflict {
                    key: new_key.to_string(),
                });
            }
        }

        let updated = existing.patched(&patch);
        let changed = self
            .manager
            .execute("records.update", |conn| {
                let updated = updated.clone();
                async move { repository::update(&*conn, &updated).await }
            })
            .await
            .map_err(|err| key_conflict(err, &updated.key))?;
        if changed == 0 {
            return Err(DataError::NotFound { id: id.to_string() });
        }

        let mut stale = vec![
            keys::by_secondary(&existing.key),
            keys::by_primary(&existing.id),
            keys::all(),
        ];
        if updated.key != existing.key {
            stale.push(keys::by_secondary(&updated.key));
        }
        self.invalidate(stale).await;
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> DataResult<()> {
        let existing = self
            .fetch_by_id(id)
            .await?
            .ok_or_else(|| DataError::NotFound { id: id.to_string() })?;

        let changed = self
            .manager
            .execute("records.delete", |conn| {
                let id = existing.id.clone();
                async move { repository::delete(&*conn, &id).await }
            })
            .await?;
        if changed == 0 {
            return Err(DataError::NotFound { id: id.to_string() });
        }

        self.invalidate([
            keys::by_secondary(&existing.key),
            keys::by_primary(&existing.id),
            keys::all(),
        ])
        .await;
        Ok(())
    }

    /// `true` if no record in the store uses `key`.
    pub async fn validate_unique_key(&self, key: &str) -> DataResult<bool> {
        self.is_key_available(key, None).await
    }

    /// `true` if `key` is unused, or used only by the record `owner`.
    pub async fn is_key_available(&self, key: &str, owner: Option<&str>) -> DataResult<bool> {
        Ok(match self.fetch_by_key(key).await? {
            Some(record) => owner == Some(record.id.as_str()),
            None => true,
        })
    }

    /// Load every record into the cache once. Later calls are no-ops and
    /// return 0; a failed warm-up may be retried.
    pub async fn warm_up(&self) -> DataResult<usize> {
        if self.warmed.load(Ordering::Acquire) {
            return Ok(0);
        }
        let _guard = self.warming.lock().await;
        if self.warmed.load(Ordering::Acquire) {
            return Ok(0);
        }

        let records = self.fetch_all().await?;
        let mut entries = Vec::with_capacity(records.len() * 2);
        for record in &records {
            let payload = Bytes::from(serde_json::to_vec(record)?);
            entries.push((keys::by_secondary(&record.key), payload.clone()));
            entries.push((keys::by_primary(&record.id), payload));
        }
        self.cache.warm(entries).await?;

        self.warmed.store(true, Ordering::Release);
        info!(records = records.len(), "record cache warmed");
        Ok(records.len())
    }

    pub fn is_warmed(&self) -> bool {
        self.warmed.load(Ordering::Acquire)
    }

    async fn fetch_by_key(&self, key: &str) -> DataResult<Option<Record>> {
        self.manager
            .execute("records.get_by_key", |conn| {
                let key = key.to_string();
                async move { repository::find_by_key(&*conn, &key).await }
            })
            .await
    }

    async fn fetch_by_id(&self, id: &str) -> DataResult<Option<Record>> {
        self.manager
            .execute("records.get_by_id", |conn| {
                let id = id.to_string();
                async move { repository::find_by_id(&*conn, &id).await }
            })
            .await
    }

    async fn fetch_all(&self) -> DataResult<Vec<Record>> {
        self.manager
            .execute("records.get_all", |conn| async move {
                repository::list_all(&*conn).await
            })
            .await
    }

    async fn cached(&self, cache_key: &str) -> Option<Record> {
        let bytes = match self.cache.get(cache_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(key = cache_key, "cache miss");
                return None;
            }
            Err(err) => {
                warn!(key = cache_key, error = %err, "cache read failed");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(record) => {
                debug!(key = cache_key, "cache hit");
                Some(record)
            }
            Err(err) => {
                warn!(key = cache_key, error = %err, "dropping undecodable cache entry");
                self.invalidate([cache_key.to_string()]).await;
                None
            }
        }
    }

    /// Cache a record under both of its keys.
    async fn remember(&self, record: &Record) {
        let payload = match serde_json::to_vec(record) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                warn!(id = %record.id, error = %err, "cannot encode record for cache");
                return;
            }
        };

        let ttl = self.cache.default_ttl();
        for cache_key in [keys::by_secondary(&record.key), keys::by_primary(&record.id)] {
            if let Err(err) = self.cache.set(&cache_key, payload.clone(), ttl).await {
                warn!(key = %cache_key, error = %err, "cache write failed");
            }
        }
    }

    /// Best-effort invalidation: failures are logged, never returned.
    async fn invalidate<I>(&self, cache_keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        for cache_key in cache_keys {
            if let Err(err) = self.cache.invalidate(&cache_key).await {
                warn!(key = %cache_key, error = %err, "cache invalidation failed after write");
            }
        }
    }
}
