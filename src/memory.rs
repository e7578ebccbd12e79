//! An in-process store that understands the record statements.
//!
//! `MemoryStore` backs the binary and the tests. It enforces secondary-key
//! uniqueness the way a relational store would (a constraint error), and
//! can be told to become unreachable, to fail the next few statements, or
//! to respond slowly.
//!
//! Injected faults apply to record statements only; the liveness probe is
//! affected only by availability and latency.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::record::Record;
use crate::repository;
use crate::store::{Row, RunMeta, Statement, Store, StoreConnection, PROBE_SQL};

#[derive(Debug, Default)]
struct MemoryState {
    records: IndexMap<String, Record>,
    next_rowid: i64,
    unavailable: bool,
    fail_next: u32,
    fail_with: Option<StoreError>,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    statements: AtomicU64,
}

/// Shared in-memory record store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    counters: Arc<Counters>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Record>,
    {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Insert or replace a record directly, bypassing statements and faults.
    pub fn insert(&self, record: Record) {
        let mut state = self.lock();
        state.next_rowid += 1;
        state.records.insert(record.id.clone(), record);
    }

    /// All stored records, in insertion order.
    pub fn records(&self) -> Vec<Record> {
        self.lock().records.values().cloned().collect()
    }

    /// When unavailable, connects and every statement fail.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Fail the next `count` record statements with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    /// Fail every record statement with `err` until cleared with `None`.
    pub fn fail_with(&self, err: Option<StoreError>) {
        self.lock().fail_with = err;
    }

    /// Delay every statement by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn connect_count(&self) -> u64 {
        self.counters.connects.load(Ordering::Relaxed)
    }

    /// Record statements received, including failed ones. Probes are not
    /// counted.
    pub fn statement_count(&self) -> u64 {
        self.counters.statements.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check faults for one statement and return the latency to apply.
    fn admit(&self, statement: &Statement) -> StoreResult<Option<Duration>> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(StoreError::Connect("store unreachable".to_string()));
        }
        if statement.sql() == PROBE_SQL {
            return Ok(state.latency);
        }

        self.counters.statements.fetch_add(1, Ordering::Relaxed);
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Query("network error: connection reset".to_string()));
        }
        if let Some(err) = &state.fail_with {
            return Err(err.clone());
        }
        Ok(state.latency)
    }

    async fn execute(&self, statement: &Statement) -> StoreResult<Outcome> {
        if let Some(latency) = self.admit(statement)? {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        apply(&mut state, statement)
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Connection = MemoryConnection;

    async fn connect(&self) -> StoreResult<MemoryConnection> {
        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        if self.lock().unavailable {
            return Err(StoreError::Connect("store unreachable".to_string()));
        }
        Ok(MemoryConnection {
            store: self.clone(),
        })
    }
}

/// Connection handed out by [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    store: MemoryStore,
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn first(&self, statement: &Statement) -> StoreResult<Option<Row>> {
        Ok(self
            .store
            .execute(statement)
            .await?
            .into_rows()
            .into_iter()
            .next())
    }

    async fn all(&self, statement: &Statement) -> StoreResult<Vec<Row>> {
        Ok(self.store.execute(statement).await?.into_rows())
    }

    async fn run(&self, statement: &Statement) -> StoreResult<RunMeta> {
        Ok(self.store.execute(statement).await?.into_meta())
    }

    async fn batch(&self, statements: &[Statement]) -> StoreResult<Vec<RunMeta>> {
        let mut latency = None;
        for statement in statements {
            latency = self.store.admit(statement)?.or(latency);
        }
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        // Apply to a copy and commit only if every statement succeeds.
        let mut state = self.store.lock();
        let mut scratch = MemoryState {
            records: state.records.clone(),
            next_rowid: state.next_rowid,
            ..Default::default()
        };
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            results.push(apply(&mut scratch, statement)?.into_meta());
        }
        state.records = scratch.records;
        state.next_rowid = scratch.next_rowid;
        Ok(results)
    }
}

enum Outcome {
    Rows(Vec<Row>),
    Meta(RunMeta),
}

impl Outcome {
    fn into_rows(self) -> Vec<Row> {
        match self {
            Outcome::Rows(rows) => rows,
            Outcome::Meta(_) => Vec::new(),
        }
    }

    fn into_meta(self) -> RunMeta {
        match self {
            Outcome::Rows(_) => RunMeta::default(),
            Outcome::Meta(meta) => meta,
        }
    }
}

fn apply(state: &mut MemoryState, statement: &Statement) -> StoreResult<Outcome> {
    match statement.sql() {
        PROBE_SQL => Ok(Outcome::Rows(vec![to_row(json!({"ok": 1}))])),
        repository::SELECT_BY_KEY => {
            let key = text_param(statement, 1)?;
            Ok(Outcome::Rows(
                state
                    .records
                    .values()
                    .filter(|r| r.key == key)
                    .map(record_row)
                    .collect(),
            ))
        }
        repository::SELECT_BY_ID => {
            let id = text_param(statement, 1)?;
            Ok(Outcome::Rows(
                state.records.get(&id).map(record_row).into_iter().collect(),
            ))
        }
        repository::SELECT_ALL => {
            let mut records: Vec<&Record> = state.records.values().collect();
            records.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(Outcome::Rows(records.into_iter().map(record_row).collect()))
        }
        repository::INSERT => {
            let record = record_param(statement)?;
            if state.records.contains_key(&record.id) {
                return Err(StoreError::Query(
                    "UNIQUE constraint failed: records.id".to_string(),
                ));
            }
            if state.records.values().any(|r| r.key == record.key) {
                return Err(StoreError::Query(
                    "UNIQUE constraint failed: records.key".to_string(),
                ));
            }
            state.next_rowid += 1;
            state.records.insert(record.id.clone(), record);
            Ok(Outcome::Meta(RunMeta {
                last_insert_id: Some(state.next_rowid),
                rows_changed: 1,
            }))
        }
        repository::UPDATE => {
            let record = record_param(statement)?;
            if state
                .records
                .values()
                .any(|r| r.key == record.key && r.id != record.id)
            {
                return Err(StoreError::Query(
                    "UNIQUE constraint failed: records.key".to_string(),
                ));
            }
            let changed = match state.records.get_mut(&record.id) {
                Some(existing) => {
                    *existing = record;
                    1
                }
                None => 0,
            };
            Ok(Outcome::Meta(RunMeta {
                last_insert_id: None,
                rows_changed: changed,
            }))
        }
        repository::DELETE => {
            let id = text_param(statement, 1)?;
            let changed = u64::from(state.records.shift_remove(&id).is_some());
            Ok(Outcome::Meta(RunMeta {
                last_insert_id: None,
                rows_changed: changed,
            }))
        }
        other => Err(StoreError::Query(format!("near \"{}\": syntax error", other))),
    }
}

fn text_param(statement: &Statement, position: usize) -> StoreResult<String> {
    match statement.param(position) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(StoreError::Query(format!(
            "datatype mismatch for ?{}: {}",
            position, other
        ))),
        None => Err(StoreError::Query(format!(
            "invalid input: missing parameter ?{}",
            position
        ))),
    }
}

/// Parameters `(?1 id, ?2 key, ?3 data-json)`.
fn record_param(statement: &Statement) -> StoreResult<Record> {
    let id = text_param(statement, 1)?;
    let key = text_param(statement, 2)?;
    let data = serde_json::from_str(&text_param(statement, 3)?)
        .map_err(|e| StoreError::Query(format!("malformed JSON: {}", e)))?;
    Ok(Record { id, key, data })
}

fn record_row(record: &Record) -> Row {
    let data = serde_json::to_string(&record.data).unwrap_or_else(|_| "{}".to_string());
    to_row(json!({"id": record.id, "key": record.key, "data": data}))
}

fn to_row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}
