//! The backing store capability.
//!
//! A [`Store`] hands out connections; a [`StoreConnection`] executes
//! parameterized [`Statement`]s and returns rows or mutation metadata.
//! Statement text is opaque to this layer: dialects and schema are the
//! store's business.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// One result row, keyed by column name.
pub type Row = Map<String, Value>;

/// Statement used as the liveness probe.
pub const PROBE_SQL: &str = "SELECT 1 AS ok";

/// Column and value the probe must return.
pub const PROBE_COLUMN: &str = "ok";
pub const PROBE_SENTINEL: i64 = 1;

/// A prepared statement with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// The 1-based positional parameter, if bound.
    pub fn param(&self, position: usize) -> Option<&Value> {
        position.checked_sub(1).and_then(|i| self.params.get(i))
    }
}

/// Metadata returned by a mutating statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunMeta {
    pub last_insert_id: Option<i64>,
    pub rows_changed: u64,
}

/// A live handle to the backing store.
#[async_trait]
pub trait StoreConnection: Send + Sync + 'static {
    fn prepare(&self, sql: &str) -> Statement {
        Statement::new(sql)
    }

    /// First row of the result, if any.
    async fn first(&self, statement: &Statement) -> StoreResult<Option<Row>>;

    async fn all(&self, statement: &Statement) -> StoreResult<Vec<Row>>;

    async fn run(&self, statement: &Statement) -> StoreResult<RunMeta>;

    /// Execute several statements as one atomic unit.
    async fn batch(&self, statements: &[Statement]) -> StoreResult<Vec<RunMeta>>;
}

/// Factory for store connections.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Connection: StoreConnection;

    async fn connect(&self) -> StoreResult<Self::Connection>;
}

/// Run the liveness probe and check its sentinel.
pub async fn probe<C: StoreConnection + ?Sized>(conn: &C) -> StoreResult<()> {
    let statement = conn.prepare(PROBE_SQL);
    let row = conn.first(&statement).await?;

    match row.as_ref().and_then(|r| r.get(PROBE_COLUMN)).and_then(Value::as_i64) {
        Some(PROBE_SENTINEL) => Ok(()),
        _ => Err(StoreError::Connect(
            "liveness probe returned an unexpected result".to_string(),
        )),
    }
}
