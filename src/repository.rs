//! Record statements and row mapping.
//!
//! Each function runs one record operation on a single connection. Retry,
//! pooling and caching happen above this layer.

use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::record::Record;
use crate::store::{Row, RunMeta, StoreConnection};

pub const SELECT_BY_KEY: &str = "SELECT id, key, data FROM records WHERE key = ?1";
pub const SELECT_BY_ID: &str = "SELECT id, key, data FROM records WHERE id = ?1";
pub const SELECT_ALL: &str = "SELECT id, key, data FROM records ORDER BY key";
pub const INSERT: &str = "INSERT INTO records (id, key, data) VALUES (?1, ?2, ?3)";
pub const UPDATE: &str = "UPDATE records SET key = ?2, data = ?3 WHERE id = ?1";
pub const DELETE: &str = "DELETE FROM records WHERE id = ?1";

pub async fn find_by_key<C: StoreConnection + ?Sized>(
    conn: &C,
    key: &str,
) -> StoreResult<Option<Record>> {
    let statement = conn.prepare(SELECT_BY_KEY).bind(key);
    conn.first(&statement).await?.map(decode).transpose()
}

pub async fn find_by_id<C: StoreConnection + ?Sized>(
    conn: &C,
    id: &str,
) -> StoreResult<Option<Record>> {
    let statement = conn.prepare(SELECT_BY_ID).bind(id);
    conn.first(&statement).await?.map(decode).transpose()
}

pub async fn list_all<C: StoreConnection + ?Sized>(conn: &C) -> StoreResult<Vec<Record>> {
    let statement = conn.prepare(SELECT_ALL);
    conn.all(&statement).await?.into_iter().map(decode).collect()
}

pub async fn insert<C: StoreConnection + ?Sized>(conn: &C, record: &Record) -> StoreResult<RunMeta> {
    let statement = conn
        .prepare(INSERT)
        .bind(record.id.as_str())
        .bind(record.key.as_str())
        .bind(encode_data(record)?);
    conn.run(&statement).await
}

/// Write the full record. Returns the number of rows changed.
pub async fn update<C: StoreConnection + ?Sized>(conn: &C, record: &Record) -> StoreResult<u64> {
    let statement = conn
        .prepare(UPDATE)
        .bind(record.id.as_str())
        .bind(record.key.as_str())
        .bind(encode_data(record)?);
    Ok(conn.run(&statement).await?.rows_changed)
}

pub async fn delete<C: StoreConnection + ?Sized>(conn: &C, id: &str) -> StoreResult<u64> {
    let statement = conn.prepare(DELETE).bind(id);
    Ok(conn.run(&statement).await?.rows_changed)
}

fn encode_data(record: &Record) -> StoreResult<String> {
    serde_json::to_string(&record.data)
        .map_err(|e| StoreError::Query(format!("invalid input: {}", e)))
}

/// Map a row to a record. `data` may be JSON text or an inline object.
pub(crate) fn decode(row: Row) -> StoreResult<Record> {
    let text = |column: &str| -> StoreResult<String> {
        match row.get(column) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(StoreError::Query(format!(
                "malformed row: missing column '{}'",
                column
            ))),
        }
    };

    let id = text("id")?;
    let key = text("key")?;
    let data = match row.get("data") {
        Some(Value::String(raw)) => serde_json::from_str(raw)
            .map_err(|e| StoreError::Query(format!("malformed data column: {}", e)))?,
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Default::default(),
        Some(other) => {
            return Err(StoreError::Query(format!(
                "malformed data column: expected object, got {}",
                other
            )))
        }
    };

    Ok(Record { id, key, data })
}
