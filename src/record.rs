//! The record type managed by the data layer.
//!
//! The layer only cares about identity: a primary `id` and a unique
//! secondary `key` (a hostname, for instance). Everything else is an
//! opaque JSON object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Secondary key, unique across all records.
    pub key: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, key: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            data,
        }
    }

    /// Apply a patch, returning the updated record.
    ///
    /// Fields present in `patch.data` replace the corresponding top-level
    /// fields; fields absent from it are kept.
    pub fn patched(&self, patch: &RecordPatch) -> Record {
        let mut next = self.clone();
        if let Some(key) = &patch.key {
            next.key = key.clone();
        }
        if let Some(data) = &patch.data {
            for (field, value) in data {
                next.data.insert(field.clone(), value.clone());
            }
        }
        next
    }
}

/// Input for creating a record. The id is assigned on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub key: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl NewRecord {
    pub fn new(key: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            data,
        }
    }
}

/// A partial update. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
}

impl RecordPatch {
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    /// The new secondary key, if the patch actually changes it.
    pub fn key_change<'a>(&'a self, current: &Record) -> Option<&'a str> {
        self.key.as_deref().filter(|key| *key != current.key)
    }
}

/// Where a read was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    Cache,
    Store,
    /// The store was unreachable and the fallback dataset had the record.
    Fallback,
    /// The store was unreachable and the fallback dataset lacked the record.
    Miss,
}

/// A single-record read together with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lookup {
    pub record: Option<Record>,
    pub source: ReadSource,
}

impl Lookup {
    pub fn new(record: Option<Record>, source: ReadSource) -> Self {
        Self { record, source }
    }
}

/// Validate a secondary key before it reaches the store.
pub(crate) fn validate_key(key: &str) -> Result<(), String> {
    if key.trim().is_empty() {
        return Err("key must not be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("key '{}' must not contain whitespace", key));
    }
    Ok(())
}
