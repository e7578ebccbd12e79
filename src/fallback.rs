//! Static data served when the store cannot be reached.

use indexmap::IndexMap;
use std::path::Path;

use crate::error::DataResult;
use crate::record::Record;

/// A read-only dataset consulted when the store is unreachable.
pub trait FallbackProvider: Send + Sync {
    fn get_by_key(&self, key: &str) -> Option<Record>;

    fn get_all(&self) -> Vec<Record>;

    fn get_by_id(&self, id: &str) -> Option<Record> {
        self.get_all().into_iter().find(|record| record.id == id)
    }
}

/// Fallback records held in memory, indexed by secondary key.
///
/// Later records replace earlier ones with the same key.
#[derive(Debug, Clone, Default)]
pub struct StaticFallback {
    records: IndexMap<String, Record>,
}

impl StaticFallback {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.key.clone(), record))
                .collect(),
        }
    }

    /// Parse a JSON array of records.
    pub fn from_json_str(json: &str) -> DataResult<Self> {
        let records: Vec<Record> = serde_json::from_str(json)?;
        Ok(Self::new(records))
    }

    /// Load a JSON array of records from a file.
    pub fn from_path(path: impl AsRef<Path>) -> DataResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FallbackProvider for StaticFallback {
    fn get_by_key(&self, key: &str) -> Option<Record> {
        self.records.get(key).cloned()
    }

    fn get_all(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    fn get_by_id(&self, id: &str) -> Option<Record> {
        self.records.values().find(|record| record.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;

    #[test]
    fn test_lookup_by_key_and_id() {
        let fallback = StaticFallback::from_json_str(
            r#"[{"id": "1", "key": "web-01", "data": {"ip": "10.0.0.1"}},
                {"id": "2", "key": "web-02"}]"#,
        )
        .unwrap();

        assert_eq!(fallback.len(), 2);
        assert_eq!(fallback.get_by_key("web-01").unwrap().id, "1");
        assert_eq!(fallback.get_by_id("2").unwrap().key, "web-02");
        assert!(fallback.get_by_key("web-03").is_none());
    }

    #[test]
    fn test_later_duplicates_win() {
        let fallback = StaticFallback::new(vec![
            Record::new("1", "web-01", Default::default()),
            Record::new("9", "web-01", Default::default()),
        ]);

        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback.get_by_key("web-01").unwrap().id, "9");
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            StaticFallback::from_json_str("{not json"),
            Err(DataError::Serialization(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            StaticFallback::from_path("/nonexistent/fallback.json"),
            Err(DataError::Io(_))
        ));
    }
}
