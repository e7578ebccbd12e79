//! Error types for the data-access layer.
//!
//! Two layers of errors exist. [`StoreError`] is what a backing store
//! reports; it never leaves the crate's data API. [`DataError`] is what
//! callers see: validation failures, timeouts, exhausted retries and
//! unavailability, each typed so the caller can decide what to do.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::RegexSet;

/// Errors reported by a backing store or one of its connections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A connection could not be established or was lost.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A statement was rejected or failed while executing.
    #[error("query failed: {0}")]
    Query(String),

    /// The connection was closed underneath the caller.
    #[error("connection closed")]
    Closed,
}

/// Message patterns that mark an error as permanent: retrying cannot help.
static NON_RETRYABLE: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\bunique\b",
        r"(?i)\bnot null\b",
        r"(?i)\bcheck constraint\b",
        r"(?i)\bforeign key\b",
        r"(?i)constraint",
        r"(?i)syntax error",
        r#"(?i)near ""#,
        r"(?i)malformed",
        r"(?i)invalid input",
        r"(?i)(data)?type mismatch",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
});

impl StoreError {
    /// Whether this error matches one of the permanent failure patterns.
    ///
    /// Connection-level failures are always transient; only statement
    /// failures are inspected.
    pub fn is_permanent(&self) -> bool {
        match self {
            StoreError::Query(message) => NON_RETRYABLE.is_match(message),
            StoreError::Connect(_) | StoreError::Closed => false,
        }
    }
}

/// The error type callers of the data API receive.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// Malformed input or a constraint violation. Never retried.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// The secondary key is already owned by another record.
    #[error("key already in use: '{key}'")]
    Conflict { key: String },

    /// No record exists with the given id.
    #[error("record not found: '{id}'")]
    NotFound { id: String },

    /// A single attempt exceeded its deadline.
    #[error("{label} timed out after {after:?}")]
    Timeout { label: String, after: Duration },

    /// Transport failure that persisted through every retry.
    #[error("{label} failed after {attempts} attempt(s): {source}")]
    Connection {
        label: String,
        attempts: u32,
        #[source]
        source: Box<DataError>,
    },

    /// The store could not serve a write, or a read with no fallback.
    #[error("{operation} unavailable: {source}")]
    Unavailable {
        operation: String,
        #[source]
        source: Box<DataError>,
    },

    /// A single store failure inside one attempt.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A cache backend rejected an operation.
    #[error("cache error: {message}")]
    Cache { message: String },

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading a local dataset failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DataError {
    pub fn validation(message: impl Into<String>) -> Self {
        DataError::Validation {
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        DataError::Cache {
            message: message.into(),
        }
    }

    /// Whether the connection manager may retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            DataError::Timeout { .. } => true,
            DataError::Store(err) => !err.is_permanent(),
            _ => false,
        }
    }

    /// Whether this error means the store could not be reached, as opposed
    /// to the store answering with a rejection.
    ///
    /// Only transport errors entitle the orchestrator to substitute data.
    pub fn is_transport(&self) -> bool {
        match self {
            DataError::Timeout { .. } | DataError::Connection { .. } => true,
            DataError::Unavailable { .. } => true,
            DataError::Store(err) => !err.is_permanent(),
            _ => false,
        }
    }

    /// Turn a permanent store failure into a validation error.
    pub(crate) fn classify(err: StoreError) -> Self {
        if err.is_permanent() {
            DataError::Validation {
                message: err.to_string(),
            }
        } else {
            DataError::Store(err)
        }
    }
}

/// A specialized Result type for data operations.
pub type DataResult<T> = Result<T, DataError>;

/// A specialized Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_errors_are_permanent() {
        let err = StoreError::Query("UNIQUE constraint failed: records.key".to_string());
        assert!(err.is_permanent());

        let err = StoreError::Query("near \"SELEC\": syntax error".to_string());
        assert!(err.is_permanent());

        let err = StoreError::Query("malformed JSON in payload".to_string());
        assert!(err.is_permanent());
    }

    #[test]
    fn test_transport_errors_are_transient() {
        assert!(!StoreError::Connect("refused".to_string()).is_permanent());
        assert!(!StoreError::Closed.is_permanent());
        assert!(!StoreError::Query("network reset".to_string()).is_permanent());
    }

    #[test]
    fn test_classify() {
        let err = DataError::classify(StoreError::Query("NOT NULL constraint failed".into()));
        assert!(matches!(err, DataError::Validation { .. }));
        assert!(!err.is_retryable());

        let err = DataError::classify(StoreError::Connect("down".into()));
        assert!(matches!(err, DataError::Store(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = DataError::Conflict {
            key: "web-01".to_string(),
        };
        assert_eq!(format!("{}", err), "key already in use: 'web-01'");

        let err = DataError::Connection {
            label: "records.get".to_string(),
            attempts: 3,
            source: Box::new(DataError::Store(StoreError::Connect("refused".into()))),
        };
        assert_eq!(
            format!("{}", err),
            "records.get failed after 3 attempt(s): connect failed: refused"
        );
    }

    #[test]
    fn test_transport_classification() {
        let timeout = DataError::Timeout {
            label: "ping".into(),
            after: Duration::from_millis(5),
        };
        assert!(timeout.is_transport());
        assert!(!DataError::validation("bad").is_transport());
        assert!(!DataError::NotFound { id: "x".into() }.is_transport());
    }
}
