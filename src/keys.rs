//! Cache key derivation.
//!
//! Every call site that addresses a record in the cache goes through these
//! functions so that they agree on cache identity.

const PREFIX: &str = "record";

/// Key for a record addressed by its secondary (unique) key.
pub fn by_secondary(key: &str) -> String {
    format!("{}:secondary:{}", PREFIX, key)
}

/// Key for a record addressed by its primary id.
pub fn by_primary(id: &str) -> String {
    format!("{}:primary:{}", PREFIX, id)
}

/// Singleton key for the "all records" aggregate.
pub fn all() -> String {
    format!("{}:all", PREFIX)
}
