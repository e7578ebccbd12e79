//! Command-line interface definitions.
//!
//! The binary runs a single command against an in-process store, optionally
//! seeded from a JSON file and backed by a fallback dataset.

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Resilient record store.
///
/// Runs one record operation through the cache, store and fallback tiers
/// and prints the result as JSON.
#[derive(Parser, Debug)]
#[command(name = "resilient-store")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON array of records to load into the store.
    #[arg(long, global = true)]
    pub seed: Option<PathBuf>,

    /// JSON array of records served when the store is unreachable.
    #[arg(long, global = true)]
    pub fallback: Option<PathBuf>,

    /// Simulate an unreachable store.
    #[arg(long, global = true)]
    pub offline: bool,

    /// Load every record into the cache before running the command.
    #[arg(long, global = true)]
    pub warm: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Get a record by its secondary key.
    Get {
        key: String,
    },

    /// Get a record by its id.
    GetId {
        id: String,
    },

    /// List every record.
    List,

    /// Create a record.
    Create {
        key: String,
        /// JSON object with the record's fields.
        #[arg(long, value_parser = parse_data, default_value = "{}")]
        data: Map<String, Value>,
    },

    /// Update a record's key and/or fields.
    Update {
        id: String,
        #[arg(long)]
        key: Option<String>,
        /// JSON object merged into the record's fields.
        #[arg(long, value_parser = parse_data)]
        data: Option<Map<String, Value>>,
    },

    /// Delete a record by id.
    Delete {
        id: String,
    },

    /// Report whether a secondary key is unused.
    CheckKey {
        key: String,
    },

    /// Show store, fallback, cache and pool health.
    Health,
}

/// Parse a JSON object argument.
pub fn parse_data(input: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str(input) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        let cli = Cli::parse_from(["test", "get", "web-01"]);
        match cli.command {
            Command::Get { key } => assert_eq!(key, "web-01"),
            _ => panic!("Expected Get command"),
        }
        assert!(!cli.offline);
    }

    #[test]
    fn test_parse_create_with_data() {
        let cli = Cli::parse_from(["test", "create", "web-01", "--data", r#"{"ip":"10.0.0.1"}"#]);
        match cli.command {
            Command::Create { key, data } => {
                assert_eq!(key, "web-01");
                assert_eq!(data["ip"], "10.0.0.1");
            }
            _ => panic!("Expected Create command"),
        }
    }

    #[test]
    fn test_parse_create_defaults_to_empty_data() {
        let cli = Cli::parse_from(["test", "create", "web-01"]);
        match cli.command {
            Command::Create { data, .. } => assert!(data.is_empty()),
            _ => panic!("Expected Create command"),
        }
    }

    #[test]
    fn test_parse_update() {
        let cli = Cli::parse_from(["test", "update", "42", "--key", "web-02"]);
        match cli.command {
            Command::Update { id, key, data } => {
                assert_eq!(id, "42");
                assert_eq!(key.as_deref(), Some("web-02"));
                assert!(data.is_none());
            }
            _ => panic!("Expected Update command"),
        }
    }

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::parse_from([
            "test",
            "health",
            "--offline",
            "--fallback",
            "fallback.json",
        ]);
        assert!(cli.offline);
        assert_eq!(cli.fallback, Some(PathBuf::from("fallback.json")));
        assert!(matches!(cli.command, Command::Health));
    }

    #[test]
    fn test_parse_kebab_case_commands() {
        let cli = Cli::parse_from(["test", "check-key", "web-01"]);
        assert!(matches!(cli.command, Command::CheckKey { .. }));

        let cli = Cli::parse_from(["test", "get-id", "1"]);
        assert!(matches!(cli.command, Command::GetId { .. }));
    }

    #[test]
    fn test_rejects_non_object_data() {
        assert!(parse_data("[1, 2]").is_err());
        assert!(Cli::try_parse_from(["test", "create", "k", "--data", "nope"]).is_err());
    }
}
