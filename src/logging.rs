//! Structured logging initialization.
//!
//! RUST_LOG takes precedence over the configured level. Log lines go to
//! stderr so command output on stdout stays machine-readable.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed.
///
/// # Example
///
/// ```ignore
/// use resilient_store::config::LoggingConfig;
/// use resilient_store::logging;
///
/// logging::init(&LoggingConfig::default());
/// tracing::info!("service starting");
/// ```
pub fn init(config: &LoggingConfig) -> bool {
    let filter = build_filter(config);

    let installed = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(config.target),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_target(config.target),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(config.target),
            )
            .try_init(),
    };

    installed.is_ok()
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(config.level.as_str()).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
