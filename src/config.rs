//! Configuration for the cache, the connection manager and logging.
//!
//! Every config type follows the same builder pattern: start from
//! `new()` (the defaults), chain setters, finish with `build()`.

use std::str::FromStr;
use std::time::Duration;

/// Configuration for the TTL cache.
///
/// ```
/// use resilient_store::CacheConfig;
/// use std::time::Duration;
///
/// let config = CacheConfig::new()
///     .max_capacity(10_000)
///     .default_ttl(Duration::from_secs(300))
///     .build();
/// assert_eq!(config.get_max_capacity(), Some(10_000));
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries. When reached, the oldest tenth is evicted.
    /// `None` means unlimited.
    pub(crate) max_capacity: Option<usize>,

    /// TTL used by `set` and `warm` when no explicit TTL is given.
    pub(crate) default_ttl: Duration,

    /// Interval between background sweeps of expired entries.
    /// `None` disables the sweeper.
    pub(crate) cleanup_interval: Option<Duration>,

    /// Whether the service should start the background sweeper.
    pub(crate) background_cleanup: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: Some(1000),
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Some(Duration::from_secs(60)),
            background_cleanup: true,
        }
    }
}

impl CacheConfig {
    /// Create a new configuration builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum capacity. Use 0 for unlimited.
    pub fn max_capacity(mut self, capacity: usize) -> Self {
        self.max_capacity = if capacity == 0 { None } else { Some(capacity) };
        self
    }

    /// Set the default TTL for entries.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the interval for background cleanup. Zero disables it.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = if interval.is_zero() {
            None
        } else {
            Some(interval)
        };
        self
    }

    /// Enable or disable the background sweeper.
    pub fn background_cleanup(mut self, enabled: bool) -> Self {
        self.background_cleanup = enabled;
        self
    }

    pub fn build(self) -> Self {
        self
    }

    pub fn get_max_capacity(&self) -> Option<usize> {
        self.max_capacity
    }

    pub fn get_default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get_cleanup_interval(&self) -> Option<Duration> {
        self.cleanup_interval
    }

    pub fn get_background_cleanup(&self) -> bool {
        self.background_cleanup
    }
}

/// Retry policy for the connection manager. Immutable once the manager
/// has been built.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total attempts including the first. Clamped to at least one.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor between delays. Values below 1.0 are clamped to 1.0.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    pub fn build(self) -> Self {
        self
    }

    pub fn get_max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the given failed attempt (1-based):
    /// `min(base_delay * multiplier^(attempt - 1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let scaled = self.base_delay.as_nanos() as f64 * factor;
        if !scaled.is_finite() || scaled >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(scaled.round() as u64)
        }
    }
}

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of pooled connections.
    pub(crate) max_size: usize,
    /// Idle connections older than this are evicted.
    pub(crate) idle_timeout: Duration,
    /// Deadline for a single operation attempt.
    pub(crate) operation_timeout: Duration,
    /// Interval of the idle health sweep. `None` disables it.
    pub(crate) health_check_interval: Option<Duration>,
    /// How long shutdown waits for in-flight connections.
    pub(crate) shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            idle_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(5),
            health_check_interval: Some(Duration::from_secs(15)),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size.max(1);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Interval of the idle health sweep. Zero disables it.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = if interval.is_zero() {
            None
        } else {
            Some(interval)
        };
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> Self {
        self
    }

    pub fn get_max_size(&self) -> usize {
        self.max_size
    }

    pub fn get_operation_timeout(&self) -> Duration {
        self.operation_timeout
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset.
    pub level: String,
    pub format: LogFormat,
    /// Whether to include the event target.
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            target: false,
        }
    }
}

/// Everything needed to build a service instance.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Build a configuration from `RESILIENT_STORE_*` environment variables.
    ///
    /// Absent or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |name: &str| parse(name).map(Duration::from_millis);

        let mut config = ServiceConfig::default();

        if let Some(size) = parse("RESILIENT_STORE_CACHE_SIZE") {
            config.cache = config.cache.max_capacity(size as usize);
        }
        if let Some(ttl) = parse("RESILIENT_STORE_CACHE_TTL_SECS") {
            config.cache = config.cache.default_ttl(Duration::from_secs(ttl));
        }
        if let Some(interval) = parse("RESILIENT_STORE_CACHE_SWEEP_SECS") {
            config.cache = config
                .cache
                .cleanup_interval(Duration::from_secs(interval))
                .background_cleanup(interval > 0);
        }

        if let Some(attempts) = parse("RESILIENT_STORE_RETRY_ATTEMPTS") {
            config.retry = config.retry.max_attempts(attempts as u32);
        }
        if let Some(base) = millis("RESILIENT_STORE_RETRY_BASE_MS") {
            config.retry = config.retry.base_delay(base);
        }
        if let Some(max) = millis("RESILIENT_STORE_RETRY_MAX_MS") {
            config.retry = config.retry.max_delay(max);
        }
        if let Some(multiplier) = lookup("RESILIENT_STORE_RETRY_MULTIPLIER")
            .and_then(|v| v.trim().parse::<f64>().ok())
        {
            config.retry = config.retry.multiplier(multiplier);
        }

        if let Some(size) = parse("RESILIENT_STORE_POOL_SIZE") {
            config.pool = config.pool.max_size(size as usize);
        }
        if let Some(idle) = millis("RESILIENT_STORE_POOL_IDLE_MS") {
            config.pool = config.pool.idle_timeout(idle);
        }
        if let Some(timeout) = millis("RESILIENT_STORE_POOL_TIMEOUT_MS") {
            config.pool = config.pool.operation_timeout(timeout);
        }

        if let Some(level) = lookup("RESILIENT_STORE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = lookup("RESILIENT_STORE_LOG_FORMAT").and_then(|v| v.parse().ok()) {
            config.logging.format = format;
        }

        config
    }
}
