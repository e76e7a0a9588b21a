//! Application configuration loaded from environment variables.

use std::time::Duration;

use resilience::{CircuitBreakerConfig, RateLimitConfig, ResilienceConfig, RetryConfig};

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL saga log; the in-memory log is used when unset
/// - `CIRCUIT_FAILURE_THRESHOLD`, `CIRCUIT_WINDOW_MS`, `CIRCUIT_RESET_TIMEOUT_MS`
/// - `RETRY_MAX_ATTEMPTS`, `RETRY_BASE_BACKOFF_MS`, `RETRY_MAX_BACKOFF_MS`
/// - `CALL_TIMEOUT_MS` (per attempt), `CALL_DEADLINE_MS` (whole call)
/// - `RATE_LIMIT_CAPACITY`, `RATE_LIMIT_REFILL_PER_SEC`, `RATE_LIMIT_MAX_CLIENTS`
/// - `SAGA_TIMEOUT_MS`
/// - `ADMIN_USERNAME`, `ADMIN_PASSWORD`: seeds an administrator at startup
///
/// Unparsable values fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub resilience: ResilienceConfig,
    pub saga_timeout: Duration,
    pub admin: Option<AdminAccount>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdminAccount {
    pub username: String,
    pub password: String,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|value| value.parse::<f64>().ok());
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|value| value.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let breaker = defaults.resilience.circuit_breaker;
        let retry = defaults.resilience.retry;
        let rate_limit = defaults.resilience.rate_limit;

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            resilience: ResilienceConfig {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: lookup("CIRCUIT_FAILURE_THRESHOLD")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(breaker.failure_threshold),
                    window: millis("CIRCUIT_WINDOW_MS", breaker.window),
                    reset_timeout: millis("CIRCUIT_RESET_TIMEOUT_MS", breaker.reset_timeout),
                },
                retry: RetryConfig {
                    max_attempts: lookup("RETRY_MAX_ATTEMPTS")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(retry.max_attempts),
                    base_backoff: millis("RETRY_BASE_BACKOFF_MS", retry.base_backoff),
                    max_backoff: millis("RETRY_MAX_BACKOFF_MS", retry.max_backoff),
                    call_timeout: millis("CALL_TIMEOUT_MS", retry.call_timeout),
                    call_deadline: millis("CALL_DEADLINE_MS", retry.call_deadline),
                },
                rate_limit: RateLimitConfig {
                    capacity: parse("RATE_LIMIT_CAPACITY").unwrap_or(rate_limit.capacity),
                    refill_per_second: parse("RATE_LIMIT_REFILL_PER_SEC")
                        .unwrap_or(rate_limit.refill_per_second),
                    max_clients: lookup("RATE_LIMIT_MAX_CLIENTS")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(rate_limit.max_clients),
                },
            },
            saga_timeout: millis("SAGA_TIMEOUT_MS", defaults.saga_timeout),
            admin: match (lookup("ADMIN_USERNAME"), lookup("ADMIN_PASSWORD")) {
                (Some(username), Some(password)) => Some(AdminAccount { username, password }),
                _ => None,
            },
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            resilience: ResilienceConfig::default(),
            saga_timeout: Duration::from_secs(30),
            admin: None,
        }
    }
}
