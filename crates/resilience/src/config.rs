//! Tunables for the resilience primitives.
//!
//! Every threshold and timing used by the breaker, executor and limiter is
//! read from these structs; nothing is hardcoded at the call sites.

use std::time::Duration;

/// Circuit breaker settings, applied per dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures within one window that open the circuit.
    pub failure_threshold: u32,
    /// Length of the fixed counting window.
    pub window: Duration,
    /// Time spent open before a trial call is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Retry and timeout settings for outbound calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for a single attempt.
    pub call_timeout: Duration,
    /// Deadline for the whole call including retries and backoff.
    pub call_deadline: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            call_timeout: Duration::from_secs(2),
            call_deadline: Duration::from_secs(10),
        }
    }
}

/// Token bucket settings for inbound admission.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum tokens a bucket holds (the burst size).
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_second: f64,
    /// Buckets kept before the least recently used one is evicted.
    pub max_clients: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20.0,
            refill_per_second: 10.0,
            max_clients: 10_000,
        }
    }
}

/// All resilience settings in one place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = ResilienceConfig::default();
        assert!(config.circuit_breaker.failure_threshold > 0);
        assert!(config.retry.max_attempts >= 1);
        assert!(config.retry.call_timeout <= config.retry.call_deadline);
        assert!(config.rate_limit.capacity >= 1.0);
        assert!(config.rate_limit.max_clients > 0);
    }
}
