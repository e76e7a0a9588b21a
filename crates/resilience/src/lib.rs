//! Resilience primitives guarding calls between services.
//!
//! This crate provides:
//! - [`CircuitBreakerRegistry`]: per-dependency circuit breakers
//! - [`Executor`]: bounded retries with exponential backoff and deadlines
//! - [`RateLimiter`]: per-client token buckets for the entry point
//!
//! Nothing here is a process-wide singleton. Registries are plain values
//! shared through `Arc` so every test can build an isolated set.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    CallOutcome, CircuitBreakerRegistry, CircuitState, CircuitTransition, DependencyCircuit,
};
pub use config::{CircuitBreakerConfig, RateLimitConfig, ResilienceConfig, RetryConfig};
pub use error::{
    CallError, CircuitOpenError, ExecutionError, PermanentKind, RateLimitExceeded, Result,
};
pub use rate_limit::{RateLimitBucket, RateLimiter};
pub use retry::{Executor, RetryContext, RetryPolicy, calculate_backoff};
