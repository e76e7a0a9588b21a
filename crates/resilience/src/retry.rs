//! Retry/timeout executor for outbound calls.
//!
//! ```text
//! execute(dependency, policy, action)
//!     → circuit breaker gate (rejected: fail fast, no attempt counted)
//!     → attempt under per-attempt timeout
//!     → transient failure: backoff base * 2^attempt + jitter, retry
//!     → permanent failure: fail immediately
//!     → retries exhausted / deadline passed: terminal ExecutionError
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::circuit_breaker::{CallOutcome, CircuitBreakerRegistry};
use crate::config::RetryConfig;
use crate::error::{CallError, ExecutionError};

/// Bounds applied to one logical call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
    /// Deadline for the whole call.
    pub overall_timeout: Duration,
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn single_attempt(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            attempt_timeout: timeout,
            overall_timeout: timeout,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
            attempt_timeout: config.call_timeout,
            overall_timeout: config.call_deadline,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Per-call retry state handed to the action on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// Zero-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub deadline: Instant,
}

impl RetryContext {
    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }
}

/// Exponential backoff for the given zero-based attempt, with up to 10% jitter.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    let delay = base.saturating_mul(factor).min(max);

    let jitter_range = delay.as_millis() as u64 / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    delay + Duration::from_millis(jitter)
}

/// Runs outbound calls through the circuit breaker with bounded retries.
#[derive(Clone)]
pub struct Executor {
    breakers: Arc<CircuitBreakerRegistry>,
}

impl Executor {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { breakers }
    }

    /// The registry this executor reports outcomes to.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Executes `action` against `dependency` under `policy`.
    ///
    /// Transient failures and attempt timeouts count as breaker failures.
    /// A permanent rejection counts as a healthy response: the dependency
    /// answered, it just said no.
    pub async fn execute<T, F, Fut>(
        &self,
        dependency: &str,
        policy: &RetryPolicy,
        mut action: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let started = Instant::now();
        let deadline = started + policy.overall_timeout;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            self.breakers.before_call(dependency)?;

            let ctx = RetryContext {
                attempt,
                max_attempts,
                base_backoff: policy.base_backoff,
                deadline,
            };
            metrics::counter!("executor_attempts_total", "dependency" => dependency.to_string())
                .increment(1);

            let attempt_timeout = policy
                .attempt_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            let result = match tokio::time::timeout(attempt_timeout, action(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(CallError::transient(format!(
                    "attempt timed out after {attempt_timeout:?}"
                ))),
            };

            let message = match result {
                Ok(value) => {
                    self.breakers
                        .record_outcome(dependency, CallOutcome::Success);
                    return Ok(value);
                }
                Err(CallError::Permanent { kind, message }) => {
                    self.breakers
                        .record_outcome(dependency, CallOutcome::Success);
                    return Err(ExecutionError::Permanent {
                        dependency: dependency.to_string(),
                        kind,
                        message,
                    });
                }
                Err(CallError::Transient(message)) => {
                    self.breakers
                        .record_outcome(dependency, CallOutcome::Failure);
                    message
                }
            };

            attempt += 1;
            if attempt >= max_attempts {
                tracing::warn!(dependency, attempts = attempt, error = %message, "retries exhausted");
                return Err(ExecutionError::RetriesExhausted {
                    dependency: dependency.to_string(),
                    attempts: attempt,
                    last_error: message,
                });
            }

            let delay = calculate_backoff(attempt - 1, policy.base_backoff, policy.max_backoff);
            if Instant::now() + delay >= deadline {
                tracing::warn!(dependency, attempts = attempt, "call deadline exceeded");
                return Err(ExecutionError::DeadlineExceeded {
                    dependency: dependency.to_string(),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                });
            }

            tracing::debug!(dependency, attempt, ?delay, error = %message, "retrying after transient failure");
            tokio::time::sleep(delay).await;
        }
    }

    /// Like [`execute`](Self::execute), but lets the caller turn a terminal
    /// error into a value. Returning `None` from `fallback` keeps the error.
    pub async fn execute_with_fallback<T, F, Fut, G>(
        &self,
        dependency: &str,
        policy: &RetryPolicy,
        action: F,
        fallback: G,
    ) -> Result<T, ExecutionError>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
        G: FnOnce(&ExecutionError) -> Option<T>,
    {
        match self.execute(dependency, policy, action).await {
            Ok(value) => Ok(value),
            Err(err) => match fallback(&err) {
                Some(value) => {
                    tracing::info!(dependency, kind = err.kind(), "serving fallback");
                    metrics::counter!("executor_fallbacks_total", "dependency" => dependency.to_string())
                        .increment(1);
                    Ok(value)
                }
                None => Err(err),
            },
        }
    }
}
