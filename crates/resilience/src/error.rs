//! Error taxonomy for outbound calls and inbound admission.

use std::time::Duration;

use common::ClientId;
use thiserror::Error;

/// Why a downstream service rejected a call for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    NotFound,
    Conflict,
    Invalid,
    Unauthorized,
}

impl PermanentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermanentKind::NotFound => "not_found",
            PermanentKind::Conflict => "conflict",
            PermanentKind::Invalid => "invalid",
            PermanentKind::Unauthorized => "unauthorized",
        }
    }
}

impl std::fmt::Display for PermanentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a single failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Network blip, overload, timeout. Worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Validation or business rejection. Never retried.
    #[error("{kind}: {message}")]
    Permanent { kind: PermanentKind, message: String },
}

impl CallError {
    pub fn transient(message: impl Into<String>) -> Self {
        CallError::Transient(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::permanent(PermanentKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::permanent(PermanentKind::Conflict, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::permanent(PermanentKind::Invalid, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::permanent(PermanentKind::Unauthorized, message)
    }

    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        CallError::Permanent {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Transient(_))
    }
}

/// A call was short-circuited because the dependency's circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit for '{dependency}' is open, retry in {retry_after:?}")]
pub struct CircuitOpenError {
    pub dependency: String,
    /// Time until the next trial call may be admitted.
    pub retry_after: Duration,
}

/// An inbound request was rejected at admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded for client '{client}', retry in {retry_after:?}")]
pub struct RateLimitExceeded {
    pub client: ClientId,
    pub retry_after: Duration,
}

/// Terminal outcome of an executor call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The circuit breaker rejected the call without reaching the dependency.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The dependency rejected the call; it was not retried.
    #[error("'{dependency}' rejected the call ({kind}): {message}")]
    Permanent {
        dependency: String,
        kind: PermanentKind,
        message: String,
    },

    /// Every allowed attempt failed transiently.
    #[error("'{dependency}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        dependency: String,
        attempts: u32,
        last_error: String,
    },

    /// The overall call deadline passed before an attempt succeeded.
    #[error("'{dependency}' missed its deadline after {attempts} attempts ({elapsed:?})")]
    DeadlineExceeded {
        dependency: String,
        attempts: u32,
        elapsed: Duration,
    },
}

impl ExecutionError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::CircuitOpen(_) => "circuit_open",
            ExecutionError::Permanent { kind, .. } => kind.as_str(),
            ExecutionError::RetriesExhausted { .. } => "unavailable",
            ExecutionError::DeadlineExceeded { .. } => "timeout",
        }
    }

    /// Returns true when the dependency itself answered with a rejection.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ExecutionError::Permanent { .. })
    }
}

/// Convenience type alias for executor results.
pub type Result<T> = std::result::Result<T, ExecutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_classification() {
        assert!(CallError::transient("connection reset").is_transient());
        assert!(!CallError::invalid("quantity must be positive").is_transient());
        assert_eq!(
            CallError::not_found("no such product").to_string(),
            "not_found: no such product"
        );
    }

    #[test]
    fn test_execution_error_kinds() {
        let open = ExecutionError::from(CircuitOpenError {
            dependency: "order-service".into(),
            retry_after: Duration::from_secs(1),
        });
        assert_eq!(open.kind(), "circuit_open");

        let permanent = ExecutionError::Permanent {
            dependency: "product-service".into(),
            kind: PermanentKind::Conflict,
            message: "insufficient stock".into(),
        };
        assert_eq!(permanent.kind(), "conflict");
        assert!(permanent.is_permanent());

        let exhausted = ExecutionError::RetriesExhausted {
            dependency: "payment-service".into(),
            attempts: 3,
            last_error: "503".into(),
        };
        assert_eq!(exhausted.kind(), "unavailable");
        assert!(!exhausted.is_permanent());
    }
}
