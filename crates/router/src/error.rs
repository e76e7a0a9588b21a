//! Router error types and their client-facing mapping.

use std::time::Duration;

use resilience::{ExecutionError, RateLimitExceeded};
use serde_json::Value;
use thiserror::Error;

use crate::auth::AuthError;

/// Errors surfaced by the router to the inbound caller.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The client exhausted its token bucket.
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    /// No or invalid credentials on a protected route.
    #[error("authentication required")]
    Unauthenticated,

    /// Authenticated, but not allowed to use the route.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No route matches the method and path.
    #[error("no route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// The request itself is malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A resource handled by the router itself does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The request conflicts with the resource's current state.
    #[error("{0}")]
    Conflict(String),

    /// The order ran but was rolled back; carries the final saga.
    #[error("{message}")]
    RolledBack { message: String, saga: Value },

    /// The downstream call failed terminally and no fallback applied.
    #[error(transparent)]
    Downstream(#[from] ExecutionError),

    /// The route needs the order workflow, but none is attached.
    #[error("order workflow is not available")]
    WorkflowUnavailable,

    /// Unexpected failure inside the coordination layer.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RouteError {
    /// HTTP-equivalent status code.
    pub fn status(&self) -> u16 {
        match self {
            RouteError::RateLimited(_) => 429,
            RouteError::Unauthenticated => 401,
            RouteError::Forbidden(_) => 403,
            RouteError::RouteNotFound { .. } | RouteError::NotFound(_) => 404,
            RouteError::BadRequest(_) => 400,
            RouteError::Conflict(_) | RouteError::RolledBack { .. } => 409,
            RouteError::Downstream(err) => match err {
                ExecutionError::CircuitOpen(_) | ExecutionError::RetriesExhausted { .. } => 503,
                ExecutionError::DeadlineExceeded { .. } => 504,
                ExecutionError::Permanent { kind, .. } => match kind {
                    resilience::PermanentKind::NotFound => 404,
                    resilience::PermanentKind::Conflict => 409,
                    resilience::PermanentKind::Invalid => 422,
                    resilience::PermanentKind::Unauthorized => 401,
                },
            },
            RouteError::WorkflowUnavailable => 503,
            RouteError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RouteError::RateLimited(_) => "rate_limited",
            RouteError::Unauthenticated => "unauthenticated",
            RouteError::Forbidden(_) => "forbidden",
            RouteError::RouteNotFound { .. } => "route_not_found",
            RouteError::BadRequest(_) => "bad_request",
            RouteError::NotFound(_) => "not_found",
            RouteError::Conflict(_) | RouteError::RolledBack { .. } => "conflict",
            RouteError::Downstream(err) => err.kind(),
            RouteError::WorkflowUnavailable => "unavailable",
            RouteError::Internal(_) => "internal",
        }
    }

    /// Saga state attached to the error, if any.
    pub fn saga(&self) -> Option<&Value> {
        match self {
            RouteError::RolledBack { saga, .. } => Some(saga),
            _ => None,
        }
    }

    /// Back-off hint for the client, when one is known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RouteError::RateLimited(err) => Some(err.retry_after),
            RouteError::Downstream(ExecutionError::CircuitOpen(err)) => Some(err.retry_after),
            _ => None,
        }
    }
}

impl From<AuthError> for RouteError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated => RouteError::Unauthenticated,
            AuthError::Forbidden(reason) => RouteError::Forbidden(reason),
        }
    }
}

/// Convenience type alias for router results.
pub type Result<T> = std::result::Result<T, RouteError>;

#[cfg(test)]
mod tests {
    use super::*;
    use common::ClientId;
    use resilience::{CircuitOpenError, PermanentKind};

    #[test]
    fn test_status_mapping() {
        let limited = RouteError::from(RateLimitExceeded {
            client: ClientId::anonymous(),
            retry_after: Duration::from_millis(200),
        });
        assert_eq!(limited.status(), 429);
        assert_eq!(limited.kind(), "rate_limited");
        assert_eq!(limited.retry_after(), Some(Duration::from_millis(200)));

        let open = RouteError::from(ExecutionError::from(CircuitOpenError {
            dependency: "order-service".into(),
            retry_after: Duration::from_secs(3),
        }));
        assert_eq!(open.status(), 503);
        assert_eq!(open.kind(), "circuit_open");

        let rejected = RouteError::from(ExecutionError::Permanent {
            dependency: "product-service".into(),
            kind: PermanentKind::Invalid,
            message: "price must be positive".into(),
        });
        assert_eq!(rejected.status(), 422);
        assert_eq!(rejected.kind(), "invalid");

        let timeout = RouteError::from(ExecutionError::DeadlineExceeded {
            dependency: "user-service".into(),
            attempts: 2,
            elapsed: Duration::from_secs(10),
        });
        assert_eq!(timeout.status(), 504);
    }

    #[test]
    fn test_rolled_back_carries_saga() {
        let err = RouteError::RolledBack {
            message: "payment declined".into(),
            saga: serde_json::json!({ "status": "Compensated" }),
        };
        assert_eq!(err.status(), 409);
        assert_eq!(err.kind(), "conflict");
        assert_eq!(err.saga().unwrap()["status"], "Compensated");
        assert_eq!(RouteError::Conflict("x".into()).saga(), None);
    }

    #[test]
    fn test_auth_error_conversion() {
        assert_eq!(RouteError::from(AuthError::Unauthenticated).status(), 401);
        assert_eq!(
            RouteError::from(AuthError::Forbidden("admin role required".into())).status(),
            403
        );
    }
}
