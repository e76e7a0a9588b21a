//! Downstream service contract and the dispatcher that calls through the
//! retry/timeout executor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{IdempotencyKey, ServiceKind};
use resilience::{CallError, ExecutionError, Executor, PermanentKind, RetryPolicy};
use serde_json::Value;

/// One request to a downstream service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub service: ServiceKind,
    pub operation: String,
    pub payload: Value,
    /// Set on saga-issued calls so retries are safe to repeat.
    pub idempotency_key: Option<IdempotencyKey>,
}

impl ServiceCall {
    pub fn new(service: ServiceKind, operation: impl Into<String>) -> Self {
        Self {
            service,
            operation: operation.into(),
            payload: Value::Null,
            idempotency_key: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

/// A downstream service reachable by the coordination layer.
///
/// Implementations classify their own failures as transient or permanent.
#[async_trait]
pub trait DownstreamService: Send + Sync {
    async fn call(&self, call: &ServiceCall) -> Result<Value, CallError>;
}

/// Sends [`ServiceCall`]s to registered services through the executor.
///
/// Shared by the router and the saga coordinator so both go through the same
/// circuit breakers.
pub struct Dispatcher {
    executor: Executor,
    services: HashMap<ServiceKind, Arc<dyn DownstreamService>>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(executor: Executor, policy: RetryPolicy) -> Self {
        Self {
            executor,
            services: HashMap::new(),
            policy,
        }
    }

    /// Registers the implementation behind a service kind.
    pub fn register(mut self, kind: ServiceKind, service: Arc<dyn DownstreamService>) -> Self {
        self.services.insert(kind, service);
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Calls a service with the default retry policy.
    pub async fn call(&self, call: &ServiceCall) -> Result<Value, ExecutionError> {
        self.call_with_policy(call, &self.policy).await
    }

    /// Calls a service with an explicit retry policy.
    pub async fn call_with_policy(
        &self,
        call: &ServiceCall,
        policy: &RetryPolicy,
    ) -> Result<Value, ExecutionError> {
        let service = self.service(call.service)?;
        self.executor
            .execute(call.service.as_str(), policy, |ctx| {
                if ctx.is_retry() {
                    tracing::debug!(
                        service = %call.service,
                        operation = %call.operation,
                        attempt = ctx.attempt,
                        "retrying downstream call"
                    );
                }
                service.call(call)
            })
            .await
    }

    /// Calls a service and lets `fallback` resolve a terminal failure.
    pub async fn call_with_fallback<G>(
        &self,
        call: &ServiceCall,
        fallback: G,
    ) -> Result<Value, ExecutionError>
    where
        G: FnOnce(&ExecutionError) -> Option<Value>,
    {
        let service = self.service(call.service)?;
        self.executor
            .execute_with_fallback(
                call.service.as_str(),
                &self.policy,
                |_| service.call(call),
                fallback,
            )
            .await
    }

    fn service(&self, kind: ServiceKind) -> Result<&Arc<dyn DownstreamService>, ExecutionError> {
        self.services
            .get(&kind)
            .ok_or_else(|| ExecutionError::Permanent {
                dependency: kind.as_str().to_string(),
                kind: PermanentKind::NotFound,
                message: format!("no implementation registered for {kind}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use resilience::{CircuitBreakerRegistry, CircuitState};
    use serde_json::json;

    use super::*;

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DownstreamService for Flaky {
        async fn call(&self, call: &ServiceCall) -> Result<Value, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(CallError::transient("connection refused"));
            }
            Ok(json!({ "echo": call.payload }))
        }
    }

    fn dispatcher(service: Arc<Flaky>) -> Dispatcher {
        let executor = Executor::new(Arc::new(CircuitBreakerRegistry::default()));
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(1),
            overall_timeout: Duration::from_secs(5),
        };
        Dispatcher::new(executor, policy).register(ServiceKind::Product, service)
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_retries_through_executor() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let dispatcher = dispatcher(flaky.clone());

        let call = ServiceCall::new(ServiceKind::Product, "get_product")
            .with_payload(json!({ "id": "PRD-0001" }));
        let reply = dispatcher.call(&call).await.unwrap();

        assert_eq!(reply["echo"]["id"], "PRD-0001");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            dispatcher.executor().breakers().state("product-service"),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_unregistered_service_is_rejected() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let dispatcher = dispatcher(flaky);

        let result = dispatcher
            .call(&ServiceCall::new(ServiceKind::Payment, "authorize_payment"))
            .await;
        assert!(matches!(result, Err(ExecutionError::Permanent { .. })));
    }
}
