//! Payment authorizations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use resilience::CallError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{IdempotencyLedger, ServiceControls, parse, unknown_operation};
use crate::dispatch::{DownstreamService, ServiceCall};

pub const OP_AUTHORIZE_PAYMENT: &str = "authorize_payment";
pub const OP_VOID_AUTHORIZATION: &str = "void_authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Authorized,
    Voided,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    pub authorization_id: String,
    pub customer_id: String,
    pub amount_cents: i64,
    pub status: AuthorizationStatus,
}

#[derive(Deserialize)]
struct AuthorizePayment {
    customer_id: String,
    amount_cents: i64,
}

#[derive(Deserialize)]
struct VoidAuthorization {
    authorization_id: String,
}

#[derive(Debug, Default)]
struct PaymentState {
    authorizations: HashMap<String, Authorization>,
    next_authorization: u32,
    limit_cents: Option<i64>,
    ledger: IdempotencyLedger,
}

impl PaymentState {
    fn authorize(&mut self, req: AuthorizePayment) -> Result<Value, CallError> {
        if req.amount_cents <= 0 {
            return Err(CallError::invalid("amount must be positive"));
        }
        if let Some(limit) = self.limit_cents
            && req.amount_cents > limit
        {
            return Err(CallError::conflict(format!(
                "payment declined: {} exceeds limit {limit}",
                req.amount_cents
            )));
        }
        self.next_authorization += 1;
        let authorization = Authorization {
            authorization_id: format!("AUTH-{:04}", self.next_authorization),
            customer_id: req.customer_id,
            amount_cents: req.amount_cents,
            status: AuthorizationStatus::Authorized,
        };
        let reply = json!(authorization);
        self.authorizations
            .insert(authorization.authorization_id.clone(), authorization);
        Ok(reply)
    }

    fn void(&mut self, authorization_id: &str) -> Result<Value, CallError> {
        let authorization = self
            .authorizations
            .get_mut(authorization_id)
            .ok_or_else(|| {
                CallError::not_found(format!("authorization {authorization_id} not found"))
            })?;
        authorization.status = AuthorizationStatus::Voided;
        Ok(json!(authorization.clone()))
    }

    fn handle(&mut self, call: &ServiceCall) -> Result<Value, CallError> {
        match call.operation.as_str() {
            OP_AUTHORIZE_PAYMENT => self.authorize(parse(&call.payload)?),
            OP_VOID_AUTHORIZATION => {
                let req: VoidAuthorization = parse(&call.payload)?;
                self.void(&req.authorization_id)
            }
            other => Err(unknown_operation(other)),
        }
    }
}

/// In-memory payment service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<Mutex<PaymentState>>,
    controls: Arc<ServiceControls>,
}

impl InMemoryPaymentService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> &ServiceControls {
        &self.controls
    }

    /// Declines authorizations above `limit_cents`.
    pub fn set_limit(&self, limit_cents: Option<i64>) {
        self.state().limit_cents = limit_cents;
    }

    /// Authorizations that are still held.
    pub fn authorization_count(&self) -> usize {
        self.state()
            .authorizations
            .values()
            .filter(|a| a.status == AuthorizationStatus::Authorized)
            .count()
    }

    pub fn authorization(&self, authorization_id: &str) -> Option<Authorization> {
        self.state().authorizations.get(authorization_id).cloned()
    }

    fn state(&self) -> MutexGuard<'_, PaymentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DownstreamService for InMemoryPaymentService {
    async fn call(&self, call: &ServiceCall) -> Result<Value, CallError> {
        self.controls.delay(&call.operation).await;
        self.controls.before(&call.operation)?;
        let reply = {
            let mut state = self.state();
            if let Some(reply) = state.ledger.replay(call.idempotency_key.as_ref()) {
                return Ok(reply);
            }
            let reply = state.handle(call)?;
            state.ledger.record(call.idempotency_key.as_ref(), &reply);
            reply
        };
        self.controls.after(&call.operation)?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use common::ServiceKind;
    use resilience::PermanentKind;

    use super::*;

    fn authorize(amount_cents: i64) -> ServiceCall {
        ServiceCall::new(ServiceKind::Payment, OP_AUTHORIZE_PAYMENT)
            .with_payload(json!({ "customer_id": "USR-0001", "amount_cents": amount_cents }))
    }

    #[tokio::test]
    async fn test_authorize_and_void() {
        let service = InMemoryPaymentService::new();

        let reply = service.call(&authorize(5000)).await.unwrap();
        assert_eq!(reply["authorization_id"], "AUTH-0001");
        assert_eq!(service.authorization_count(), 1);

        let void = ServiceCall::new(ServiceKind::Payment, OP_VOID_AUTHORIZATION)
            .with_payload(json!({ "authorization_id": "AUTH-0001" }));
        service.call(&void).await.unwrap();
        service.call(&void).await.unwrap();

        assert_eq!(service.authorization_count(), 0);
        assert_eq!(
            service.authorization("AUTH-0001").unwrap().status,
            AuthorizationStatus::Voided
        );
    }

    #[tokio::test]
    async fn test_limit_declines_permanently() {
        let service = InMemoryPaymentService::new();
        service.set_limit(Some(1000));

        let err = service.call(&authorize(1001)).await.unwrap_err();
        assert!(matches!(err, CallError::Permanent { kind: PermanentKind::Conflict, .. }));
        assert_eq!(service.authorization_count(), 0);

        assert!(service.call(&authorize(1000)).await.is_ok());
    }

    #[tokio::test]
    async fn test_transient_fault_has_no_effect() {
        let service = InMemoryPaymentService::new();
        service.controls().fail_transiently(OP_AUTHORIZE_PAYMENT, 1);

        assert!(service.call(&authorize(100)).await.unwrap_err().is_transient());
        assert_eq!(service.authorization_count(), 0);

        service.call(&authorize(100)).await.unwrap();
        assert_eq!(service.authorization_count(), 1);
    }
}
