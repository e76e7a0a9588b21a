//! The order-placement workflow: its request, its steps and the calls each
//! step makes.

use common::{IdempotencyKey, SagaId, ServiceKind};
use router::ServiceCall;
use router::services::{order, payment, product};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Result, SagaError};
use crate::state::StepStatus;

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// What the customer asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub customer_id: String,
    pub items: Vec<OrderLine>,
}

impl OrderRequest {
    pub fn new(customer_id: impl Into<String>, items: Vec<OrderLine>) -> Self {
        Self {
            customer_id: customer_id.into(),
            items,
        }
    }

    /// Sum of every line, or `None` if it does not fit in an `i64`.
    pub fn total_cents(&self) -> Option<i64> {
        self.items.iter().try_fold(0i64, |total, line| {
            line.unit_price_cents
                .checked_mul(i64::from(line.quantity))
                .and_then(|amount| total.checked_add(amount))
        })
    }

    /// Rejects requests that could never complete.
    pub fn validate(&self) -> Result<()> {
        if self.customer_id.is_empty() {
            return Err(SagaError::InvalidOrder("customer_id is required".into()));
        }
        if self.items.is_empty() {
            return Err(SagaError::InvalidOrder("order has no items".into()));
        }
        if let Some(line) = self.items.iter().find(|line| line.quantity == 0) {
            return Err(SagaError::InvalidOrder(format!(
                "quantity for {} must be positive",
                line.product_id
            )));
        }
        if self.items.iter().any(|line| line.unit_price_cents < 0) {
            return Err(SagaError::InvalidOrder("prices must not be negative".into()));
        }
        if self.total_cents().is_none() {
            return Err(SagaError::InvalidOrder("order total is too large".into()));
        }
        Ok(())
    }
}

/// The steps of the order-placement saga, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ReserveInventory,
    AuthorizePayment,
    CreateOrder,
}

impl StepKind {
    pub const SEQUENCE: [StepKind; 3] = [
        StepKind::ReserveInventory,
        StepKind::AuthorizePayment,
        StepKind::CreateOrder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ReserveInventory => "reserve_inventory",
            StepKind::AuthorizePayment => "authorize_payment",
            StepKind::CreateOrder => "create_order",
        }
    }

    pub fn service(&self) -> ServiceKind {
        match self {
            StepKind::ReserveInventory => ServiceKind::Product,
            StepKind::AuthorizePayment => ServiceKind::Payment,
            StepKind::CreateOrder => ServiceKind::Order,
        }
    }

    pub fn forward_action(&self) -> &'static str {
        match self {
            StepKind::ReserveInventory => product::OP_RESERVE_INVENTORY,
            StepKind::AuthorizePayment => payment::OP_AUTHORIZE_PAYMENT,
            StepKind::CreateOrder => order::OP_CREATE_ORDER,
        }
    }

    pub fn compensating_action(&self) -> &'static str {
        match self {
            StepKind::ReserveInventory => product::OP_RELEASE_INVENTORY,
            StepKind::AuthorizePayment => payment::OP_VOID_AUTHORIZATION,
            StepKind::CreateOrder => order::OP_CANCEL_ORDER,
        }
    }

    /// Field of the forward reply that the compensating action needs.
    fn output_key(&self) -> &'static str {
        match self {
            StepKind::ReserveInventory => "reservation_id",
            StepKind::AuthorizePayment => "authorization_id",
            StepKind::CreateOrder => "order_id",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step of a saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub kind: StepKind,
    pub service_target: ServiceKind,
    pub forward_action: String,
    pub compensating_action: String,
    pub status: StepStatus,
    pub idempotency_key: IdempotencyKey,
    /// Reply of the forward call, once done.
    pub output: Option<Value>,
}

impl SagaStep {
    fn new(saga_id: SagaId, index: usize, kind: StepKind) -> Self {
        Self {
            kind,
            service_target: kind.service(),
            forward_action: kind.forward_action().to_string(),
            compensating_action: kind.compensating_action().to_string(),
            status: StepStatus::Pending,
            idempotency_key: IdempotencyKey::for_step(saga_id, index),
            output: None,
        }
    }

    /// The identifier produced by the forward call, if it succeeded.
    pub fn output_id(&self) -> Option<&str> {
        self.output
            .as_ref()
            .and_then(|output| output.get(self.kind.output_key()))
            .and_then(Value::as_str)
    }
}

/// The ordered steps of a new order-placement saga.
pub fn steps_for(saga_id: SagaId) -> Vec<SagaStep> {
    StepKind::SEQUENCE
        .iter()
        .enumerate()
        .map(|(index, kind)| SagaStep::new(saga_id, index, *kind))
        .collect()
}

/// Builds the forward call of step `index`.
///
/// Later steps read the outputs of earlier ones, e.g. the order record
/// references the reservation and the payment authorization.
pub fn forward_call(
    saga_id: SagaId,
    order: &OrderRequest,
    steps: &[SagaStep],
    index: usize,
) -> Result<ServiceCall> {
    let step = steps.get(index).ok_or(SagaError::StepOutOfRange(index))?;
    let total_cents = order
        .total_cents()
        .ok_or_else(|| SagaError::InvalidOrder("order total is too large".into()))?;
    let payload = match step.kind {
        StepKind::ReserveInventory => json!({
            "items": order
                .items
                .iter()
                .map(|line| json!({ "product_id": line.product_id, "quantity": line.quantity }))
                .collect::<Vec<_>>(),
        }),
        StepKind::AuthorizePayment => json!({
            "customer_id": order.customer_id,
            "amount_cents": total_cents,
        }),
        StepKind::CreateOrder => json!({
            "customer_id": order.customer_id,
            "items": order.items,
            "total_cents": total_cents,
            "reservation_id": output_of(steps, StepKind::ReserveInventory),
            "authorization_id": output_of(steps, StepKind::AuthorizePayment),
            "saga_id": saga_id.to_string(),
        }),
    };
    Ok(ServiceCall::new(step.service_target, step.forward_action.clone())
        .with_payload(payload)
        .with_idempotency_key(step.idempotency_key.clone()))
}

/// Builds the compensating call of step `index`.
pub fn compensation_call(saga_id: SagaId, steps: &[SagaStep], index: usize) -> Result<ServiceCall> {
    let step = steps.get(index).ok_or(SagaError::StepOutOfRange(index))?;
    let id = step.output_id().ok_or_else(|| {
        SagaError::CorruptLog(format!(
            "step {} has no {} to compensate",
            step.kind,
            step.kind.output_key()
        ))
    })?;
    Ok(
        ServiceCall::new(step.service_target, step.compensating_action.clone())
            .with_payload(json!({ step.kind.output_key(): id }))
            .with_idempotency_key(IdempotencyKey::for_compensation(saga_id, index)),
    )
}

fn output_of(steps: &[SagaStep], kind: StepKind) -> Option<&str> {
    steps
        .iter()
        .find(|step| step.kind == kind)
        .and_then(SagaStep::output_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> OrderRequest {
        OrderRequest::new(
            "USR-0001",
            vec![
                OrderLine {
                    product_id: "PRD-0001".into(),
                    quantity: 2,
                    unit_price_cents: 1000,
                },
                OrderLine {
                    product_id: "PRD-0002".into(),
                    quantity: 1,
                    unit_price_cents: 2500,
                },
            ],
        )
    }

    #[test]
    fn test_total() {
        assert_eq!(order().total_cents(), Some(4500));
    }

    #[test]
    fn test_total_overflow_is_rejected() {
        let mut huge = order();
        huge.items[0].quantity = 2;
        huge.items[0].unit_price_cents = i64::MAX / 2 + 1;
        assert_eq!(huge.total_cents(), None);
        assert!(matches!(huge.validate(), Err(SagaError::InvalidOrder(_))));

        // Each line fits, the sum does not.
        let mut wide = order();
        wide.items[0].quantity = 1;
        wide.items[0].unit_price_cents = i64::MAX;
        assert_eq!(wide.total_cents(), None);
        assert!(wide.validate().is_err());
        assert!(matches!(
            forward_call(SagaId::new(), &wide, &steps_for(SagaId::new()), 1),
            Err(SagaError::InvalidOrder(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(order().validate().is_ok());
        assert!(matches!(
            OrderRequest::new("USR-0001", vec![]).validate(),
            Err(SagaError::InvalidOrder(_))
        ));

        let mut zero = order();
        zero.items[0].quantity = 0;
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_steps_have_deterministic_keys() {
        let saga_id = SagaId::new();
        let steps = steps_for(saga_id);

        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].kind, StepKind::ReserveInventory);
        assert_eq!(steps[1].service_target, ServiceKind::Payment);
        assert_eq!(steps[2].forward_action, "create_order");
        assert_eq!(steps[1].idempotency_key, IdempotencyKey::for_step(saga_id, 1));
        assert_eq!(steps_for(saga_id), steps);
    }

    #[test]
    fn test_create_order_references_earlier_outputs() {
        let saga_id = SagaId::new();
        let mut steps = steps_for(saga_id);
        steps[0].output = Some(json!({ "reservation_id": "RES-0001" }));
        steps[1].output = Some(json!({ "authorization_id": "AUTH-0001" }));

        let call = forward_call(saga_id, &order(), &steps, 2).unwrap();

        assert_eq!(call.service, ServiceKind::Order);
        assert_eq!(call.payload["reservation_id"], "RES-0001");
        assert_eq!(call.payload["authorization_id"], "AUTH-0001");
        assert_eq!(call.payload["total_cents"], 4500);
        assert_eq!(call.idempotency_key, Some(IdempotencyKey::for_step(saga_id, 2)));
    }

    #[test]
    fn test_compensation_call_uses_forward_output() {
        let saga_id = SagaId::new();
        let mut steps = steps_for(saga_id);
        steps[1].output = Some(json!({ "authorization_id": "AUTH-0007", "amount_cents": 10 }));

        let call = compensation_call(saga_id, &steps, 1).unwrap();
        assert_eq!(call.operation, "void_authorization");
        assert_eq!(call.payload, json!({ "authorization_id": "AUTH-0007" }));
        assert_eq!(
            call.idempotency_key,
            Some(IdempotencyKey::for_compensation(saga_id, 1))
        );

        assert!(matches!(
            compensation_call(saga_id, &steps, 0),
            Err(SagaError::CorruptLog(_))
        ));
    }
}
