//! Order records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use resilience::CallError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{IdempotencyLedger, ServiceControls, parse, unknown_operation};
use crate::dispatch::{DownstreamService, ServiceCall};

pub const OP_CREATE_ORDER: &str = "create_order";
pub const OP_GET_ORDER: &str = "get_order";
pub const OP_CANCEL_ORDER: &str = "cancel_order";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub customer_id: String,
    pub items: Value,
    pub total_cents: i64,
    pub reservation_id: Option<String>,
    pub authorization_id: Option<String>,
    pub saga_id: Option<String>,
    pub status: OrderStatus,
}

#[derive(Deserialize)]
struct CreateOrder {
    customer_id: String,
    #[serde(default)]
    items: Value,
    total_cents: i64,
    reservation_id: Option<String>,
    authorization_id: Option<String>,
    saga_id: Option<String>,
}

#[derive(Deserialize)]
struct OrderRef {
    id: String,
}

#[derive(Deserialize)]
struct CancelOrder {
    order_id: String,
}

#[derive(Debug, Default)]
struct OrderState {
    orders: HashMap<String, OrderRecord>,
    next_order: u32,
    ledger: IdempotencyLedger,
}

impl OrderState {
    fn create(&mut self, req: CreateOrder) -> Result<Value, CallError> {
        if req.customer_id.is_empty() {
            return Err(CallError::invalid("customer_id is required"));
        }
        self.next_order += 1;
        let order = OrderRecord {
            order_id: format!("ORD-{:04}", self.next_order),
            customer_id: req.customer_id,
            items: req.items,
            total_cents: req.total_cents,
            reservation_id: req.reservation_id,
            authorization_id: req.authorization_id,
            saga_id: req.saga_id,
            status: OrderStatus::Created,
        };
        let reply = json!(order);
        self.orders.insert(order.order_id.clone(), order);
        Ok(reply)
    }

    fn handle(&mut self, call: &ServiceCall) -> Result<Value, CallError> {
        match call.operation.as_str() {
            OP_CREATE_ORDER => self.create(parse(&call.payload)?),
            OP_GET_ORDER => {
                let req: OrderRef = parse(&call.payload)?;
                self.orders
                    .get(&req.id)
                    .map(|order| json!(order))
                    .ok_or_else(|| CallError::not_found(format!("order {} not found", req.id)))
            }
            OP_CANCEL_ORDER => {
                let req: CancelOrder = parse(&call.payload)?;
                let order = self.orders.get_mut(&req.order_id).ok_or_else(|| {
                    CallError::not_found(format!("order {} not found", req.order_id))
                })?;
                order.status = OrderStatus::Cancelled;
                Ok(json!(order.clone()))
            }
            other => Err(unknown_operation(other)),
        }
    }
}

/// In-memory order service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderService {
    state: Arc<Mutex<OrderState>>,
    controls: Arc<ServiceControls>,
}

impl InMemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> &ServiceControls {
        &self.controls
    }

    /// Orders in the `Created` state.
    pub fn order_count(&self) -> usize {
        self.state()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Created)
            .count()
    }

    pub fn order(&self, order_id: &str) -> Option<OrderRecord> {
        self.state().orders.get(order_id).cloned()
    }

    fn state(&self) -> MutexGuard<'_, OrderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DownstreamService for InMemoryOrderService {
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
