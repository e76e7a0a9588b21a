//! The coordinator behind the router's order routes.

use async_trait::async_trait;
use common::{SagaId, ServiceKind};
use router::services::product;
use router::{OrderWorkflow, Principal, ROLE_ADMIN, RouteError, ServiceCall};
use saga_log::SagaLog;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::coordinator::SagaCoordinator;
use crate::error::SagaError;
use crate::instance::SagaInstance;
use crate::order_placement::{OrderLine, OrderRequest};
use crate::state::SagaStatus;

#[derive(Debug, Deserialize)]
struct PlaceOrder {
    items: Vec<PlaceOrderLine>,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderLine {
    product_id: String,
    quantity: u32,
}

#[async_trait]
impl<L: SagaLog> OrderWorkflow for SagaCoordinator<L> {
    /// Prices the order from the catalog and runs the saga.
    ///
    /// A rolled-back order is a conflict carrying the final saga. A saga
    /// stuck in `Failed` is reported as accepted, since an operator still
    /// has to resolve it.
    async fn place_order(&self, principal: &Principal, body: Value) -> Result<Value, RouteError> {
        let request: PlaceOrder = serde_json::from_value(body)
            .map_err(|e| RouteError::BadRequest(format!("invalid order: {e}")))?;

        let mut items = Vec::with_capacity(request.items.len());
        for line in request.items {
            let unit_price_cents = self.unit_price(&line.product_id).await?;
            items.push(OrderLine {
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price_cents,
            });
        }

        let saga = self
            .start(OrderRequest::new(principal.user_id.clone(), items))
            .await
            .map_err(route_error)?;

        match saga.status() {
            SagaStatus::Compensated => Err(RouteError::RolledBack {
                message: format!(
                    "order {} was rolled back: {}",
                    saga.id(),
                    saga.failure_reason().unwrap_or("unknown reason")
                ),
                saga: saga_view(&saga),
            }),
            _ => Ok(saga_view(&saga)),
        }
    }

    async fn cancel_order(&self, principal: &Principal, saga_id: &str) -> Result<Value, RouteError> {
        let saga_id = parse_saga_id(saga_id)?;
        let saga = self.get_saga(saga_id).await.map_err(route_error)?;
        ensure_owner(principal, &saga)?;

        let saga = self.cancel(saga_id).await.map_err(route_error)?;
        Ok(saga_view(&saga))
    }

    async fn saga_status(&self, principal: &Principal, saga_id: &str) -> Result<Value, RouteError> {
        let saga = self
            .get_saga(parse_saga_id(saga_id)?)
            .await
            .map_err(route_error)?;
        ensure_owner(principal, &saga)?;
        Ok(saga_view(&saga))
    }

    async fn failed_sagas(&self) -> Result<Value, RouteError> {
        let failed = SagaCoordinator::failed_sagas(self)
            .await
            .map_err(route_error)?;
        Ok(json!({
            "sagas": failed.iter().map(saga_view).collect::<Vec<_>>(),
        }))
    }
}

impl<L: SagaLog> SagaCoordinator<L> {
    async fn unit_price(&self, product_id: &str) -> Result<i64, RouteError> {
        let call = ServiceCall::new(ServiceKind::Product, product::OP_GET_PRODUCT)
            .with_payload(json!({ "id": product_id }));
        let product = self.dispatcher().call(&call).await?;
        product["price_cents"]
            .as_i64()
            .ok_or_else(|| RouteError::Internal(format!("product {product_id} has no price")))
    }
}

/// Client-facing rendering of a saga.
pub fn saga_view(saga: &SagaInstance) -> Value {
    json!({
        "saga_id": saga.id(),
        "status": saga.status().as_str(),
        "customer_id": saga.order().customer_id,
        "total_cents": saga.order().total_cents(),
        "order_id": saga.order_id(),
        "current_step": saga.current_step_index(),
        "cancel_requested": saga.is_cancel_requested(),
        "failure_reason": saga.failure_reason(),
        "outcome_published": saga.is_outcome_published(),
        "started_at": saga.started_at(),
        "steps": saga
            .steps()
            .iter()
            .map(|step| json!({
                "kind": step.kind.as_str(),
                "service": step.service_target.as_str(),
                "status": step.status.as_str(),
            }))
            .collect::<Vec<_>>(),
    })
}

/// Only the ordering customer and admins may see or cancel a saga.
fn ensure_owner(principal: &Principal, saga: &SagaInstance) -> Result<(), RouteError> {
    if saga.order().customer_id == principal.user_id || principal.has_role(ROLE_ADMIN) {
        Ok(())
    } else {
        Err(RouteError::Forbidden("orders are only visible to their customer".into()))
    }
}

fn parse_saga_id(raw: &str) -> Result<SagaId, RouteError> {
    Uuid::parse_str(raw)
        .map(SagaId::from)
        .map_err(|_| RouteError::BadRequest(format!("'{raw}' is not a saga id")))
}

fn route_error(err: SagaError) -> RouteError {
    match err {
        SagaError::NotFound(saga_id) => RouteError::NotFound(format!("saga {saga_id} not found")),
        SagaError::InvalidOrder(reason) => RouteError::BadRequest(reason),
        err @ (SagaError::InvalidState { .. } | SagaError::Busy(_)) => {
            RouteError::Conflict(err.to_string())
        }
        err => {
            tracing::error!(error = %err, "order workflow failed");
            RouteError::Internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_saga_id() {
        let saga_id = SagaId::new();
        assert_eq!(parse_saga_id(&saga_id.to_string()).unwrap(), saga_id);
        assert!(matches!(
            parse_saga_id("ORD-0001"),
            Err(RouteError::BadRequest(_))
        ));
    }

    #[test]
    fn test_route_error_mapping() {
        let saga_id = SagaId::new();
        assert_eq!(route_error(SagaError::NotFound(saga_id)).status(), 404);
        assert_eq!(route_error(SagaError::InvalidOrder("empty".into())).status(), 400);
        assert_eq!(
            route_error(SagaError::InvalidState {
                expected: "Running",
                actual: SagaStatus::Completed,
            })
            .status(),
            409
        );
        assert_eq!(route_error(SagaError::Busy(saga_id)).status(), 409);
        assert_eq!(route_error(SagaError::CorruptLog("gap".into())).status(), 500);
    }

    #[test]
    fn test_only_owner_or_admin_sees_saga() {
        let saga = SagaInstance::started(crate::events::SagaStartedData {
            saga_id: SagaId::new(),
            order: OrderRequest::new("USR-0001", vec![]),
            started_at: chrono::Utc::now(),
        });
        let principal = |user_id: &str, role: &str| Principal {
            user_id: user_id.into(),
            roles: vec![role.to_string()],
        };

        assert!(ensure_owner(&principal("USR-0001", "customer"), &saga).is_ok());
        assert!(ensure_owner(&principal("USR-0009", ROLE_ADMIN), &saga).is_ok());
        assert_eq!(
            ensure_owner(&principal("USR-0002", "customer"), &saga)
                .unwrap_err()
                .status(),
            403
        );
    }
}
