//! Product catalog and inventory service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use resilience::CallError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{IdempotencyLedger, ServiceControls, parse, unknown_operation};
use crate::dispatch::{DownstreamService, ServiceCall};

pub const OP_CREATE_PRODUCT: &str = "create_product";
pub const OP_GET_PRODUCT: &str = "get_product";
pub const OP_UPDATE_PRODUCT: &str = "update_product";
pub const OP_DELETE_PRODUCT: &str = "delete_product";
pub const OP_RESERVE_INVENTORY: &str = "reserve_inventory";
pub const OP_RELEASE_INVENTORY: &str = "release_inventory";

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub name: String,
    pub price_cents: i64,
    pub stock: u32,
}

#[derive(Deserialize)]
struct CreateProduct {
    name: String,
    price_cents: i64,
    #[serde(default)]
    stock: u32,
}

#[derive(Deserialize)]
struct ProductRef {
    id: String,
}

#[derive(Deserialize)]
struct UpdateProduct {
    id: String,
    name: Option<String>,
    price_cents: Option<i64>,
    stock: Option<u32>,
}

#[derive(Deserialize)]
struct ReserveLine {
    product_id: String,
    quantity: u32,
}

#[derive(Deserialize)]
struct ReserveInventory {
    items: Vec<ReserveLine>,
}

#[derive(Deserialize)]
struct ReleaseInventory {
    reservation_id: String,
}

#[derive(Debug, Default)]
struct ProductState {
    products: HashMap<String, Product>,
    reservations: HashMap<String, Vec<(String, u32)>>,
    next_product: u32,
    next_reservation: u32,
    ledger: IdempotencyLedger,
}

impl ProductState {
    fn create(&mut self, name: String, price_cents: i64, stock: u32) -> Result<Product, CallError> {
        if name.trim().is_empty() {
            return Err(CallError::invalid("product name must not be empty"));
        }
        if price_cents <= 0 {
            return Err(CallError::invalid("price must be positive"));
        }
        self.next_product += 1;
        let product = Product {
            product_id: format!("PRD-{:04}", self.next_product),
            name,
            price_cents,
            stock,
        };
        self.products
            .insert(product.product_id.clone(), product.clone());
        Ok(product)
    }

    fn product_mut(&mut self, id: &str) -> Result<&mut Product, CallError> {
        self.products
            .get_mut(id)
            .ok_or_else(|| CallError::not_found(format!("product {id} not found")))
    }

    fn reserve(&mut self, request: ReserveInventory) -> Result<Value, CallError> {
        if request.items.is_empty() {
            return Err(CallError::invalid("nothing to reserve"));
        }
        // Validate every line before touching stock so a rejection has no effect.
        for line in &request.items {
            if line.quantity == 0 {
                return Err(CallError::invalid("quantity must be positive"));
            }
            let product = self.product_mut(&line.product_id)?;
            if product.stock < line.quantity {
                return Err(CallError::conflict(format!(
                    "insufficient stock for {}: requested {}, available {}",
                    line.product_id, line.quantity, product.stock
                )));
            }
        }

        let mut held = Vec::with_capacity(request.items.len());
        for line in request.items {
            self.product_mut(&line.product_id)?.stock -= line.quantity;
            held.push((line.product_id, line.quantity));
        }
        self.next_reservation += 1;
        let reservation_id = format!("RES-{:04}", self.next_reservation);
        self.reservations.insert(reservation_id.clone(), held);
        Ok(json!({ "reservation_id": reservation_id }))
    }

    fn release(&mut self, reservation_id: &str) -> Value {
        // Releasing twice, or releasing an unknown reservation, is a no-op.
        if let Some(held) = self.reservations.remove(reservation_id) {
            for (product_id, quantity) in held {
                if let Some(product) = self.products.get_mut(&product_id) {
                    product.stock += quantity;
                }
            }
        }
        json!({ "reservation_id": reservation_id, "released": true })
    }

    fn handle(&mut self, call: &ServiceCall) -> Result<Value, CallError> {
        match call.operation.as_str() {
            OP_CREATE_PRODUCT => {
                let req: CreateProduct = parse(&call.payload)?;
                let product = self.create(req.name, req.price_cents, req.stock)?;
                Ok(json!(product))
            }
            OP_GET_PRODUCT => {
                let req: ProductRef = parse(&call.payload)?;
                Ok(json!(self.product_mut(&req.id)?.clone()))
            }
            OP_UPDATE_PRODUCT => {
                let req: UpdateProduct = parse(&call.payload)?;
                if req.price_cents.is_some_and(|price| price <= 0) {
                    return Err(CallError::invalid("price must be positive"));
                }
                let product = self.product_mut(&req.id)?;
                if let Some(name) = req.name {
                    product.name = name;
                }
                if let Some(price) = req.price_cents {
                    product.price_cents = price;
                }
                if let Some(stock) = req.stock {
                    product.stock = stock;
                }
                Ok(json!(product.clone()))
            }
            OP_DELETE_PRODUCT => {
                let req: ProductRef = parse(&call.payload)?;
                self.products
                    .remove(&req.id)
                    .ok_or_else(|| CallError::not_found(format!("product {} not found", req.id)))?;
                Ok(json!({ "product_id": req.id, "deleted": true }))
            }
            OP_RESERVE_INVENTORY => self.reserve(parse(&call.payload)?),
            OP_RELEASE_INVENTORY => {
                let req: ReleaseInventory = parse(&call.payload)?;
                Ok(self.release(&req.reservation_id))
            }
            other => Err(unknown_operation(other)),
        }
    }
}

/// In-memory product service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProductService {
    state: Arc<Mutex<ProductState>>,
    controls: Arc<ServiceControls>,
}

impl InMemoryProductService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> &ServiceControls {
        &self.controls
    }

    /// Adds a product directly, bypassing the call path.
    pub fn add_product(
        &self,
        name: &str,
        price_cents: i64,
        stock: u32,
    ) -> Result<String, CallError> {
        self.state()
            .create(name.to_string(), price_cents, stock)
            .map(|product| product.product_id)
    }

    /// Current stock of a product.
    pub fn stock(&self, product_id: &str) -> Option<u32> {
        self.state().products.get(product_id).map(|p| p.stock)
    }

    /// Number of reservations currently held.
    pub fn reservation_count(&self) -> usize {
        self.state().reservations.len()
    }

    fn state(&self) -> MutexGuard<'_, ProductState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DownstreamService for InMemoryProductService {
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
    use common::{IdempotencyKey, SagaId, ServiceKind};

    use super::*;

    fn reserve_call(product_id: &str, quantity: u32) -> ServiceCall {
        ServiceCall::new(ServiceKind::Product, OP_RESERVE_INVENTORY).with_payload(json!({
            "items": [{ "product_id": product_id, "quantity": quantity }]
        }))
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let service = InMemoryProductService::new();
        let id = service.add_product("Widget", 1000, 10).unwrap();

        let reply = service.call(&reserve_call(&id, 3)).await.unwrap();
        assert_eq!(service.stock(&id), Some(7));
        assert_eq!(service.reservation_count(), 1);

        let release = ServiceCall::new(ServiceKind::Product, OP_RELEASE_INVENTORY)
            .with_payload(json!({ "reservation_id": reply["reservation_id"] }));
        service.call(&release).await.unwrap();
        service.call(&release).await.unwrap();

        assert_eq!(service.stock(&id), Some(10));
        assert_eq!(service.reservation_count(), 0);
    }

    #[test]
    fn test_add_product_rejects_invalid_products() {
        let service = InMemoryProductService::new();
        assert!(service.add_product("Widget", 0, 10).is_err());
        assert!(service.add_product("  ", 1000, 10).is_err());
        assert_eq!(service.add_product("Widget", 1000, 10).unwrap(), "PRD-0001");
    }

    #[tokio::test]
    async fn test_insufficient_stock_is_a_conflict_without_effect() {
        let service = InMemoryProductService::new();
        let id = service.add_product("Widget", 1000, 2).unwrap();

        let err = service.call(&reserve_call(&id, 3)).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Permanent { kind: resilience::PermanentKind::Conflict, .. }
        ));
        assert_eq!(service.stock(&id), Some(2));
    }

    #[tokio::test]
    async fn test_same_idempotency_key_reserves_once() {
        let service = InMemoryProductService::new();
        let id = service.add_product("Widget", 1000, 10).unwrap();
        let call = reserve_call(&id, 4).with_idempotency_key(IdempotencyKey::for_step(SagaId::new(), 0));

        let first = service.call(&call).await.unwrap();
        let second = service.call(&call).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(service.stock(&id), Some(6));
        assert_eq!(service.reservation_count(), 1);
    }

    #[tokio::test]
    async fn test_lost_reply_then_retry_applies_once() {
        let service = InMemoryProductService::new();
        let id = service.add_product("Widget", 1000, 10).unwrap();
        service.controls().lose_replies(OP_RESERVE_INVENTORY, 1);
        let call = reserve_call(&id, 4).with_idempotency_key(IdempotencyKey::from_raw("k-1"));

        assert!(service.call(&call).await.unwrap_err().is_transient());
        assert_eq!(service.stock(&id), Some(6));

        service.call(&call).await.unwrap();
        assert_eq!(service.stock(&id), Some(6));
        assert_eq!(service.controls().calls(OP_RESERVE_INVENTORY), 2);
    }

    #[tokio::test]
    async fn test_catalog_crud() {
        let service = InMemoryProductService::new();
        let created = service
            .call(
                &ServiceCall::new(ServiceKind::Product, OP_CREATE_PRODUCT)
                    .with_payload(json!({ "name": "Gadget", "price_cents": 2500, "stock": 5 })),
            )
            .await
            .unwrap();
        let id = created["product_id"].as_str().unwrap().to_string();

        let updated = service
            .call(
                &ServiceCall::new(ServiceKind::Product, OP_UPDATE_PRODUCT)
                    .with_payload(json!({ "id": id, "stock": 9 })),
            )
            .await
            .unwrap();
        assert_eq!(updated["stock"], 9);
        assert_eq!(updated["name"], "Gadget");

        service
            .call(
                &ServiceCall::new(ServiceKind::Product, OP_DELETE_PRODUCT)
                    .with_payload(json!({ "id": id })),
            )
            .await
            .unwrap();
        let err = service
            .call(
                &ServiceCall::new(ServiceKind::Product, OP_GET_PRODUCT)
                    .with_payload(json!({ "id": id })),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::Permanent { kind: resilience::PermanentKind::NotFound, .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_payload_is_permanent() {
        let service = InMemoryProductService::new();
        let err = service
            .call(
                &ServiceCall::new(ServiceKind::Product, OP_CREATE_PRODUCT)
                    .with_payload(json!({ "name": "No price" })),
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
