//! In-memory stand-ins for the downstream services.
//!
//! Each service honours idempotency keys: a repeated call with a key it has
//! already answered returns the stored reply without repeating the side
//! effect. [`ServiceControls`] lets tests inject failures.

pub mod order;
pub mod payment;
pub mod product;
pub mod user;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::IdempotencyKey;
use resilience::CallError;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use order::InMemoryOrderService;
pub use payment::InMemoryPaymentService;
pub use product::InMemoryProductService;
pub use user::InMemoryUserService;

#[derive(Debug, Default)]
struct Faults {
    calls: HashMap<String, u32>,
    transient: HashMap<String, u32>,
    lost_replies: HashMap<String, u32>,
    rejected: HashMap<String, String>,
    latency: HashMap<String, Duration>,
    unavailable: bool,
}

/// Failure injection and call accounting shared by the in-memory services.
#[derive(Debug, Default)]
pub struct ServiceControls {
    faults: Mutex<Faults>,
}

impl ServiceControls {
    /// Fails the next `times` calls of `operation` with a transient error,
    /// before any side effect.
    pub fn fail_transiently(&self, operation: &str, times: u32) {
        self.faults().transient.insert(operation.to_string(), times);
    }

    /// Applies the next `times` calls of `operation`, then reports a
    /// transient error as if the reply had been lost in transit.
    pub fn lose_replies(&self, operation: &str, times: u32) {
        self.faults()
            .lost_replies
            .insert(operation.to_string(), times);
    }

    /// Rejects every call of `operation` with a permanent error.
    pub fn reject(&self, operation: &str, message: &str) {
        self.faults()
            .rejected
            .insert(operation.to_string(), message.to_string());
    }

    /// Delays every call of `operation` before it is handled.
    pub fn set_latency(&self, operation: &str, latency: Duration) {
        self.faults().latency.insert(operation.to_string(), latency);
    }

    /// Makes every operation fail transiently until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults().unavailable = unavailable;
    }

    /// Clears all injected failures.
    pub fn heal(&self) {
        let mut faults = self.faults();
        faults.transient.clear();
        faults.lost_replies.clear();
        faults.rejected.clear();
        faults.latency.clear();
        faults.unavailable = false;
    }

    /// Number of times `operation` reached the service.
    pub fn calls(&self, operation: &str) -> u32 {
        self.faults().calls.get(operation).copied().unwrap_or(0)
    }

    /// Sleeps for the injected latency of `operation`, if any.
    pub(crate) async fn delay(&self, operation: &str) {
        let latency = self.faults().latency.get(operation).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Counts the call and applies faults that fire before the side effect.
    pub(crate) fn before(&self, operation: &str) -> Result<(), CallError> {
        let mut faults = self.faults();
        *faults.calls.entry(operation.to_string()).or_default() += 1;

        if faults.unavailable {
            return Err(CallError::transient("service unavailable"));
        }
        if let Some(remaining) = faults.transient.get_mut(operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(CallError::transient(format!("{operation}: connection reset")));
        }
        if let Some(message) = faults.rejected.get(operation) {
            return Err(CallError::invalid(message.clone()));
        }
        Ok(())
    }

    /// Applies faults that fire after the side effect.
    pub(crate) fn after(&self, operation: &str) -> Result<(), CallError> {
        let mut faults = self.faults();
        if let Some(remaining) = faults.lost_replies.get_mut(operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(CallError::transient(format!("{operation}: reply lost")));
        }
        Ok(())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replies recorded per idempotency key.
#[derive(Debug, Default)]
pub(crate) struct IdempotencyLedger {
    replies: HashMap<IdempotencyKey, Value>,
}

impl IdempotencyLedger {
    pub(crate) fn replay(&self, key: Option<&IdempotencyKey>) -> Option<Value> {
        key.and_then(|key| self.replies.get(key).cloned())
    }

    pub(crate) fn record(&mut self, key: Option<&IdempotencyKey>, reply: &Value) {
        if let Some(key) = key {
            self.replies.insert(key.clone(), reply.clone());
        }
    }
}

pub(crate) fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, CallError> {
    serde_json::from_value(payload.clone()).map_err(|e| CallError::invalid(e.to_string()))
}

pub(crate) fn unknown_operation(operation: &str) -> CallError {
    CallError::invalid(format!("unknown operation '{operation}'"))
}
