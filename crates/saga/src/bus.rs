//! Outcome notifications for the rest of the platform.

use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::instance::SagaInstance;
use crate::order_placement::StepKind;
use crate::state::{SagaStatus, StepStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    OrderCompleted,
    OrderCompensated,
    OrderFailed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::OrderCompleted => "OrderCompleted",
            OutcomeKind::OrderCompensated => "OrderCompensated",
            OutcomeKind::OrderFailed => "OrderFailed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub kind: StepKind,
    pub status: StepStatus,
}

/// Terminal outcome of one order-placement saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderOutcome {
    pub saga_id: SagaId,
    pub kind: OutcomeKind,
    pub customer_id: String,
    pub order_id: Option<String>,
    pub reason: Option<String>,
    pub steps: Vec<StepSummary>,
}

impl OrderOutcome {
    /// The outcome of a terminal saga; `None` while it is still running.
    pub fn from_saga(saga: &SagaInstance) -> Option<Self> {
        let kind = match saga.status() {
            SagaStatus::Completed => OutcomeKind::OrderCompleted,
            SagaStatus::Compensated => OutcomeKind::OrderCompensated,
            SagaStatus::Failed => OutcomeKind::OrderFailed,
            SagaStatus::Running | SagaStatus::Compensating => return None,
        };
        Some(Self {
            saga_id: saga.id(),
            kind,
            customer_id: saga.order().customer_id.clone(),
            order_id: saga.order_id().map(str::to_string),
            reason: saga.failure_reason().map(str::to_string),
            steps: saga
                .steps()
                .iter()
                .map(|step| StepSummary {
                    kind: step.kind,
                    status: step.status,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Error)]
#[error("event bus unavailable: {0}")]
pub struct PublishError(pub String);

/// Delivers saga outcomes to interested parties.
///
/// Delivery is at-least-once: an outcome may be published again after a
/// restart if the first publish was not yet recorded.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, outcome: &OrderOutcome) -> Result<(), PublishError>;
}

/// In-memory event bus for testing and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    published: Arc<RwLock<Vec<OrderOutcome>>>,
    unavailable: Arc<RwLock<bool>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every publish fail until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    pub async fn published(&self) -> Vec<OrderOutcome> {
        self.published.read().await.clone()
    }

    /// Outcomes published for one saga.
    pub async fn outcomes_for(&self, saga_id: SagaId) -> Vec<OrderOutcome> {
        self.published
            .read()
            .await
            .iter()
            .filter(|outcome| outcome.saga_id == saga_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, outcome: &OrderOutcome) -> Result<(), PublishError> {
        if *self.unavailable.read().await {
            return Err(PublishError("in-memory bus switched off".into()));
        }
        self.published.write().await.push(outcome.clone());
        Ok(())
    }
}
