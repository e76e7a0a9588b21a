//! Saga log events.

use chrono::{DateTime, Utc};
use common::SagaId;
use saga_log::{SagaLogRecord, Sequence};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::order_placement::OrderRequest;

/// Transitions recorded in the saga log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// The saga was admitted.
    SagaStarted(SagaStartedData),

    /// A forward step is about to be invoked.
    StepStarted(StepData),

    /// A forward step took effect.
    StepCompleted(StepCompletedData),

    /// A forward step failed terminally.
    StepFailed(StepFailedData),

    /// A client asked to cancel the saga.
    CancelRequested(ReasonData),

    /// Rollback of the completed steps began.
    CompensationStarted(ReasonData),

    /// A compensating action succeeded.
    CompensationStepCompleted(StepData),

    /// A compensating action failed.
    CompensationStepFailed(StepFailedData),

    /// All steps completed.
    SagaCompleted(FinishedData),

    /// All completed steps were rolled back.
    SagaCompensated(FinishedData),

    /// Compensation failed; the saga awaits an operator.
    SagaFailed(SagaFailedData),

    /// The terminal outcome reached the event bus.
    OutcomePublished(FinishedData),
}

impl SagaEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::StepStarted(_) => "StepStarted",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::CancelRequested(_) => "CancelRequested",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaCompensated(_) => "SagaCompensated",
            SagaEvent::SagaFailed(_) => "SagaFailed",
            SagaEvent::OutcomePublished(_) => "OutcomePublished",
        }
    }

    /// The step this event concerns, if any.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            SagaEvent::StepStarted(data) | SagaEvent::CompensationStepCompleted(data) => {
                Some(data.step_index)
            }
            SagaEvent::StepCompleted(data) => Some(data.step_index),
            SagaEvent::StepFailed(data) | SagaEvent::CompensationStepFailed(data) => {
                Some(data.step_index)
            }
            _ => None,
        }
    }

    /// Wraps the event in a log record at `sequence`.
    pub fn to_record(
        &self,
        saga_id: SagaId,
        sequence: Sequence,
    ) -> Result<SagaLogRecord, serde_json::Error> {
        let record = SagaLogRecord::new(
            saga_id,
            sequence,
            self.event_type(),
            serde_json::to_value(self)?,
        );
        Ok(match self.step_index() {
            Some(index) => record.with_step(index),
            None => record,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub saga_id: SagaId,
    pub order: OrderRequest,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub step_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub step_index: usize,
    /// The forward call's reply.
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_index: usize,
    /// Machine-readable error kind.
    pub kind: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonData {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedData {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_started(saga_id: SagaId, order: OrderRequest) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            saga_id,
            order,
            started_at: Utc::now(),
        })
    }

    pub fn step_started(step_index: usize) -> Self {
        SagaEvent::StepStarted(StepData { step_index })
    }

    pub fn step_completed(step_index: usize, output: Value) -> Self {
        SagaEvent::StepCompleted(StepCompletedData { step_index, output })
    }

    pub fn step_failed(step_index: usize, kind: impl Into<String>, error: impl Into<String>) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step_index,
            kind: kind.into(),
            error: error.into(),
        })
    }

    pub fn cancel_requested(reason: impl Into<String>) -> Self {
        SagaEvent::CancelRequested(ReasonData {
            reason: reason.into(),
        })
    }

    pub fn compensation_started(reason: impl Into<String>) -> Self {
        SagaEvent::CompensationStarted(ReasonData {
            reason: reason.into(),
        })
    }

    pub fn compensation_step_completed(step_index: usize) -> Self {
        SagaEvent::CompensationStepCompleted(StepData { step_index })
    }

    pub fn compensation_step_failed(
        step_index: usize,
        kind: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        SagaEvent::CompensationStepFailed(StepFailedData {
            step_index,
            kind: kind.into(),
            error: error.into(),
        })
    }

    pub fn saga_completed() -> Self {
        SagaEvent::SagaCompleted(FinishedData { at: Utc::now() })
    }

    pub fn saga_compensated() -> Self {
        SagaEvent::SagaCompensated(FinishedData { at: Utc::now() })
    }

    pub fn saga_failed(reason: impl Into<String>) -> Self {
        SagaEvent::SagaFailed(SagaFailedData {
            reason: reason.into(),
            failed_at: Utc::now(),
        })
    }

    pub fn outcome_published() -> Self {
        SagaEvent::OutcomePublished(FinishedData { at: Utc::now() })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::order_placement::OrderLine;

    fn order() -> OrderRequest {
        OrderRequest::new(
            "USR-0001",
            vec![OrderLine {
                product_id: "PRD-0001".into(),
                quantity: 1,
                unit_price_cents: 100,
            }],
        )
    }

    #[test]
    fn test_event_type() {
        assert_eq!(
            SagaEvent::saga_started(SagaId::new(), order()).event_type(),
            "SagaStarted"
        );
        assert_eq!(SagaEvent::step_started(0).event_type(), "StepStarted");
        assert_eq!(
            SagaEvent::compensation_step_failed(1, "unavailable", "down").event_type(),
            "CompensationStepFailed"
        );
        assert_eq!(SagaEvent::outcome_published().event_type(), "OutcomePublished");
    }

    #[test]
    fn test_serialized_shape() {
        let event = SagaEvent::step_completed(0, json!({ "reservation_id": "RES-0001" }));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "StepCompleted");
        assert_eq!(json["data"]["step_index"], 0);
        assert_eq!(json["data"]["output"]["reservation_id"], "RES-0001");

        let back: SagaEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_to_record_carries_step_index() {
        let saga_id = SagaId::new();
        let record = SagaEvent::step_failed(2, "conflict", "declined")
            .to_record(saga_id, Sequence::new(5))
            .unwrap();

        assert_eq!(record.saga_id, saga_id);
        assert_eq!(record.status, "StepFailed");
        assert_eq!(record.step_index, Some(2));
        assert_eq!(record.sequence, Sequence::new(5));

        let started = SagaEvent::saga_started(saga_id, order())
            .to_record(saga_id, Sequence::first())
            .unwrap();
        assert_eq!(started.step_index, None);
    }
}
