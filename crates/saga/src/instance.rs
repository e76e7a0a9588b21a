//! Saga instance, rebuilt by folding its log.

use chrono::{DateTime, Utc};
use common::SagaId;
use saga_log::{SagaLogRecord, Sequence};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::events::{SagaEvent, SagaStartedData};
use crate::order_placement::{OrderRequest, SagaStep, steps_for};
use crate::state::{SagaStatus, StepStatus};

/// One order-placement attempt.
///
/// Only the coordinator mutates an instance, and only by applying events it
/// has already appended to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    id: SagaId,
    order: OrderRequest,
    steps: Vec<SagaStep>,
    current_step_index: usize,
    status: SagaStatus,
    cancel_requested: bool,
    failure_reason: Option<String>,
    /// Set once a forward step failed and compensation is due.
    failed_step: Option<usize>,
    started_at: DateTime<Utc>,
    version: Sequence,
    outcome_published: bool,
}

/// The next transition a saga needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Invoke the forward action of this step.
    Forward(usize),
    /// Record the cancel request by switching to compensation.
    BeginCompensation,
    /// Invoke the compensating action of this step.
    Compensate(usize),
    /// Every step is done.
    Complete,
    /// Nothing left to roll back.
    FinishCompensation,
    /// Terminal, but the outcome has not reached the event bus.
    PublishOutcome,
    /// Nothing left to do.
    Idle,
}

impl SagaInstance {
    /// Creates the instance described by a `SagaStarted` event.
    pub fn started(data: SagaStartedData) -> Self {
        Self {
            id: data.saga_id,
            steps: steps_for(data.saga_id),
            order: data.order,
            current_step_index: 0,
            status: SagaStatus::Running,
            cancel_requested: false,
            failure_reason: None,
            failed_step: None,
            started_at: data.started_at,
            version: Sequence::initial(),
            outcome_published: false,
        }
    }

    /// Rebuilds a saga from its log records, oldest first.
    pub fn replay(records: Vec<SagaLogRecord>) -> Result<Option<Self>> {
        let mut records = records.into_iter();
        let Some(first) = records.next() else {
            return Ok(None);
        };

        let SagaEvent::SagaStarted(data) = serde_json::from_value(first.payload)? else {
            return Err(SagaError::CorruptLog(format!(
                "saga {} does not begin with SagaStarted",
                first.saga_id
            )));
        };
        let mut saga = Self::started(data);
        saga.version = first.sequence;

        for record in records {
            let event: SagaEvent = serde_json::from_value(record.payload)?;
            saga.apply(event);
            saga.version = record.sequence;
        }
        Ok(Some(saga))
    }

    pub fn apply(&mut self, event: SagaEvent) {
        match event {
            SagaEvent::SagaStarted(data) => {
                *self = Self::started(data);
            }
            SagaEvent::StepStarted(data) => {
                self.current_step_index = data.step_index;
            }
            SagaEvent::StepCompleted(data) => {
                if let Some(step) = self.steps.get_mut(data.step_index) {
                    step.status = StepStatus::Done;
                    step.output = Some(data.output);
                }
                self.current_step_index = data.step_index + 1;
            }
            SagaEvent::StepFailed(data) => {
                self.failed_step = Some(data.step_index);
                self.failure_reason = Some(format!(
                    "{} failed: {}",
                    self.step_name(data.step_index),
                    data.error
                ));
            }
            SagaEvent::CancelRequested(data) => {
                self.cancel_requested = true;
                self.failure_reason.get_or_insert(data.reason);
            }
            SagaEvent::CompensationStarted(data) => {
                self.status = SagaStatus::Compensating;
                self.failure_reason.get_or_insert(data.reason);
            }
            SagaEvent::CompensationStepCompleted(data) => {
                if let Some(step) = self.steps.get_mut(data.step_index) {
                    step.status = StepStatus::CompensationDone;
                }
            }
            SagaEvent::CompensationStepFailed(data) => {
                if let Some(step) = self.steps.get_mut(data.step_index) {
                    step.status = StepStatus::CompensationFailed;
                }
            }
            SagaEvent::SagaCompleted(_) => {
                self.status = SagaStatus::Completed;
            }
            SagaEvent::SagaCompensated(_) => {
                self.status = SagaStatus::Compensated;
            }
            SagaEvent::SagaFailed(data) => {
                self.status = SagaStatus::Failed;
                self.failure_reason = Some(data.reason);
            }
            SagaEvent::OutcomePublished(_) => {
                self.outcome_published = true;
            }
        }
    }

    /// Decides the next transition from the current state alone.
    pub fn next_action(&self) -> NextAction {
        match self.status {
            SagaStatus::Running if self.cancel_requested || self.failed_step.is_some() => {
                NextAction::BeginCompensation
            }
            SagaStatus::Running if self.current_step_index < self.steps.len() => {
                NextAction::Forward(self.current_step_index)
            }
            SagaStatus::Running => NextAction::Complete,
            SagaStatus::Compensating => match self.last_done_step() {
                Some(index) => NextAction::Compensate(index),
                None => NextAction::FinishCompensation,
            },
            _ if !self.outcome_published => NextAction::PublishOutcome,
            _ => NextAction::Idle,
        }
    }

    /// Steps run strictly in order, so reverse index order is reverse
    /// completion order.
    fn last_done_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .rposition(|step| step.status == StepStatus::Done)
    }

    fn step_name(&self, index: usize) -> &'static str {
        self.steps
            .get(index)
            .map(|step| step.kind.as_str())
            .unwrap_or("unknown step")
    }
}

// Query methods
impl SagaInstance {
    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn order(&self) -> &OrderRequest {
        &self.order
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&SagaStep> {
        self.steps.get(index)
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Sequence of the last applied log record.
    pub fn version(&self) -> Sequence {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Sequence) {
        self.version = version;
    }

    pub fn is_outcome_published(&self) -> bool {
        self.outcome_published
    }

    /// The order record ID, once the order step has completed.
    pub fn order_id(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|step| step.kind == crate::order_placement::StepKind::CreateOrder)
            .filter(|step| step.status == StepStatus::Done)
            .and_then(|step| step.output_id())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::order_placement::OrderLine;

    fn started() -> SagaInstance {
        let order = OrderRequest::new(
            "USR-0001",
            vec![OrderLine {
                product_id: "PRD-0001".into(),
                quantity: 2,
                unit_price_cents: 500,
            }],
        );
        let SagaEvent::SagaStarted(data) = SagaEvent::saga_started(SagaId::new(), order) else {
            unreachable!()
        };
        SagaInstance::started(data)
    }

    #[test]
    fn test_new_saga_runs_first_step() {
        let saga = started();
        assert_eq!(saga.status(), SagaStatus::Running);
        assert_eq!(saga.steps().len(), 3);
        assert_eq!(saga.next_action(), NextAction::Forward(0));
    }

    #[test]
    fn test_step_completion_advances() {
        let mut saga = started();
        saga.apply(SagaEvent::step_started(0));
        assert_eq!(saga.next_action(), NextAction::Forward(0));

        saga.apply(SagaEvent::step_completed(0, json!({ "reservation_id": "RES-1" })));
        assert_eq!(saga.current_step_index(), 1);
        assert_eq!(saga.step(0).unwrap().status, StepStatus::Done);
        assert_eq!(saga.next_action(), NextAction::Forward(1));

        saga.apply(SagaEvent::step_completed(1, json!({ "authorization_id": "AUTH-1" })));
        saga.apply(SagaEvent::step_completed(2, json!({ "order_id": "ORD-1" })));
        assert_eq!(saga.next_action(), NextAction::Complete);

        saga.apply(SagaEvent::saga_completed());
        assert_eq!(saga.order_id(), Some("ORD-1"));
        assert_eq!(saga.next_action(), NextAction::PublishOutcome);

        saga.apply(SagaEvent::outcome_published());
        assert_eq!(saga.next_action(), NextAction::Idle);
    }

    #[test]
    fn test_failure_compensates_done_steps_in_reverse() {
        let mut saga = started();
        saga.apply(SagaEvent::step_completed(0, json!({ "reservation_id": "RES-1" })));
        saga.apply(SagaEvent::step_completed(1, json!({ "authorization_id": "AUTH-1" })));
        saga.apply(SagaEvent::step_failed(2, "conflict", "duplicate order"));
        assert_eq!(saga.next_action(), NextAction::BeginCompensation);
        assert_eq!(saga.failure_reason(), Some("create_order failed: duplicate order"));

        saga.apply(SagaEvent::compensation_started("create_order failed"));
        assert_eq!(saga.status(), SagaStatus::Compensating);
        assert_eq!(saga.next_action(), NextAction::Compensate(1));

        saga.apply(SagaEvent::compensation_step_completed(1));
        assert_eq!(saga.next_action(), NextAction::Compensate(0));

        saga.apply(SagaEvent::compensation_step_completed(0));
        assert_eq!(saga.next_action(), NextAction::FinishCompensation);
        assert_eq!(saga.step(2).unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn test_cancel_request_begins_compensation() {
        let mut saga = started();
        saga.apply(SagaEvent::step_completed(0, json!({ "reservation_id": "RES-1" })));
        saga.apply(SagaEvent::cancel_requested("cancelled by customer"));

        assert!(saga.is_cancel_requested());
        assert_eq!(saga.next_action(), NextAction::BeginCompensation);
        assert_eq!(saga.failure_reason(), Some("cancelled by customer"));
    }

    #[test]
    fn test_replay_matches_applied_state() {
        let saga_id = SagaId::new();
        let order = started().order().clone();
        let events = [
            SagaEvent::saga_started(saga_id, order),
            SagaEvent::step_started(0),
            SagaEvent::step_completed(0, json!({ "reservation_id": "RES-1" })),
        ];
        let records = events
            .iter()
            .enumerate()
            .map(|(i, e)| e.to_record(saga_id, Sequence::new(i as i64 + 1)).unwrap())
            .collect();

        let saga = SagaInstance::replay(records).unwrap().unwrap();
        assert_eq!(saga.id(), saga_id);
        assert_eq!(saga.version(), Sequence::new(3));
        assert_eq!(saga.next_action(), NextAction::Forward(1));
        assert_eq!(SagaInstance::replay(Vec::new()).unwrap(), None);
    }

    #[test]
    fn test_replay_rejects_log_without_start() {
        let saga_id = SagaId::new();
        let record = SagaEvent::step_started(0)
            .to_record(saga_id, Sequence::first())
            .unwrap();
        assert!(matches!(
            SagaInstance::replay(vec![record]),
            Err(SagaError::CorruptLog(_))
        ));
    }
}
