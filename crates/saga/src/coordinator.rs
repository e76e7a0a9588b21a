//! Saga coordinator for the order-placement workflow.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use common::SagaId;
use router::Dispatcher;
use saga_log::SagaLog;

use crate::bus::{EventBus, OrderOutcome};
use crate::error::{Result, SagaError};
use crate::events::{SagaEvent, SagaStartedData};
use crate::instance::{NextAction, SagaInstance};
use crate::order_placement::{OrderRequest, compensation_call, forward_call};
use crate::state::SagaStatus;

const DEFAULT_SAGA_TIMEOUT: Duration = Duration::from_secs(30);

/// Record statuses the coordinator queries the log by. Once a saga's
/// outcome is published it is archived.
const OUTCOME_PUBLISHED: &str = "OutcomePublished";
const SAGA_FAILED: &str = "SagaFailed";

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Upper bound on how long a saga may stay `Running`.
    pub saga_timeout: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            saga_timeout: DEFAULT_SAGA_TIMEOUT,
        }
    }
}

/// Result of a [`SagaCoordinator::recover`] pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    /// Sagas driven from a non-terminal state.
    pub resumed: Vec<SagaId>,
    /// Terminal sagas whose outcome was published again.
    pub republished: Vec<SagaId>,
    /// Sagas recovery could not move, with the reason.
    pub errors: Vec<(SagaId, String)>,
}

type ActiveDrivers = Arc<Mutex<HashSet<SagaId>>>;

/// Exclusive right to drive one saga, released on drop.
struct DriverSlot {
    saga_id: SagaId,
    active: ActiveDrivers,
}

impl Drop for DriverSlot {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.saga_id);
    }
}

enum Claim {
    Driver(DriverSlot),
    /// Another task drives the saga.
    Busy,
}

enum Progress {
    Moved,
    /// The outcome could not be published; retried on the next recovery.
    Stalled,
}

/// Drives order-placement sagas through their steps.
///
/// Every transition is appended to the saga log before it is applied, so a
/// restarted coordinator resumes each saga from the log alone. Forward steps
/// run strictly in order; when one fails, the steps already done are
/// compensated in reverse.
///
/// At most one task drives a saga. The only other writer is [`cancel`],
/// which appends `CancelRequested` behind the driver's back; the driver's
/// next append then conflicts and it reloads the saga from the log.
///
/// [`cancel`]: SagaCoordinator::cancel
pub struct SagaCoordinator<L: SagaLog> {
    log: L,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<dyn EventBus>,
    config: SagaConfig,
    active: ActiveDrivers,
}

impl<L: SagaLog> SagaCoordinator<L> {
    pub fn new(log: L, dispatcher: Arc<Dispatcher>, bus: Arc<dyn EventBus>) -> Self {
        Self::with_config(log, dispatcher, bus, SagaConfig::default())
    }

    pub fn with_config(
        log: L,
        dispatcher: Arc<Dispatcher>,
        bus: Arc<dyn EventBus>,
        config: SagaConfig,
    ) -> Self {
        Self {
            log,
            dispatcher,
            bus,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Starts a saga for `order` and drives it to a terminal status.
    ///
    /// Step failures do not make this return an error; they show up in the
    /// returned saga's status.
    #[tracing::instrument(skip(self, order), fields(customer_id = %order.customer_id))]
    pub async fn start(&self, order: OrderRequest) -> Result<SagaInstance> {
        order.validate()?;

        let saga_id = SagaId::new();
        let data = SagaStartedData {
            saga_id,
            order,
            started_at: Utc::now(),
        };
        let started = SagaEvent::SagaStarted(data.clone());
        let mut saga = SagaInstance::started(data);

        let Claim::Driver(_slot) = self.claim(saga_id) else {
            return Err(SagaError::Busy(saga_id));
        };
        self.append(&mut saga, started).await?;
        tracing::info!(%saga_id, total_cents = ?saga.order().total_cents(), "saga started");

        self.drive(&mut saga).await?;
        Ok(saga)
    }

    /// Performs exactly one transition on a saga.
    pub async fn advance(&self, saga_id: SagaId) -> Result<SagaInstance> {
        let Claim::Driver(_slot) = self.claim(saga_id) else {
            return Err(SagaError::Busy(saga_id));
        };
        let mut saga = self.get_saga(saga_id).await?;
        if saga.next_action() == NextAction::Idle {
            return Err(SagaError::InvalidState {
                expected: "an unfinished saga",
                actual: saga.status(),
            });
        }
        self.transition(&mut saga).await?;
        Ok(saga)
    }

    /// Cancels a running saga.
    ///
    /// The request is recorded in the log before this returns. If another
    /// task is driving the saga, that driver switches to compensation at its
    /// next step boundary and the saga is returned as currently persisted.
    /// Otherwise compensation runs here.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, saga_id: SagaId) -> Result<SagaInstance> {
        let saga = self.get_saga(saga_id).await?;
        ensure_cancellable(&saga)?;

        let Claim::Driver(_slot) = self.claim(saga_id) else {
            let saga = self.request_cancel(saga_id).await?;
            tracing::info!(%saga_id, "cancel recorded for active driver");

            // The driver may have let go in the meantime.
            return match self.claim(saga_id) {
                Claim::Driver(_slot) => {
                    let mut saga = self.get_saga(saga_id).await?;
                    self.drive(&mut saga).await?;
                    Ok(saga)
                }
                Claim::Busy => Ok(saga),
            };
        };

        let mut saga = self.request_cancel(saga_id).await?;
        tracing::info!(%saga_id, "saga cancel recorded");

        self.drive(&mut saga).await?;
        Ok(saga)
    }

    /// Appends `CancelRequested` unless the log already has one.
    ///
    /// Retries on sequence conflicts with a concurrent driver; fails once
    /// the saga is no longer `Running`.
    async fn request_cancel(&self, saga_id: SagaId) -> Result<SagaInstance> {
        loop {
            let mut saga = self.get_saga(saga_id).await?;
            ensure_cancellable(&saga)?;
            if saga.is_cancel_requested() {
                return Ok(saga);
            }
            match self
                .append(&mut saga, SagaEvent::cancel_requested("cancelled by request"))
                .await
            {
                Err(e) if e.is_sequence_conflict() => continue,
                Err(e) => return Err(e),
                Ok(()) => return Ok(saga),
            }
        }
    }

    /// Loads a saga from the log.
    pub async fn get_saga(&self, saga_id: SagaId) -> Result<SagaInstance> {
        let records = self.log.records_for(saga_id).await?;
        SagaInstance::replay(records)?.ok_or(SagaError::NotFound(saga_id))
    }

    /// Sagas waiting for manual intervention.
    pub async fn failed_sagas(&self) -> Result<Vec<SagaInstance>> {
        let failed_ids = self.log.saga_ids_with_status(SAGA_FAILED).await?;
        let mut failed = Vec::with_capacity(failed_ids.len());
        for saga_id in failed_ids {
            failed.push(self.get_saga(saga_id).await?);
        }
        Ok(failed)
    }

    /// Resumes every unfinished saga found in the log.
    ///
    /// Non-terminal sagas are driven to completion; terminal sagas whose
    /// outcome never reached the bus are published again. `Failed` sagas are
    /// not compensated further. Sagas with a published outcome are archived
    /// and never loaded.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for saga_id in self.log.saga_ids_without_status(OUTCOME_PUBLISHED).await? {
            let mut saga = match self.get_saga(saga_id).await {
                Ok(saga) => saga,
                Err(e) => {
                    tracing::error!(%saga_id, error = %e, "saga could not be loaded");
                    report.errors.push((saga_id, e.to_string()));
                    continue;
                }
            };

            let resuming = match saga.next_action() {
                NextAction::Idle => continue,
                NextAction::PublishOutcome => false,
                _ => true,
            };

            let Claim::Driver(_slot) = self.claim(saga_id) else {
                continue;
            };

            match self.drive(&mut saga).await {
                Ok(()) if resuming => report.resumed.push(saga_id),
                Ok(()) if saga.is_outcome_published() => report.republished.push(saga_id),
                Ok(()) => report
                    .errors
                    .push((saga_id, "outcome not yet published".to_string())),
                Err(e) => {
                    tracing::error!(%saga_id, error = %e, "saga recovery failed");
                    report.errors.push((saga_id, e.to_string()));
                }
            }
        }

        tracing::info!(
            resumed = report.resumed.len(),
            republished = report.republished.len(),
            errors = report.errors.len(),
            "saga recovery finished"
        );
        Ok(report)
    }

    /// Runs transitions until the saga has nothing left to do.
    async fn drive(&self, saga: &mut SagaInstance) -> Result<()> {
        while saga.next_action() != NextAction::Idle {
            if let Progress::Stalled = self.transition(saga).await? {
                break;
            }
        }
        Ok(())
    }

    async fn transition(&self, saga: &mut SagaInstance) -> Result<Progress> {
        match self.try_transition(saga).await {
            Err(e) if e.is_sequence_conflict() => {
                *saga = self.get_saga(saga.id()).await?;
                tracing::info!(saga_id = %saga.id(), "saga reloaded after concurrent cancel");
                Ok(Progress::Moved)
            }
            other => other,
        }
    }

    async fn try_transition(&self, saga: &mut SagaInstance) -> Result<Progress> {
        let saga_id = saga.id();

        match saga.next_action() {
            NextAction::Forward(index) => {
                if let Some(reason) = self.timed_out(saga) {
                    tracing::warn!(%saga_id, step = index, %reason, "saga interrupted");
                    self.append(saga, SagaEvent::cancel_requested(reason)).await?;
                    return Ok(Progress::Moved);
                }
                self.run_forward(saga, index).await?;
            }
            NextAction::BeginCompensation => {
                let reason = saga
                    .failure_reason()
                    .unwrap_or("saga aborted")
                    .to_string();
                tracing::warn!(%saga_id, %reason, "saga compensation started");
                self.append(saga, SagaEvent::compensation_started(reason)).await?;
            }
            NextAction::Compensate(index) => {
                self.run_compensation(saga, index).await?;
            }
            NextAction::Complete => {
                self.append(saga, SagaEvent::saga_completed()).await?;
                self.record_finished(saga);
            }
            NextAction::FinishCompensation => {
                self.append(saga, SagaEvent::saga_compensated()).await?;
                self.record_finished(saga);
            }
            NextAction::PublishOutcome => return self.publish_outcome(saga).await,
            NextAction::Idle => {}
        }
        Ok(Progress::Moved)
    }

    async fn run_forward(&self, saga: &mut SagaInstance, index: usize) -> Result<()> {
        let saga_id = saga.id();
        let call = forward_call(saga_id, saga.order(), saga.steps(), index)?;

        self.append(saga, SagaEvent::step_started(index)).await?;
        tracing::info!(%saga_id, step = index, operation = %call.operation, "saga step started");

        match self.dispatcher.call(&call).await {
            Ok(output) => {
                self.append_result(saga, SagaEvent::step_completed(index, output))
                    .await?;
                tracing::info!(%saga_id, step = index, "saga step completed");
            }
            Err(e) => {
                tracing::warn!(%saga_id, step = index, error = %e, "saga step failed");
                self.append_result(saga, SagaEvent::step_failed(index, e.kind(), e.to_string()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn run_compensation(&self, saga: &mut SagaInstance, index: usize) -> Result<()> {
        let saga_id = saga.id();
        let call = compensation_call(saga_id, saga.steps(), index)?;

        match self.dispatcher.call(&call).await {
            Ok(_) => {
                self.append(saga, SagaEvent::compensation_step_completed(index))
                    .await?;
                tracing::info!(%saga_id, step = index, "compensation step completed");
            }
            Err(e) => {
                tracing::error!(
                    %saga_id,
                    step = index,
                    error = %e,
                    "compensation step failed, saga needs manual intervention"
                );
                self.append(
                    saga,
                    SagaEvent::compensation_step_failed(index, e.kind(), e.to_string()),
                )
                .await?;
                let reason = format!("compensation of {} failed: {e}", call.operation);
                self.append(saga, SagaEvent::saga_failed(reason)).await?;
                self.record_finished(saga);
            }
        }
        Ok(())
    }

    async fn publish_outcome(&self, saga: &mut SagaInstance) -> Result<Progress> {
        let Some(outcome) = OrderOutcome::from_saga(saga) else {
            return Err(SagaError::InvalidState {
                expected: "a terminal saga",
                actual: saga.status(),
            });
        };

        match self.bus.publish(&outcome).await {
            Ok(()) => {
                self.append(saga, SagaEvent::outcome_published()).await?;
                tracing::debug!(saga_id = %saga.id(), kind = outcome.kind.as_str(), "outcome published");
                Ok(Progress::Moved)
            }
            Err(e) => {
                tracing::warn!(saga_id = %saga.id(), error = %e, "outcome publish failed");
                Ok(Progress::Stalled)
            }
        }
    }

    /// The timeout reason, once the saga has run longer than allowed.
    fn timed_out(&self, saga: &SagaInstance) -> Option<String> {
        let elapsed = (Utc::now() - saga.started_at()).to_std().ok()?;
        (elapsed > self.config.saga_timeout).then(|| {
            format!(
                "saga timed out after {}ms",
                self.config.saga_timeout.as_millis()
            )
        })
    }

    /// Appends `event` at the saga's next sequence, then applies it.
    async fn append(&self, saga: &mut SagaInstance, event: SagaEvent) -> Result<()> {
        let expected = saga.version();
        let record = event.to_record(saga.id(), expected.next())?;
        let version = self.log.append(record, expected).await?;
        saga.apply(event);
        saga.set_version(version);
        Ok(())
    }

    /// Appends the result of a downstream call that already took effect.
    ///
    /// A cancel recorded meanwhile moves the log on; the saga is reloaded
    /// and the result is recorded after the cancel so that compensation
    /// sees it.
    async fn append_result(&self, saga: &mut SagaInstance, event: SagaEvent) -> Result<()> {
        loop {
            match self.append(saga, event.clone()).await {
                Err(e) if e.is_sequence_conflict() => {
                    *saga = self.get_saga(saga.id()).await?;
                }
                other => return other,
            }
        }
    }

    fn record_finished(&self, saga: &SagaInstance) {
        let outcome = saga.status().as_str();
        metrics::counter!("saga_executions_total", "outcome" => outcome).increment(1);
        if let Ok(elapsed) = (Utc::now() - saga.started_at()).to_std() {
            metrics::histogram!("saga_duration_seconds").record(elapsed.as_secs_f64());
        }
        match saga.status() {
            SagaStatus::Failed => {
                tracing::error!(saga_id = %saga.id(), reason = ?saga.failure_reason(), "saga failed");
            }
            status => tracing::info!(saga_id = %saga.id(), %status, "saga finished"),
        }
    }

    /// Takes the driver slot for a saga.
    fn claim(&self, saga_id: SagaId) -> Claim {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(saga_id) {
            return Claim::Busy;
        }
        Claim::Driver(DriverSlot {
            saga_id,
            active: Arc::clone(&self.active),
        })
    }

    /// Number of sagas currently being driven.
    pub fn active_drivers(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn ensure_cancellable(saga: &SagaInstance) -> Result<()> {
    if saga.status().can_cancel() {
        Ok(())
    } else {
        Err(SagaError::InvalidState {
            expected: "Running",
            actual: saga.status(),
        })
    }
}
