//! Saga coordination for order placement.
//!
//! An order is placed in three steps, each on a different service:
//! 1. Reserve inventory (product service)
//! 2. Authorize payment (payment service)
//! 3. Create the order record (order service)
//!
//! If a step fails, or the saga is cancelled or times out, the completed
//! steps are compensated in reverse order. Every transition is written to a
//! [`saga_log::SagaLog`] first, so sagas survive a restart and are resumed by
//! [`SagaCoordinator::recover`].

pub mod bus;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod instance;
pub mod order_placement;
pub mod state;
pub mod workflow;

pub use bus::{EventBus, InMemoryEventBus, OrderOutcome, OutcomeKind, PublishError, StepSummary};
pub use coordinator::{RecoveryReport, SagaConfig, SagaCoordinator};
pub use error::{Result, SagaError};
pub use events::SagaEvent;
pub use instance::{NextAction, SagaInstance};
pub use order_placement::{OrderLine, OrderRequest, SagaStep, StepKind};
pub use state::{SagaStatus, StepStatus};
pub use workflow::saga_view;
