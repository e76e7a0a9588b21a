//! Saga error types.

use common::SagaId;
use saga_log::SagaLogError;
use thiserror::Error;

use crate::state::SagaStatus;

/// Errors that can occur during saga operations.
///
/// Step and compensation failures are not errors here: they are recorded on
/// the saga and reflected in its status.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Saga is in an invalid state for the requested operation.
    #[error("Invalid saga state: expected {expected}, actual {actual}")]
    InvalidState {
        expected: &'static str,
        actual: SagaStatus,
    },

    /// Another task is currently driving the saga.
    #[error("Saga {0} is already being driven")]
    Busy(SagaId),

    /// No saga with this ID exists.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The order request was rejected before the saga started.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// A step index outside the saga's step list.
    #[error("Step {0} does not exist")]
    StepOutOfRange(usize),

    /// The log does not describe a consistent saga.
    #[error("Corrupt saga log: {0}")]
    CorruptLog(String),

    /// Saga log error.
    #[error("Saga log error: {0}")]
    Log(#[from] SagaLogError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SagaError::InvalidState { .. } | SagaError::Busy(_) => "conflict",
            SagaError::NotFound(_) => "not_found",
            SagaError::InvalidOrder(_) => "invalid",
            SagaError::StepOutOfRange(_)
            | SagaError::CorruptLog(_)
            | SagaError::Log(_)
            | SagaError::Serialization(_) => "internal",
        }
    }

    /// Whether another writer appended to the saga first.
    pub fn is_sequence_conflict(&self) -> bool {
        matches!(self, SagaError::Log(SagaLogError::SequenceConflict { .. }))
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
