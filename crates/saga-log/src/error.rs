use common::SagaId;
use thiserror::Error;

use crate::Sequence;

/// Errors that can occur when reading or writing the saga log.
#[derive(Debug, Error)]
pub enum SagaLogError {
    /// Another writer appended to the saga first.
    #[error("Sequence conflict for saga {saga_id}: expected {expected}, found {actual}")]
    SequenceConflict {
        saga_id: SagaId,
        expected: Sequence,
        actual: Sequence,
    },

    /// The record does not directly follow the expected sequence.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga log operations.
pub type Result<T> = std::result::Result<T, SagaLogError>;
