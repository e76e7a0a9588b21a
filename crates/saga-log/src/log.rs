use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;

use crate::{Result, SagaLogError, SagaLogRecord, Sequence};

/// Append-only storage for saga transitions.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaLog: Send + Sync {
    /// Appends one record.
    ///
    /// Fails with `SequenceConflict` if the saga's latest sequence is not
    /// `expected`. The record must carry `expected.next()`.
    ///
    /// Returns the saga's new latest sequence.
    async fn append(&self, record: SagaLogRecord, expected: Sequence) -> Result<Sequence>;

    /// All records of a saga, oldest first.
    async fn records_for(&self, saga_id: SagaId) -> Result<Vec<SagaLogRecord>>;

    /// Every saga with at least one record, in order of first appearance.
    async fn saga_ids(&self) -> Result<Vec<SagaId>>;

    /// Sagas with at least one record of `status`, in order of first
    /// appearance.
    async fn saga_ids_with_status(&self, status: &str) -> Result<Vec<SagaId>>;

    /// Sagas with no record of `status`, in order of first appearance.
    async fn saga_ids_without_status(&self, status: &str) -> Result<Vec<SagaId>>;

    /// The saga's latest sequence, or `None` if it has no records.
    async fn current_sequence(&self, saga_id: SagaId) -> Result<Option<Sequence>>;
}

// Lets callers pick the backend at runtime behind `Arc<dyn SagaLog>`.
#[async_trait]
impl<T: SagaLog + ?Sized> SagaLog for Arc<T> {
    async fn append(&self, record: SagaLogRecord, expected: Sequence) -> Result<Sequence> {
        (**self).append(record, expected).await
    }

    async fn records_for(&self, saga_id: SagaId) -> Result<Vec<SagaLogRecord>> {
        (**self).records_for(saga_id).await
    }

    async fn saga_ids(&self) -> Result<Vec<SagaId>> {
        (**self).saga_ids().await
    }

    async fn saga_ids_with_status(&self, status: &str) -> Result<Vec<SagaId>> {
        (**self).saga_ids_with_status(status).await
    }

    async fn saga_ids_without_status(&self, status: &str) -> Result<Vec<SagaId>> {
        (**self).saga_ids_without_status(status).await
    }

    async fn current_sequence(&self, saga_id: SagaId) -> Result<Option<Sequence>> {
        (**self).current_sequence(saga_id).await
    }
}

/// Checks that `record` is the direct successor of `expected`.
pub(crate) fn validate_for_append(record: &SagaLogRecord, expected: Sequence) -> Result<()> {
    if record.sequence != expected.next() {
        return Err(SagaLogError::InvalidRecord(format!(
            "record sequence must be {}, got {}",
            expected.next(),
            record.sequence
        )));
    }
    Ok(())
}
