use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use tokio::sync::RwLock;

use crate::log::validate_for_append;
use crate::{Result, SagaLog, SagaLogError, SagaLogRecord, Sequence};

/// In-memory saga log, for tests and single-process deployments.
///
/// Provides the same interface and conflict semantics as the PostgreSQL log.
#[derive(Clone, Default)]
pub struct InMemorySagaLog {
    records: Arc<RwLock<Vec<SagaLogRecord>>>,
}

impl InMemorySagaLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all sagas.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl SagaLog for InMemorySagaLog {
    async fn append(&self, record: SagaLogRecord, expected: Sequence) -> Result<Sequence> {
        validate_for_append(&record, expected)?;

        let mut records = self.records.write().await;
        let current = records
            .iter()
            .filter(|r| r.saga_id == record.saga_id)
            .map(|r| r.sequence)
            .max()
            .unwrap_or(Sequence::initial());

        if current != expected {
            return Err(SagaLogError::SequenceConflict {
                saga_id: record.saga_id,
                expected,
                actual: current,
            });
        }

        let sequence = record.sequence;
        records.push(record);
        Ok(sequence)
    }

    async fn records_for(&self, saga_id: SagaId) -> Result<Vec<SagaLogRecord>> {
        let records = self.records.read().await;
        let mut found: Vec<_> = records
            .iter()
            .filter(|r| r.saga_id == saga_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.sequence);
        Ok(found)
    }

    async fn saga_ids(&self) -> Result<Vec<SagaId>> {
        let records = self.records.read().await;
        Ok(first_appearances(records.iter().map(|r| r.saga_id)))
    }

    async fn saga_ids_with_status(&self, status: &str) -> Result<Vec<SagaId>> {
        let records = self.records.read().await;
        Ok(first_appearances(
            records
                .iter()
                .filter(|r| r.status == status)
                .map(|r| r.saga_id),
        ))
    }

    async fn saga_ids_without_status(&self, status: &str) -> Result<Vec<SagaId>> {
        let records = self.records.read().await;
        let excluded: HashSet<SagaId> = records
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.saga_id)
            .collect();
        Ok(first_appearances(
            records
                .iter()
                .map(|r| r.saga_id)
                .filter(|id| !excluded.contains(id)),
        ))
    }

    async fn current_sequence(&self, saga_id: SagaId) -> Result<Option<Sequence>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.saga_id == saga_id)
            .map(|r| r.sequence)
            .max())
    }
}

/// Distinct ids, keeping the order in which they first occur.
fn first_appearances(ids: impl Iterator<Item = SagaId>) -> Vec<SagaId> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}
