use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a record within one saga's log.
///
/// Sequences start at 1 for the first record; 0 means "no records yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(i64);

impl Sequence {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// The sequence of a saga with no records.
    pub fn initial() -> Self {
        Self(0)
    }

    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Sequence {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// One durable saga state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaLogRecord {
    pub record_id: RecordId,

    pub saga_id: SagaId,

    /// Position in the saga's log; strictly increasing without gaps.
    pub sequence: Sequence,

    /// The step the transition concerns, if any.
    pub step_index: Option<usize>,

    /// Record type name (e.g. "StepCompleted").
    pub status: String,

    pub timestamp: DateTime<Utc>,

    /// The serialized transition.
    pub payload: serde_json::Value,
}

impl SagaLogRecord {
    pub fn new(
        saga_id: SagaId,
        sequence: Sequence,
        status: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            record_id: RecordId::new(),
            saga_id,
            sequence,
            step_index: None,
            status: status.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn with_step(mut self, step_index: usize) -> Self {
        self.step_index = Some(step_index);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_ordering() {
        assert!(Sequence::initial() < Sequence::first());
        assert_eq!(Sequence::initial().next(), Sequence::first());
        assert_eq!(Sequence::new(41).next().as_i64(), 42);
    }

    #[test]
    fn test_record_serializes_flat() {
        let saga_id = SagaId::new();
        let record = SagaLogRecord::new(saga_id, Sequence::first(), "SagaStarted", serde_json::json!({}))
            .with_step(2);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["sequence"], 1);
        assert_eq!(json["step_index"], 2);
        assert_eq!(json["saga_id"], saga_id.to_string());
    }
}
