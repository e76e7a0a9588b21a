use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a saga instance.
///
/// Wraps a UUID so saga IDs cannot be mixed up with order IDs or other
/// UUID-based identifiers issued by downstream services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(Uuid);

impl SagaId {
    /// Creates a new random saga ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a saga ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SagaId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<SagaId> for Uuid {
    fn from(id: SagaId) -> Self {
        id.0
    }
}

/// Identity of an inbound client, used to key rate-limit buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity used when a request carries no client information.
    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Deterministic key that makes a repeated downstream call safe.
///
/// Saga steps derive their key from the saga ID and the step index, so every
/// retry of the same step (including retries after a crash) carries the same
/// key. Compensating calls use a distinct, equally deterministic key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derives the forward-action key for a saga step.
    pub fn for_step(saga_id: SagaId, step_index: usize) -> Self {
        Self(format!("{saga_id}:{step_index}"))
    }

    /// Derives the compensating-action key for a saga step.
    pub fn for_compensation(saga_id: SagaId, step_index: usize) -> Self {
        Self(format!("{saga_id}:{step_index}:compensate"))
    }

    /// Wraps a caller-supplied key.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The downstream dependencies the coordination layer calls.
///
/// Each variant is guarded by its own circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    User,
    Product,
    Payment,
    Order,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::User,
        ServiceKind::Product,
        ServiceKind::Payment,
        ServiceKind::Order,
    ];

    /// Returns the dependency name used for circuits, metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::User => "user-service",
            ServiceKind::Product => "product-service",
            ServiceKind::Payment => "payment-service",
            ServiceKind::Order => "order-service",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_id_new_creates_unique_ids() {
        let id1 = SagaId::new();
        let id2 = SagaId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn saga_id_from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        let id = SagaId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn saga_id_serializes_as_plain_uuid() {
        let id = SagaId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }

    #[test]
    fn idempotency_keys_are_deterministic() {
        let saga_id = SagaId::new();
        assert_eq!(
            IdempotencyKey::for_step(saga_id, 1),
            IdempotencyKey::for_step(saga_id, 1)
        );
        assert_ne!(
            IdempotencyKey::for_step(saga_id, 1),
            IdempotencyKey::for_step(saga_id, 2)
        );
        assert_ne!(
            IdempotencyKey::for_step(saga_id, 1),
            IdempotencyKey::for_compensation(saga_id, 1)
        );
    }

    #[test]
    fn idempotency_keys_differ_between_sagas() {
        assert_ne!(
            IdempotencyKey::for_step(SagaId::new(), 0),
            IdempotencyKey::for_step(SagaId::new(), 0)
        );
    }

    #[test]
    fn service_kind_names() {
        assert_eq!(ServiceKind::Product.to_string(), "product-service");
        assert_eq!(
            serde_json::to_string(&ServiceKind::Payment).unwrap(),
            "\"payment\""
        );
    }
}
