//! Shared identifiers used across the coordination layer.

pub mod types;

pub use types::{ClientId, IdempotencyKey, SagaId, ServiceKind};
