//! Durable log of saga state transitions.
//!
//! Every transition the saga coordinator makes is appended here before it
//! acts on it, so a restarted coordinator can rebuild each saga and resume
//! it. Appends use optimistic concurrency on a per-saga sequence number.

pub mod error;
pub mod log;
pub mod memory;
pub mod postgres;
pub mod record;

pub use error::{Result, SagaLogError};
pub use log::SagaLog;
pub use memory::InMemorySagaLog;
pub use postgres::PostgresSagaLog;
pub use record::{RecordId, SagaLogRecord, Sequence};
