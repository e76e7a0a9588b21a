//! HTTP route handlers.

pub mod gateway;
pub mod health;
pub mod metrics;
