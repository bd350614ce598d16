//! HTTP route handlers.

pub mod circuit_breakers;
pub mod health;
pub mod metrics;
pub mod outbox;
pub mod sagas;
