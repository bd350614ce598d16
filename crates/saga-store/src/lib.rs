//! Persistence for saga instances and the transactional outbox.
//!
//! Two traits describe what the orchestrator and relay need:
//! - [`SagaStore`]: create, load and conditionally update [`SagaInstance`]s,
//!   writing outbox rows in the same transaction, plus per-saga leases
//! - [`OutboxStore`]: claim, acknowledge and retry [`OutboxEvent`]s
//!
//! [`InMemorySagaStore`] implements both for tests and single-process runs;
//! [`PostgresSagaStore`] is the durable implementation.
//!
//! [`SagaInstance`]: domain::SagaInstance
//! [`OutboxEvent`]: domain::OutboxEvent

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::Version;
pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use store::{OutboxStore, SagaStore};
