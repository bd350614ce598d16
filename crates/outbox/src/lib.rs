//! Transactional outbox relay.
//!
//! State changes write outbox rows in the same transaction as the change.
//! The [`OutboxRelay`] claims due rows, decodes each one into the job
//! payload of its aggregate kind, routes it to a queue of the
//! [`JobDispatcher`] and marks it processed. Failed deliveries back off and
//! are parked once their attempts run out.

pub mod dispatcher;
pub mod error;
pub mod payload;
pub mod relay;

pub use dispatcher::{
    InMemoryJobDispatcher, Job, JobDispatcher, JobOptions, JobPayload, SAGA_QUEUE,
};
pub use error::{DispatchError, PayloadError, RelayError, Result};
pub use payload::{CapabilityJob, OrderEventJob, SagaJob};
pub use relay::{OutboxRelay, RelayConfig, RelayReport, queue_for};
