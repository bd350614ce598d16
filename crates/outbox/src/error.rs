//! Outbox error types.

use thiserror::Error;

/// Errors a [`JobDispatcher`](crate::JobDispatcher) can report.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The queue backend could not be reached; the relay retries later.
    #[error("Job queue unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the job.
    #[error("Job rejected by queue {queue}: {reason}")]
    Rejected { queue: String, reason: String },

    #[error("Job payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why an outbox row's data cannot become a job.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("event has no data")]
    Missing,

    #[error("event data is not a JSON object")]
    NotAnObject,

    #[error("event data does not match its aggregate kind: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid event data: {0}")]
    Invalid(String),
}

/// Errors that stop a relay poll as a whole.
///
/// Delivery failures of single events never show up here; they are
/// recorded on the event row.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Outbox store error: {0}")]
    Store(#[from] saga_store::StoreError),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
