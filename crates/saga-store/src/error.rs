use common::{AggregateId, CorrelationId, Version};
use domain::DomainError;
use thiserror::Error;

/// Errors that can occur when reading or writing saga state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version did not match the version the caller read.
    #[error(
        "Concurrency conflict for saga {correlation_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        correlation_id: CorrelationId,
        expected: Version,
        actual: Version,
    },

    /// No saga with this correlation ID exists.
    #[error("Saga not found: {0}")]
    SagaNotFound(CorrelationId),

    /// A saga with this correlation ID already exists.
    #[error("Duplicate correlation ID: {0}")]
    DuplicateCorrelationId(CorrelationId),

    /// No outbox row with this ID exists.
    #[error("Outbox event not found: {0}")]
    OutboxEventNotFound(AggregateId),

    /// A stored row could not be turned back into a domain record.
    #[error("Invalid stored record: {0}")]
    InvalidRecord(#[from] DomainError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
