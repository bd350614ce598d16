//! Domain error types.

use thiserror::Error;

use crate::saga::SagaStatus;

/// Errors raised while mutating or decoding domain records.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A status change that the saga state machine does not allow.
    #[error("Invalid saga transition: {from} -> {to}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },

    /// A mutation attempted on a saga that already reached a terminal status.
    #[error("Saga is terminal ({status}) and can no longer change")]
    Terminal { status: SagaStatus },

    /// A stored document failed validation at the deserialization boundary.
    #[error("Invalid {document} document: {reason}")]
    InvalidDocument {
        document: &'static str,
        reason: String,
    },

    /// The order cannot start a saga.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// Unknown enum tag in a persisted column.
    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
