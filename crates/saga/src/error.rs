//! Saga error types.

use std::time::Duration;

use common::CorrelationId;
use domain::DomainError;
use saga_store::StoreError;
use thiserror::Error;

/// Failure reported by a capability call (inventory, payment, notification).
///
/// The variants split into what a retry can fix and what it cannot; see
/// [`CapabilityError::is_retriable`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// Network blip or similar; the same call may succeed later.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The call did not finish within its time budget.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The dependency answered with an HTTP error status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The circuit breaker for this dependency is open; the call was not made.
    #[error("Circuit breaker is open for {dependency}")]
    CircuitOpen { dependency: String },

    /// The dependency refused the request on business grounds.
    #[error("Rejected ({code}): {message}")]
    BusinessRejection { code: String, message: String },

    /// The dependency is down.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl CapabilityError {
    pub fn rejection(code: impl Into<String>, message: impl Into<String>) -> Self {
        CapabilityError::BusinessRejection {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Default retry classifier: network, timeout, 5xx and 429 are worth retrying.
    ///
    /// `CircuitOpen` is not; retrying into an open circuit only burns attempts.
    pub fn is_retriable(&self) -> bool {
        match self {
            CapabilityError::Transient(_)
            | CapabilityError::Timeout(_)
            | CapabilityError::Unavailable(_) => true,
            CapabilityError::Http { status, .. } => *status >= 500 || *status == 429,
            CapabilityError::CircuitOpen { .. } | CapabilityError::BusinessRejection { .. } => {
                false
            }
        }
    }

    /// Returns true if the failure says the dependency itself is unhealthy.
    ///
    /// Only these failures count towards opening a circuit.
    pub fn is_dependency_fault(&self) -> bool {
        self.is_retriable()
    }

    /// Returns true if the saga may try the step again later.
    ///
    /// An open circuit costs nothing from the step's retry executor budget,
    /// but parking the saga for a later attempt does use one unit of the
    /// saga-level `retry_count` budget.
    pub fn allows_saga_retry(&self) -> bool {
        self.is_retriable() || matches!(self, CapabilityError::CircuitOpen { .. })
    }

    /// Short error class used in step error records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CapabilityError::Transient(_) => "transient",
            CapabilityError::Timeout(_) => "timeout",
            CapabilityError::Http { .. } => "http",
            CapabilityError::CircuitOpen { .. } => "circuit_open",
            CapabilityError::BusinessRejection { .. } => "business_rejection",
            CapabilityError::Unavailable(_) => "unavailable",
        }
    }

    /// The rejection code, for business rejections.
    pub fn rejection_code(&self) -> Option<&str> {
        match self {
            CapabilityError::BusinessRejection { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Errors that can escape the orchestrator boundary.
///
/// Step failures never show up here; they become saga state transitions.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No saga exists for this correlation ID.
    #[error("Saga not found: {0}")]
    NotFound(CorrelationId),

    /// Another execution holds the saga's lease.
    #[error("Saga {0} is locked by another execution")]
    Locked(CorrelationId),

    /// A saga with this correlation ID already exists.
    #[error("Saga already exists: {0}")]
    AlreadyExists(CorrelationId),

    /// Domain rule violated (bad order, illegal transition).
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Persistence failed.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateCorrelationId(id) => SagaError::AlreadyExists(id),
            other => SagaError::Store(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
