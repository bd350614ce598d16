//! Saga orchestration for order fulfillment.
//!
//! An order goes through a fixed sequence of steps, each backed by a
//! capability (inventory, payment, notification):
//!
//! 1. `STOCK_VERIFIED`: check availability
//! 2. `STOCK_RESERVED`: reserve stock per item
//! 3. `PAYMENT_PROCESSING`: charge the customer
//! 4. `PAYMENT_COMPLETED`: verify settlement
//! 5. `NOTIFICATION_SENT`: tell the customer
//! 6. `CONFIRMED`: confirm the reservations
//!
//! Every call goes through a per-dependency [`CircuitBreaker`] wrapped in a
//! [`RetryExecutor`]. When a step fails for good, what earlier steps
//! allocated is undone in reverse order: payments are refunded and
//! unconfirmed reservations released.

pub mod cancellation;
pub mod compensation;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod recovery;
pub mod resilience;
pub mod services;
pub mod steps;

pub use cancellation::CancellationRegistry;
pub use compensation::{CompensationAction, PlannedCompensation};
pub use config::OrchestratorConfig;
pub use error::{CapabilityError, Result, SagaError};
pub use orchestrator::{
    CancellationOutcome, REASON_CANCELLED, REASON_EXPIRED, SagaExecutionResult, SagaOrchestrator,
    StartSagaRequest,
};
pub use pool::SagaWorkerPool;
pub use recovery::{RecoveryReport, RecoverySweeper};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState, RetryExecutor, RetryOutcome, RetryPolicy,
};
pub use services::{
    Fault, InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
    InventoryService, NotificationService, PaymentService,
};
pub use steps::Capabilities;
