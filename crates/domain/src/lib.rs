//! Domain model for the order fulfillment saga.
//!
//! This crate holds the persisted shapes the orchestrator works with:
//! - [`SagaInstance`] with its [`SagaStatus`] state machine and fixed [`SagaStep`] topology
//! - [`SagaData`] / [`CompensationData`], schema-versioned payload documents
//! - [`OutboxEvent`] rows for the transactional outbox
//! - Order value objects and the coarse [`OrderStatus`] shown to customers

pub mod error;
pub mod order;
pub mod outbox;
pub mod saga;

pub use error::{DomainError, Result};
pub use order::{Money, OrderItem, OrderStatus, ProductId, UserId};
pub use outbox::{AggregateKind, NewOutboxEvent, OutboxEvent, event_types};
pub use saga::{
    Capability, CompensationData, CompensationRecord, OrderReservation, SagaData, SagaInstance,
    SagaInstanceParts, SagaStatus, SagaStep, StepErrorRecord, StepMetric,
};
