//! Transactional outbox rows.
//!
//! A state change that other services must hear about writes a
//! [`NewOutboxEvent`] in the same persistence boundary as the change itself.
//! A relay later publishes the row and flips `processed`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId, IdempotencyKey};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::DomainError;
use crate::saga::{SagaInstance, SagaStatus};

/// Default number of delivery attempts before an event is parked.
pub const DEFAULT_OUTBOX_MAX_RETRIES: u32 = 5;

/// Event type names written by the saga engine.
pub mod event_types {
    pub const SAGA_START_REQUESTED: &str = "SagaStartRequested";
    pub const ORDER_CONFIRMED: &str = "OrderConfirmed";
    pub const ORDER_CANCELLED: &str = "OrderCancelled";
    pub const ORDER_COMPENSATION_FAILED: &str = "OrderCompensationFailed";
}

/// The aggregate families the relay knows how to route.
///
/// Rows are stored with a free-form `aggregate_type` string because other
/// producers share the table; the relay parses it into this closed set and
/// treats anything else as not actionable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateKind {
    Saga,
    Order,
    Inventory,
    Payment,
    Notification,
}

impl AggregateKind {
    pub const ALL: [AggregateKind; 5] = [
        AggregateKind::Saga,
        AggregateKind::Order,
        AggregateKind::Inventory,
        AggregateKind::Payment,
        AggregateKind::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateKind::Saga => "Saga",
            AggregateKind::Order => "Order",
            AggregateKind::Inventory => "Inventory",
            AggregateKind::Payment => "Payment",
            AggregateKind::Notification => "Notification",
        }
    }
}

impl std::fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AggregateKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DomainError::UnknownVariant {
                kind: "aggregate type",
                value: s.to_string(),
            })
    }
}

/// A stored outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: AggregateId,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub event_type: String,
    /// `None` when the producer wrote a null payload.
    pub event_data: Option<serde_json::Value>,
    /// Monotonic per aggregate.
    pub sequence_number: i64,
    pub idempotency_key: IdempotencyKey,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Returns true once delivery attempts are used up; the relay stops retrying.
    pub fn is_parked(&self) -> bool {
        !self.processed && self.retry_count >= self.max_retries
    }

    /// Returns true if the relay may pick this row up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.processed && !self.is_parked() && self.next_retry_at.is_none_or(|at| at <= now)
    }
}

/// An outbox row about to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub event_type: String,
    pub event_data: Option<serde_json::Value>,
    pub idempotency_key: IdempotencyKey,
    pub correlation_id: Option<CorrelationId>,
    pub max_retries: u32,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        event_data: Option<serde_json::Value>,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event_type.into(),
            event_data,
            idempotency_key,
            correlation_id: None,
            max_retries: DEFAULT_OUTBOX_MAX_RETRIES,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Materializes the row as a store would persist it.
    pub fn into_event(self, sequence_number: i64) -> OutboxEvent {
        OutboxEvent {
            id: AggregateId::new(),
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            event_data: self.event_data,
            sequence_number,
            idempotency_key: self.idempotency_key,
            processed: false,
            processed_at: None,
            retry_count: 0,
            max_retries: self.max_retries,
            next_retry_at: None,
            last_error: None,
            correlation_id: self.correlation_id,
            created_at: Utc::now(),
        }
    }

    fn for_saga(
        kind: AggregateKind,
        aggregate_id: AggregateId,
        saga: &SagaInstance,
        event_type: &str,
        data: serde_json::Value,
    ) -> Self {
        let key = IdempotencyKey::derive([saga.correlation_id().as_str(), event_type]);
        Self::new(kind.as_str(), aggregate_id, event_type, Some(data), key)
            .with_correlation_id(saga.correlation_id().clone())
    }

    /// Asks a saga worker to run the saga.
    pub fn saga_start_requested(saga: &SagaInstance) -> Self {
        Self::for_saga(
            AggregateKind::Saga,
            saga.id(),
            saga,
            event_types::SAGA_START_REQUESTED,
            json!({
                "correlation_id": saga.correlation_id(),
                "saga_id": saga.id(),
                "saga_type": saga.saga_type(),
            }),
        )
    }

    /// The order went through every step.
    pub fn order_confirmed(saga: &SagaInstance) -> Self {
        let data = saga.saga_data();
        Self::for_saga(
            AggregateKind::Order,
            data.order_id,
            saga,
            event_types::ORDER_CONFIRMED,
            json!({
                "order_id": data.order_id,
                "user_id": data.user_id,
                "payment_id": data.payment_id,
                "total_cents": data.total_amount().cents(),
                "reservations": data.reservations.iter().map(|r| &r.reservation_id).collect::<Vec<_>>(),
            }),
        )
    }

    /// The order was called off; `reason` is a stable machine-readable code.
    pub fn order_cancelled(saga: &SagaInstance, reason: &str) -> Self {
        let data = saga.saga_data();
        Self::for_saga(
            AggregateKind::Order,
            data.order_id,
            saga,
            event_types::ORDER_CANCELLED,
            json!({
                "order_id": data.order_id,
                "user_id": data.user_id,
                "reason": reason,
                "final_status": saga.status(),
                "failed_step": saga.compensation_data().failed_step,
            }),
        )
    }

    /// Compensation gave up; an operator has to finish the undo by hand.
    pub fn order_compensation_failed(saga: &SagaInstance) -> Self {
        let data = saga.saga_data();
        let failed: Vec<_> = saga
            .compensation_data()
            .failed_actions()
            .map(|a| json!({ "step": a.step, "action": a.action, "error": a.error }))
            .collect();
        Self::for_saga(
            AggregateKind::Order,
            data.order_id,
            saga,
            event_types::ORDER_COMPENSATION_FAILED,
            json!({
                "order_id": data.order_id,
                "reason": saga.failure_reason(),
                "status": SagaStatus::CompensationFailed,
                "failed_actions": failed,
            }),
        )
    }
}
