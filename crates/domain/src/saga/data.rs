//! Schema-versioned payload documents stored on a saga instance.
//!
//! Both documents carry a `schema_version` tag and are validated when decoded
//! from storage, so a malformed row is rejected before the orchestrator sees it.

use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::order::{Money, OrderItem, ProductId, UserId};
use crate::saga::SagaStep;

/// Current schema version of [`SagaData`].
pub const SAGA_DATA_SCHEMA_VERSION: u32 = 1;

/// Current schema version of [`CompensationData`].
pub const COMPENSATION_DATA_SCHEMA_VERSION: u32 = 1;

/// Stock held for one order line.
///
/// Unconfirmed reservations are released when a later step fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReservation {
    pub product_id: ProductId,
    pub quantity: u32,
    pub reservation_id: String,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmed: bool,
}

/// Timing and outcome of one step execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetric {
    pub step: SagaStep,
    pub duration_ms: u64,
    pub success: bool,
    /// Attempts beyond the first.
    pub retries: u32,
    pub recorded_at: DateTime<Utc>,
}

impl StepMetric {
    pub fn new(step: SagaStep, duration_ms: u64, success: bool, attempts: u32) -> Self {
        Self {
            step,
            duration_ms,
            success,
            retries: attempts.saturating_sub(1),
            recorded_at: Utc::now(),
        }
    }
}

/// An error accumulated while running a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepErrorRecord {
    pub step: SagaStep,
    /// Error class (`transient`, `timeout`, `circuit_open`, `business_rejection`, ...).
    pub kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Forward-path payload of a saga: the order plus everything the steps produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaData {
    pub schema_version: u32,
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub reservations: Vec<OrderReservation>,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub notification_id: Option<String>,
    #[serde(default)]
    pub step_metrics: Vec<StepMetric>,
    #[serde(default)]
    pub errors: Vec<StepErrorRecord>,
}

impl SagaData {
    /// Creates the payload for a new saga, rejecting orders that cannot be fulfilled.
    pub fn new(order_id: AggregateId, user_id: UserId, items: Vec<OrderItem>) -> Result<Self> {
        let data = Self {
            schema_version: SAGA_DATA_SCHEMA_VERSION,
            order_id,
            user_id,
            items,
            reservations: Vec::new(),
            payment_id: None,
            notification_id: None,
            step_metrics: Vec::new(),
            errors: Vec::new(),
        };
        data.validate_order().map_err(DomainError::InvalidOrder)?;
        Ok(data)
    }

    /// Decodes and validates a stored document.
    pub fn decode(value: serde_json::Value) -> Result<Self> {
        let data: SagaData =
            serde_json::from_value(value).map_err(|e| DomainError::InvalidDocument {
                document: "saga data",
                reason: e.to_string(),
            })?;
        if data.schema_version != SAGA_DATA_SCHEMA_VERSION {
            return Err(DomainError::InvalidDocument {
                document: "saga data",
                reason: format!("unsupported schema version {}", data.schema_version),
            });
        }
        data.validate_order()
            .map_err(|reason| DomainError::InvalidDocument {
                document: "saga data",
                reason,
            })?;
        Ok(data)
    }

    /// Encodes the document for storage.
    pub fn encode(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn validate_order(&self) -> std::result::Result<(), String> {
        if self.items.is_empty() {
            return Err("order has no items".to_string());
        }
        if let Some(item) = self.items.iter().find(|i| i.quantity == 0) {
            return Err(format!("item {} has zero quantity", item.product_id));
        }
        if let Some(item) = self.items.iter().find(|i| !i.unit_price.is_positive()) {
            return Err(format!("item {} has a non-positive price", item.product_id));
        }
        Ok(())
    }

    /// Sum of every line's price.
    pub fn total_amount(&self) -> Money {
        self.items.iter().map(OrderItem::total_price).sum()
    }

    /// Returns the reservation held for a product, if any.
    pub fn reservation_for(&self, product_id: &ProductId) -> Option<&OrderReservation> {
        self.reservations
            .iter()
            .find(|r| &r.product_id == product_id)
    }

    /// Records a reservation, replacing any earlier one for the same product.
    pub fn upsert_reservation(&mut self, reservation: OrderReservation) {
        match self
            .reservations
            .iter_mut()
            .find(|r| r.product_id == reservation.product_id)
        {
            Some(existing) => *existing = reservation,
            None => self.reservations.push(reservation),
        }
    }

    /// Reservations that still hold stock and must be released on failure.
    pub fn unconfirmed_reservations(&self) -> impl Iterator<Item = &OrderReservation> {
        self.reservations.iter().filter(|r| !r.confirmed)
    }
}

/// Outcome of one compensating action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub step: SagaStep,
    /// What was undone, e.g. `release:RES-0001` or `refund:PAY-0001`.
    pub action: String,
    pub succeeded: bool,
    pub attempts: u32,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Backward-path payload: why compensation ran and what it has undone so far.
///
/// Completed actions are remembered so a resumed compensation never
/// releases or refunds the same resource twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationData {
    pub schema_version: u32,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub failed_step: Option<SagaStep>,
    #[serde(default)]
    pub released_reservations: Vec<String>,
    #[serde(default)]
    pub refunded_payment_id: Option<String>,
    #[serde(default)]
    pub refund_id: Option<String>,
    #[serde(default)]
    pub actions: Vec<CompensationRecord>,
}

impl Default for CompensationData {
    fn default() -> Self {
        Self {
            schema_version: COMPENSATION_DATA_SCHEMA_VERSION,
            reason: None,
            failed_step: None,
            released_reservations: Vec::new(),
            refunded_payment_id: None,
            refund_id: None,
            actions: Vec::new(),
        }
    }
}

impl CompensationData {
    /// Decodes and validates a stored document.
    pub fn decode(value: serde_json::Value) -> Result<Self> {
        let data: CompensationData =
            serde_json::from_value(value).map_err(|e| DomainError::InvalidDocument {
                document: "compensation data",
                reason: e.to_string(),
            })?;
        if data.schema_version != COMPENSATION_DATA_SCHEMA_VERSION {
            return Err(DomainError::InvalidDocument {
                document: "compensation data",
                reason: format!("unsupported schema version {}", data.schema_version),
            });
        }
        Ok(data)
    }

    /// Encodes the document for storage.
    pub fn encode(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn is_released(&self, reservation_id: &str) -> bool {
        self.released_reservations
            .iter()
            .any(|r| r == reservation_id)
    }

    pub fn is_refunded(&self, payment_id: &str) -> bool {
        self.refunded_payment_id.as_deref() == Some(payment_id)
    }

    /// Actions that did not succeed.
    pub fn failed_actions(&self) -> impl Iterator<Item = &CompensationRecord> {
        self.actions.iter().filter(|a| !a.succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn items() -> Vec<OrderItem> {
        vec![
            OrderItem::new("P1", 2, Money::from_cents(1000)),
            OrderItem::new("P2", 1, Money::from_cents(2500)),
        ]
    }

    fn reservation(product: &str, id: &str) -> OrderReservation {
        let now = Utc::now();
        OrderReservation {
            product_id: ProductId::new(product),
            quantity: 1,
            reservation_id: id.to_string(),
            reserved_at: now,
            expires_at: now + Duration::minutes(15),
            confirmed: false,
        }
    }

    #[test]
    fn test_new_rejects_empty_order() {
        let result = SagaData::new(AggregateId::new(), UserId::new(), vec![]);
        assert!(matches!(result, Err(DomainError::InvalidOrder(_))));
    }

    #[test]
    fn test_new_rejects_zero_quantity() {
        let result = SagaData::new(
            AggregateId::new(),
            UserId::new(),
            vec![OrderItem::new("P1", 0, Money::from_cents(100))],
        );
        assert!(matches!(result, Err(DomainError::InvalidOrder(_))));
    }

    #[test]
    fn test_total_amount() {
        let data = SagaData::new(AggregateId::new(), UserId::new(), items()).unwrap();
        assert_eq!(data.total_amount().cents(), 4500);
    }

    #[test]
    fn test_decode_accepts_encoded_document() {
        let mut data = SagaData::new(AggregateId::new(), UserId::new(), items()).unwrap();
        data.upsert_reservation(reservation("P1", "RES-1"));
        let decoded = SagaData::decode(data.encode().unwrap()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_decode_rejects_unknown_schema_version() {
        let data = SagaData::new(AggregateId::new(), UserId::new(), items()).unwrap();
        let mut value = data.encode().unwrap();
        value["schema_version"] = serde_json::json!(99);
        let err = SagaData::decode(value).unwrap_err();
        assert!(matches!(err, DomainError::InvalidDocument { .. }));
    }

    #[test]
    fn test_decode_rejects_untyped_blob() {
        let err = SagaData::decode(serde_json::json!({"orderId": "x"})).unwrap_err();
        assert!(matches!(err, DomainError::InvalidDocument { .. }));
    }

    #[test]
    fn test_upsert_reservation_replaces_same_product() {
        let mut data = SagaData::new(AggregateId::new(), UserId::new(), items()).unwrap();
        data.upsert_reservation(reservation("P1", "RES-1"));
        data.upsert_reservation(reservation("P1", "RES-1b"));
        data.upsert_reservation(reservation("P2", "RES-2"));
        assert_eq!(data.reservations.len(), 2);
        assert_eq!(
            data.reservation_for(&ProductId::new("P1"))
                .unwrap()
                .reservation_id,
            "RES-1b"
        );
    }

    #[test]
    fn test_unconfirmed_reservations() {
        let mut data = SagaData::new(AggregateId::new(), UserId::new(), items()).unwrap();
        let mut confirmed = reservation("P1", "RES-1");
        confirmed.confirmed = true;
        data.upsert_reservation(confirmed);
        data.upsert_reservation(reservation("P2", "RES-2"));
        let ids: Vec<_> = data
            .unconfirmed_reservations()
            .map(|r| r.reservation_id.as_str())
            .collect();
        assert_eq!(ids, vec!["RES-2"]);
    }

    #[test]
    fn test_compensation_data_tracks_undone_resources() {
        let mut comp = CompensationData::default();
        comp.released_reservations.push("RES-1".to_string());
        comp.refunded_payment_id = Some("PAY-1".to_string());
        assert!(comp.is_released("RES-1"));
        assert!(!comp.is_released("RES-2"));
        assert!(comp.is_refunded("PAY-1"));

        let decoded = CompensationData::decode(comp.encode().unwrap()).unwrap();
        assert_eq!(decoded, comp);
    }
}
