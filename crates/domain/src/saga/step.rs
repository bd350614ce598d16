//! The fixed step topology of the order fulfillment saga.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Saga type identifier for order fulfillment.
pub const ORDER_FULFILLMENT: &str = "ORDER_FULFILLMENT";

/// External capability a step talks to. Each one gets its own circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Inventory,
    Payment,
    Notification,
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::Inventory,
        Capability::Payment,
        Capability::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Inventory => "inventory",
            Capability::Payment => "payment",
            Capability::Notification => "notification",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of order fulfillment, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStep {
    /// Inventory confirms every item is in stock.
    StockVerified,
    /// Inventory holds stock per item.
    StockReserved,
    /// Payment captures the order total.
    PaymentProcessing,
    /// Payment reports the capture as settled.
    PaymentCompleted,
    /// The customer is told the order went through.
    NotificationSent,
    /// Reservations are committed; nothing is left to undo after this.
    Confirmed,
}

impl SagaStep {
    /// The full topology, in order.
    pub const TOPOLOGY: [SagaStep; 6] = [
        SagaStep::StockVerified,
        SagaStep::StockReserved,
        SagaStep::PaymentProcessing,
        SagaStep::PaymentCompleted,
        SagaStep::NotificationSent,
        SagaStep::Confirmed,
    ];

    /// Returns the first step of the topology.
    pub fn first() -> Self {
        SagaStep::StockVerified
    }

    /// Returns the step after this one, or `None` for the last step.
    pub fn next(&self) -> Option<Self> {
        let idx = self.position();
        Self::TOPOLOGY.get(idx + 1).copied()
    }

    /// Zero-based position in the topology.
    pub fn position(&self) -> usize {
        match self {
            SagaStep::StockVerified => 0,
            SagaStep::StockReserved => 1,
            SagaStep::PaymentProcessing => 2,
            SagaStep::PaymentCompleted => 3,
            SagaStep::NotificationSent => 4,
            SagaStep::Confirmed => 5,
        }
    }

    /// The capability invoked by this step.
    pub fn capability(&self) -> Capability {
        match self {
            SagaStep::StockVerified | SagaStep::StockReserved | SagaStep::Confirmed => {
                Capability::Inventory
            }
            SagaStep::PaymentProcessing | SagaStep::PaymentCompleted => Capability::Payment,
            SagaStep::NotificationSent => Capability::Notification,
        }
    }

    /// Returns true if completing this step allocates something that must be
    /// undone when a later step fails.
    pub fn is_compensable(&self) -> bool {
        matches!(self, SagaStep::StockReserved | SagaStep::PaymentProcessing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::StockVerified => "STOCK_VERIFIED",
            SagaStep::StockReserved => "STOCK_RESERVED",
            SagaStep::PaymentProcessing => "PAYMENT_PROCESSING",
            SagaStep::PaymentCompleted => "PAYMENT_COMPLETED",
            SagaStep::NotificationSent => "NOTIFICATION_SENT",
            SagaStep::Confirmed => "CONFIRMED",
        }
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SagaStep {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStep::TOPOLOGY
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| DomainError::UnknownVariant {
                kind: "saga step",
                value: s.to_string(),
            })
    }
}
