//! Coarse order status exposed to customers.

use serde::{Deserialize, Serialize};

use crate::saga::SagaStatus;

/// What the order-facing surface reports. Step and error detail stays internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Confirmed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl From<SagaStatus> for OrderStatus {
    fn from(status: SagaStatus) -> Self {
        match status {
            SagaStatus::Started => OrderStatus::Pending,
            SagaStatus::Running | SagaStatus::Retrying | SagaStatus::Compensating => {
                OrderStatus::Processing
            }
            SagaStatus::Completed => OrderStatus::Confirmed,
            // An order whose compensation failed is still not fulfilled.
            SagaStatus::Failed | SagaStatus::Compensated | SagaStatus::CompensationFailed => {
                OrderStatus::Cancelled
            }
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
