//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{AggregateId, IdempotencyKey};
use domain::{Money, UserId};
use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::error::CapabilityError;
use crate::services::{Fault, FaultPlan};

/// A request to capture the order total.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub amount: Money,
    pub idempotency_key: IdempotencyKey,
}

/// Where a payment stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Captured,
    Settled,
    Refunded,
}

/// Result of a successful charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub payment_id: String,
    pub amount: Money,
}

/// Result of a successful refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub payment_id: String,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Captures the amount. A replay with the same key returns the original
    /// receipt and never charges twice.
    async fn charge(&self, request: ChargeRequest) -> Result<PaymentReceipt, CapabilityError>;

    /// Confirms a captured payment has settled.
    async fn verify_settlement(
        &self,
        payment_id: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<PaymentState, CapabilityError>;

    /// Refunds a payment. Refunding an already refunded payment returns the
    /// existing refund.
    async fn refund(
        &self,
        payment_id: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<RefundReceipt, CapabilityError>;
}

#[derive(Debug)]
struct PaymentRecord {
    state: PaymentState,
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, PaymentRecord>,
    charges_by_key: HashMap<IdempotencyKey, PaymentReceipt>,
    refunds: HashMap<String, RefundReceipt>,
    next_payment_id: u32,
    next_refund_id: u32,
    faults: FaultPlan,
}

/// In-memory payment service for tests and single-process runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects a fault into `operation` (`charge`, `verify_settlement` or `refund`).
    pub async fn set_fault(&self, operation: &'static str, fault: Fault) {
        self.state.write().await.faults.set(operation, fault);
    }

    pub async fn clear_fault(&self, operation: &'static str) {
        self.state.write().await.faults.clear(operation);
    }

    /// Number of calls made to `operation`, failed ones included.
    pub async fn calls(&self, operation: &str) -> u32 {
        self.state.read().await.faults.calls(operation)
    }

    /// Number of distinct charges.
    pub async fn charge_count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    /// Number of distinct refunds.
    pub async fn refund_count(&self) -> usize {
        self.state.read().await.refunds.len()
    }

    pub async fn payment_state(&self, payment_id: &str) -> Option<PaymentState> {
        self.state
            .read()
            .await
            .payments
            .get(payment_id)
            .map(|p| p.state)
    }

    async fn enter(
        &self,
        operation: &'static str,
    ) -> Result<RwLockWriteGuard<'_, InMemoryPaymentState>, CapabilityError> {
        let delay = self.state.write().await.faults.delay(operation);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.write().await;
        state.faults.check(operation)?;
        Ok(state)
    }
}

fn unknown_payment(payment_id: &str) -> CapabilityError {
    CapabilityError::rejection("payment_not_found", payment_id.to_string())
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(&self, request: ChargeRequest) -> Result<PaymentReceipt, CapabilityError> {
        let mut state = self.enter("charge").await?;

        if let Some(existing) = state.charges_by_key.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }
        if !request.amount.is_positive() {
            return Err(CapabilityError::rejection(
                "invalid_amount",
                format!("cannot charge {}", request.amount),
            ));
        }

        state.next_payment_id += 1;
        let receipt = PaymentReceipt {
            payment_id: format!("PAY-{:04}", state.next_payment_id),
            amount: request.amount,
        };
        state.payments.insert(
            receipt.payment_id.clone(),
            PaymentRecord {
                state: PaymentState::Captured,
            },
        );
        state
            .charges_by_key
            .insert(request.idempotency_key, receipt.clone());

        Ok(receipt)
    }

    async fn verify_settlement(
        &self,
        payment_id: &str,
        _idempotency_key: &IdempotencyKey,
    ) -> Result<PaymentState, CapabilityError> {
        let mut state = self.enter("verify_settlement").await?;
        let record = state
            .payments
            .get_mut(payment_id)
            .ok_or_else(|| unknown_payment(payment_id))?;

        match record.state {
            PaymentState::Captured | PaymentState::Settled => {
                record.state = PaymentState::Settled;
                Ok(PaymentState::Settled)
            }
            PaymentState::Refunded => Err(CapabilityError::rejection(
                "payment_refunded",
                payment_id.to_string(),
            )),
        }
    }

    async fn refund(
        &self,
        payment_id: &str,
        _idempotency_key: &IdempotencyKey,
    ) -> Result<RefundReceipt, CapabilityError> {
        let mut state = self.enter("refund").await?;

        if let Some(existing) = state.refunds.get(payment_id) {
            return Ok(existing.clone());
        }

        let record = state
            .payments
            .get_mut(payment_id)
            .ok_or_else(|| unknown_payment(payment_id))?;
        record.state = PaymentState::Refunded;

        state.next_refund_id += 1;
        let receipt = RefundReceipt {
            refund_id: format!("REF-{:04}", state.next_refund_id),
            payment_id: payment_id.to_string(),
        };
        state
            .refunds
            .insert(payment_id.to_string(), receipt.clone());

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charge_request(key: &str) -> ChargeRequest {
        ChargeRequest {
            order_id: AggregateId::new(),
            user_id: UserId::new(),
            amount: Money::from_cents(5000),
            idempotency_key: IdempotencyKey::from(key),
        }
    }

    #[tokio::test]
    async fn test_charge_and_refund() {
        let service = InMemoryPaymentService::new();
        let key = IdempotencyKey::from("refund-key");

        let receipt = service.charge(charge_request("k-1")).await.unwrap();
        assert!(receipt.payment_id.starts_with("PAY-"));
        assert_eq!(
            service.payment_state(&receipt.payment_id).await,
            Some(PaymentState::Captured)
        );

        let refund = service.refund(&receipt.payment_id, &key).await.unwrap();
        assert_eq!(refund.payment_id, receipt.payment_id);
        assert_eq!(
            service.payment_state(&receipt.payment_id).await,
            Some(PaymentState::Refunded)
        );
    }

    #[tokio::test]
    async fn test_replayed_charge_returns_original_receipt() {
        let service = InMemoryPaymentService::new();

        let first = service.charge(charge_request("k-1")).await.unwrap();
        let replay = service.charge(charge_request("k-1")).await.unwrap();
        let other = service.charge(charge_request("k-2")).await.unwrap();

        assert_eq!(first, replay);
        assert_ne!(first.payment_id, other.payment_id);
        assert_eq!(service.charge_count().await, 2);
    }

    #[tokio::test]
    async fn test_refund_twice_refunds_once() {
        let service = InMemoryPaymentService::new();
        let key = IdempotencyKey::from("refund-key");
        let receipt = service.charge(charge_request("k-1")).await.unwrap();

        let first = service.refund(&receipt.payment_id, &key).await.unwrap();
        let second = service.refund(&receipt.payment_id, &key).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(service.refund_count().await, 1);
    }

    #[tokio::test]
    async fn test_fraud_rejection() {
        let service = InMemoryPaymentService::new();
        service
            .set_fault("charge", Fault::reject("fraud_detected"))
            .await;

        let err = service.charge(charge_request("k-1")).await.unwrap_err();
        assert_eq!(err.rejection_code(), Some("fraud_detected"));
        assert_eq!(service.charge_count().await, 0);
        assert_eq!(service.calls("charge").await, 1);
    }

    #[tokio::test]
    async fn test_settlement() {
        let service = InMemoryPaymentService::new();
        let key = IdempotencyKey::from("verify");
        let receipt = service.charge(charge_request("k-1")).await.unwrap();

        let state = service
            .verify_settlement(&receipt.payment_id, &key)
            .await
            .unwrap();
        assert_eq!(state, PaymentState::Settled);

        let missing = service.verify_settlement("PAY-9999", &key).await;
        assert_eq!(
            missing.unwrap_err().rejection_code(),
            Some("payment_not_found")
        );
    }
}
