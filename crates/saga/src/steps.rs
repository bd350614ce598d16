//! Forward step dispatch.
//!
//! Every [`SagaStep`] maps to exactly one capability call here; adding a
//! step without wiring it fails to compile.

use std::sync::Arc;

use chrono::Utc;
use common::{AggregateId, IdempotencyKey};
use domain::{OrderReservation, SagaData, SagaStep};
use tokio::sync::Mutex;

use crate::error::CapabilityError;
use crate::services::{
    ChargeRequest, InventoryService, NotificationRequest, NotificationService, PaymentService,
    ReservationRequest,
};

/// Template of the message sent once an order goes through.
pub const ORDER_CONFIRMED_TEMPLATE: &str = "order_confirmed";

/// The capability clients a saga talks to.
#[derive(Clone)]
pub struct Capabilities {
    pub inventory: Arc<dyn InventoryService>,
    pub payment: Arc<dyn PaymentService>,
    pub notification: Arc<dyn NotificationService>,
}

impl Capabilities {
    pub fn new(
        inventory: Arc<dyn InventoryService>,
        payment: Arc<dyn PaymentService>,
        notification: Arc<dyn NotificationService>,
    ) -> Self {
        Self {
            inventory,
            payment,
            notification,
        }
    }
}

/// What a step changed in the outside world.
///
/// Collected as calls succeed, so a step that fails halfway still reports
/// the resources it did allocate.
#[derive(Debug, Default)]
pub(crate) struct StepEffects {
    pub reservations: Vec<OrderReservation>,
    pub confirmed_reservations: Vec<String>,
    pub payment_id: Option<String>,
    pub notification_id: Option<String>,
}

impl StepEffects {
    /// Folds the effects into the saga payload.
    pub fn apply_to(self, data: &mut SagaData) {
        for reservation in self.reservations {
            data.upsert_reservation(reservation);
        }
        for id in &self.confirmed_reservations {
            if let Some(r) = data.reservations.iter_mut().find(|r| &r.reservation_id == id) {
                r.confirmed = true;
            }
        }
        if let Some(payment_id) = self.payment_id {
            data.payment_id = Some(payment_id);
        }
        if let Some(notification_id) = self.notification_id {
            data.notification_id = Some(notification_id);
        }
    }
}

/// Idempotency key for a call made by `step` of saga `saga_id`.
pub(crate) fn step_key(saga_id: AggregateId, step: SagaStep) -> IdempotencyKey {
    IdempotencyKey::derive([saga_id.to_string(), step.as_str().to_string()])
}

impl Capabilities {
    /// Performs one attempt of `step`.
    pub(crate) async fn perform(
        &self,
        step: SagaStep,
        saga_id: AggregateId,
        data: &SagaData,
        effects: &Mutex<StepEffects>,
    ) -> Result<(), CapabilityError> {
        match step {
            SagaStep::StockVerified => self.inventory.check_availability(&data.items).await,

            SagaStep::StockReserved => {
                for item in &data.items {
                    if data.reservation_for(&item.product_id).is_some() {
                        continue;
                    }
                    let key = IdempotencyKey::derive([
                        saga_id.to_string(),
                        item.product_id.to_string(),
                    ]);
                    let reserved = self
                        .inventory
                        .reserve(ReservationRequest {
                            order_id: data.order_id,
                            product_id: item.product_id.clone(),
                            quantity: item.quantity,
                            idempotency_key: key,
                        })
                        .await?;
                    effects.lock().await.reservations.push(OrderReservation {
                        product_id: item.product_id.clone(),
                        quantity: item.quantity,
                        reservation_id: reserved.reservation_id,
                        reserved_at: Utc::now(),
                        expires_at: reserved.expires_at,
                        confirmed: false,
                    });
                }
                Ok(())
            }

            SagaStep::PaymentProcessing => {
                if data.payment_id.is_some() {
                    return Ok(());
                }
                let receipt = self
                    .payment
                    .charge(ChargeRequest {
                        order_id: data.order_id,
                        user_id: data.user_id,
                        amount: data.total_amount(),
                        idempotency_key: step_key(saga_id, step),
                    })
                    .await?;
                effects.lock().await.payment_id = Some(receipt.payment_id);
                Ok(())
            }

            SagaStep::PaymentCompleted => {
                let payment_id = data.payment_id.as_deref().ok_or_else(|| {
                    CapabilityError::rejection("payment_missing", "no payment to settle")
                })?;
                self.payment
                    .verify_settlement(payment_id, &step_key(saga_id, step))
                    .await?;
                Ok(())
            }

            SagaStep::NotificationSent => {
                let notification_id = self
                    .notification
                    .send(NotificationRequest {
                        user_id: data.user_id,
                        order_id: data.order_id,
                        template: ORDER_CONFIRMED_TEMPLATE.to_string(),
                        idempotency_key: step_key(saga_id, step),
                    })
                    .await?;
                effects.lock().await.notification_id = Some(notification_id);
                Ok(())
            }

            SagaStep::Confirmed => {
                for reservation in data.unconfirmed_reservations() {
                    let key = IdempotencyKey::derive([
                        saga_id.to_string(),
                        step.as_str().to_string(),
                        reservation.reservation_id.clone(),
                    ]);
                    self.inventory
                        .confirm(&reservation.reservation_id, &key)
                        .await?;
                    effects
                        .lock()
                        .await
                        .confirmed_reservations
                        .push(reservation.reservation_id.clone());
                }
                Ok(())
            }
        }
    }
}
