//! Compensation planning and execution.
//!
//! The plan walks completed steps in strict reverse order of completion and
//! lists the undo actions still outstanding. Actions already recorded in
//! the saga's compensation data are left out, so replanning after a crash
//! never releases or refunds twice.

use common::{AggregateId, IdempotencyKey};
use domain::{SagaInstance, SagaStep};

use crate::error::CapabilityError;
use crate::steps::Capabilities;

/// One undo action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationAction {
    ReleaseReservation { reservation_id: String },
    RefundPayment { payment_id: String },
}

impl CompensationAction {
    /// Label stored in compensation records, e.g. `release:RES-0001`.
    pub fn label(&self) -> String {
        match self {
            CompensationAction::ReleaseReservation { reservation_id } => {
                format!("release:{reservation_id}")
            }
            CompensationAction::RefundPayment { payment_id } => format!("refund:{payment_id}"),
        }
    }
}

/// An action together with the step it undoes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCompensation {
    pub step: SagaStep,
    pub action: CompensationAction,
}

/// Outstanding undo actions for `saga`, in execution order.
pub fn plan(saga: &SagaInstance) -> Vec<PlannedCompensation> {
    let mut steps: Vec<SagaStep> = saga.completed_steps().iter().rev().copied().collect();

    // A reservation step that failed halfway still holds stock.
    if !steps.contains(&SagaStep::StockReserved) && !saga.saga_data().reservations.is_empty() {
        steps.insert(0, SagaStep::StockReserved);
    }

    let data = saga.saga_data();
    let done = saga.compensation_data();
    let mut planned = Vec::new();

    for step in steps.into_iter().filter(SagaStep::is_compensable) {
        match step {
            SagaStep::StockReserved => {
                planned.extend(
                    data.unconfirmed_reservations()
                        .filter(|r| !done.is_released(&r.reservation_id))
                        .map(|r| PlannedCompensation {
                            step,
                            action: CompensationAction::ReleaseReservation {
                                reservation_id: r.reservation_id.clone(),
                            },
                        }),
                );
            }
            SagaStep::PaymentProcessing => {
                if let Some(payment_id) = &data.payment_id
                    && !done.is_refunded(payment_id)
                {
                    planned.push(PlannedCompensation {
                        step,
                        action: CompensationAction::RefundPayment {
                            payment_id: payment_id.clone(),
                        },
                    });
                }
            }
            _ => {}
        }
    }

    planned
}

/// Returns true if no action for `step` is still outstanding.
pub fn step_settled(saga: &SagaInstance, step: SagaStep) -> bool {
    plan(saga).iter().all(|p| p.step != step)
}

impl Capabilities {
    /// Performs one attempt of an undo action. Returns the refund ID for refunds.
    pub(crate) async fn undo(
        &self,
        saga_id: AggregateId,
        action: &CompensationAction,
    ) -> Result<Option<String>, CapabilityError> {
        match action {
            CompensationAction::ReleaseReservation { reservation_id } => {
                let key = IdempotencyKey::derive([
                    saga_id.to_string(),
                    "RELEASE".to_string(),
                    reservation_id.clone(),
                ]);
                self.inventory.release(reservation_id, &key).await?;
                Ok(None)
            }
            CompensationAction::RefundPayment { payment_id } => {
                let key = IdempotencyKey::derive([saga_id.to_string(), "REFUND".to_string()]);
                let receipt = self.payment.refund(payment_id, &key).await?;
                Ok(Some(receipt.refund_id))
            }
        }
    }
}
