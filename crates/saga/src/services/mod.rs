//! Capability clients the saga steps call.
//!
//! Each capability is a trait so production clients and the in-memory
//! doubles used by tests and single-process runs are interchangeable.
//! Every mutating call carries an idempotency key; replaying a call with the
//! same key returns the original result.

pub mod inventory;
pub mod notification;
pub mod payment;

use std::collections::HashMap;
use std::time::Duration;

use crate::error::CapabilityError;

pub use inventory::{
    InMemoryInventoryService, InventoryService, ReservationRequest, ReservationState,
    ReservationResult,
};
pub use notification::{InMemoryNotificationService, NotificationRequest, NotificationService};
pub use payment::{
    ChargeRequest, InMemoryPaymentService, PaymentReceipt, PaymentService, PaymentState,
    RefundReceipt,
};

/// Failure to inject into an in-memory capability operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a transient error this many times, then behave.
    Transient(u32),
    /// Fail with a transient error on every call.
    AlwaysTransient,
    /// Refuse with a business rejection on every call.
    Reject { code: String },
    /// Answer with an HTTP error status on every call.
    Http(u16),
    /// Take this long before answering.
    Delay(Duration),
}

impl Fault {
    pub fn reject(code: impl Into<String>) -> Self {
        Fault::Reject { code: code.into() }
    }
}

/// Faults and call counts per operation name.
#[derive(Debug, Default)]
pub(crate) struct FaultPlan {
    faults: HashMap<&'static str, Fault>,
    calls: HashMap<&'static str, u32>,
}

impl FaultPlan {
    pub(crate) fn set(&mut self, operation: &'static str, fault: Fault) {
        self.faults.insert(operation, fault);
    }

    pub(crate) fn clear(&mut self, operation: &'static str) {
        self.faults.remove(operation);
    }

    pub(crate) fn calls(&self, operation: &str) -> u32 {
        self.calls.get(operation).copied().unwrap_or(0)
    }

    /// Counts a call and returns how long to stall before answering.
    pub(crate) fn delay(&mut self, operation: &'static str) -> Option<Duration> {
        *self.calls.entry(operation).or_insert(0) += 1;
        match self.faults.get(operation) {
            Some(Fault::Delay(d)) => Some(*d),
            _ => None,
        }
    }

    /// Returns the injected failure for this call, if any.
    pub(crate) fn check(&mut self, operation: &'static str) -> Result<(), CapabilityError> {
        let Some(fault) = self.faults.get_mut(operation) else {
            return Ok(());
        };
        match fault {
            Fault::Transient(remaining) => {
                if *remaining == 0 {
                    return Ok(());
                }
                *remaining -= 1;
                Err(CapabilityError::Transient(format!(
                    "{operation}: connection reset"
                )))
            }
            Fault::AlwaysTransient => Err(CapabilityError::Transient(format!(
                "{operation}: connection reset"
            ))),
            Fault::Reject { code } => Err(CapabilityError::rejection(
                code.clone(),
                format!("{operation} refused"),
            )),
            Fault::Http(status) => Err(CapabilityError::Http {
                status: *status,
                message: format!("{operation} failed"),
            }),
            Fault::Delay(_) => Ok(()),
        }
    }
}
