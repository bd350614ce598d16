//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{AggregateId, IdempotencyKey};
use domain::{OrderItem, ProductId};
use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::error::CapabilityError;
use crate::services::{Fault, FaultPlan};

/// How long the in-memory service holds unconfirmed stock.
const RESERVATION_HOLD_MINUTES: i64 = 15;

/// Stock to hold for one order line.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub order_id: AggregateId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub idempotency_key: IdempotencyKey,
}

/// Result of a successful inventory reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationResult {
    /// The reservation ID assigned by the inventory service.
    pub reservation_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Fails with a `insufficient_stock` rejection if any line cannot be served.
    async fn check_availability(&self, items: &[OrderItem]) -> Result<(), CapabilityError>;

    /// Holds stock for one line. Replays with the same key return the
    /// original reservation.
    async fn reserve(
        &self,
        request: ReservationRequest,
    ) -> Result<ReservationResult, CapabilityError>;

    /// Turns a hold into a committed allocation.
    async fn confirm(
        &self,
        reservation_id: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<(), CapabilityError>;

    /// Gives held stock back. Releasing twice is a no-op.
    async fn release(
        &self,
        reservation_id: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<(), CapabilityError>;
}

/// Lifecycle of an in-memory reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Held,
    Confirmed,
    Released,
}

#[derive(Debug)]
struct ReservationRecord {
    product_id: ProductId,
    quantity: u32,
    state: ReservationState,
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    /// Products without an entry have unlimited stock.
    stock: HashMap<ProductId, u32>,
    reservations: HashMap<String, ReservationRecord>,
    by_key: HashMap<IdempotencyKey, ReservationResult>,
    next_id: u32,
    releases: u32,
    faults: FaultPlan,
}

/// In-memory inventory service for tests and single-process runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the available stock for a product.
    pub async fn set_stock(&self, product_id: impl Into<ProductId>, quantity: u32) {
        self.state
            .write()
            .await
            .stock
            .insert(product_id.into(), quantity);
    }

    pub async fn stock_level(&self, product_id: &ProductId) -> Option<u32> {
        self.state.read().await.stock.get(product_id).copied()
    }

    /// Injects a fault into `operation` (`check_availability`, `reserve`,
    /// `confirm` or `release`).
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

    /// Number of distinct reservations ever created.
    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }

    /// Number of reservations still holding stock.
    pub async fn held_count(&self) -> usize {
        self.state
            .read()
            .await
            .reservations
            .values()
            .filter(|r| r.state == ReservationState::Held)
            .count()
    }

    /// Number of releases that actually gave stock back.
    pub async fn release_count(&self) -> u32 {
        self.state.read().await.releases
    }

    pub async fn reservation_state(&self, reservation_id: &str) -> Option<ReservationState> {
        self.state
            .read()
            .await
            .reservations
            .get(reservation_id)
            .map(|r| r.state)
    }

    /// Applies injected delay and faults, then hands out the state lock.
    async fn enter(
        &self,
        operation: &'static str,
    ) -> Result<RwLockWriteGuard<'_, InMemoryInventoryState>, CapabilityError> {
        let delay = self.state.write().await.faults.delay(operation);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.write().await;
        state.faults.check(operation)?;
        Ok(state)
    }
}

fn insufficient_stock(product_id: &ProductId, wanted: u32, available: u32) -> CapabilityError {
    CapabilityError::rejection(
        "insufficient_stock",
        format!("{product_id}: wanted {wanted}, {available} available"),
    )
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn check_availability(&self, items: &[OrderItem]) -> Result<(), CapabilityError> {
        let state = self.enter("check_availability").await?;
        for item in items {
            if let Some(available) = state.stock.get(&item.product_id)
                && *available < item.quantity
            {
                return Err(insufficient_stock(
                    &item.product_id,
                    item.quantity,
                    *available,
                ));
            }
        }
        Ok(())
    }

    async fn reserve(
        &self,
        request: ReservationRequest,
    ) -> Result<ReservationResult, CapabilityError> {
        let mut state = self.enter("reserve").await?;

        if let Some(existing) = state.by_key.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        if let Some(available) = state.stock.get_mut(&request.product_id) {
            if *available < request.quantity {
                return Err(insufficient_stock(
                    &request.product_id,
                    request.quantity,
                    *available,
                ));
            }
            *available -= request.quantity;
        }

        state.next_id += 1;
        let result = ReservationResult {
            reservation_id: format!("RES-{:04}", state.next_id),
            expires_at: Utc::now() + Duration::minutes(RESERVATION_HOLD_MINUTES),
        };
        state.reservations.insert(
            result.reservation_id.clone(),
            ReservationRecord {
                product_id: request.product_id,
                quantity: request.quantity,
                state: ReservationState::Held,
            },
        );
        state.by_key.insert(request.idempotency_key, result.clone());

        Ok(result)
    }

    async fn confirm(
        &self,
        reservation_id: &str,
        _idempotency_key: &IdempotencyKey,
    ) -> Result<(), CapabilityError> {
        let mut state = self.enter("confirm").await?;
        let record = state.reservations.get_mut(reservation_id).ok_or_else(|| {
            CapabilityError::rejection("reservation_not_found", reservation_id.to_string())
        })?;

        match record.state {
            ReservationState::Held | ReservationState::Confirmed => {
                record.state = ReservationState::Confirmed;
                Ok(())
            }
            ReservationState::Released => Err(CapabilityError::rejection(
                "reservation_released",
                reservation_id.to_string(),
            )),
        }
    }

    async fn release(
        &self,
        reservation_id: &str,
        _idempotency_key: &IdempotencyKey,
    ) -> Result<(), CapabilityError> {
        let mut state = self.enter("release").await?;
        let record = state.reservations.get_mut(reservation_id).ok_or_else(|| {
            CapabilityError::rejection("reservation_not_found", reservation_id.to_string())
        })?;

        match record.state {
            ReservationState::Released => Ok(()),
            ReservationState::Confirmed => Err(CapabilityError::rejection(
                "reservation_confirmed",
                reservation_id.to_string(),
            )),
            ReservationState::Held => {
                record.state = ReservationState::Released;
                let (product_id, quantity) = (record.product_id.clone(), record.quantity);
                if let Some(available) = state.stock.get_mut(&product_id) {
                    *available += quantity;
                }
                state.releases += 1;
                Ok(())
            }
        }
    }
}
