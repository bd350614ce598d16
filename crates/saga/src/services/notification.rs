//! Notification service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{AggregateId, IdempotencyKey};
use domain::UserId;
use tokio::sync::RwLock;

use crate::error::CapabilityError;
use crate::services::{Fault, FaultPlan};

/// A message to the customer about their order.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub user_id: UserId,
    pub order_id: AggregateId,
    pub template: String,
    pub idempotency_key: IdempotencyKey,
}

/// Trait for customer notifications.
#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Sends the message and returns its ID. Replays with the same key send nothing new.
    async fn send(&self, request: NotificationRequest) -> Result<String, CapabilityError>;
}

#[derive(Debug, Default)]
struct InMemoryNotificationState {
    sent: HashMap<IdempotencyKey, (String, NotificationRequest)>,
    next_id: u32,
    faults: FaultPlan,
}

/// In-memory notification service that records what it "sent".
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    state: Arc<RwLock<InMemoryNotificationState>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects a fault into `send`.
    pub async fn set_fault(&self, fault: Fault) {
        self.state.write().await.faults.set("send", fault);
    }

    pub async fn clear_fault(&self) {
        self.state.write().await.faults.clear("send");
    }

    pub async fn calls(&self) -> u32 {
        self.state.read().await.faults.calls("send")
    }

    /// Number of distinct messages sent.
    pub async fn sent_count(&self) -> usize {
        self.state.read().await.sent.len()
    }

    /// Templates sent for an order.
    pub async fn sent_for(&self, order_id: AggregateId) -> Vec<String> {
        self.state
            .read()
            .await
            .sent
            .values()
            .filter(|(_, r)| r.order_id == order_id)
            .map(|(_, r)| r.template.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn send(&self, request: NotificationRequest) -> Result<String, CapabilityError> {
        let delay = self.state.write().await.faults.delay("send");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        state.faults.check("send")?;

        if let Some((id, _)) = state.sent.get(&request.idempotency_key) {
            return Ok(id.clone());
        }

        state.next_id += 1;
        let id = format!("NOTIF-{:04}", state.next_id);
        state
            .sent
            .insert(request.idempotency_key.clone(), (id.clone(), request));
        Ok(id)
    }
}
