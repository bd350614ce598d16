//! Cooperative cancellation requests.

use std::collections::HashSet;
use std::sync::Arc;

use common::CorrelationId;
use tokio::sync::Mutex;

/// Cancellation requests waiting to be observed by an execution.
///
/// Requests are only looked at between steps, never during a capability
/// call. The registry is process-local: a request made on one node is not
/// seen by an execution running on another.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    requested: Arc<Mutex<HashSet<CorrelationId>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request. Returns false if one was already pending.
    pub async fn request(&self, correlation_id: CorrelationId) -> bool {
        self.requested.lock().await.insert(correlation_id)
    }

    pub async fn is_requested(&self, correlation_id: &CorrelationId) -> bool {
        self.requested.lock().await.contains(correlation_id)
    }

    /// Consumes a pending request. Returns true if there was one.
    pub async fn take(&self, correlation_id: &CorrelationId) -> bool {
        self.requested.lock().await.remove(correlation_id)
    }

    pub async fn pending(&self) -> usize {
        self.requested.lock().await.len()
    }
}
