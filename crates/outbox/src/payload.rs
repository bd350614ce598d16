//! Typed job payloads built from outbox event data.
//!
//! Each aggregate kind has its own payload shape. The relay decodes the row
//! into that shape before enqueuing; rows that do not decode are closed as
//! not actionable instead of reaching a worker that cannot use them.

use common::{AggregateId, CorrelationId};
use domain::{AggregateKind, OutboxEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PayloadError;

/// Starts or resumes one saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaJob {
    pub correlation_id: CorrelationId,
    pub saga_id: AggregateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_type: Option<String>,
}

/// Order lifecycle notification (confirmed, cancelled, compensation failed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEventJob {
    pub order_id: AggregateId,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// A decoded payload, one variant per payload shape.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityJob {
    Saga(SagaJob),
    Order(OrderEventJob),
    /// Inventory, payment and notification jobs carry a plain object.
    Capability(Map<String, Value>),
}

impl CapabilityJob {
    /// Decodes the data of `event` for its aggregate kind.
    ///
    /// A saga row may carry its correlation ID on the envelope only; the data
    /// value wins when both are present.
    pub fn decode(kind: AggregateKind, event: &OutboxEvent) -> Result<Self, PayloadError> {
        let data = match &event.event_data {
            None | Some(Value::Null) => return Err(PayloadError::Missing),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(PayloadError::NotAnObject),
        };

        match kind {
            AggregateKind::Saga => {
                let mut data = data;
                if !data.contains_key("correlation_id")
                    && let Some(correlation_id) = &event.correlation_id
                {
                    data.insert(
                        "correlation_id".to_string(),
                        Value::String(correlation_id.as_str().to_string()),
                    );
                }
                let job: SagaJob = serde_json::from_value(Value::Object(data))?;
                if job.correlation_id.as_str().trim().is_empty() {
                    return Err(PayloadError::Invalid("correlation_id is blank".into()));
                }
                Ok(Self::Saga(job))
            }
            AggregateKind::Order => Ok(Self::Order(serde_json::from_value(Value::Object(data))?)),
            AggregateKind::Inventory | AggregateKind::Payment | AggregateKind::Notification => {
                Ok(Self::Capability(data))
            }
        }
    }

    /// Correlation ID the job belongs to, if the payload names one.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Saga(job) => Some(&job.correlation_id),
            _ => None,
        }
    }

    /// The payload as it travels on the queue.
    pub fn into_value(self) -> Result<Value, PayloadError> {
        Ok(match self {
            Self::Saga(job) => serde_json::to_value(job)?,
            Self::Order(job) => serde_json::to_value(job)?,
            Self::Capability(map) => Value::Object(map),
        })
    }
}
