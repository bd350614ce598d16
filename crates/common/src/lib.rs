//! Identifier newtypes shared by every crate in the workspace.

mod types;

pub use types::{AggregateId, CorrelationId, IdempotencyKey, Version};
