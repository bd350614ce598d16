//! Saga instance model.

mod data;
mod instance;
mod status;
pub mod step;

pub use data::{
    COMPENSATION_DATA_SCHEMA_VERSION, CompensationData, CompensationRecord, OrderReservation,
    SAGA_DATA_SCHEMA_VERSION, SagaData, StepErrorRecord, StepMetric,
};
pub use instance::{SagaInstance, SagaInstanceParts};
pub use status::SagaStatus;
pub use step::{Capability, ORDER_FULFILLMENT, SagaStep};
