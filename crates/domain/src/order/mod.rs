//! Order value objects carried inside the saga payload.

mod status;
mod value_objects;

pub use status::OrderStatus;
pub use value_objects::{Money, OrderItem, ProductId, UserId};
