//! Domain types shared by every component.
//!
//! - `order`: Order aggregate and its value objects
//! - `portfolio`: Portfolio, position and strategy snapshots

pub mod order;
pub mod portfolio;

pub use order::{EXPIRES_AT_KEY, Order, OrderSide, OrderStatus, OrderType, ProductType};
pub use portfolio::{Portfolio, Position, Strategy};
