//! Parent/child order dependencies.
//!
//! - `types`: Dependency records and trigger reports
//! - `manager`: Graph ownership and parent-event handling

mod manager;
mod types;

pub use manager::{DependencyManager, OCO_CANCELLED};
pub use types::{DependencyType, OrderDependency, TriggerReport};
