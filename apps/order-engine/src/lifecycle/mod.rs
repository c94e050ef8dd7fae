//! Order lifecycle tracking.
//!
//! - `state`: Lifecycle states and the transition table
//! - `event`: Recorded events and lifecycle snapshots
//! - `manager`: Thread-safe owner of every lifecycle

mod event;
mod manager;
mod state;

pub use event::{OrderEvent, OrderLifecycle, event_types};
pub use manager::{LifecycleCallback, LifecycleManager};
pub use state::{LifecycleState, TransitionTable};
