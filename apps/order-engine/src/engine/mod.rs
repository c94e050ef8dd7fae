//! Order execution.
//!
//! - `executor`: Risk check, submission with retries, venue event handling
//! - `dead_letter`: Orders parked after their retries ran out

mod dead_letter;
mod executor;

pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use executor::ExecutionEngine;
