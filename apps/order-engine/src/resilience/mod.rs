//! Resilience patterns for outbound broker calls.
//!
//! This module provides per-destination circuit breakers, error
//! classification with bounded retry budgets, and exponential backoff.

mod backoff;
mod circuit_breaker;
mod classifier;

pub use backoff::RetryPolicy;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerRegistry,
    CircuitBreakerState,
};
pub use classifier::{ErrorClassifier, FAILED_MESSAGE, RETRYING_MESSAGE, RetryDecision};
