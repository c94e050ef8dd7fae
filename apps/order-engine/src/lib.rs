// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Order Engine - Execution & Resilience Core
//!
//! Takes orders from strategies, checks them against risk profiles, routes
//! them to broker connectors and tracks each one through a lifecycle state
//! machine until it reaches a terminal state.
//!
//! # Architecture
//!
//! ```text
//! submit ──► ExecutionEngine ──► RiskManager (profile limits)
//!                 │
//!                 ├──► LifecycleManager ──callbacks──► DependencyManager (OTO/OCO)
//!                 │
//!                 └──► BrokerRouter ──► CircuitBreaker ──► BrokerConnector
//!                            │
//!                            └──► ErrorClassifier (bounded retry, backoff)
//! ```
//!
//! - `lifecycle`: State machine, event history, transition callbacks, expiry
//! - `dependency`: Parent/child order graph, triggers and cascades
//! - `risk`: Profiles, limits, positions and the pre-trade check
//! - `broker`: Connector contract, factory, router and a simulated venue
//! - `resilience`: Circuit breakers and the retry classifier
//! - `engine`: Submission pipeline and the dead-letter queue
//! - `config`: YAML configuration with environment interpolation
//! - `observability` / `telemetry`: Prometheus metrics, logging and traces

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Core
// =============================================================================

/// Order, portfolio and strategy types.
pub mod domain;

/// Structured execution errors.
pub mod error;

/// Order lifecycle state machine.
pub mod lifecycle;

/// Order dependencies (OTO/OCO).
pub mod dependency;

/// Pre-trade risk management.
pub mod risk;

// =============================================================================
// Routing and Resilience
// =============================================================================

/// Broker connectors and routing.
pub mod broker;

/// Circuit breakers and retry classification.
pub mod resilience;

/// Submission pipeline.
pub mod engine;

// =============================================================================
// Ambient
// =============================================================================

/// Configuration loading and validation.
pub mod config;

/// Prometheus metrics.
pub mod observability;

/// Logging and trace export.
pub mod telemetry;

// =============================================================================
// Re-exports
// =============================================================================

pub use broker::{BrokerConnector, BrokerRouter, SimulatedConnector};
pub use dependency::{DependencyManager, DependencyType};
pub use domain::{Order, OrderSide, OrderType, Portfolio, Position, ProductType, Strategy};
pub use engine::{DeadLetterQueue, ExecutionEngine};
pub use error::{ErrorCode, ErrorSeverity, ErrorType, ExecutionError};
pub use lifecycle::{LifecycleManager, LifecycleState, OrderLifecycle};
pub use resilience::{CircuitBreaker, CircuitBreakerRegistry, ErrorClassifier, RetryPolicy};
pub use risk::{RiskLimit, RiskLimitType, RiskManager, RiskProfile};
