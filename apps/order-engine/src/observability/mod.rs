//! Observability module for metrics.
//!
//! Prometheus metrics for the order engine. Logging and trace export are
//! configured in [`crate::telemetry`].

mod metrics;

pub use metrics::{
    MetricsConfig, MetricsError, init_metrics, record_circuit_transition, record_dealer_fallback,
    record_execution_error, record_lifecycle_transition, record_order_submission,
    record_retry_decision, record_risk_check, update_dead_letter_size,
};
