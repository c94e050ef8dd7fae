//! Prometheus metrics for the order engine.
//!
//! Covers order submission, lifecycle transitions, risk checks, retry
//! decisions, circuit breakers and the dead-letter queue. Recording without
//! an installed recorder is a no-op.
//!
//! # Example
//!
//! ```ignore
//! use order_engine::observability::{init_metrics, MetricsConfig};
//!
//! init_metrics(&MetricsConfig::default())?;
//! record_order_submission("zerodha", "submitted", 0.015);
//! ```

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::CircuitBreakerState;

/// Configuration for the metrics exporter.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP listener.
    pub listen_addr: SocketAddr,
    /// Histogram buckets for latency measurements (in seconds).
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            // Latency buckets from 1ms to 10s
            latency_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration with custom address.
    #[must_use]
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            listen_addr: addr,
            ..Default::default()
        }
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// This starts an HTTP server that exposes metrics at `/metrics`.
///
/// # Errors
///
/// Returns an error if the metrics exporter fails to start (e.g., port already in use).
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .set_buckets(&config.latency_buckets)
        .map_err(|e| MetricsError::Configuration(e.to_string()))?
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    tracing::info!(
        addr = %config.listen_addr,
        "Prometheus metrics exporter started"
    );

    Ok(())
}

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to configure metrics exporter.
    #[error("metrics configuration error: {0}")]
    Configuration(String),
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

// ============================================================================
// Order Metrics
// ============================================================================

/// Record an order submission attempt.
///
/// # Arguments
///
/// * `broker` - Client ID the order was routed to
/// * `status` - Outcome (e.g., "submitted", "retrying", "failed", "rejected")
/// * `latency_seconds` - Time spent in the router
pub fn record_order_submission(broker: &str, status: &str, latency_seconds: f64) {
    counter!(
        "order_submissions_total",
        "broker" => broker.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        "order_submission_latency_seconds",
        "broker" => broker.to_string()
    )
    .record(latency_seconds);
}

/// Record a lifecycle transition into `to`.
pub fn record_lifecycle_transition(to: &str) {
    counter!("lifecycle_transitions_total", "to" => to.to_string()).increment(1);
}

/// Record a risk check outcome ("passed" or "breached").
pub fn record_risk_check(result: &str) {
    counter!("risk_checks_total", "result" => result.to_string()).increment(1);
}

/// Update the dead-letter queue size gauge.
pub fn update_dead_letter_size(size: usize) {
    gauge!("dead_letter_queue_size").set(size as f64);
}

/// Record a dealer order that fell back to a normal order.
pub fn record_dealer_fallback(client_id: &str) {
    counter!("dealer_fallback_total", "client_id" => client_id.to_string()).increment(1);
}

// ============================================================================
// Resilience Metrics
// ============================================================================

/// Record a classified error.
pub fn record_execution_error(error_type: &str, code: &str) {
    counter!(
        "execution_errors_total",
        "type" => error_type.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

/// Record a retry decision.
pub fn record_retry_decision(should_retry: bool) {
    let decision = if should_retry { "retry" } else { "give_up" };
    counter!("retry_decisions_total", "decision" => decision).increment(1);
}

/// Record a circuit breaker state change.
///
/// The gauge encodes the state as 0 = closed, 1 = half-open, 2 = open.
pub fn record_circuit_transition(name: &str, to: CircuitBreakerState) {
    let value = match to {
        CircuitBreakerState::Closed => 0.0,
        CircuitBreakerState::HalfOpen => 1.0,
        CircuitBreakerState::Open => 2.0,
    };
    gauge!("circuit_breaker_state", "name" => name.to_string()).set(value);
    counter!(
        "circuit_breaker_transitions_total",
        "name" => name.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}
