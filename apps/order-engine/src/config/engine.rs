//! Engine, retry and lifecycle configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::RetryPolicy;

/// Engine process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Trading mode: `PAPER` or `LIVE`.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Prometheus listener address.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    /// Serve Prometheus metrics.
    #[serde(default = "super::observability::default_true")]
    pub metrics_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            metrics_addr: default_metrics_addr(),
            metrics_enabled: true,
        }
    }
}

fn default_environment() -> String {
    "PAPER".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

/// Retry budget and backoff shape for venue calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Retryable failures per context before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff before the first retry (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Cap on any single backoff (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Growth factor per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Randomization factor in `[0, 1]`.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl ErrorHandlingConfig {
    /// Convert to the classifier's retry policy.
    #[must_use]
    pub const fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
        }
    }
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff() -> u64 {
    100
}

const fn default_max_backoff() -> u64 {
    30_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_jitter_factor() -> f64 {
    0.2
}

/// Lifecycle housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Interval of the good-till-date expiry sweep (seconds).
    #[serde(default = "default_expiry_interval")]
    pub expiry_check_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            expiry_check_interval_secs: default_expiry_interval(),
        }
    }
}

impl LifecycleConfig {
    /// Sweep interval.
    #[must_use]
    pub const fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval_secs)
    }
}

const fn default_expiry_interval() -> u64 {
    30
}
