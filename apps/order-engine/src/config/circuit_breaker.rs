//! Circuit breaker configuration for broker calls.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::CircuitBreakerRegistry;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CircuitBreakerConfig {
    /// Settings used by every client without an override.
    #[serde(default)]
    pub default: CircuitBreakerSettings,
    /// Per-client settings, keyed by client ID.
    #[serde(default)]
    pub overrides: HashMap<String, CircuitBreakerSettings>,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed (seconds).
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,
    /// Trial calls admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    /// Deadline for a single broker call (milliseconds).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout(),
            half_open_max_calls: default_half_open_max_calls(),
            call_timeout_ms: default_call_timeout(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Convert config settings to resilience module's `CircuitBreakerConfig`.
    #[must_use]
    pub const fn to_resilience_config(&self) -> crate::resilience::CircuitBreakerConfig {
        crate::resilience::CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_secs(self.reset_timeout_secs),
            half_open_max_calls: self.half_open_max_calls,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

impl CircuitBreakerConfig {
    /// Build a registry with the default settings and every override.
    #[must_use]
    pub fn to_registry(&self) -> CircuitBreakerRegistry {
        self.overrides.iter().fold(
            CircuitBreakerRegistry::new(self.default.to_resilience_config()),
            |registry, (client_id, settings)| {
                registry.with_override(client_id.clone(), settings.to_resilience_config())
            },
        )
    }

    /// Every settings block, labelled for validation messages.
    pub(crate) fn labelled(&self) -> impl Iterator<Item = (String, &CircuitBreakerSettings)> {
        std::iter::once(("circuit_breaker.default".to_string(), &self.default)).chain(
            self.overrides
                .iter()
                .map(|(name, settings)| (format!("circuit_breaker.overrides.{name}"), settings)),
        )
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_reset_timeout() -> u64 {
    30
}

const fn default_half_open_max_calls() -> u32 {
    1
}

const fn default_call_timeout() -> u64 {
    10_000
}
