//! Retry policy with exponential backoff and jitter.
//!
//! # Example
//!
//! ```rust,ignore
//! use order_engine::resilience::RetryPolicy;
//!
//! let policy = RetryPolicy::default();
//! let first = policy.backoff_for_attempt(1);  // ~100ms with jitter
//! let second = policy.backoff_for_attempt(2); // ~200ms with jitter
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Calls to `handle_error` per context before retries stop (default: 3).
    pub max_retries: u32,
    /// Backoff before the first retry (default: 100ms).
    pub initial_backoff: Duration,
    /// Upper bound on any single backoff (default: 30s).
    pub max_backoff: Duration,
    /// Growth factor per attempt (default: 2.0).
    pub backoff_multiplier: f64,
    /// Randomization factor (default: 0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default backoff shape.
    #[must_use]
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ..Self::default()
        }
    }

    /// Policy without jitter, for deterministic delays.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Backoff before retry number `attempt` (1-based), jittered and capped.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_backoff_ms(attempt);
        let jittered_ms = self.apply_jitter(base_ms);
        Duration::from_millis(jittered_ms.min(self.max_backoff_ms()))
    }

    /// Exponential backoff without jitter.
    fn base_backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = self.backoff_multiplier.powi(exponent);
        let backoff = (self.initial_backoff.as_millis() as f64 * multiplier) as u64;
        backoff.min(self.max_backoff_ms())
    }

    /// Random value in `[backoff * (1 - jitter), backoff * (1 + jitter)]`.
    fn apply_jitter(&self, backoff_ms: u64) -> u64 {
        if self.jitter_factor <= 0.0 || backoff_ms == 0 {
            return backoff_ms;
        }
        let jitter_range = backoff_ms as f64 * self.jitter_factor;
        let min = (backoff_ms as f64 - jitter_range).max(0.0);
        let max = backoff_ms as f64 + jitter_range;

        rand::rng().random_range(min..=max) as u64
    }

    fn max_backoff_ms(&self) -> u64 {
        self.max_backoff.as_millis() as u64
    }
}
