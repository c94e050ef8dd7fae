//! Circuit breaker for broker destinations.
//!
//! Prevents cascading failures when a venue becomes unavailable or
//! unresponsive.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN (consecutive failures >= failure_threshold)
//! OPEN → HALF_OPEN (reset_timeout elapsed since last failure)
//! HALF_OPEN → CLOSED (half_open_max_calls trial calls succeed)
//! HALF_OPEN → OPEN (any trial call fails)
//! ```
//!
//! # Configuration
//!
//! - `failure_threshold`: Consecutive failures that open the circuit (default: 5)
//! - `reset_timeout`: Time to stay open before trial calls (default: 30s)
//! - `half_open_max_calls`: Trial calls admitted while half-open (default: 1)
//! - `call_timeout`: Deadline applied by [`CircuitBreaker::call`] (default: 10s)
//!
//! # Example
//!
//! ```rust,ignore
//! use order_engine::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("zerodha", CircuitBreakerConfig::default());
//! let cancel = CancellationToken::new();
//!
//! let response = breaker
//!     .call(breaker.call_timeout(), &cancel, || connector.place_order(&order))
//!     .await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, ErrorType, ExecutionError};
use crate::observability;

const ORIGIN: &str = "CircuitBreaker";

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Circuit is closed, calls flow normally.
    Closed,
    /// Circuit is open, calls are rejected.
    Open,
    /// Circuit is testing with limited calls.
    HalfOpen,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Duration to stay `OPEN` after the last failure.
    pub reset_timeout: Duration,
    /// Trial calls admitted in `HALF_OPEN`; this many successes close the circuit.
    pub half_open_max_calls: u32,
    /// Deadline for a wrapped call.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration with the default call timeout.
    #[must_use]
    pub const fn new(failure_threshold: u32, reset_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            half_open_max_calls,
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// How a call got past [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Admitted while `CLOSED`.
    Closed,
    /// Holds one of the `HALF_OPEN` trial slots.
    Trial,
}

/// A call admitted by [`CircuitBreaker::call`].
///
/// Dropping it unsettled, as when the operation panics, returns its trial
/// slot.
struct AdmittedCall<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl AdmittedCall<'_> {
    fn succeeded(mut self) {
        self.settled = true;
        self.breaker.settle_success(self.admission);
    }

    fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for AdmittedCall<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.breaker.release_trial_slot();
        }
    }
}

/// Circuit breaker for one destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Destination name for logging.
    name: String,
    /// Configuration.
    config: CircuitBreakerConfig,
    /// Current state.
    state: RwLock<CircuitBreakerState>,
    /// Time of the most recent counted failure.
    last_failure_time: RwLock<Option<Instant>>,
    /// Consecutive failures while `CLOSED`.
    failure_count: AtomicU32,
    /// Trial calls admitted in `HALF_OPEN`.
    half_open_calls: AtomicU32,
    /// Successful trial calls in `HALF_OPEN`.
    half_open_successes: AtomicU32,
    /// Total calls counter (for metrics).
    total_calls: AtomicU64,
    /// Total failures counter (for metrics).
    total_failures: AtomicU64,
    /// Calls rejected while open (for metrics).
    rejected_calls: AtomicU64,
    /// State transitions counter (for metrics).
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitBreakerState::Closed),
            last_failure_time: RwLock::new(None),
            failure_count: AtomicU32::new(0),
            half_open_calls: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    /// Get the destination name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the call timeout for this circuit breaker.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.config.call_timeout
    }

    /// Get the current state.
    ///
    /// An `OPEN` breaker whose reset timeout has elapsed still reports `OPEN`
    /// until a call is attempted; the first attempt moves it to `HALF_OPEN`.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        *self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Consecutive failures counted while closed.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Admit or reject a call.
    ///
    /// Admission in `HALF_OPEN` consumes one trial slot, so callers must
    /// follow an admitted call with `record_success` or `record_failure`
    /// (or `release_trial_slot` if the call was abandoned).
    pub fn try_acquire(&self) -> bool {
        self.admit().is_some()
    }

    fn admit(&self) -> Option<Admission> {
        self.check_reset_timeout();

        let state = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let admission = match *state {
            CircuitBreakerState::Closed => Some(Admission::Closed),
            CircuitBreakerState::Open => None,
            CircuitBreakerState::HalfOpen => self
                .half_open_calls
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |calls| {
                    (calls < self.config.half_open_max_calls).then_some(calls + 1)
                })
                .is_ok()
                .then_some(Admission::Trial),
        };
        drop(state);

        if admission.is_none() {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        }
        admission
    }

    /// Record a successful call.
    ///
    /// In `HALF_OPEN` the call is taken to be one of the admitted trial calls.
    pub fn record_success(&self) {
        self.settle_success(Admission::Trial);
    }

    fn settle_success(&self, admission: Admission) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        match self.state() {
            CircuitBreakerState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitBreakerState::HalfOpen if admission == Admission::Trial => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.half_open_max_calls {
                    self.transition_to_closed();
                }
            }
            CircuitBreakerState::HalfOpen => {
                tracing::debug!(
                    name = %self.name,
                    "Late success from a call admitted while CLOSED, not counted as a trial"
                );
            }
            CircuitBreakerState::Open => {
                // Late completion of a call admitted before the circuit opened
                tracing::debug!(name = %self.name, "Success recorded while circuit is OPEN");
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let current = self.state();
        match current {
            CircuitBreakerState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open(CircuitBreakerState::Closed);
                }
            }
            CircuitBreakerState::HalfOpen => {
                // Any failure in HALF_OPEN → OPEN
                self.transition_to_open(CircuitBreakerState::HalfOpen);
            }
            CircuitBreakerState::Open => {
                self.touch_last_failure();
            }
        }
    }

    /// Return an unused trial slot (call abandoned by cancellation).
    pub fn release_trial_slot(&self) {
        let state = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state == CircuitBreakerState::HalfOpen {
            let _ = self
                .half_open_calls
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |calls| {
                    calls.checked_sub(1)
                });
        }
    }

    /// Run `op` under this breaker with a deadline and a cancellation token.
    ///
    /// - An open circuit fails fast with `ERR_CIRCUIT_OPEN` and `op` is never invoked.
    /// - A deadline expiry becomes a Network `ERR_TIMEOUT` and counts as a failure.
    /// - Cancellation becomes `ERR_CANCELLED` and is not counted.
    /// - `ERR_RATE_LIMIT_EXCEEDED` and Validation errors from `op` are not counted.
    pub async fn call<T, F, Fut>(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExecutionError>>,
    {
        let Some(admission) = self.admit() else {
            return Err(ExecutionError::new(
                ErrorCode::CircuitOpen,
                format!("Circuit breaker '{}' is open", self.name),
                ORIGIN,
            )
            .with_detail("destination", self.name.clone()));
        };
        let slot = AdmittedCall {
            breaker: self,
            admission,
            settled: false,
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = tokio::time::timeout(deadline, op()) => Some(result),
        };

        match outcome {
            None => {
                drop(slot);
                Err(ExecutionError::new(
                    ErrorCode::Cancelled,
                    format!("call to '{}' cancelled", self.name),
                    ORIGIN,
                ))
            }
            Some(Err(_elapsed)) => {
                slot.failed();
                Err(ExecutionError::new(
                    ErrorCode::Timeout,
                    format!("call to '{}' exceeded deadline of {deadline:?}", self.name),
                    ORIGIN,
                )
                .with_type(ErrorType::Network))
            }
            Some(Ok(Ok(value))) => {
                slot.succeeded();
                Ok(value)
            }
            Some(Ok(Err(err))) => {
                if err.code() == ErrorCode::RateLimitExceeded
                    || err.is_cancelled()
                    || err.is_validation()
                {
                    drop(slot);
                } else {
                    slot.failed();
                }
                Err(err)
            }
        }
    }

    /// Move `OPEN` → `HALF_OPEN` once the reset timeout has elapsed.
    fn check_reset_timeout(&self) {
        if self.state() != CircuitBreakerState::Open {
            return;
        }
        let elapsed = self
            .last_failure_time
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
        if elapsed {
            self.transition_to_half_open();
        }
    }

    fn touch_last_failure(&self) {
        let mut last = self
            .last_failure_time
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *last = Some(Instant::now());
    }

    /// Transition to `OPEN` if the state is still `expected`.
    fn transition_to_open(&self, expected: CircuitBreakerState) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state != expected || expected == CircuitBreakerState::Open {
            drop(state);
            self.touch_last_failure();
            return;
        }
        *state = CircuitBreakerState::Open;
        self.touch_last_failure();
        self.half_open_calls.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        drop(state);

        self.state_transitions.fetch_add(1, Ordering::Relaxed);
        observability::record_circuit_transition(&self.name, CircuitBreakerState::Open);

        tracing::warn!(
            name = %self.name,
            from = %expected,
            to = "OPEN",
            failures = self.failure_count.load(Ordering::Acquire),
            "Circuit breaker opened"
        );
    }

    /// Transition to `HALF_OPEN`.
    fn transition_to_half_open(&self) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state != CircuitBreakerState::Open {
            return;
        }
        *state = CircuitBreakerState::HalfOpen;
        // Reset while holding the write lock so no trial call can be admitted
        // against stale counters.
        self.half_open_calls.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        drop(state);

        self.state_transitions.fetch_add(1, Ordering::Relaxed);
        observability::record_circuit_transition(&self.name, CircuitBreakerState::HalfOpen);

        tracing::info!(
            name = %self.name,
            from = "OPEN",
            to = "HALF_OPEN",
            "Circuit breaker testing"
        );
    }

    /// Transition to `CLOSED`.
    fn transition_to_closed(&self) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let previous = *state;
        if previous == CircuitBreakerState::Closed {
            return;
        }
        *state = CircuitBreakerState::Closed;
        self.failure_count.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        *self
            .last_failure_time
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        drop(state);

        self.state_transitions.fetch_add(1, Ordering::Relaxed);
        observability::record_circuit_transition(&self.name, CircuitBreakerState::Closed);

        tracing::info!(
            name = %self.name,
            from = %previous,
            to = "CLOSED",
            "Circuit breaker closed"
        );
    }

    /// Get metrics for this circuit breaker.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }

    /// Force the circuit breaker to open (for testing or emergency).
    pub fn force_open(&self) {
        let current = self.state();
        self.transition_to_open(current);
    }

    /// Force the circuit breaker to close (for testing or recovery).
    pub fn force_close(&self) {
        self.transition_to_closed();
    }
}

/// Metrics for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Destination name.
    pub name: String,
    /// Current state.
    pub state: CircuitBreakerState,
    /// Consecutive failures while closed.
    pub failure_count: u32,
    /// Total recorded calls.
    pub total_calls: u64,
    /// Total failures.
    pub total_failures: u64,
    /// Calls rejected without invoking the operation.
    pub rejected_calls: u64,
    /// Number of state transitions.
    pub state_transitions: u64,
}

/// Circuit breakers keyed by destination.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry where every destination uses `default_config`.
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Use `config` for the destination `name` instead of the default.
    #[must_use]
    pub fn with_override(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Get the breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(breaker);
        }

        let mut breakers = self
            .breakers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.default_config.clone());
            Arc::new(CircuitBreaker::new(name, config))
        });
        Arc::clone(breaker)
    }

    /// Get all metrics, sorted by name.
    #[must_use]
    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let breakers = self
            .breakers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut metrics: Vec<_> = breakers.values().map(|b| b.metrics()).collect();
        drop(breakers);
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn test_config(threshold: u32, reset_ms: u64, trials: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
            half_open_max_calls: trials,
            call_timeout: Duration::from_millis(200),
        }
    }

    async fn failing() -> Result<(), ExecutionError> {
        Err(ExecutionError::execution("boom", "test"))
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.half_open_max_calls, 1);
    }

    #[test]
    fn test_initial_state_is_closed() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("test", test_config(3, 1000, 1));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", test_config(3, 1000, 1));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_invoke_operation() {
        let breaker = CircuitBreaker::new("test", test_config(3, 1000, 1));
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let _ = breaker.call(Duration::from_millis(50), &cancel, failing).await;
        }
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        let invoked = AtomicUsize::new(0);
        let result = breaker
            .call(Duration::from_millis(50), &cancel, || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.message(), "Circuit breaker 'test' is open");
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trial_success_closes_circuit() {
        let breaker = CircuitBreaker::new("test", test_config(3, 20, 1));
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let _ = breaker.call(Duration::from_millis(50), &cancel, failing).await;
        }
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let result = breaker
            .call(Duration::from_millis(50), &cancel, || async { Ok(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", test_config(2, 1, 2));
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitBreakerState::Open);
    }

    #[test]
    fn test_half_open_admits_limited_trials() {
        let breaker = CircuitBreaker::new("test", test_config(1, 1, 2));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        assert!(breaker.try_acquire());
        assert!(breaker.try_acquire());
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_racing_trials_respect_limit() {
        let breaker = Arc::new(CircuitBreaker::new("test", test_config(1, 1, 1)));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                std::thread::spawn(move || breaker.try_acquire())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|permitted| *permitted)
            .count();

        assert_eq!(admitted, 1);
    }

    async fn exploding() -> Result<(), ExecutionError> {
        panic!("adapter bug");
    }

    #[tokio::test]
    async fn test_panicking_call_returns_half_open_slot() {
        let breaker = Arc::new(CircuitBreaker::new("test", test_config(1, 10, 1)));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let half_open = Arc::clone(&breaker);
        let panicked = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            half_open.call(Duration::from_secs(1), &cancel, exploding).await
        })
        .await;
        assert!(panicked.unwrap_err().is_panic());
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);

        let cancel = CancellationToken::new();
        let result = breaker
            .call(Duration::from_secs(1), &cancel, || async { Ok(1) })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_late_success_from_closed_admission_not_counted() {
        let breaker = Arc::new(CircuitBreaker::new("test", test_config(1, 10, 1)));
        let cancel = CancellationToken::new();

        let slow = {
            let breaker = Arc::clone(&breaker);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                breaker
                    .call(Duration::from_secs(1), &cancel, || async {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);

        slow.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_deadline_counts_as_failure() {
        let breaker = CircuitBreaker::new("test", test_config(1, 1000, 1));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = breaker
            .call(Duration::from_millis(10), &cancel, || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.error_type(), ErrorType::Network);
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_failure() {
        let breaker = CircuitBreaker::new("test", test_config(1, 1000, 1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> = breaker
            .call(Duration::from_secs(1), &cancel, || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert_eq!(breaker.metrics().total_failures, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_is_not_a_failure() {
        let breaker = CircuitBreaker::new("test", test_config(1, 1000, 1));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = breaker
            .call(Duration::from_secs(1), &cancel, || async {
                Err(ExecutionError::new(ErrorCode::RateLimitExceeded, "slow down", "venue"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_force_open_and_close() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        breaker.force_open();
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        breaker.force_close();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_registry_reuses_breakers_and_applies_overrides() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default())
            .with_override("zerodha", test_config(2, 100, 1));

        let a = registry.get_or_create("zerodha");
        let b = registry.get_or_create("zerodha");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.config().failure_threshold, 2);
        assert_eq!(registry.get_or_create("xts").config().failure_threshold, 5);

        let metrics = registry.all_metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "xts");
    }
}
