//! Error classification and retry decisions.
//!
//! The classifier never retries anything itself. It inspects an
//! [`ExecutionError`], charges the caller's retry budget and returns a
//! [`RetryDecision`] that the orchestration layer acts on.
//!
//! Budgets are tracked per context string (for example
//! `broker:client-1:place_order`). With `max_retries = 3` the first two
//! retryable errors for a context are retried and every later one is not.
//!
//! | Error | Retried | Budget charged | Reported message |
//! |-------|---------|----------------|------------------|
//! | Validation | no | no | verbatim |
//! | Circuit open / cancelled | no | no | verbatim |
//! | Execution | while budget remains | yes | verbatim |
//! | Network / System | while budget remains | yes | generalized |

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{ErrorType, ExecutionError};
use crate::observability;

use super::backoff::RetryPolicy;

/// Message reported for Network/System errors while retries remain.
pub const RETRYING_MESSAGE: &str = "execution failed, retrying";

/// Message reported for Network/System errors once the budget is spent.
pub const FAILED_MESSAGE: &str = "execution failed";

/// Outcome of classifying one error.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    /// Whether the caller should resubmit.
    pub should_retry: bool,
    /// Error to surface to the caller.
    pub error: ExecutionError,
    /// Suggested wait before resubmitting.
    pub delay: Option<Duration>,
    /// Retryable errors seen for this context, including this one.
    pub attempt: u32,
}

/// Classifies errors and tracks retry budgets per context.
#[derive(Debug, Default)]
pub struct ErrorClassifier {
    policy: RetryPolicy,
    retry_counts: Mutex<HashMap<String, u32>>,
}

impl ErrorClassifier {
    /// Create a classifier with the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Create a classifier with the default backoff and `max_retries`.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::new(RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        })
    }

    /// Retry policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classify `err` raised under `context` and decide whether to retry.
    pub fn handle_error(&self, context: &str, err: &ExecutionError) -> RetryDecision {
        if err.is_validation() {
            tracing::debug!(
                context,
                code = %err.code(),
                origin = err.origin(),
                detail = err.message(),
                "Validation error, not retrying"
            );
            return self.finish(err.clone(), false, None, 0);
        }

        if err.is_circuit_open() || err.is_cancelled() {
            tracing::warn!(
                context,
                code = %err.code(),
                origin = err.origin(),
                "Call short-circuited, not retrying"
            );
            return self.finish(err.clone(), false, None, self.retry_count(context));
        }

        let attempt = self.charge(context);
        let should_retry = attempt < self.policy.max_retries;
        let delay = should_retry.then(|| self.policy.backoff_for_attempt(attempt));

        log_retryable(context, err, attempt, should_retry);
        if !should_retry {
            tracing::error!(
                context,
                attempts = attempt,
                code = %err.code(),
                "Retry budget exhausted"
            );
        }

        let reported = if err.error_type().hides_detail() {
            generalize(err, should_retry)
        } else {
            err.clone()
        };
        self.finish(reported, should_retry, delay, attempt)
    }

    /// Retryable errors seen so far for `context`.
    #[must_use]
    pub fn retry_count(&self, context: &str) -> u32 {
        self.retry_counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(context)
            .copied()
            .unwrap_or(0)
    }

    /// Drop the counter for a finished context.
    ///
    /// A later error under the same context string starts a new budget.
    pub fn release(&self, context: &str) {
        self.retry_counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(context);
    }

    /// Number of contexts with a live counter.
    #[must_use]
    pub fn tracked_contexts(&self) -> usize {
        self.retry_counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn charge(&self, context: &str) -> u32 {
        let mut counts = self
            .retry_counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = counts.entry(context.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn finish(
        &self,
        error: ExecutionError,
        should_retry: bool,
        delay: Option<Duration>,
        attempt: u32,
    ) -> RetryDecision {
        observability::record_execution_error(error.error_type().as_str(), error.code().as_str());
        observability::record_retry_decision(should_retry);
        RetryDecision {
            should_retry,
            error,
            delay,
            attempt,
        }
    }
}

fn log_retryable(context: &str, err: &ExecutionError, attempt: u32, should_retry: bool) {
    match err.error_type() {
        ErrorType::System => tracing::error!(
            context,
            code = %err.code(),
            origin = err.origin(),
            attempt,
            should_retry,
            "System error"
        ),
        // Transport detail stays out of the logs.
        ErrorType::Network => tracing::warn!(
            context,
            code = %err.code(),
            origin = err.origin(),
            attempt,
            should_retry,
            "Network error"
        ),
        ErrorType::Execution | ErrorType::Validation => tracing::warn!(
            context,
            code = %err.code(),
            origin = err.origin(),
            detail = err.message(),
            attempt,
            should_retry,
            "Execution error"
        ),
    }
}

/// Replace the message with a generic one, keeping the original as cause.
fn generalize(err: &ExecutionError, should_retry: bool) -> ExecutionError {
    let message = if should_retry {
        RETRYING_MESSAGE
    } else {
        FAILED_MESSAGE
    };
    let mut reported = ExecutionError::new(err.code(), message, err.origin())
        .with_type(err.error_type())
        .with_severity(err.severity())
        .with_cause(err.clone());
    if let Some(order_id) = err.order_id() {
        reported = reported.with_order(order_id);
    }
    if let Some(portfolio_id) = err.portfolio_id() {
        reported = reported.with_portfolio(portfolio_id);
    }
    if let Some(strategy_id) = err.strategy_id() {
        reported = reported.with_strategy(strategy_id);
    }
    reported
}
