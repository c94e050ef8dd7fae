//! Risk validation seam and its monitored wrapper.

use std::sync::Arc;
use std::time::Instant;

use super::profile::RiskProfile;
use crate::domain::{Order, Portfolio, Strategy};
use crate::error::ExecutionError;
use crate::observability;
use crate::resilience::ErrorClassifier;

/// Validates orders against risk limits.
///
/// The individual checks take the already resolved profile; `None` means no
/// limits apply.
pub trait RiskValidator: Send + Sync {
    /// Profile that applies to `strategy`'s orders.
    fn resolve_profile(&self, strategy: &Strategy) -> Option<RiskProfile>;

    /// Run every enabled limit; the first breach wins.
    ///
    /// # Errors
    ///
    /// Returns a Validation error describing the breached limit.
    fn validate_order(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        strategy: &Strategy,
    ) -> Result<(), ExecutionError>;

    /// Order value, leverage and drawdown limits.
    ///
    /// # Errors
    ///
    /// Returns a Validation error describing the breached limit.
    fn check_risk_parameters(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError>;

    /// Position size, exposure and concentration limits.
    ///
    /// # Errors
    ///
    /// Returns a Validation error describing the breached limit.
    fn check_position_limits(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError>;

    /// Margin limit.
    ///
    /// # Errors
    ///
    /// Returns a Validation error describing the breached limit.
    fn check_margin_requirements(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError>;

    /// Order-rate limit.
    ///
    /// # Errors
    ///
    /// Returns a Validation error describing the breached limit.
    fn check_rate_limits(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError>;
}

/// Adds tracing, metrics and error classification around a [`RiskValidator`].
///
/// Outcomes are passed through unchanged.
#[derive(Debug)]
pub struct MonitoredRiskValidator<V> {
    inner: V,
    classifier: Arc<ErrorClassifier>,
}

impl<V: RiskValidator> MonitoredRiskValidator<V> {
    /// Wrap `inner`.
    pub const fn new(inner: V, classifier: Arc<ErrorClassifier>) -> Self {
        Self { inner, classifier }
    }

    /// Wrapped validator.
    pub const fn inner(&self) -> &V {
        &self.inner
    }

    fn observe(
        &self,
        check: &'static str,
        order: &Order,
        started: Instant,
        result: Result<(), ExecutionError>,
    ) -> Result<(), ExecutionError> {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(()) => {
                observability::record_risk_check("passed");
                tracing::debug!(
                    check,
                    order_id = %order.id,
                    portfolio_id = %order.portfolio_id,
                    elapsed_ms,
                    "Risk check passed"
                );
            }
            Err(err) if err.is_validation() => {
                observability::record_risk_check("rejected");
                tracing::warn!(
                    check,
                    order_id = %order.id,
                    portfolio_id = %order.portfolio_id,
                    strategy_id = %order.strategy_id,
                    code = %err.code(),
                    detail = err.message(),
                    "Risk check rejected order"
                );
            }
            Err(err) => {
                observability::record_risk_check("error");
                // risk checks are never retried, so the decision is final
                let context = format!("risk:{}", order.id);
                let decision = self.classifier.handle_error(&context, err);
                self.classifier.release(&context);
                tracing::error!(
                    check,
                    order_id = %order.id,
                    error = %decision.error,
                    "Risk check failed unexpectedly"
                );
            }
        }
        result
    }
}

impl<V: RiskValidator> RiskValidator for MonitoredRiskValidator<V> {
    fn resolve_profile(&self, strategy: &Strategy) -> Option<RiskProfile> {
        self.inner.resolve_profile(strategy)
    }

    fn validate_order(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        strategy: &Strategy,
    ) -> Result<(), ExecutionError> {
        let started = Instant::now();
        let result = self.inner.validate_order(order, portfolio, strategy);
        self.observe("validate_order", order, started, result)
    }

    fn check_risk_parameters(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        let started = Instant::now();
        let result = self.inner.check_risk_parameters(order, portfolio, profile);
        self.observe("check_risk_parameters", order, started, result)
    }

    fn check_position_limits(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        let started = Instant::now();
        let result = self.inner.check_position_limits(order, portfolio, profile);
        self.observe("check_position_limits", order, started, result)
    }

    fn check_margin_requirements(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        let started = Instant::now();
        let result = self.inner.check_margin_requirements(order, portfolio, profile);
        self.observe("check_margin_requirements", order, started, result)
    }

    fn check_rate_limits(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        let started = Instant::now();
        let result = self.inner.check_rate_limits(order, portfolio, profile);
        self.observe("check_rate_limits", order, started, result)
    }
}

impl<V: RiskValidator + ?Sized> RiskValidator for Arc<V> {
    fn resolve_profile(&self, strategy: &Strategy) -> Option<RiskProfile> {
        (**self).resolve_profile(strategy)
    }

    fn validate_order(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        strategy: &Strategy,
    ) -> Result<(), ExecutionError> {
        (**self).validate_order(order, portfolio, strategy)
    }

    fn check_risk_parameters(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        (**self).check_risk_parameters(order, portfolio, profile)
    }

    fn check_position_limits(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        (**self).check_position_limits(order, portfolio, profile)
    }

    fn check_margin_requirements(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        (**self).check_margin_requirements(order, portfolio, profile)
    }

    fn check_rate_limits(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        (**self).check_rate_limits(order, portfolio, profile)
    }
}
