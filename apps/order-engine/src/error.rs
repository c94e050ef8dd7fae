//! Structured errors for the order engine.
//!
//! Every component reports failures as an [`ExecutionError`]. The error
//! carries a coarse [`ErrorType`] that drives retry decisions, a
//! [`ErrorSeverity`] for logging, and a stable [`ErrorCode`] that callers
//! match on.
//!
//! # Error Types
//!
//! | Type | Retried | Detail surfaced to callers |
//! |------|---------|----------------------------|
//! | `VALIDATION` | Never | Verbatim |
//! | `EXECUTION` | Up to policy limit | Verbatim |
//! | `NETWORK` | Up to policy limit | Generalized |
//! | `SYSTEM` | Up to policy limit, logged at error | Generalized |

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed underlying error kept as an explicit cause.
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    /// Bad input. Never retried.
    Validation,
    /// Operation-specific failure at the venue.
    Execution,
    /// Timeouts and connectivity.
    Network,
    /// Unexpected internal failure.
    System,
}

impl ErrorType {
    /// Whether errors of this type may be retried at all.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Validation)
    }

    /// Whether the message should be generalized before leaving the engine.
    #[must_use]
    pub const fn hides_detail(self) -> bool {
        matches!(self, Self::Network | Self::System)
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Execution => "EXECUTION",
            Self::Network => "NETWORK",
            Self::System => "SYSTEM",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity used when logging an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    /// Informational.
    Info,
    /// Recoverable problem.
    Warning,
    /// Operation failed.
    Error,
    /// Engine integrity at risk.
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Stable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Order failed validation, a risk limit, or an illegal transition.
    InvalidOrder,
    /// A caller-supplied parameter is invalid.
    InvalidParameter,
    /// Not enough margin for the order.
    InsufficientMargin,
    /// Position limit would be exceeded.
    PositionLimitExceeded,
    /// Venue or engine rate limit hit.
    RateLimitExceeded,
    /// Order, lifecycle, dependency or profile not found.
    OrderNotFound,
    /// Could not reach the venue.
    ConnectionFailed,
    /// Venue rejected credentials or session.
    AuthenticationFailed,
    /// Venue failed to execute the operation.
    ExecutionFailed,
    /// Deadline exceeded.
    Timeout,
    /// Circuit breaker is open.
    CircuitOpen,
    /// Caller cancelled the operation.
    Cancelled,
    /// Capability not offered by the connector.
    Unsupported,
    /// Unexpected internal failure.
    InternalError,
}

impl ErrorCode {
    /// Wire form of the code (`ERR_*`).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidOrder => "ERR_INVALID_ORDER",
            Self::InvalidParameter => "ERR_INVALID_PARAMETER",
            Self::InsufficientMargin => "ERR_INSUFFICIENT_MARGIN",
            Self::PositionLimitExceeded => "ERR_POSITION_LIMIT_EXCEEDED",
            Self::RateLimitExceeded => "ERR_RATE_LIMIT_EXCEEDED",
            Self::OrderNotFound => "ERR_ORDER_NOT_FOUND",
            Self::ConnectionFailed => "ERR_CONNECTION_FAILED",
            Self::AuthenticationFailed => "ERR_AUTHENTICATION_FAILED",
            Self::ExecutionFailed => "ERR_EXECUTION_FAILED",
            Self::Timeout => "ERR_TIMEOUT",
            Self::CircuitOpen => "ERR_CIRCUIT_OPEN",
            Self::Cancelled => "ERR_CANCELLED",
            Self::Unsupported => "ERR_UNSUPPORTED",
            Self::InternalError => "ERR_INTERNAL_ERROR",
        }
    }

    /// Error type a code belongs to when no explicit type is given.
    #[must_use]
    pub const fn default_type(&self) -> ErrorType {
        match self {
            Self::InvalidOrder
            | Self::InvalidParameter
            | Self::InsufficientMargin
            | Self::PositionLimitExceeded
            | Self::OrderNotFound
            | Self::AuthenticationFailed
            | Self::Unsupported => ErrorType::Validation,
            Self::RateLimitExceeded | Self::ExecutionFailed => ErrorType::Execution,
            Self::ConnectionFailed | Self::Timeout | Self::CircuitOpen => ErrorType::Network,
            Self::Cancelled | Self::InternalError => ErrorType::System,
        }
    }

    /// Severity a code is logged at when no explicit severity is given.
    #[must_use]
    pub const fn default_severity(&self) -> ErrorSeverity {
        match self.default_type() {
            ErrorType::Validation => ErrorSeverity::Warning,
            ErrorType::Execution | ErrorType::Network => ErrorSeverity::Error,
            ErrorType::System => ErrorSeverity::Critical,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified engine error.
///
/// Values are immutable; the `with_*` builders consume and return a new error.
#[derive(Debug, Clone, Error)]
pub struct ExecutionError {
    error_type: ErrorType,
    severity: ErrorSeverity,
    code: ErrorCode,
    message: String,
    /// Component that raised the error.
    origin: String,
    #[source]
    cause: Option<ErrorCause>,
    order_id: Option<String>,
    portfolio_id: Option<String>,
    strategy_id: Option<String>,
    details: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
}

impl ExecutionError {
    /// Create an error with the code's default type and severity.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            error_type: code.default_type(),
            severity: code.default_severity(),
            code,
            message: message.into(),
            origin: origin.into(),
            cause: None,
            order_id: None,
            portfolio_id: None,
            strategy_id: None,
            details: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Override the error type.
    #[must_use]
    pub const fn with_type(mut self, error_type: ErrorType) -> Self {
        self.error_type = error_type;
        self
    }

    /// Override the severity.
    #[must_use]
    pub const fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Attach an already shared cause.
    #[must_use]
    pub fn with_shared_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Attach the order this error concerns.
    #[must_use]
    pub fn with_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    /// Attach the portfolio this error concerns.
    #[must_use]
    pub fn with_portfolio(mut self, portfolio_id: impl Into<String>) -> Self {
        self.portfolio_id = Some(portfolio_id.into());
        self
    }

    /// Attach the strategy this error concerns.
    #[must_use]
    pub fn with_strategy(mut self, strategy_id: impl Into<String>) -> Self {
        self.strategy_id = Some(strategy_id.into());
        self
    }

    /// Add a key/value detail.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Error type.
    #[must_use]
    pub const fn error_type(&self) -> ErrorType {
        self.error_type
    }

    /// Severity.
    #[must_use]
    pub const fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    /// Error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Component that raised the error.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Underlying cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// Order ID, if attached.
    #[must_use]
    pub fn order_id(&self) -> Option<&str> {
        self.order_id.as_deref()
    }

    /// Portfolio ID, if attached.
    #[must_use]
    pub fn portfolio_id(&self) -> Option<&str> {
        self.portfolio_id.as_deref()
    }

    /// Strategy ID, if attached.
    #[must_use]
    pub fn strategy_id(&self) -> Option<&str> {
        self.strategy_id.as_deref()
    }

    /// Key/value details.
    #[must_use]
    pub const fn details(&self) -> &BTreeMap<String, String> {
        &self.details
    }

    /// When the error was raised.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Bad input; never retried.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self.error_type, ErrorType::Validation)
    }

    /// Type permits retries (budget permitting).
    #[must_use]
    pub const fn is_retryable_type(&self) -> bool {
        self.error_type.is_retryable()
    }

    /// Raised by an open circuit breaker.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self.code, ErrorCode::CircuitOpen)
    }

    /// Raised by an expired deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.code, ErrorCode::Timeout)
    }

    /// Raised by caller cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.code, ErrorCode::Cancelled)
    }

    /// Whether any error in the cause chain satisfies `predicate`.
    ///
    /// Walks explicit `cause` links only, downcasting each to `ExecutionError`.
    pub fn any_cause(&self, predicate: impl Fn(&Self) -> bool) -> bool {
        let mut current = self.cause.as_deref();
        while let Some(err) = current {
            match err.downcast_ref::<Self>() {
                Some(inner) if predicate(inner) => return true,
                Some(inner) => current = inner.cause.as_deref(),
                None => return false,
            }
        }
        false
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}][{}] {}: {}",
            self.error_type, self.severity, self.code, self.message
        )
    }
}

/// Convenience constructors for common errors.
impl ExecutionError {
    /// Invalid order (validation).
    #[must_use]
    pub fn invalid_order(message: impl Into<String>, origin: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidOrder, message, origin)
    }

    /// Invalid parameter (validation).
    #[must_use]
    pub fn invalid_parameter(message: impl Into<String>, origin: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParameter, message, origin)
    }

    /// Entity not found (validation).
    #[must_use]
    pub fn not_found(message: impl Into<String>, origin: impl Into<String>) -> Self {
        Self::new(ErrorCode::OrderNotFound, message, origin)
    }

    /// Venue execution failure.
    #[must_use]
    pub fn execution(message: impl Into<String>, origin: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionFailed, message, origin)
    }

    /// Connectivity failure.
    #[must_use]
    pub fn connection(message: impl Into<String>, origin: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionFailed, message, origin)
    }

    /// Internal failure.
    #[must_use]
    pub fn internal(message: impl Into<String>, origin: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message, origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let err = ExecutionError::invalid_order("quantity must be positive", "RiskManager");
        assert_eq!(
            err.to_string(),
            "[VALIDATION][WARNING] ERR_INVALID_ORDER: quantity must be positive"
        );
    }

    #[test]
    fn test_default_types() {
        assert_eq!(ErrorCode::InvalidOrder.default_type(), ErrorType::Validation);
        assert_eq!(ErrorCode::ExecutionFailed.default_type(), ErrorType::Execution);
        assert_eq!(ErrorCode::Timeout.default_type(), ErrorType::Network);
        assert_eq!(ErrorCode::InternalError.default_type(), ErrorType::System);
        assert_eq!(
            ErrorCode::AuthenticationFailed.default_type(),
            ErrorType::Validation
        );
    }

    #[test]
    fn test_builders_preserve_fields() {
        let err = ExecutionError::execution("venue down", "BrokerRouter")
            .with_order("ord-1")
            .with_portfolio("pf-1")
            .with_strategy("st-1")
            .with_detail("broker", "sim")
            .with_severity(ErrorSeverity::Critical);

        assert_eq!(err.order_id(), Some("ord-1"));
        assert_eq!(err.portfolio_id(), Some("pf-1"));
        assert_eq!(err.strategy_id(), Some("st-1"));
        assert_eq!(err.details().get("broker").map(String::as_str), Some("sim"));
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.origin(), "BrokerRouter");
    }

    #[test]
    fn test_cause_is_explicit_source() {
        let inner = ExecutionError::new(ErrorCode::Timeout, "deadline exceeded", "CircuitBreaker");
        let outer = ExecutionError::execution("place order failed", "BrokerRouter").with_cause(inner);

        let source = std::error::Error::source(&outer);
        assert!(source.is_some());
        assert!(outer.any_cause(ExecutionError::is_timeout));
        assert!(!outer.any_cause(ExecutionError::is_cancelled));
    }

    #[test]
    fn test_classification_helpers() {
        let open = ExecutionError::new(ErrorCode::CircuitOpen, "open", "CircuitBreaker");
        assert!(open.is_circuit_open());
        assert!(open.is_retryable_type());
        assert!(!open.is_validation());

        let invalid = ExecutionError::invalid_parameter("bad", "test");
        assert!(invalid.is_validation());
        assert!(!invalid.is_retryable_type());
    }

    #[test]
    fn test_serde_codes() {
        let json = serde_json::to_string(&ErrorType::Network).unwrap();
        assert_eq!(json, "\"NETWORK\"");
        let json = serde_json::to_string(&ErrorCode::CircuitOpen).unwrap();
        assert_eq!(json, "\"CIRCUIT_OPEN\"");
    }
}
