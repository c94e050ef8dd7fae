//! Configuration module for the order engine.
//!
//! Provides configuration loading, validation, and environment variable
//! interpolation for every engine component.
//!
//! # Usage
//!
//! ```rust,ignore
//! use order_engine::config::{Config, load_config};
//!
//! // Load from default path (config.yaml)
//! let config = load_config(None)?;
//!
//! // Load from custom path
//! let config = load_config(Some("custom/config.yaml"))?;
//!
//! let registry = config.circuit_breaker.to_registry();
//! let policy = config.error_handling.to_retry_policy();
//! ```

mod circuit_breaker;
mod engine;
mod observability;
mod risk;

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::broker::BrokerConfig;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerSettings};
pub use engine::{EngineConfig, ErrorHandlingConfig, LifecycleConfig};
pub use observability::{LoggingConfig, ObservabilityConfig};
pub use risk::{LimitConfig, MarginRatesConfig, ProfileConfig, RiskConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Engine process configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Retry budget and backoff.
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    /// Circuit breaker configuration.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Risk configuration.
    #[serde(default)]
    pub risk: RiskConfig,
    /// Lifecycle housekeeping.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Broker clients to register at startup.
    #[serde(default)]
    pub brokers: Vec<BrokerConfig>,
}

// ============================================
// Configuration Loading
// ============================================

/// Load configuration from a YAML file with environment variable interpolation.
///
/// # Arguments
///
/// * `path` - Optional path to the config file. Defaults to "config.yaml".
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or("config.yaml");

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_string(),
        source: e,
    })?;

    load_config_from_string(&contents)
}

/// Load configuration from a YAML string (useful for testing).
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax.
#[allow(clippy::expect_used)] // Regex is compile-time constant; expect() is safe here
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map_or("", |m| m.as_str());
        match std::env::var(&cap[1]) {
            Ok(v) if !v.is_empty() => v,
            _ => default_value.to_string(),
        }
    })
    .into_owned()
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// Validate configuration values.
fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let valid_modes = ["PAPER", "LIVE"];
    if !valid_modes.contains(&config.engine.environment.as_str()) {
        return Err(invalid(format!(
            "engine.environment must be one of: {valid_modes:?}"
        )));
    }

    if config.engine.metrics_enabled
        && config.engine.metrics_addr.parse::<std::net::SocketAddr>().is_err()
    {
        return Err(invalid(format!(
            "engine.metrics_addr is not a socket address: {}",
            config.engine.metrics_addr
        )));
    }

    let retry = &config.error_handling;
    if retry.initial_backoff_ms == 0 || retry.max_backoff_ms == 0 {
        return Err(invalid("error_handling backoff durations must be positive"));
    }
    if retry.max_backoff_ms < retry.initial_backoff_ms {
        return Err(invalid(
            "error_handling.max_backoff_ms must not be below initial_backoff_ms",
        ));
    }
    if retry.backoff_multiplier < 1.0 {
        return Err(invalid("error_handling.backoff_multiplier must be at least 1.0"));
    }
    if !(0.0..=1.0).contains(&retry.jitter_factor) {
        return Err(invalid(
            "error_handling.jitter_factor must be between 0.0 and 1.0",
        ));
    }

    for (label, settings) in config.circuit_breaker.labelled() {
        if settings.failure_threshold == 0
            || settings.half_open_max_calls == 0
            || settings.reset_timeout_secs == 0
            || settings.call_timeout_ms == 0
        {
            return Err(invalid(format!("{label} thresholds must be positive")));
        }
    }

    for (product, rate) in config.risk.margin_rates.labelled() {
        if rate <= Decimal::ZERO || rate > Decimal::ONE {
            return Err(invalid(format!(
                "risk.margin_rates.{product} must be in (0, 1], got {rate}"
            )));
        }
    }
    if config.risk.rate_window_secs == 0 {
        return Err(invalid("risk.rate_window_secs must be positive"));
    }

    if config.lifecycle.expiry_check_interval_secs == 0 {
        return Err(invalid("lifecycle.expiry_check_interval_secs must be positive"));
    }

    let mut client_ids = HashSet::new();
    for broker in &config.brokers {
        if broker.client_id.trim().is_empty() {
            return Err(invalid("brokers[].client_id is required"));
        }
        if !client_ids.insert(broker.client_id.as_str()) {
            return Err(invalid(format!(
                "duplicate broker client_id: {}",
                broker.client_id
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::broker::BrokerKind;
    use crate::risk::RiskLimitType;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.engine.environment, "PAPER");
        assert_eq!(config.error_handling.max_retries, 3);
        assert_eq!(config.circuit_breaker.default.failure_threshold, 5);
        assert_eq!(config.risk.margin_rates.intraday, dec!(0.2));
        assert_eq!(config.lifecycle.expiry_check_interval_secs, 30);
        assert!(config.brokers.is_empty());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_load_empty_config_uses_defaults() {
        let config = match load_config_from_string("{}") {
            Ok(c) => c,
            Err(e) => panic!("should load empty config: {e}"),
        };
        assert_eq!(config.observability.logging.level, "info");
        assert!(config.observability.logging.is_json());
    }

    #[test]
    fn test_env_var_with_default_when_missing() {
        let input = "mode: ${ORDER_ENGINE_TEST_NONEXISTENT_VAR:-PAPER}";
        let result = interpolate_env_vars(input);

        assert_eq!(result, "mode: PAPER");
    }

    #[test]
    #[expect(clippy::literal_string_with_formatting_args)] // ${...} is env var syntax, not format args
    fn test_env_var_with_default_uses_existing() {
        // PATH should always exist
        let input = "path: ${PATH:-default}";
        let result = interpolate_env_vars(input);

        assert_ne!(result, "path: default");
        assert!(result.starts_with("path: "));
    }

    #[test]
    fn test_env_var_without_default_becomes_empty() {
        let input = "api_key: ${ORDER_ENGINE_TEST_UNLIKELY_TO_EXIST}";
        let result = interpolate_env_vars(input);

        assert_eq!(result, "api_key: ");
    }

    #[test]
    fn test_env_var_interpolated_into_broker_secret() {
        let yaml = r"
brokers:
  - client_id: c1
    kind: ZERODHA
    api_key: ${ORDER_ENGINE_TEST_MISSING_KEY:-demo-key}
";
        let config = load_config_from_string(yaml).unwrap();
        assert_eq!(config.brokers[0].api_key, "demo-key");
        assert_eq!(config.brokers[0].kind, BrokerKind::Zerodha);
    }

    #[test]
    fn test_validation_invalid_environment() {
        let yaml = r"
engine:
  environment: STAGING
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for invalid environment");
        };
        assert!(err.to_string().contains("environment"));
    }

    #[test]
    fn test_validation_rejects_bad_backoff() {
        let yaml = r"
error_handling:
  backoff_multiplier: 0.5
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for multiplier below 1");
        };
        assert!(err.to_string().contains("backoff_multiplier"));

        let yaml = r"
error_handling:
  jitter_factor: 1.5
";
        assert!(load_config_from_string(yaml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_threshold_override() {
        let yaml = r"
circuit_breaker:
  overrides:
    c1:
      failure_threshold: 0
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for zero threshold");
        };
        assert!(err.to_string().contains("circuit_breaker.overrides.c1"));
    }

    #[test]
    fn test_validation_rejects_margin_rate_out_of_range() {
        let yaml = r"
risk:
  margin_rates:
    DELIVERY: 1.5
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for margin rate above 1");
        };
        assert!(err.to_string().contains("DELIVERY"));
    }

    #[test]
    fn test_validation_rejects_duplicate_clients() {
        let yaml = r"
brokers:
  - client_id: c1
    kind: SIMULATED
  - client_id: c1
    kind: ZERODHA
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for duplicate client");
        };
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_full_config_parse() {
        let yaml = r#"
engine:
  environment: LIVE
  metrics_addr: "127.0.0.1:9100"

observability:
  logging:
    level: "debug"
    format: "pretty"

error_handling:
  max_retries: 5
  initial_backoff_ms: 250

circuit_breaker:
  default:
    failure_threshold: 3
    reset_timeout_secs: 10
  overrides:
    c1:
      failure_threshold: 8
      call_timeout_ms: 2000

risk:
  rate_window_secs: 30
  margin_rates:
    INTRADAY: 0.25
  default_profile:
    id: house
    limits:
      - limit_type: ORDER_VALUE
        value: 10000
      - limit_type: LEVERAGE
        value: 3
        enabled: false

lifecycle:
  expiry_check_interval_secs: 5

brokers:
  - client_id: c1
    kind: SIMULATED
    user_id: u1
"#;

        let config = match load_config_from_string(yaml) {
            Ok(c) => c,
            Err(e) => panic!("should load full config: {e}"),
        };

        assert_eq!(config.engine.environment, "LIVE");
        assert!(!config.observability.logging.is_json());

        let policy = config.error_handling.to_retry_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(250));

        let registry = config.circuit_breaker.to_registry();
        assert_eq!(registry.get_or_create("c1").config().failure_threshold, 8);
        assert_eq!(registry.get_or_create("c1").call_timeout(), Duration::from_secs(2));
        assert_eq!(registry.get_or_create("c2").config().failure_threshold, 3);

        let settings = config.risk.to_settings();
        assert_eq!(settings.margin_rates.intraday, dec!(0.25));
        assert_eq!(settings.margin_rates.delivery, dec!(1));
        assert_eq!(settings.rate_window, Duration::from_secs(30));
        let profile = settings.default_profile.unwrap();
        assert_eq!(profile.id, "house");
        assert!(profile.enabled_limit(RiskLimitType::OrderValue).is_some());
        assert!(profile.enabled_limit(RiskLimitType::Leverage).is_none());

        assert_eq!(config.lifecycle.expiry_check_interval(), Duration::from_secs(5));
        assert_eq!(config.brokers[0].user_id.as_deref(), Some("u1"));
    }
}
