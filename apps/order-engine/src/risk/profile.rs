//! Risk profiles and limits.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Kind of threshold a limit enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLimitType {
    /// Maximum notional of a single order.
    OrderValue,
    /// Maximum absolute position after the order fills.
    PositionSize,
    /// Fraction of available margin an order may consume.
    Margin,
    /// Maximum orders per rate window.
    OrderRate,
    /// Maximum gross exposure after the order.
    Exposure,
    /// Maximum gross exposure over equity.
    Leverage,
    /// Maximum share of equity in one symbol.
    Concentration,
    /// Maximum current drawdown, as a fraction.
    Drawdown,
}

impl RiskLimitType {
    /// Order in which limits are evaluated.
    pub const CHECK_ORDER: [Self; 8] = [
        Self::OrderValue,
        Self::Leverage,
        Self::Drawdown,
        Self::PositionSize,
        Self::Exposure,
        Self::Concentration,
        Self::Margin,
        Self::OrderRate,
    ];

    /// Description used when a limit is created without one.
    #[must_use]
    pub const fn default_description(self) -> &'static str {
        match self {
            Self::OrderValue => "Max order value",
            Self::PositionSize => "Max position size",
            Self::Margin => "Margin utilisation",
            Self::OrderRate => "Max order rate",
            Self::Exposure => "Max gross exposure",
            Self::Leverage => "Max leverage",
            Self::Concentration => "Max concentration",
            Self::Drawdown => "Max drawdown",
        }
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OrderValue => "ORDER_VALUE",
            Self::PositionSize => "POSITION_SIZE",
            Self::Margin => "MARGIN",
            Self::OrderRate => "ORDER_RATE",
            Self::Exposure => "EXPOSURE",
            Self::Leverage => "LEVERAGE",
            Self::Concentration => "CONCENTRATION",
            Self::Drawdown => "DRAWDOWN",
        }
    }
}

impl fmt::Display for RiskLimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// Low.
    Low,
    /// Medium.
    #[default]
    Medium,
    /// High.
    High,
    /// Extreme.
    Extreme,
}

/// One numeric threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskLimit {
    /// What the threshold applies to.
    pub limit_type: RiskLimitType,
    /// Threshold value; units depend on `limit_type`.
    pub value: Decimal,
    /// Severity.
    #[serde(default)]
    pub level: RiskLevel,
    /// Prefix of the breach message.
    pub description: String,
    /// Disabled limits are skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl RiskLimit {
    /// Create an enabled limit with the default description.
    #[must_use]
    pub fn new(limit_type: RiskLimitType, value: Decimal) -> Self {
        Self {
            limit_type,
            value,
            level: RiskLevel::default(),
            description: limit_type.default_description().to_string(),
            enabled: true,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the severity.
    #[must_use]
    pub const fn with_level(mut self, level: RiskLevel) -> Self {
        self.level = level;
        self
    }

    /// Disable the limit.
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Named set of limits a strategy's orders must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskProfile {
    /// Profile ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Limits keyed by type.
    #[serde(default)]
    pub limits: HashMap<RiskLimitType, RiskLimit>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl RiskProfile {
    /// Create an empty profile.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            limits: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add or replace a limit.
    #[must_use]
    pub fn with_limit(mut self, limit: RiskLimit) -> Self {
        self.limits.insert(limit.limit_type, limit);
        self
    }

    /// Enabled limit of the given type.
    #[must_use]
    pub fn enabled_limit(&self, limit_type: RiskLimitType) -> Option<&RiskLimit> {
        self.limits.get(&limit_type).filter(|limit| limit.enabled)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_disabled_limits_are_hidden() {
        let profile = RiskProfile::new("p1", "Conservative")
            .with_limit(RiskLimit::new(RiskLimitType::OrderValue, dec!(10000)))
            .with_limit(RiskLimit::new(RiskLimitType::Leverage, dec!(2)).disabled());

        assert!(profile.enabled_limit(RiskLimitType::OrderValue).is_some());
        assert!(profile.enabled_limit(RiskLimitType::Leverage).is_none());
        assert!(profile.enabled_limit(RiskLimitType::Margin).is_none());
    }

    #[test]
    fn test_limit_deserializes_with_defaults() {
        let limit: RiskLimit = serde_json::from_str(
            r#"{"limit_type":"ORDER_RATE","value":"5","description":"Burst guard"}"#,
        )
        .unwrap();
        assert_eq!(limit.limit_type, RiskLimitType::OrderRate);
        assert_eq!(limit.level, RiskLevel::Medium);
        assert!(limit.enabled);
    }

    #[test]
    fn test_check_order_covers_every_type() {
        let mut types = RiskLimitType::CHECK_ORDER.to_vec();
        types.sort();
        types.dedup();
        assert_eq!(types.len(), 8);
    }
}
