//! Risk manager configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::risk::{MarginRates, RiskLevel, RiskLimit, RiskLimitType, RiskProfile, RiskSettings};

/// Risk configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Margin rate per product type.
    #[serde(default)]
    pub margin_rates: MarginRatesConfig,
    /// Trailing window for order-rate limits (seconds).
    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,
    /// Profile applied to strategies without one.
    #[serde(default)]
    pub default_profile: Option<ProfileConfig>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            margin_rates: MarginRatesConfig::default(),
            rate_window_secs: default_rate_window(),
            default_profile: None,
        }
    }
}

impl RiskConfig {
    /// Convert to the risk manager's settings.
    #[must_use]
    pub fn to_settings(&self) -> RiskSettings {
        RiskSettings {
            margin_rates: MarginRates {
                intraday: self.margin_rates.intraday,
                delivery: self.margin_rates.delivery,
                normal: self.margin_rates.normal,
            },
            rate_window: Duration::from_secs(self.rate_window_secs),
            default_profile: self.default_profile.as_ref().map(ProfileConfig::to_profile),
        }
    }
}

/// Margin rates keyed by product type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginRatesConfig {
    /// Intraday rate.
    #[serde(rename = "INTRADAY", default = "default_intraday")]
    pub intraday: Decimal,
    /// Delivery rate.
    #[serde(rename = "DELIVERY", default = "default_delivery")]
    pub delivery: Decimal,
    /// Normal (carry-forward) rate.
    #[serde(rename = "NORMAL", default = "default_normal")]
    pub normal: Decimal,
}

impl Default for MarginRatesConfig {
    fn default() -> Self {
        Self {
            intraday: default_intraday(),
            delivery: default_delivery(),
            normal: default_normal(),
        }
    }
}

impl MarginRatesConfig {
    pub(crate) fn labelled(&self) -> [(&'static str, Decimal); 3] {
        [
            ("INTRADAY", self.intraday),
            ("DELIVERY", self.delivery),
            ("NORMAL", self.normal),
        ]
    }
}

/// Profile declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Profile ID.
    #[serde(default = "default_profile_id")]
    pub id: String,
    /// Display name.
    #[serde(default = "default_profile_id")]
    pub name: String,
    /// Limits.
    #[serde(default)]
    pub limits: Vec<LimitConfig>,
}

impl ProfileConfig {
    /// Build the profile.
    #[must_use]
    pub fn to_profile(&self) -> RiskProfile {
        self.limits
            .iter()
            .fold(RiskProfile::new(&self.id, &self.name), |profile, limit| {
                profile.with_limit(limit.to_limit())
            })
    }
}

/// Limit declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// What the threshold applies to.
    pub limit_type: RiskLimitType,
    /// Threshold value.
    pub value: Decimal,
    /// Severity.
    #[serde(default)]
    pub level: RiskLevel,
    /// Breach message prefix; defaults per limit type.
    #[serde(default)]
    pub description: Option<String>,
    /// Disabled limits are skipped.
    #[serde(default = "super::observability::default_true")]
    pub enabled: bool,
}

impl LimitConfig {
    /// Build the limit.
    #[must_use]
    pub fn to_limit(&self) -> RiskLimit {
        let mut limit = RiskLimit::new(self.limit_type, self.value).with_level(self.level);
        if let Some(description) = &self.description {
            limit = limit.with_description(description.as_str());
        }
        if !self.enabled {
            limit = limit.disabled();
        }
        limit
    }
}

const fn default_rate_window() -> u64 {
    60
}

fn default_intraday() -> Decimal {
    dec!(0.2)
}

fn default_delivery() -> Decimal {
    Decimal::ONE
}

fn default_normal() -> Decimal {
    dec!(0.5)
}

fn default_profile_id() -> String {
    "default".to_string()
}
