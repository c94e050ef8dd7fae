//! Pre-trade risk validation.
//!
//! Orders are checked against the limits of the risk profile their strategy
//! references. Limits are evaluated in a fixed order and the first breach
//! rejects the order with a Validation error.
//!
//! # Limits
//!
//! | Limit | Compared quantity |
//! |-------|-------------------|
//! | `ORDER_VALUE` | price × quantity |
//! | `LEVERAGE` | (gross exposure + order value) / equity |
//! | `DRAWDOWN` | portfolio drawdown |
//! | `POSITION_SIZE` | absolute position after the fill |
//! | `EXPOSURE` | gross exposure + order value |
//! | `CONCENTRATION` | projected position value / equity |
//! | `MARGIN` | required margin vs. limit × available margin |
//! | `ORDER_RATE` | orders in the trailing rate window |
//!
//! # Example
//!
//! ```rust,ignore
//! use order_engine::risk::{RiskLimit, RiskLimitType, RiskManager, RiskProfile, RiskValidator};
//!
//! let risk = RiskManager::default();
//! risk.create_risk_profile(
//!     RiskProfile::new("conservative", "Conservative")
//!         .with_limit(RiskLimit::new(RiskLimitType::OrderValue, dec!(10000))),
//! )?;
//! risk.validate_order(&order, &portfolio, &strategy)?;
//! ```

mod checks;
mod manager;
mod profile;
mod validator;

pub use checks::OrderExposure;
pub use manager::{MarginRates, RiskManager, RiskSettings};
pub use profile::{RiskLevel, RiskLimit, RiskLimitType, RiskProfile};
pub use validator::{MonitoredRiskValidator, RiskValidator};
