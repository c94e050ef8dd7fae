//! Risk manager: profile store, position book and order validation.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::checks::{self, OrderExposure};
use super::profile::{RiskLimitType, RiskProfile};
use super::validator::RiskValidator;
use crate::domain::{Order, Portfolio, Position, ProductType, Strategy};
use crate::error::ExecutionError;

const ORIGIN: &str = "RiskManager";

/// Orders kept per portfolio for rate checks and history queries.
const HISTORY_CAPACITY: usize = 10_000;

/// Margin rate per product type, as a fraction of order value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginRates {
    /// Intraday rate.
    pub intraday: Decimal,
    /// Delivery rate.
    pub delivery: Decimal,
    /// Normal (carry-forward) rate.
    pub normal: Decimal,
}

impl Default for MarginRates {
    fn default() -> Self {
        Self {
            intraday: dec!(0.2),
            delivery: Decimal::ONE,
            normal: dec!(0.5),
        }
    }
}

impl MarginRates {
    /// Rate for `product_type`.
    #[must_use]
    pub const fn rate_for(&self, product_type: ProductType) -> Decimal {
        match product_type {
            ProductType::Intraday => self.intraday,
            ProductType::Delivery => self.delivery,
            ProductType::Normal => self.normal,
        }
    }
}

/// Risk manager settings.
#[derive(Debug, Clone)]
pub struct RiskSettings {
    /// Margin rates per product type.
    pub margin_rates: MarginRates,
    /// Trailing window for order-rate checks.
    pub rate_window: Duration,
    /// Profile used when a strategy has none or names an unknown one.
    pub default_profile: Option<RiskProfile>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            margin_rates: MarginRates::default(),
            rate_window: Duration::from_secs(60),
            default_profile: None,
        }
    }
}

/// Validates orders against risk profiles.
#[derive(Debug, Default)]
pub struct RiskManager {
    settings: RiskSettings,
    profiles: RwLock<HashMap<String, RiskProfile>>,
    /// Portfolio ID to symbol to position.
    positions: RwLock<HashMap<String, HashMap<String, Position>>>,
    /// Portfolio ID to recorded orders, oldest first.
    history: RwLock<HashMap<String, VecDeque<Order>>>,
}

impl RiskManager {
    /// Create a manager with the given settings.
    #[must_use]
    pub fn new(settings: RiskSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &RiskSettings {
        &self.settings
    }

    // =========================================================================
    // Profile store
    // =========================================================================

    /// Store a new profile.
    ///
    /// # Errors
    ///
    /// Returns `ERR_INVALID_PARAMETER` for an empty ID or a duplicate.
    pub fn create_risk_profile(&self, mut profile: RiskProfile) -> Result<(), ExecutionError> {
        if profile.id.trim().is_empty() {
            return Err(ExecutionError::invalid_parameter(
                "Risk profile ID is required",
                ORIGIN,
            ));
        }
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        if profiles.contains_key(&profile.id) {
            return Err(ExecutionError::invalid_parameter(
                format!("Risk profile with ID {} already exists", profile.id),
                ORIGIN,
            ));
        }
        let now = Utc::now();
        profile.created_at = now;
        profile.updated_at = now;
        tracing::info!(
            profile_id = %profile.id,
            name = %profile.name,
            limits = profile.limits.len(),
            "Risk profile created"
        );
        profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    /// Look up a profile.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` if no profile has that ID.
    pub fn get_risk_profile(&self, profile_id: &str) -> Result<RiskProfile, ExecutionError> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(profile_id)
            .cloned()
            .ok_or_else(|| profile_not_found(profile_id))
    }

    /// Replace a stored profile, keeping its creation time.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` if no profile has that ID.
    pub fn update_risk_profile(&self, mut profile: RiskProfile) -> Result<(), ExecutionError> {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        let existing = profiles
            .get(&profile.id)
            .ok_or_else(|| profile_not_found(&profile.id))?;
        profile.created_at = existing.created_at;
        profile.updated_at = Utc::now();
        tracing::info!(profile_id = %profile.id, "Risk profile updated");
        profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    /// Remove a profile.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` if no profile has that ID.
    pub fn delete_risk_profile(&self, profile_id: &str) -> Result<RiskProfile, ExecutionError> {
        let removed = self
            .profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(profile_id)
            .ok_or_else(|| profile_not_found(profile_id))?;
        tracing::info!(profile_id, "Risk profile deleted");
        Ok(removed)
    }

    /// Every stored profile, sorted by ID.
    #[must_use]
    pub fn list_risk_profiles(&self) -> Vec<RiskProfile> {
        let mut profiles: Vec<_> = self
            .profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    // =========================================================================
    // Position book and order history
    // =========================================================================

    /// Record the current position for a symbol.
    pub fn update_position(&self, portfolio_id: &str, position: Position) {
        tracing::debug!(
            portfolio_id,
            symbol = %position.symbol,
            quantity = %position.quantity,
            "Position updated"
        );
        self.positions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(portfolio_id.to_string())
            .or_default()
            .insert(position.symbol.clone(), position);
    }

    /// Tracked position for a symbol.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` if the position is not tracked.
    pub fn get_position(&self, portfolio_id: &str, symbol: &str) -> Result<Position, ExecutionError> {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(portfolio_id)
            .and_then(|book| book.get(symbol))
            .cloned()
            .ok_or_else(|| {
                ExecutionError::not_found(
                    format!("Position for symbol {symbol} not found in portfolio {portfolio_id}"),
                    ORIGIN,
                )
                .with_portfolio(portfolio_id)
            })
    }

    /// Every tracked position of a portfolio, sorted by symbol.
    #[must_use]
    pub fn portfolio_positions(&self, portfolio_id: &str) -> Vec<Position> {
        let mut positions: Vec<_> = self
            .positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(portfolio_id)
            .map(|book| book.values().cloned().collect())
            .unwrap_or_default();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Record a submitted order for rate checks.
    pub fn record_order(&self, order: &Order) {
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        let orders = history.entry(order.portfolio_id.clone()).or_default();
        if orders.len() == HISTORY_CAPACITY {
            orders.pop_front();
        }
        orders.push_back(order.clone());
        tracing::debug!(
            order_id = %order.id,
            portfolio_id = %order.portfolio_id,
            symbol = %order.symbol,
            side = %order.side,
            quantity = %order.quantity,
            "Order recorded"
        );
    }

    /// Recorded orders for a portfolio, oldest first.
    #[must_use]
    pub fn order_history(&self, portfolio_id: &str) -> Vec<Order> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(portfolio_id)
            .map(|orders| orders.iter().cloned().collect())
            .unwrap_or_default()
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Quantities the checks compare against limits.
    ///
    /// # Errors
    ///
    /// Returns a Validation error if a derived quantity does not fit in a
    /// `Decimal`.
    pub fn derive_exposure(
        &self,
        order: &Order,
        portfolio: &Portfolio,
    ) -> Result<OrderExposure, ExecutionError> {
        let current = self
            .get_position(&portfolio.id, &order.symbol)
            .ok()
            .or_else(|| portfolio.positions.get(&order.symbol).cloned());
        let reference_price = current.as_ref().map(|position| position.average_price);

        let order_value = order
            .notional(reference_price)
            .ok_or_else(|| overflow(order, "order value"))?;
        let unit_price = order
            .price
            .or(reference_price)
            .or(order.trigger_price)
            .unwrap_or(Decimal::ZERO);
        let projected_quantity = current
            .as_ref()
            .map_or(Decimal::ZERO, |position| position.quantity)
            .checked_add(order.signed_quantity())
            .ok_or_else(|| overflow(order, "projected position"))?;
        let projected_position_value = projected_quantity
            .checked_mul(unit_price)
            .ok_or_else(|| overflow(order, "projected position value"))?
            .abs();
        let margin_required = order_value
            .checked_mul(self.settings.margin_rates.rate_for(order.product_type))
            .ok_or_else(|| overflow(order, "margin required"))?;

        Ok(OrderExposure {
            order_value,
            projected_quantity,
            projected_position_value,
            margin_required,
            recent_orders: self.recent_order_count(&portfolio.id),
            rate_window_secs: self.settings.rate_window.as_secs(),
        })
    }

    fn recent_order_count(&self, portfolio_id: &str) -> usize {
        let window = chrono::Duration::from_std(self.settings.rate_window)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(window);
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(portfolio_id)
            .map_or(0, |orders| {
                orders
                    .iter()
                    .rev()
                    .take_while(|order| cutoff.is_none_or(|cutoff| order.created_at >= cutoff))
                    .count()
            })
    }

    fn check_limits(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
        limit_types: &[RiskLimitType],
    ) -> Result<(), ExecutionError> {
        let Some(profile) = profile else {
            return Ok(());
        };
        let exposure = self.derive_exposure(order, portfolio)?;
        for limit_type in limit_types {
            let Some(limit) = profile.enabled_limit(*limit_type) else {
                continue;
            };
            if let Some(detail) = checks::evaluate(limit, &exposure, portfolio) {
                return Err(ExecutionError::invalid_order(
                    format!("{}: {detail}", limit.description),
                    ORIGIN,
                )
                .with_order(order.id.as_str())
                .with_portfolio(order.portfolio_id.as_str())
                .with_strategy(order.strategy_id.as_str())
                .with_detail("risk_profile_id", profile.id.as_str())
                .with_detail("limit_type", limit_type.as_str())
                .with_detail("limit_value", limit.value.normalize().to_string()));
            }
        }
        Ok(())
    }
}

impl RiskValidator for RiskManager {
    fn resolve_profile(&self, strategy: &Strategy) -> Option<RiskProfile> {
        let resolved = strategy
            .risk_profile_id
            .as_deref()
            .and_then(|profile_id| match self.get_risk_profile(profile_id) {
                Ok(profile) => Some(profile),
                Err(_) => {
                    tracing::warn!(
                        strategy_id = %strategy.id,
                        risk_profile_id = profile_id,
                        "Risk profile not found, using default"
                    );
                    None
                }
            });
        resolved.or_else(|| self.settings.default_profile.clone())
    }

    fn validate_order(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        strategy: &Strategy,
    ) -> Result<(), ExecutionError> {
        let profile = self.resolve_profile(strategy);
        self.check_limits(order, portfolio, profile.as_ref(), &RiskLimitType::CHECK_ORDER)
    }

    fn check_risk_parameters(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        self.check_limits(
            order,
            portfolio,
            profile,
            &[
                RiskLimitType::OrderValue,
                RiskLimitType::Leverage,
                RiskLimitType::Drawdown,
            ],
        )
    }

    fn check_position_limits(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        self.check_limits(
            order,
            portfolio,
            profile,
            &[
                RiskLimitType::PositionSize,
                RiskLimitType::Exposure,
                RiskLimitType::Concentration,
            ],
        )
    }

    fn check_margin_requirements(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        self.check_limits(order, portfolio, profile, &[RiskLimitType::Margin])
    }

    fn check_rate_limits(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        profile: Option<&RiskProfile>,
    ) -> Result<(), ExecutionError> {
        self.check_limits(order, portfolio, profile, &[RiskLimitType::OrderRate])
    }
}

fn overflow(order: &Order, quantity: &str) -> ExecutionError {
    ExecutionError::invalid_order(format!("{quantity} overflows"), ORIGIN)
        .with_order(order.id.as_str())
        .with_portfolio(order.portfolio_id.as_str())
}

fn profile_not_found(profile_id: &str) -> ExecutionError {
    ExecutionError::not_found(
        format!("Risk profile with ID {profile_id} not found"),
        ORIGIN,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderSide;
    use crate::error::{ErrorCode, ErrorType};
    use crate::risk::RiskLimit;

    fn order() -> Order {
        Order::limit("o1", "INFY", OrderSide::Buy, dec!(1000), dec!(150.0))
            .for_account("pf", "strat", "client-1")
    }

    fn strategy() -> Strategy {
        Strategy::with_profile("strat", "conservative")
    }

    fn manager_with_value_limit(value: Decimal) -> RiskManager {
        let manager = RiskManager::default();
        manager
            .create_risk_profile(
                RiskProfile::new("conservative", "Conservative")
                    .with_limit(RiskLimit::new(RiskLimitType::OrderValue, value)),
            )
            .unwrap();
        manager
    }

    #[test]
    fn test_order_value_breach() {
        let manager = manager_with_value_limit(dec!(10000));
        let err = manager
            .validate_order(&order(), &Portfolio::new("pf", dec!(1000000)), &strategy())
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::InvalidOrder);
        assert_eq!(err.error_type(), ErrorType::Validation);
        assert_eq!(
            err.message(),
            "Max order value: order value 150000 exceeds limit of 10000"
        );
        assert_eq!(err.details().get("limit_type").unwrap(), "ORDER_VALUE");
    }

    #[test]
    fn test_overflowing_order_value_is_rejected() {
        let manager = manager_with_value_limit(dec!(10000));
        let order = Order::limit("o1", "INFY", OrderSide::Buy, dec!(2), Decimal::MAX)
            .for_account("pf", "strat", "client-1");

        let err = manager
            .validate_order(&order, &Portfolio::new("pf", dec!(1000000)), &strategy())
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::InvalidOrder);
        assert_eq!(err.error_type(), ErrorType::Validation);
        assert_eq!(err.message(), "order value overflows");
    }

    #[test]
    fn test_overflowing_position_value_is_rejected() {
        let manager = RiskManager::default();
        let profile = RiskProfile::new("p", "P")
            .with_limit(RiskLimit::new(RiskLimitType::PositionSize, dec!(10)));
        manager.update_position("pf", Position::new("INFY", Decimal::MAX, dec!(1)));
        let order = Order::limit("o1", "INFY", OrderSide::Buy, dec!(1), dec!(1))
            .for_account("pf", "strat", "client-1");

        let err = manager
            .check_position_limits(&order, &Portfolio::new("pf", dec!(1000000)), Some(&profile))
            .unwrap_err();
        assert_eq!(err.message(), "projected position overflows");
    }

    #[test]
    fn test_order_within_limit_passes() {
        let manager = manager_with_value_limit(dec!(200000));
        manager
            .validate_order(&order(), &Portfolio::new("pf", dec!(1000000)), &strategy())
            .unwrap();
    }

    #[test]
    fn test_first_breach_in_check_order_wins() {
        let manager = RiskManager::default();
        manager
            .create_risk_profile(
                RiskProfile::new("conservative", "Conservative")
                    .with_limit(RiskLimit::new(RiskLimitType::OrderRate, dec!(0)))
                    .with_limit(RiskLimit::new(RiskLimitType::Leverage, dec!(0.1))),
            )
            .unwrap();

        let err = manager
            .validate_order(&order(), &Portfolio::new("pf", dec!(1000000)), &strategy())
            .unwrap_err();
        assert_eq!(err.details().get("limit_type").unwrap(), "LEVERAGE");
    }

    #[test]
    fn test_unknown_profile_falls_back_to_default() {
        let settings = RiskSettings {
            default_profile: Some(
                RiskProfile::new("default", "Default")
                    .with_limit(RiskLimit::new(RiskLimitType::OrderValue, dec!(1))),
            ),
            ..RiskSettings::default()
        };
        let manager = RiskManager::new(settings);
        let portfolio = Portfolio::new("pf", dec!(1000000));

        let err = manager
            .validate_order(&order(), &portfolio, &strategy())
            .unwrap_err();
        assert_eq!(err.details().get("risk_profile_id").unwrap(), "default");

        // Without any default, no limits apply.
        RiskManager::default()
            .validate_order(&order(), &portfolio, &strategy())
            .unwrap();
    }

    #[test]
    fn test_margin_uses_product_rate() {
        let manager = RiskManager::default();
        let profile = RiskProfile::new("p", "P")
            .with_limit(RiskLimit::new(RiskLimitType::Margin, Decimal::ONE));
        let mut portfolio = Portfolio::new("pf", dec!(1000000));
        portfolio.available_margin = dec!(40000);

        // Intraday: 150000 * 0.2 = 30000 fits.
        manager
            .check_margin_requirements(&order(), &portfolio, Some(&profile))
            .unwrap();

        let delivery = order().with_product(ProductType::Delivery);
        assert!(
            manager
                .check_margin_requirements(&delivery, &portfolio, Some(&profile))
                .is_err()
        );
    }

    #[test]
    fn test_rate_limit_counts_recorded_orders() {
        let manager = RiskManager::default();
        let profile = RiskProfile::new("p", "P")
            .with_limit(RiskLimit::new(RiskLimitType::OrderRate, dec!(2)));
        let portfolio = Portfolio::new("pf", dec!(1000000));

        manager.check_rate_limits(&order(), &portfolio, Some(&profile)).unwrap();
        manager.record_order(&order());
        manager.check_rate_limits(&order(), &portfolio, Some(&profile)).unwrap();
        manager.record_order(&order());

        let err = manager
            .check_rate_limits(&order(), &portfolio, Some(&profile))
            .unwrap_err();
        assert!(err.message().starts_with("Max order rate: 2 orders"));
        assert_eq!(manager.order_history("pf").len(), 2);
    }

    #[test]
    fn test_position_limit_uses_tracked_position() {
        let manager = RiskManager::default();
        let profile = RiskProfile::new("p", "P")
            .with_limit(RiskLimit::new(RiskLimitType::PositionSize, dec!(1500)));
        let portfolio = Portfolio::new("pf", dec!(10000000));

        manager
            .check_position_limits(&order(), &portfolio, Some(&profile))
            .unwrap();

        manager.update_position("pf", Position::new("INFY", dec!(600), dec!(140)));
        let err = manager
            .check_position_limits(&order(), &portfolio, Some(&profile))
            .unwrap_err();
        assert_eq!(
            err.message(),
            "Max position size: position size 1600 exceeds limit of 1500"
        );
    }

    #[test]
    fn test_market_order_uses_position_price() {
        let manager = RiskManager::default();
        let portfolio = Portfolio::new("pf", dec!(1000000))
            .with_position(Position::new("INFY", dec!(10), dec!(120)));
        let order = Order::market("m1", "INFY", OrderSide::Sell, dec!(10)).for_account("pf", "s", "c");

        let exposure = manager.derive_exposure(&order, &portfolio).unwrap();
        assert_eq!(exposure.order_value, dec!(1200));
        assert_eq!(exposure.projected_quantity, Decimal::ZERO);

        let unknown = Order::market("m2", "TCS", OrderSide::Buy, dec!(10)).for_account("pf", "s", "c");
        assert_eq!(
            manager.derive_exposure(&unknown, &portfolio).unwrap().order_value,
            Decimal::ZERO
        );
    }

    #[test]
    fn test_profile_store() {
        let manager = RiskManager::default();
        assert_eq!(
            manager
                .create_risk_profile(RiskProfile::new(" ", "Blank"))
                .unwrap_err()
                .code(),
            ErrorCode::InvalidParameter
        );

        manager.create_risk_profile(RiskProfile::new("a", "A")).unwrap();
        assert!(manager.create_risk_profile(RiskProfile::new("a", "A")).is_err());
        let created_at = manager.get_risk_profile("a").unwrap().created_at;

        let replacement = RiskProfile::new("a", "Renamed")
            .with_limit(RiskLimit::new(RiskLimitType::Exposure, dec!(5)));
        manager.update_risk_profile(replacement).unwrap();
        let stored = manager.get_risk_profile("a").unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.created_at, created_at);
        assert_eq!(stored.limits.len(), 1);

        assert_eq!(
            manager
                .update_risk_profile(RiskProfile::new("missing", "M"))
                .unwrap_err()
                .code(),
            ErrorCode::OrderNotFound
        );
        manager.create_risk_profile(RiskProfile::new("b", "B")).unwrap();
        let ids: Vec<_> = manager.list_risk_profiles().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        manager.delete_risk_profile("a").unwrap();
        assert!(manager.get_risk_profile("a").is_err());
    }
}
