//! Individual limit checks.
//!
//! Each check compares one derived quantity against one limit and returns the
//! breach detail, or `None` when the order is within the limit.

use rust_decimal::Decimal;

use super::profile::{RiskLimit, RiskLimitType};
use crate::domain::Portfolio;

const GROSS_OVERFLOW: &str = "gross exposure overflows";

/// Quantities derived from an order and the account it trades in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderExposure {
    /// Notional of the order.
    pub order_value: Decimal,
    /// Signed position after the order fills.
    pub projected_quantity: Decimal,
    /// Absolute value of the projected position.
    pub projected_position_value: Decimal,
    /// Margin the order would block.
    pub margin_required: Decimal,
    /// Orders recorded for the portfolio within the rate window.
    pub recent_orders: usize,
    /// Length of the rate window in seconds.
    pub rate_window_secs: u64,
}

/// Evaluate `limit` against the order.
#[must_use]
pub fn evaluate(
    limit: &RiskLimit,
    exposure: &OrderExposure,
    portfolio: &Portfolio,
) -> Option<String> {
    let threshold = limit.value.normalize();
    match limit.limit_type {
        RiskLimitType::OrderValue => (exposure.order_value > limit.value).then(|| {
            format!(
                "order value {} exceeds limit of {threshold}",
                exposure.order_value.normalize()
            )
        }),
        RiskLimitType::Leverage => {
            let Some(gross) = gross_exposure(portfolio, exposure) else {
                return Some(GROSS_OVERFLOW.to_string());
            };
            let Some(leverage) = ratio(gross, portfolio.equity) else {
                return Some(format!(
                    "leverage undefined with equity {}",
                    portfolio.equity.normalize()
                ));
            };
            (leverage > limit.value).then(|| {
                format!(
                    "leverage {}x exceeds limit of {threshold}x",
                    leverage.round_dp(2).normalize()
                )
            })
        }
        RiskLimitType::Drawdown => (portfolio.drawdown > limit.value).then(|| {
            format!(
                "drawdown {} exceeds limit of {threshold}",
                portfolio.drawdown.normalize()
            )
        }),
        RiskLimitType::PositionSize => {
            let size = exposure.projected_quantity.abs();
            (size > limit.value).then(|| {
                format!(
                    "position size {} exceeds limit of {threshold}",
                    size.normalize()
                )
            })
        }
        RiskLimitType::Exposure => {
            let Some(gross) = gross_exposure(portfolio, exposure) else {
                return Some(GROSS_OVERFLOW.to_string());
            };
            (gross > limit.value).then(|| {
                format!(
                    "gross exposure {} exceeds limit of {threshold}",
                    gross.normalize()
                )
            })
        }
        RiskLimitType::Concentration => {
            let Some(share) = ratio(exposure.projected_position_value, portfolio.equity) else {
                return Some(format!(
                    "concentration undefined with equity {}",
                    portfolio.equity.normalize()
                ));
            };
            (share > limit.value).then(|| {
                format!(
                    "concentration {} exceeds limit of {threshold}",
                    share.round_dp(4).normalize()
                )
            })
        }
        RiskLimitType::Margin => {
            // an allowance too large to represent cannot be exceeded
            let allowed = portfolio.available_margin.checked_mul(limit.value);
            allowed.is_some_and(|allowed| exposure.margin_required > allowed).then(|| {
                format!(
                    "margin required {} exceeds {threshold} of available margin {}",
                    exposure.margin_required.normalize(),
                    portfolio.available_margin.normalize()
                )
            })
        }
        RiskLimitType::OrderRate => {
            let count = Decimal::from(exposure.recent_orders);
            (count >= limit.value).then(|| {
                format!(
                    "{count} orders in the last {}s reaches limit of {threshold}",
                    exposure.rate_window_secs
                )
            })
        }
    }
}

/// `numerator / denominator`, or `None` when the denominator is not positive
/// or the quotient does not fit.
fn ratio(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    if denominator > Decimal::ZERO {
        numerator.checked_div(denominator)
    } else {
        None
    }
}

fn gross_exposure(portfolio: &Portfolio, exposure: &OrderExposure) -> Option<Decimal> {
    portfolio.gross_exposure.checked_add(exposure.order_value)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use test_case::test_case;

    use super::*;

    fn portfolio() -> Portfolio {
        let mut portfolio = Portfolio::new("pf", dec!(100000));
        portfolio.gross_exposure = dec!(50000);
        portfolio.available_margin = dec!(40000);
        portfolio.drawdown = dec!(0.05);
        portfolio
    }

    fn exposure() -> OrderExposure {
        OrderExposure {
            order_value: dec!(150000),
            projected_quantity: dec!(1000),
            projected_position_value: dec!(150000),
            margin_required: dec!(30000),
            recent_orders: 3,
            rate_window_secs: 60,
        }
    }

    #[test]
    fn test_order_value_message() {
        let limit = RiskLimit::new(RiskLimitType::OrderValue, dec!(10000));
        let detail = evaluate(&limit, &exposure(), &portfolio()).unwrap();
        assert_eq!(detail, "order value 150000 exceeds limit of 10000");
    }

    #[test_case(RiskLimitType::OrderValue, dec!(200000), false ; "order value under")]
    #[test_case(RiskLimitType::Leverage, dec!(2), false ; "leverage exactly at limit")]
    #[test_case(RiskLimitType::Leverage, dec!(1.5), true ; "leverage over")]
    #[test_case(RiskLimitType::Drawdown, dec!(0.04), true ; "drawdown over")]
    #[test_case(RiskLimitType::PositionSize, dec!(1000), false ; "position at limit")]
    #[test_case(RiskLimitType::Exposure, dec!(150000), true ; "exposure over")]
    #[test_case(RiskLimitType::Concentration, dec!(1.5), false ; "concentration at limit")]
    #[test_case(RiskLimitType::Margin, dec!(0.5), true ; "margin over half available")]
    #[test_case(RiskLimitType::Margin, dec!(1), false ; "margin within available")]
    #[test_case(RiskLimitType::OrderRate, dec!(3), true ; "rate reaches limit")]
    #[test_case(RiskLimitType::OrderRate, dec!(4), false ; "rate under")]
    fn test_limit_boundaries(limit_type: RiskLimitType, value: Decimal, breached: bool) {
        let limit = RiskLimit::new(limit_type, value);
        assert_eq!(
            evaluate(&limit, &exposure(), &portfolio()).is_some(),
            breached
        );
    }

    #[test]
    fn test_overflowing_gross_exposure_breaches() {
        let mut portfolio = portfolio();
        portfolio.gross_exposure = Decimal::MAX;
        for limit_type in [RiskLimitType::Leverage, RiskLimitType::Exposure] {
            let limit = RiskLimit::new(limit_type, Decimal::MAX);
            let detail = evaluate(&limit, &exposure(), &portfolio).unwrap();
            assert_eq!(detail, "gross exposure overflows");
        }

        portfolio.available_margin = Decimal::MAX;
        let margin = RiskLimit::new(RiskLimitType::Margin, dec!(2));
        assert!(evaluate(&margin, &exposure(), &portfolio).is_none());
    }

    #[test]
    fn test_zero_equity_breaches_ratio_limits() {
        let portfolio = Portfolio::new("pf", Decimal::ZERO);
        for limit_type in [RiskLimitType::Leverage, RiskLimitType::Concentration] {
            let limit = RiskLimit::new(limit_type, dec!(100));
            assert!(evaluate(&limit, &exposure(), &portfolio).is_some());
        }
    }
}
