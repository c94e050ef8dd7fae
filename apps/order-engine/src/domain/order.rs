//! Order and its value objects.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Metadata key holding an RFC 3339 expiry for good-till-date orders.
pub const EXPIRES_AT_KEY: &str = "expires_at";

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl OrderSide {
    /// +1 for buys, -1 for sells.
    #[must_use]
    pub const fn sign(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Execute at the best available price.
    Market,
    /// Execute at `price` or better.
    Limit,
    /// Market order armed at `trigger_price`.
    Stop,
    /// Limit order armed at `trigger_price`.
    StopLimit,
}

impl OrderType {
    /// Whether the type needs a limit price.
    #[must_use]
    pub const fn requires_price(self) -> bool {
        matches!(self, Self::Limit | Self::StopLimit)
    }

    /// Whether the type needs a trigger price.
    #[must_use]
    pub const fn requires_trigger(self) -> bool {
        matches!(self, Self::Stop | Self::StopLimit)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::Stop => write!(f, "STOP"),
            Self::StopLimit => write!(f, "STOP_LIMIT"),
        }
    }
}

/// Product type, which determines the margin requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    /// Squared off the same session.
    Intraday,
    /// Settled into holdings.
    Delivery,
    /// Carry-forward derivatives.
    Normal,
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intraday => write!(f, "INTRADAY"),
            Self::Delivery => write!(f, "DELIVERY"),
            Self::Normal => write!(f, "NORMAL"),
        }
    }
}

/// Order status as seen by order owners.
///
/// A projection of the finer-grained lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Not yet sent to a venue.
    Pending,
    /// Sent, awaiting acknowledgement.
    Submitted,
    /// Working at the venue.
    Open,
    /// Partially filled.
    Partial,
    /// Fully filled.
    Completed,
    /// Cancelled or expired.
    Cancelled,
    /// Rejected by risk or venue.
    Rejected,
    /// Failed to reach or execute at the venue.
    Failed,
}

impl OrderStatus {
    /// Returns true if the order is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Rejected | Self::Failed
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Open => "OPEN",
            Self::Partial => "PARTIAL",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// A client order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Order ID.
    pub id: String,
    /// Owning portfolio.
    pub portfolio_id: String,
    /// Originating strategy.
    pub strategy_id: String,
    /// Broker client the order is routed through.
    pub client_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Exchange segment.
    pub exchange: String,
    /// Order type.
    pub order_type: OrderType,
    /// Product type.
    pub product_type: ProductType,
    /// Side.
    pub side: OrderSide,
    /// Quantity (always positive).
    pub quantity: Decimal,
    /// Limit price; `None` for market orders.
    pub price: Option<Decimal>,
    /// Trigger price for stop orders.
    pub trigger_price: Option<Decimal>,
    /// Parent order for dependent orders.
    pub parent_order_id: Option<String>,
    /// Current status.
    pub status: OrderStatus,
    /// Free-form attributes such as `expires_at`.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a pending limit order.
    #[must_use]
    pub fn limit(
        id: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            portfolio_id: String::new(),
            strategy_id: String::new(),
            client_id: String::new(),
            symbol: symbol.into(),
            exchange: "NSE".to_string(),
            order_type: OrderType::Limit,
            product_type: ProductType::Intraday,
            side,
            quantity,
            price: Some(price),
            trigger_price: None,
            parent_order_id: None,
            status: OrderStatus::Pending,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a pending market order.
    #[must_use]
    pub fn market(
        id: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
    ) -> Self {
        let mut order = Self::limit(id, symbol, side, quantity, Decimal::ZERO);
        order.order_type = OrderType::Market;
        order.price = None;
        order
    }

    /// Set the portfolio, strategy and routing client.
    #[must_use]
    pub fn for_account(
        mut self,
        portfolio_id: impl Into<String>,
        strategy_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        self.portfolio_id = portfolio_id.into();
        self.strategy_id = strategy_id.into();
        self.client_id = client_id.into();
        self
    }

    /// Set the product type.
    #[must_use]
    pub const fn with_product(mut self, product_type: ProductType) -> Self {
        self.product_type = product_type;
        self
    }

    /// Set the parent order.
    #[must_use]
    pub fn with_parent(mut self, parent_order_id: impl Into<String>) -> Self {
        self.parent_order_id = Some(parent_order_id.into());
        self
    }

    /// Mark as good-till-date.
    #[must_use]
    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.metadata.insert(EXPIRES_AT_KEY.to_string(), at.to_rfc3339());
        self
    }

    /// Parsed GTD expiry, if present and well-formed.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get(EXPIRES_AT_KEY)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc))
    }

    /// Signed quantity (negative for sells).
    #[must_use]
    pub fn signed_quantity(&self) -> Decimal {
        self.quantity * self.side.sign()
    }

    /// Notional value at `price`, or at `reference_price` for market orders.
    ///
    /// Returns zero when no price is known, and `None` if the product does
    /// not fit in a `Decimal`.
    #[must_use]
    pub fn notional(&self, reference_price: Option<Decimal>) -> Option<Decimal> {
        self.price
            .or(reference_price)
            .or(self.trigger_price)
            .map_or(Some(Decimal::ZERO), |price| price.checked_mul(self.quantity))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_notional_uses_limit_price() {
        let order = Order::limit("o1", "INFY", OrderSide::Buy, dec!(1000), dec!(150.0));
        assert_eq!(order.notional(None), Some(dec!(150000)));
    }

    #[test]
    fn test_notional_overflow_is_none() {
        let order = Order::limit("o1", "INFY", OrderSide::Buy, dec!(2), Decimal::MAX);
        assert_eq!(order.notional(None), None);
    }

    #[test]
    fn test_market_notional_uses_reference() {
        let order = Order::market("o1", "INFY", OrderSide::Sell, dec!(10));
        assert_eq!(order.notional(None), Some(Decimal::ZERO));
        assert_eq!(order.notional(Some(dec!(20))), Some(dec!(200)));
        assert_eq!(order.signed_quantity(), dec!(-10));
    }

    #[test]
    fn test_expiry_round_trips_through_metadata() {
        let at = Utc::now() + Duration::hours(1);
        let order = Order::limit("o1", "INFY", OrderSide::Buy, dec!(1), dec!(1)).expiring_at(at);
        let parsed = order.expires_at().unwrap();
        assert_eq!(parsed.timestamp(), at.timestamp());
    }

    #[test]
    fn test_malformed_expiry_is_ignored() {
        let mut order = Order::limit("o1", "INFY", OrderSide::Buy, dec!(1), dec!(1));
        order
            .metadata
            .insert(EXPIRES_AT_KEY.to_string(), "tomorrow".to_string());
        assert!(order.expires_at().is_none());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&OrderStatus::Partial).unwrap();
        assert_eq!(json, "\"PARTIAL\"");
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
    }

    #[test]
    fn test_order_type_requirements() {
        assert!(OrderType::StopLimit.requires_price());
        assert!(OrderType::StopLimit.requires_trigger());
        assert!(!OrderType::Market.requires_price());
    }
}
