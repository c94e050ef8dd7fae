//! Portfolio, position and strategy snapshots used by risk validation.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Net position in one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Instrument symbol.
    pub symbol: String,
    /// Signed quantity (negative when short).
    pub quantity: Decimal,
    /// Average entry price.
    pub average_price: Decimal,
}

impl Position {
    /// Create a position.
    #[must_use]
    pub fn new(symbol: impl Into<String>, quantity: Decimal, average_price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            average_price,
        }
    }

    /// Absolute market value at the average price, saturating at `Decimal::MAX`.
    #[must_use]
    pub fn market_value(&self) -> Decimal {
        self.quantity.saturating_mul(self.average_price).abs()
    }
}

/// Account snapshot supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portfolio {
    /// Portfolio ID.
    pub id: String,
    /// Net liquidation value.
    pub equity: Decimal,
    /// Margin still available for new orders.
    pub available_margin: Decimal,
    /// Sum of absolute position values.
    pub gross_exposure: Decimal,
    /// Current drawdown from peak, as a fraction.
    pub drawdown: Decimal,
    /// Positions keyed by symbol.
    #[serde(default)]
    pub positions: HashMap<String, Position>,
}

impl Portfolio {
    /// Create a flat portfolio with `equity` fully available as margin.
    #[must_use]
    pub fn new(id: impl Into<String>, equity: Decimal) -> Self {
        Self {
            id: id.into(),
            equity,
            available_margin: equity,
            gross_exposure: Decimal::ZERO,
            drawdown: Decimal::ZERO,
            positions: HashMap::new(),
        }
    }

    /// Add a position and its value to gross exposure.
    #[must_use]
    pub fn with_position(mut self, position: Position) -> Self {
        self.gross_exposure = self.gross_exposure.saturating_add(position.market_value());
        self.positions.insert(position.symbol.clone(), position);
        self
    }
}

/// Strategy that originated an order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Strategy {
    /// Strategy ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Risk profile the strategy's orders are validated against.
    pub risk_profile_id: Option<String>,
}

impl Strategy {
    /// Create a strategy bound to a risk profile.
    #[must_use]
    pub fn with_profile(id: impl Into<String>, risk_profile_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            risk_profile_id: Some(risk_profile_id.into()),
        }
    }
}
