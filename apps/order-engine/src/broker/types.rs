//! Broker-facing request and response types.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{OrderSide, OrderStatus, OrderType, ProductType};

/// Supported venue integrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerKind {
    /// XTS dealer terminal.
    XtsPro,
    /// XTS retail client.
    XtsClient,
    /// Zerodha Kite.
    Zerodha,
    /// In-process simulator.
    Simulated,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::XtsPro => write!(f, "XTS_PRO"),
            Self::XtsClient => write!(f, "XTS_CLIENT"),
            Self::Zerodha => write!(f, "ZERODHA"),
            Self::Simulated => write!(f, "SIMULATED"),
        }
    }
}

/// Connection settings for one broker client.
#[derive(Clone, Deserialize)]
pub struct BrokerConfig {
    /// Routing identity.
    pub client_id: String,
    /// Venue integration.
    pub kind: BrokerKind,
    /// API key.
    #[serde(default)]
    pub api_key: String,
    /// API secret.
    #[serde(default)]
    pub api_secret: String,
    /// Venue base URL.
    #[serde(default)]
    pub base_url: String,
    /// User the client logs in as by default.
    #[serde(default)]
    pub user_id: Option<String>,
}

impl BrokerConfig {
    /// Create a config with empty credentials.
    #[must_use]
    pub fn new(client_id: impl Into<String>, kind: BrokerKind) -> Self {
        Self {
            client_id: client_id.into(),
            kind,
            api_key: String::new(),
            api_secret: String::new(),
            base_url: String::new(),
            user_id: None,
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("client_id", &self.client_id)
            .field("kind", &self.kind)
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Login credentials.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// Venue user ID.
    pub user_id: String,
    /// Password or API secret.
    pub password: String,
    /// One-time code, when the venue requires one.
    #[serde(default)]
    pub totp: Option<String>,
}

impl Credentials {
    /// Create credentials without a one-time code.
    #[must_use]
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
            totp: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("password", &"[REDACTED]")
            .field("totp", &self.totp.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Authenticated venue session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// User the session belongs to.
    pub user_id: String,
    /// Client the session was opened on.
    pub client_id: String,
    /// Venue session token.
    pub token: String,
    /// Token expiry, if the venue reports one.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Venue reply to a placement, modification or cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResponse {
    /// Venue order ID.
    pub broker_order_id: String,
    /// Engine order ID, when known.
    pub order_id: Option<String>,
    /// Status reported by the venue.
    pub status: OrderStatus,
    /// Venue message.
    pub message: Option<String>,
    /// Reply time.
    pub timestamp: DateTime<Utc>,
}

/// Changes to a working order. `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyOrder {
    /// Venue order ID.
    pub broker_order_id: String,
    /// New limit price.
    pub price: Option<Decimal>,
    /// New quantity.
    pub quantity: Option<Decimal>,
    /// New trigger price.
    pub trigger_price: Option<Decimal>,
}

/// Order as reported in a venue order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerOrder {
    /// Venue order ID.
    pub broker_order_id: String,
    /// Engine order ID, when known.
    pub order_id: Option<String>,
    /// Client the order belongs to.
    pub client_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Exchange segment.
    pub exchange: String,
    /// Side.
    pub side: OrderSide,
    /// Order type.
    pub order_type: OrderType,
    /// Ordered quantity.
    pub quantity: Decimal,
    /// Filled quantity.
    pub filled_quantity: Decimal,
    /// Limit price.
    pub price: Option<Decimal>,
    /// Status.
    pub status: OrderStatus,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Venue position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerPosition {
    /// Instrument symbol.
    pub symbol: String,
    /// Exchange segment.
    pub exchange: String,
    /// Product type.
    pub product_type: ProductType,
    /// Signed net quantity.
    pub quantity: Decimal,
    /// Average price.
    pub average_price: Decimal,
    /// Realised plus unrealised P&L.
    pub pnl: Decimal,
}

/// Settled holding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    /// Instrument symbol.
    pub symbol: String,
    /// Exchange segment.
    pub exchange: String,
    /// Quantity held.
    pub quantity: Decimal,
    /// Average cost.
    pub average_price: Decimal,
    /// Last traded price.
    pub last_price: Decimal,
}

/// Top-of-book quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Exchange segment.
    pub exchange: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Last traded price.
    pub last_price: Decimal,
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
    /// Session volume.
    pub volume: Decimal,
    /// Quote time.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_redacted() {
        let mut config = BrokerConfig::new("c1", BrokerKind::Zerodha);
        config.api_secret = "hunter2".to_string();
        let credentials = Credentials::new("u1", "hunter2");

        assert!(!format!("{config:?}").contains("hunter2"));
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }

    #[test]
    fn test_kind_wire_names() {
        let kind: BrokerKind = serde_json::from_str("\"XTS_PRO\"").unwrap();
        assert_eq!(kind, BrokerKind::XtsPro);
        assert_eq!(BrokerKind::XtsClient.to_string(), "XTS_CLIENT");
    }
}
