//! Venue connector seam.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{
    BrokerOrder, BrokerPosition, Credentials, Holding, ModifyOrder, OrderResponse, Quote, Session,
};
use crate::domain::{Order, OrderStatus};
use crate::error::ExecutionError;

/// Trading operations against one brokerage venue.
///
/// Constructing a connector must not perform I/O; [`connect`](Self::connect)
/// does that.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Venue name used in logs and metrics.
    fn broker_name(&self) -> &str;

    /// Open the venue connection.
    async fn connect(&self) -> Result<(), ExecutionError>;

    /// Close the venue connection.
    async fn disconnect(&self) -> Result<(), ExecutionError>;

    /// Authenticate and open a session.
    async fn login(&self, credentials: &Credentials) -> Result<Session, ExecutionError>;

    /// Close the current session.
    async fn logout(&self) -> Result<(), ExecutionError>;

    /// Place an order.
    async fn place_order(&self, order: &Order) -> Result<OrderResponse, ExecutionError>;

    /// Cancel a working order.
    async fn cancel_order(&self, broker_order_id: &str) -> Result<OrderResponse, ExecutionError>;

    /// Modify a working order.
    async fn modify_order(&self, request: &ModifyOrder) -> Result<OrderResponse, ExecutionError>;

    /// Status of a venue order.
    async fn get_order_status(&self, broker_order_id: &str) -> Result<OrderStatus, ExecutionError>;

    /// Orders for the logged-in client.
    async fn get_order_book(&self) -> Result<Vec<BrokerOrder>, ExecutionError>;

    /// Open positions.
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, ExecutionError>;

    /// Settled holdings.
    async fn get_holdings(&self) -> Result<Vec<Holding>, ExecutionError>;

    /// Latest quote for a symbol.
    async fn get_quote(&self, exchange: &str, symbol: &str) -> Result<Quote, ExecutionError>;

    /// Stream quotes for `symbols`.
    async fn subscribe_quotes(
        &self,
        symbols: &[String],
    ) -> Result<mpsc::Receiver<Quote>, ExecutionError>;

    /// Stop streaming quotes for `symbols`.
    async fn unsubscribe_quotes(&self, symbols: &[String]) -> Result<(), ExecutionError>;

    /// Dealer capability, for venues that trade on behalf of other clients.
    fn dealer(&self) -> Option<&dyn DealerOperations> {
        None
    }
}

/// Operations a dealer terminal performs for another client.
#[async_trait]
pub trait DealerOperations: Send + Sync {
    /// Place an order for `client_id`.
    async fn place_dealer_order(
        &self,
        client_id: &str,
        order: &Order,
    ) -> Result<OrderResponse, ExecutionError>;

    /// Order book of `client_id`.
    async fn get_dealer_order_book(&self, client_id: &str)
    -> Result<Vec<BrokerOrder>, ExecutionError>;

    /// Positions of `client_id`.
    async fn get_dealer_positions(
        &self,
        client_id: &str,
    ) -> Result<Vec<BrokerPosition>, ExecutionError>;
}
