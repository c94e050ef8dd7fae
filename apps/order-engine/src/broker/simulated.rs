//! In-process venue simulator.
//!
//! Accepts every order, issues sequential venue IDs and keeps an in-memory
//! order book. Failures and latency can be injected to exercise the
//! resilience layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::connector::{BrokerConnector, DealerOperations};
use super::types::{
    BrokerOrder, BrokerPosition, Credentials, Holding, ModifyOrder, OrderResponse, Quote, Session,
};
use crate::domain::{Order, OrderStatus};
use crate::error::{ErrorCode, ExecutionError};

const ORIGIN: &str = "SimulatedConnector";
const QUOTE_BUFFER: usize = 64;

#[derive(Debug, Default)]
struct FailurePlan {
    remaining: u32,
    error: Option<ExecutionError>,
}

/// Simulated venue connector.
#[derive(Debug)]
pub struct SimulatedConnector {
    name: String,
    client_id: String,
    dealer_enabled: bool,
    connected: AtomicBool,
    next_id: AtomicU64,
    latency_ms: AtomicU64,
    calls: AtomicUsize,
    failures: Mutex<FailurePlan>,
    session: Mutex<Option<Session>>,
    orders: Mutex<HashMap<String, BrokerOrder>>,
    positions: Mutex<Vec<BrokerPosition>>,
    holdings: Mutex<Vec<Holding>>,
    quotes: Mutex<HashMap<(String, String), Quote>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Quote>>>>,
}

impl SimulatedConnector {
    /// Create a simulator for `client_id`.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            name: format!("simulated:{client_id}"),
            client_id,
            dealer_enabled: false,
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            latency_ms: AtomicU64::new(0),
            calls: AtomicUsize::new(0),
            failures: Mutex::new(FailurePlan::default()),
            session: Mutex::new(None),
            orders: Mutex::new(HashMap::new()),
            positions: Mutex::new(Vec::new()),
            holdings: Mutex::new(Vec::new()),
            quotes: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Expose dealer operations.
    #[must_use]
    pub const fn with_dealer(mut self) -> Self {
        self.dealer_enabled = true;
        self
    }

    /// Fail the next `count` operations with `error`.
    pub fn fail_next(&self, count: u32, error: ExecutionError) {
        let mut plan = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        plan.remaining = count;
        plan.error = Some(error);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::Relaxed);
    }

    /// Operations attempted so far, failed ones included.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Returns true between `connect` and `disconnect`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Replace the reported positions.
    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        *self.positions.lock().unwrap_or_else(PoisonError::into_inner) = positions;
    }

    /// Replace the reported holdings.
    pub fn set_holdings(&self, holdings: Vec<Holding>) {
        *self.holdings.lock().unwrap_or_else(PoisonError::into_inner) = holdings;
    }

    /// Set the latest quote and push it to subscribers.
    pub fn publish_quote(&self, quote: Quote) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(senders) = subscribers.get_mut(&quote.symbol) {
            senders.retain(|tx| match tx.try_send(quote.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        drop(subscribers);
        self.quotes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((quote.exchange.clone(), quote.symbol.clone()), quote);
    }

    /// Set the status of a venue order, e.g. to simulate a fill.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` for unknown IDs.
    pub fn set_order_status(
        &self,
        broker_order_id: &str,
        status: OrderStatus,
    ) -> Result<(), ExecutionError> {
        let mut orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
        let order = orders
            .get_mut(broker_order_id)
            .ok_or_else(|| unknown_order(broker_order_id))?;
        order.status = status;
        if status == OrderStatus::Completed {
            order.filled_quantity = order.quantity;
        }
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn simulate(&self) -> Result<(), ExecutionError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let mut plan = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if plan.remaining > 0 {
            plan.remaining -= 1;
            if let Some(error) = &plan.error {
                return Err(error.clone());
            }
        }
        Ok(())
    }

    fn accept(&self, order: &Order, client_id: &str) -> OrderResponse {
        let sequence = self.next_id.fetch_add(1, Ordering::Relaxed);
        let broker_order_id = format!("SIM-{sequence:06}");
        let now = Utc::now();
        let entry = BrokerOrder {
            broker_order_id: broker_order_id.clone(),
            order_id: Some(order.id.clone()),
            client_id: client_id.to_string(),
            symbol: order.symbol.clone(),
            exchange: order.exchange.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            filled_quantity: Decimal::ZERO,
            price: order.price,
            status: OrderStatus::Submitted,
            updated_at: now,
        };
        self.orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(broker_order_id.clone(), entry);

        tracing::debug!(
            broker = %self.name,
            order_id = %order.id,
            broker_order_id = %broker_order_id,
            "Simulated order accepted"
        );
        OrderResponse {
            broker_order_id,
            order_id: Some(order.id.clone()),
            status: OrderStatus::Submitted,
            message: None,
            timestamp: now,
        }
    }

    fn update_order(
        &self,
        broker_order_id: &str,
        apply: impl FnOnce(&mut BrokerOrder) -> Result<(), ExecutionError>,
    ) -> Result<OrderResponse, ExecutionError> {
        let mut orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
        let order = orders
            .get_mut(broker_order_id)
            .ok_or_else(|| unknown_order(broker_order_id))?;
        apply(order)?;
        order.updated_at = Utc::now();
        Ok(OrderResponse {
            broker_order_id: broker_order_id.to_string(),
            order_id: order.order_id.clone(),
            status: order.status,
            message: None,
            timestamp: order.updated_at,
        })
    }

    fn orders_for(&self, client_id: &str) -> Vec<BrokerOrder> {
        let mut orders: Vec<_> = self
            .orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|order| order.client_id == client_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.broker_order_id.cmp(&b.broker_order_id));
        orders
    }
}

fn unknown_order(broker_order_id: &str) -> ExecutionError {
    ExecutionError::not_found(format!("Order not found: {broker_order_id}"), ORIGIN)
}

fn reject_if_final(order: &BrokerOrder) -> Result<(), ExecutionError> {
    if order.status.is_terminal() {
        return Err(ExecutionError::invalid_order(
            format!(
                "Order {} is already {}",
                order.broker_order_id, order.status
            ),
            ORIGIN,
        ));
    }
    Ok(())
}

#[async_trait]
impl BrokerConnector for SimulatedConnector {
    fn broker_name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), ExecutionError> {
        self.simulate().await?;
        self.connected.store(true, Ordering::Release);
        tracing::info!(broker = %self.name, "Simulated venue connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ExecutionError> {
        self.connected.store(false, Ordering::Release);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!(broker = %self.name, "Simulated venue disconnected");
        Ok(())
    }

    async fn login(&self, credentials: &Credentials) -> Result<Session, ExecutionError> {
        self.simulate().await?;
        if credentials.user_id.is_empty() || credentials.password.is_empty() {
            return Err(ExecutionError::new(
                ErrorCode::AuthenticationFailed,
                "invalid credentials",
                ORIGIN,
            ));
        }
        let session = Session {
            user_id: credentials.user_id.clone(),
            client_id: self.client_id.clone(),
            token: Uuid::new_v4().to_string(),
            expires_at: None,
        };
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(session)
    }

    async fn logout(&self) -> Result<(), ExecutionError> {
        self.simulate().await?;
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    async fn place_order(&self, order: &Order) -> Result<OrderResponse, ExecutionError> {
        self.simulate().await?;
        Ok(self.accept(order, &self.client_id))
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<OrderResponse, ExecutionError> {
        self.simulate().await?;
        self.update_order(broker_order_id, |order| {
            reject_if_final(order)?;
            order.status = OrderStatus::Cancelled;
            Ok(())
        })
    }

    async fn modify_order(&self, request: &ModifyOrder) -> Result<OrderResponse, ExecutionError> {
        self.simulate().await?;
        self.update_order(&request.broker_order_id, |order| {
            reject_if_final(order)?;
            if let Some(price) = request.price {
                order.price = Some(price);
            }
            if let Some(quantity) = request.quantity {
                order.quantity = quantity;
            }
            Ok(())
        })
    }

    async fn get_order_status(&self, broker_order_id: &str) -> Result<OrderStatus, ExecutionError> {
        self.simulate().await?;
        self.orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(broker_order_id)
            .map(|order| order.status)
            .ok_or_else(|| unknown_order(broker_order_id))
    }

    async fn get_order_book(&self) -> Result<Vec<BrokerOrder>, ExecutionError> {
        self.simulate().await?;
        Ok(self.orders_for(&self.client_id))
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, ExecutionError> {
        self.simulate().await?;
        Ok(self
            .positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn get_holdings(&self) -> Result<Vec<Holding>, ExecutionError> {
        self.simulate().await?;
        Ok(self
            .holdings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn get_quote(&self, exchange: &str, symbol: &str) -> Result<Quote, ExecutionError> {
        self.simulate().await?;
        self.quotes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(exchange.to_string(), symbol.to_string()))
            .cloned()
            .ok_or_else(|| {
                ExecutionError::invalid_parameter(
                    format!("no quote for {exchange}:{symbol}"),
                    ORIGIN,
                )
            })
    }

    async fn subscribe_quotes(
        &self,
        symbols: &[String],
    ) -> Result<mpsc::Receiver<Quote>, ExecutionError> {
        self.simulate().await?;
        let (tx, rx) = mpsc::channel(QUOTE_BUFFER);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for symbol in symbols {
            subscribers
                .entry(symbol.clone())
                .or_default()
                .push(tx.clone());
        }
        Ok(rx)
    }

    async fn unsubscribe_quotes(&self, symbols: &[String]) -> Result<(), ExecutionError> {
        self.simulate().await?;
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for symbol in symbols {
            subscribers.remove(symbol);
        }
        Ok(())
    }

    fn dealer(&self) -> Option<&dyn DealerOperations> {
        self.dealer_enabled.then_some(self as &dyn DealerOperations)
    }
}

#[async_trait]
impl DealerOperations for SimulatedConnector {
    async fn place_dealer_order(
        &self,
        client_id: &str,
        order: &Order,
    ) -> Result<OrderResponse, ExecutionError> {
        self.simulate().await?;
        Ok(self.accept(order, client_id))
    }

    async fn get_dealer_order_book(
        &self,
        client_id: &str,
    ) -> Result<Vec<BrokerOrder>, ExecutionError> {
        self.simulate().await?;
        Ok(self.orders_for(client_id))
    }

    async fn get_dealer_positions(
        &self,
        _client_id: &str,
    ) -> Result<Vec<BrokerPosition>, ExecutionError> {
        self.simulate().await?;
        Ok(self
            .positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
