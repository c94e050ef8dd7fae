//! Broker router and connector pool.
//!
//! Maps client IDs to lazily built connectors and users to the client their
//! session lives on. Every venue call goes through the destination's circuit
//! breaker and then the error classifier; the caller gets a [`RouteFailure`]
//! carrying the retry decision and decides whether to resubmit.
//!
//! # Example
//!
//! ```rust,ignore
//! let router = BrokerRouter::new(factory, breakers, classifier, shutdown.clone());
//! router.register_broker("client-1", Some(config))?;
//! router.login("client-1", &credentials).await?;
//!
//! match router.place_order("user-1", &order).await {
//!     Ok(response) => println!("placed {}", response.broker_order_id),
//!     Err(failure) if failure.should_retry => sleep(failure.delay.unwrap_or_default()).await,
//!     Err(failure) => return Err(failure.error),
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connector::BrokerConnector;
use super::factory::ConnectorFactory;
use super::types::{
    BrokerConfig, BrokerOrder, BrokerPosition, Credentials, Holding, ModifyOrder, OrderResponse,
    Quote, Session,
};
use crate::domain::{Order, OrderStatus};
use crate::error::{ErrorCode, ExecutionError};
use crate::observability;
use crate::resilience::{CircuitBreakerRegistry, ErrorClassifier, RetryDecision};

const ORIGIN: &str = "BrokerRouter";

/// A routed call that did not succeed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct RouteFailure {
    /// Classified error.
    pub error: ExecutionError,
    /// Whether the caller should resubmit.
    pub should_retry: bool,
    /// Suggested wait before resubmitting.
    pub delay: Option<Duration>,
}

impl From<RetryDecision> for RouteFailure {
    fn from(decision: RetryDecision) -> Self {
        Self {
            error: decision.error,
            should_retry: decision.should_retry,
            delay: decision.delay,
        }
    }
}

impl From<RouteFailure> for ExecutionError {
    fn from(failure: RouteFailure) -> Self {
        failure.error
    }
}

/// Routes operations to per-client venue connectors.
pub struct BrokerRouter {
    factory: Arc<dyn ConnectorFactory>,
    configs: RwLock<HashMap<String, BrokerConfig>>,
    clients: RwLock<HashMap<String, Arc<dyn BrokerConnector>>>,
    /// User ID to client ID.
    sessions: RwLock<HashMap<String, String>>,
    breakers: Arc<CircuitBreakerRegistry>,
    classifier: Arc<ErrorClassifier>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for BrokerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRouter")
            .field("clients", &self.cached_clients())
            .field("sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

impl BrokerRouter {
    /// Create a router. Calls in flight are cancelled when `shutdown` fires.
    #[must_use]
    pub fn new(
        factory: Arc<dyn ConnectorFactory>,
        breakers: Arc<CircuitBreakerRegistry>,
        classifier: Arc<ErrorClassifier>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            factory,
            configs: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            breakers,
            classifier,
            shutdown,
        }
    }

    /// Circuit breakers used for each client.
    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    // =========================================================================
    // Registration and connector pool
    // =========================================================================

    /// Register or replace the configuration for `client_id`.
    ///
    /// Replacing a configuration evicts the cached connector.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty client ID or a missing config.
    pub fn register_broker(
        &self,
        client_id: &str,
        config: Option<BrokerConfig>,
    ) -> Result<(), ExecutionError> {
        if client_id.trim().is_empty() {
            return Err(ExecutionError::invalid_parameter("client ID is required", ORIGIN));
        }
        let Some(config) = config else {
            return Err(ExecutionError::invalid_parameter(
                "broker configuration is required",
                ORIGIN,
            ));
        };

        let kind = config.kind;
        let replaced = self
            .configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id.to_string(), config)
            .is_some();
        if replaced {
            self.clients
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(client_id);
        }
        tracing::info!(client_id, kind = %kind, replaced, "Broker registered");
        Ok(())
    }

    /// Connector for `client_id`, built on first use.
    ///
    /// Concurrent first calls build the connector exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not registered or the factory fails.
    pub fn get_broker_client(
        &self,
        client_id: &str,
    ) -> Result<Arc<dyn BrokerConnector>, ExecutionError> {
        if let Some(client) = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
        {
            return Ok(Arc::clone(client));
        }

        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(client_id) {
            return Ok(Arc::clone(client));
        }

        let config = self
            .configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .cloned()
            .ok_or_else(|| {
                ExecutionError::invalid_parameter(
                    format!("no configuration found for client ID: {client_id}"),
                    ORIGIN,
                )
            })?;

        let client = self.factory.create(&config).map_err(|cause| {
            ExecutionError::new(
                ErrorCode::InternalError,
                format!("failed to create broker client: {}", cause.message()),
                ORIGIN,
            )
            .with_cause(cause)
        })?;
        clients.insert(client_id.to_string(), Arc::clone(&client));
        drop(clients);

        tracing::info!(client_id, broker = client.broker_name(), "Broker client created");
        Ok(client)
    }

    /// Number of built connectors.
    #[must_use]
    pub fn cached_clients(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Connect every registered client concurrently, building connectors as
    /// needed.
    ///
    /// Returns the client IDs that failed to connect.
    pub async fn connect_all(&self) -> Vec<(String, ExecutionError)> {
        let mut client_ids: Vec<String> = self
            .configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        client_ids.sort();

        let attempts = client_ids.iter().map(|client_id| async move {
            let result = self
                .execute(client_id, "connect", |client| async move { client.connect().await })
                .await;
            (client_id, result)
        });

        let mut failed = Vec::new();
        for (client_id, result) in join_all(attempts).await {
            if let Err(failure) = result {
                tracing::error!(client_id = %client_id, error = %failure.error, "Broker connect failed");
                failed.push((client_id.clone(), failure.error));
            }
        }
        failed
    }

    /// Disconnect every built connector and drop all sessions.
    pub async fn disconnect_all(&self) {
        let clients: Vec<(String, Arc<dyn BrokerConnector>)> = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, client)| (id.clone(), Arc::clone(client)))
            .collect();

        for (client_id, client) in clients {
            if let Err(e) = client.disconnect().await {
                tracing::warn!(client_id = %client_id, error = %e, "Broker disconnect failed");
            }
        }
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!("All broker clients disconnected");
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Log in on `client_id` and remember the session's user.
    ///
    /// # Errors
    ///
    /// Returns the classified failure from the connector.
    pub async fn login(
        &self,
        client_id: &str,
        credentials: &Credentials,
    ) -> Result<Session, RouteFailure> {
        let credentials = credentials.clone();
        let session = self
            .execute(client_id, "login", |client| async move {
                client.login(&credentials).await
            })
            .await?;

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.user_id.clone(), client_id.to_string());
        tracing::info!(client_id, user_id = %session.user_id, "Session opened");
        Ok(session)
    }

    /// Log out of `client_id` and forget every session on it.
    ///
    /// # Errors
    ///
    /// Returns the classified failure from the connector.
    pub async fn logout(&self, client_id: &str) -> Result<(), RouteFailure> {
        self.execute(client_id, "logout", |client| async move { client.logout().await })
            .await?;

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, client| client != client_id);
        tracing::info!(client_id, "Session closed");
        Ok(())
    }

    /// Client the user's session lives on.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty user ID or no session.
    pub fn get_client_id_for_user(&self, user_id: &str) -> Result<String, ExecutionError> {
        if user_id.trim().is_empty() {
            return Err(ExecutionError::invalid_parameter("user ID is required", ORIGIN));
        }
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
            .ok_or_else(|| {
                ExecutionError::invalid_parameter(
                    format!("no active session found for user ID: {user_id}"),
                    ORIGIN,
                )
            })
    }

    /// Number of live user sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // =========================================================================
    // User-scoped trading operations
    // =========================================================================

    /// Place `order` on the user's client.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    pub async fn place_order(
        &self,
        user_id: &str,
        order: &Order,
    ) -> Result<OrderResponse, RouteFailure> {
        let client_id = self.resolve_user(user_id, "place_order")?;
        let started = Instant::now();
        let result = self
            .execute_scoped(&client_id, "place_order", Some(&order.id), |client| async move {
                client.place_order(order).await
            })
            .await;
        observability::record_order_submission(
            &client_id,
            if result.is_ok() { "accepted" } else { "failed" },
            started.elapsed().as_secs_f64(),
        );
        result
    }

    /// Modify a working order on the user's client.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    pub async fn modify_order(
        &self,
        user_id: &str,
        request: &ModifyOrder,
    ) -> Result<OrderResponse, RouteFailure> {
        let client_id = self.resolve_user(user_id, "modify_order")?;
        let request = request.clone();
        self.execute(&client_id, "modify_order", |client| async move {
            client.modify_order(&request).await
        })
        .await
    }

    /// Cancel a working order on the user's client.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    pub async fn cancel_order(
        &self,
        user_id: &str,
        broker_order_id: &str,
    ) -> Result<OrderResponse, RouteFailure> {
        let client_id = self.resolve_user(user_id, "cancel_order")?;
        let broker_order_id = broker_order_id.to_string();
        self.execute(&client_id, "cancel_order", |client| async move {
            client.cancel_order(&broker_order_id).await
        })
        .await
    }

    /// Status of a venue order on the user's client.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    pub async fn get_order_status(
        &self,
        user_id: &str,
        broker_order_id: &str,
    ) -> Result<OrderStatus, RouteFailure> {
        let client_id = self.resolve_user(user_id, "get_order_status")?;
        let broker_order_id = broker_order_id.to_string();
        self.execute(&client_id, "get_order_status", |client| async move {
            client.get_order_status(&broker_order_id).await
        })
        .await
    }

    /// Order book of the user's client.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    pub async fn get_order_book(&self, user_id: &str) -> Result<Vec<BrokerOrder>, RouteFailure> {
        let client_id = self.resolve_user(user_id, "get_order_book")?;
        self.execute(&client_id, "get_order_book", |client| async move {
            client.get_order_book().await
        })
        .await
    }

    /// Positions of the user's client.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    pub async fn get_positions(&self, user_id: &str) -> Result<Vec<BrokerPosition>, RouteFailure> {
        let client_id = self.resolve_user(user_id, "get_positions")?;
        self.execute(&client_id, "get_positions", |client| async move {
            client.get_positions().await
        })
        .await
    }

    /// Holdings of the user's client.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    pub async fn get_holdings(&self, user_id: &str) -> Result<Vec<Holding>, RouteFailure> {
        let client_id = self.resolve_user(user_id, "get_holdings")?;
        self.execute(&client_id, "get_holdings", |client| async move {
            client.get_holdings().await
        })
        .await
    }

    /// Latest quote through the user's client.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    pub async fn get_quote(
        &self,
        user_id: &str,
        exchange: &str,
        symbol: &str,
    ) -> Result<Quote, RouteFailure> {
        let client_id = self.resolve_user(user_id, "get_quote")?;
        let (exchange, symbol) = (exchange.to_string(), symbol.to_string());
        self.execute(&client_id, "get_quote", |client| async move {
            client.get_quote(&exchange, &symbol).await
        })
        .await
    }

    /// Stream quotes through the user's client.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    pub async fn subscribe_quotes(
        &self,
        user_id: &str,
        symbols: &[String],
    ) -> Result<mpsc::Receiver<Quote>, RouteFailure> {
        let client_id = self.resolve_user(user_id, "subscribe_quotes")?;
        let symbols = symbols.to_vec();
        self.execute(&client_id, "subscribe_quotes", |client| async move {
            client.subscribe_quotes(&symbols).await
        })
        .await
    }

    /// Stop streaming quotes through the user's client.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    pub async fn unsubscribe_quotes(
        &self,
        user_id: &str,
        symbols: &[String],
    ) -> Result<(), RouteFailure> {
        let client_id = self.resolve_user(user_id, "unsubscribe_quotes")?;
        let symbols = symbols.to_vec();
        self.execute(&client_id, "unsubscribe_quotes", |client| async move {
            client.unsubscribe_quotes(&symbols).await
        })
        .await
    }

    // =========================================================================
    // Dealer operations
    // =========================================================================

    /// Place `order` for `target_client_id` through the user's dealer client.
    ///
    /// Falls back to a regular placement when the venue has no dealer
    /// capability.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    pub async fn place_dealer_order(
        &self,
        user_id: &str,
        target_client_id: &str,
        order: &Order,
    ) -> Result<OrderResponse, RouteFailure> {
        let client_id = self.resolve_user(user_id, "place_dealer_order")?;
        let mut order = order.clone();
        let order_id = order.id.clone();
        let target = target_client_id.to_string();
        let fallback_client = client_id.clone();

        self.execute_scoped(&client_id, "place_dealer_order", Some(&order_id), |client| async move {
            if let Some(dealer) = client.dealer() {
                return dealer.place_dealer_order(&target, &order).await;
            }
            tracing::warn!(
                client_id = %fallback_client,
                target_client_id = %target,
                order_id = %order.id,
                fallback = true,
                "Dealer operations not supported, placing regular order"
            );
            observability::record_dealer_fallback(&fallback_client);
            order.client_id = target;
            client.place_order(&order).await
        })
        .await
    }

    /// Order book of `target_client_id` through the user's dealer client.
    ///
    /// # Errors
    ///
    /// Fails if the venue has no dealer capability, otherwise returns the
    /// classified failure.
    pub async fn get_dealer_order_book(
        &self,
        user_id: &str,
        target_client_id: &str,
    ) -> Result<Vec<BrokerOrder>, RouteFailure> {
        let client_id = self.resolve_user(user_id, "get_dealer_order_book")?;
        let target = target_client_id.to_string();
        self.execute(&client_id, "get_dealer_order_book", |client| async move {
            match client.dealer() {
                Some(dealer) => dealer.get_dealer_order_book(&target).await,
                None => Err(dealer_unsupported()),
            }
        })
        .await
    }

    /// Positions of `target_client_id` through the user's dealer client.
    ///
    /// # Errors
    ///
    /// Fails if the venue has no dealer capability, otherwise returns the
    /// classified failure.
    pub async fn get_dealer_positions(
        &self,
        user_id: &str,
        target_client_id: &str,
    ) -> Result<Vec<BrokerPosition>, RouteFailure> {
        let client_id = self.resolve_user(user_id, "get_dealer_positions")?;
        let target = target_client_id.to_string();
        self.execute(&client_id, "get_dealer_positions", |client| async move {
            match client.dealer() {
                Some(dealer) => dealer.get_dealer_positions(&target).await,
                None => Err(dealer_unsupported()),
            }
        })
        .await
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    /// Drop the retry budget of `operation` for `order_id` on `user_id`'s
    /// client once the caller stops retrying.
    pub fn release_retry_budget(&self, user_id: &str, operation: &str, order_id: &str) {
        if let Ok(client_id) = self.get_client_id_for_user(user_id) {
            self.classifier
                .release(&retry_context(&client_id, operation, Some(order_id)));
        }
    }

    fn resolve_user(&self, user_id: &str, operation: &str) -> Result<String, RouteFailure> {
        self.get_client_id_for_user(user_id).map_err(|err| {
            let decision = self
                .classifier
                .handle_error(&format!("broker:user:{user_id}:{operation}"), &err);
            RouteFailure::from(decision)
        })
    }

    async fn execute<T, F, Fut>(
        &self,
        client_id: &str,
        operation: &'static str,
        op: F,
    ) -> Result<T, RouteFailure>
    where
        F: FnOnce(Arc<dyn BrokerConnector>) -> Fut,
        Fut: Future<Output = Result<T, ExecutionError>>,
    {
        self.execute_scoped(client_id, operation, None, op).await
    }

    /// Run `op` against `client_id`'s connector under its breaker, then
    /// classify any failure.
    ///
    /// Retry budgets are tracked per client and operation, narrowed to one
    /// order when `order_id` is given.
    async fn execute_scoped<T, F, Fut>(
        &self,
        client_id: &str,
        operation: &'static str,
        order_id: Option<&str>,
        op: F,
    ) -> Result<T, RouteFailure>
    where
        F: FnOnce(Arc<dyn BrokerConnector>) -> Fut,
        Fut: Future<Output = Result<T, ExecutionError>>,
    {
        let context = retry_context(client_id, operation, order_id);
        let result = match self.get_broker_client(client_id) {
            Ok(client) => {
                let breaker = self.breakers.get_or_create(client_id);
                breaker
                    .call(breaker.call_timeout(), &self.shutdown, || op(client))
                    .await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(value) => {
                self.classifier.release(&context);
                tracing::debug!(client_id, operation, "Broker call succeeded");
                Ok(value)
            }
            Err(err) => {
                let decision = self.classifier.handle_error(&context, &err);
                if !decision.should_retry
                    && decision.attempt >= self.classifier.policy().max_retries
                {
                    self.classifier.release(&context);
                }
                Err(RouteFailure::from(decision))
            }
        }
    }
}

fn retry_context(client_id: &str, operation: &str, order_id: Option<&str>) -> String {
    match order_id {
        Some(order_id) => format!("broker:{client_id}:{operation}:{order_id}"),
        None => format!("broker:{client_id}:{operation}"),
    }
}

fn dealer_unsupported() -> ExecutionError {
    ExecutionError::new(
        ErrorCode::Unsupported,
        "dealer operations not supported by this broker",
        ORIGIN,
    )
}
