//! Execution engine.
//!
//! Drives an order from submission to a terminal state:
//!
//! ```text
//! submit_order
//!   CREATED ──risk──► VALIDATED ──place (retry with backoff)──► SUBMITTED
//!      │                  │
//!      └─► REJECTED       └─► FAILED ──► dead-letter queue
//!
//! venue events
//!   SUBMITTED ──ack──► ACKNOWLEDGED ──fill──► PARTIALLY_FILLED ──fill──► COMPLETED
//!   live order ──cancel──► CANCELLING ──venue confirms──► CANCELLED
//! ```
//!
//! Dependent children are validated when they are registered and placed at
//! the venue once their parent's completion moves them to `SUBMITTED`. OCO
//! siblings moved to `CANCELLING` are cancelled at the venue the same way.
//!
//! A cancel that lands while a placement is in flight wins. The order is
//! confirmed cancelled at once and the venue order is withdrawn when the
//! placement returns.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::broker::{BrokerRouter, RouteFailure};
use crate::dependency::{DependencyManager, DependencyType, OCO_CANCELLED, OrderDependency};
use crate::domain::{Order, Portfolio, Strategy};
use crate::error::{ErrorCode, ExecutionError};
use crate::lifecycle::{LifecycleManager, LifecycleState, OrderLifecycle, event_types};
use crate::resilience::ErrorClassifier;
use crate::risk::{MonitoredRiskValidator, RiskManager, RiskValidator};

const ORIGIN: &str = "ExecutionEngine";

/// Routing details for a live order.
#[derive(Debug, Clone)]
struct Route {
    user_id: String,
    portfolio: Portfolio,
    strategy: Strategy,
    broker_order_id: Option<String>,
    /// Set when a cancel arrived before the venue order ID was known.
    cancel_requested: bool,
}

#[derive(Debug)]
enum EngineEvent {
    ChildTriggered(String),
    CancelAtVenue(String),
}

/// A routed call that gave up.
#[derive(Debug)]
struct RoutedFailure {
    error: ExecutionError,
    attempts: u32,
    /// False when the order left the expected state while retrying.
    park: bool,
}

/// Coordinates risk, lifecycle, dependencies and routing for every order.
pub struct ExecutionEngine {
    lifecycle: Arc<LifecycleManager>,
    dependencies: Arc<DependencyManager>,
    risk: Arc<RiskManager>,
    validator: MonitoredRiskValidator<Arc<RiskManager>>,
    router: Arc<BrokerRouter>,
    dead_letters: DeadLetterQueue,
    routes: RwLock<HashMap<String, Route>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("lifecycle", &self.lifecycle)
            .field("router", &self.router)
            .field("dead_letters", &self.dead_letters.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Create the engine, hook it into `lifecycle` and spawn its worker.
    ///
    /// The worker stops when `shutdown` fires or the engine is dropped.
    pub fn start(
        lifecycle: Arc<LifecycleManager>,
        dependencies: Arc<DependencyManager>,
        risk: Arc<RiskManager>,
        router: Arc<BrokerRouter>,
        classifier: Arc<ErrorClassifier>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let engine = Arc::new(Self {
            lifecycle: Arc::clone(&lifecycle),
            dependencies,
            validator: MonitoredRiskValidator::new(Arc::clone(&risk), classifier),
            risk,
            router,
            dead_letters: DeadLetterQueue::new(),
            routes: RwLock::new(HashMap::new()),
            shutdown: shutdown.clone(),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let triggered_tx = tx.clone();
        lifecycle.register_callback(LifecycleState::Submitted, move |lifecycle, event| {
            if event.event_type != event_types::DEPENDENCY_TRIGGERED {
                return;
            }
            let event = EngineEvent::ChildTriggered(lifecycle.order_id().to_string());
            if triggered_tx.send(event).is_err() {
                tracing::warn!(
                    order_id = lifecycle.order_id(),
                    "Engine worker stopped, dependent order not placed"
                );
            }
        });
        let cancel_tx = tx;
        lifecycle.register_callback(LifecycleState::Cancelling, move |lifecycle, event| {
            if event.event_type != OCO_CANCELLED {
                return;
            }
            let event = EngineEvent::CancelAtVenue(lifecycle.order_id().to_string());
            if cancel_tx.send(event).is_err() {
                tracing::warn!(
                    order_id = lifecycle.order_id(),
                    "Engine worker stopped, venue cancel not sent"
                );
            }
        });
        for state in LifecycleState::ALL.into_iter().filter(|state| state.is_terminal()) {
            let weak = Arc::downgrade(&engine);
            lifecycle.register_callback(state, move |lifecycle, _| {
                if let Some(engine) = weak.upgrade() {
                    engine.forget_route(lifecycle.order_id());
                }
            });
        }

        let worker = tokio::spawn(run_worker(Arc::downgrade(&engine), rx, shutdown));
        (engine, worker)
    }

    /// Lifecycle manager.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Dependency manager.
    #[must_use]
    pub fn dependencies(&self) -> &Arc<DependencyManager> {
        &self.dependencies
    }

    /// Risk manager.
    #[must_use]
    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    /// Broker router.
    #[must_use]
    pub fn router(&self) -> &Arc<BrokerRouter> {
        &self.router
    }

    /// Orders parked after exhausting their retries.
    #[must_use]
    pub const fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Venue order ID for a live order, once placed.
    #[must_use]
    pub fn broker_order_id(&self, order_id: &str) -> Option<String> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .and_then(|route| route.broker_order_id.clone())
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Validate `order` and place it through `user_id`'s session.
    ///
    /// Retryable venue failures are retried with the classifier's backoff.
    /// Once the budget is spent the order moves to `FAILED` and is parked in
    /// the dead-letter queue.
    ///
    /// # Errors
    ///
    /// Returns the risk breach, the final venue error, or a validation error
    /// if the order ID is already tracked.
    pub async fn submit_order(
        &self,
        order: Order,
        portfolio: &Portfolio,
        strategy: &Strategy,
        user_id: &str,
    ) -> Result<OrderLifecycle, ExecutionError> {
        self.lifecycle.create_lifecycle(order.clone())?;
        self.run_submission(order, portfolio.clone(), strategy.clone(), user_id.to_string(), 0)
            .await
    }

    /// Register `child` to be placed when `parent_id` completes (OTO) or
    /// cancelled when it does (OCO).
    ///
    /// The child is risk-checked now and waits in `VALIDATED`.
    ///
    /// # Errors
    ///
    /// Returns the risk breach, or the dependency error if the edge is
    /// refused. A refused child is cancelled.
    #[allow(clippy::too_many_arguments)]
    pub fn add_dependent_order(
        &self,
        child: Order,
        parent_id: &str,
        dependency_type: DependencyType,
        condition: Option<String>,
        portfolio: &Portfolio,
        strategy: &Strategy,
        user_id: &str,
    ) -> Result<OrderDependency, ExecutionError> {
        let child_id = child.id.clone();
        self.lifecycle.create_lifecycle(child.clone())?;
        self.validate(&child, portfolio, strategy)?;

        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                child_id.clone(),
                Route {
                    user_id: user_id.to_string(),
                    portfolio: portfolio.clone(),
                    strategy: strategy.clone(),
                    broker_order_id: None,
                    cancel_requested: false,
                },
            );

        match self
            .dependencies
            .create_dependency(parent_id, &child_id, dependency_type, condition)
        {
            Ok(dependency) => Ok(dependency),
            Err(err) => {
                self.lifecycle.transition_state(
                    &child_id,
                    LifecycleState::Cancelled,
                    event_types::ORDER_CANCELLED,
                    Some(serde_json::json!({ "reason": err.message() })),
                )?;
                Err(err)
            }
        }
    }

    /// Resubmit a parked order under a fresh lifecycle.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` if nothing is parked for `order_id`,
    /// otherwise the outcome of the new submission.
    pub async fn retry_dead_letter(&self, order_id: &str) -> Result<OrderLifecycle, ExecutionError> {
        let letter = self.dead_letters.remove(order_id).ok_or_else(|| {
            ExecutionError::not_found(format!("No dead letter for order: {order_id}"), ORIGIN)
                .with_order(order_id)
        })?;
        if let Err(err) = self.lifecycle.restart_lifecycle(letter.order.clone()) {
            self.dead_letters.add(letter);
            return Err(err);
        }

        tracing::info!(
            order_id,
            previous_attempts = letter.attempts,
            "Retrying dead-lettered order"
        );
        self.run_submission(
            letter.order,
            letter.portfolio,
            letter.strategy,
            letter.user_id,
            letter.attempts,
        )
        .await
    }

    /// Retry every parked order, oldest first.
    pub async fn retry_all_dead_letters(
        &self,
    ) -> Vec<(String, Result<OrderLifecycle, ExecutionError>)> {
        let mut outcomes = Vec::new();
        for letter in self.dead_letters.list() {
            let order_id = letter.order.id;
            let outcome = self.retry_dead_letter(&order_id).await;
            outcomes.push((order_id, outcome));
        }
        outcomes
    }

    // =========================================================================
    // Venue events
    // =========================================================================

    /// The venue acknowledged the order.
    ///
    /// # Errors
    ///
    /// Returns a lifecycle error if the transition is not allowed.
    pub fn on_broker_acknowledged(&self, order_id: &str) -> Result<OrderLifecycle, ExecutionError> {
        self.lifecycle.transition_state(
            order_id,
            LifecycleState::Acknowledged,
            event_types::ORDER_ACKNOWLEDGED,
            None,
        )
    }

    /// The venue reported `filled_qty` of `total_qty` filled so far.
    ///
    /// A fill on an unacknowledged order acknowledges it first.
    ///
    /// # Errors
    ///
    /// Returns a validation error for non-positive quantities, or a lifecycle
    /// error if the transition is not allowed.
    pub fn on_fill(
        &self,
        order_id: &str,
        filled_qty: Decimal,
        total_qty: Decimal,
    ) -> Result<OrderLifecycle, ExecutionError> {
        if filled_qty <= Decimal::ZERO || total_qty <= Decimal::ZERO {
            return Err(ExecutionError::invalid_parameter(
                format!("fill quantities must be positive, got {filled_qty} of {total_qty}"),
                ORIGIN,
            )
            .with_order(order_id));
        }

        if self.lifecycle.current_state(order_id)? == LifecycleState::Submitted {
            self.lifecycle.transition_state(
                order_id,
                LifecycleState::Acknowledged,
                event_types::ORDER_ACKNOWLEDGED,
                Some(serde_json::json!({ "implied_by_fill": true })),
            )?;
        }

        let metadata = serde_json::json!({
            "filled_quantity": filled_qty.to_string(),
            "total_quantity": total_qty.to_string(),
        });
        if filled_qty >= total_qty {
            self.lifecycle.transition_state(
                order_id,
                LifecycleState::Completed,
                event_types::ORDER_FILLED,
                Some(metadata),
            )
        } else {
            self.lifecycle.transition_state(
                order_id,
                LifecycleState::PartiallyFilled,
                event_types::PARTIAL_FILL,
                Some(metadata),
            )
        }
    }

    /// The venue rejected the order.
    ///
    /// # Errors
    ///
    /// Returns a lifecycle error if the transition is not allowed.
    pub fn on_broker_rejected(
        &self,
        order_id: &str,
        reason: &str,
    ) -> Result<OrderLifecycle, ExecutionError> {
        self.lifecycle.transition_state(
            order_id,
            LifecycleState::Rejected,
            event_types::ORDER_REJECTED,
            Some(serde_json::json!({ "reason": reason })),
        )
    }

    /// Cancel an order.
    ///
    /// Orders not yet at the venue are cancelled directly. Live orders move to
    /// `CANCELLING` and then to `CANCELLED` once the venue confirms; a venue
    /// failure leaves them in `CANCELLING`.
    ///
    /// # Errors
    ///
    /// Returns a lifecycle error if the order cannot be cancelled from its
    /// current state, or the venue error.
    pub async fn cancel_order(&self, order_id: &str) -> Result<OrderLifecycle, ExecutionError> {
        let state = self.lifecycle.current_state(order_id)?;
        if !state.is_at_or_past_submitted() {
            return self.lifecycle.transition_state(
                order_id,
                LifecycleState::Cancelled,
                event_types::ORDER_CANCELLED,
                None,
            );
        }

        self.lifecycle.transition_state(
            order_id,
            LifecycleState::Cancelling,
            event_types::CANCEL_REQUESTED,
            None,
        )?;
        self.cancel_at_venue(order_id).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn validate(
        &self,
        order: &Order,
        portfolio: &Portfolio,
        strategy: &Strategy,
    ) -> Result<(), ExecutionError> {
        if let Err(err) = self.validator.validate_order(order, portfolio, strategy) {
            self.lifecycle.transition_state(
                &order.id,
                LifecycleState::Rejected,
                event_types::VALIDATION_FAILED,
                Some(serde_json::json!({
                    "code": err.code().as_str(),
                    "reason": err.message(),
                })),
            )?;
            return Err(err);
        }
        self.lifecycle.transition_state(
            &order.id,
            LifecycleState::Validated,
            event_types::VALIDATION_PASSED,
            None,
        )?;
        Ok(())
    }

    async fn run_submission(
        &self,
        order: Order,
        portfolio: Portfolio,
        strategy: Strategy,
        user_id: String,
        prior_attempts: u32,
    ) -> Result<OrderLifecycle, ExecutionError> {
        self.validate(&order, &portfolio, &strategy)?;
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                order.id.clone(),
                Route {
                    user_id: user_id.clone(),
                    portfolio: portfolio.clone(),
                    strategy: strategy.clone(),
                    broker_order_id: None,
                    cancel_requested: false,
                },
            );

        let placed = self
            .retry_routed(&order.id, LifecycleState::Validated, || {
                self.router.place_order(&user_id, &order)
            })
            .await;

        match placed {
            Ok((response, attempts)) => {
                let broker_order_id = response.broker_order_id;
                let submitted = if self.claim_broker_order(&order.id, &broker_order_id) {
                    self.lifecycle.transition_state(
                        &order.id,
                        LifecycleState::Submitted,
                        event_types::ORDER_SUBMITTED,
                        Some(serde_json::json!({
                            "broker_order_id": broker_order_id,
                            "attempts": attempts,
                        })),
                    )
                    .map_err(|err| {
                        self.placement_overtaken(&order.id)
                            .with_shared_cause(Arc::new(err))
                    })
                } else {
                    Err(self.placement_overtaken(&order.id))
                };
                match submitted {
                    Ok(lifecycle) => {
                        self.risk.record_order(&order);
                        Ok(lifecycle)
                    }
                    Err(err) => {
                        self.withdraw(&order.id, &user_id, &broker_order_id).await;
                        Err(err.with_detail("broker_order_id", broker_order_id))
                    }
                }
            }
            Err(failure) => {
                self.router
                    .release_retry_budget(&user_id, "place_order", &order.id);
                let error = failure.error.clone();
                if failure.park {
                    self.park(DeadLetter {
                        order,
                        portfolio,
                        strategy,
                        user_id,
                        error: failure.error,
                        attempts: prior_attempts.saturating_add(failure.attempts),
                        parked_at: chrono::Utc::now(),
                    });
                }
                Err(error)
            }
        }
    }

    /// Place a child that its parent just moved to `SUBMITTED`.
    async fn place_triggered_child(&self, order_id: &str) {
        let Some(route) = self.route(order_id) else {
            tracing::debug!(order_id, "Triggered order has no route, not placing");
            return;
        };
        let order = match self.lifecycle.get_lifecycle(order_id) {
            Ok(lifecycle) => lifecycle.order().clone(),
            Err(err) => {
                tracing::warn!(order_id, error = %err, "Triggered order vanished");
                return;
            }
        };

        let placed = self
            .retry_routed(order_id, LifecycleState::Submitted, || {
                self.router.place_order(&route.user_id, &order)
            })
            .await;

        if placed.is_err() {
            self.router
                .release_retry_budget(&route.user_id, "place_order", order_id);
        }
        match placed {
            Ok((response, _)) if !self.claim_broker_order(order_id, &response.broker_order_id) => {
                self.withdraw(order_id, &route.user_id, &response.broker_order_id)
                    .await;
            }
            Ok((response, attempts)) => {
                self.risk.record_order(&order);
                tracing::info!(
                    order_id,
                    broker_order_id = %response.broker_order_id,
                    attempts,
                    "Dependent order placed"
                );
            }
            Err(failure) if failure.park => {
                self.park(DeadLetter {
                    order,
                    portfolio: route.portfolio,
                    strategy: route.strategy,
                    user_id: route.user_id,
                    error: failure.error,
                    attempts: failure.attempts,
                    parked_at: chrono::Utc::now(),
                });
            }
            Err(failure) => {
                tracing::info!(order_id, error = %failure.error, "Dependent order abandoned");
            }
        }
    }

    /// Cancel a `CANCELLING` order at the venue and confirm it.
    ///
    /// An order whose placement has not returned yet is confirmed directly;
    /// the placement withdraws the venue order when it lands.
    async fn cancel_at_venue(&self, order_id: &str) -> Result<OrderLifecycle, ExecutionError> {
        let target = {
            let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
            match routes.get_mut(order_id) {
                Some(route) => match &route.broker_order_id {
                    Some(broker_order_id) => Some((route.user_id.clone(), broker_order_id.clone())),
                    None => {
                        route.cancel_requested = true;
                        None
                    }
                },
                None => None,
            }
        };
        let Some((user_id, broker_order_id)) = target else {
            return self.lifecycle.transition_state(
                order_id,
                LifecycleState::Cancelled,
                event_types::ORDER_CANCELLED,
                Some(serde_json::json!({ "venue_order": false })),
            );
        };

        let cancelled = self
            .retry_routed(order_id, LifecycleState::Cancelling, || {
                self.router.cancel_order(&user_id, &broker_order_id)
            })
            .await;

        match cancelled {
            Ok((_, attempts)) => self.lifecycle.transition_state(
                order_id,
                LifecycleState::Cancelled,
                event_types::ORDER_CANCELLED,
                Some(serde_json::json!({
                    "broker_order_id": broker_order_id,
                    "attempts": attempts,
                })),
            ),
            Err(failure) => {
                tracing::error!(
                    order_id,
                    broker_order_id = %broker_order_id,
                    error = %failure.error,
                    "Venue cancel failed, order left cancelling"
                );
                Err(failure.error)
            }
        }
    }

    /// Call the venue until it succeeds, the classifier gives up, or the order
    /// leaves `expected`.
    async fn retry_routed<T, F, Fut>(
        &self,
        order_id: &str,
        expected: LifecycleState,
        mut call: F,
    ) -> Result<(T, u32), RoutedFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RouteFailure>>,
    {
        let mut attempts = 0_u32;
        loop {
            let state = self.lifecycle.current_state(order_id).map_err(|error| RoutedFailure {
                error,
                attempts,
                park: false,
            })?;
            if state != expected {
                return Err(RoutedFailure {
                    error: ExecutionError::new(
                        ErrorCode::Cancelled,
                        format!("order {order_id} moved to {state} while routing"),
                        ORIGIN,
                    )
                    .with_order(order_id),
                    attempts,
                    park: false,
                });
            }

            attempts = attempts.saturating_add(1);
            let failure = match call().await {
                Ok(value) => return Ok((value, attempts)),
                Err(failure) => failure,
            };
            if !failure.should_retry {
                return Err(RoutedFailure {
                    error: failure.error,
                    attempts,
                    park: true,
                });
            }

            let delay = failure.delay.unwrap_or_default();
            tracing::warn!(
                order_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure.error,
                "Venue call failed, retrying"
            );
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    return Err(RoutedFailure {
                        error: ExecutionError::new(
                            ErrorCode::Cancelled,
                            format!("routing of order {order_id} interrupted by shutdown"),
                            ORIGIN,
                        )
                        .with_order(order_id)
                        .with_shared_cause(Arc::new(failure.error)),
                        attempts,
                        park: true,
                    });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn park(&self, letter: DeadLetter) {
        let order_id = letter.order.id.clone();
        let transitioned = self.lifecycle.transition_state(
            &order_id,
            LifecycleState::Failed,
            event_types::SUBMISSION_FAILED,
            Some(serde_json::json!({
                "code": letter.error.code().as_str(),
                "reason": letter.error.message(),
                "attempts": letter.attempts,
            })),
        );
        if let Err(err) = transitioned {
            tracing::warn!(order_id = %order_id, error = %err, "Order not parked");
            return;
        }

        tracing::error!(
            order_id = %order_id,
            attempts = letter.attempts,
            error = %letter.error,
            "Order moved to dead-letter queue"
        );
        self.dead_letters.add(letter);
    }

    fn route(&self, order_id: &str) -> Option<Route> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .cloned()
    }

    /// Attach the venue order ID to the order's route.
    ///
    /// Returns false if the order was cancelled or finished while the
    /// placement was in flight; the caller then has to withdraw the venue order.
    fn claim_broker_order(&self, order_id: &str, broker_order_id: &str) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        match routes.get_mut(order_id) {
            Some(route) if !route.cancel_requested => {
                route.broker_order_id = Some(broker_order_id.to_string());
                true
            }
            _ => false,
        }
    }

    fn placement_overtaken(&self, order_id: &str) -> ExecutionError {
        let state = self
            .lifecycle
            .current_state(order_id)
            .map_or_else(|_| "UNKNOWN".to_string(), |state| state.to_string());
        ExecutionError::new(
            ErrorCode::Cancelled,
            format!("order {order_id} moved to {state} while being placed"),
            ORIGIN,
        )
        .with_order(order_id)
    }

    /// Cancel a venue order that no engine order owns any more.
    async fn withdraw(&self, order_id: &str, user_id: &str, broker_order_id: &str) {
        let mut attempts = 0_u32;
        loop {
            attempts = attempts.saturating_add(1);
            let failure = match self.router.cancel_order(user_id, broker_order_id).await {
                Ok(_) => {
                    tracing::warn!(
                        order_id,
                        broker_order_id,
                        attempts,
                        "Venue order withdrawn, order was cancelled during placement"
                    );
                    return;
                }
                Err(failure) => failure,
            };
            if !failure.should_retry {
                tracing::error!(
                    order_id,
                    broker_order_id,
                    error = %failure.error,
                    "Venue order could not be withdrawn and is still open"
                );
                return;
            }
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    tracing::error!(
                        order_id,
                        broker_order_id,
                        "Shutdown before venue order was withdrawn"
                    );
                    return;
                }
                () = tokio::time::sleep(failure.delay.unwrap_or_default()) => {}
            }
        }
    }

    fn forget_route(&self, order_id: &str) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(order_id);
    }
}

async fn run_worker(
    engine: Weak<ExecutionEngine>,
    mut rx: mpsc::UnboundedReceiver<EngineEvent>,
    shutdown: CancellationToken,
) {
    tracing::debug!("Engine worker started");
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = rx.recv() => event,
        };
        let Some(event) = event else { break };
        let Some(engine) = engine.upgrade() else { break };

        tokio::spawn(async move {
            match event {
                EngineEvent::ChildTriggered(order_id) => {
                    engine.place_triggered_child(&order_id).await;
                }
                EngineEvent::CancelAtVenue(order_id) => {
                    if let Err(err) = engine.cancel_at_venue(&order_id).await {
                        tracing::warn!(order_id = %order_id, error = %err, "OCO venue cancel failed");
                    }
                }
            }
        });
    }
    tracing::debug!("Engine worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::broker::{
        BrokerConfig, BrokerConnector, BrokerKind, ConnectorFactory, Credentials,
        SimulatedConnector,
    };
    use crate::domain::OrderSide;
    use crate::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy};
    use crate::risk::{RiskLimit, RiskLimitType, RiskProfile};

    struct Harness {
        engine: Arc<ExecutionEngine>,
        venue: Arc<SimulatedConnector>,
        shutdown: CancellationToken,
    }

    impl Harness {
        async fn new() -> Self {
            let classifier = Arc::new(ErrorClassifier::new(
                RetryPolicy::new(2, Duration::from_millis(1)).without_jitter(),
            ));
            let shutdown = CancellationToken::new();
            let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&classifier)));
            let (dependencies, _) = DependencyManager::start(
                Arc::clone(&lifecycle),
                Arc::clone(&classifier),
                shutdown.clone(),
            );

            let venue = Arc::new(SimulatedConnector::new("c1"));
            let shared = Arc::clone(&venue);
            let factory: Arc<dyn ConnectorFactory> = Arc::new(
                move |_: &BrokerConfig| -> Result<Arc<dyn BrokerConnector>, ExecutionError> {
                    Ok(Arc::clone(&shared) as Arc<dyn BrokerConnector>)
                },
            );
            let router = Arc::new(BrokerRouter::new(
                factory,
                Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
                Arc::clone(&classifier),
                shutdown.clone(),
            ));
            router
                .register_broker("c1", Some(BrokerConfig::new("c1", BrokerKind::Simulated)))
                .unwrap();
            router.login("c1", &Credentials::new("u1", "pw")).await.unwrap();

            let (engine, _) = ExecutionEngine::start(
                lifecycle,
                dependencies,
                Arc::new(RiskManager::default()),
                router,
                classifier,
                shutdown.clone(),
            );
            Self {
                engine,
                venue,
                shutdown,
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn order(id: &str) -> Order {
        Order::limit(id, "INFY", OrderSide::Buy, dec!(10), dec!(100)).for_account("p1", "s1", "c1")
    }

    fn portfolio() -> Portfolio {
        Portfolio::new("p1", dec!(1000000))
    }

    #[tokio::test]
    async fn test_submit_reaches_submitted() {
        let h = Harness::new().await;
        let lifecycle = h
            .engine
            .submit_order(order("o1"), &portfolio(), &Strategy::default(), "u1")
            .await
            .unwrap();

        assert_eq!(lifecycle.current_state(), LifecycleState::Submitted);
        assert_eq!(lifecycle.events().len(), 3);
        assert_eq!(h.engine.broker_order_id("o1").as_deref(), Some("SIM-000001"));
        assert_eq!(h.engine.risk().order_history("p1").len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let h = Harness::new().await;
        h.venue
            .fail_next(1, ExecutionError::connection("connection reset", "test"));

        let lifecycle = h
            .engine
            .submit_order(order("o1"), &portfolio(), &Strategy::default(), "u1")
            .await
            .unwrap();

        assert_eq!(lifecycle.current_state(), LifecycleState::Submitted);
        let metadata = lifecycle.last_event().unwrap().metadata.clone().unwrap();
        assert_eq!(metadata["attempts"], 2);
    }

    #[tokio::test]
    async fn test_risk_breach_rejects_before_routing() {
        let h = Harness::new().await;
        h.engine
            .risk()
            .create_risk_profile(
                RiskProfile::new("tight", "Tight")
                    .with_limit(RiskLimit::new(RiskLimitType::OrderValue, dec!(500))),
            )
            .unwrap();

        let err = h
            .engine
            .submit_order(
                order("o1"),
                &portfolio(),
                &Strategy::with_profile("s1", "tight"),
                "u1",
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::InvalidOrder);
        assert_eq!(
            h.engine.lifecycle().current_state("o1").unwrap(),
            LifecycleState::Rejected
        );
        assert_eq!(h.venue.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fills_complete_the_order() {
        let h = Harness::new().await;
        h.engine
            .submit_order(order("o1"), &portfolio(), &Strategy::default(), "u1")
            .await
            .unwrap();

        let partial = h.engine.on_fill("o1", dec!(4), dec!(10)).unwrap();
        assert_eq!(partial.current_state(), LifecycleState::PartiallyFilled);
        let done = h.engine.on_fill("o1", dec!(10), dec!(10)).unwrap();
        assert_eq!(done.current_state(), LifecycleState::Completed);
        assert!(h.engine.broker_order_id("o1").is_none());

        let err = h.engine.on_fill("o2", dec!(0), dec!(10)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
    }

    #[tokio::test]
    async fn test_cancel_live_order_goes_through_venue() {
        let h = Harness::new().await;
        h.engine
            .submit_order(order("o1"), &portfolio(), &Strategy::default(), "u1")
            .await
            .unwrap();
        h.engine.on_broker_acknowledged("o1").unwrap();

        let lifecycle = h.engine.cancel_order("o1").await.unwrap();
        assert_eq!(lifecycle.current_state(), LifecycleState::Cancelled);
        let states: Vec<_> = lifecycle.events().iter().map(|e| e.state).collect();
        assert_eq!(
            &states[states.len() - 2..],
            &[LifecycleState::Cancelling, LifecycleState::Cancelled]
        );
    }

    #[tokio::test]
    async fn test_broker_rejection() {
        let h = Harness::new().await;
        h.engine
            .submit_order(order("o1"), &portfolio(), &Strategy::default(), "u1")
            .await
            .unwrap();

        let lifecycle = h.engine.on_broker_rejected("o1", "price band").unwrap();
        assert_eq!(lifecycle.current_state(), LifecycleState::Rejected);
        assert_eq!(
            lifecycle.last_event().unwrap().metadata.clone().unwrap()["reason"],
            "price band"
        );
    }
}
