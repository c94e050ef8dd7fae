//! Lifecycle manager.
//!
//! Tracks one [`OrderLifecycle`] per order ID. Each lifecycle sits behind its
//! own mutex so transitions on different orders never contend; the outer map
//! lock is held only long enough to find or insert an entry.
//!
//! Callbacks registered for a target state run after the transition is
//! committed and every lock is released, in registration order. A panicking
//! callback is logged and does not affect the transition or later callbacks.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::event::{OrderEvent, OrderLifecycle, event_types};
use super::state::{LifecycleState, TransitionTable};
use crate::domain::Order;
use crate::error::ExecutionError;
use crate::observability;
use crate::resilience::ErrorClassifier;

const ORIGIN: &str = "LifecycleManager";

/// Callback invoked after a transition into a registered state.
pub type LifecycleCallback = Arc<dyn Fn(&OrderLifecycle, &OrderEvent) + Send + Sync>;

type LifecycleEntry = Arc<Mutex<OrderLifecycle>>;

/// Owns every order lifecycle in the engine.
pub struct LifecycleManager {
    lifecycles: RwLock<HashMap<String, LifecycleEntry>>,
    callbacks: RwLock<HashMap<LifecycleState, Vec<LifecycleCallback>>>,
    classifier: Arc<ErrorClassifier>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("lifecycles", &self.len())
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Create an empty manager reporting invalid transitions to `classifier`.
    #[must_use]
    pub fn new(classifier: Arc<ErrorClassifier>) -> Self {
        Self {
            lifecycles: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            classifier,
        }
    }

    /// Start tracking `order` in `Created`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a lifecycle already exists for the order ID.
    pub fn create_lifecycle(&self, order: Order) -> Result<OrderLifecycle, ExecutionError> {
        let order_id = order.id.clone();
        let snapshot = {
            let mut lifecycles = self
                .lifecycles
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if lifecycles.contains_key(&order_id) {
                return Err(ExecutionError::invalid_order(
                    format!("Order lifecycle already exists: {order_id}"),
                    ORIGIN,
                )
                .with_order(order_id));
            }
            let lifecycle = OrderLifecycle::start(order);
            let snapshot = lifecycle.clone();
            lifecycles.insert(order_id.clone(), Arc::new(Mutex::new(lifecycle)));
            snapshot
        };

        tracing::debug!(order_id = %order_id, "Lifecycle created");
        observability::record_lifecycle_transition(LifecycleState::Created.as_str());
        if let Some(event) = snapshot.last_event() {
            self.dispatch(&snapshot, event);
        }
        Ok(snapshot)
    }

    /// Replace a finished lifecycle with a fresh one for the same order ID.
    ///
    /// Used when a dead-lettered order is resubmitted.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the existing lifecycle is still live.
    pub fn restart_lifecycle(&self, order: Order) -> Result<OrderLifecycle, ExecutionError> {
        let order_id = order.id.clone();
        let snapshot = {
            let mut lifecycles = self
                .lifecycles
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = lifecycles.get(&order_id) {
                let existing = existing.lock().unwrap_or_else(PoisonError::into_inner);
                if !existing.current_state().is_terminal() {
                    return Err(ExecutionError::invalid_order(
                        format!(
                            "Order lifecycle still active in state {}: {order_id}",
                            existing.current_state()
                        ),
                        ORIGIN,
                    )
                    .with_order(order_id));
                }
                tracing::info!(
                    order_id = %order_id,
                    previous_state = %existing.current_state(),
                    events = existing.events().len(),
                    "Restarting finished lifecycle"
                );
            }
            let lifecycle = OrderLifecycle::start(order);
            let snapshot = lifecycle.clone();
            lifecycles.insert(order_id, Arc::new(Mutex::new(lifecycle)));
            snapshot
        };

        observability::record_lifecycle_transition(LifecycleState::Created.as_str());
        if let Some(event) = snapshot.last_event() {
            self.dispatch(&snapshot, event);
        }
        Ok(snapshot)
    }

    /// Snapshot of the lifecycle for `order_id`.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` if the order is unknown.
    pub fn get_lifecycle(&self, order_id: &str) -> Result<OrderLifecycle, ExecutionError> {
        let entry = self.entry(order_id)?;
        let lifecycle = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(lifecycle.clone())
    }

    /// Current state of `order_id`.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` if the order is unknown.
    pub fn current_state(&self, order_id: &str) -> Result<LifecycleState, ExecutionError> {
        let entry = self.entry(order_id)?;
        let lifecycle = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(lifecycle.current_state())
    }

    /// Event history for `order_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` if the order is unknown.
    pub fn get_order_events(&self, order_id: &str) -> Result<Vec<OrderEvent>, ExecutionError> {
        let entry = self.entry(order_id)?;
        let lifecycle = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(lifecycle.events().to_vec())
    }

    /// Move `order_id` to `new_state`, recording an event tagged `event_type`.
    ///
    /// The check and the update happen under the order's lock, so two racing
    /// transitions out of the same state cannot both succeed.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` for unknown orders and `ERR_INVALID_ORDER`
    /// when the transition table forbids the move. The lifecycle is unchanged
    /// on error.
    pub fn transition_state(
        &self,
        order_id: &str,
        new_state: LifecycleState,
        event_type: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<OrderLifecycle, ExecutionError> {
        let entry = self.entry(order_id)?;

        let (snapshot, event, from) = {
            let mut lifecycle = entry.lock().unwrap_or_else(PoisonError::into_inner);
            let from = lifecycle.current_state();
            if !TransitionTable::is_valid(from, new_state) {
                let err = ExecutionError::invalid_order(
                    format!("Invalid state transition from {from} to {new_state}"),
                    ORIGIN,
                )
                .with_order(order_id)
                .with_detail("event_type", event_type);
                drop(lifecycle);
                let decision = self
                    .classifier
                    .handle_error(&format!("lifecycle:{order_id}"), &err);
                return Err(decision.error);
            }
            let event = lifecycle.apply(new_state, event_type, metadata);
            (lifecycle.clone(), event, from)
        };

        tracing::info!(
            order_id = %order_id,
            from = %from,
            to = %new_state,
            event_type,
            "Order state transition"
        );
        observability::record_lifecycle_transition(new_state.as_str());

        self.dispatch(&snapshot, &event);
        Ok(snapshot)
    }

    /// Register `callback` for transitions into `state`.
    pub fn register_callback<F>(&self, state: LifecycleState, callback: F)
    where
        F: Fn(&OrderLifecycle, &OrderEvent) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(state)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Snapshots of every non-terminal lifecycle, oldest first.
    #[must_use]
    pub fn active_lifecycles(&self) -> Vec<OrderLifecycle> {
        let mut active: Vec<OrderLifecycle> = self
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let lifecycle = entry.lock().unwrap_or_else(PoisonError::into_inner);
                (!lifecycle.current_state().is_terminal()).then(|| lifecycle.clone())
            })
            .collect();
        active.sort_by_key(OrderLifecycle::created_at);
        active
    }

    /// Number of tracked lifecycles, terminal ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lifecycles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move every live order whose GTD expiry has passed to `Expired`.
    ///
    /// Returns the IDs that were expired.
    pub fn check_expired_orders(&self) -> Vec<String> {
        let now = Utc::now();
        let due: Vec<(String, String)> = self
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let lifecycle = entry.lock().unwrap_or_else(PoisonError::into_inner);
                if !lifecycle.is_expired_at(now) {
                    return None;
                }
                let expires_at = lifecycle.expires_at()?.to_rfc3339();
                Some((lifecycle.order_id().to_string(), expires_at))
            })
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for (order_id, expires_at) in due {
            let metadata = serde_json::json!({ "expires_at": expires_at });
            match self.transition_state(
                &order_id,
                LifecycleState::Expired,
                event_types::ORDER_EXPIRED,
                Some(metadata),
            ) {
                Ok(_) => expired.push(order_id),
                // Raced with another transition; the order is no longer live.
                Err(e) => tracing::debug!(order_id = %order_id, error = %e, "Skipped expiry"),
            }
        }
        expired
    }

    /// Spawn a task that runs [`Self::check_expired_orders`] every `interval`
    /// until `cancel` fires.
    pub fn start_expiry_checker(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_ms = interval.as_millis(), "Expiry checker started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = manager.check_expired_orders();
                        if !expired.is_empty() {
                            tracing::info!(count = expired.len(), "Expired orders");
                        }
                    }
                }
            }
            tracing::info!("Expiry checker stopped");
        })
    }

    fn entry(&self, order_id: &str) -> Result<LifecycleEntry, ExecutionError> {
        self.lifecycles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .cloned()
            .ok_or_else(|| {
                ExecutionError::not_found(format!("Order not found: {order_id}"), ORIGIN)
                    .with_order(order_id)
            })
    }

    fn entries(&self) -> Vec<LifecycleEntry> {
        self.lifecycles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn dispatch(&self, lifecycle: &OrderLifecycle, event: &OrderEvent) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.state)
            .cloned()
            .unwrap_or_default();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(lifecycle, event))).is_err() {
                tracing::error!(
                    order_id = %event.order_id,
                    state = %event.state,
                    event_type = %event.event_type,
                    "Lifecycle callback panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::{OrderSide, OrderStatus};
    use crate::error::ErrorCode;

    fn manager() -> LifecycleManager {
        LifecycleManager::new(Arc::new(ErrorClassifier::default()))
    }

    fn order(id: &str) -> Order {
        Order::limit(id, "INFY", OrderSide::Buy, dec!(10), dec!(1500))
    }

    fn advance(manager: &LifecycleManager, id: &str, states: &[LifecycleState]) {
        for state in states {
            manager.transition_state(id, *state, "TEST", None).unwrap();
        }
    }

    #[test]
    fn test_create_records_first_event() {
        let manager = manager();
        let lifecycle = manager.create_lifecycle(order("o1")).unwrap();

        assert_eq!(lifecycle.current_state(), LifecycleState::Created);
        assert_eq!(lifecycle.events().len(), 1);
        assert_eq!(lifecycle.events()[0].event_type, event_types::ORDER_CREATED);
        assert_eq!(lifecycle.events()[0].previous_state, None);
        assert_eq!(lifecycle.order().status, OrderStatus::Pending);
    }

    #[test]
    fn test_duplicate_create_fails() {
        let manager = manager();
        manager.create_lifecycle(order("o1")).unwrap();
        let err = manager.create_lifecycle(order("o1")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOrder);
    }

    #[test]
    fn test_happy_path_projects_status() {
        let manager = manager();
        manager.create_lifecycle(order("o1")).unwrap();
        advance(
            &manager,
            "o1",
            &[
                LifecycleState::Validated,
                LifecycleState::Submitted,
                LifecycleState::Acknowledged,
                LifecycleState::PartiallyFilled,
                LifecycleState::PartiallyFilled,
            ],
        );
        let lifecycle = manager
            .transition_state("o1", LifecycleState::Completed, "ORDER_FILLED", None)
            .unwrap();

        assert_eq!(lifecycle.order().status, OrderStatus::Completed);
        assert_eq!(lifecycle.events().len(), 7);
        let last = lifecycle.last_event().unwrap();
        assert_eq!(last.previous_state, Some(LifecycleState::PartiallyFilled));
        assert_eq!(last.state, LifecycleState::Completed);
    }

    #[test]
    fn test_invalid_transition_leaves_lifecycle_unchanged() {
        let manager = manager();
        manager.create_lifecycle(order("o1")).unwrap();

        let err = manager
            .transition_state("o1", LifecycleState::Completed, "ORDER_FILLED", None)
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::InvalidOrder);
        assert_eq!(
            err.message(),
            "Invalid state transition from CREATED to COMPLETED"
        );
        let lifecycle = manager.get_lifecycle("o1").unwrap();
        assert_eq!(lifecycle.current_state(), LifecycleState::Created);
        assert_eq!(lifecycle.events().len(), 1);
    }

    #[test]
    fn test_terminal_state_rejects_everything() {
        let manager = manager();
        manager.create_lifecycle(order("o1")).unwrap();
        advance(&manager, "o1", &[LifecycleState::Cancelled]);

        for to in LifecycleState::ALL {
            assert!(
                manager.transition_state("o1", to, "TEST", None).is_err(),
                "CANCELLED -> {to}"
            );
        }
    }

    #[test]
    fn test_unknown_order_is_not_found() {
        let manager = manager();
        let err = manager.get_lifecycle("missing").unwrap_err();
        assert_eq!(err.code(), ErrorCode::OrderNotFound);
        let err = manager
            .transition_state("missing", LifecycleState::Validated, "TEST", None)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::OrderNotFound);
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let manager = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            manager.register_callback(LifecycleState::Validated, move |lifecycle, event| {
                assert_eq!(lifecycle.current_state(), LifecycleState::Validated);
                assert_eq!(event.state, LifecycleState::Validated);
                seen.lock().unwrap().push(tag);
            });
        }

        manager.create_lifecycle(order("o1")).unwrap();
        advance(&manager, "o1", &[LifecycleState::Validated]);

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register_callback(LifecycleState::Validated, |_, _| panic!("boom"));
        let counter = Arc::clone(&calls);
        manager.register_callback(LifecycleState::Validated, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.create_lifecycle(order("o1")).unwrap();
        let lifecycle = manager
            .transition_state("o1", LifecycleState::Validated, "TEST", None)
            .unwrap();

        assert_eq!(lifecycle.current_state(), LifecycleState::Validated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_reenter_manager() {
        let manager = Arc::new(manager());
        let inner = Arc::clone(&manager);
        manager.register_callback(LifecycleState::Validated, move |lifecycle, _| {
            let state = inner.current_state(lifecycle.order_id()).unwrap();
            assert_eq!(state, LifecycleState::Validated);
        });

        manager.create_lifecycle(order("o1")).unwrap();
        advance(&manager, "o1", &[LifecycleState::Validated]);
    }

    #[test]
    fn test_racing_transitions_only_one_wins() {
        let manager = Arc::new(manager());
        manager.create_lifecycle(order("o1")).unwrap();
        advance(
            &manager,
            "o1",
            &[LifecycleState::Validated, LifecycleState::Submitted],
        );

        let handles: Vec<_> = [LifecycleState::Acknowledged, LifecycleState::Cancelled]
            .into_iter()
            .cycle()
            .take(8)
            .map(|to| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    manager.transition_state("o1", to, "RACE", None).is_ok()
                })
            })
            .collect();
        let wins: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Acknowledged -> Cancelled is legal, so at most two can win.
        let events = manager.get_order_events("o1").unwrap();
        assert_eq!(events.len(), 3 + wins.iter().filter(|w| **w).count());
        for pair in events.windows(2) {
            assert_eq!(pair[1].previous_state, Some(pair[0].state));
        }
    }

    #[test]
    fn test_check_expired_orders() {
        let manager = manager();
        let past = Utc::now() - ChronoDuration::seconds(5);
        let future = Utc::now() + ChronoDuration::hours(1);
        manager
            .create_lifecycle(order("due").expiring_at(past))
            .unwrap();
        manager
            .create_lifecycle(order("later").expiring_at(future))
            .unwrap();
        manager.create_lifecycle(order("gtc")).unwrap();
        manager
            .create_lifecycle(order("done").expiring_at(past))
            .unwrap();
        advance(&manager, "done", &[LifecycleState::Cancelled]);

        let expired = manager.check_expired_orders();

        assert_eq!(expired, vec!["due".to_string()]);
        let lifecycle = manager.get_lifecycle("due").unwrap();
        assert_eq!(lifecycle.current_state(), LifecycleState::Expired);
        assert_eq!(
            lifecycle.last_event().unwrap().event_type,
            event_types::ORDER_EXPIRED
        );
        assert_eq!(manager.active_lifecycles().len(), 2);
    }

    #[test]
    fn test_restart_requires_terminal_state() {
        let manager = manager();
        manager.create_lifecycle(order("o1")).unwrap();
        assert!(manager.restart_lifecycle(order("o1")).is_err());

        advance(&manager, "o1", &[LifecycleState::Failed]);
        let restarted = manager.restart_lifecycle(order("o1")).unwrap();
        assert_eq!(restarted.current_state(), LifecycleState::Created);
        assert_eq!(restarted.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_checker_stops_on_cancel() {
        let manager = Arc::new(manager());
        manager
            .create_lifecycle(order("o1").expiring_at(Utc::now()))
            .unwrap();
        let cancel = CancellationToken::new();

        let handle = manager.start_expiry_checker(Duration::from_secs(1), cancel.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            manager.current_state("o1").unwrap(),
            LifecycleState::Expired
        );
    }
}
