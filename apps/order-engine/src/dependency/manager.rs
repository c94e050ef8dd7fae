//! Dependency manager.
//!
//! Parent lifecycle events are pushed onto an unbounded channel by lifecycle
//! callbacks and drained by a worker task, so children are never touched
//! inside the parent's own transition.
//!
//! # Parent events
//!
//! ```text
//! Parent COMPLETED
//!   OTO child, before SUBMITTED  → VALIDATED → SUBMITTED
//!   OTO child, live              → unchanged
//!   OCO child, before SUBMITTED  → CANCELLED
//!   OCO child, live              → CANCELLING
//!
//! Parent CANCELLED | REJECTED | FAILED | EXPIRED
//!   any child, before SUBMITTED  → CANCELLED (PARENT_<STATE>)
//!   any child, live              → unchanged
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::types::{DependencyType, OrderDependency, TriggerReport};
use crate::domain::Order;
use crate::error::ExecutionError;
use crate::lifecycle::{LifecycleManager, LifecycleState, TransitionTable, event_types};
use crate::resilience::ErrorClassifier;

const ORIGIN: &str = "DependencyManager";

/// Tag for children cancelled by a completed OCO parent.
pub const OCO_CANCELLED: &str = "OCO_CANCELLED";

/// Parent states that cascade a cancel to unsubmitted children.
const CASCADE_STATES: [LifecycleState; 4] = [
    LifecycleState::Cancelled,
    LifecycleState::Rejected,
    LifecycleState::Failed,
    LifecycleState::Expired,
];

#[derive(Debug)]
enum ParentEvent {
    Completed(String),
    Terminated(String, LifecycleState),
}

#[derive(Debug, Default)]
struct DependencyGraph {
    by_id: HashMap<String, OrderDependency>,
    /// Parent ID to edge IDs, in insertion order.
    by_parent: HashMap<String, Vec<String>>,
    /// Child ID to edge IDs, in insertion order.
    by_child: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    fn has_edge(&self, parent: &str, child: &str) -> bool {
        self.children_of(parent).any(|dep| dep.child_order_id == child)
    }

    fn children_of<'a>(&'a self, parent: &str) -> impl Iterator<Item = &'a OrderDependency> {
        self.by_parent
            .get(parent)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
    }

    /// Whether `to` is reachable from `from` along existing edges.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            stack.extend(self.children_of(&node).map(|dep| dep.child_order_id.clone()));
        }
        false
    }

    fn insert(&mut self, dependency: OrderDependency) {
        self.by_parent
            .entry(dependency.parent_order_id.clone())
            .or_default()
            .push(dependency.id.clone());
        self.by_child
            .entry(dependency.child_order_id.clone())
            .or_default()
            .push(dependency.id.clone());
        self.by_id.insert(dependency.id.clone(), dependency);
    }

    fn remove(&mut self, id: &str) -> Option<OrderDependency> {
        let dependency = self.by_id.remove(id)?;
        for (index, key) in [
            (&mut self.by_parent, &dependency.parent_order_id),
            (&mut self.by_child, &dependency.child_order_id),
        ] {
            if let Some(ids) = index.get_mut(key) {
                ids.retain(|existing| existing != id);
                if ids.is_empty() {
                    index.remove(key);
                }
            }
        }
        Some(dependency)
    }
}

/// Tracks parent/child edges between orders and drives children from
/// parent lifecycle events.
#[derive(Debug)]
pub struct DependencyManager {
    lifecycle: Arc<LifecycleManager>,
    classifier: Arc<ErrorClassifier>,
    graph: RwLock<DependencyGraph>,
}

impl DependencyManager {
    /// Create the manager, hook it into `lifecycle` and spawn its worker.
    ///
    /// The worker stops when `cancel` fires or the manager is dropped.
    pub fn start(
        lifecycle: Arc<LifecycleManager>,
        classifier: Arc<ErrorClassifier>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let manager = Arc::new(Self {
            lifecycle: Arc::clone(&lifecycle),
            classifier,
            graph: RwLock::new(DependencyGraph::default()),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let completed_tx = tx.clone();
        lifecycle.register_callback(LifecycleState::Completed, move |lifecycle, _| {
            let event = ParentEvent::Completed(lifecycle.order_id().to_string());
            if completed_tx.send(event).is_err() {
                tracing::warn!(
                    order_id = lifecycle.order_id(),
                    "Dependency worker stopped, dropping trigger"
                );
            }
        });
        for state in CASCADE_STATES {
            let tx = tx.clone();
            lifecycle.register_callback(state, move |lifecycle, _| {
                let event = ParentEvent::Terminated(lifecycle.order_id().to_string(), state);
                if tx.send(event).is_err() {
                    tracing::warn!(
                        order_id = lifecycle.order_id(),
                        state = %state,
                        "Dependency worker stopped, dropping cascade"
                    );
                }
            });
        }
        drop(tx);

        let worker = tokio::spawn(run_worker(Arc::downgrade(&manager), rx, cancel));
        (manager, worker)
    }

    /// Link `child_id` to `parent_id`.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` if either order has no lifecycle, and
    /// `ERR_INVALID_PARAMETER` for self-edges, duplicate edges and edges
    /// that would close a cycle.
    pub fn create_dependency(
        &self,
        parent_id: &str,
        child_id: &str,
        dependency_type: DependencyType,
        condition: Option<String>,
    ) -> Result<OrderDependency, ExecutionError> {
        if self.lifecycle.get_lifecycle(parent_id).is_err() {
            return Err(ExecutionError::not_found(
                format!("Parent order not found: {parent_id}"),
                ORIGIN,
            )
            .with_order(parent_id));
        }
        if self.lifecycle.get_lifecycle(child_id).is_err() {
            return Err(ExecutionError::not_found(
                format!("Child order not found: {child_id}"),
                ORIGIN,
            )
            .with_order(child_id));
        }
        if parent_id == child_id {
            return Err(ExecutionError::invalid_parameter(
                format!("Order cannot depend on itself: {parent_id}"),
                ORIGIN,
            )
            .with_order(parent_id));
        }

        let mut graph = self.graph.write().unwrap_or_else(PoisonError::into_inner);
        if graph.has_edge(parent_id, child_id) {
            return Err(ExecutionError::invalid_parameter(
                format!("Dependency already exists: {parent_id} -> {child_id}"),
                ORIGIN,
            ));
        }
        if graph.reaches(child_id, parent_id) {
            return Err(ExecutionError::invalid_parameter(
                format!("Dependency would create a cycle: {parent_id} -> {child_id}"),
                ORIGIN,
            ));
        }

        let dependency = OrderDependency::new(parent_id, child_id, dependency_type, condition);
        graph.insert(dependency.clone());
        drop(graph);

        tracing::info!(
            dependency_id = %dependency.id,
            parent_order_id = parent_id,
            child_order_id = child_id,
            dependency_type = %dependency_type,
            "Dependency created"
        );
        Ok(dependency)
    }

    /// Edges from `parent_id`, in insertion order.
    #[must_use]
    pub fn get_dependencies(&self, parent_id: &str) -> Vec<OrderDependency> {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .children_of(parent_id)
            .cloned()
            .collect()
    }

    /// Parent order of `child_id`; the oldest edge wins if there are several.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` if the child has no parent or the parent
    /// lifecycle is gone.
    pub fn get_parent_order(&self, child_id: &str) -> Result<Order, ExecutionError> {
        let parent_id = {
            let graph = self.graph.read().unwrap_or_else(PoisonError::into_inner);
            graph
                .by_child
                .get(child_id)
                .and_then(|ids| ids.first())
                .and_then(|id| graph.by_id.get(id))
                .map(|dep| dep.parent_order_id.clone())
        }
        .ok_or_else(|| {
            ExecutionError::not_found(
                format!("No parent order found for child order: {child_id}"),
                ORIGIN,
            )
            .with_order(child_id)
        })?;

        Ok(self.lifecycle.get_lifecycle(&parent_id)?.order().clone())
    }

    /// Remove the edge `dependency_id`.
    ///
    /// # Errors
    ///
    /// Returns `ERR_ORDER_NOT_FOUND` if no such edge exists.
    pub fn delete_dependency(&self, dependency_id: &str) -> Result<OrderDependency, ExecutionError> {
        let removed = self
            .graph
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(dependency_id)
            .ok_or_else(|| {
                ExecutionError::not_found(
                    format!("Dependency not found: {dependency_id}"),
                    ORIGIN,
                )
            })?;
        tracing::info!(dependency_id, "Dependency deleted");
        Ok(removed)
    }

    /// Act on every child of a completed parent.
    pub fn handle_parent_completed(&self, parent_id: &str) -> TriggerReport {
        let mut report = TriggerReport::default();
        for dependency in self.get_dependencies(parent_id) {
            let child_id = dependency.child_order_id.clone();
            let outcome = match dependency.dependency_type {
                DependencyType::Oto => self.trigger_child(&dependency),
                DependencyType::Oco => self.cancel_oco_child(&dependency),
            };
            self.record(&mut report, &dependency, child_id, outcome);
        }
        report
    }

    /// Cancel every unsubmitted child of a parent that ended in `state`.
    pub fn handle_parent_terminated(&self, parent_id: &str, state: LifecycleState) -> TriggerReport {
        let mut report = TriggerReport::default();
        let tag = format!("PARENT_{state}");
        for dependency in self.get_dependencies(parent_id) {
            let child_id = dependency.child_order_id.clone();
            let outcome = self.cascade_cancel(&dependency, &tag);
            self.record(&mut report, &dependency, child_id, outcome);
        }
        report
    }

    fn trigger_child(&self, dependency: &OrderDependency) -> Result<ChildOutcome, ExecutionError> {
        let child_id = &dependency.child_order_id;
        let current = self.lifecycle.current_state(child_id)?;

        let Some(path) = TransitionTable::path_to_submitted(current) else {
            if current.is_terminal() && current != LifecycleState::Completed {
                return Err(ExecutionError::invalid_order(
                    format!("Cannot trigger child order {child_id} from state {current}"),
                    ORIGIN,
                )
                .with_order(child_id.as_str()));
            }
            return Ok(ChildOutcome::Skipped);
        };

        let metadata = serde_json::json!({
            "parent_order_id": dependency.parent_order_id,
            "dependency_id": dependency.id,
        });
        for state in path {
            self.lifecycle.transition_state(
                child_id,
                state,
                event_types::DEPENDENCY_TRIGGERED,
                Some(metadata.clone()),
            )?;
        }
        Ok(ChildOutcome::Triggered)
    }

    fn cancel_oco_child(
        &self,
        dependency: &OrderDependency,
    ) -> Result<ChildOutcome, ExecutionError> {
        let child_id = &dependency.child_order_id;
        let current = self.lifecycle.current_state(child_id)?;
        if current.is_terminal() || current == LifecycleState::Cancelling {
            return Ok(ChildOutcome::Skipped);
        }

        let target = if current.is_at_or_past_submitted() {
            LifecycleState::Cancelling
        } else {
            LifecycleState::Cancelled
        };
        let metadata = serde_json::json!({ "parent_order_id": dependency.parent_order_id });
        self.lifecycle
            .transition_state(child_id, target, OCO_CANCELLED, Some(metadata))?;
        Ok(ChildOutcome::Cancelled)
    }

    fn cascade_cancel(
        &self,
        dependency: &OrderDependency,
        tag: &str,
    ) -> Result<ChildOutcome, ExecutionError> {
        let child_id = &dependency.child_order_id;
        let current = self.lifecycle.current_state(child_id)?;
        if current.is_at_or_past_submitted() {
            return Ok(ChildOutcome::Skipped);
        }
        let metadata = serde_json::json!({ "parent_order_id": dependency.parent_order_id });
        self.lifecycle
            .transition_state(child_id, LifecycleState::Cancelled, tag, Some(metadata))?;
        Ok(ChildOutcome::Cancelled)
    }

    fn record(
        &self,
        report: &mut TriggerReport,
        dependency: &OrderDependency,
        child_id: String,
        outcome: Result<ChildOutcome, ExecutionError>,
    ) {
        match outcome {
            Ok(ChildOutcome::Triggered) => {
                tracing::info!(
                    parent_order_id = %dependency.parent_order_id,
                    child_order_id = %child_id,
                    "Dependent order triggered"
                );
                report.triggered.push(child_id);
            }
            Ok(ChildOutcome::Cancelled) => {
                tracing::info!(
                    parent_order_id = %dependency.parent_order_id,
                    child_order_id = %child_id,
                    dependency_type = %dependency.dependency_type,
                    "Dependent order cancelled"
                );
                report.cancelled.push(child_id);
            }
            Ok(ChildOutcome::Skipped) => report.skipped.push(child_id),
            Err(err) => {
                let context = format!("dependency:{}", dependency.id);
                let decision = self.classifier.handle_error(&context, &err);
                self.classifier.release(&context);
                tracing::error!(
                    parent_order_id = %dependency.parent_order_id,
                    child_order_id = %child_id,
                    error = %decision.error,
                    "Failed to handle dependent order"
                );
                report.failed.push((child_id, decision.error));
            }
        }
    }
}

enum ChildOutcome {
    Triggered,
    Cancelled,
    Skipped,
}

async fn run_worker(
    manager: Weak<DependencyManager>,
    mut rx: mpsc::UnboundedReceiver<ParentEvent>,
    cancel: CancellationToken,
) {
    tracing::debug!("Dependency worker started");
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let Some(event) = event else { break };
        let Some(manager) = manager.upgrade() else { break };

        match event {
            ParentEvent::Completed(parent_id) => {
                manager.handle_parent_completed(&parent_id);
            }
            ParentEvent::Terminated(parent_id, state) => {
                manager.handle_parent_terminated(&parent_id, state);
            }
        }
    }
    tracing::debug!("Dependency worker stopped");
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::OrderSide;
    use crate::error::ErrorCode;

    struct Fixture {
        classifier: Arc<ErrorClassifier>,
        lifecycle: Arc<LifecycleManager>,
        deps: Arc<DependencyManager>,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let classifier = Arc::new(ErrorClassifier::default());
            let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&classifier)));
            let cancel = CancellationToken::new();
            let (deps, _worker) = DependencyManager::start(
                Arc::clone(&lifecycle),
                Arc::clone(&classifier),
                cancel.clone(),
            );
            Self {
                classifier,
                lifecycle,
                deps,
                cancel,
            }
        }

        fn order(&self, id: &str) {
            self.lifecycle
                .create_lifecycle(Order::limit(id, "INFY", OrderSide::Buy, dec!(1), dec!(100)))
                .unwrap();
        }

        fn advance(&self, id: &str, states: &[LifecycleState]) {
            for state in states {
                self.lifecycle.transition_state(id, *state, "TEST", None).unwrap();
            }
        }

        fn state(&self, id: &str) -> LifecycleState {
            self.lifecycle.current_state(id).unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    const TO_ACKNOWLEDGED: [LifecycleState; 3] = [
        LifecycleState::Validated,
        LifecycleState::Submitted,
        LifecycleState::Acknowledged,
    ];

    #[tokio::test]
    async fn test_missing_orders_are_reported_by_role() {
        let f = Fixture::new();
        f.order("child");
        let err = f
            .deps
            .create_dependency("ghost", "child", DependencyType::Oto, None)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::OrderNotFound);
        assert_eq!(err.message(), "Parent order not found: ghost");

        f.order("parent");
        let err = f
            .deps
            .create_dependency("parent", "ghost", DependencyType::Oto, None)
            .unwrap_err();
        assert_eq!(err.message(), "Child order not found: ghost");
    }

    #[tokio::test]
    async fn test_rejects_self_duplicate_and_cycle() {
        let f = Fixture::new();
        for id in ["a", "b", "c"] {
            f.order(id);
        }
        let invalid = |parent: &str, child: &str| {
            f.deps
                .create_dependency(parent, child, DependencyType::Oto, None)
                .unwrap_err()
                .code()
        };

        assert_eq!(invalid("a", "a"), ErrorCode::InvalidParameter);
        f.deps.create_dependency("a", "b", DependencyType::Oto, None).unwrap();
        f.deps.create_dependency("b", "c", DependencyType::Oto, None).unwrap();
        assert_eq!(invalid("a", "b"), ErrorCode::InvalidParameter);
        assert_eq!(invalid("c", "a"), ErrorCode::InvalidParameter);
    }

    #[tokio::test]
    async fn test_dependencies_in_insertion_order() {
        let f = Fixture::new();
        for id in ["p", "c1", "c2", "c3"] {
            f.order(id);
        }
        for child in ["c2", "c1", "c3"] {
            f.deps
                .create_dependency("p", child, DependencyType::Oto, Some("filled".into()))
                .unwrap();
        }
        let children: Vec<_> = f
            .deps
            .get_dependencies("p")
            .into_iter()
            .map(|dep| dep.child_order_id)
            .collect();
        assert_eq!(children, vec!["c2", "c1", "c3"]);
        assert!(f.deps.get_dependencies("c1").is_empty());
    }

    #[tokio::test]
    async fn test_parent_lookup_and_delete() {
        let f = Fixture::new();
        f.order("p");
        f.order("c");
        let dep = f.deps.create_dependency("p", "c", DependencyType::Oto, None).unwrap();

        assert_eq!(f.deps.get_parent_order("c").unwrap().id, "p");
        let err = f.deps.get_parent_order("p").unwrap_err();
        assert_eq!(err.code(), ErrorCode::OrderNotFound);

        f.deps.delete_dependency(&dep.id).unwrap();
        assert!(f.deps.get_parent_order("c").is_err());
        assert_eq!(
            f.deps.delete_dependency(&dep.id).unwrap_err().code(),
            ErrorCode::OrderNotFound
        );
    }

    #[tokio::test]
    async fn test_oto_trigger_walks_legal_chain() {
        let f = Fixture::new();
        f.order("p");
        f.order("c");
        f.deps.create_dependency("p", "c", DependencyType::Oto, None).unwrap();

        let report = f.deps.handle_parent_completed("p");

        assert_eq!(report.triggered, vec!["c".to_string()]);
        let events = f.lifecycle.get_order_events("c").unwrap();
        let states: Vec<_> = events.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                LifecycleState::Created,
                LifecycleState::Validated,
                LifecycleState::Submitted
            ]
        );
        assert_eq!(events[2].event_type, event_types::DEPENDENCY_TRIGGERED);
    }

    #[tokio::test]
    async fn test_oto_trigger_is_idempotent() {
        let f = Fixture::new();
        f.order("p");
        f.order("c");
        f.deps.create_dependency("p", "c", DependencyType::Oto, None).unwrap();

        f.deps.handle_parent_completed("p");
        let report = f.deps.handle_parent_completed("p");

        assert_eq!(report.skipped, vec!["c".to_string()]);
        assert_eq!(f.lifecycle.get_order_events("c").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_trigger_of_cancelled_child_fails_cleanly() {
        let f = Fixture::new();
        f.order("p");
        f.order("c");
        f.deps.create_dependency("p", "c", DependencyType::Oto, None).unwrap();
        f.advance("c", &[LifecycleState::Cancelled]);

        let report = f.deps.handle_parent_completed("p");

        assert!(!report.is_clean());
        assert_eq!(report.failed[0].0, "c");
        assert_eq!(f.state("c"), LifecycleState::Cancelled);
        assert_eq!(f.classifier.tracked_contexts(), 0);
    }

    #[tokio::test]
    async fn test_oco_cancels_instead_of_triggering() {
        let f = Fixture::new();
        for id in ["p", "pending", "live"] {
            f.order(id);
        }
        f.advance("live", &TO_ACKNOWLEDGED);
        f.deps.create_dependency("p", "pending", DependencyType::Oco, None).unwrap();
        f.deps.create_dependency("p", "live", DependencyType::Oco, None).unwrap();

        let report = f.deps.handle_parent_completed("p");

        assert_eq!(report.cancelled.len(), 2);
        assert_eq!(f.state("pending"), LifecycleState::Cancelled);
        assert_eq!(f.state("live"), LifecycleState::Cancelling);
    }

    #[tokio::test]
    async fn test_parent_rejection_cascades_to_unsubmitted_children() {
        let f = Fixture::new();
        for id in ["p", "waiting", "live"] {
            f.order(id);
        }
        f.advance("live", &TO_ACKNOWLEDGED);
        f.deps.create_dependency("p", "waiting", DependencyType::Oto, None).unwrap();
        f.deps.create_dependency("p", "live", DependencyType::Oto, None).unwrap();

        let report = f
            .deps
            .handle_parent_terminated("p", LifecycleState::Rejected);

        assert_eq!(report.cancelled, vec!["waiting".to_string()]);
        assert_eq!(report.skipped, vec!["live".to_string()]);
        let last = f.lifecycle.get_lifecycle("waiting").unwrap();
        assert_eq!(last.last_event().unwrap().event_type, "PARENT_REJECTED");
    }

    #[tokio::test]
    async fn test_worker_triggers_after_parent_completes() {
        let f = Fixture::new();
        f.order("p");
        f.order("c");
        f.deps.create_dependency("p", "c", DependencyType::Oto, None).unwrap();

        f.advance("p", &TO_ACKNOWLEDGED);
        f.advance("p", &[LifecycleState::Completed]);

        for _ in 0..100 {
            if f.state("c") == LifecycleState::Submitted {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("child was never triggered");
    }
}
