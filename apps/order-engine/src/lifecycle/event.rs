//! Lifecycle events and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::LifecycleState;
use crate::domain::Order;

/// Event tags used by the engine itself.
pub mod event_types {
    /// First event of every lifecycle.
    pub const ORDER_CREATED: &str = "ORDER_CREATED";
    /// Risk validation passed.
    pub const VALIDATION_PASSED: &str = "VALIDATION_PASSED";
    /// Risk validation failed.
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    /// Venue accepted the submission.
    pub const ORDER_SUBMITTED: &str = "ORDER_SUBMITTED";
    /// Submission exhausted its retries.
    pub const SUBMISSION_FAILED: &str = "SUBMISSION_FAILED";
    /// Venue acknowledged the order.
    pub const ORDER_ACKNOWLEDGED: &str = "ORDER_ACKNOWLEDGED";
    /// Venue reported a partial fill.
    pub const PARTIAL_FILL: &str = "PARTIAL_FILL";
    /// Venue reported the final fill.
    pub const ORDER_FILLED: &str = "ORDER_FILLED";
    /// Cancel requested.
    pub const CANCEL_REQUESTED: &str = "CANCEL_REQUESTED";
    /// Venue confirmed the cancel.
    pub const ORDER_CANCELLED: &str = "ORDER_CANCELLED";
    /// Venue rejected the order.
    pub const ORDER_REJECTED: &str = "ORDER_REJECTED";
    /// Good-till-date expiry passed.
    pub const ORDER_EXPIRED: &str = "ORDER_EXPIRED";
    /// Dependent order triggered by its parent.
    pub const DEPENDENCY_TRIGGERED: &str = "DEPENDENCY_TRIGGERED";
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Event ID.
    pub id: String,
    /// Order the event belongs to.
    pub order_id: String,
    /// Free-form cause tag, e.g. `VALIDATION_PASSED`.
    pub event_type: String,
    /// State before the transition; `None` for the first event.
    pub previous_state: Option<LifecycleState>,
    /// State after the transition.
    pub state: LifecycleState,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied detail.
    pub metadata: Option<serde_json::Value>,
}

impl OrderEvent {
    fn new(
        order_id: &str,
        event_type: &str,
        previous_state: Option<LifecycleState>,
        state: LifecycleState,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            event_type: event_type.to_string(),
            previous_state,
            state,
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// State machine and history for one order.
///
/// Values handed out by the manager are snapshots; mutating one does not
/// affect the tracked lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLifecycle {
    order: Order,
    current_state: LifecycleState,
    events: Vec<OrderEvent>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl OrderLifecycle {
    /// Start a lifecycle in `Created` with its first event.
    pub(crate) fn start(mut order: Order) -> Self {
        let now = Utc::now();
        order.status = LifecycleState::Created.order_status();
        order.updated_at = now;
        let expires_at = order.expires_at();
        let event = OrderEvent::new(
            &order.id,
            event_types::ORDER_CREATED,
            None,
            LifecycleState::Created,
            None,
        );
        Self {
            order,
            current_state: LifecycleState::Created,
            events: vec![event],
            created_at: now,
            updated_at: now,
            expires_at,
        }
    }

    /// Apply an already validated transition and return the new event.
    pub(crate) fn apply(
        &mut self,
        to: LifecycleState,
        event_type: &str,
        metadata: Option<serde_json::Value>,
    ) -> OrderEvent {
        let event = OrderEvent::new(
            &self.order.id,
            event_type,
            Some(self.current_state),
            to,
            metadata,
        );
        self.current_state = to;
        self.updated_at = event.timestamp;
        self.order.status = to.order_status();
        self.order.updated_at = event.timestamp;
        self.events.push(event.clone());
        event
    }

    /// Order snapshot.
    #[must_use]
    pub const fn order(&self) -> &Order {
        &self.order
    }

    /// Order ID.
    #[must_use]
    pub fn order_id(&self) -> &str {
        &self.order.id
    }

    /// Current state.
    #[must_use]
    pub const fn current_state(&self) -> LifecycleState {
        self.current_state
    }

    /// Event history, oldest first.
    #[must_use]
    pub fn events(&self) -> &[OrderEvent] {
        &self.events
    }

    /// Most recent event.
    #[must_use]
    pub fn last_event(&self) -> Option<&OrderEvent> {
        self.events.last()
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last transition.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Good-till-date expiry.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether a GTD expiry has passed at `now` while the order is still live.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.current_state.is_terminal()
            && self.current_state != LifecycleState::Cancelling
            && self.expires_at.is_some_and(|at| at <= now)
    }
}
