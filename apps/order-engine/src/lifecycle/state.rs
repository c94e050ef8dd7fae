//! Lifecycle states and the transition table.
//!
//! # State Machine
//!
//! ```text
//! CREATED → VALIDATED → SUBMITTED → ACKNOWLEDGED → PARTIALLY_FILLED → COMPLETED
//!                           │             │               │
//!                           └─────────────┴───────────────┴──→ CANCELLING → CANCELLED
//!
//! Any non-terminal state → CANCELLED | REJECTED | FAILED
//! Any state before CANCELLING → EXPIRED (good-till-date orders)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::OrderStatus;

/// State of an order's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Entered the engine.
    Created,
    /// Passed risk validation.
    Validated,
    /// Sent to the venue.
    Submitted,
    /// Accepted by the venue.
    Acknowledged,
    /// Some quantity filled.
    PartiallyFilled,
    /// Fully filled.
    Completed,
    /// Cancel requested, awaiting venue confirmation.
    Cancelling,
    /// Cancelled.
    Cancelled,
    /// Rejected by risk or venue.
    Rejected,
    /// Good-till-date expiry passed.
    Expired,
    /// Could not be executed.
    Failed,
}

impl LifecycleState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::Created,
        Self::Validated,
        Self::Submitted,
        Self::Acknowledged,
        Self::PartiallyFilled,
        Self::Completed,
        Self::Cancelling,
        Self::Cancelled,
        Self::Rejected,
        Self::Expired,
        Self::Failed,
    ];

    /// Returns true if no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Rejected | Self::Expired | Self::Failed
        )
    }

    /// Returns true if the order has reached the venue.
    #[must_use]
    pub const fn is_at_or_past_submitted(self) -> bool {
        !matches!(self, Self::Created | Self::Validated)
    }

    /// Status projected onto the order.
    #[must_use]
    pub const fn order_status(self) -> OrderStatus {
        match self {
            Self::Created | Self::Validated => OrderStatus::Pending,
            Self::Submitted => OrderStatus::Submitted,
            Self::Acknowledged | Self::Cancelling => OrderStatus::Open,
            Self::PartiallyFilled => OrderStatus::Partial,
            Self::Completed => OrderStatus::Completed,
            Self::Cancelled | Self::Expired => OrderStatus::Cancelled,
            Self::Rejected => OrderStatus::Rejected,
            Self::Failed => OrderStatus::Failed,
        }
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Validated => "VALIDATED",
            Self::Submitted => "SUBMITTED",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Completed => "COMPLETED",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition table for order lifecycles.
pub struct TransitionTable;

impl TransitionTable {
    /// Check if a state transition is valid.
    #[must_use]
    pub const fn is_valid(from: LifecycleState, to: LifecycleState) -> bool {
        use LifecycleState::{
            Acknowledged, Cancelled, Cancelling, Completed, Created, Expired, Failed,
            PartiallyFilled, Rejected, Submitted, Validated,
        };

        matches!(
            (from, to),
            // Absorbing failures from any non-terminal state
            (
                Created | Validated | Submitted | Acknowledged | PartiallyFilled | Cancelling,
                Cancelled | Rejected | Failed
            )
            // Expiry before a cancel is in flight
            | (
                Created | Validated | Submitted | Acknowledged | PartiallyFilled,
                Expired
            )
            // Happy path
            | (Created, Validated)
            | (Validated, Submitted)
            | (Submitted, Acknowledged)
            | (Acknowledged | PartiallyFilled, PartiallyFilled)
            | (Acknowledged | PartiallyFilled | Cancelling, Completed)
            // Cancel requests
            | (Submitted | Acknowledged | PartiallyFilled, Cancelling)
        )
    }

    /// All valid next states from `from`, in declaration order.
    #[must_use]
    pub fn valid_next_states(from: LifecycleState) -> Vec<LifecycleState> {
        LifecycleState::ALL
            .into_iter()
            .filter(|to| Self::is_valid(from, *to))
            .collect()
    }

    /// Legal path from `from` to `Submitted`, excluding `from` itself.
    ///
    /// Returns `None` when `Submitted` cannot be reached.
    #[must_use]
    pub fn path_to_submitted(from: LifecycleState) -> Option<Vec<LifecycleState>> {
        match from {
            LifecycleState::Created => {
                Some(vec![LifecycleState::Validated, LifecycleState::Submitted])
            }
            LifecycleState::Validated => Some(vec![LifecycleState::Submitted]),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The full table, written out independently of the `matches!` above.
    fn expected_targets(from: LifecycleState) -> Vec<LifecycleState> {
        use LifecycleState::*;
        match from {
            Created => vec![Validated, Cancelled, Rejected, Expired, Failed],
            Validated => vec![Submitted, Cancelled, Rejected, Expired, Failed],
            Submitted => vec![Acknowledged, Cancelling, Cancelled, Rejected, Expired, Failed],
            Acknowledged => vec![
                PartiallyFilled,
                Completed,
                Cancelling,
                Cancelled,
                Rejected,
                Expired,
                Failed,
            ],
            PartiallyFilled => vec![
                PartiallyFilled,
                Completed,
                Cancelling,
                Cancelled,
                Rejected,
                Expired,
                Failed,
            ],
            Cancelling => vec![Completed, Cancelled, Rejected, Failed],
            Completed | Cancelled | Rejected | Expired | Failed => vec![],
        }
    }

    #[test]
    fn table_matches_every_pair() {
        for from in LifecycleState::ALL {
            let expected = expected_targets(from);
            for to in LifecycleState::ALL {
                assert_eq!(
                    TransitionTable::is_valid(from, to),
                    expected.contains(&to),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for state in LifecycleState::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(TransitionTable::valid_next_states(state).is_empty(), "{state}");
        }
    }

    #[test]
    fn absorbing_states_reachable_from_all_non_terminal() {
        for from in LifecycleState::ALL.into_iter().filter(|s| !s.is_terminal()) {
            for to in [
                LifecycleState::Cancelled,
                LifecycleState::Rejected,
                LifecycleState::Failed,
            ] {
                assert!(TransitionTable::is_valid(from, to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn path_to_submitted() {
        assert_eq!(
            TransitionTable::path_to_submitted(LifecycleState::Created),
            Some(vec![LifecycleState::Validated, LifecycleState::Submitted])
        );
        assert_eq!(
            TransitionTable::path_to_submitted(LifecycleState::Validated),
            Some(vec![LifecycleState::Submitted])
        );
        assert_eq!(TransitionTable::path_to_submitted(LifecycleState::Cancelled), None);
    }

    #[test]
    fn status_projection() {
        assert_eq!(LifecycleState::Validated.order_status(), OrderStatus::Pending);
        assert_eq!(LifecycleState::Cancelling.order_status(), OrderStatus::Open);
        assert_eq!(LifecycleState::Expired.order_status(), OrderStatus::Cancelled);
    }

    #[test]
    fn serde_uses_screaming_case() {
        let json = serde_json::to_string(&LifecycleState::PartiallyFilled).unwrap();
        assert_eq!(json, "\"PARTIALLY_FILLED\"");
    }
}
