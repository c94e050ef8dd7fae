//! Dependency records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecutionError;

/// How a parent order's completion affects its child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyType {
    /// One-triggers-other: the child is submitted once the parent completes.
    Oto,
    /// One-cancels-other: the child is cancelled once the parent completes.
    Oco,
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oto => write!(f, "OTO"),
            Self::Oco => write!(f, "OCO"),
        }
    }
}

/// Directed edge from a parent order to a child order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDependency {
    /// Dependency ID.
    pub id: String,
    /// Order whose outcome drives the child.
    pub parent_order_id: String,
    /// Order driven by the parent.
    pub child_order_id: String,
    /// Edge semantics.
    pub dependency_type: DependencyType,
    /// Free-form condition recorded with the edge.
    pub condition: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl OrderDependency {
    pub(crate) fn new(
        parent_order_id: &str,
        child_order_id: &str,
        dependency_type: DependencyType,
        condition: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_order_id: parent_order_id.to_string(),
            child_order_id: child_order_id.to_string(),
            dependency_type,
            condition,
            created_at: Utc::now(),
        }
    }
}

/// What happened to each child when a parent event was handled.
#[derive(Debug, Default)]
pub struct TriggerReport {
    /// Children advanced to `Submitted`.
    pub triggered: Vec<String>,
    /// Children moved to `Cancelled` or `Cancelling`.
    pub cancelled: Vec<String>,
    /// Children left alone because they were already past the point of action.
    pub skipped: Vec<String>,
    /// Children that could not be handled.
    pub failed: Vec<(String, ExecutionError)>,
}

impl TriggerReport {
    /// Returns true if every child was handled.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
