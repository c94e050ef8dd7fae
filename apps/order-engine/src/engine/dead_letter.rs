//! Dead-letter queue for orders whose submission exhausted its retries.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::domain::{Order, Portfolio, Strategy};
use crate::error::ExecutionError;
use crate::observability;

/// A parked submission, with everything needed to run it again.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Order as it was submitted.
    pub order: Order,
    /// Portfolio snapshot used for risk validation.
    pub portfolio: Portfolio,
    /// Originating strategy.
    pub strategy: Strategy,
    /// User whose session routes the order.
    pub user_id: String,
    /// Final classified error.
    pub error: ExecutionError,
    /// Venue calls made across every run.
    pub attempts: u32,
    /// When the order was parked.
    pub parked_at: DateTime<Utc>,
}

/// In-memory dead letters keyed by order ID.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    entries: RwLock<HashMap<String, DeadLetter>>,
}

impl DeadLetterQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `letter`, replacing any earlier entry for the same order.
    pub fn add(&self, letter: DeadLetter) {
        let size = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.insert(letter.order.id.clone(), letter);
            entries.len()
        };
        observability::update_dead_letter_size(size);
    }

    /// Parked entry for `order_id`.
    #[must_use]
    pub fn get(&self, order_id: &str) -> Option<DeadLetter> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .cloned()
    }

    /// Every parked entry, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<DeadLetter> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        letters.sort_by(|a, b| {
            a.parked_at
                .cmp(&b.parked_at)
                .then_with(|| a.order.id.cmp(&b.order.id))
        });
        letters
    }

    /// Take the entry for `order_id` out of the queue.
    pub fn remove(&self, order_id: &str) -> Option<DeadLetter> {
        let (letter, size) = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let letter = entries.remove(order_id);
            (letter, entries.len())
        };
        if letter.is_some() {
            observability::update_dead_letter_size(size);
        }
        letter
    }

    /// Number of parked orders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::OrderSide;

    fn letter(id: &str, parked_at: DateTime<Utc>) -> DeadLetter {
        DeadLetter {
            order: Order::limit(id, "INFY", OrderSide::Buy, dec!(1), dec!(100)),
            portfolio: Portfolio::new("p1", dec!(100000)),
            strategy: Strategy::default(),
            user_id: "u1".to_string(),
            error: ExecutionError::connection("venue unreachable", "test"),
            attempts: 3,
            parked_at,
        }
    }

    #[test]
    fn test_add_replaces_same_order() {
        let queue = DeadLetterQueue::new();
        let now = Utc::now();
        queue.add(letter("o1", now));
        let mut again = letter("o1", now);
        again.attempts = 6;
        queue.add(again);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get("o1").unwrap().attempts, 6);
    }

    #[test]
    fn test_list_is_oldest_first() {
        let queue = DeadLetterQueue::new();
        let now = Utc::now();
        queue.add(letter("late", now));
        queue.add(letter("early", now - Duration::seconds(5)));

        let ids: Vec<String> = queue.list().into_iter().map(|l| l.order.id).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn test_remove_takes_entry() {
        let queue = DeadLetterQueue::new();
        queue.add(letter("o1", Utc::now()));

        assert!(queue.remove("o1").is_some());
        assert!(queue.remove("o1").is_none());
        assert!(queue.is_empty());
    }
}
