//! Lifecycle Integration Tests
//!
//! Drives real lifecycles through the manager to check the transition table
//! end to end, event accounting, and callback dispatch order.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};

use order_engine::domain::{Order, OrderSide, OrderStatus};
use order_engine::error::ErrorCode;
use order_engine::lifecycle::LifecycleState::{
    Acknowledged, Cancelled, Cancelling, Completed, Created, Expired, Failed, PartiallyFilled,
    Rejected, Submitted, Validated,
};
use order_engine::lifecycle::{LifecycleManager, LifecycleState, TransitionTable};
use order_engine::resilience::ErrorClassifier;
use rust_decimal_macros::dec;
use test_case::test_case;

const EVENT: &str = "TEST_TRANSITION";

fn manager() -> LifecycleManager {
    LifecycleManager::new(Arc::new(ErrorClassifier::default()))
}

fn order(id: &str) -> Order {
    Order::limit(id, "TCS", OrderSide::Sell, dec!(3), dec!(3900))
}

/// Legal path from `Created` to `target`.
fn path_to(target: LifecycleState) -> Vec<LifecycleState> {
    match target {
        Created => vec![],
        Validated => vec![Validated],
        Submitted => vec![Validated, Submitted],
        Acknowledged => vec![Validated, Submitted, Acknowledged],
        PartiallyFilled => vec![Validated, Submitted, Acknowledged, PartiallyFilled],
        Completed => vec![Validated, Submitted, Acknowledged, Completed],
        Cancelling => vec![Validated, Submitted, Cancelling],
        Cancelled | Rejected | Expired | Failed => vec![target],
    }
}

fn drive(manager: &LifecycleManager, order_id: &str, target: LifecycleState) {
    manager.create_lifecycle(order(order_id)).unwrap();
    for state in path_to(target) {
        manager.transition_state(order_id, state, EVENT, None).unwrap();
    }
}

#[test]
fn test_every_pair_follows_transition_table() {
    let manager = manager();
    for (i, from) in LifecycleState::ALL.into_iter().enumerate() {
        for (j, to) in LifecycleState::ALL.into_iter().enumerate() {
            let order_id = format!("o-{i}-{j}");
            drive(&manager, &order_id, from);
            let before = manager.get_lifecycle(&order_id).unwrap();

            let result = manager.transition_state(&order_id, to, EVENT, None);

            let after = manager.get_lifecycle(&order_id).unwrap();
            if TransitionTable::is_valid(from, to) {
                let lifecycle = result.unwrap();
                assert_eq!(lifecycle.current_state(), to, "{from} -> {to}");
                assert_eq!(after.events().len(), before.events().len() + 1);
            } else {
                let err = result.unwrap_err();
                assert_eq!(err.code(), ErrorCode::InvalidOrder, "{from} -> {to}");
                assert_eq!(after.current_state(), from, "{from} -> {to}");
                assert_eq!(after.events().len(), before.events().len());
            }
        }
    }
}

#[test_case(Completed, OrderStatus::Completed ; "completed")]
#[test_case(Cancelling, OrderStatus::Open ; "cancelling")]
#[test_case(Expired, OrderStatus::Cancelled ; "expired")]
#[test_case(Failed, OrderStatus::Failed ; "failed")]
fn test_event_count_and_projected_status(target: LifecycleState, status: OrderStatus) {
    let manager = manager();
    drive(&manager, "o1", target);

    let lifecycle = manager.get_lifecycle("o1").unwrap();
    assert_eq!(lifecycle.events().len(), 1 + path_to(target).len());
    assert_eq!(lifecycle.order().status, status);
    assert_eq!(
        manager.get_order_events("o1").unwrap().len(),
        lifecycle.events().len()
    );
}

#[test]
fn test_callbacks_see_snapshots_in_transition_order() {
    let manager = Arc::new(manager());
    let seen = Arc::new(Mutex::new(Vec::new()));
    for state in [Validated, Submitted, Acknowledged, Completed] {
        let seen = Arc::clone(&seen);
        manager.register_callback(state, move |lifecycle, event| {
            seen.lock()
                .unwrap()
                .push((lifecycle.order_id().to_string(), event.state));
        });
    }

    drive(&manager, "o1", Completed);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("o1".to_string(), Validated),
            ("o1".to_string(), Submitted),
            ("o1".to_string(), Acknowledged),
            ("o1".to_string(), Completed),
        ]
    );
}

#[test]
fn test_terminal_orders_leave_active_set() {
    let manager = manager();
    drive(&manager, "live", Acknowledged);
    drive(&manager, "done", Completed);
    drive(&manager, "dead", Rejected);

    let active: Vec<_> = manager
        .active_lifecycles()
        .iter()
        .map(|lifecycle| lifecycle.order_id().to_string())
        .collect();
    assert_eq!(active, vec!["live".to_string()]);
    assert_eq!(manager.len(), 3);
}
