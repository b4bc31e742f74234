//! Positional writes racing a concurrent sibling insertion.

use std::sync::Arc;

use broker_rs::core::{AppId, Application, DomainId, NewOperation, OpState, OpType, OwnerId};
use broker_rs::ledger::{LedgerError, OperationLedger, RecordOutcome};
use broker_rs::store::DocumentStore;

use crate::fixtures::interleave::InterleavingStore;

fn seeded() -> (Arc<InterleavingStore>, OperationLedger, AppId) {
    let store = Arc::new(InterleavingStore::new());
    let app = Application::new(
        AppId::generate(),
        "shop",
        OwnerId::generate(),
        DomainId::generate(),
    );
    store.put_application(&app).unwrap();
    let ledger = OperationLedger::new(store.clone());
    (store, ledger, app.id)
}

#[test]
fn shifted_position_is_re_resolved_on_second_attempt() {
    let (store, ledger, app) = seeded();
    let group = ledger.open_group(&app, "create_app").unwrap();
    let record = ledger
        .create(&app, &group.id, NewOperation::new(OpType::CreateGear))
        .unwrap();

    let queued = ledger.transition(&app, &record.id, OpState::Queued).unwrap();
    assert!(matches!(queued, RecordOutcome::Applied { attempts: 1, .. }));

    store.interfere_next(1);
    let completed = ledger
        .transition(&app, &record.id, OpState::Completed)
        .unwrap();
    let RecordOutcome::Applied { record: written, attempts } = completed else {
        panic!("expected applied, got {completed:?}");
    };
    assert_eq!(attempts, 2);
    assert_eq!(written.state, OpState::Completed);
    assert_eq!(store.injected(), 1);

    let groups = ledger.pending(&app).unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].action, "sibling");
    assert_eq!(groups[1].ops[0].state, OpState::Completed);
}

#[test]
fn exhaustion_returns_last_seen_state_without_error() {
    let (store, ledger, app) = seeded();
    let group = ledger.open_group(&app, "scale_up").unwrap();
    let record = ledger
        .create(&app, &group.id, NewOperation::new(OpType::ScaleUp))
        .unwrap();
    ledger.transition(&app, &record.id, OpState::Queued).unwrap();

    store.interfere_next(u32::MAX);
    let outcome = ledger
        .transition(&app, &record.id, OpState::Completed)
        .unwrap();
    let RecordOutcome::Exhausted { attempts, last_seen } = outcome else {
        panic!("expected exhausted, got {outcome:?}");
    };
    assert_eq!(attempts, ledger.max_attempts());
    assert_eq!(last_seen.map(|r| r.state), Some(OpState::Queued));

    store.interfere_next(0);
    let stored = ledger.pending(&app).unwrap();
    let ours = stored.iter().find(|g| g.id == group.id).unwrap();
    assert_eq!(ours.ops[0].state, OpState::Queued);
}

#[test]
fn retry_budget_is_configurable() {
    let (store, ledger, app) = seeded();
    let ledger = ledger.with_max_attempts(3);
    let group = ledger.open_group(&app, "update_keys").unwrap();
    let record = ledger
        .create(&app, &group.id, NewOperation::new(OpType::UpdateSshKeys))
        .unwrap();

    store.interfere_next(u32::MAX);
    let outcome = ledger.transition(&app, &record.id, OpState::Queued).unwrap();
    assert!(matches!(outcome, RecordOutcome::Exhausted { attempts: 3, .. }));
    assert_eq!(store.injected(), 3);
}

#[test]
fn contended_create_is_a_typed_error() {
    let (store, ledger, app) = seeded();
    let group = ledger.open_group(&app, "add_component").unwrap();

    store.interfere_next(u32::MAX);
    let err = ledger
        .create(&app, &group.id, NewOperation::new(OpType::AddComponent))
        .unwrap_err();
    assert!(matches!(err, LedgerError::Contended { attempts: 5, .. }));
}

#[test]
fn exhaustion_reports_the_state_the_rival_wrote() {
    let (store, ledger, app) = seeded();
    let ledger = ledger.with_max_attempts(1);
    let group = ledger.open_group(&app, "destroy_gear").unwrap();
    let record = ledger
        .create(&app, &group.id, NewOperation::new(OpType::DestroyGear))
        .unwrap();
    ledger.transition(&app, &record.id, OpState::Queued).unwrap();

    store.rival_sets_state(record.id, OpState::Failed);
    store.interfere_next(1);
    let outcome = ledger
        .transition(&app, &record.id, OpState::Completed)
        .unwrap();
    let RecordOutcome::Exhausted { attempts, last_seen } = outcome else {
        panic!("expected exhausted, got {outcome:?}");
    };
    assert_eq!(attempts, 1);
    assert_eq!(last_seen.map(|r| r.state), Some(OpState::Failed));
}
