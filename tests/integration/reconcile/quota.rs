use broker_rs::core::{AppId, DomainId};
use broker_rs::lock::{DistributedLock, LockKey};
use broker_rs::reconcile::{
    Category, CategorySummary, FailureKind, Finding, ReconcileOptions, RepairStatus,
    recompute_consumed_gears,
};

use crate::fixtures::fleet::Fleet;

#[test]
fn drifted_counter_is_recomputed_from_gears() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("alice");
    fleet.app(&owner, &domain, "a1", 2, "node-1");
    fleet.app(&owner, &domain, "a2", 2, "node-1");
    fleet.app(&owner, &domain, "a3", 3, "node-2");
    fleet.store.set_consumed_gears(&owner.id, 5).unwrap();

    let report = fleet.reconciler().run(&ReconcileOptions::default()).unwrap();

    let check = report.check(Category::Quota).unwrap();
    let [Finding::Quota(error)] = check.findings.as_slice() else {
        panic!("expected one quota finding, got {:?}", check.findings);
    };
    assert_eq!((error.recorded, error.actual), (5, 7));
    assert_eq!(error.login, "alice");
    assert_eq!(
        report.category(Category::Quota),
        CategorySummary {
            detected: 1,
            fixed: 1,
            failed: 0
        }
    );
    assert_eq!(report.category(Category::SshKeys).detected, 0);
    assert_eq!(report.category(Category::Uids).detected, 0);
    assert_eq!(report.exit_code(), 1);

    let stored = fleet.store.find_owner(&owner.id).unwrap().unwrap();
    assert_eq!(stored.consumed_gears, 7);
    assert_eq!(
        recompute_consumed_gears(fleet.store.as_ref(), &owner.id).unwrap(),
        stored.consumed_gears
    );

    let second = fleet.reconciler().run(&ReconcileOptions::default()).unwrap();
    assert!(!second.has_inconsistencies());
    assert_eq!(second.exit_code(), 0);
    assert!(second.repairs.is_empty());
}

#[test]
fn held_owner_lock_skips_only_that_owner() {
    let mut fleet = Fleet::in_memory();
    let (busy, busy_domain) = fleet.owner("busy");
    let (free, free_domain) = fleet.owner("free");
    fleet.app(&busy, &busy_domain, "b1", 2, "node-1");
    fleet.app(&free, &free_domain, "f1", 3, "node-2");
    fleet.store.set_consumed_gears(&busy.id, 9).unwrap();
    fleet.store.set_consumed_gears(&free.id, 0).unwrap();

    let outsider = DistributedLock::new(fleet.store.clone());
    assert!(outsider.acquire(&LockKey::owner(&busy.id), 600).unwrap());

    let report = fleet
        .reconciler()
        .run(&ReconcileOptions::only(&[Category::Quota]))
        .unwrap();

    assert_eq!(
        report.category(Category::Quota),
        CategorySummary {
            detected: 2,
            fixed: 1,
            failed: 1
        }
    );
    let failed: Vec<_> = report
        .repairs
        .iter()
        .filter(|r| r.status == RepairStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failure, Some(FailureKind::LockUnavailable));
    assert!(failed[0].target.contains(&busy.id.to_string()));

    assert_eq!(
        fleet.store.find_owner(&busy.id).unwrap().unwrap().consumed_gears,
        9
    );
    assert_eq!(
        fleet.store.find_owner(&free.id).unwrap().unwrap().consumed_gears,
        3
    );
    let held = outsider.inspect(&LockKey::owner(&busy.id)).unwrap().unwrap();
    assert!(held.locked, "a lease we never took must not be released");
    assert!(report.check(Category::Uids).is_none());
}

#[test]
fn report_only_detects_the_same_and_writes_nothing() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("carol");
    fleet.app(&owner, &domain, "c1", 4, "node-1");
    fleet.store.set_consumed_gears(&owner.id, 1).unwrap();

    let dry = fleet.reconciler().run(&ReconcileOptions::report_only()).unwrap();
    assert!(dry.report_only);
    assert!(dry.repairs.is_empty());
    assert_eq!(dry.exit_code(), 1);
    assert_eq!(
        fleet.store.find_owner(&owner.id).unwrap().unwrap().consumed_gears,
        1
    );

    let fix = fleet.reconciler().run(&ReconcileOptions::default()).unwrap();
    assert_eq!(dry.checks, fix.checks);
    assert_eq!(fix.exit_code(), 1);
}

#[test]
fn application_without_domain_counts_toward_nobody() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("dave");
    let app = fleet.app(&owner, &domain, "d1", 2, "node-1");
    let mut orphan = app.clone();
    orphan.id = AppId::generate();
    orphan.domain_id = DomainId::generate();
    fleet.store.put_application(&orphan).unwrap();

    let report = fleet
        .reconciler()
        .run(&ReconcileOptions::only(&[Category::Quota]))
        .unwrap();
    assert!(!report.has_inconsistencies());
    assert_eq!(report.stats.applications, 2);
    assert_eq!(report.stats.gears, 4);
}
