use broker_rs::reconcile::{
    Category, CheckStatus, Finding, ReconcileOptions, RepairStatus, UidErrorKind,
};

use crate::fixtures::fleet::{CAPACITY, FIRST_UID, Fleet, assert_no_live_uid_available};

#[test]
fn live_uid_listed_available_is_reserved_again() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("ivy");
    let app = fleet.app(&owner, &domain, "svc", 2, "node-1");
    let gear = app.gears().nth(1).unwrap().clone();
    fleet.store.add_available_uid(&fleet.district, gear.uid).unwrap();

    let report = fleet
        .reconciler()
        .run(&ReconcileOptions::only(&[Category::Uids]))
        .unwrap();

    let check = report.check(Category::Uids).unwrap();
    assert_eq!(check.status, CheckStatus::Fail);
    let [Finding::Uid(error)] = check.findings.as_slice() else {
        panic!("expected one uid finding, got {:?}", check.findings);
    };
    assert_eq!(error.uid, gear.uid);
    assert_eq!(
        error.kind,
        UidErrorKind::Unreserved {
            app_id: app.id,
            gear_id: gear.id,
            node: gear.server_identity.clone(),
        }
    );
    assert_eq!(report.repairs.len(), 1);
    assert_eq!(report.repairs[0].status, RepairStatus::Fixed);

    let district = fleet.district();
    assert!(!district.is_available(gear.uid));
    assert_no_live_uid_available(fleet.store.as_ref(), &district);
}

#[test]
fn lost_uid_returns_to_pool() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("jack");
    fleet.app(&owner, &domain, "svc", 1, "node-2");
    let lost = FIRST_UID + CAPACITY - 1;
    assert!(fleet.store.remove_available_uid(&fleet.district, lost).unwrap());

    let report = fleet
        .reconciler()
        .run(&ReconcileOptions::only(&[Category::Uids]))
        .unwrap();

    let check = report.check(Category::Uids).unwrap();
    let [Finding::Uid(error)] = check.findings.as_slice() else {
        panic!("expected one uid finding, got {:?}", check.findings);
    };
    assert_eq!(error.uid, lost);
    assert_eq!(error.kind, UidErrorKind::Unused);
    assert_eq!(report.repairs[0].status, RepairStatus::Fixed);
    assert!(fleet.district().is_available(lost));
}

#[test]
fn out_of_range_uid_is_reported_but_left_alone() {
    let mut fleet = Fleet::in_memory();
    let stray = FIRST_UID + CAPACITY + 500;
    fleet.store.add_available_uid(&fleet.district, stray).unwrap();

    for _ in 0..2 {
        let report = fleet
            .reconciler()
            .run(&ReconcileOptions::only(&[Category::Uids]))
            .unwrap();
        let check = report.check(Category::Uids).unwrap();
        let [Finding::Uid(error)] = check.findings.as_slice() else {
            panic!("expected one uid finding, got {:?}", check.findings);
        };
        assert_eq!(error.kind, UidErrorKind::OutOfRange);
        assert!(report.repairs.is_empty());
        assert_eq!(report.exit_code(), 1);
    }
    assert!(fleet.district().is_available(stray));
}

#[test]
fn all_three_categories_fix_in_one_pass() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("kim");
    let app = fleet.app(&owner, &domain, "a", 2, "node-1");
    fleet.app(&owner, &domain, "b", 1, "node-2");
    fleet.store.set_consumed_gears(&owner.id, 0).unwrap();
    let gear = app.gears().next().unwrap().clone();
    fleet.store.add_available_uid(&fleet.district, gear.uid).unwrap();
    fleet.node_keys_mut("node-1", &gear.id).clear();
    fleet.flush_reports();

    let options = ReconcileOptions {
        parallel: false,
        ..ReconcileOptions::default()
    };
    let report = fleet.reconciler().run(&options).unwrap();
    for category in [Category::Quota, Category::SshKeys, Category::Uids] {
        let summary = report.category(category);
        assert_eq!(summary.detected, 1, "{category:?}");
        assert_eq!(summary.fixed, 1, "{category:?}");
    }

    let second = fleet.reconciler().run(&options).unwrap();
    assert!(!second.has_inconsistencies());
    assert!(second.repairs.is_empty());
    assert_no_live_uid_available(fleet.store.as_ref(), &fleet.district());
}

#[test]
fn uid_shared_by_two_gears_is_reported_not_repaired() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("lou");
    let a = fleet.app(&owner, &domain, "a", 1, "node-1");
    let mut b = fleet.app(&owner, &domain, "b", 1, "node-2");
    let shared = a.gears().next().unwrap().uid;
    let freed = b.gears().next().unwrap().uid;
    b.group_instances[0].gears[0].uid = shared;
    fleet.store.put_application(&b).unwrap();
    fleet.store.add_available_uid(&fleet.district, freed).unwrap();

    for _ in 0..2 {
        let report = fleet
            .reconciler()
            .run(&ReconcileOptions::only(&[Category::Uids]))
            .unwrap();
        let check = report.check(Category::Uids).unwrap();
        let [Finding::Uid(error)] = check.findings.as_slice() else {
            panic!("expected one uid finding, got {:?}", check.findings);
        };
        assert_eq!(error.uid, shared);
        let UidErrorKind::SharedUid { gear_ids } = &error.kind else {
            panic!("expected shared uid, got {:?}", error.kind);
        };
        assert_eq!(gear_ids.len(), 2);
        assert!(gear_ids.contains(&b.gears().next().unwrap().id));
        assert_eq!(check.status, CheckStatus::Fail);
        assert!(report.repairs.is_empty());
        assert_eq!(report.exit_code(), 1);
    }
}
