//! Repairs re-read the store before writing. These tests change the store
//! after the pass captured its snapshot and check that the repair notices
//! and leaves the store alone.

use std::sync::Arc;

use broker_rs::core::{
    AppId, Application, Gear, GearId, GroupInstance, GroupInstanceId, KeyHash,
};
use broker_rs::reconcile::{
    AgentKeyResync, Category, KeyResync, NodeAgentProxy, ReconcileOptions, RepairStatus,
    ResyncError, ResyncSummary,
};
use broker_rs::store::{AppProjection, DocumentStore};

use crate::fixtures::fleet::{CAPACITY, FIRST_UID, Fleet, node};
use crate::fixtures::interleave::InterleavingStore;

fn fleet_over_interleaving() -> (Fleet, Arc<InterleavingStore>) {
    let store = Arc::new(InterleavingStore::new());
    (Fleet::with_store(store.clone()), store)
}

#[test]
fn quota_corrected_before_repair_is_self_resolved() {
    let (mut fleet, store) = fleet_over_interleaving();
    let (owner, domain) = fleet.owner("olga");
    fleet.app(&owner, &domain, "a", 2, "node-1");
    fleet.store.set_consumed_gears(&owner.id, 0).unwrap();

    let owner_id = owner.id;
    store.before_next_lock(move |inner| {
        inner.set_consumed_gears(&owner_id, 2).unwrap();
    });
    let report = fleet
        .reconciler()
        .run(&ReconcileOptions::only(&[Category::Quota]))
        .unwrap();

    assert_eq!(report.category(Category::Quota).detected, 1);
    let [repair] = report.repairs.as_slice() else {
        panic!("expected one repair, got {:?}", report.repairs);
    };
    assert_eq!(repair.status, RepairStatus::SelfResolved);
    assert!(repair.detail.contains("already 2"));
    assert_eq!(report.category(Category::Quota).fixed, 0);
    assert_eq!(report.category(Category::Quota).failed, 0);
    assert_eq!(
        fleet.store.find_owner(&owner.id).unwrap().unwrap().consumed_gears,
        2
    );
}

#[test]
fn unreserved_uid_dropped_by_its_gear_stays_in_pool() {
    let (mut fleet, store) = fleet_over_interleaving();
    let (owner, domain) = fleet.owner("pia");
    let app = fleet.app(&owner, &domain, "svc", 1, "node-1");
    let uid = app.gears().next().unwrap().uid;
    fleet.store.add_available_uid(&fleet.district, uid).unwrap();

    let app_id = app.id;
    store.before_next_lock(move |inner| {
        let mut app = inner
            .find_application(&app_id, AppProjection::Full)
            .unwrap()
            .unwrap();
        app.group_instances.clear();
        inner.put_application(&app).unwrap();
    });
    let report = fleet
        .reconciler()
        .run(&ReconcileOptions::only(&[Category::Uids]))
        .unwrap();

    let [repair] = report.repairs.as_slice() else {
        panic!("expected one repair, got {:?}", report.repairs);
    };
    assert_eq!(repair.status, RepairStatus::SelfResolved);
    assert!(repair.detail.contains("gear no longer uses uid"));
    assert!(fleet.district().is_available(uid));
}

#[test]
fn unused_uid_claimed_before_repair_is_not_returned() {
    let (mut fleet, store) = fleet_over_interleaving();
    let (owner, domain) = fleet.owner("quin");
    let lost = FIRST_UID + CAPACITY - 1;
    assert!(fleet.store.remove_available_uid(&fleet.district, lost).unwrap());

    let mut claimer = Application::new(AppId::generate(), "late", owner.id, domain.id);
    claimer.group_instances.push(GroupInstance {
        id: GroupInstanceId::generate(),
        gears: vec![Gear {
            id: GearId::generate(),
            uid: lost,
            server_identity: node("node-2"),
        }],
    });
    store.before_next_lock(move |inner| {
        inner.put_application(&claimer).unwrap();
    });
    let report = fleet
        .reconciler()
        .run(&ReconcileOptions::only(&[Category::Uids]))
        .unwrap();

    let [repair] = report.repairs.as_slice() else {
        panic!("expected one repair, got {:?}", report.repairs);
    };
    assert_eq!(repair.status, RepairStatus::SelfResolved);
    assert!(repair.detail.contains("now used by gear"));
    assert!(!fleet.district().is_available(lost));
}

/// Deletes the application right before delegating, as a concurrent
/// destroy would.
struct DeletedBeforeResync {
    store: Arc<dyn DocumentStore>,
    inner: AgentKeyResync,
}

impl KeyResync for DeletedBeforeResync {
    fn resync_keys(&self, app: &AppId) -> Result<ResyncSummary, ResyncError> {
        self.store.delete_application(app).unwrap();
        self.inner.resync_keys(app)
    }
}

#[test]
fn resync_of_deleted_application_is_self_resolved() {
    let (mut fleet, _store) = fleet_over_interleaving();
    let (owner, domain) = fleet.owner("rex");
    let app = fleet.app(&owner, &domain, "gone", 1, "node-1");
    let gear = app.gears().next().unwrap().id;
    fleet
        .node_keys_mut("node-1", &gear)
        .insert(KeyHash::of_content("AAAAstray"), "stray".to_string());
    fleet.flush_reports();

    let resync = DeletedBeforeResync {
        store: fleet.store.clone(),
        inner: AgentKeyResync::new(fleet.store.clone(), fleet.agent()),
    };
    let report = fleet
        .reconciler()
        .with_resync(Arc::new(resync))
        .run(&ReconcileOptions::only(&[Category::SshKeys]))
        .unwrap();

    let [repair] = report.repairs.as_slice() else {
        panic!("expected one repair, got {:?}", report.repairs);
    };
    assert_eq!(repair.status, RepairStatus::SelfResolved);
    assert_eq!(report.category(Category::SshKeys).failed, 0);

    let inventory = fleet.agent().gear_key_inventory().unwrap();
    assert!(
        inventory
            .keys_for(&node("node-1"), &gear)
            .unwrap()
            .contains_key(&KeyHash::of_content("AAAAstray"))
    );
}

#[test]
fn failed_lease_release_keeps_the_fix() {
    let (mut fleet, store) = fleet_over_interleaving();
    let (owner, domain) = fleet.owner("sue");
    fleet.app(&owner, &domain, "a", 3, "node-1");
    fleet.store.set_consumed_gears(&owner.id, 1).unwrap();

    store.fail_unlocks();
    let report = fleet
        .reconciler()
        .run(&ReconcileOptions::only(&[Category::Quota]))
        .unwrap();

    let [repair] = report.repairs.as_slice() else {
        panic!("expected one repair, got {:?}", report.repairs);
    };
    assert_eq!(repair.status, RepairStatus::Fixed);
    assert_eq!(repair.failure, None);
    assert_eq!(
        fleet.store.find_owner(&owner.id).unwrap().unwrap().consumed_gears,
        3
    );
}
