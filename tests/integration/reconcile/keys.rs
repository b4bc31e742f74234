use std::sync::Mutex;

use broker_rs::core::KeyHash;
use broker_rs::reconcile::{
    Category, FailureKind, Finding, KeyDrift, NodeAgentProxy, ReconcileOptions, RepairStatus,
};

use crate::fixtures::fleet::{Fleet, node};

#[test]
fn key_on_node_but_not_recorded_is_resynced() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("bob");
    let app = fleet.app(&owner, &domain, "web", 2, "node-1");
    let gear = app.gears().next().unwrap().id;
    fleet
        .node_keys_mut("node-1", &gear)
        .insert(KeyHash::of_content("AAAAstray alice@elsewhere"), "alice".to_string());
    fleet.flush_reports();

    let lines = Mutex::new(Vec::new());
    let report = fleet
        .reconciler()
        .run_with_progress(&ReconcileOptions::default(), |line| {
            lines.lock().unwrap().push(line.to_string());
        })
        .unwrap();

    let check = report.check(Category::SshKeys).unwrap();
    let [Finding::SshKey(error)] = check.findings.as_slice() else {
        panic!("expected one key finding, got {:?}", check.findings);
    };
    assert_eq!(error.drift, KeyDrift::Unrecorded);
    assert_eq!(error.key_name, "alice");
    assert_eq!(error.gear_id, gear);
    assert_eq!(error.node, node("node-1"));

    let repairs: Vec<_> = report
        .repairs
        .iter()
        .filter(|r| r.category == Category::SshKeys)
        .collect();
    assert_eq!(repairs.len(), 1);
    assert_eq!(repairs[0].status, RepairStatus::Fixed);
    assert_eq!(repairs[0].target, format!("application {}", app.id));

    let lines = lines.into_inner().unwrap();
    assert!(
        lines
            .iter()
            .any(|line| line.contains("key 'alice' present on node but not recorded"))
    );

    let inventory = fleet.agent().gear_key_inventory().unwrap();
    let expected = fleet.expected_keys(&owner, &app);
    for gear in app.gears() {
        assert_eq!(inventory.keys_for(&node("node-1"), &gear.id), Some(&expected));
    }

    let second = fleet.reconciler().run(&ReconcileOptions::default()).unwrap();
    assert!(!second.has_inconsistencies());
}

#[test]
fn recorded_key_missing_on_node_is_reported() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("erin");
    let app = fleet.app(&owner, &domain, "api", 1, "node-2");
    let gear = app.gears().next().unwrap().id;
    fleet.node_keys_mut("node-2", &gear).clear();
    fleet.flush_reports();

    let report = fleet
        .reconciler()
        .run(&ReconcileOptions::report_only())
        .unwrap();
    let check = report.check(Category::SshKeys).unwrap();
    let [Finding::SshKey(error)] = check.findings.as_slice() else {
        panic!("expected one key finding, got {:?}", check.findings);
    };
    assert_eq!(error.drift, KeyDrift::MissingOnNode);
    assert_eq!(error.key_name, "erin");
    assert!(report.repairs.is_empty());

    let inventory = fleet.agent().gear_key_inventory().unwrap();
    assert!(inventory.keys_for(&node("node-2"), &gear).unwrap().is_empty());
}

#[test]
fn silent_node_gears_are_counted_not_checked() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("frank");
    fleet.app(&owner, &domain, "quiet", 3, "node-2");
    fleet.app(&owner, &domain, "loud", 1, "node-1");
    fleet.silence("node-2");

    let report = fleet.reconciler().run(&ReconcileOptions::default()).unwrap();
    assert!(!report.has_inconsistencies());
    assert_eq!(report.stats.nodes_responding, 1);
    assert_eq!(report.stats.gears_on_silent_nodes, 3);
    assert_eq!(report.stats.gears, 4);
}

#[test]
fn silent_gear_listed_first_does_not_block_resync() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("gina");
    let mut split = fleet.app(&owner, &domain, "split", 1, "node-1");
    let other = fleet.app(&owner, &domain, "other", 1, "node-2");

    // One application spanning both nodes, its node-2 gear listed first.
    let mut instances = other.group_instances.clone();
    instances.extend(split.group_instances.clone());
    split.group_instances = instances;
    fleet.store.put_application(&split).unwrap();
    fleet.store.delete_application(&other.id).unwrap();

    let local_gear = split
        .gears()
        .find(|gear| gear.server_identity == node("node-1"))
        .unwrap()
        .id;
    fleet
        .node_keys_mut("node-1", &local_gear)
        .insert(KeyHash::of_content("AAAAextra"), "extra".to_string());
    fleet.flush_reports();
    fleet.silence("node-2");

    let options = ReconcileOptions::only(&[Category::SshKeys]);
    let report = fleet.reconciler().run(&options).unwrap();
    assert_eq!(report.category(Category::SshKeys).detected, 1);
    let [repair] = report.repairs.as_slice() else {
        panic!("expected one repair, got {:?}", report.repairs);
    };
    assert_eq!(repair.status, RepairStatus::Fixed);
    assert!(repair.detail.contains("1 on silent nodes skipped"));

    let inventory = fleet.agent().gear_key_inventory().unwrap();
    assert_eq!(
        inventory.keys_for(&node("node-1"), &local_gear),
        Some(&fleet.expected_keys(&owner, &split))
    );
    let second = fleet.reconciler().run(&options).unwrap();
    assert!(!second.has_inconsistencies());
}

#[test]
fn resync_failure_is_reported_and_batch_continues() {
    let mut fleet = Fleet::in_memory();
    let (owner, domain) = fleet.owner("gina");
    let split = fleet.app(&owner, &domain, "split", 2, "node-1");
    let mut gears = split.gears();
    let unhosted = gears.next().unwrap().id;
    let drifted = gears.next().unwrap().id;
    fleet.forget_gear("node-1", &unhosted);
    fleet
        .node_keys_mut("node-1", &drifted)
        .insert(KeyHash::of_content("AAAAextra"), "extra".to_string());
    fleet.flush_reports();

    let (lone_owner, lone_domain) = fleet.owner("hank");
    let lone = fleet.app(&lone_owner, &lone_domain, "lone", 1, "node-1");
    let lone_gear = lone.gears().next().unwrap().id;
    fleet.node_keys_mut("node-1", &lone_gear).clear();
    fleet.flush_reports();

    let report = fleet
        .reconciler()
        .run(&ReconcileOptions::only(&[Category::SshKeys]))
        .unwrap();
    assert_eq!(report.category(Category::SshKeys).detected, 2);
    assert_eq!(report.stats.gears_unreported, 1);

    let split_repair = report
        .repairs
        .iter()
        .find(|r| r.target == format!("application {}", split.id))
        .unwrap();
    assert_eq!(split_repair.status, RepairStatus::Failed);
    assert_eq!(split_repair.failure, Some(FailureKind::Resync));

    let lone_repair = report
        .repairs
        .iter()
        .find(|r| r.target == format!("application {}", lone.id))
        .unwrap();
    assert_eq!(lone_repair.status, RepairStatus::Fixed);

    // The hosted gear after the failing one was still brought in line.
    let inventory = fleet.agent().gear_key_inventory().unwrap();
    assert_eq!(
        inventory.keys_for(&node("node-1"), &drifted),
        Some(&fleet.expected_keys(&owner, &split))
    );
}
