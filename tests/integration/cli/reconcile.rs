use predicates::prelude::*;
use tempfile::TempDir;

use super::broker;
use crate::fixtures::fleet::Fleet;

fn drifted_fleet(home: &TempDir) -> Fleet {
    let mut fleet = Fleet::sqlite(&home.path().join("broker.sqlite"));
    let (owner, domain) = fleet.owner("alice");
    fleet.app(&owner, &domain, "a1", 2, "node-1");
    fleet.app(&owner, &domain, "a2", 3, "node-2");
    fleet.store.set_consumed_gears(&owner.id, 1).unwrap();
    fleet
}

#[test]
fn report_only_then_fix_then_clean() {
    let home = TempDir::new().unwrap();
    let fleet = drifted_fleet(&home);
    let store = home.path().join("broker.sqlite");

    broker(&home, &store, fleet.agent_dir())
        .args(["reconcile", "--report-only"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("records 1 gears, has 5"))
        .stdout(predicate::str::contains("Inconsistencies detected (report only)"));

    broker(&home, &store, fleet.agent_dir())
        .arg("reconcile")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("repaired 1 of 1, 0 failed"));

    broker(&home, &store, fleet.agent_dir())
        .arg("reconcile")
        .assert()
        .success()
        .stdout(predicate::str::contains("No inconsistencies found"));
}

#[test]
fn json_report_carries_summary() {
    let home = TempDir::new().unwrap();
    let fleet = drifted_fleet(&home);
    let store = home.path().join("broker.sqlite");

    let output = broker(&home, &store, fleet.agent_dir())
        .args(["reconcile", "--quota", "--report-only", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["summary"]["inconsistent"], true);
    assert_eq!(report["summary"]["categories"]["quota"]["detected"], 1);
    assert_eq!(report["checks"].as_array().map(Vec::len), Some(1));
    assert_eq!(report["checks"][0]["findings"][0]["type"], "quota");
}

#[test]
fn verbose_streams_per_item_lines() {
    let home = TempDir::new().unwrap();
    let fleet = drifted_fleet(&home);
    let store = home.path().join("broker.sqlite");

    broker(&home, &store, fleet.agent_dir())
        .args(["reconcile", "--quota", "-v"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("consumed_gears 1 but 5 gears found"))
        .stdout(predicate::str::contains("repair fixed"));
}

#[test]
fn first_run_writes_default_config() {
    let home = TempDir::new().unwrap();
    let fleet = Fleet::sqlite(&home.path().join("broker.sqlite"));
    let store = home.path().join("broker.sqlite");

    broker(&home, &store, fleet.agent_dir())
        .arg("reconcile")
        .assert()
        .success();
    assert!(home.path().join("config").join("config.toml").exists());
}

#[test]
fn missing_explicit_config_fails() {
    let home = TempDir::new().unwrap();
    let fleet = Fleet::sqlite(&home.path().join("broker.sqlite"));
    let store = home.path().join("broker.sqlite");

    broker(&home, &store, fleet.agent_dir())
        .arg("--config")
        .arg(home.path().join("nope.toml"))
        .arg("reconcile")
        .assert()
        .code(1);
}
