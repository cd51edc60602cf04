//! Command line surface of both binaries.

use assert_cmd::Command;
use predicates::prelude::*;
use ptm::host::Host;
use ptm::services::ServiceConfig;
use ptm::PhysicalTopologyConfig;
use ptm_common::{PtmPaths, PtmSettings, RetryPolicy};

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/zoo-cass.json");

fn ptm() -> Command {
    let mut cmd = Command::cargo_bin("ptm").unwrap();
    cmd.env_remove("PTM_SETTINGS")
        .env_remove("PTM_ROOT")
        .env_remove("PTM_LOG_DIR");
    cmd
}

fn host_ctl() -> Command {
    Command::cargo_bin("ptm-host-ctl").unwrap()
}

#[test]
fn help_lists_actions() {
    ptm()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--startup"))
        .stdout(predicate::str::contains("--shutdown"))
        .stdout(predicate::str::contains("--config-file"));
}

#[test]
fn missing_action_prints_usage() {
    ptm()
        .args(["-c", FIXTURE])
        .assert()
        .failure()
        .stderr(predicate::str::contains("one of --startup, --shutdown or --print"))
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn conflicting_actions_are_rejected() {
    ptm()
        .args(["--startup", "--shutdown", "-c", FIXTURE])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn unreadable_topology_is_a_config_error() {
    ptm()
        .args(["--print", "-c", "/nonexistent/topology.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot read topology"));
}

#[test]
fn print_renders_tables() {
    ptm()
        .args(["--print", "-c", FIXTURE])
        .assert()
        .success()
        .stdout(predicate::str::contains("zoo1"))
        .stdout(predicate::str::contains("netns:cass1"))
        .stdout(predicate::str::contains("root/vzoo1eth0"))
        .stdout(predicate::str::contains("192.168.1.2/24"));
}

#[test]
fn print_json_is_the_resolved_model() {
    let output = ptm()
        .args(["--print", "--json", "-c", FIXTURE])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value = serde_json::from_slice(&output).unwrap();

    assert_eq!(value["root"], "root");
    assert_eq!(
        value["start_order"],
        serde_json::json!([["root"], ["zoo1"], ["cass1"], ["ext1"]])
    );
    assert_eq!(value["zookeeper_ips"], serde_json::json!(["10.0.0.2"]));
}

#[test]
fn print_writes_log_file_when_asked() {
    let dir = tempfile::tempdir().unwrap();
    ptm()
        .args(["--print", "-d", "-c", FIXTURE, "-l"])
        .arg(dir.path())
        .assert()
        .success();
    assert!(dir.path().join("ptm.log").exists());
}

fn generic_snapshot() -> String {
    let topo = PhysicalTopologyConfig::from_file(std::path::Path::new(FIXTURE))
        .unwrap()
        .resolve()
        .unwrap();
    let resolved = topo.host("ext1").unwrap();
    let service = ServiceConfig::build(resolved, &topo, &PtmSettings::default()).unwrap();
    Host::new(resolved, service)
        .snapshot(&PtmPaths::with_root("/tmp/ptm-cli-test"), RetryPolicy::new(1, 10))
        .to_json()
        .unwrap()
}

#[test]
fn host_ctl_runs_a_verb() {
    host_ctl()
        .args(["-c", "status", "-j", &generic_snapshot()])
        .assert()
        .code(0);
}

#[test]
fn host_ctl_unknown_verb_is_usage_error() {
    host_ctl()
        .args(["-c", "explode", "-j", &generic_snapshot()])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown control command"));
}

#[test]
fn host_ctl_rejects_bad_snapshot() {
    host_ctl()
        .args(["-c", "start", "-j", "{not json"])
        .assert()
        .code(2);
}

#[test]
fn host_ctl_requires_command() {
    host_ctl()
        .args(["-j", "{}"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--command"));
}
