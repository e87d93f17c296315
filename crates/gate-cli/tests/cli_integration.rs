// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end CLI tests against the compiled `gate` binary: each test
//! spawns a real process with its own `GATE_DATA_DIR`/`GATE_POLICY` so
//! runs never interfere with each other.

use assert_cmd::Command;
use gate_bundle::BundleInput;
use gate_core::IntentRecord;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::path::Path;

fn gate() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("gate").expect("binary `gate` should be built")
}

fn write_bundle(dir: &Path, file_path: &str, content: &str) -> std::path::PathBuf {
    let intent = IntentRecord {
        index: 0,
        kind: "file.write".to_string(),
        timestamp: None,
        payload: json!({"path": file_path, "content": content}),
        metadata: Some(json!({"id": "intent-1"})),
    };
    let input = BundleInput { intents: vec![intent], ..Default::default() };
    let bundle_path = dir.join("bundle.tgz");
    gate_bundle::create(&bundle_path, input).unwrap();
    bundle_path
}

fn write_policy(dir: &Path, yaml: &str) -> std::path::PathBuf {
    let path = dir.join("policy.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn help_exits_zero_and_lists_subcommands() {
    gate()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Transaction gate CLI"))
        .stdout(predicate::str::contains("ingest"))
        .stdout(predicate::str::contains("commit"));
}

#[test]
fn ingest_plan_commit_round_trip_exits_zero() {
    let data_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let target = work_dir.path().join("out.txt");
    let bundle_path = write_bundle(work_dir.path(), &target.to_string_lossy(), "hello");

    let ingest_out = gate()
        .env("GATE_DATA_DIR", data_dir.path())
        .arg("ingest")
        .arg(&bundle_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let ingest_json: Value = serde_json::from_slice(&ingest_out).unwrap();
    let bundle_id = ingest_json["bundleId"].as_str().unwrap().to_string();

    gate()
        .env("GATE_DATA_DIR", data_dir.path())
        .arg("plan")
        .arg(&bundle_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"allowed\":true"));

    gate()
        .env("GATE_DATA_DIR", data_dir.path())
        .arg("commit")
        .arg(&bundle_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("committed"));

    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello");
}

#[test]
fn commit_denied_by_policy_exits_two() {
    let data_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    write_policy(work_dir.path(), "version: v1\nallow: []\ncaps:\n  maxAmount: 100\nrequireApprovalLabels: []\n");

    let over_cap_intent = IntentRecord {
        index: 0,
        kind: "payment.transfer".to_string(),
        timestamp: None,
        payload: json!({"amount": 500}),
        metadata: Some(json!({"id": "intent-1"})),
    };
    let bundle_path = work_dir.path().join("denied.tgz");
    gate_bundle::create(&bundle_path, BundleInput { intents: vec![over_cap_intent], ..Default::default() }).unwrap();

    let ingest_out = gate()
        .env("GATE_DATA_DIR", data_dir.path())
        .env("GATE_POLICY", work_dir.path().join("policy.yaml"))
        .arg("ingest")
        .arg(&bundle_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let ingest_json: Value = serde_json::from_slice(&ingest_out).unwrap();
    let bundle_id = ingest_json["bundleId"].as_str().unwrap().to_string();

    gate()
        .env("GATE_DATA_DIR", data_dir.path())
        .env("GATE_POLICY", work_dir.path().join("policy.yaml"))
        .arg("commit")
        .arg(&bundle_id)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("POLICY_DENIED"));
}

#[test]
fn commit_unknown_bundle_exits_with_error() {
    let data_dir = tempfile::tempdir().unwrap();
    gate()
        .env("GATE_DATA_DIR", data_dir.path())
        .arg("commit")
        .arg("does-not-exist")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("BUNDLE_INVALID"));
}

#[test]
fn replay_against_echo_collaborator_matches_recorded_output() {
    let data_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let bundle_path = work_dir.path().join("bundle.tgz");
    let input = BundleInput {
        logs: std::collections::BTreeMap::from([
            ("stdout.log".to_string(), b"hi\n".to_vec()),
            ("stderr.log".to_string(), Vec::new()),
        ]),
        ..Default::default()
    };
    gate_bundle::create(&bundle_path, input).unwrap();

    gate()
        .env("GATE_DATA_DIR", data_dir.path())
        .arg("replay")
        .arg(&bundle_path)
        .arg("--collaborator")
        .arg("echo hi")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\":true"));
}
