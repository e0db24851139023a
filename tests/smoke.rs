//! Smoke tests -- verify the binary runs and the CLI surface is wired up.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn envsentry() -> Command {
    let mut cmd = Command::cargo_bin("envsentry").unwrap();
    cmd.env_remove("ENVSENTRY_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn write_temp(contents: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f
}

fn spike_ndjson() -> String {
    let mut out = String::new();
    for i in 0..20u32 {
        let v = 21.0 + 0.1 * ((i % 5) as f64 - 2.0);
        out.push_str(&format!(
            "{{\"sensor_id\":\"temp-1\",\"sensor_type\":\"temperature\",\"value\":{},\"timestamp\":\"2024-05-01T12:{:02}:00Z\",\"sequence_no\":{}}}\n",
            v,
            i,
            i + 1
        ));
    }
    out.push_str(
        "{\"sensor_id\":\"temp-1\",\"sensor_type\":\"temperature\",\"value\":35.0,\"timestamp\":\"2024-05-01T12:20:00Z\",\"sequence_no\":21}\n",
    );
    out.push_str("this line is not json\n");
    out
}

#[test]
fn test_cli_help() {
    envsentry()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("anomaly detection for environmental sensors"));
}

#[test]
fn test_cli_version() {
    envsentry()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("envsentry"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["serve", "replay", "check-config"] {
        envsentry().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_check_config_accepts_valid_file() {
    let cfg = write_temp("[stream]\nwindow_capacity = 60\n", ".toml");
    envsentry()
        .args(["check-config", "--config"])
        .arg(cfg.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("window_capacity = 60"));
}

#[test]
fn test_check_config_rejects_inverted_thresholds() {
    let cfg = write_temp(
        "[sensors.humidity]\nwarning_threshold = 6.0\ncritical_threshold = 4.0\n",
        ".toml",
    );
    envsentry()
        .args(["check-config", "--config"])
        .arg(cfg.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("warning threshold"));
}

#[test]
fn test_replay_emits_alert_json_lines() {
    let input = write_temp(&spike_ndjson(), ".ndjson");
    let cfg = write_temp("[logging]\nlevel = \"warn\"\n", ".toml");
    envsentry()
        .args(["replay", "--alerts-only", "--resolve", "--config"])
        .arg(cfg.path())
        .arg("--input")
        .arg(input.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""type":"alert""#))
        .stdout(predicate::str::contains(r#""kind":"opened""#))
        .stdout(predicate::str::contains(r#""kind":"resolved""#))
        .stdout(predicate::str::contains(r#""type":"reading""#).not());
}
