//! Integration tests for `provisioner run`
//!
//! These use a flashing utility that always fails, so no hardware is
//! needed; everything up to the upload and the ledger bookkeeping after it
//! is exercised.

mod common;

use common::{sample_firmware, stderr, stdout, TestProject, SAMPLE_PROFILE};

/// Station whose flashing utility always fails
fn failing_station(serials: &[&str]) -> TestProject {
    let project = TestProject::new();
    project.write_settings(
        r#"
[station]
station_id = "bench"

[uploader]
program = "false"
identity_args = ""

[monitor]
device_timeout_ms = 500
"#,
    );
    project.install_profile("sensor-node", SAMPLE_PROFILE);
    std::fs::create_dir_all(project.path().join("fw")).unwrap();
    std::fs::write(project.path().join("fw/node.uf2"), sample_firmware()).unwrap();
    project.create_dir("mnt/RPI-RP2");
    project.init_ledger(serials);
    project
}

fn run_session(project: &TestProject, extra: &[&str]) -> std::process::Output {
    let device = project.path().join("mnt/RPI-RP2");
    let mut args = vec![
        "run",
        "--profile",
        "sensor-node",
        "--firmware",
        "fw/node.uf2",
        "--device",
        device.to_str().unwrap(),
    ];
    args.extend_from_slice(extra);
    project.run(&args)
}

#[test]
fn test_failed_upload_is_recorded() {
    let project = failing_station(&["SN-1", "SN-2"]);

    let output = run_session(&project, &["--serial", "SN-1", "--firmware-version", "1.4.0"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("upload_failed"), "stderr: {}", stderr(&output));

    let output = project.run(&["--json", "ledger", "show", "SN-1"]);
    let record: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let history = record["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["event_type"], "SessionFailed");
    assert_eq!(history[0]["programmed_by"], "bench");
    assert_eq!(history[0]["metadata"]["failure"], "upload_failed");
    assert_eq!(history[0]["firmware_version"], "1.4.0");

    // Failed units stay first in line
    let output = project.run(&["ledger", "next"]);
    assert_eq!(stdout(&output).trim(), "SN-1");
}

#[test]
fn test_session_artifacts_are_written() {
    let project = failing_station(&["SN-1"]);
    let output = run_session(&project, &["--serial", "SN-1"]);
    assert!(!output.status.success());

    let serial_dir = project.data_dir().join("artifacts").join("SN-1");
    for sub in ["logs", "results", "calibration", "measurements", "tests"] {
        assert!(serial_dir.join(sub).is_dir(), "missing {sub}");
    }
    let summaries: Vec<_> = std::fs::read_dir(serial_dir.join("results"))
        .unwrap()
        .filter_map(Result::ok)
        .collect();
    assert_eq!(summaries.len(), 1);
    let summary = std::fs::read_to_string(summaries[0].path()).unwrap();
    assert!(summary.contains("upload_failed"));
}

#[test]
fn test_json_report_on_failure() {
    let project = failing_station(&["SN-1"]);
    let output = run_session(&project, &["--json", "--next"]);
    assert!(!output.status.success());

    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["serial_number"], "SN-1");
    assert_eq!(report["product_id"], "sensor-node");
    assert_eq!(report["outcome"]["status"], "failed");
    assert_eq!(report["outcome"]["failure"]["kind"], "upload_failed");
}

#[test]
fn test_programmed_unit_is_refused() {
    let project = TestProject::new();
    project.write_settings("[uploader]\nprogram = \"false\"\nidentity_args = \"\"\n");
    project.install_profile("sensor-node", SAMPLE_PROFILE);
    project.create_file(
        "data/ledger.toml",
        r#"
[[records]]
serial_number = "SN-OLD"
date_programmed = "2025-01-10T08:00:00Z"
"#,
    );
    std::fs::create_dir_all(project.path().join("fw")).unwrap();
    std::fs::write(project.path().join("fw/node.uf2"), sample_firmware()).unwrap();
    project.create_dir("mnt/RPI-RP2");

    let output = run_session(&project, &["--serial", "SN-OLD"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("already_programmed"));

    // Refusals leave no trace in the ledger
    let output = project.run(&["--json", "ledger", "show", "SN-OLD"]);
    let record: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert!(record["history"].as_array().unwrap().is_empty());
}

#[test]
fn test_invalid_artifact_stops_before_upload() {
    let project = failing_station(&["SN-1"]);
    project.create_file("fw/node.bin", "not firmware");

    let device = project.path().join("mnt/RPI-RP2");
    let output = project.run(&[
        "run",
        "--serial",
        "SN-1",
        "--profile",
        "sensor-node",
        "--firmware",
        "fw/node.bin",
        "--device",
        device.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unsupported artifact"));
}

#[test]
fn test_unknown_serial_is_rejected() {
    let project = failing_station(&["SN-1"]);
    let output = run_session(&project, &["--serial", "SN-404"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("SN-404"));
}

#[test]
fn test_reprogram_needs_confirmation_without_tty() {
    let project = failing_station(&["SN-1"]);
    let output = run_session(&project, &["--serial", "SN-1", "--reprogram"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("--yes"));

    // Nothing was attempted
    let output = project.run(&["--json", "ledger", "show", "SN-1"]);
    let record: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert!(record["history"].as_array().unwrap().is_empty());
}

#[test]
fn test_serial_and_next_conflict() {
    let project = failing_station(&["SN-1"]);
    let output = run_session(&project, &["--serial", "SN-1", "--next"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("cannot be used with"));
}

#[test]
fn test_missing_template_value_stops_before_upload() {
    let project = failing_station(&["SN-1"]);
    let regional =
        SAMPLE_PROFILE.replace("PROV SET_SN {serial_number}", "PROV SET_REGION {region_code}");
    project.install_profile("sensor-node", &regional);

    let output = run_session(&project, &["--serial", "SN-1"]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("unbound_variables"), "stderr: {err}");
    assert!(err.contains("region_code"));

    // Refused before the device was touched
    let output = project.run(&["--json", "ledger", "show", "SN-1"]);
    let record: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert!(record["history"].as_array().unwrap().is_empty());

    let output = run_session(&project, &["--serial", "SN-1", "--region", "EU"]);
    assert!(stderr(&output).contains("upload_failed"));
}

#[test]
fn test_missing_profile_is_reported() {
    let project = failing_station(&["SN-1"]);
    let output = project.run(&[
        "run",
        "--serial",
        "SN-1",
        "--profile",
        "gateway",
        "--firmware",
        "fw/node.uf2",
    ]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Failed to load profile 'gateway'"));
}
