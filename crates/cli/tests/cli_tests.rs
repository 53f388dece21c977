//! CLI integration tests

use std::process::Command;

fn run(args: &[&str]) -> std::process::Output {
    Command::new("cargo")
        .args(["run", "-q", "-p", "tfp-cli", "--"])
        .args(args)
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = run(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Traffic Flow Forecaster"), "Should show app name");
    for command in ["train", "evaluate", "predict", "sample", "stats", "remote"] {
        assert!(stdout.contains(command), "Should show {command} command");
    }
    assert!(stdout.contains("--format"), "Should show format option");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = run(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("tfp"), "Should show binary name");
}

/// Test train subcommand help
#[test]
fn test_train_help() {
    let output = run(&["train", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Train help should succeed");
    assert!(stdout.contains("--data"), "Should show data option");
    assert!(stdout.contains("--model"), "Should show model option");
    assert!(stdout.contains("--epochs"), "Should show epochs option");
    assert!(stdout.contains("--out"), "Should show out option");
}

/// Test predict subcommand help
#[test]
fn test_predict_help() {
    let output = run(&["predict", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Predict help should succeed");
    assert!(stdout.contains("--checkpoint"), "Should show checkpoint option");
    assert!(stdout.contains("--sensor"), "Should show sensor option");
    assert!(stdout.contains("--seed"), "Should show seed option");
    assert!(stdout.contains("--scalers"), "Should show scalers option");
}

/// Test remote subcommand help
#[test]
fn test_remote_help() {
    let output = run(&["remote", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Remote help should succeed");
    assert!(stdout.contains("health"), "Should show health command");
    assert!(stdout.contains("demo"), "Should show demo command");
    assert!(stdout.contains("--api-url"), "Should show api-url option");
}

/// Test invalid model type is rejected
#[test]
fn test_invalid_model_type() {
    let output = run(&["train", "--data", "missing.npz", "--model", "transformer"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Unknown model type should fail");
    assert!(stderr.contains("transformer"), "Should name the bad value");
}

/// Test invalid output format
#[test]
fn test_invalid_format() {
    let output = run(&["--format", "xml", "remote", "health"]);

    assert!(!output.status.success(), "Invalid format should fail");
}

/// Test missing dataset reports an error
#[test]
fn test_stats_missing_dataset() {
    let output = run(&["stats", "--data", "/nonexistent/pems04.npz", "--sensor", "0"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Missing dataset should fail");
    assert!(stderr.contains("not found"), "Should explain the dataset is missing");
}

/// Test local stats on a generated dataset
#[test]
fn test_stats_on_npy_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.npy");
    write_npy_f32(&path, &[20, 2, 3], |i| i as f32);

    let output = run(&[
        "--format",
        "json",
        "stats",
        "--data",
        path.to_str().unwrap(),
        "--sensor",
        "1",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stats should succeed: {stdout}");

    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["sensor_index"], 1);
    assert_eq!(stats["num_timesteps"], 20);
}

/// Minimal little-endian float32 .npy writer, C order
fn write_npy_f32(path: &std::path::Path, shape: &[usize], value: impl Fn(usize) -> f32) {
    use std::io::Write;

    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}), }}",
        dims.join(", ")
    );
    // Magic (6) + version (2) + header length (2) + header, padded to 64 with a newline
    let unpadded = 10 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(b"\x93NUMPY\x01\x00").unwrap();
    file.write_all(&(header.len() as u16).to_le_bytes()).unwrap();
    file.write_all(header.as_bytes()).unwrap();
    let count: usize = shape.iter().product();
    for i in 0..count {
        file.write_all(&value(i).to_le_bytes()).unwrap();
    }
}
