//! Output stream tests for the hass-cli binary

use std::process::Command;

use serde_json::Value;

#[test]
fn test_json_logs_stay_off_stdout() {
    // Nothing listens on the discard port, so the command fails after logging
    let output = Command::new(env!("CARGO_BIN_EXE_hass-cli"))
        .args([
            "--url",
            "http://127.0.0.1:9",
            "--token",
            "unused",
            "--connect-timeout",
            "1",
            "kinds",
        ])
        .env("HASS_BRIDGE_LOG_MODE", "json")
        .env_remove("HASS_BRIDGE_LOG_LEVEL")
        .env_remove("RUST_LOG")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(
        output.stdout.is_empty(),
        "stdout: {}",
        String::from_utf8_lossy(&output.stdout)
    );

    let stderr = String::from_utf8_lossy(&output.stderr);
    let connecting = stderr
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find(|line| line["fields"]["message"] == "Connecting");
    assert!(connecting.is_some(), "stderr: {}", stderr);
}
