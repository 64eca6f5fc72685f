//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("urclock");
    // Keep the environment from steering port or part selection
    cmd.env_remove("URCLOCK_PORT")
        .env_remove("URCLOCK_BAUD")
        .env_remove("URCLOCK_PART");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("urclock"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn short_help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("-h")
        .assert()
        .success()
        .stdout(predicate::str::contains("upload"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("urclock"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn subcommand_help_lists_upload_switches() {
    let mut cmd = cli_cmd();
    cmd.args(["upload", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--restore"))
        .stdout(predicate::str::contains("--nometadata"))
        .stdout(predicate::str::contains("--title"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    let output = cmd
        .current_dir(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    assert!(output.stderr.is_empty(), "stderr should stay empty");
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["ok"], serde_json::Value::Bool(true));
    assert!(parsed["data"]["ports"].is_array());
}

#[test]
fn upload_missing_file_fails_before_opening_port() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir
        .path()
        .join("missing.hex");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["-p", "/dev/does-not-exist"])
        .arg("upload")
        .arg(nonexistent.as_os_str())
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"))
        .stderr(predicate::str::contains("missing.hex"));
}

#[test]
fn info_json_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["-p", "/dev/does-not-exist", "info", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_usage_error_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("definitely-not-a-command")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("error"));
}

#[test]
fn exit_code_two_for_usage_error_invalid_flag() {
    let mut cmd = cli_cmd();
    cmd.args(["list-ports", "--not-a-flag"])
        .assert()
        .code(2);
}

#[test]
fn exit_code_two_for_usage_error_missing_required_arg() {
    let mut cmd = cli_cmd();
    cmd.arg("upload")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("<FILE>"));
}

#[test]
fn exit_code_two_for_invalid_values() {
    cli_cmd()
        .args(["--baud", "fast", "list-ports"])
        .assert()
        .code(2);
    cli_cmd()
        .args(["--board-id", "X.1.1", "list-ports"])
        .assert()
        .code(2);
    cli_cmd()
        .args(["read", "fuses", "out.bin"])
        .assert()
        .code(2);
}

#[test]
fn invalid_local_config_is_a_warning() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path()
            .join("urclock.toml"),
        "[connection\nport = ",
    )
    .expect("write config");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .arg("list-ports")
        .assert()
        .success()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn exit_code_four_for_device_not_found() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["--port", "/dev/urclock-no-such-port", "info"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("urclock-no-such-port"));
}

#[test]
fn config_file_port_is_used() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir
        .path()
        .join("custom.toml");
    fs::write(
        &config,
        "[connection]\nport = \"/dev/urclock-from-config\"\n",
    )
    .expect("write config");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .arg("--config")
        .arg(config.as_os_str())
        .arg("erase")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("urclock-from-config"));
}

#[test]
fn unknown_command_suggests_similar() {
    let mut cmd = cli_cmd();
    cmd.arg("uplod")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("upload"));
}

#[test]
fn no_color_disables_ansi_in_errors() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .env("NO_COLOR", "1")
        .args(["-p", "/dev/urclock-no-such-port", "info"])
        .assert()
        .failure()
        .stderr(predicate::str::starts_with("Error:"))
        .stderr(predicate::str::contains("\u{1b}[").not());
}
