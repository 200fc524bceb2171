//! CLI smoke tests against the built binary.

mod common;

use serde_json::Value;

fn json_line(stdout: &str) -> Value {
    let line = stdout.lines().last().expect("json output line");
    serde_json::from_str(line).expect("valid json")
}

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: cwarden [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_json_reports_package_version() {
    let result = common::run_cli_case("version_json", &["version", "--json"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["binary"], "cwarden");
    assert_eq!(payload["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn config_validate_accepts_scratch_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_scratch_config(dir.path(), "");
    let config = config.to_str().unwrap();
    let home = dir.path().to_str().unwrap();

    let result = common::run_cli_case_with_env(
        "config_validate_ok",
        &["--config", config, "config", "validate", "--json"],
        &[("HOME", home)],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["valid"], true);
    assert_eq!(payload["hash"].as_str().unwrap().len(), 16);
}

#[test]
fn invalid_quota_exits_with_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_scratch_config(dir.path(), "[policy]\nkeep_low_usage = 0\n");
    let config = config.to_str().unwrap();
    let home = dir.path().to_str().unwrap();

    let result = common::run_cli_case_with_env(
        "config_validate_bad_quota",
        &["--config", config, "config", "validate", "--json"],
        &[("HOME", home)],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["valid"], false);
    assert_eq!(payload["code"], "CW-1001");
}

#[test]
fn missing_explicit_config_is_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let result = common::run_cli_case_with_env(
        "config_show_missing",
        &["--config", missing.to_str().unwrap(), "config", "show"],
        &[("HOME", dir.path().to_str().unwrap())],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("CW-1002"));
}

#[test]
fn env_override_reaches_effective_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_scratch_config(dir.path(), "");
    let result = common::run_cli_case_with_env(
        "config_show_env_override",
        &["--config", config.to_str().unwrap(), "config", "show", "--json"],
        &[
            ("HOME", dir.path().to_str().unwrap()),
            ("CW_POLICY_KEEP_HIGH_PRESSURE", "7"),
        ],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["config"]["policy"]["keep_high_pressure"], 7);
    assert_eq!(payload["config"]["cron"]["enabled"], false);
}

#[test]
fn store_commands_round_trip_through_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_scratch_config(dir.path(), "");
    let config = config.to_str().unwrap();
    let env = [("HOME", dir.path().to_str().unwrap())];

    let before = common::run_cli_case_with_env(
        "store_batches_without_db",
        &["--config", config, "store", "batches"],
        &env,
    );
    assert_eq!(before.status.code(), Some(2), "log: {}", before.log_path.display());
    assert!(before.stderr.contains("store init"));

    let init = common::run_cli_case_with_env(
        "store_init",
        &["--config", config, "store", "init", "--json"],
        &env,
    );
    assert!(init.status.success(), "log: {}", init.log_path.display());
    assert!(dir.path().join("metrics.db").exists());

    let batches = common::run_cli_case_with_env(
        "store_batches_empty",
        &["--config", config, "store", "batches", "--limit", "3", "--json"],
        &env,
    );
    assert!(batches.status.success(), "log: {}", batches.log_path.display());
    let payload = json_line(&batches.stdout);
    assert_eq!(payload["batches"].as_array().unwrap().len(), 0);

    let reset = common::run_cli_case_with_env(
        "store_reset",
        &["--config", config, "store", "reset", "--json"],
        &env,
    );
    assert!(reset.status.success(), "log: {}", reset.log_path.display());
}

#[test]
fn status_without_state_file_reports_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_scratch_config(dir.path(), "");
    let result = common::run_cli_case_with_env(
        "status_no_state",
        &["--config", config.to_str().unwrap(), "status", "--json"],
        &[("HOME", dir.path().to_str().unwrap())],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["running"], false);
    assert!(payload["state"].is_null());
}

#[test]
fn completions_generate_script() {
    let result = common::run_cli_case("completions_bash", &["completions", "bash"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(result.stdout.contains("cwarden"));
}
