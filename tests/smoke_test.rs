//! Smoke tests for the bl CLI.
//!
//! These tests verify basic CLI functionality:
//! - `bl --version` and `bl --help`
//! - `bl init` creates the ledger and a default config
//! - commands fail cleanly before init or with a broken config

mod common;

use common::TestEnv;
use predicates::prelude::*;

#[test]
fn test_version_flag() {
    TestEnv::new()
        .bl()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bl"))
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")))
        .stdout(predicate::str::is_match(r"\(\S+ \d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z\)").unwrap());
}

#[test]
fn test_help_flag() {
    TestEnv::new()
        .bl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("Commands:"))
        .stdout(predicate::str::contains("crash"));
}

#[test]
fn test_no_args_is_usage_error() {
    TestEnv::new()
        .bl()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_init_creates_ledger_and_config() {
    let env = TestEnv::new();
    let result = env.json(&["init"]);
    assert_eq!(result["config_created"], true);
    assert!(env.data_path().join("ledger.db").exists());
    assert!(env.config_path().exists());

    let again = env.json(&["init"]);
    assert_eq!(again["config_created"], false);
}

#[test]
fn test_init_human_readable() {
    TestEnv::new()
        .bl()
        .args(["-H", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized ledger"))
        .stdout(predicate::str::contains("Wrote default config"));
}

#[test]
fn test_command_before_init_fails_with_json_error() {
    TestEnv::new()
        .bl()
        .args(["bug", "show", "0123456789abcdef0123456789abcdef01234567"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(r#""error""#))
        .stderr(predicate::str::contains("bl init"));
}

#[test]
fn test_command_before_init_human_error() {
    TestEnv::new()
        .bl()
        .args(["-H", "crash", "list", "0123456789abcdef0123456789abcdef01234567"])
        .assert()
        .failure()
        .stderr(predicate::str::starts_with("Error:"));
}

#[test]
fn test_broken_config_is_reported() {
    let env = TestEnv::init();
    env.write_config("namespace \"upstream\" {\n    reporting \"public\"\n}\n");
    env.bl()
        .args(["crash", "report", "--ns", "upstream", "--manager", "ci", "--title", "t"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("key is required"));
}

#[test]
fn test_config_output_format_human() {
    let env = TestEnv::init();
    env.write_config(&common::TEST_CONFIG.replace(r#"output-format "json""#, r#"output-format "human""#));
    env.bl()
        .args(["crash", "report", "--ns", "upstream", "--manager", "ci", "--title", "KASAN: use-after-free in foo"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("New bug"));
}

#[test]
fn test_unknown_namespace_rejected() {
    let env = TestEnv::init();
    env.bl()
        .args(["crash", "report", "--ns", "nope", "--manager", "ci", "--title", "t"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
}
