//! CLI surface tests against the real binary
//!
//! Exercises version/help output and the configuration-error exit code
//! (2) without starting any transport.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_version_prints_name_and_version() {
    Command::cargo_bin("mcp-proxy")
        .expect("binary not built")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mcp-proxy"));
}

#[test]
fn test_help_mentions_key_flags() {
    Command::cargo_bin("mcp-proxy")
        .expect("binary not built")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--named-server"))
        .stdout(predicate::str::contains("--pass-environment"))
        .stdout(predicate::str::contains("--allow-origin"));
}

#[test]
fn test_no_server_configured_exits_2() {
    Command::cargo_bin("mcp-proxy")
        .expect("binary not built")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_missing_named_server_config_exits_2() {
    Command::cargo_bin("mcp-proxy")
        .expect("binary not built")
        .args(["--named-server-config", "/no/such/config.json"])
        .assert()
        .code(2);
}

#[test]
fn test_invalid_server_name_exits_2() {
    Command::cargo_bin("mcp-proxy")
        .expect("binary not built")
        .args(["--named-server", "bad/name", "true"])
        .assert()
        .code(2);
}

#[test]
fn test_partial_oauth_flags_exit_2() {
    Command::cargo_bin("mcp-proxy")
        .expect("binary not built")
        .args(["--client-id", "only-this", "https://host.example/sse"])
        .assert()
        .code(2);
}
