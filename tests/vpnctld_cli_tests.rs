//! Integration tests for vpnctld
//!
//! These tests exercise argument handling and the failure paths that end
//! before a daemon is spawned.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a test vpnctld command
fn vpnctld() -> Command {
    let mut cmd = Command::cargo_bin("vpnctld").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let path = dir.join("vpnctl.toml");
    let contents = format!(
        "[daemon]\nprogram = \"/nonexistent/openvpn\"\n\n[nodes]\nconfig_dir = \"{}\"\n{}",
        dir.display(),
        extra
    );
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_help_command() {
    vpnctld()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("VPN Connection Daemon"))
        .stdout(predicate::str::contains("--connect"));
}

#[test]
fn test_print_default_config() {
    vpnctld()
        .arg("--print-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("management_port = 1203"))
        .stdout(predicate::str::contains("program = \"openvpn\""));
}

#[test]
fn test_print_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "");

    vpnctld()
        .arg("--config")
        .arg(&path)
        .arg("--print-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("/nonexistent/openvpn"))
        .stdout(predicate::str::contains("startup_grace_ms = 1000"));
}

#[test]
fn test_missing_config_file() {
    vpnctld()
        .arg("--config")
        .arg("/nonexistent/vpnctl.toml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn test_invalid_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[daemon\nprogram = ").unwrap();

    vpnctld()
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn test_connect_refused_node() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "\n[credentials]\nallowed_nodes = [1]\n");

    vpnctld()
        .arg("--config")
        .arg(&path)
        .arg("--connect")
        .arg("2")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Connection to node 2 refused"))
        .stdout(predicate::str::contains(r#"{"event":"state","data":null}"#));
}

#[test]
fn test_connect_without_node_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "");

    vpnctld()
        .arg("--config")
        .arg(&path)
        .arg("--connect")
        .arg("5")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No configuration available for node 5"))
        .stdout(predicate::str::contains(r#"{"event":"bandwidth","data":null}"#));
}
