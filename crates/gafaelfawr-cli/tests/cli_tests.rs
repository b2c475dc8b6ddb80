//! Integration tests for the `gafaelfawr` CLI binary.
//!
//! These tests exercise the CLI as a subprocess, verifying exit codes and
//! stdout output. They do not require a running PostgreSQL instance — the
//! `init`/`run` paths default to the in-memory storage backend unless
//! `GAFAELFAWR_DATABASE_URL` is set.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::process::Command;

fn gafaelfawr_bin() -> String {
    let path = env!("CARGO_BIN_EXE_gafaelfawr");
    assert!(Path::new(path).exists(), "gafaelfawr binary not found at {path}");
    path.to_owned()
}

fn run(args: &[&str]) -> (i32, String, String) {
    let output = Command::new(gafaelfawr_bin())
        .args(args)
        .env_remove("GAFAELFAWR_DATABASE_URL")
        .output()
        .expect("failed to execute gafaelfawr");

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

#[test]
fn test_version_flag() {
    let (code, stdout, _) = run(&["--version"]);
    assert_eq!(code, 0, "--version should exit 0");
    assert!(stdout.contains("gafaelfawr"), "version output should mention gafaelfawr: {stdout}");
}

#[test]
fn test_help_flag() {
    let (code, stdout, _) = run(&["--help"]);
    assert_eq!(code, 0, "--help should exit 0");
    for name in ["init", "generate-key", "generate-token", "update-service-tokens", "kubernetes-controller", "run"] {
        assert!(stdout.contains(name), "help should list subcommand {name}: {stdout}");
    }
}

#[test]
fn test_no_subcommand_fails() {
    let (code, _, stderr) = run(&[]);
    assert_ne!(code, 0, "invoking with no subcommand should fail");
    assert!(!stderr.is_empty());
}

#[test]
fn test_unknown_subcommand_fails() {
    let (code, _, _) = run(&["frobnicate"]);
    assert_ne!(code, 0, "unknown subcommand should fail");
}

// ── generate-key ─────────────────────────────────────────────────────

#[test]
fn test_generate_key_prints_pem() {
    let (code, stdout, stderr) = run(&["generate-key"]);
    assert_eq!(code, 0, "generate-key should succeed: {stderr}");
    assert!(stdout.contains("BEGIN RSA PRIVATE KEY"), "output should be a PKCS#1 PEM: {stdout}");
    assert!(stdout.contains("END RSA PRIVATE KEY"));
}

#[test]
fn test_generate_key_is_non_deterministic() {
    let (_, first, _) = run(&["generate-key"]);
    let (_, second, _) = run(&["generate-key"]);
    assert_ne!(first, second, "two invocations should generate distinct keys");
}

// ── generate-token ───────────────────────────────────────────────────

#[test]
fn test_generate_token_prints_bearer_token() {
    let (code, stdout, stderr) = run(&["generate-token"]);
    assert_eq!(code, 0, "generate-token should succeed: {stderr}");
    let token = stdout.trim();
    assert!(!token.is_empty(), "token should not be empty");
    assert!(!token.contains(' '), "token should be a single unbroken string");
}

#[test]
fn test_generate_token_is_non_deterministic() {
    let (_, first, _) = run(&["generate-token"]);
    let (_, second, _) = run(&["generate-token"]);
    assert_ne!(first, second, "two invocations should generate distinct tokens");
}

// ── stub subcommands ──────────────────────────────────────────────────

#[test]
fn test_update_service_tokens_exits_cleanly() {
    let (code, _, _) = run(&["update-service-tokens"]);
    assert_eq!(code, 0, "update-service-tokens is a no-op stub and should exit 0");
}

#[test]
fn test_kubernetes_controller_exits_cleanly() {
    let (code, _, _) = run(&["kubernetes-controller"]);
    assert_eq!(code, 0, "kubernetes-controller is a no-op stub and should exit 0");
}

// ── init ─────────────────────────────────────────────────────────────

#[test]
fn test_init_with_memory_backend_succeeds() {
    let (code, stdout, stderr) = run(&["init"]);
    assert_eq!(code, 0, "init against the in-memory backend should succeed: {stderr}");
    assert!(stdout.contains("ready"));
}
