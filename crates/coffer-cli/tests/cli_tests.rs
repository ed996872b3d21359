//! Integration tests for the `coffer` CLI binary.
//!
//! These tests run the CLI as a subprocess against a vault rooted in a
//! temporary directory, verifying exit codes, stdout output and on-disk
//! side effects.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};

use coffer_core::crypto::{KdfParams, hash_password_with};
use serde_json::json;

const ROOT_PASSWORD: &str = "root-password";

/// Helper: locate the `coffer` binary built by `cargo test`.
fn coffer_bin() -> String {
    let path = env!("CARGO_BIN_EXE_coffer");
    assert!(Path::new(path).exists(), "coffer binary not found at {path}");
    path.to_owned()
}

fn command(root: &Path) -> Command {
    let mut cmd = Command::new(coffer_bin());
    cmd.env("COFFER_ROOT", root)
        .env("COFFER_LOG_LEVEL", "warn")
        .env_remove("COFFER_TOKEN")
        .env_remove("COFFER_PASSWORD")
        .env_remove("COFFER_ROOT_PASSWORD")
        .env_remove("COFFER_AUDIT_FILE")
        .env_remove("RUST_LOG");
    cmd
}

/// Helper: run coffer with args and return (`exit_code`, stdout, stderr).
fn run(root: &Path, args: &[&str]) -> (i32, String, String) {
    let output = command(root)
        .args(args)
        .output()
        .expect("failed to execute coffer");
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

/// Helper: run coffer feeding `input` on stdin.
fn run_with_stdin(root: &Path, args: &[&str], input: &str) -> (i32, String, String) {
    let mut child = command(root)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn coffer");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

/// Helper: seed a vault with cheap key derivation and a root password.
fn seed(root: &Path) {
    let kdf = KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };
    fs::create_dir_all(root.join(".vault")).unwrap();
    let vault = json!({
        "keyStore": {"password": "keystore-pw", "kdf": kdf},
        "masterCypher": {"keyPath": ".vault/master"},
        "tokenSignatureCypher": {
            "keyPath": ".vault/token-signature",
            "algorithm": "EdDSA",
            "keyGenerator": "Ed25519"
        }
    });
    fs::write(root.join(".vault/vault.json"), vault.to_string()).unwrap();

    fs::create_dir_all(root.join("sys/principle")).unwrap();
    let principal = json!({
        "sub": "root",
        "pol": ["root"],
        "pass": hash_password_with(ROOT_PASSWORD, &kdf).unwrap()
    });
    fs::write(root.join("sys/principle/root"), principal.to_string()).unwrap();
}

fn login(root: &Path) -> String {
    let (code, stdout, stderr) = run(root, &["login", "root", "--password", ROOT_PASSWORD]);
    assert_eq!(code, 0, "login failed: {stderr}");
    stdout.trim().to_owned()
}

// ── Version & help ───────────────────────────────────────────────────

#[test]
fn test_version_flag() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run(dir.path(), &["--version"]);
    assert_eq!(code, 0, "coffer --version should exit 0");
    assert!(stdout.contains("coffer"), "version output should contain 'coffer': {stdout}");
}

#[test]
fn test_help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run(dir.path(), &["--help"]);
    assert_eq!(code, 0);
    for command in ["init", "hash-password", "login", "read", "write", "rm", "ls", "token"] {
        assert!(stdout.contains(command), "help should list '{command}'");
    }
}

// ── Commands without a vault ─────────────────────────────────────────

#[test]
fn test_hash_password_from_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, stderr) = run_with_stdin(dir.path(), &["hash-password"], "hunter2\n");
    assert_eq!(code, 0, "hash-password failed: {stderr}");
    assert!(stdout.trim().starts_with("$argon2id$"), "unexpected hash: {stdout}");
    assert!(!dir.path().join(".vault").exists(), "hash-password must not touch the vault");
}

#[test]
fn test_missing_token_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let (code, _, stderr) = run(dir.path(), &["read", "secret/x"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("no token"), "should explain the missing token: {stderr}");
}

// ── Vault lifecycle ──────────────────────────────────────────────────

#[test]
fn test_init_creates_and_migrates() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let (code, stdout, stderr) = run(dir.path(), &["init"]);
    assert_eq!(code, 0, "init failed: {stderr}");
    assert!(stdout.contains("Vault ready"));

    let root = dir.path();
    assert!(root.join(".vault/keystore.json").exists());
    assert!(root.join("sys/policy").is_dir());
    assert!(root.join("sys/token/.revoked").is_dir());
    assert!(root.join("sys/principle/root.sec").exists());
    assert!(!root.join("sys/principle/root").exists());
}

#[test]
fn test_wrong_password_fails() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let (code, stdout, stderr) = run(dir.path(), &["login", "root", "--password", "nope"]);
    assert_ne!(code, 0);
    assert!(stdout.is_empty());
    assert!(stderr.contains("authentication failed"), "{stderr}");
}

#[test]
fn test_secret_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let root = dir.path();
    let token = login(root);
    assert!(token.starts_with("t."));

    let (code, _, stderr) =
        run_with_stdin(root, &["write", "secret/app1/db", "--token", &token], "s3cret\n");
    assert_eq!(code, 0, "write failed: {stderr}");

    let (code, stdout, _) = run(root, &["read", "secret/app1/db", "--token", &token]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "s3cret");

    let (code, stdout, _) = run(root, &["ls", "secret", "--token", &token]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "app1/");

    let (code, _, _) = run(root, &["rm", "secret/app1/db", "--token", &token]);
    assert_eq!(code, 0);
    let (code, _, stderr) = run(root, &["read", "secret/app1/db", "--token", &token]);
    assert_ne!(code, 0);
    assert!(stderr.contains("access denied"), "{stderr}");
}

#[test]
fn test_single_use_token() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let root = dir.path();
    let token = login(root);
    let (code, _, _) = run(root, &["write", "secret/a", "value", "--token", &token]);
    assert_eq!(code, 0);

    let (code, stdout, stderr) = run(
        root,
        &["token", "create", "--uses", "1", "--opaque", "--scope", "secret", "--token", &token],
    );
    assert_eq!(code, 0, "token create failed: {stderr}");
    let single = stdout.trim().to_owned();

    let (code, stdout, _) = run(root, &["read", "secret/a", "--token", &single]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "value");
    let (code, _, stderr) = run(root, &["read", "secret/a", "--token", &single]);
    assert_ne!(code, 0);
    assert!(stderr.contains("invalid token"), "{stderr}");
}

#[test]
fn test_revoke_and_renew() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let root = dir.path();
    let token = login(root);

    let (code, stdout, _) = run(root, &["token", "renew", "--token", &token]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), token);

    let (code, stdout, _) = run(root, &["token", "create", "--token", &token]);
    assert_eq!(code, 0);
    let child = stdout.trim().to_owned();
    assert_eq!(child.split('.').count(), 3, "default tokens are signed");

    let (code, _, _) = run(root, &["token", "revoke", &child, "--token", &token]);
    assert_eq!(code, 0);
    let (code, _, _) = run(root, &["ls", "--token", &child]);
    assert_ne!(code, 0);

    let (code, _, _) = run(root, &["token", "revoke", "--token", &token]);
    assert_eq!(code, 0);
    let (code, _, _) = run(root, &["ls", "--token", &token]);
    assert_ne!(code, 0);
}

#[test]
fn test_init_sets_first_root_password() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let (code, _, stderr) = run(root, &["init", "--root-password", "first"]);
    assert_eq!(code, 0, "init failed: {stderr}");

    let (code, stdout, stderr) = run(root, &["login", "root", "--password", "first"]);
    assert_eq!(code, 0, "login failed: {stderr}");
    assert!(stdout.trim().starts_with("t."));

    let (code, _, stderr) = run(root, &["init", "--root-password", "second"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("already set"), "{stderr}");
}

#[test]
fn test_audit_file_records_operations() {
    let dir = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    seed(dir.path());
    let root = dir.path();
    let audit = logs.path().join("audit/coffer.log");
    let token = login(root);

    let (code, _, stderr) = run(
        root,
        &["write", "secret/a", "v", "--token", &token, "--audit-file", audit.to_str().unwrap()],
    );
    assert_eq!(code, 0, "write failed: {stderr}");

    let log = fs::read_to_string(&audit).unwrap();
    let entry: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
    assert_eq!(entry["operation"], "write");
    assert_eq!(entry["outcome"], "ok");
    assert!(!log.contains(&token), "raw tokens must never reach the audit log");
}

#[test]
fn test_audit_file_inside_root_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let root = dir.path();
    let token = login(root);

    let dotted = root.join("..").join(root.file_name().unwrap()).join("x.log");
    for audit in [root.join("audit/coffer.log"), dotted] {
        let (code, _, stderr) = run(
            root,
            &["write", "secret/a", "v", "--token", &token, "--audit-file", audit.to_str().unwrap()],
        );
        assert_ne!(code, 0, "audit log inside the root must be refused");
        assert!(stderr.contains("must not be inside the vault root"), "{stderr}");
    }
    assert!(!root.join("audit").exists());
    assert!(!root.join("secret/a.sec").exists(), "nothing may run unaudited");
}
