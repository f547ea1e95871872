//! CLI integration tests
//!
//! Tests the flaretun CLI using assert_cmd. Every test points the config dir
//! at a temp directory so the user's real registry is never touched.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn flaretun(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("flaretun")
        .expect("Failed to locate flaretun binary - ensure it's built before running tests");
    cmd.env("FLARETUN_CONFIG_DIR", config_dir.path())
        .env("FLARETUN_CLOUDFLARED_DIR", config_dir.path().join("cloudflared"))
        .env_remove("FLARETUN_CLOUDFLARED")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    let dir = TempDir::new().unwrap();
    flaretun(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("flaretun"))
        .stdout(predicate::str::contains("cloudflared tunnels"));
}

#[test]
fn test_cli_version() {
    let dir = TempDir::new().unwrap();
    flaretun(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("flaretun"));
}

#[test]
fn test_cli_add_help_mentions_alias() {
    let dir = TempDir::new().unwrap();
    flaretun(&dir)
        .args(["add-service", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--hostname"))
        .stdout(predicate::str::contains("--no-dns"));
}

#[test]
fn test_cli_list_empty_registry() {
    let dir = TempDir::new().unwrap();
    flaretun(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No tunnel selected"));

    flaretun(&dir)
        .args(["list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));
}

#[test]
fn test_cli_add_without_cloudflared_fails() {
    let dir = TempDir::new().unwrap();
    flaretun(&dir)
        .args(["--cloudflared", "/nonexistent/cloudflared"])
        .args(["add", "--hostname", "app.example.com", "--port", "3000"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not installed"))
        .stderr(predicate::str::contains("hint:"));

    // Nothing was written
    assert!(!dir.path().join("config.json").exists());
}

#[test]
fn test_cli_run_without_cloudflared_fails() {
    let dir = TempDir::new().unwrap();
    flaretun(&dir)
        .args(["--cloudflared", "/nonexistent/cloudflared", "run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not installed"));
}

#[test]
fn test_cli_stop_rejects_all_with_tunnel() {
    let dir = TempDir::new().unwrap();
    flaretun(&dir)
        .args(["stop", "--all", "--tunnel", "dev"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_cli_config_path() {
    let dir = TempDir::new().unwrap();
    flaretun(&dir)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(dir.path().to_string_lossy().as_ref()));
}

#[test]
fn test_cli_config_set_and_get() {
    let dir = TempDir::new().unwrap();

    flaretun(&dir)
        .args(["config", "set", "health_timeout_ms", "2500"])
        .assert()
        .success();

    flaretun(&dir)
        .args(["config", "get", "health_timeout_ms"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2500"));

    let settings = std::fs::read_to_string(dir.path().join("settings.toml")).unwrap();
    assert!(settings.contains("health_timeout_ms = 2500"));

    flaretun(&dir)
        .args(["config", "get", "cloudflared_bin"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cloudflared"));
}

#[test]
fn test_cli_config_rejects_unknown_key() {
    let dir = TempDir::new().unwrap();
    flaretun(&dir)
        .args(["config", "set", "nope", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown setting"));
}

#[test]
fn test_cli_config_rejects_invalid_value() {
    let dir = TempDir::new().unwrap();
    flaretun(&dir)
        .args(["config", "set", "health_timeout_ms", "soon"])
        .assert()
        .failure();
    assert!(!dir.path().join("settings.toml").exists());
}

#[test]
fn test_cli_broken_settings_reported() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("settings.toml"), "health_timeout_ms = \"x\"").unwrap();

    flaretun(&dir)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load settings"));

    // config commands still work so the file can be fixed
    flaretun(&dir)
        .args(["config", "path"])
        .assert()
        .success();
}

#[test]
fn test_cli_legacy_registry_is_migrated() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        r#"{
          "tunnelId": "6ff42ae2-765d-4adf-8112-31c55c1551ef",
          "tunnelName": "dev",
          "services": [
            {"hostname": "app.example.com", "service": "http://localhost:3000", "createdAt": "2024-02-01T10:00:00Z"}
          ]
        }"#,
    )
    .unwrap();

    flaretun(&dir)
        .args(["list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("app.example.com"))
        .stdout(predicate::str::contains("\"port\": 3000"));
}
