//! CLI tests for the hearth binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn hearth() -> Command {
    let mut cmd = Command::cargo_bin("hearth").unwrap();
    cmd.env_remove("HEARTH_CONFIG")
        .env_remove("HEARTH_DATA_DIR")
        .env_remove("HEARTH_SIGNING_SECRET");
    cmd
}

#[test]
fn test_cli_help() {
    hearth()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("extensions"))
        .stdout(predicate::str::contains("token-digest"));
}

#[test]
fn test_token_digest() {
    hearth()
        .args(["token-digest", "abc"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        ));
}

#[test]
fn test_extensions_list_reads_settings() {
    let dir = tempfile::tempdir().unwrap();
    let settings = dir.path().join("extensions.json");
    std::fs::write(
        &settings,
        r#"{ "extensions": { "products": { "enabled": true } } }"#,
    )
    .unwrap();
    let config = dir.path().join("hearth.toml");
    std::fs::write(
        &config,
        format!(
            "[extensions]\nsettings_path = {:?}\n",
            settings.display().to_string()
        ),
    )
    .unwrap();

    hearth()
        .arg("--config")
        .arg(&config)
        .args(["extensions", "list"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"products\s+\S+\s+yes").unwrap())
        .stdout(predicate::str::is_match(r"analytics\s+\S+\s+no").unwrap())
        .stdout(predicate::str::contains("cloud-storage"));
}

#[test]
fn test_malformed_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("hearth.toml");
    std::fs::write(&config, "[server\nport = ").unwrap();

    hearth()
        .arg("--config")
        .arg(&config)
        .arg("show-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse"));
}

#[test]
fn test_show_config_redacts_secret() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("hearth.toml");
    std::fs::write(&config, "[storage]\nsigning_secret = \"hunter2\"\n").unwrap();

    hearth()
        .arg("--config")
        .arg(&config)
        .arg("show-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("<redacted>"))
        .stdout(predicate::str::contains("hunter2").not());
}

#[test]
fn test_serve_rejects_invalid_port() {
    hearth()
        .args(["serve", "--port", "not-a-port"])
        .assert()
        .failure();
}
