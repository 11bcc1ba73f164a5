use std::fs;
use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

fn facesetrs(config_dir: &TempDir) -> Result<Command> {
    let config = config_dir.path().join("config.toml");
    if !config.exists() {
        fs::write(&config, "")?;
    }
    let mut cmd = Command::cargo_bin("facesetrs")?;
    cmd.env_remove("TMDB_API_KEY")
        .env_remove("FACE_ANALYZER_URL")
        .arg("--config")
        .arg(&config)
        .arg("--data-root")
        .arg(config_dir.path().join("dataset"))
        .arg("--no-progress");
    Ok(cmd)
}

#[test]
fn help_lists_run_flags() -> Result<()> {
    Command::cargo_bin("facesetrs")?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--no-resume"))
        .stdout(predicate::str::contains("--no-verify"))
        .stdout(predicate::str::contains("--no-search"))
        .stdout(predicate::str::contains("--report"));
    Ok(())
}

#[test]
fn missing_api_key_is_a_configuration_failure() -> Result<()> {
    let dir = TempDir::new()?;
    facesetrs(&dir)?
        .arg("--face-endpoint")
        .arg("http://127.0.0.1:9/analyze")
        .arg("Sai Pallavi")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("API key"));

    assert!(!dir.path().join("dataset").join("raw").exists());
    Ok(())
}

#[test]
fn missing_face_endpoint_is_a_configuration_failure() -> Result<()> {
    let dir = TempDir::new()?;
    facesetrs(&dir)?
        .arg("--api-key")
        .arg("test-key")
        .arg("Sai Pallavi")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("face analyzer endpoint"));
    Ok(())
}

#[test]
fn out_of_range_threshold_in_config_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    fs::write(
        dir.path().join("config.toml"),
        "[verification]\nsimilarity_threshold = 1.5\n",
    )?;
    facesetrs(&dir)?
        .arg("--api-key")
        .arg("test-key")
        .arg("--face-endpoint")
        .arg("http://127.0.0.1:9/analyze")
        .arg("Sai Pallavi")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("similarity_threshold"));
    Ok(())
}

#[test]
fn blank_name_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    facesetrs(&dir)?
        .arg("   ")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Name must not be empty"));
    Ok(())
}
