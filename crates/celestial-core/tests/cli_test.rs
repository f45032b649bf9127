//! End-to-end tests for the `celestial-tts` binary.
//!
//! Only paths that exit on their own are exercised; serving waits for Ctrl-C.

use assert_cmd::prelude::*;
use predicates::str;
use std::process::Command;
use tempfile::TempDir;

#[test]
#[allow(deprecated)] // cargo_bin is deprecated in favour of cargo_bin! but still works
fn test_help_lists_options() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("celestial-tts")?;
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(str::contains("--config"))
        .stdout(str::contains("--preload"))
        .stdout(str::contains("--log-json"));
    Ok(())
}

#[test]
#[allow(deprecated)]
fn test_invalid_capacity_exits_with_error() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    let config = temp.path().join("config.toml");
    std::fs::write(&config, "[integrated_models]\nmax_loaded_models = 0\n")?;

    let mut cmd = Command::cargo_bin("celestial-tts")?;
    cmd.arg("--config").arg(&config).env_remove("CELESTIAL_INTEGRATED_MODELS_MAX_LOADED_MODELS");
    cmd.assert().failure().code(1);
    Ok(())
}

#[test]
#[allow(deprecated)]
fn test_unknown_preload_exits_with_error() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    let config = temp.path().join("config.toml");
    std::fs::write(&config, "[integrated_models]\nmax_loaded_models = 1\n")?;

    let mut cmd = Command::cargo_bin("celestial-tts")?;
    cmd.arg("--config")
        .arg(&config)
        .arg("--preload")
        .arg("qwen9-tts")
        .env("RUST_LOG", "error");
    cmd.assert().failure().code(1);
    Ok(())
}

#[test]
#[allow(deprecated)]
fn test_missing_config_file_exits_with_error() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;

    let mut cmd = Command::cargo_bin("celestial-tts")?;
    cmd.arg("--config").arg(temp.path().join("nope.toml"));
    cmd.assert().failure().code(1);
    Ok(())
}
