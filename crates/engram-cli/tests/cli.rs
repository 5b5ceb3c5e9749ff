use assert_cmd::Command;
use predicates::prelude::*;

fn engram() -> Command {
    Command::cargo_bin("engram").expect("binary builds")
}

#[test]
fn help_lists_surface() {
    engram()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon"))
        .stdout(predicate::str::contains("health"))
        .stdout(predicate::str::contains("prompt"));
}

#[test]
fn health_fails_fatally_without_an_analyzer() {
    let tmp = tempfile::TempDir::new().unwrap();
    engram()
        .env("ENGRAM_DATA_DIR", tmp.path())
        .env_remove("ENGRAM_CONFIG")
        .arg("health")
        .assert()
        .failure()
        .stdout(predicate::str::contains("analyzer_binary"))
        .stderr(predicate::str::contains("fatal check failed"));
}

#[test]
fn daemon_status_reports_not_running() {
    let tmp = tempfile::TempDir::new().unwrap();
    engram()
        .env("ENGRAM_DATA_DIR", tmp.path())
        .env_remove("ENGRAM_CONFIG")
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon not running"));
}

#[test]
fn prompt_bump_requires_an_existing_prompt() {
    let tmp = tempfile::TempDir::new().unwrap();
    engram()
        .env("ENGRAM_DATA_DIR", tmp.path())
        .env_remove("ENGRAM_CONFIG")
        .args(["prompt", "bump", "--reason", "testing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no prompt file"));
}

#[test]
fn prompt_bump_changes_the_version_label() {
    let tmp = tempfile::TempDir::new().unwrap();
    let prompts = tmp.path().join("prompts");
    std::fs::create_dir_all(&prompts).unwrap();
    std::fs::write(prompts.join("analysis.md"), "Analyze the session.").unwrap();

    engram()
        .env("ENGRAM_DATA_DIR", tmp.path())
        .env_remove("ENGRAM_CONFIG")
        .args(["prompt", "bump", "--reason", "tighten lessons"])
        .assert()
        .success()
        .stdout(predicate::str::contains("prompt bumped to v1-"));

    // A second bump re-normalizes to new content and mints v2
    engram()
        .env("ENGRAM_DATA_DIR", tmp.path())
        .env_remove("ENGRAM_CONFIG")
        .args(["prompt", "bump", "--reason", "again"])
        .assert()
        .success()
        .stdout(predicate::str::contains("prompt bumped to v2-"));
}
