use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use engram_analyzer::{AnalyzerConfig, Invocation, invoke, probe_skills};
use engram_index::Database;

use crate::config::Config;

/// One preflight check outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub fatal: bool,
}

impl CheckResult {
    fn ok(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
            fatal: false,
        }
    }

    fn fail(name: &str, message: impl Into<String>, fatal: bool) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
            fatal,
        }
    }
}

pub fn any_fatal(results: &[CheckResult]) -> bool {
    results.iter().any(|r| !r.passed && r.fatal)
}

/// Resolve a binary name against PATH, or verify an explicit path.
pub fn resolve_binary(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

/// Ordered startup checks. Any failed fatal check aborts startup; the HTTP
/// surface re-runs the same set on demand (minus the roundtrip unless
/// asked, since it spends an analyzer call).
pub async fn run_preflight(
    config: &Config,
    data_dir: &Path,
    db: &Arc<Mutex<Database>>,
    with_roundtrip: bool,
    cancel: &CancellationToken,
) -> Vec<CheckResult> {
    let mut results = Vec::new();

    // 1. Analyzer binary
    let binary = resolve_binary(&config.analyzer_binary);
    match &binary {
        Some(path) => results.push(CheckResult::ok(
            "analyzer_binary",
            format!("found {}", path.display()),
        )),
        None => results.push(CheckResult::fail(
            "analyzer_binary",
            format!("'{}' not found in PATH", config.analyzer_binary),
            true,
        )),
    }

    // 2. Analyzer version (best effort, never fatal)
    if let Some(path) = &binary {
        results.push(check_version(path).await);
    }

    // 3/4. Skills
    let skills_dir = config.skills_dir(data_dir);
    let probe = probe_skills(
        &skills_dir,
        &config.analyzer_required_skills,
        &config.analyzer_optional_skills,
    );
    if probe.missing_required.is_empty() {
        results.push(CheckResult::ok(
            "required_skills",
            format!("{} present", config.analyzer_required_skills.join(", ")),
        ));
    } else {
        results.push(CheckResult::fail(
            "required_skills",
            format!("missing: {}", probe.missing_required.join(", ")),
            true,
        ));
    }
    if probe.missing_optional.is_empty() {
        results.push(CheckResult::ok("optional_skills", "all present"));
    } else {
        results.push(CheckResult::fail(
            "optional_skills",
            format!("missing: {} (reduced context)", probe.missing_optional.join(", ")),
            false,
        ));
    }

    // 5. Prompt file
    let prompt_path = config.prompt_path(data_dir);
    if prompt_path.is_file() {
        results.push(CheckResult::ok(
            "prompt_file",
            format!("{}", prompt_path.display()),
        ));
    } else {
        results.push(CheckResult::fail(
            "prompt_file",
            format!("missing: {}", prompt_path.display()),
            true,
        ));
    }

    // 6. Database writability
    let db_check = {
        let guard = db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.check_writable()
    };
    match db_check {
        Ok(()) => results.push(CheckResult::ok("database", "writable")),
        Err(e) => results.push(CheckResult::fail("database", e.to_string(), true)),
    }

    // 7. Sessions directories (non-fatal; the watcher re-probes)
    let roots = config.session_roots();
    let existing: Vec<_> = roots.iter().filter(|r| r.exists()).collect();
    if existing.is_empty() {
        results.push(CheckResult::fail(
            "sessions_dirs",
            format!(
                "none of {} exist yet",
                roots
                    .iter()
                    .map(|r| r.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            false,
        ));
    } else {
        results.push(CheckResult::ok(
            "sessions_dirs",
            format!("{} of {} roots present", existing.len(), roots.len()),
        ));
    }

    // 8. Analyzer roundtrip (verifies model credentials; fatal)
    if with_roundtrip
        && let Some(path) = &binary
        && prompt_path.is_file()
    {
        results.push(check_roundtrip(config, path, &prompt_path, cancel).await);
    }

    results
}

async fn check_version(binary: &Path) -> CheckResult {
    let output = tokio::time::timeout(
        Duration::from_secs(10),
        tokio::process::Command::new(binary).arg("--version").output(),
    )
    .await;

    match output {
        Ok(Ok(out)) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
            CheckResult::ok("analyzer_version", version)
        }
        Ok(Ok(out)) => CheckResult::fail(
            "analyzer_version",
            format!("--version exited {:?}", out.status.code()),
            false,
        ),
        Ok(Err(e)) => CheckResult::fail("analyzer_version", e.to_string(), false),
        Err(_) => CheckResult::fail("analyzer_version", "--version timed out", false),
    }
}

async fn check_roundtrip(
    config: &Config,
    binary: &Path,
    prompt_path: &Path,
    cancel: &CancellationToken,
) -> CheckResult {
    let analyzer = AnalyzerConfig {
        binary: binary.to_path_buf(),
        provider: config.analyzer_provider.clone(),
        model: config.analyzer_model.clone(),
        system_prompt_path: prompt_path.to_path_buf(),
        skills: Vec::new(),
    };
    let invocation = Invocation {
        instructions: "Respond with the JSON document {\"ok\": true}".to_string(),
        payload: serde_json::json!({"ping": true}),
        timeout: Duration::from_secs(60),
        term_grace: Duration::from_secs(5),
    };

    match invoke(&analyzer, &invocation, cancel).await {
        Ok(output) if output.succeeded() => {
            match serde_json::from_str::<serde_json::Value>(output.stdout.trim()) {
                Ok(_) => CheckResult::ok("analyzer_roundtrip", "model responded"),
                Err(_) => CheckResult::fail(
                    "analyzer_roundtrip",
                    "analyzer replied with non-JSON output",
                    true,
                ),
            }
        }
        Ok(output) => CheckResult::fail(
            "analyzer_roundtrip",
            format!(
                "exit {:?}: {}",
                output.exit_code,
                output.stderr.lines().next().unwrap_or("")
            ),
            true,
        ),
        Err(e) => CheckResult::fail("analyzer_roundtrip", e.to_string(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.sessions_dirs = vec![dir.join("sessions")];
        config.analyzer_prompt_path = Some(dir.join("analysis.md"));
        config.analyzer_skills_dir = Some(dir.join("skills"));
        config.analyzer_binary = "definitely-not-a-real-binary".to_string();
        config
    }

    #[tokio::test]
    async fn missing_binary_and_skills_are_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = test_config(tmp.path());
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));

        let results =
            run_preflight(&config, tmp.path(), &db, false, &CancellationToken::new()).await;
        assert!(any_fatal(&results));

        let binary = results.iter().find(|r| r.name == "analyzer_binary").unwrap();
        assert!(!binary.passed && binary.fatal);
        let skills = results.iter().find(|r| r.name == "required_skills").unwrap();
        assert!(!skills.passed && skills.fatal);
    }

    #[tokio::test]
    async fn complete_environment_passes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        // Use a binary that certainly exists; no roundtrip is attempted
        config.analyzer_binary = "/bin/sh".to_string();

        std::fs::create_dir_all(tmp.path().join("sessions")).unwrap();
        std::fs::create_dir_all(tmp.path().join("skills")).unwrap();
        std::fs::write(tmp.path().join("skills/analysis.md"), "skill").unwrap();
        std::fs::write(tmp.path().join("skills/lessons.md"), "skill").unwrap();
        std::fs::write(tmp.path().join("skills/friction.md"), "skill").unwrap();
        std::fs::write(tmp.path().join("analysis.md"), "analyze").unwrap();

        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let results =
            run_preflight(&config, tmp.path(), &db, false, &CancellationToken::new()).await;
        assert!(!any_fatal(&results), "unexpected fatal: {:?}", results);
    }

    #[test]
    fn resolve_binary_handles_paths_and_names() {
        assert!(resolve_binary("/bin/sh").is_some());
        assert!(resolve_binary("sh").is_some());
        assert!(resolve_binary("definitely-not-a-real-binary").is_none());
    }
}
