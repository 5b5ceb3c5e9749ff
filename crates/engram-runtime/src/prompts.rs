use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use engram_analyzer::load_prompt;
use engram_index::Database;
use engram_types::PromptVersion;

use crate::{Error, Result};

/// The prompt version the daemon is currently analyzing with. Re-resolved
/// when the prompt file changes (reanalysis scheduling compares against it).
#[derive(Clone)]
pub struct PromptState {
    current: Arc<RwLock<PromptVersion>>,
}

impl PromptState {
    pub fn current(&self) -> PromptVersion {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn label(&self) -> String {
        self.current().label
    }

    fn replace(&self, version: PromptVersion) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = version;
    }
}

/// Read the prompt file, resolve (or mint) its version record, and archive
/// the text under `prompts/history/` the first time a version is seen.
pub fn resolve_prompt_version(
    db: &Arc<Mutex<Database>>,
    prompt_path: &Path,
    data_dir: &Path,
) -> Result<PromptVersion> {
    let prompt = load_prompt(prompt_path)?;

    let mut guard = db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = guard.prompt_version_by_hash(&prompt.normalized_hash)? {
        return Ok(existing);
    }

    let history_dir = data_dir.join("prompts/history");
    std::fs::create_dir_all(&history_dir)?;

    // Label is not known until the row exists; resolve first, then archive
    // and record where the text went
    let mut version = guard.resolve_prompt_version(&prompt.normalized_hash, None)?;
    let archived = history_dir.join(format!(
        "{}-{}.md",
        version.label,
        Utc::now().format("%Y-%m-%d")
    ));
    std::fs::write(&archived, &prompt.content)?;

    let archived_str = archived.to_string_lossy().into_owned();
    guard
        .set_prompt_archived_path(&version.label, &archived_str)
        .map_err(Error::Index)?;
    version.archived_path = Some(archived_str);
    Ok(version)
}

/// Build prompt state at startup, creating a default prompt file if none
/// exists yet.
pub fn init_prompt_state(
    db: &Arc<Mutex<Database>>,
    prompt_path: &Path,
    data_dir: &Path,
) -> Result<PromptState> {
    if !prompt_path.exists() {
        if let Some(parent) = prompt_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(prompt_path, DEFAULT_ANALYSIS_PROMPT)?;
    }

    let version = resolve_prompt_version(db, prompt_path, data_dir)?;
    Ok(PromptState {
        current: Arc::new(RwLock::new(version)),
    })
}

/// Refresh after an external edit or a `prompt bump`. Returns true when the
/// version changed.
pub fn refresh_prompt_state(
    state: &PromptState,
    db: &Arc<Mutex<Database>>,
    prompt_path: &Path,
    data_dir: &Path,
) -> Result<bool> {
    let version = resolve_prompt_version(db, prompt_path, data_dir)?;
    let changed = version.label != state.label();
    if changed {
        tracing::info!(label = %version.label, "analyzer prompt version changed");
        state.replace(version);
    }
    Ok(changed)
}

const DEFAULT_ANALYSIS_PROMPT: &str = "\
You are the analysis pass of a knowledge daemon. You receive one segment of
a coding-agent session as JSON on stdin. Emit a single JSON document with
the fields: classification, content, lessons, semantic, friction.

Classify the work, summarize what happened and how it ended, list the key
decisions, files touched, tools used and errors seen, extract lessons
bucketed by level (project, task, user, model, tool, skill, subagent), and
flag friction signals such as abandoned restarts, tool loops and
rephrasing cascades.
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_default_prompt_and_archives_it() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let prompt_path = tmp.path().join("prompts/analysis.md");

        let state = init_prompt_state(&db, &prompt_path, tmp.path()).unwrap();
        assert!(prompt_path.exists());
        assert!(state.label().starts_with("v1-"));

        let history: Vec<_> = std::fs::read_dir(tmp.path().join("prompts/history"))
            .unwrap()
            .collect();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn whitespace_edit_does_not_change_version() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let prompt_path = tmp.path().join("analysis.md");
        std::fs::write(&prompt_path, "Analyze the session.").unwrap();

        let state = init_prompt_state(&db, &prompt_path, tmp.path()).unwrap();
        let before = state.label();

        std::fs::write(&prompt_path, "Analyze   the\nsession.\n").unwrap();
        let changed = refresh_prompt_state(&state, &db, &prompt_path, tmp.path()).unwrap();
        assert!(!changed);
        assert_eq!(state.label(), before);
    }

    #[test]
    fn content_edit_bumps_version() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let prompt_path = tmp.path().join("analysis.md");
        std::fs::write(&prompt_path, "Analyze the session.").unwrap();

        let state = init_prompt_state(&db, &prompt_path, tmp.path()).unwrap();

        std::fs::write(&prompt_path, "Analyze the session. Extract lessons.").unwrap();
        let changed = refresh_prompt_state(&state, &db, &prompt_path, tmp.path()).unwrap();
        assert!(changed);
        assert!(state.label().starts_with("v2-"));
    }
}
