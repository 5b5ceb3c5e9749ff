use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::analyzer::{StubBehavior, write_stub_analyzer};

/// A temp-directory world shaped like a daemon installation: data root,
/// sessions root, skills, prompt file and a stub analyzer.
pub struct TestWorld {
    _temp: tempfile::TempDir,
    pub data_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub analyzer_path: PathBuf,
}

impl TestWorld {
    pub fn new(behavior: StubBehavior) -> Result<Self> {
        let temp = tempfile::TempDir::new()?;
        let data_dir = temp.path().join("data");
        let sessions_dir = temp.path().join("sessions");
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&sessions_dir)?;

        let skills_dir = data_dir.join("skills");
        std::fs::create_dir_all(&skills_dir)?;
        for skill in ["analysis", "lessons", "friction"] {
            std::fs::write(skills_dir.join(format!("{}.md", skill)), "stub skill")?;
        }

        let prompts_dir = data_dir.join("prompts");
        std::fs::create_dir_all(&prompts_dir)?;
        std::fs::write(prompts_dir.join("analysis.md"), "Analyze the session segment.")?;

        let analyzer_path = write_stub_analyzer(temp.path(), behavior)?;

        Ok(Self {
            _temp: temp,
            data_dir,
            sessions_dir,
            analyzer_path,
        })
    }

    pub fn prompt_path(&self) -> PathBuf {
        self.data_dir.join("prompts/analysis.md")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("brain.db")
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.data_dir.join("nodes")
    }

    /// Replace the stub analyzer's behavior in place (same path).
    pub fn swap_analyzer(&self, behavior: StubBehavior) -> Result<()> {
        write_stub_analyzer(self.analyzer_path.parent().unwrap_or(Path::new(".")), behavior)?;
        Ok(())
    }

    /// All node JSON files currently on disk, sorted.
    pub fn node_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = walk(&self.nodes_dir());
        files.sort();
        files
    }
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk(&path));
        } else {
            out.push(path);
        }
    }
    out
}
