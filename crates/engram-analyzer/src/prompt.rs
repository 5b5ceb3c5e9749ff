use chrono::Utc;
use std::path::{Path, PathBuf};

use engram_types::{content_hash, normalize_prompt};

use crate::{Error, Result};

/// The analyzer prompt file plus its normalized content hash.
#[derive(Debug, Clone)]
pub struct PromptFile {
    pub path: PathBuf,
    pub content: String,
    pub normalized_hash: String,
}

pub fn load_prompt(path: &Path) -> Result<PromptFile> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let normalized_hash = content_hash(&normalize_prompt(&content));
    Ok(PromptFile {
        path: path.to_path_buf(),
        content,
        normalized_hash,
    })
}

/// Force a semantic version bump by appending a visible marker line.
/// An HTML comment would be stripped by normalization and change nothing.
pub fn append_version_bump(path: &Path, reason: &str) -> Result<String> {
    let mut content = std::fs::read_to_string(path).map_err(Error::Io)?;
    if !content.ends_with('\n') {
        content.push('\n');
    }
    let marker = format!(
        "\n[version-bump] {} ({})\n",
        reason,
        Utc::now().format("%Y-%m-%d")
    );
    content.push_str(&marker);
    std::fs::write(path, &content).map_err(Error::Io)?;
    Ok(content_hash(&normalize_prompt(&content)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_hashes_normalized_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.md");
        let b = dir.path().join("b.md");
        std::fs::write(&a, "Analyze  the session.\n").unwrap();
        std::fs::write(&b, "  Analyze the session.").unwrap();

        let pa = load_prompt(&a).unwrap();
        let pb = load_prompt(&b).unwrap();
        assert_eq!(pa.normalized_hash, pb.normalized_hash);
    }

    #[test]
    fn bump_changes_the_hash() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("prompt.md");
        std::fs::write(&path, "Analyze the session.").unwrap();

        let before = load_prompt(&path).unwrap().normalized_hash;
        let after = append_version_bump(&path, "tighten lesson extraction").unwrap();
        assert_ne!(before, after);

        // Bumping is idempotent in shape: file still loads
        let reloaded = load_prompt(&path).unwrap();
        assert_eq!(reloaded.normalized_hash, after);
        assert!(reloaded.content.contains("[version-bump] tighten lesson extraction"));
    }
}
