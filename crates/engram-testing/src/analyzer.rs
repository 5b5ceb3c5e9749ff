use anyhow::Result;
use std::path::{Path, PathBuf};

/// Scriptable analyzer stand-in behaviors for end-to-end scenarios.
pub enum StubBehavior {
    /// Exit 0 with a complete node document on stdout
    Success,
    /// Exit non-zero with the given stderr line
    Fail { stderr: String, exit_code: u8 },
    /// Fail `failures` times (tracked in a counter file), then succeed
    SucceedAfter { failures: u32, stderr: String },
    /// Exit 0 but emit unsalvageable stdout
    Malformed,
    /// Sleep before succeeding (timeout / concurrency scenarios)
    SlowSuccess { seconds: u32 },
}

const NODE_DOCUMENT: &str = r#"{
  "classification": {"type": "feature", "project": "", "language": "rust",
                     "frameworks": [], "hadClearGoal": true, "isNewProject": false},
  "content": {"summary": "Stub analysis of the provided segment", "outcome": "success",
              "keyDecisions": ["used the stub"], "filesTouched": ["src/lib.rs"],
              "toolsUsed": ["Edit"], "errorsSeen": []},
  "lessons": {"tool": ["stub analyzers are fast"]},
  "semantic": {"tags": ["stub"]},
  "friction": []
}"#;

/// Write an executable shell script that mimics the analyzer contract:
/// JSON payload on stdin, node document on stdout, diagnostics on stderr.
pub fn write_stub_analyzer(dir: &Path, behavior: StubBehavior) -> Result<PathBuf> {
    let path = dir.join("stub-analyzer.sh");
    let document = NODE_DOCUMENT.replace('\n', " ");

    let body = match behavior {
        StubBehavior::Success => format!(
            "#!/bin/sh\ncat > /dev/null\nprintf '%s\\n' '{}'\nexit 0\n",
            document
        ),
        StubBehavior::Fail { stderr, exit_code } => format!(
            "#!/bin/sh\ncat > /dev/null\necho '{}' >&2\nexit {}\n",
            stderr, exit_code
        ),
        StubBehavior::SucceedAfter { failures, stderr } => format!(
            "#!/bin/sh\ncat > /dev/null\n\
             counter=\"$(dirname \"$0\")/stub-attempts\"\n\
             attempts=$(cat \"$counter\" 2>/dev/null || echo 0)\n\
             attempts=$((attempts + 1))\n\
             echo \"$attempts\" > \"$counter\"\n\
             if [ \"$attempts\" -le {} ]; then\n\
               echo '{}' >&2\n\
               exit 1\n\
             fi\n\
             printf '%s\\n' '{}'\nexit 0\n",
            failures, stderr, document
        ),
        StubBehavior::Malformed => {
            "#!/bin/sh\ncat > /dev/null\necho 'certainly not a node document'\nexit 0\n"
                .to_string()
        }
        StubBehavior::SlowSuccess { seconds } => format!(
            "#!/bin/sh\ncat > /dev/null\nsleep {}\nprintf '%s\\n' '{}'\nexit 0\n",
            seconds, document
        ),
    };

    std::fs::write(&path, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_document_is_a_valid_wire_shape() {
        let value: serde_json::Value = serde_json::from_str(NODE_DOCUMENT).unwrap();
        assert_eq!(value["content"]["outcome"], "success");
        assert!(value["classification"]["hadClearGoal"].as_bool().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn stub_script_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_stub_analyzer(tmp.path(), StubBehavior::Success).unwrap();
        let mode = path.metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
