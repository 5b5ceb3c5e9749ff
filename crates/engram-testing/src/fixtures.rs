use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use engram_session::encode_cwd;

/// Builder for session files in the producer's wire format.
///
/// Entries are appended in order; timestamps default to one second apart
/// starting from `base_time`. The built file lands under the conventional
/// `--<encoded_cwd>--/<timestamp>_<uuid>.jsonl` layout.
pub struct SessionFixture {
    cwd: String,
    session_id: String,
    base_time: DateTime<Utc>,
    parent_session: Option<String>,
    lines: Vec<String>,
    entry_counter: usize,
    last_entry_id: Option<String>,
}

impl SessionFixture {
    pub fn new(cwd: &str) -> Self {
        Self {
            cwd: cwd.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            base_time: Utc::now(),
            parent_session: None,
            lines: Vec::new(),
            entry_counter: 0,
            last_entry_id: None,
        }
    }

    /// Shift the whole session into the past (idle-detection scenarios).
    pub fn starting_minutes_ago(mut self, minutes: i64) -> Self {
        self.base_time = Utc::now() - Duration::minutes(minutes);
        self
    }

    pub fn forked_from(mut self, parent_session_id: &str) -> Self {
        self.parent_session = Some(parent_session_id.to_string());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn next_ts(&self) -> String {
        (self.base_time + Duration::seconds(self.entry_counter as i64 + 1)).to_rfc3339()
    }

    fn push_entry(&mut self, line: String, id: String) {
        self.lines.push(line);
        self.entry_counter += 1;
        self.last_entry_id = Some(id);
    }

    pub fn user(mut self, text: &str) -> Self {
        let id = format!("e{}", self.entry_counter + 1);
        let line = format!(
            r#"{{"type":"message","id":"{}","parentId":{},"timestamp":"{}","role":"user","content":{}}}"#,
            id,
            parent_json(&self.last_entry_id),
            self.next_ts(),
            serde_json::to_string(text).unwrap_or_default(),
        );
        self.push_entry(line, id);
        self
    }

    pub fn assistant(mut self, text: &str) -> Self {
        let id = format!("e{}", self.entry_counter + 1);
        let line = format!(
            r#"{{"type":"message","id":"{}","parentId":{},"timestamp":"{}","role":"assistant","content":{}}}"#,
            id,
            parent_json(&self.last_entry_id),
            self.next_ts(),
            serde_json::to_string(text).unwrap_or_default(),
        );
        self.push_entry(line, id);
        self
    }

    pub fn compaction(mut self, summary: &str) -> Self {
        let id = format!("c{}", self.entry_counter + 1);
        let line = format!(
            r#"{{"type":"compaction","id":"{}","parentId":{},"timestamp":"{}","summary":{}}}"#,
            id,
            parent_json(&self.last_entry_id),
            self.next_ts(),
            serde_json::to_string(summary).unwrap_or_default(),
        );
        self.push_entry(line, id);
        self
    }

    /// A conversation that clears the extractor's minimum-size gate with
    /// plenty of margin.
    pub fn substantial_conversation(self) -> Self {
        let filler = "implemented the requested feature end to end, wired the new module \
                      through the public interface, migrated the two existing call sites onto \
                      the new signature, and updated every affected test to cover both the \
                      happy path and the error path that the review called out last week";
        self.user(&format!("please do the following work: {}", filler))
            .assistant(&format!("done: {}", filler))
            .user("looks good, thanks for the thorough pass over the edge cases here")
    }

    /// Write under `<sessions_root>/--<encoded_cwd>--/` and return the path.
    pub fn write_to(&self, sessions_root: &Path) -> Result<PathBuf> {
        let dir = sessions_root.join(encode_cwd(&self.cwd));
        std::fs::create_dir_all(&dir)?;
        let file_name = format!(
            "{}_{}.jsonl",
            self.base_time.format("%Y%m%dT%H%M%S"),
            self.session_id
        );
        let path = dir.join(file_name);

        let mut content = String::new();
        let parent = match &self.parent_session {
            Some(parent) => format!(r#","parentSession":"{}""#, parent),
            None => String::new(),
        };
        let _ = writeln!(
            content,
            r#"{{"type":"session","version":1,"id":"{}","timestamp":"{}","cwd":"{}"{}}}"#,
            self.session_id,
            self.base_time.to_rfc3339(),
            self.cwd,
            parent,
        );
        for line in &self.lines {
            let _ = writeln!(content, "{}", line);
        }

        std::fs::write(&path, content)?;
        Ok(path)
    }
}

fn parent_json(parent: &Option<String>) -> String {
    match parent {
        Some(id) => format!(r#""{}""#, id),
        None => "null".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_parses_with_the_session_reader() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = SessionFixture::new("/home/u/proj")
            .substantial_conversation()
            .compaction("first phase")
            .user("continue")
            .write_to(tmp.path())
            .unwrap();

        let session = engram_session::read_session(&path).unwrap();
        assert_eq!(session.header.cwd, "/home/u/proj");
        assert_eq!(session.entries.len(), 5);
        assert_eq!(session.skipped_lines, 0);

        let segments = engram_session::split_segments(&session);
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn fixture_path_matches_discovery_convention() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = SessionFixture::new("/home/u/proj")
            .user("hi")
            .write_to(tmp.path())
            .unwrap();

        assert!(engram_session::is_session_file(&path));
        assert_eq!(engram_session::discover_session_files(tmp.path()), vec![path]);
    }
}
