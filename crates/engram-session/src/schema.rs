use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire records as the coding agent writes them, one JSON object per line.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub(crate) enum SessionRecord {
    Session(HeaderRecord),
    Message(MessageRecord),
    Compaction(MarkerRecord),
    BranchSummary(MarkerRecord),
    ModelChange(MetaRecord),
    ThinkingLevelChange(MetaRecord),
    Custom(MetaRecord),
    CustomMessage(MetaRecord),
    Label(MetaRecord),
    SessionInfo(MetaRecord),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HeaderRecord {
    pub version: u32,
    pub id: String,
    pub timestamp: String,
    pub cwd: String,
    #[serde(default)]
    pub parent_session: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: String,
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
}

/// Boundary-bearing records (compaction, branch summary)
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MarkerRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: String,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Non-boundary metadata records; payload is carried but not interpreted
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MetaRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: String,
    #[serde(flatten)]
    pub rest: Value,
}

/// Parsed session header
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHeader {
    pub version: u32,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub cwd: String,
    /// Set when this session forked off another (fork edge hint)
    pub parent_session: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

impl Role {
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "toolResult" => Some(Role::ToolResult),
            _ => None,
        }
    }
}

/// Normalized entry payload. Only the variants the extractor reasons about
/// carry data; metadata records collapse to markers.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryPayload {
    Message { role: Role, text: String },
    Compaction { summary: Option<String> },
    BranchSummary { summary: Option<String> },
    Meta,
}

impl EntryPayload {
    /// Boundary entries delimit analysis segments
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            EntryPayload::Compaction { .. } | EntryPayload::BranchSummary { .. }
        )
    }
}

/// One normalized record from a session file's linear history
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: EntryPayload,
}

impl Entry {
    /// Rough character-per-token heuristic used by the minimum-size gate
    pub fn estimated_tokens(&self) -> usize {
        match &self.payload {
            EntryPayload::Message { text, .. } => text.chars().count() / 4,
            EntryPayload::Compaction { summary } | EntryPayload::BranchSummary { summary } => {
                summary.as_ref().map(|s| s.chars().count() / 4).unwrap_or(0)
            }
            EntryPayload::Meta => 0,
        }
    }
}

/// Flatten message content into plain text. The producer writes either a
/// bare string or an array of content blocks with a `text` field.
pub(crate) fn flatten_content(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => {
            let mut out = String::new();
            for block in blocks {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text);
                } else if let Some(text) = block.as_str() {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text);
                }
            }
            out
        }
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_record_types_deserialize_to_unknown() {
        let record: SessionRecord =
            serde_json::from_str(r#"{"type":"hologram","id":"x","timestamp":"t"}"#).unwrap();
        assert!(matches!(record, SessionRecord::Unknown));
    }

    #[test]
    fn message_record_parses() {
        let record: SessionRecord = serde_json::from_str(
            r#"{"type":"message","id":"e1","parentId":null,"timestamp":"2026-01-01T00:00:00Z","role":"user","content":"hello"}"#,
        )
        .unwrap();
        match record {
            SessionRecord::Message(m) => {
                assert_eq!(m.role, "user");
                assert_eq!(flatten_content(m.content.as_ref()), "hello");
            }
            _ => panic!("Expected message record"),
        }
    }

    #[test]
    fn content_blocks_flatten_in_order() {
        let content = serde_json::json!([
            {"type": "text", "text": "first"},
            {"type": "image", "source": {}},
            {"type": "text", "text": "second"}
        ]);
        assert_eq!(flatten_content(Some(&content)), "first\nsecond");
    }

    #[test]
    fn boundary_detection() {
        assert!(EntryPayload::Compaction { summary: None }.is_boundary());
        assert!(EntryPayload::BranchSummary { summary: None }.is_boundary());
        assert!(!EntryPayload::Meta.is_boundary());
    }
}
