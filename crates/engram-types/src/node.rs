use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Final outcome of the analyzed work segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failed,
    Abandoned,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Failed => "failed",
            Outcome::Abandoned => "abandoned",
        }
    }
}

/// What kind of work the segment contained
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    #[serde(rename = "type")]
    pub node_type: String,
    pub project: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub frameworks: Vec<String>,
    #[serde(default)]
    pub had_clear_goal: bool,
    #[serde(default)]
    pub is_new_project: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub summary: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub key_decisions: Vec<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub errors_seen: Vec<String>,
}

/// Lessons bucketed by the level they apply to.
///
/// The analyzer emits free-form strings; the daemon never interprets them
/// beyond aggregation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lessons {
    #[serde(default)]
    pub project: Vec<String>,
    #[serde(default)]
    pub task: Vec<String>,
    #[serde(default)]
    pub user: Vec<String>,
    #[serde(default)]
    pub model: Vec<String>,
    #[serde(default)]
    pub tool: Vec<String>,
    #[serde(default)]
    pub skill: Vec<String>,
    #[serde(default)]
    pub subagent: Vec<String>,
}

impl Lessons {
    pub fn is_empty(&self) -> bool {
        self.project.is_empty()
            && self.task.is_empty()
            && self.user.is_empty()
            && self.model.is_empty()
            && self.tool.is_empty()
            && self.skill.is_empty()
            && self.subagent.is_empty()
    }

    /// All lessons flattened with their bucket name, for FTS documents and
    /// pattern aggregation.
    pub fn flattened(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        for (bucket, items) in [
            ("project", &self.project),
            ("task", &self.task),
            ("user", &self.user),
            ("model", &self.model),
            ("tool", &self.tool),
            ("skill", &self.skill),
            ("subagent", &self.subagent),
        ] {
            for item in items {
                out.push((bucket, item.as_str()));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Semantic {
    #[serde(default)]
    pub tags: Vec<String>,
    /// Embedding vector; may lag behind the node (backfill fills it in)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Vectors are only comparable within the same model tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

/// Friction signal detected in the segment (abandoned-restart, tool-loop,
/// rephrasing-cascade, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrictionSignal {
    pub signal: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

/// Daemon-stamped execution metadata, distinct from analyzer output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonMeta {
    #[serde(default)]
    pub skills_available: Vec<String>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salvage_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_input: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_output: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    pub timestamp: DateTime<Utc>,
    pub source_session: String,
    pub source_boundary: String,
    pub prompt_version: String,
    #[serde(default)]
    pub daemon_meta: DaemonMeta,
}

/// Canonical analysis result for one segment.
///
/// Maps 1:1 to the per-node JSON file; the relational index mirrors the
/// filterable subset of these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    /// Monotonic per id; bumped on every committed save
    pub version: u32,
    pub classification: Classification,
    pub content: Content,
    #[serde(default)]
    pub lessons: Lessons,
    #[serde(default)]
    pub semantic: Semantic,
    pub metadata: NodeMetadata,
    #[serde(default)]
    pub friction: Vec<FrictionSignal>,
}

impl Node {
    /// The document indexed for full-text search: summary, decisions,
    /// lessons, and tags flattened into one text body.
    pub fn search_document(&self) -> String {
        let mut body = String::with_capacity(256);
        body.push_str(&self.content.summary);
        for decision in &self.content.key_decisions {
            body.push('\n');
            body.push_str(decision);
        }
        for (_, lesson) in self.lessons.flattened() {
            body.push('\n');
            body.push_str(lesson);
        }
        for tag in &self.semantic.tags {
            body.push('\n');
            body.push_str(tag);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> Node {
        Node {
            id: NodeId::derive("/tmp/s.jsonl", NodeId::START_BOUNDARY),
            version: 1,
            classification: Classification {
                node_type: "bugfix".to_string(),
                project: "/home/u/proj".to_string(),
                language: Some("rust".to_string()),
                frameworks: vec![],
                had_clear_goal: true,
                is_new_project: false,
            },
            content: Content {
                summary: "Fixed a race in the watcher".to_string(),
                outcome: Outcome::Success,
                key_decisions: vec!["kept the poll fallback".to_string()],
                files_touched: vec!["src/watcher.rs".to_string()],
                tools_used: vec!["Edit".to_string()],
                errors_seen: vec![],
            },
            lessons: Lessons {
                tool: vec!["notify drops events on overflow".to_string()],
                ..Default::default()
            },
            semantic: Semantic {
                tags: vec!["watcher".to_string()],
                embedding: None,
                embedding_model: None,
            },
            metadata: NodeMetadata {
                timestamp: Utc::now(),
                source_session: "/tmp/s.jsonl".to_string(),
                source_boundary: NodeId::START_BOUNDARY.to_string(),
                prompt_version: "v1-deadbeef".to_string(),
                daemon_meta: DaemonMeta::default(),
            },
            friction: vec![],
        }
    }

    #[test]
    fn node_round_trips_through_json() {
        let node = sample_node();
        let json = serde_json::to_string(&node).unwrap();
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, node.id);
        assert_eq!(back.content.summary, node.content.summary);
        assert_eq!(back.lessons.tool.len(), 1);
    }

    #[test]
    fn node_json_uses_camel_case_wire_names() {
        let json = serde_json::to_value(sample_node()).unwrap();
        assert!(json["classification"]["hadClearGoal"].is_boolean());
        assert!(json["content"]["filesTouched"].is_array());
        assert!(json["metadata"]["daemonMeta"].is_object());
    }

    #[test]
    fn search_document_contains_all_layers() {
        let node = sample_node();
        let doc = node.search_document();
        assert!(doc.contains("Fixed a race"));
        assert!(doc.contains("poll fallback"));
        assert!(doc.contains("notify drops events"));
        assert!(doc.contains("watcher"));
    }
}
