use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Quirk,
    ToolError,
    Failure,
    Win,
    Lesson,
}

impl InsightType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::Quirk => "quirk",
            InsightType::ToolError => "tool_error",
            InsightType::Failure => "failure",
            InsightType::Win => "win",
            InsightType::Lesson => "lesson",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quirk" => Some(InsightType::Quirk),
            "tool_error" => Some(InsightType::ToolError),
            "failure" => Some(InsightType::Failure),
            "win" => Some(InsightType::Win),
            "lesson" => Some(InsightType::Lesson),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivenessEntry {
    pub recorded_at: DateTime<Utc>,
    pub score: f64,
}

/// Aggregated pattern across many nodes.
///
/// `prompt_included` controls injection into analyzer skill context only -
/// never into unrelated user sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: i64,
    #[serde(rename = "type")]
    pub insight_type: InsightType,
    pub model: Option<String>,
    pub tool: Option<String>,
    pub pattern: String,
    pub frequency: u32,
    pub confidence: f64,
    pub severity: f64,
    pub examples: Vec<NodeId>,
    pub prompt_text: Option<String>,
    pub prompt_included: bool,
    #[serde(default)]
    pub effectiveness_history: Vec<EffectivenessEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserFeedback {
    Good,
    Bad,
}

impl UserFeedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserFeedback::Good => "good",
            UserFeedback::Bad => "bad",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "good" => Some(UserFeedback::Good),
            "bad" => Some(UserFeedback::Bad),
            _ => None,
        }
    }
}

/// Audit-trail record of an autonomous daemon decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub decision: String,
    pub reasoning: String,
    pub source_project: Option<String>,
    pub user_feedback: Option<UserFeedback>,
}
