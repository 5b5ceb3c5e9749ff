use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Synchronous answer from a query-time invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnswer {
    pub answer: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Parse query stdout. Query invocations have no salvage path - a bad
/// answer is simply an error surfaced to the caller.
pub fn parse_query_answer(stdout: &str) -> Result<QueryAnswer> {
    let trimmed = stdout.trim();
    let start = trimmed
        .find('{')
        .ok_or_else(|| Error::InvalidOutput("no JSON in query output".to_string()))?;
    serde_json::from_str(&trimmed[start..])
        .map_err(|e| Error::InvalidOutput(format!("query output: {}", e)))
}
