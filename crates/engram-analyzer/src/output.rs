use serde::Deserialize;
use serde_json::Value;

use engram_types::{Classification, Content, FrictionSignal, Lessons, Outcome, Semantic};

/// The analyzer's output document, before the daemon stamps identity and
/// metadata onto it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerOutput {
    pub classification: Classification,
    pub content: Content,
    #[serde(default)]
    pub lessons: Lessons,
    #[serde(default)]
    pub semantic: Semantic,
    #[serde(default)]
    pub friction: Vec<FrictionSignal>,
}

/// Validation result. Salvage keeps whatever sections individually parse
/// when the full document does not; a salvaged node is flagged for review.
#[derive(Debug)]
pub enum ValidatedOutput {
    Complete(AnalyzerOutput),
    Salvaged { output: AnalyzerOutput, reason: String },
    Invalid(String),
}

/// Parse and validate analyzer stdout against the node output schema.
pub fn validate_output(stdout: &str) -> ValidatedOutput {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return ValidatedOutput::Invalid("empty stdout".to_string());
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(e) => {
            // Agents sometimes prefix logging before the JSON document;
            // retry from the first brace.
            match trimmed.find('{') {
                Some(idx) => match serde_json::from_str(&trimmed[idx..]) {
                    Ok(value) => value,
                    Err(_) => {
                        return ValidatedOutput::Invalid(format!("stdout is not JSON: {}", e));
                    }
                },
                None => return ValidatedOutput::Invalid(format!("stdout is not JSON: {}", e)),
            }
        }
    };

    match serde_json::from_value::<AnalyzerOutput>(value.clone()) {
        Ok(output) => {
            if output.content.summary.trim().is_empty() {
                ValidatedOutput::Salvaged {
                    reason: "summary is empty".to_string(),
                    output,
                }
            } else {
                ValidatedOutput::Complete(output)
            }
        }
        Err(full_err) => salvage(&value, full_err.to_string()),
    }
}

fn salvage(value: &Value, reason: String) -> ValidatedOutput {
    let classification = value
        .get("classification")
        .and_then(|c| serde_json::from_value::<Classification>(c.clone()).ok());
    let content = value
        .get("content")
        .and_then(|c| serde_json::from_value::<Content>(c.clone()).ok())
        .or_else(|| {
            // Minimal salvage: a bare summary string
            let summary = value
                .get("content")
                .and_then(|c| c.get("summary"))
                .or_else(|| value.get("summary"))
                .and_then(|s| s.as_str())?;
            Some(Content {
                summary: summary.to_string(),
                outcome: Outcome::Partial,
                key_decisions: Vec::new(),
                files_touched: Vec::new(),
                tools_used: Vec::new(),
                errors_seen: Vec::new(),
            })
        });

    let Some(content) = content else {
        return ValidatedOutput::Invalid(format!("nothing salvageable: {}", reason));
    };
    if content.summary.trim().is_empty() && classification.is_none() {
        return ValidatedOutput::Invalid(format!("nothing salvageable: {}", reason));
    }

    let lessons = value
        .get("lessons")
        .and_then(|l| serde_json::from_value::<Lessons>(l.clone()).ok())
        .unwrap_or_default();
    let semantic = value
        .get("semantic")
        .and_then(|s| serde_json::from_value::<Semantic>(s.clone()).ok())
        .unwrap_or_default();
    let friction = value
        .get("friction")
        .and_then(|f| serde_json::from_value::<Vec<FrictionSignal>>(f.clone()).ok())
        .unwrap_or_default();

    ValidatedOutput::Salvaged {
        output: AnalyzerOutput {
            classification: classification.unwrap_or_default(),
            content,
            lessons,
            semantic,
            friction,
        },
        reason,
    }
}
