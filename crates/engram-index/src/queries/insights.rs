use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use engram_types::{EffectivenessEntry, Insight, InsightType, NodeId};

use crate::db::{Database, format_ts, parse_ts};
use crate::{Error, Result};

fn insight_from_row(row: &Row<'_>) -> rusqlite::Result<(Insight, String)> {
    let insight_type: String = row.get("insight_type")?;
    let examples_json: String = row.get("examples")?;
    Ok((
        Insight {
            id: row.get("id")?,
            insight_type: InsightType::parse(&insight_type).unwrap_or(InsightType::Lesson),
            model: row.get("model")?,
            tool: row.get("tool")?,
            pattern: row.get("pattern")?,
            frequency: row.get("frequency")?,
            confidence: row.get("confidence")?,
            severity: row.get("severity")?,
            examples: Vec::new(),
            prompt_text: row.get("prompt_text")?,
            prompt_included: row.get::<_, i64>("prompt_included")? != 0,
            effectiveness_history: Vec::new(),
        },
        examples_json,
    ))
}

fn parse_examples(json: &str) -> Vec<NodeId> {
    serde_json::from_str::<Vec<String>>(json)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|s| NodeId::from_stored(s).ok())
        .collect()
}

const INSIGHT_COLUMNS: &str = "id, insight_type, model, tool, pattern, frequency, confidence, \
     severity, examples, prompt_text, prompt_included, updated_at";

impl Database {
    /// Record one observation of a pattern. First observation inserts the
    /// row; repeats bump frequency, fold in confidence/severity and append
    /// the example node.
    pub fn observe_insight(
        &mut self,
        insight_type: InsightType,
        model: Option<&str>,
        tool: Option<&str>,
        pattern: &str,
        example: &NodeId,
        confidence: f64,
        severity: f64,
    ) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let now = format_ts(Utc::now());

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, examples FROM insights
                 WHERE insight_type = ?1 AND ifnull(model, '') = ifnull(?2, '')
                   AND ifnull(tool, '') = ifnull(?3, '') AND pattern = ?4",
                params![insight_type.as_str(), model, tool, pattern],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let id = match existing {
            Some((id, examples_json)) => {
                let mut examples: Vec<String> =
                    serde_json::from_str(&examples_json).unwrap_or_default();
                if !examples.iter().any(|e| e == example.as_str()) {
                    examples.push(example.as_str().to_string());
                }
                let examples_json = serde_json::to_string(&examples)
                    .map_err(|e| Error::Query(e.to_string()))?;

                tx.execute(
                    "UPDATE insights SET frequency = frequency + 1,
                         confidence = MAX(confidence, ?1), severity = MAX(severity, ?2),
                         examples = ?3, updated_at = ?4
                     WHERE id = ?5",
                    params![confidence, severity, examples_json, now, id],
                )?;
                id
            }
            None => {
                let examples_json = serde_json::to_string(&vec![example.as_str()])
                    .map_err(|e| Error::Query(e.to_string()))?;
                tx.execute(
                    "INSERT INTO insights (insight_type, model, tool, pattern, frequency,
                                           confidence, severity, examples, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8)",
                    params![
                        insight_type.as_str(),
                        model,
                        tool,
                        pattern,
                        confidence,
                        severity,
                        examples_json,
                        now
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.commit()?;
        Ok(id)
    }

    pub fn get_insight(&self, id: i64) -> Result<Option<Insight>> {
        let found = self
            .conn
            .query_row(
                &format!("SELECT {INSIGHT_COLUMNS} FROM insights WHERE id = ?1"),
                params![id],
                insight_from_row,
            )
            .optional()?;

        let Some((mut insight, examples_json)) = found else {
            return Ok(None);
        };
        insight.examples = parse_examples(&examples_json);
        insight.effectiveness_history = self.effectiveness_history(id)?;
        Ok(Some(insight))
    }

    pub fn list_insights(&self, prompt_included_only: bool) -> Result<Vec<Insight>> {
        let sql = if prompt_included_only {
            format!(
                "SELECT {INSIGHT_COLUMNS} FROM insights WHERE prompt_included = 1
                 ORDER BY severity DESC, frequency DESC"
            )
        } else {
            format!(
                "SELECT {INSIGHT_COLUMNS} FROM insights ORDER BY severity DESC, frequency DESC"
            )
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], insight_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(mut insight, examples_json)| {
                insight.examples = parse_examples(&examples_json);
                insight
            })
            .collect())
    }

    /// Toggle injection of this insight into analyzer skill context.
    pub fn set_insight_prompt_included(
        &mut self,
        id: i64,
        included: bool,
        prompt_text: Option<&str>,
    ) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE insights SET prompt_included = ?1,
                 prompt_text = COALESCE(?2, prompt_text), updated_at = ?3
             WHERE id = ?4",
            params![included as i64, prompt_text, format_ts(Utc::now()), id],
        )?;
        if updated == 0 {
            return Err(Error::Query(format!("insight not found: {}", id)));
        }
        Ok(())
    }

    pub fn record_insight_effectiveness(&mut self, id: i64, score: f64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO insight_effectiveness (insight_id, recorded_at, score)
             VALUES (?1, ?2, ?3)",
            params![id, format_ts(Utc::now()), score],
        )?;
        Ok(())
    }

    pub fn effectiveness_history(&self, id: i64) -> Result<Vec<EffectivenessEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT recorded_at, score FROM insight_effectiveness
             WHERE insight_id = ?1 ORDER BY recorded_at",
        )?;
        let entries = stmt
            .query_map(params![id], |row| {
                let recorded: String = row.get(0)?;
                Ok((recorded, row.get::<_, f64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries
            .into_iter()
            .filter_map(|(recorded, score)| {
                Some(EffectivenessEntry {
                    recorded_at: parse_ts(&recorded)?,
                    score,
                })
            })
            .collect())
    }

    /// Replace the cluster set wholesale; clustering is a full recompute.
    pub fn replace_clusters(&mut self, clusters: &[(String, Vec<NodeId>)]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM clusters", [])?;
        let now = format_ts(Utc::now());
        for (label, members) in clusters {
            let ids: Vec<&str> = members.iter().map(|id| id.as_str()).collect();
            let ids_json =
                serde_json::to_string(&ids).map_err(|e| Error::Query(e.to_string()))?;
            tx.execute(
                "INSERT INTO clusters (label, node_ids, created_at) VALUES (?1, ?2, ?3)",
                params![label, ids_json, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_clusters(&self) -> Result<Vec<(String, Vec<NodeId>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label, node_ids FROM clusters ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(label, ids_json)| (label, parse_examples(&ids_json)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_observation_accumulates() {
        let mut db = Database::open_in_memory().unwrap();
        let a = NodeId::derive("/s/a.jsonl", "start");
        let b = NodeId::derive("/s/b.jsonl", "start");

        let id = db
            .observe_insight(
                InsightType::ToolError,
                None,
                Some("Bash"),
                "sandbox denies network access",
                &a,
                0.4,
                0.6,
            )
            .unwrap();
        let same = db
            .observe_insight(
                InsightType::ToolError,
                None,
                Some("Bash"),
                "sandbox denies network access",
                &b,
                0.7,
                0.5,
            )
            .unwrap();
        assert_eq!(id, same);

        let insight = db.get_insight(id).unwrap().unwrap();
        assert_eq!(insight.frequency, 2);
        assert_eq!(insight.confidence, 0.7);
        assert_eq!(insight.severity, 0.6);
        assert_eq!(insight.examples.len(), 2);
    }

    #[test]
    fn prompt_inclusion_toggle_and_effectiveness() {
        let mut db = Database::open_in_memory().unwrap();
        let a = NodeId::derive("/s/a.jsonl", "start");
        let id = db
            .observe_insight(InsightType::Quirk, Some("sonnet"), None, "over-edits tests", &a, 0.5, 0.3)
            .unwrap();

        db.set_insight_prompt_included(id, true, Some("Avoid editing tests blindly"))
            .unwrap();
        db.record_insight_effectiveness(id, 0.8).unwrap();

        let included = db.list_insights(true).unwrap();
        assert_eq!(included.len(), 1);

        let insight = db.get_insight(id).unwrap().unwrap();
        assert!(insight.prompt_included);
        assert_eq!(insight.effectiveness_history.len(), 1);
    }
}
