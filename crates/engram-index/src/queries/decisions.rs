use chrono::Utc;
use rusqlite::{Row, params};

use engram_types::{Decision, UserFeedback};

use crate::db::{Database, format_ts, parse_ts};
use crate::{Error, Result};

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<Decision> {
    let timestamp: String = row.get("timestamp")?;
    let feedback: Option<String> = row.get("user_feedback")?;
    Ok(Decision {
        id: row.get("id")?,
        timestamp: parse_ts(&timestamp).unwrap_or_else(Utc::now),
        decision: row.get("decision")?,
        reasoning: row.get("reasoning")?,
        source_project: row.get("source_project")?,
        user_feedback: feedback.and_then(|f| UserFeedback::parse(&f)),
    })
}

impl Database {
    pub fn record_decision(
        &mut self,
        decision: &str,
        reasoning: &str,
        source_project: Option<&str>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO decisions (timestamp, decision, reasoning, source_project)
             VALUES (?1, ?2, ?3, ?4)",
            params![format_ts(Utc::now()), decision, reasoning, source_project],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_decisions(&self, limit: usize) -> Result<Vec<Decision>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, timestamp, decision, reasoning, source_project, user_feedback
             FROM decisions ORDER BY timestamp DESC, id DESC LIMIT {}",
            limit.max(1)
        ))?;
        let decisions = stmt
            .query_map([], decision_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(decisions)
    }

    pub fn set_decision_feedback(&mut self, id: i64, feedback: Option<UserFeedback>) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE decisions SET user_feedback = ?1 WHERE id = ?2",
            params![feedback.map(|f| f.as_str()), id],
        )?;
        if updated == 0 {
            return Err(Error::Query(format!("decision not found: {}", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_audit_trail() {
        let mut db = Database::open_in_memory().unwrap();
        let id = db
            .record_decision(
                "skipped segment below size gate",
                "2 entries, 40 estimated tokens",
                Some("/home/u/proj"),
            )
            .unwrap();

        db.set_decision_feedback(id, Some(UserFeedback::Good)).unwrap();

        let decisions = db.list_decisions(10).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].user_feedback, Some(UserFeedback::Good));

        db.set_decision_feedback(id, None).unwrap();
        assert_eq!(db.list_decisions(10).unwrap()[0].user_feedback, None);
    }

    #[test]
    fn unknown_decision_is_an_error() {
        let mut db = Database::open_in_memory().unwrap();
        assert!(db.set_decision_feedback(99, Some(UserFeedback::Bad)).is_err());
    }
}
