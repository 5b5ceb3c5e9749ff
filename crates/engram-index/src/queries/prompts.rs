use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use engram_types::{PromptVersion, version_label};

use crate::db::{Database, format_ts, parse_ts};
use crate::Result;

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<PromptVersion> {
    let created: String = row.get("created_at")?;
    Ok(PromptVersion {
        label: row.get("label")?,
        sequence: row.get("seq")?,
        content_hash: row.get("content_hash")?,
        archived_path: row.get("archived_path")?,
        created_at: parse_ts(&created).unwrap_or_else(Utc::now),
    })
}

impl Database {
    /// Look up a version by its normalized content hash, or mint the next
    /// sequential one. Identical normalized content always resolves to the
    /// same label.
    pub fn resolve_prompt_version(
        &mut self,
        content_hash: &str,
        archived_path: Option<&str>,
    ) -> Result<PromptVersion> {
        if let Some(existing) = self.prompt_version_by_hash(content_hash)? {
            return Ok(existing);
        }

        let tx = self.conn.transaction()?;
        let next_seq: u32 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM prompt_versions",
            [],
            |row| row.get(0),
        )?;
        let label = version_label(next_seq, content_hash);
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO prompt_versions (label, seq, content_hash, archived_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                label,
                next_seq,
                content_hash,
                archived_path,
                format_ts(created_at)
            ],
        )?;
        tx.commit()?;

        Ok(PromptVersion {
            label,
            sequence: next_seq,
            content_hash: content_hash.to_string(),
            archived_path: archived_path.map(|p| p.to_string()),
            created_at,
        })
    }

    /// Record where a version's prompt text was archived. The archive file
    /// is written after the row exists because its name carries the label.
    pub fn set_prompt_archived_path(&mut self, label: &str, path: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE prompt_versions SET archived_path = ?1 WHERE label = ?2",
            params![path, label],
        )?;
        Ok(())
    }

    pub fn prompt_version_by_hash(&self, content_hash: &str) -> Result<Option<PromptVersion>> {
        let version = self
            .conn
            .query_row(
                "SELECT label, seq, content_hash, archived_path, created_at
                 FROM prompt_versions WHERE content_hash = ?1",
                params![content_hash],
                version_from_row,
            )
            .optional()?;
        Ok(version)
    }

    pub fn list_prompt_versions(&self) -> Result<Vec<PromptVersion>> {
        let mut stmt = self.conn.prepare(
            "SELECT label, seq, content_hash, archived_path, created_at
             FROM prompt_versions ORDER BY seq DESC",
        )?;
        let versions = stmt
            .query_map([], version_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }
}
