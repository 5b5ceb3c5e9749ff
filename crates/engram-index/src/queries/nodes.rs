use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use engram_types::{Node, NodeId};

use crate::db::{Database, format_ts};
use crate::{Error, Result};

/// Filterable mirror of a node's searchable attributes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeRow {
    pub id: String,
    pub version: u32,
    pub node_type: String,
    pub project: String,
    pub language: Option<String>,
    pub outcome: String,
    pub summary: String,
    pub timestamp: String,
    pub session_file: String,
    pub segment_boundary: String,
    pub prompt_version: String,
    pub needs_review: bool,
    pub json_path: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub project: Option<String>,
    pub outcome: Option<String>,
    pub node_type: Option<String>,
    pub needs_review: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

pub(crate) fn node_row_from_row(row: &Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        id: row.get("id")?,
        version: row.get("version")?,
        node_type: row.get("node_type")?,
        project: row.get("project")?,
        language: row.get("language")?,
        outcome: row.get("outcome")?,
        summary: row.get("summary")?,
        timestamp: row.get("timestamp")?,
        session_file: row.get("session_file")?,
        segment_boundary: row.get("segment_boundary")?,
        prompt_version: row.get("prompt_version")?,
        needs_review: row.get::<_, i64>("needs_review")? != 0,
        json_path: row.get("json_path")?,
        updated_at: row.get("updated_at")?,
    })
}

pub(crate) const NODE_COLUMNS: &str = "id, version, node_type, project, language, outcome, summary, \
     timestamp, session_file, segment_boundary, prompt_version, needs_review, json_path, updated_at";

impl Database {
    /// Version the next committed save of this id will carry.
    pub fn next_node_version(&self, id: &NodeId) -> Result<u32> {
        let current: Option<u32> = self
            .conn
            .query_row(
                "SELECT version FROM nodes WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(current.map(|v| v + 1).unwrap_or(1))
    }

    /// Commit a node into the index: upsert the relational row and replace
    /// the FTS document in the same transaction. The caller has already
    /// durably written the canonical JSON file at `json_path`.
    pub fn commit_node(&mut self, node: &Node, json_path: &str) -> Result<()> {
        let meta = &node.metadata;
        let body = node.search_document();
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO nodes (id, version, node_type, project, language, outcome, summary,
                                timestamp, session_file, segment_boundary, prompt_version,
                                needs_review, tokens_input, tokens_output, cost_usd,
                                json_path, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(id) DO UPDATE SET
                 version = ?2, node_type = ?3, project = ?4, language = ?5, outcome = ?6,
                 summary = ?7, timestamp = ?8, session_file = ?9, segment_boundary = ?10,
                 prompt_version = ?11, needs_review = ?12, tokens_input = ?13,
                 tokens_output = ?14, cost_usd = ?15, json_path = ?16, updated_at = ?17",
            params![
                node.id.as_str(),
                node.version,
                node.classification.node_type,
                node.classification.project,
                node.classification.language,
                node.content.outcome.as_str(),
                node.content.summary,
                format_ts(meta.timestamp),
                meta.source_session,
                meta.source_boundary,
                meta.prompt_version,
                meta.daemon_meta.needs_review as i64,
                meta.daemon_meta.tokens_input.map(|t| t as i64),
                meta.daemon_meta.tokens_output.map(|t| t as i64),
                meta.daemon_meta.cost_usd,
                json_path,
                format_ts(Utc::now()),
            ],
        )?;

        // Application-managed FTS: stale row out, fresh document in
        tx.execute(
            "DELETE FROM nodes_fts WHERE id = ?1",
            params![node.id.as_str()],
        )?;
        tx.execute(
            "INSERT INTO nodes_fts (id, body) VALUES (?1, ?2)",
            params![node.id.as_str(), body],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_node_row(&self, id: &NodeId) -> Result<Option<NodeRow>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                params![id.as_str()],
                node_row_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn node_version(&self, id: &NodeId) -> Result<Option<u32>> {
        let version = self
            .conn
            .query_row(
                "SELECT version FROM nodes WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    pub fn list_node_rows(&self, filter: &NodeFilter) -> Result<Vec<NodeRow>> {
        let mut sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE 1=1");
        let mut args: Vec<String> = Vec::new();

        if let Some(project) = &filter.project {
            sql.push_str(" AND project = ?");
            args.push(project.clone());
        }
        if let Some(outcome) = &filter.outcome {
            sql.push_str(" AND outcome = ?");
            args.push(outcome.clone());
        }
        if let Some(node_type) = &filter.node_type {
            sql.push_str(" AND node_type = ?");
            args.push(node_type.clone());
        }
        if let Some(needs_review) = filter.needs_review {
            sql.push_str(if needs_review {
                " AND needs_review = 1"
            } else {
                " AND needs_review = 0"
            });
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND timestamp >= ?");
            args.push(format_ts(since));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND timestamp <= ?");
            args.push(format_ts(until));
        }

        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        sql.push_str(&format!(
            " ORDER BY timestamp DESC LIMIT {} OFFSET {}",
            limit, filter.offset
        ));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), node_row_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Nodes eligible for reanalysis: latest committed prompt version differs
    /// from the current one.
    pub fn nodes_with_stale_prompt(&self, current_version: &str, limit: usize) -> Result<Vec<NodeRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE prompt_version != ?1
             ORDER BY timestamp DESC LIMIT {limit}"
        ))?;
        let rows = stmt
            .query_map(params![current_version], node_row_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Nodes from the same project within a time window, excluding one id.
    /// Used by temporal connection discovery.
    pub fn nodes_in_project_window(
        &self,
        project: &str,
        exclude: &NodeId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<NodeRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE project = ?1 AND id != ?2 AND timestamp >= ?3 AND timestamp <= ?4"
        ))?;
        let rows = stmt
            .query_map(
                params![project, exclude.as_str(), format_ts(since), format_ts(until)],
                node_row_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Session-file pointers for nodes whose source session contains the
    /// given uuid fragment. Used to resolve fork hints.
    pub fn nodes_for_session_uuid(&self, session_uuid: &str) -> Result<Vec<NodeRow>> {
        let pattern = format!("%{}%", session_uuid);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE session_file LIKE ?1"
        ))?;
        let rows = stmt
            .query_map(params![pattern], node_row_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_nodes(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Distinct projects with node counts, newest first.
    pub fn project_summary(&self) -> Result<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT project, COUNT(*) FROM nodes GROUP BY project ORDER BY MAX(timestamp) DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let count: i64 = row.get(1)?;
                Ok((row.get(0)?, count as u64))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Distinct files_touched pointer check used by overlap discovery: all
    /// rows except `exclude` whose JSON is known to the caller. The index
    /// does not store file lists; overlap runs over the canonical JSON.
    pub fn all_node_ids_except(&self, exclude: &NodeId) -> Result<Vec<NodeRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE id != ?1"
        ))?;
        let rows = stmt
            .query_map(params![exclude.as_str()], node_row_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove a node and its satellites (used by tests and retention).
    pub fn delete_node(&mut self, id: &NodeId) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM nodes_fts WHERE id = ?1", params![id.as_str()])?;
        tx.execute("DELETE FROM embeddings WHERE node_id = ?1", params![id.as_str()])?;
        tx.execute(
            "DELETE FROM edges WHERE source = ?1 OR target = ?1",
            params![id.as_str()],
        )?;
        tx.execute("DELETE FROM nodes WHERE id = ?1", params![id.as_str()])?;
        tx.commit()?;
        Ok(())
    }

    /// Node row or a query error naming the missing id.
    pub fn require_node(&self, id: &NodeId) -> Result<NodeRow> {
        self.get_node_row(id)?
            .ok_or_else(|| Error::Query(format!("node not found: {}", id)))
    }
}
