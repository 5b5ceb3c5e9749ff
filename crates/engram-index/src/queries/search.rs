use rusqlite::params;

use crate::db::Database;
use crate::queries::nodes::{NODE_COLUMNS, NodeRow, node_row_from_row};
use crate::Result;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub row: NodeRow,
    /// FTS5 bm25-derived rank; lower is better
    pub rank: f64,
}

/// Quote each whitespace-separated token so user input can never be parsed
/// as FTS5 query syntax. Tokens are ANDed, which matches search-box
/// expectations.
fn sanitize_match_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Database {
    pub fn search_nodes(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.search_nodes_in_project(query, None, limit)
    }

    pub fn search_nodes_in_project(
        &self,
        query: &str,
        project: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let match_query = sanitize_match_query(query);
        if match_query.is_empty() {
            return Ok(Vec::new());
        }

        let cols = NODE_COLUMNS
            .split(", ")
            .map(|c| format!("n.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "SELECT {cols}, rank AS fts_rank
             FROM nodes_fts f
             JOIN nodes n ON n.id = f.id
             WHERE nodes_fts MATCH ?1"
        );
        if project.is_some() {
            sql.push_str(" AND n.project = ?2");
        }
        sql.push_str(&format!(" ORDER BY rank LIMIT {}", limit.max(1)));

        let mut stmt = self.conn.prepare(&sql)?;
        let map_hit = |row: &rusqlite::Row<'_>| {
            Ok(SearchHit {
                row: node_row_from_row(row)?,
                rank: row.get("fts_rank")?,
            })
        };

        let hits = match project {
            Some(p) => stmt
                .query_map(params![match_query, p], map_hit)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![match_query], map_hit)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };
        Ok(hits)
    }
}
