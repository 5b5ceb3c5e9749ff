use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use engram_types::{Edge, EdgeKind, NodeId};

use crate::db::{Database, format_ts, parse_ts};
use crate::Result;

impl Database {
    /// Insert or refresh an edge. (source, target, kind) is unique;
    /// re-discovery updates weight, evidence and created_at in place.
    pub fn upsert_edge(&mut self, edge: &Edge) -> Result<()> {
        self.conn.execute(
            "INSERT INTO edges (source, target, kind, weight, evidence, node_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(source, target, kind) DO UPDATE SET
                 weight = ?4, evidence = ?5, node_version = ?6, created_at = ?7",
            params![
                edge.source.as_str(),
                edge.target.as_str(),
                edge.kind.as_str(),
                edge.weight,
                edge.evidence,
                edge.node_version,
                format_ts(edge.created_at),
            ],
        )?;
        Ok(())
    }

    /// Edges touching a node in either direction.
    pub fn edges_for_node(&self, id: &NodeId) -> Result<Vec<Edge>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, target, kind, weight, evidence, node_version, created_at
             FROM edges WHERE source = ?1 OR target = ?1
             ORDER BY weight DESC",
        )?;
        let edges = stmt
            .query_map(params![id.as_str()], |row| {
                let source: String = row.get(0)?;
                let target: String = row.get(1)?;
                let kind: String = row.get(2)?;
                let created: String = row.get(6)?;
                Ok((
                    source,
                    target,
                    kind,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, u32>(5)?,
                    created,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(edges
            .into_iter()
            .filter_map(|(source, target, kind, weight, evidence, version, created)| {
                Some(Edge {
                    source: NodeId::from_stored(source).ok()?,
                    target: NodeId::from_stored(target).ok()?,
                    kind: EdgeKind::parse(&kind)?,
                    weight,
                    evidence,
                    node_version: version,
                    created_at: parse_ts(&created).unwrap_or_else(Utc::now),
                })
            })
            .collect())
    }

    pub fn count_edges(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Cooldown bookkeeping for connection discovery.
    pub fn last_connection_run(&self, id: &NodeId) -> Result<Option<DateTime<Utc>>> {
        let last: Option<String> = self
            .conn
            .query_row(
                "SELECT last_run_at FROM connection_runs WHERE node_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(last.and_then(|s| parse_ts(&s)))
    }

    pub fn mark_connection_run(&mut self, id: &NodeId, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO connection_runs (node_id, last_run_at) VALUES (?1, ?2)
             ON CONFLICT(node_id) DO UPDATE SET last_run_at = ?2",
            params![id.as_str(), format_ts(at)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_edges_update_in_place() {
        let mut db = Database::open_in_memory().unwrap();
        let a = NodeId::derive("/s/a.jsonl", "start");
        let b = NodeId::derive("/s/b.jsonl", "start");

        db.upsert_edge(&Edge::new(a.clone(), b.clone(), EdgeKind::Semantic, 0.7))
            .unwrap();
        db.upsert_edge(&Edge::new(a.clone(), b.clone(), EdgeKind::Semantic, 0.9))
            .unwrap();

        let edges = db.edges_for_node(&a).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].weight, 0.9);

        // A different kind between the same pair is a separate edge
        db.upsert_edge(&Edge::new(a.clone(), b, EdgeKind::FileOverlap, 0.5))
            .unwrap();
        assert_eq!(db.edges_for_node(&a).unwrap().len(), 2);
    }

    #[test]
    fn cooldown_round_trip() {
        let mut db = Database::open_in_memory().unwrap();
        let a = NodeId::derive("/s/a.jsonl", "start");

        assert!(db.last_connection_run(&a).unwrap().is_none());
        let at = Utc::now();
        db.mark_connection_run(&a, at).unwrap();
        let stored = db.last_connection_run(&a).unwrap().unwrap();
        assert!((stored - at).num_seconds().abs() < 1);
    }
}
