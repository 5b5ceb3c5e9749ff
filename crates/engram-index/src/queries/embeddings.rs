use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use engram_types::NodeId;

use crate::db::{Database, format_ts};
use crate::queries::nodes::{NODE_COLUMNS, NodeRow, node_row_from_row};
use crate::Result;

// Vectors are opaque little-endian f32 bytes tagged with the model that
// produced them. Similarity is only meaningful within one tag; the index
// never compares across models.

pub(crate) fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

pub(crate) fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl Database {
    pub fn set_embedding(&mut self, node_id: &NodeId, model: &str, vector: &[f32]) -> Result<()> {
        self.conn.execute(
            "INSERT INTO embeddings (node_id, model, dims, vector, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(node_id) DO UPDATE SET
                 model = ?2, dims = ?3, vector = ?4, updated_at = ?5",
            params![
                node_id.as_str(),
                model,
                vector.len() as i64,
                vector_to_blob(vector),
                format_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get_embedding(&self, node_id: &NodeId) -> Result<Option<(String, Vec<f32>)>> {
        let row = self
            .conn
            .query_row(
                "SELECT model, vector FROM embeddings WHERE node_id = ?1",
                params![node_id.as_str()],
                |row| {
                    let model: String = row.get(0)?;
                    let blob: Vec<u8> = row.get(1)?;
                    Ok((model, blob_to_vector(&blob)))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// All vectors produced by `model`, excluding one node. The caller
    /// computes similarity in memory; corpora at daemon scale fit easily.
    pub fn embeddings_for_model(
        &self,
        model: &str,
        exclude: &NodeId,
    ) -> Result<Vec<(String, Vec<f32>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT node_id, vector FROM embeddings WHERE model = ?1 AND node_id != ?2",
        )?;
        let rows = stmt
            .query_map(params![model, exclude.as_str()], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, blob_to_vector(&blob)))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Nodes that have no embedding yet - the backfill job's work list.
    pub fn nodes_missing_embedding(&self, limit: usize) -> Result<Vec<NodeRow>> {
        let cols = NODE_COLUMNS
            .split(", ")
            .map(|c| format!("n.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {cols} FROM nodes n
             LEFT JOIN embeddings e ON e.node_id = n.id
             WHERE e.node_id IS NULL
             ORDER BY n.timestamp DESC LIMIT {limit}"
        ))?;
        let rows = stmt
            .query_map([], node_row_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_embeddings(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let vector = vec![0.5_f32, -1.25, 3.0];
        assert_eq!(blob_to_vector(&vector_to_blob(&vector)), vector);
    }

    #[test]
    fn backfill_work_list_shrinks_as_vectors_arrive() {
        let mut db = Database::open_in_memory().unwrap();
        let a = NodeId::derive("/s/a.jsonl", "start");
        let b = NodeId::derive("/s/b.jsonl", "start");
        db.commit_node(
            &crate::queries::nodes::tests::sample_node(&a, 1, "a"),
            "/n/a.json",
        )
        .unwrap();
        db.commit_node(
            &crate::queries::nodes::tests::sample_node(&b, 1, "b"),
            "/n/b.json",
        )
        .unwrap();

        assert_eq!(db.nodes_missing_embedding(10).unwrap().len(), 2);

        db.set_embedding(&a, "local-minilm", &[0.1, 0.2]).unwrap();
        let missing = db.nodes_missing_embedding(10).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, b.as_str());
    }

    #[test]
    fn model_scoping_excludes_other_tags() {
        let mut db = Database::open_in_memory().unwrap();
        let a = NodeId::derive("/s/a.jsonl", "start");
        let b = NodeId::derive("/s/b.jsonl", "start");
        let c = NodeId::derive("/s/c.jsonl", "start");
        for (id, name) in [(&a, "a"), (&b, "b"), (&c, "c")] {
            db.commit_node(
                &crate::queries::nodes::tests::sample_node(id, 1, name),
                "/n/x.json",
            )
            .unwrap();
        }

        db.set_embedding(&a, "local-minilm", &[1.0, 0.0]).unwrap();
        db.set_embedding(&b, "local-minilm", &[0.0, 1.0]).unwrap();
        db.set_embedding(&c, "openai-small", &[1.0, 1.0]).unwrap();

        let peers = db.embeddings_for_model("local-minilm", &a).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, b.as_str());
    }
}
