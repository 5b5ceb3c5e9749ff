use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use engram_index::Database;
use engram_types::{Edge, EdgeKind, Node, NodeId};

use crate::embeddings::cosine_similarity;
use crate::store::NodeStore;
use crate::Result;

/// Post-hoc edge derivation: semantic neighbors, shared-file overlap and
/// temporal proximity, plus structural edges hinted by extraction.
pub struct ConnectionDiscoverer {
    db: Arc<Mutex<Database>>,
    store: Arc<NodeStore>,
    pub semantic_threshold: f64,
    pub min_file_overlap: f64,
    pub temporal_window: Duration,
    pub cooldown: Duration,
}

impl ConnectionDiscoverer {
    pub fn new(
        db: Arc<Mutex<Database>>,
        store: Arc<NodeStore>,
        semantic_threshold: f64,
        min_file_overlap: f64,
        temporal_window: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            db,
            store,
            semantic_threshold,
            min_file_overlap,
            temporal_window,
            cooldown,
        }
    }

    fn db(&self) -> std::sync::MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run all discovery passes for one node. Honors the per-node cooldown
    /// unless `force` (reanalysis forces a re-run). Returns edges written.
    pub fn discover_for_node(&self, id: &NodeId, force: bool) -> Result<usize> {
        let now = Utc::now();
        if !force
            && let Some(last) = self.db().last_connection_run(id)?
            && now.signed_duration_since(last) < self.cooldown
        {
            return Ok(0);
        }

        let Some(node) = self.store.load_current(id)? else {
            return Ok(0);
        };

        let mut written = 0;
        written += self.semantic_pass(&node)?;
        written += self.file_overlap_pass(&node)?;
        written += self.temporal_pass(&node)?;

        self.db().mark_connection_run(id, now)?;
        Ok(written)
    }

    fn semantic_pass(&self, node: &Node) -> Result<usize> {
        let Some((model, own_vector)) = self.db().get_embedding(&node.id)? else {
            return Ok(0);
        };
        let peers = self.db().embeddings_for_model(&model, &node.id)?;

        // Top-k nearest above threshold; k bounded so one hub node cannot
        // fan out to the whole corpus
        const TOP_K: usize = 10;
        let mut scored: Vec<(String, f64)> = peers
            .into_iter()
            .map(|(peer_id, vector)| (peer_id, cosine_similarity(&own_vector, &vector)))
            .filter(|(_, similarity)| *similarity >= self.semantic_threshold)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(TOP_K);

        let mut written = 0;
        for (peer_id, similarity) in scored {
            let Ok(target) = NodeId::from_stored(peer_id) else {
                continue;
            };
            self.db().upsert_edge(
                &Edge::new(node.id.clone(), target, EdgeKind::Semantic, similarity)
                    .with_evidence(format!("cosine {:.3} ({})", similarity, model))
                    .derived_from_version(node.version),
            )?;
            written += 1;
        }
        Ok(written)
    }

    fn file_overlap_pass(&self, node: &Node) -> Result<usize> {
        if node.content.files_touched.is_empty() {
            return Ok(0);
        }
        let own: HashSet<&str> = node
            .content
            .files_touched
            .iter()
            .map(|s| s.as_str())
            .collect();

        let candidates = self.db().all_node_ids_except(&node.id)?;
        let mut written = 0;

        for row in candidates {
            let Ok(peer) = self.store.load_json(Path::new(&row.json_path)) else {
                continue;
            };
            if peer.content.files_touched.is_empty() {
                continue;
            }
            let theirs: HashSet<&str> = peer
                .content
                .files_touched
                .iter()
                .map(|s| s.as_str())
                .collect();

            let shared = own.intersection(&theirs).count();
            if shared == 0 {
                continue;
            }
            let union = own.union(&theirs).count();
            let jaccard = shared as f64 / union as f64;
            if jaccard < self.min_file_overlap {
                continue;
            }

            let sample: Vec<&str> = own.intersection(&theirs).take(3).copied().collect();
            self.db().upsert_edge(
                &Edge::new(node.id.clone(), peer.id.clone(), EdgeKind::FileOverlap, jaccard)
                    .with_evidence(format!("{} shared files, e.g. {}", shared, sample.join(", ")))
                    .derived_from_version(node.version),
            )?;
            written += 1;
        }
        Ok(written)
    }

    fn temporal_pass(&self, node: &Node) -> Result<usize> {
        let until = node.metadata.timestamp;
        let since = until - self.temporal_window;
        let rows = self.db().nodes_in_project_window(
            &node.classification.project,
            &node.id,
            since,
            until,
        )?;

        let mut written = 0;
        for row in rows {
            let Ok(target) = NodeId::from_stored(row.id) else {
                continue;
            };
            // Weight decays linearly across the window
            let age = until
                .signed_duration_since(
                    chrono::DateTime::parse_from_rfc3339(&row.timestamp)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or(until),
                )
                .num_seconds()
                .max(0) as f64;
            let window = self.temporal_window.num_seconds().max(1) as f64;
            let weight = (1.0 - age / window).clamp(0.0, 1.0);

            self.db().upsert_edge(
                &Edge::new(node.id.clone(), target, EdgeKind::Temporal, weight)
                    .with_evidence(format!("same project within {} days", self.temporal_window.num_days()))
                    .derived_from_version(node.version),
            )?;
            written += 1;
        }
        Ok(written)
    }

    /// Structural edges carry the hint verbatim: compaction chains between
    /// adjacent segments, fork links between a child session's first node
    /// and its parent session's nodes.
    pub fn insert_structural(&self, edge: &Edge) -> Result<()> {
        self.db().upsert_edge(edge)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use engram_types::{
        Classification, Content, DaemonMeta, Lessons, NodeMetadata, Outcome, Semantic,
    };

    fn node_for(session: &str, files: &[&str], project: &str) -> Node {
        Node {
            id: NodeId::derive(session, "start"),
            version: 0,
            classification: Classification {
                node_type: "feature".to_string(),
                project: project.to_string(),
                language: None,
                frameworks: vec![],
                had_clear_goal: true,
                is_new_project: false,
            },
            content: Content {
                summary: format!("work in {}", session),
                outcome: Outcome::Success,
                key_decisions: vec![],
                files_touched: files.iter().map(|f| f.to_string()).collect(),
                tools_used: vec![],
                errors_seen: vec![],
            },
            lessons: Lessons::default(),
            semantic: Semantic::default(),
            metadata: NodeMetadata {
                timestamp: Utc::now(),
                source_session: session.to_string(),
                source_boundary: "start".to_string(),
                prompt_version: "v1-deadbeef".to_string(),
                daemon_meta: DaemonMeta::default(),
            },
            friction: vec![],
        }
    }

    fn rig(dir: &Path) -> (Arc<Mutex<Database>>, Arc<NodeStore>, ConnectionDiscoverer) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let store = Arc::new(NodeStore::new(
            dir.to_path_buf(),
            db.clone(),
            EventBus::new(),
            5,
        ));
        let discoverer = ConnectionDiscoverer::new(
            db.clone(),
            store.clone(),
            0.6,
            0.2,
            Duration::days(7),
            Duration::hours(24),
        );
        (db, store, discoverer)
    }

    #[test]
    fn semantic_edges_respect_threshold_and_model_tag() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (db, store, discoverer) = rig(tmp.path());

        let mut a = node_for("/s/a.jsonl", &[], "/p");
        let mut b = node_for("/s/b.jsonl", &[], "/p/other");
        let mut c = node_for("/s/c.jsonl", &[], "/p/third");
        store.write(&mut a).unwrap();
        store.write(&mut b).unwrap();
        store.write(&mut c).unwrap();

        {
            let mut db = db.lock().unwrap();
            db.set_embedding(&a.id, "m1", &[1.0, 0.0]).unwrap();
            db.set_embedding(&b.id, "m1", &[0.9, 0.1]).unwrap();
            // Same direction but different model: must be ignored
            db.set_embedding(&c.id, "m2", &[1.0, 0.0]).unwrap();
        }

        discoverer.discover_for_node(&a.id, false).unwrap();

        let edges = db.lock().unwrap().edges_for_node(&a.id).unwrap();
        let semantic: Vec<_> = edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Semantic)
            .collect();
        assert_eq!(semantic.len(), 1);
        assert_eq!(semantic[0].target, b.id);
        assert!(semantic[0].weight > 0.9);
    }

    #[test]
    fn file_overlap_uses_jaccard() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (db, store, discoverer) = rig(tmp.path());

        let mut a = node_for("/s/a.jsonl", &["src/lib.rs", "src/db.rs"], "/p");
        let mut b = node_for("/s/b.jsonl", &["src/db.rs", "src/api.rs"], "/q");
        let mut c = node_for("/s/c.jsonl", &["README.md"], "/r");
        store.write(&mut a).unwrap();
        store.write(&mut b).unwrap();
        store.write(&mut c).unwrap();

        discoverer.discover_for_node(&a.id, false).unwrap();

        let edges = db.lock().unwrap().edges_for_node(&a.id).unwrap();
        let overlap: Vec<_> = edges
            .iter()
            .filter(|e| e.kind == EdgeKind::FileOverlap)
            .collect();
        assert_eq!(overlap.len(), 1);
        assert_eq!(overlap[0].target, b.id);
        // 1 shared of 3 union
        assert!((overlap[0].weight - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn cooldown_suppresses_rerun_unless_forced() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (db, store, discoverer) = rig(tmp.path());

        let mut a = node_for("/s/a.jsonl", &["src/lib.rs"], "/p");
        let mut b = node_for("/s/b.jsonl", &["src/lib.rs"], "/p");
        store.write(&mut a).unwrap();
        store.write(&mut b).unwrap();

        let first = discoverer.discover_for_node(&a.id, false).unwrap();
        assert!(first > 0);

        // Within cooldown: nothing happens
        let second = discoverer.discover_for_node(&a.id, false).unwrap();
        assert_eq!(second, 0);

        // Forced: runs again and refreshes the same edges in place
        let forced = discoverer.discover_for_node(&a.id, true).unwrap();
        assert!(forced > 0);

        let edges = db.lock().unwrap().edges_for_node(&a.id).unwrap();
        let overlap_count = edges
            .iter()
            .filter(|e| e.kind == EdgeKind::FileOverlap)
            .count();
        assert_eq!(overlap_count, 1);
    }

    #[test]
    fn temporal_edges_stay_in_project() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (db, store, discoverer) = rig(tmp.path());

        let mut a = node_for("/s/a.jsonl", &[], "/p");
        let mut same = node_for("/s/b.jsonl", &[], "/p");
        let mut other = node_for("/s/c.jsonl", &[], "/q");
        store.write(&mut a).unwrap();
        store.write(&mut same).unwrap();
        store.write(&mut other).unwrap();

        discoverer.discover_for_node(&a.id, false).unwrap();

        let edges = db.lock().unwrap().edges_for_node(&a.id).unwrap();
        let temporal: Vec<_> = edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Temporal)
            .collect();
        assert_eq!(temporal.len(), 1);
        assert_eq!(temporal[0].target, same.id);
    }
}
