use chrono::{Datelike, Utc};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use engram_index::Database;
use engram_types::{BusEvent, Node, NodeId};

use crate::events::EventBus;
use crate::{Error, Result};

// NOTE: Commit Ordering
//
// write JSON (temp + fsync + rename) -> index/FTS transaction -> bus event.
// A crash between the rename and the commit leaves an orphan JSON file; the
// startup reconciliation walks the current month and removes files whose
// version the index never committed. The index is therefore never ahead of
// the filesystem, and readers holding only the index always find their file.

/// Canonical node storage: versioned JSON files with the relational index
/// kept consistent at commit.
pub struct NodeStore {
    data_dir: PathBuf,
    db: Arc<Mutex<Database>>,
    bus: EventBus,
    retention_max_versions: u32,
}

impl NodeStore {
    pub fn new(
        data_dir: PathBuf,
        db: Arc<Mutex<Database>>,
        bus: EventBus,
        retention_max_versions: u32,
    ) -> Self {
        Self {
            data_dir,
            db,
            bus,
            retention_max_versions,
        }
    }

    fn db(&self) -> std::sync::MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.data_dir.join("nodes")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("archive/nodes")
    }

    fn month_dir(&self, node: &Node) -> PathBuf {
        let ts = node.metadata.timestamp;
        self.nodes_dir()
            .join(format!("{:04}", ts.year()))
            .join(format!("{:02}", ts.month()))
    }

    /// Commit a node: assigns the next version, writes the canonical JSON
    /// durably, commits the index + FTS row, stores the embedding if one is
    /// attached, then publishes `node.created`.
    pub fn write(&self, node: &mut Node) -> Result<PathBuf> {
        // Holding the db lock across the file write serializes version
        // assignment with the commit (single-writer rule).
        let mut db = self.db();

        let version = db.next_node_version(&node.id)?;
        node.version = version;

        let dir = self.month_dir(node);
        fs::create_dir_all(&dir)?;
        let final_path = dir.join(format!("{}-v{}.json", node.id, version));
        let temp_path = dir.join(format!(".tmp-{}-v{}.json", node.id, version));

        let json = serde_json::to_vec_pretty(&node)
            .map_err(|e| Error::InvalidOperation(format!("node serialization: {}", e)))?;
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &final_path)?;

        db.commit_node(node, &final_path.to_string_lossy())?;

        if let (Some(embedding), Some(model)) = (
            node.semantic.embedding.as_ref(),
            node.semantic.embedding_model.as_ref(),
        ) {
            db.set_embedding(&node.id, model, embedding)?;
        }
        drop(db);

        self.archive_beyond_retention(node)?;

        self.bus.publish(BusEvent::NodeCreated {
            node_id: node.id.clone(),
            version,
        });

        Ok(final_path)
    }

    /// Read the latest committed version via the index pointer.
    pub fn load_current(&self, id: &NodeId) -> Result<Option<Node>> {
        let row = self.db().get_node_row(id)?;
        match row {
            Some(row) => Ok(Some(self.load_json(Path::new(&row.json_path))?)),
            None => Ok(None),
        }
    }

    pub fn load_json(&self, path: &Path) -> Result<Node> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::InvalidOperation(format!("corrupt node file {}: {}", path.display(), e)))
    }

    /// Remove current-month JSON files the index never committed (crash
    /// between file rename and transaction). Returns the number removed.
    pub fn reconcile_startup(&self) -> Result<usize> {
        let now = Utc::now();
        let dir = self
            .nodes_dir()
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()));
        if !dir.exists() {
            return Ok(0);
        }

        let db = self.db();
        let mut removed = 0;

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            // Leftover temp files are always orphans
            if name.starts_with(".tmp-") {
                fs::remove_file(&path)?;
                removed += 1;
                continue;
            }

            let Some((id, version)) = parse_node_filename(name) else {
                continue;
            };
            let committed = db.node_version(&id)?;
            let orphaned = match committed {
                None => true,
                Some(committed) => version > committed,
            };
            if orphaned {
                tracing::warn!(file = %path.display(), "removing uncommitted node file");
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Move versions older than the retention window into the archive tree,
    /// keeping the newest `retention_max_versions` in place.
    fn archive_beyond_retention(&self, node: &Node) -> Result<()> {
        if node.version <= self.retention_max_versions {
            return Ok(());
        }
        let cutoff = node.version - self.retention_max_versions;
        let dir = self.month_dir(node);

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((id, version)) = parse_node_filename(name) else {
                continue;
            };
            if id != node.id || version > cutoff {
                continue;
            }

            let archive_dir = self
                .archive_dir()
                .join(dir.strip_prefix(self.nodes_dir()).unwrap_or(&dir));
            fs::create_dir_all(&archive_dir)?;
            fs::rename(&path, archive_dir.join(name))?;
        }
        Ok(())
    }
}

impl NodeStore {
    /// Age-based retention: move non-current version files older than
    /// `days` into the archive tree. Runs from scheduled maintenance.
    pub fn archive_aged(&self, days: u64) -> Result<usize> {
        let cutoff = std::time::SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(days * 86_400));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let nodes_dir = self.nodes_dir();
        let mut archived = 0;

        for entry in walkdir::WalkDir::new(&nodes_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((id, version)) = parse_node_filename(name) else {
                continue;
            };

            // Never archive the current version
            let current = self.db().node_version(&id)?;
            if current == Some(version) {
                continue;
            }

            let old_enough = path
                .metadata()
                .and_then(|m| m.modified())
                .map(|m| m < cutoff)
                .unwrap_or(false);
            if !old_enough {
                continue;
            }

            let relative = path
                .parent()
                .and_then(|p| p.strip_prefix(&nodes_dir).ok())
                .unwrap_or(Path::new(""));
            let archive_dir = self.archive_dir().join(relative);
            fs::create_dir_all(&archive_dir)?;
            fs::rename(path, archive_dir.join(name))?;
            archived += 1;
        }

        Ok(archived)
    }
}

/// Parse `<16-hex-id>-v<version>.json` file names.
fn parse_node_filename(name: &str) -> Option<(NodeId, u32)> {
    let stem = name.strip_suffix(".json")?;
    let (id, version) = stem.split_once("-v")?;
    let id = NodeId::from_stored(id).ok()?;
    let version = version.parse().ok()?;
    Some((id, version))
}
