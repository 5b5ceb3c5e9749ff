use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use engram_index::{Database, EnqueueRequest};
use engram_session::{
    ParsedSession, ReadyReason, Segment, SegmentOptions, evaluate_tail_readiness, read_session,
    split_segments, worth_analyzing,
};
use engram_types::{JobKind, NodeId};

use crate::config::Config;
use crate::prompts::PromptState;
use crate::queue::QueueService;
use crate::watcher::FileChange;
use crate::{Error, Result};

/// Decides, for a session file that changed, which segments deserve a new
/// analysis job.
pub struct Extractor {
    db: Arc<Mutex<Database>>,
    queue: Arc<QueueService>,
    config: Arc<RwLock<Config>>,
    prompt: PromptState,
}

#[derive(Debug)]
pub struct ExtractionReport {
    pub enqueued: Vec<i64>,
    pub skipped_below_gate: usize,
}

impl Extractor {
    pub fn new(
        db: Arc<Mutex<Database>>,
        queue: Arc<QueueService>,
        config: Arc<RwLock<Config>>,
        prompt: PromptState,
    ) -> Self {
        Self {
            db,
            queue,
            config,
            prompt,
        }
    }

    fn db(&self) -> std::sync::MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn segment_options(&self, path: &Path) -> (SegmentOptions, u32) {
        let config = self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let synced = config
            .sessions_sync_dirs
            .iter()
            .any(|root| path.starts_with(root));
        (
            SegmentOptions {
                idle_timeout: config.idle_timeout(),
                stability_threshold: config.stability_threshold(synced),
                ..SegmentOptions::default()
            },
            config.max_retries,
        )
    }

    /// Process one readiness event. Re-parses the session linearly (cheap at
    /// human-session scale), splits segments, applies readiness and the
    /// minimum-size gate, dedups against open jobs and committed nodes, and
    /// enqueues what remains.
    pub fn process_change(&self, change: &FileChange) -> Result<ExtractionReport> {
        let session = match read_session(&change.path) {
            Ok(session) => session,
            Err(
                err @ (engram_session::Error::EmptySession(_)
                | engram_session::Error::MalformedHeader { .. }),
            ) => {
                // Permanent input defects never become jobs
                tracing::debug!(path = %change.path.display(), error = %err, "session not analyzable");
                return Ok(ExtractionReport {
                    enqueued: Vec::new(),
                    skipped_below_gate: 0,
                });
            }
            Err(err) => return Err(Error::Session(err)),
        };

        let (opts, max_retries) = self.segment_options(&change.path);
        let segments = split_segments(&session);
        let session_file = change.path.to_string_lossy().into_owned();

        let mut report = ExtractionReport {
            enqueued: Vec::new(),
            skipped_below_gate: 0,
        };

        for segment in &segments {
            let ready = if segment.is_closed() {
                Some(ReadyReason::Boundary)
            } else {
                evaluate_tail_readiness(
                    segment.newest_timestamp(),
                    change.modified,
                    Utc::now(),
                    &opts,
                )
            };
            let Some(reason) = ready else {
                continue;
            };

            if !worth_analyzing(segment, &opts) {
                report.skipped_below_gate += 1;
                continue;
            }

            if let Some(job_id) =
                self.maybe_enqueue(&session, &session_file, segment, reason, max_retries)?
            {
                report.enqueued.push(job_id);
            }
        }

        Ok(report)
    }

    fn maybe_enqueue(
        &self,
        session: &ParsedSession,
        session_file: &str,
        segment: &Segment,
        reason: ReadyReason,
        max_retries: u32,
    ) -> Result<Option<i64>> {
        let boundary = segment.boundary_key.clone();
        let node_id = NodeId::derive(session_file, &boundary);

        {
            let db = self.db();
            // An open job already targets this segment
            if db.open_job_for_segment(session_file, &boundary)?.is_some() {
                return Ok(None);
            }
            // A committed node exists: initial analysis is done. Reanalysis
            // is the scheduler's call (it compares prompt versions).
            if db.get_node_row(&node_id)?.is_some() {
                return Ok(None);
            }
        }

        let request = EnqueueRequest {
            kind: JobKind::Initial,
            session_file: Some(session_file.to_string()),
            segment_boundary: Some(boundary.clone()),
            max_retries,
            prompt_version: Some(self.prompt.label()),
        };

        match self.queue.enqueue(&request) {
            Ok(job_id) => {
                tracing::info!(
                    session = %session.header.id,
                    boundary = %boundary,
                    reason = ?reason,
                    job_id,
                    "enqueued analysis"
                );
                Ok(Some(job_id))
            }
            Err(Error::Index(engram_index::Error::QueueFull { pending, cap })) => {
                // Resource pressure surfaces immediately; the next readiness
                // event retries naturally
                tracing::warn!(pending, cap, "queue full; dropping readiness event");
                let _ = self.db().record_decision(
                    "dropped a ready segment: queue full",
                    &format!("{} pending jobs against a cap of {}", pending, cap),
                    Some(&session.header.cwd),
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use chrono::Duration;
    use std::io::Write;

    fn world() -> (
        tempfile::TempDir,
        Arc<Mutex<Database>>,
        Arc<QueueService>,
        Extractor,
    ) {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let queue = Arc::new(QueueService::new(db.clone(), EventBus::new(), 100));
        let config = Arc::new(RwLock::new(Config::default()));
        let prompt_path = tmp.path().join("analysis.md");
        std::fs::write(&prompt_path, "analyze").unwrap();
        let prompt = crate::prompts::init_prompt_state(&db, &prompt_path, tmp.path()).unwrap();
        let extractor = Extractor::new(db.clone(), queue.clone(), config, prompt);
        (tmp, db, queue, extractor)
    }

    fn write_session(dir: &Path, minutes_ago: i64, with_boundary: bool) -> std::path::PathBuf {
        let project = dir.join("---home-u-proj--");
        std::fs::create_dir_all(&project).unwrap();
        let path = project.join("20260101T100000_7f2abd2d-7cfc-4447-9ddd-3ca8d14e02e9.jsonl");
        let base = Utc::now() - Duration::minutes(minutes_ago);
        let ts = |offset: i64| (base + Duration::seconds(offset)).to_rfc3339();

        let long = "a message body comfortably long enough to clear the estimated token floor \
                    when repeated across the segment entries of this synthetic session fixture, \
                    with extra words so the character-per-token heuristic is never borderline";
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"{{"type":"session","version":1,"id":"7f2abd2d-7cfc-4447-9ddd-3ca8d14e02e9","timestamp":"{}","cwd":"/home/u/proj"}}"#,
            ts(0)
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"type":"message","id":"e1","parentId":null,"timestamp":"{}","role":"user","content":"{}"}}"#,
            ts(1),
            long
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"type":"message","id":"e2","parentId":"e1","timestamp":"{}","role":"assistant","content":"{}"}}"#,
            ts(2),
            long
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"type":"message","id":"e3","parentId":"e2","timestamp":"{}","role":"user","content":"{}"}}"#,
            ts(3),
            long
        )
        .unwrap();
        if with_boundary {
            writeln!(
                file,
                r#"{{"type":"compaction","id":"c1","parentId":"e3","timestamp":"{}","summary":"compacted"}}"#,
                ts(4)
            )
            .unwrap();
        }
        path
    }

    fn change_for(path: &Path, modified_secs_ago: i64) -> FileChange {
        FileChange {
            path: path.to_path_buf(),
            modified: Utc::now() - Duration::seconds(modified_secs_ago),
            size: path.metadata().map(|m| m.len()).unwrap_or(0),
        }
    }

    #[test]
    fn idle_session_enqueues_one_job() {
        let (tmp, _db, _queue, extractor) = world();
        let path = write_session(tmp.path(), 12, false);

        let report = extractor.process_change(&change_for(&path, 1)).unwrap();
        assert_eq!(report.enqueued.len(), 1);
    }

    #[test]
    fn fresh_session_waits_for_stability() {
        let (tmp, _db, _queue, extractor) = world();
        let path = write_session(tmp.path(), 0, false);

        // Modified 1s ago: below the 5s stability threshold, not idle
        let report = extractor.process_change(&change_for(&path, 1)).unwrap();
        assert!(report.enqueued.is_empty());

        // Modified 10s ago: stability reached
        let report = extractor.process_change(&change_for(&path, 10)).unwrap();
        assert_eq!(report.enqueued.len(), 1);
    }

    #[test]
    fn reprocessing_is_idempotent() {
        let (tmp, _db, _queue, extractor) = world();
        let path = write_session(tmp.path(), 12, false);

        let first = extractor.process_change(&change_for(&path, 1)).unwrap();
        let second = extractor.process_change(&change_for(&path, 1)).unwrap();
        assert_eq!(first.enqueued.len(), 1);
        assert!(second.enqueued.is_empty(), "open job dedups the segment");
    }

    #[test]
    fn boundary_splits_into_closed_segment_job() {
        let (tmp, _db, _queue, extractor) = world();
        let path = write_session(tmp.path(), 0, true);

        // Closed segment is ready immediately regardless of idle/stability;
        // the tail after the boundary is a single compaction entry and
        // stays below the gate
        let report = extractor.process_change(&change_for(&path, 1)).unwrap();
        assert_eq!(report.enqueued.len(), 1);
        assert_eq!(report.skipped_below_gate, 0);
    }

    #[test]
    fn malformed_sessions_never_become_jobs() {
        let (tmp, _db, queue, extractor) = world();
        let project = tmp.path().join("---home-u-proj--");
        std::fs::create_dir_all(&project).unwrap();
        let path = project.join("20260101T100000_9f2abd2d-7cfc-4447-9ddd-3ca8d14e02e9.jsonl");
        std::fs::write(&path, "this is not a session header\n").unwrap();

        let report = extractor.process_change(&change_for(&path, 10)).unwrap();
        assert!(report.enqueued.is_empty());
        let _ = queue;
    }

    #[test]
    fn committed_node_suppresses_initial_reanalysis() {
        use engram_types::{
            Classification, Content, DaemonMeta, Lessons, Node, NodeMetadata, Outcome, Semantic,
        };

        let (tmp, db, _queue, extractor) = world();
        let path = write_session(tmp.path(), 12, false);
        let session_file = path.to_string_lossy().into_owned();

        let node = Node {
            id: NodeId::derive(&session_file, "start"),
            version: 1,
            classification: Classification {
                node_type: "feature".to_string(),
                project: "/home/u/proj".to_string(),
                language: None,
                frameworks: vec![],
                had_clear_goal: true,
                is_new_project: false,
            },
            content: Content {
                summary: "already analyzed".to_string(),
                outcome: Outcome::Success,
                key_decisions: vec![],
                files_touched: vec![],
                tools_used: vec![],
                errors_seen: vec![],
            },
            lessons: Lessons::default(),
            semantic: Semantic::default(),
            metadata: NodeMetadata {
                timestamp: Utc::now(),
                source_session: session_file.clone(),
                source_boundary: "start".to_string(),
                prompt_version: "v1-deadbeef".to_string(),
                daemon_meta: DaemonMeta::default(),
            },
            friction: vec![],
        };
        db.lock().unwrap().commit_node(&node, "/n/x.json").unwrap();

        let report = extractor.process_change(&change_for(&path, 1)).unwrap();
        assert!(report.enqueued.is_empty());
    }
}
