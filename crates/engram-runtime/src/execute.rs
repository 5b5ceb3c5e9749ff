use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use engram_analyzer::{
    AnalyzerConfig, Classified, Invocation, ValidatedOutput, classify_failure, invoke,
    schema_failure, validate_output,
};
use engram_index::Database;
use engram_session::{EntryPayload, ParsedSession, Role, Segment, read_session, split_segments};
use engram_types::{
    BusEvent, DaemonMeta, Edge, EdgeKind, ErrorCategory, InsightType, Job, JobKind, Node,
    NodeId, NodeMetadata,
};

use crate::config::Config;
use crate::connections::ConnectionDiscoverer;
use crate::embeddings::{EmbeddingProvider, embedding_text};
use crate::events::EventBus;
use crate::health::resolve_binary;
use crate::prompts::PromptState;
use crate::store::NodeStore;

/// Why a job execution did not succeed.
#[derive(Debug)]
pub enum ExecutionFailure {
    /// Daemon shutdown; release the lease, do not classify
    Interrupted,
    /// Classified failure driving the retry policy
    Classified {
        classified: Classified,
        message: String,
    },
}

pub type ExecutionResult = std::result::Result<(), ExecutionFailure>;

fn internal(message: impl Into<String>) -> ExecutionFailure {
    ExecutionFailure::Classified {
        classified: Classified {
            category: ErrorCategory::Unknown,
            max_retries: 2,
        },
        message: message.into(),
    }
}

fn permanent(message: impl Into<String>) -> ExecutionFailure {
    ExecutionFailure::Classified {
        classified: Classified {
            category: ErrorCategory::Permanent,
            max_retries: 0,
        },
        message: message.into(),
    }
}

/// Executes one leased job of any kind. Owned by the worker pool; every
/// method classifies its own failures instead of crashing the worker.
pub struct JobExecutor {
    db: Arc<Mutex<Database>>,
    store: Arc<NodeStore>,
    config: Arc<RwLock<Config>>,
    data_dir: std::path::PathBuf,
    prompt: PromptState,
    discoverer: Arc<ConnectionDiscoverer>,
    embedder: Arc<dyn EmbeddingProvider>,
    bus: EventBus,
    skills_available: Vec<String>,
    /// Caps concurrent analyzer subprocesses below the worker count
    analysis_slots: Arc<tokio::sync::Semaphore>,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Mutex<Database>>,
        store: Arc<NodeStore>,
        config: Arc<RwLock<Config>>,
        data_dir: std::path::PathBuf,
        prompt: PromptState,
        discoverer: Arc<ConnectionDiscoverer>,
        embedder: Arc<dyn EmbeddingProvider>,
        bus: EventBus,
        skills_available: Vec<String>,
    ) -> Self {
        let max_concurrent = config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .max_concurrent_analysis
            .max(1);
        Self {
            db,
            store,
            config,
            data_dir,
            prompt,
            discoverer,
            embedder,
            bus,
            skills_available,
            analysis_slots: Arc::new(tokio::sync::Semaphore::new(max_concurrent)),
        }
    }

    fn db(&self) -> std::sync::MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn config(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn execute(&self, job: &Job, cancel: &CancellationToken) -> ExecutionResult {
        match job.kind {
            JobKind::Initial | JobKind::Reanalysis => self.run_analysis(job, cancel).await,
            JobKind::ConnectionDiscovery => self.run_connection_discovery(job),
            JobKind::EmbeddingBackfill => self.run_embedding_backfill(cancel).await,
            JobKind::Clustering => self.run_clustering(),
            JobKind::PatternAggregation => self.run_pattern_aggregation(),
        }
    }

    async fn run_analysis(&self, job: &Job, cancel: &CancellationToken) -> ExecutionResult {
        let _slot = tokio::select! {
            permit = self.analysis_slots.clone().acquire_owned() => {
                permit.map_err(|_| ExecutionFailure::Interrupted)?
            }
            _ = cancel.cancelled() => return Err(ExecutionFailure::Interrupted),
        };

        let Some(session_file) = job.session_file.as_deref() else {
            return Err(permanent("analysis job without session_file"));
        };
        let Some(boundary) = job.segment_boundary.as_deref() else {
            return Err(permanent("analysis job without segment_boundary"));
        };

        let session = match read_session(Path::new(session_file)) {
            Ok(session) => session,
            Err(err @ engram_session::Error::EmptySession(_)) => {
                return Err(permanent(err.to_string()));
            }
            Err(err @ engram_session::Error::MalformedHeader { .. }) => {
                return Err(permanent(err.to_string()));
            }
            Err(engram_session::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(permanent(format!("session file not found: {}", session_file)));
            }
            Err(err) => return Err(internal(err.to_string())),
        };

        let segments = split_segments(&session);
        let Some(segment) = segments.iter().find(|s| s.boundary_key == boundary) else {
            // Boundary ids are stable once committed; a missing one means
            // the file was rewritten out from under us
            return Err(permanent(format!("segment boundary '{}' not found", boundary)));
        };

        let config = self.config();
        let Some(binary) = resolve_binary(&config.analyzer_binary) else {
            return Err(internal(format!(
                "analyzer binary '{}' disappeared",
                config.analyzer_binary
            )));
        };

        let analyzer = AnalyzerConfig {
            binary,
            provider: config.analyzer_provider.clone(),
            model: config.analyzer_model.clone(),
            system_prompt_path: config.prompt_path(&self.data_dir),
            skills: self.skills_available.clone(),
        };
        let invocation = Invocation {
            instructions:
                "Analyze the coding session segment provided on stdin and emit one knowledge \
                 node JSON document (classification, content, lessons, semantic, friction)."
                    .to_string(),
            payload: segment_payload(&session, session_file, segment),
            timeout: config.analysis_timeout(),
            term_grace: Duration::from_secs(5),
        };

        let raw = match invoke(&analyzer, &invocation, cancel).await {
            Ok(raw) => raw,
            Err(engram_analyzer::Error::Interrupted) => return Err(ExecutionFailure::Interrupted),
            Err(err) => return Err(internal(err.to_string())),
        };

        if !raw.succeeded() {
            let classified = classify_failure(&raw.stderr, raw.exit_code, raw.timed_out);
            let message = if raw.timed_out {
                format!("analyzer timed out after {:?}", invocation.timeout)
            } else {
                format!(
                    "analyzer exited {:?}: {}",
                    raw.exit_code,
                    raw.stderr.lines().next().unwrap_or("")
                )
            };
            return Err(ExecutionFailure::Classified {
                classified,
                message,
            });
        }

        let (output, needs_review, salvage_reason) = match validate_output(&raw.stdout) {
            ValidatedOutput::Complete(output) => (output, false, None),
            ValidatedOutput::Salvaged { output, reason } => {
                let _ = self.db().record_decision(
                    "salvaged a partially valid analyzer document",
                    &format!("kept what validated; flagged for review ({})", reason),
                    Some(&session.header.cwd),
                );
                (output, true, Some(reason))
            }
            ValidatedOutput::Invalid(reason) => {
                return Err(ExecutionFailure::Classified {
                    classified: schema_failure(),
                    message: format!("schema validation failed: {}", reason),
                });
            }
        };

        let node_id = NodeId::derive(session_file, boundary);
        let mut node = Node {
            id: node_id.clone(),
            version: 0,
            classification: output.classification,
            content: output.content,
            lessons: output.lessons,
            semantic: output.semantic,
            metadata: NodeMetadata {
                timestamp: Utc::now(),
                source_session: session_file.to_string(),
                source_boundary: boundary.to_string(),
                prompt_version: self.prompt.label(),
                daemon_meta: DaemonMeta {
                    skills_available: self.skills_available.clone(),
                    needs_review,
                    salvage_reason,
                    tokens_input: None,
                    tokens_output: None,
                    cost_usd: None,
                },
            },
            friction: output.friction,
        };
        if node.classification.project.trim().is_empty() {
            node.classification.project = session.header.cwd.clone();
        }

        // Best-effort eager embedding; backfill picks up whatever is missed
        if node.semantic.embedding.is_none() {
            match self.embedder.embed(&embedding_text(&node)).await {
                Ok(vector) => {
                    node.semantic.embedding = Some(vector);
                    node.semantic.embedding_model = Some(self.embedder.model().to_string());
                }
                Err(e) => {
                    tracing::debug!(error = %e, "eager embedding unavailable; deferring to backfill");
                }
            }
        }

        self.store
            .write(&mut node)
            .map_err(|e| internal(format!("node store write: {}", e)))?;

        self.insert_structural_edges(&session, session_file, segment, &node);

        // On-demand discovery after each write; reanalysis forces through
        // the cooldown
        if let Err(e) = self
            .discoverer
            .discover_for_node(&node_id, job.kind == JobKind::Reanalysis)
        {
            tracing::warn!(node = %node_id, error = %e, "connection discovery failed");
        }

        self.bus.publish(BusEvent::AnalysisCompleted {
            job_id: job.id,
            node_id,
            version: node.version,
        });
        Ok(())
    }

    /// Structural edges the extractor's segmentation implies: a compaction
    /// edge to the predecessor segment and a fork edge to the parent
    /// session's node.
    fn insert_structural_edges(
        &self,
        session: &ParsedSession,
        session_file: &str,
        segment: &Segment,
        node: &Node,
    ) {
        if segment.boundary_key != NodeId::START_BOUNDARY {
            let predecessor = split_segments(session)
                .into_iter()
                .find(|s| s.closing_boundary.as_deref() == Some(segment.boundary_key.as_str()));
            if let Some(predecessor) = predecessor {
                let target = NodeId::derive(session_file, &predecessor.boundary_key);
                let edge = Edge::new(node.id.clone(), target, EdgeKind::Compaction, 1.0)
                    .with_evidence(format!("compaction at {}", segment.boundary_key))
                    .derived_from_version(node.version);
                if let Err(e) = self.discoverer.insert_structural(&edge) {
                    tracing::warn!(error = %e, "compaction edge insert failed");
                }
            }
        }

        if segment.boundary_key == NodeId::START_BOUNDARY
            && let Some(parent) = &session.header.parent_session
        {
            let rows = self
                .db()
                .nodes_for_session_uuid(parent)
                .unwrap_or_default();
            if let Some(row) = rows.first()
                && let Ok(target) = NodeId::from_stored(row.id.clone())
            {
                let edge = Edge::new(node.id.clone(), target, EdgeKind::Fork, 1.0)
                    .with_evidence(format!("forked from session {}", parent))
                    .derived_from_version(node.version);
                if let Err(e) = self.discoverer.insert_structural(&edge) {
                    tracing::warn!(error = %e, "fork edge insert failed");
                }
            }
        }
    }

    fn run_connection_discovery(&self, job: &Job) -> ExecutionResult {
        // Scoped: one node. Unscoped: every node past its cooldown.
        let targets: Vec<NodeId> = match (&job.session_file, &job.segment_boundary) {
            (Some(session), Some(boundary)) => vec![NodeId::derive(session, boundary)],
            _ => {
                let rows = self
                    .db()
                    .list_node_rows(&engram_index::NodeFilter {
                        limit: 500,
                        ..Default::default()
                    })
                    .map_err(|e| internal(e.to_string()))?;
                rows.into_iter()
                    .filter_map(|row| NodeId::from_stored(row.id).ok())
                    .collect()
            }
        };

        for id in targets {
            if let Err(e) = self.discoverer.discover_for_node(&id, false) {
                tracing::warn!(node = %id, error = %e, "discovery pass failed");
            }
        }
        Ok(())
    }

    async fn run_embedding_backfill(&self, cancel: &CancellationToken) -> ExecutionResult {
        let rows = self
            .db()
            .nodes_missing_embedding(50)
            .map_err(|e| internal(e.to_string()))?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut succeeded = 0usize;
        let mut attempted = 0usize;

        for row in rows {
            if cancel.is_cancelled() {
                return Err(ExecutionFailure::Interrupted);
            }
            let Ok(node) = self.store.load_json(Path::new(&row.json_path)) else {
                continue;
            };
            attempted += 1;
            match self.embedder.embed(&embedding_text(&node)).await {
                Ok(vector) => {
                    self.db()
                        .set_embedding(&node.id, self.embedder.model(), &vector)
                        .map_err(|e| internal(e.to_string()))?;
                    succeeded += 1;
                }
                Err(e) => {
                    tracing::debug!(node = %node.id, error = %e, "embedding failed");
                }
            }
        }

        if succeeded == 0 && attempted > 0 {
            return Err(ExecutionFailure::Classified {
                classified: Classified {
                    category: ErrorCategory::Transient,
                    max_retries: 3,
                },
                message: "embedding provider unreachable for all candidates".to_string(),
            });
        }
        tracing::info!(succeeded, attempted, "embedding backfill pass");
        Ok(())
    }

    fn run_clustering(&self) -> ExecutionResult {
        let config = self.config();
        let exclude = NodeId::derive("cluster", "none");
        let vectors = self
            .db()
            .embeddings_for_model(&config.embedding_model, &exclude)
            .map_err(|e| internal(e.to_string()))?;
        if vectors.len() < 2 {
            return Ok(());
        }

        // Greedy threshold clustering: each unassigned vector seeds a
        // cluster and absorbs everything above the similarity threshold
        let threshold = config.connection_discovery_threshold;
        let mut assigned = vec![false; vectors.len()];
        let mut clusters: Vec<(String, Vec<NodeId>)> = Vec::new();

        for i in 0..vectors.len() {
            if assigned[i] {
                continue;
            }
            assigned[i] = true;
            let mut members = vec![vectors[i].0.clone()];
            for j in (i + 1)..vectors.len() {
                if assigned[j] {
                    continue;
                }
                let similarity =
                    crate::embeddings::cosine_similarity(&vectors[i].1, &vectors[j].1);
                if similarity >= threshold {
                    assigned[j] = true;
                    members.push(vectors[j].0.clone());
                }
            }
            if members.len() < 2 {
                continue;
            }
            let ids: Vec<NodeId> = members
                .into_iter()
                .filter_map(|id| NodeId::from_stored(id).ok())
                .collect();
            clusters.push((format!("cluster-{}", clusters.len() + 1), ids));
        }

        self.db()
            .replace_clusters(&clusters)
            .map_err(|e| internal(e.to_string()))?;
        tracing::info!(clusters = clusters.len(), "clustering pass");
        Ok(())
    }

    fn run_pattern_aggregation(&self) -> ExecutionResult {
        let config = self.config();

        // Salvaged nodes are excluded until reviewed
        let rows = self
            .db()
            .list_node_rows(&engram_index::NodeFilter {
                needs_review: Some(false),
                limit: 200,
                ..Default::default()
            })
            .map_err(|e| internal(e.to_string()))?;

        for row in &rows {
            let Ok(node) = self.store.load_json(Path::new(&row.json_path)) else {
                continue;
            };

            let mut db = self.db();
            for (bucket, lesson) in node.lessons.flattened() {
                let _ = db.observe_insight(
                    InsightType::Lesson,
                    (bucket == "model").then(|| node.classification.node_type.clone()).as_deref(),
                    None,
                    lesson,
                    &node.id,
                    0.4,
                    0.3,
                );
            }
            for error in &node.content.errors_seen {
                let _ = db.observe_insight(
                    InsightType::ToolError,
                    None,
                    node.content.tools_used.first().map(|t| t.as_str()),
                    error,
                    &node.id,
                    0.5,
                    0.5,
                );
            }
            for signal in &node.friction {
                if signal.score >= 0.5 {
                    let _ = db.observe_insight(
                        InsightType::Failure,
                        None,
                        None,
                        &signal.signal,
                        &node.id,
                        signal.score,
                        signal.score,
                    );
                }
            }
        }

        // Age-based retention rides along with the aggregation schedule
        match self.store.archive_aged(config.retention_archive_after_days) {
            Ok(archived) if archived > 0 => {
                tracing::info!(archived, "archived aged node versions");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "retention sweep failed"),
        }

        tracing::info!(nodes = rows.len(), "pattern aggregation pass");
        Ok(())
    }
}

/// The per-job JSON payload handed to the analyzer on stdin.
fn segment_payload(
    session: &ParsedSession,
    session_file: &str,
    segment: &Segment,
) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = segment
        .entries
        .iter()
        .map(|entry| {
            let (kind, text) = match &entry.payload {
                EntryPayload::Message { role, text } => (
                    match role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::ToolResult => "toolResult",
                    },
                    text.clone(),
                ),
                EntryPayload::Compaction { summary } => {
                    ("compaction", summary.clone().unwrap_or_default())
                }
                EntryPayload::BranchSummary { summary } => {
                    ("branchSummary", summary.clone().unwrap_or_default())
                }
                EntryPayload::Meta => ("meta", String::new()),
            };
            serde_json::json!({
                "id": entry.id,
                "parentId": entry.parent_id,
                "timestamp": entry.timestamp.to_rfc3339(),
                "kind": kind,
                "text": text,
            })
        })
        .collect();

    serde_json::json!({
        "sessionFile": session_file,
        "sessionId": session.header.id,
        "cwd": session.header.cwd,
        "boundary": segment.boundary_key,
        "entries": entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_segment_shape() {
        use chrono::Utc;
        use engram_session::{Entry, SessionHeader};

        let session = ParsedSession {
            header: SessionHeader {
                version: 1,
                id: "sess".to_string(),
                timestamp: Utc::now(),
                cwd: "/home/u/proj".to_string(),
                parent_session: None,
            },
            entries: vec![Entry {
                id: "e1".to_string(),
                parent_id: None,
                timestamp: Utc::now(),
                payload: EntryPayload::Message {
                    role: Role::User,
                    text: "hello".to_string(),
                },
            }],
            skipped_lines: 0,
        };
        let segments = split_segments(&session);
        let payload = segment_payload(&session, "/s/a.jsonl", &segments[0]);

        assert_eq!(payload["cwd"], "/home/u/proj");
        assert_eq!(payload["boundary"], "start");
        assert_eq!(payload["entries"][0]["kind"], "user");
        assert_eq!(payload["entries"][0]["text"], "hello");
    }
}
