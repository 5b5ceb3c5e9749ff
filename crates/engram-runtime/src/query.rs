use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use engram_analyzer::{AnalyzerConfig, Invocation, QueryAnswer, invoke, parse_query_answer};
use engram_index::{Database, NodeRow};
use engram_types::NodeId;

use crate::config::Config;
use crate::embeddings::{EmbeddingProvider, cosine_similarity};
use crate::health::resolve_binary;
use crate::store::NodeStore;
use crate::{Error, Result};

/// Free-form question over the knowledge graph. Bypasses the job queue:
/// synchronous, own timeout, never writes the store.
pub struct QueryEngine {
    db: Arc<Mutex<Database>>,
    store: Arc<NodeStore>,
    config: Arc<RwLock<Config>>,
    data_dir: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub question: String,
    pub project: Option<String>,
    pub limit: usize,
}

#[derive(Debug)]
pub struct QueryOutcome {
    pub answer: QueryAnswer,
    pub sources: Vec<NodeRow>,
}

impl QueryEngine {
    pub fn new(
        db: Arc<Mutex<Database>>,
        store: Arc<NodeStore>,
        config: Arc<RwLock<Config>>,
        data_dir: PathBuf,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            db,
            store,
            config,
            data_dir,
            embedder,
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

    /// Candidate nodes: FTS hits merged with semantic neighbors of the
    /// question embedding, deduplicated, FTS first.
    async fn collect_candidates(&self, req: &QueryRequest, config: &Config) -> Result<Vec<NodeRow>> {
        let limit = if req.limit == 0 { 8 } else { req.limit };
        let mut rows: Vec<NodeRow> = self
            .db()
            .search_nodes_in_project(&req.question, req.project.as_deref(), limit)?
            .into_iter()
            .map(|hit| hit.row)
            .collect();

        // Semantic search is additive and best-effort; a dead embedding
        // provider degrades the query to FTS only
        if let Ok(question_vector) = self.embedder.embed(&req.question).await {
            let exclude = NodeId::derive("query", "none");
            let peers = self
                .db()
                .embeddings_for_model(self.embedder.model(), &exclude)?;
            let mut scored: Vec<(String, f64)> = peers
                .into_iter()
                .map(|(id, vector)| (id, cosine_similarity(&question_vector, &vector)))
                .filter(|(_, s)| *s >= config.semantic_search_threshold)
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            for (id, _) in scored.into_iter().take(limit) {
                if rows.iter().any(|r| r.id == id) {
                    continue;
                }
                let Ok(node_id) = NodeId::from_stored(id) else {
                    continue;
                };
                if let Some(row) = self.db().get_node_row(&node_id)? {
                    if req.project.as_deref().is_none_or(|p| p == row.project) {
                        rows.push(row);
                    }
                }
            }
        }

        rows.truncate(limit * 2);
        Ok(rows)
    }

    /// Assemble the bounded context document, spending the token budget on
    /// summaries, decisions and lessons of the top candidates.
    fn assemble_context(&self, rows: &[NodeRow], token_budget: usize) -> (serde_json::Value, Vec<NodeRow>) {
        let mut spent = 0usize;
        let mut entries = Vec::new();
        let mut used = Vec::new();

        for row in rows {
            let Ok(node) = self.store.load_json(Path::new(&row.json_path)) else {
                continue;
            };
            let lessons: Vec<String> = node
                .lessons
                .flattened()
                .into_iter()
                .map(|(bucket, lesson)| format!("[{}] {}", bucket, lesson))
                .collect();

            let entry = serde_json::json!({
                "id": row.id,
                "project": row.project,
                "timestamp": row.timestamp,
                "outcome": row.outcome,
                "summary": node.content.summary,
                "keyDecisions": node.content.key_decisions,
                "lessons": lessons,
            });

            let cost = entry.to_string().chars().count() / 4;
            if spent + cost > token_budget && !entries.is_empty() {
                break;
            }
            spent += cost;
            entries.push(entry);
            used.push(row.clone());
        }

        (serde_json::Value::Array(entries), used)
    }

    pub async fn query(&self, req: &QueryRequest, cancel: &CancellationToken) -> Result<QueryOutcome> {
        let config = self.config();

        let candidates = self.collect_candidates(req, &config).await?;
        let (context, used) = self.assemble_context(&candidates, config.query_context_tokens);

        let binary = resolve_binary(&config.analyzer_binary).ok_or_else(|| {
            Error::InvalidOperation(format!("analyzer binary '{}' not found", config.analyzer_binary))
        })?;

        let query_prompt = config.query_prompt(&self.data_dir);
        if !query_prompt.exists() {
            if let Some(parent) = query_prompt.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&query_prompt, DEFAULT_QUERY_PROMPT)?;
        }

        let analyzer = AnalyzerConfig {
            binary,
            provider: config.analyzer_provider.clone(),
            model: config.query_model.clone(),
            system_prompt_path: query_prompt,
            skills: Vec::new(),
        };
        let invocation = Invocation {
            instructions: "Answer the question from the provided knowledge nodes. Emit JSON \
                           {answer, summary, confidence, sources}."
                .to_string(),
            payload: serde_json::json!({
                "question": req.question,
                "context": context,
            }),
            timeout: config.query_timeout(),
            term_grace: Duration::from_secs(5),
        };

        let raw = invoke(&analyzer, &invocation, cancel).await?;
        if !raw.succeeded() {
            return Err(Error::InvalidOperation(format!(
                "query analyzer exited {:?}: {}",
                raw.exit_code,
                raw.stderr.lines().next().unwrap_or("")
            )));
        }
        let answer = parse_query_answer(&raw.stdout)?;

        // Prefer the sources the model cited, falling back to the context
        let mut sources: Vec<NodeRow> = Vec::new();
        for cited in &answer.sources {
            if let Some(row) = used.iter().find(|r| &r.id == cited) {
                sources.push(row.clone());
            }
        }
        if sources.is_empty() {
            sources = used;
        }

        Ok(QueryOutcome { answer, sources })
    }
}

const DEFAULT_QUERY_PROMPT: &str = "\
You answer questions about past coding work using only the knowledge nodes
provided on stdin. Cite node ids in `sources`. If the context does not
contain the answer, say so with low confidence.
";

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;

    struct NullEmbedder;

    impl EmbeddingProvider for NullEmbedder {
        fn model(&self) -> &str {
            "null"
        }
        fn embed<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Result<Vec<f32>>> {
            Box::pin(async { Err(Error::Embedding("offline".to_string())) })
        }
    }

    #[tokio::test]
    async fn context_assembly_respects_budget() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let store = Arc::new(NodeStore::new(
            tmp.path().to_path_buf(),
            db.clone(),
            crate::events::EventBus::new(),
            5,
        ));

        use engram_types::{
            Classification, Content, DaemonMeta, Lessons, Node, NodeMetadata, Outcome, Semantic,
        };
        let mut rows = Vec::new();
        for i in 0..5 {
            let session = format!("/s/{}.jsonl", i);
            let mut node = Node {
                id: NodeId::derive(&session, "start"),
                version: 0,
                classification: Classification {
                    node_type: "feature".to_string(),
                    project: "/p".to_string(),
                    language: None,
                    frameworks: vec![],
                    had_clear_goal: true,
                    is_new_project: false,
                },
                content: Content {
                    summary: "x".repeat(400),
                    outcome: Outcome::Success,
                    key_decisions: vec![],
                    files_touched: vec![],
                    tools_used: vec![],
                    errors_seen: vec![],
                },
                lessons: Lessons::default(),
                semantic: Semantic::default(),
                metadata: NodeMetadata {
                    timestamp: chrono::Utc::now(),
                    source_session: session.clone(),
                    source_boundary: "start".to_string(),
                    prompt_version: "v1-deadbeef".to_string(),
                    daemon_meta: DaemonMeta::default(),
                },
                friction: vec![],
            };
            store.write(&mut node).unwrap();
            rows.push(db.lock().unwrap().get_node_row(&node.id).unwrap().unwrap());
        }

        let engine = QueryEngine::new(
            db,
            store,
            Arc::new(RwLock::new(Config::default())),
            tmp.path().to_path_buf(),
            Arc::new(NullEmbedder),
        );

        // ~150 tokens per entry; a 300-token budget fits only a couple
        let (context, used) = engine.assemble_context(&rows, 300);
        assert!(used.len() < rows.len());
        assert!(!used.is_empty());
        assert_eq!(context.as_array().unwrap().len(), used.len());
    }
}
