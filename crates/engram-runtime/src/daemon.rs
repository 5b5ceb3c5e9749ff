use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use engram_analyzer::probe_skills;
use engram_index::Database;
use engram_types::{BusEvent, JobState};

use crate::config::Config;
use crate::connections::ConnectionDiscoverer;
use crate::embeddings::HttpEmbeddingProvider;
use crate::events::EventBus;
use crate::execute::JobExecutor;
use crate::extractor::Extractor;
use crate::health::CheckResult;
use crate::prompts::{PromptState, init_prompt_state, refresh_prompt_state};
use crate::query::QueryEngine;
use crate::queue::QueueService;
use crate::scheduler::Scheduler;
use crate::store::NodeStore;
use crate::watcher::SessionWatcher;
use crate::workers::WorkerPool;
use crate::{Error, Result};

/// Shared view of the running daemon for the HTTP surface and CLI.
pub struct DaemonHandle {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub config: Arc<RwLock<Config>>,
    pub db: Arc<Mutex<Database>>,
    pub store: Arc<NodeStore>,
    pub queue: Arc<QueueService>,
    pub bus: EventBus,
    pub prompt: PromptState,
    pub query: Arc<QueryEngine>,
    pub cancel: CancellationToken,
}

impl DaemonHandle {
    pub fn config_snapshot(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the configuration: validate, persist, swap, broadcast.
    pub fn update_config(&self, new: Config) -> Result<()> {
        new.validate()?;
        new.save_to(&self.config_path)?;
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new;
        self.bus.publish(BusEvent::ConfigChanged);
        Ok(())
    }

    pub async fn run_health_checks(&self, with_roundtrip: bool) -> Vec<CheckResult> {
        let config = self.config_snapshot();
        crate::health::run_preflight(
            &config,
            &self.data_dir,
            &self.db,
            with_roundtrip,
            &self.cancel,
        )
        .await
    }

    pub fn status(&self) -> Result<serde_json::Value> {
        let db = self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let nodes = db.count_nodes()?;
        let edges = db.count_edges()?;
        let embeddings = db.count_embeddings()?;
        let jobs = db.count_jobs_by_state()?;
        drop(db);

        let jobs_json: serde_json::Map<String, serde_json::Value> = jobs
            .into_iter()
            .map(|(state, count)| (state.as_str().to_string(), count.into()))
            .collect();

        Ok(serde_json::json!({
            "startedAt": self.started_at.to_rfc3339(),
            "uptimeSeconds": (Utc::now() - self.started_at).num_seconds(),
            "promptVersion": self.prompt.label(),
            "nodes": nodes,
            "edges": edges,
            "embeddings": embeddings,
            "jobs": jobs_json,
        }))
    }

    pub fn stats(&self) -> Result<serde_json::Value> {
        let db = self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let projects = db.project_summary()?;
        let failed = db.list_jobs(&[JobState::Failed], 20)?;
        drop(db);

        Ok(serde_json::json!({
            "projects": projects
                .into_iter()
                .map(|(project, count)| serde_json::json!({"project": project, "nodes": count}))
                .collect::<Vec<_>>(),
            "recentFailures": failed
                .into_iter()
                .map(|job| serde_json::json!({
                    "id": job.id,
                    "kind": job.kind.as_str(),
                    "error": job.last_error,
                    "category": job.error_category.map(|c| c.as_str()),
                }))
                .collect::<Vec<_>>(),
        }))
    }
}

/// The assembled daemon: all background tasks plus the shared handle.
pub struct Daemon {
    handle: Arc<DaemonHandle>,
    tasks: Vec<JoinHandle<()>>,
    _watcher: SessionWatcher,
}

impl Daemon {
    /// Wire and start every component. Preflight is the caller's duty
    /// (fatal checks abort before this runs); reconciliation and prompt
    /// resolution happen here because they need the opened store.
    pub async fn start(data_dir: PathBuf, config: Config, config_path: PathBuf) -> Result<Daemon> {
        config.validate()?;
        std::fs::create_dir_all(&data_dir)?;

        let cancel = CancellationToken::new();
        let bus = EventBus::new();
        let db = Arc::new(Mutex::new(Database::open(&data_dir.join("brain.db"))?));

        let store = Arc::new(NodeStore::new(
            data_dir.clone(),
            db.clone(),
            bus.clone(),
            config.retention_max_versions,
        ));
        let removed = store.reconcile_startup()?;
        if removed > 0 {
            tracing::info!(removed, "startup reconciliation removed orphan node files");
        }

        let prompt_path = config.prompt_path(&data_dir);
        let prompt = init_prompt_state(&db, &prompt_path, &data_dir)?;

        let skills_dir = config.skills_dir(&data_dir);
        let probe = probe_skills(
            &skills_dir,
            &config.analyzer_required_skills,
            &config.analyzer_optional_skills,
        );
        if probe.is_fatal() {
            return Err(Error::Config(format!(
                "required analyzer skills missing: {}",
                probe.missing_required.join(", ")
            )));
        }

        let shared_config = Arc::new(RwLock::new(config.clone()));
        let queue = Arc::new(QueueService::new(
            db.clone(),
            bus.clone(),
            config.max_queue_size,
        ));

        let embedder = Arc::new(HttpEmbeddingProvider::from_config(&config));
        let discoverer = Arc::new(ConnectionDiscoverer::new(
            db.clone(),
            store.clone(),
            config.connection_discovery_threshold,
            config.connection_discovery_min_file_overlap,
            chrono::Duration::days(config.connection_discovery_temporal_window_days as i64),
            chrono::Duration::hours(config.connection_discovery_cooldown_hours as i64),
        ));

        let executor = Arc::new(JobExecutor::new(
            db.clone(),
            store.clone(),
            shared_config.clone(),
            data_dir.clone(),
            prompt.clone(),
            discoverer,
            embedder.clone(),
            bus.clone(),
            probe.available.clone(),
        ));

        let query = Arc::new(QueryEngine::new(
            db.clone(),
            store.clone(),
            shared_config.clone(),
            data_dir.clone(),
            embedder,
        ));

        let mut tasks = Vec::new();

        // Watcher -> extractor pipeline
        let (watcher, mut changes) = SessionWatcher::start(
            config.session_roots(),
            std::time::Duration::from_millis(config.watch_debounce_ms),
            std::time::Duration::from_secs(config.watch_poll_interval_seconds),
            cancel.clone(),
        )?;
        let extractor = Extractor::new(
            db.clone(),
            queue.clone(),
            shared_config.clone(),
            prompt.clone(),
        );
        {
            let cancel = cancel.clone();
            let shared_config = shared_config.clone();
            let recheck = std::time::Duration::from_secs(config.watch_poll_interval_seconds.max(1));
            tasks.push(tokio::spawn(async move {
                // Readiness (idle, stability) is a function of elapsed time,
                // not just of change events: files the watcher reported are
                // re-evaluated on a timer until they age out.
                let mut tracked: std::collections::HashMap<PathBuf, crate::watcher::FileChange> =
                    std::collections::HashMap::new();
                let mut ticker = tokio::time::interval(recheck);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        change = changes.recv() => {
                            let Some(change) = change else { break };
                            if let Err(e) = extractor.process_change(&change) {
                                tracing::warn!(path = %change.path.display(), error = %e, "extraction failed");
                            }
                            tracked.insert(change.path.clone(), change);
                        }
                        _ = ticker.tick() => {
                            let horizon = {
                                let config = shared_config
                                    .read()
                                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                                config.idle_timeout() + chrono::Duration::minutes(5)
                            };
                            let now = Utc::now();
                            tracked.retain(|_, change| now - change.modified < horizon);

                            for change in tracked.values_mut() {
                                // Re-stat so stability reflects the real mtime
                                if let Ok(metadata) = change.path.metadata() {
                                    if let Ok(modified) = metadata.modified() {
                                        change.modified = modified.into();
                                    }
                                    change.size = metadata.len();
                                }
                                if let Err(e) = extractor.process_change(change) {
                                    tracing::debug!(path = %change.path.display(), error = %e, "re-extraction failed");
                                }
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            }));
        }

        // Worker pool + sweeper
        let pool = WorkerPool::spawn(
            queue.clone(),
            executor,
            bus.clone(),
            shared_config.clone(),
            cancel.clone(),
        );
        tasks.push(tokio::spawn(pool.join()));

        // Scheduler
        let scheduler = Scheduler::new(
            queue.clone(),
            db.clone(),
            shared_config.clone(),
            prompt.clone(),
        )?;
        tasks.push(tokio::spawn(scheduler.run(cancel.clone())));

        // Prompt file re-resolution rides the watcher cadence
        {
            let prompt = prompt.clone();
            let db = db.clone();
            let data_dir = data_dir.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
                        _ = cancel.cancelled() => break,
                    }
                    if let Err(e) = refresh_prompt_state(&prompt, &db, &prompt_path, &data_dir) {
                        tracing::debug!(error = %e, "prompt refresh failed");
                    }
                }
            }));
        }

        bus.publish(BusEvent::DaemonStatus {
            state: "running".to_string(),
            message: format!("engram daemon started, prompt {}", prompt.label()),
        });

        let handle = Arc::new(DaemonHandle {
            data_dir,
            config_path,
            started_at: Utc::now(),
            config: shared_config,
            db,
            store,
            queue,
            bus,
            prompt,
            query,
            cancel,
        });

        Ok(Daemon {
            handle,
            tasks,
            _watcher: watcher,
        })
    }

    pub fn handle(&self) -> Arc<DaemonHandle> {
        self.handle.clone()
    }

    /// Orderly shutdown: stop producing, cancel in-flight work (workers
    /// release leases), then wait out the drain grace.
    pub async fn shutdown(self) {
        let grace = std::time::Duration::from_secs(
            self.handle.config_snapshot().drain_grace_seconds,
        );

        self.handle.bus.publish(BusEvent::DaemonStatus {
            state: "stopping".to_string(),
            message: "shutdown requested".to_string(),
        });
        self.handle.cancel.cancel();

        let drain = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("drain grace expired; abandoning remaining tasks");
        }
    }
}
