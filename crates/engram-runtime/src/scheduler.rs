use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use engram_index::{Database, EnqueueRequest};
use engram_types::JobKind;

use crate::config::{Config, parse_cron};
use crate::prompts::PromptState;
use crate::queue::QueueService;
use crate::{Error, Result};

// The scheduler never executes work; each fire enqueues jobs and the worker
// pool does the rest. Missed fires while the daemon was down are not made
// up - the next scheduled instant after startup is used.

struct Producer {
    kind: JobKind,
    schedule: cron::Schedule,
    next_fire: DateTime<Utc>,
}

pub struct Scheduler {
    producers: Vec<Producer>,
    queue: Arc<QueueService>,
    db: Arc<Mutex<Database>>,
    config: Arc<RwLock<Config>>,
    prompt: PromptState,
}

impl Scheduler {
    pub fn new(
        queue: Arc<QueueService>,
        db: Arc<Mutex<Database>>,
        config: Arc<RwLock<Config>>,
        prompt: PromptState,
    ) -> Result<Self> {
        let producers = {
            let config = config.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            build_producers(&config)?
        };
        Ok(Self {
            producers,
            queue,
            db,
            config,
            prompt,
        })
    }

    /// Re-parse schedules after a config change.
    pub fn reload(&mut self) -> Result<()> {
        let config = self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.producers = build_producers(&config)?;
        Ok(())
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let Some(next) = self.producers.iter().map(|p| p.next_fire).min() else {
                return;
            };
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return,
            }

            let now = Utc::now();
            for i in 0..self.producers.len() {
                if self.producers[i].next_fire > now {
                    continue;
                }
                let kind = self.producers[i].kind;
                if let Err(e) = self.fire(kind) {
                    tracing::warn!(kind = kind.as_str(), error = %e, "scheduled producer failed");
                }
                if let Some(next_fire) = self.producers[i].schedule.after(&now).next() {
                    self.producers[i].next_fire = next_fire;
                }
            }
        }
    }

    fn fire(&self, kind: JobKind) -> Result<()> {
        let max_retries = self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .max_retries;

        match kind {
            JobKind::Reanalysis => {
                let current = self.prompt.label();
                let stale = self
                    .db
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .nodes_with_stale_prompt(&current, 50)?;

                for row in stale {
                    let request = EnqueueRequest {
                        kind: JobKind::Reanalysis,
                        session_file: Some(row.session_file),
                        segment_boundary: Some(row.segment_boundary),
                        max_retries,
                        prompt_version: Some(current.clone()),
                    };
                    if let Err(e) = self.queue.enqueue(&request) {
                        tracing::debug!(error = %e, "reanalysis enqueue skipped");
                    }
                }
                Ok(())
            }
            JobKind::ConnectionDiscovery
            | JobKind::EmbeddingBackfill
            | JobKind::Clustering
            | JobKind::PatternAggregation => {
                let request = EnqueueRequest {
                    kind,
                    session_file: None,
                    segment_boundary: None,
                    max_retries: 0,
                    prompt_version: None,
                };
                match self.queue.enqueue(&request) {
                    Ok(_) => Ok(()),
                    // Queue at capacity; the next scheduled fire retries
                    Err(Error::Index(engram_index::Error::QueueFull { .. })) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            JobKind::Initial => Ok(()),
        }
    }
}

fn build_producers(config: &Config) -> Result<Vec<Producer>> {
    let kinds = [
        JobKind::Reanalysis,
        JobKind::ConnectionDiscovery,
        JobKind::PatternAggregation,
        JobKind::Clustering,
        JobKind::EmbeddingBackfill,
    ];

    let now = Utc::now();
    let mut producers = Vec::new();
    for kind in kinds {
        let Some(expr) = config.schedule_for(kind) else {
            continue;
        };
        let schedule = parse_cron(expr)
            .map_err(|e| Error::Config(format!("schedule for {}: {}", kind.as_str(), e)))?;
        let Some(next_fire) = schedule.after(&now).next() else {
            continue;
        };
        producers.push(Producer {
            kind,
            schedule,
            next_fire,
        });
    }
    Ok(producers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn rig(config: Config) -> Scheduler {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let queue = Arc::new(QueueService::new(db.clone(), EventBus::new(), 100));
        let config = Arc::new(RwLock::new(config));
        let tmp = tempfile::TempDir::new().unwrap();
        let prompt_path = tmp.path().join("analysis.md");
        std::fs::write(&prompt_path, "analyze").unwrap();
        let prompt = crate::prompts::init_prompt_state(&db, &prompt_path, tmp.path()).unwrap();
        Scheduler::new(queue, db, config, prompt).unwrap()
    }

    #[test]
    fn producers_cover_all_scheduled_kinds() {
        let scheduler = rig(Config::default());
        assert_eq!(scheduler.producers.len(), 5);
        for producer in &scheduler.producers {
            assert!(producer.next_fire > Utc::now() - chrono::Duration::seconds(1));
        }
    }

    #[test]
    fn maintenance_fire_enqueues_one_unscoped_job() {
        let scheduler = rig(Config::default());
        scheduler.fire(JobKind::EmbeddingBackfill).unwrap();
        // Second fire dedups against the open row
        scheduler.fire(JobKind::EmbeddingBackfill).unwrap();

        let jobs = scheduler
            .db
            .lock()
            .unwrap()
            .list_jobs(&[engram_types::JobState::Pending], 10)
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::EmbeddingBackfill);
        assert!(jobs[0].session_file.is_none());
    }

    #[test]
    fn reanalysis_fire_targets_stale_nodes() {
        use engram_types::{
            Classification, Content, DaemonMeta, Lessons, Node, NodeId, NodeMetadata, Outcome,
            Semantic,
        };

        let scheduler = rig(Config::default());
        let node = Node {
            id: NodeId::derive("/s/a.jsonl", "start"),
            version: 1,
            classification: Classification {
                node_type: "feature".to_string(),
                project: "/p".to_string(),
                language: None,
                frameworks: vec![],
                had_clear_goal: false,
                is_new_project: false,
            },
            content: Content {
                summary: "old analysis".to_string(),
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
                source_session: "/s/a.jsonl".to_string(),
                source_boundary: "start".to_string(),
                // Committed under an older prompt than the current state
                prompt_version: "v0-00000000".to_string(),
                daemon_meta: DaemonMeta::default(),
            },
            friction: vec![],
        };
        scheduler
            .db
            .lock()
            .unwrap()
            .commit_node(&node, "/n/x.json")
            .unwrap();

        scheduler.fire(JobKind::Reanalysis).unwrap();

        let jobs = scheduler
            .db
            .lock()
            .unwrap()
            .list_jobs(&[engram_types::JobState::Pending], 10)
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Reanalysis);
        assert_eq!(jobs[0].session_file.as_deref(), Some("/s/a.jsonl"));
    }
}
