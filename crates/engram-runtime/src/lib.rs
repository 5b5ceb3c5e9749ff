// NOTE: engram Runtime Architecture
//
// Why a durable queue between extraction and analysis (not direct calls)?
// - Analyses cost minutes and real money; work must survive restart
// - Leases + a sweeper make worker crashes invisible to correctness
// - Retry policy lives on the job row, not in whoever happened to call
//
// Why per-session advisory locks at lease time?
// - Two workers analyzing segments of one session would race on the same
//   evolving file and produce interleaved node versions
// - The lock set is in-process: a single daemon owns the database
//
// Why the watcher never parses?
// - Parsing belongs to the extractor, where readiness and the size gate
//   live; the watcher only debounces (path, mtime, size) facts
//
// Why JSON files are written before the index commits?
// - The index is rebuildable; the JSON is canonical. An orphan file is
//   recoverable noise, an index row pointing nowhere is corruption.

mod error;

pub mod config;
pub mod connections;
pub mod daemon;
pub mod embeddings;
pub mod events;
pub mod execute;
pub mod extractor;
pub mod health;
pub mod prompts;
pub mod query;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod watcher;
pub mod workers;

pub use config::{Config, parse_cron, resolve_data_dir};
pub use connections::ConnectionDiscoverer;
pub use daemon::{Daemon, DaemonHandle};
pub use embeddings::{EmbeddingProvider, HttpEmbeddingProvider, cosine_similarity};
pub use error::{Error, Result};
pub use events::EventBus;
pub use execute::{ExecutionFailure, JobExecutor};
pub use extractor::Extractor;
pub use health::{CheckResult, any_fatal, resolve_binary, run_preflight};
pub use prompts::{PromptState, init_prompt_state, refresh_prompt_state, resolve_prompt_version};
pub use query::{QueryEngine, QueryOutcome, QueryRequest};
pub use queue::QueueService;
pub use scheduler::Scheduler;
pub use store::NodeStore;
pub use watcher::{FileChange, SessionWatcher};
pub use workers::WorkerPool;
