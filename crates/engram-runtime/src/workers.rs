use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use engram_analyzer::backoff_delay;
use engram_types::{BusEvent, Job, JobKind, JobOutcome};

use crate::config::Config;
use crate::events::EventBus;
use crate::execute::{ExecutionFailure, JobExecutor};
use crate::queue::QueueService;

const IDLE_POLL: Duration = Duration::from_secs(1);

/// Bounded set of workers, each looping lease -> execute -> complete, plus
/// a sweeper reclaiming abandoned leases at a sub-lease interval.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        queue: Arc<QueueService>,
        executor: Arc<JobExecutor>,
        bus: EventBus,
        config: Arc<RwLock<Config>>,
        cancel: CancellationToken,
    ) -> Self {
        let count = config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .parallel_workers
            .max(1);

        let mut handles = Vec::new();
        for i in 0..count {
            let worker_id = format!("worker-{}-{}", i, uuid::Uuid::new_v4().simple());
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                queue.clone(),
                executor.clone(),
                bus.clone(),
                config.clone(),
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(sweeper_loop(
            queue.clone(),
            config.clone(),
            cancel.clone(),
        )));

        Self { handles }
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker_id: String,
    queue: Arc<QueueService>,
    executor: Arc<JobExecutor>,
    bus: EventBus,
    config: Arc<RwLock<Config>>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker = %worker_id, "worker started");

    while !cancel.is_cancelled() {
        let lease_duration = config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .lease_duration();

        let job = match queue.lease(&worker_id, &JobKind::ALL, lease_duration) {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                    _ = cancel.cancelled() => break,
                }
            }
            Err(e) => {
                tracing::warn!(worker = %worker_id, error = %e, "lease failed");
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                    _ = cancel.cancelled() => break,
                }
            }
        };

        process_job(&worker_id, &job, &queue, &executor, &bus, &config, &cancel).await;
    }

    tracing::debug!(worker = %worker_id, "worker stopped");
}

async fn process_job(
    worker_id: &str,
    job: &Job,
    queue: &Arc<QueueService>,
    executor: &Arc<JobExecutor>,
    bus: &EventBus,
    config: &Arc<RwLock<Config>>,
    cancel: &CancellationToken,
) {
    tracing::info!(worker = %worker_id, job = job.id, kind = job.kind.as_str(), "executing");

    if job.kind.is_analysis()
        && let Some(session) = &job.session_file
    {
        bus.publish(BusEvent::AnalysisStarted {
            job_id: job.id,
            session_file: session.clone(),
        });
    }

    let (lease_duration, base_delay, delay_cap) = {
        let config = config.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        (
            config.lease_duration(),
            config.retry_base_delay(),
            config.retry_delay_cap(),
        )
    };

    // Heartbeat lease extension at half-lease cadence while the job runs
    let heartbeat = lease_duration
        .to_std()
        .map(|d| d / 2)
        .unwrap_or(Duration::from_secs(300));

    let execution = executor.execute(job, cancel);
    tokio::pin!(execution);

    let result = loop {
        tokio::select! {
            result = &mut execution => break result,
            _ = tokio::time::sleep(heartbeat) => {
                if let Err(e) = queue.extend(job.id, worker_id, lease_duration) {
                    // Lease lost: sweep reclaimed us. Stop renewing; the
                    // final complete() will be rejected as stale.
                    tracing::warn!(job = job.id, error = %e, "lease extension failed");
                }
            }
        }
    };

    match result {
        Ok(()) => {
            if let Err(e) = queue.complete(job, worker_id, &JobOutcome::Succeeded, None) {
                tracing::warn!(job = job.id, error = %e, "completion rejected");
            }
        }
        Err(ExecutionFailure::Interrupted) => {
            // Orderly shutdown: partial output is discarded and the job
            // returns to pending for a future daemon
            if let Err(e) = queue.release(job, worker_id) {
                tracing::warn!(job = job.id, error = %e, "release failed");
            }
        }
        Err(ExecutionFailure::Classified {
            classified,
            message,
        }) => {
            tracing::warn!(
                job = job.id,
                category = classified.category.as_str(),
                message = %message,
                "job failed"
            );
            queue.raise_max_retries(job.id, classified.max_retries);

            let delay = backoff_delay(job.retry_count, base_delay, delay_cap);
            let outcome = JobOutcome::Failed {
                category: classified.category,
                message: message.clone(),
            };
            match queue.complete(
                job,
                worker_id,
                &outcome,
                Some(chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60))),
            ) {
                Ok(_) => {
                    bus.publish(BusEvent::AnalysisFailed {
                        job_id: job.id,
                        category: classified.category,
                        message,
                    });
                }
                Err(e) => tracing::warn!(job = job.id, error = %e, "failure record rejected"),
            }
        }
    }
}

async fn sweeper_loop(
    queue: Arc<QueueService>,
    config: Arc<RwLock<Config>>,
    cancel: CancellationToken,
) {
    loop {
        let interval = {
            let config = config.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            config
                .lease_duration()
                .to_std()
                .map(|d| d / 3)
                .unwrap_or(Duration::from_secs(300))
        };

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return,
        }

        if let Err(e) = queue.sweep() {
            tracing::warn!(error = %e, "sweep failed");
        }
    }
}
