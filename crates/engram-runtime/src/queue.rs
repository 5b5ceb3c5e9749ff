use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use engram_index::{Database, EnqueueRequest, LeaseRequest};
use engram_types::{BusEvent, Job, JobKind, JobOutcome, JobState};

use crate::events::EventBus;
use crate::{Error, Result};

/// Queue facade over the index: adds the in-process per-session advisory
/// lock and queue-change broadcasting.
///
/// The advisory lock is what guarantees per-session serialization: the
/// database excludes locked sessions from lease selection, and the lock
/// table is held while leasing so two workers cannot race into the same
/// session file.
pub struct QueueService {
    db: Arc<Mutex<Database>>,
    bus: EventBus,
    cap: u64,
    /// session file -> worker currently holding it. Keyed by holder so a
    /// worker whose lease was reclaimed cannot release the new holder's
    /// lock when its stale completion is rejected.
    session_locks: Mutex<HashMap<String, String>>,
}

impl QueueService {
    pub fn new(db: Arc<Mutex<Database>>, bus: EventBus, cap: u64) -> Self {
        Self {
            db,
            bus,
            cap,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    fn db(&self) -> std::sync::MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.session_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, req: &EnqueueRequest) -> Result<i64> {
        let id = self.db().enqueue_job(req, self.cap)?;
        self.publish_counts();
        Ok(id)
    }

    /// Lease the next runnable job for `worker_id` and take the session
    /// lock for its session file, atomically with respect to other lessees.
    pub fn lease(
        &self,
        worker_id: &str,
        kinds: &[JobKind],
        lease_duration: chrono::Duration,
    ) -> Result<Option<Job>> {
        let mut locks = self.locks();
        // Sessions locked by someone else; a reclaimed job's session may
        // still be keyed to the previous holder, and re-leasing it is
        // exactly the takeover case
        let locked: Vec<String> = locks
            .iter()
            .filter(|(_, holder)| holder.as_str() != worker_id)
            .map(|(session, _)| session.clone())
            .collect();

        let leased = self.db().lease_job(&LeaseRequest {
            worker_id,
            kinds,
            lease_duration,
            locked_sessions: &locked,
        })?;

        if let Some(job) = &leased {
            if let Some(session) = &job.session_file {
                locks.insert(session.clone(), worker_id.to_string());
            }
            drop(locks);
            self.publish_counts();
        }
        Ok(leased)
    }

    pub fn extend(
        &self,
        job_id: i64,
        worker_id: &str,
        lease_duration: chrono::Duration,
    ) -> Result<()> {
        self.db()
            .extend_lease(job_id, worker_id, lease_duration)
            .map_err(Error::Index)
    }

    pub fn complete(
        &self,
        job: &Job,
        worker_id: &str,
        outcome: &JobOutcome,
        retry_delay: Option<chrono::Duration>,
    ) -> Result<JobState> {
        let result = self
            .db()
            .complete_job(job.id, worker_id, outcome, retry_delay);
        self.unlock_session(job, worker_id);
        self.publish_counts();
        result.map_err(Error::Index)
    }

    /// Orderly shutdown path: give the lease back untouched.
    pub fn release(&self, job: &Job, worker_id: &str) -> Result<()> {
        let result = self.db().release_job(job.id, worker_id);
        self.unlock_session(job, worker_id);
        self.publish_counts();
        result.map_err(Error::Index)
    }

    pub fn sweep(&self) -> Result<usize> {
        let swept = self.db().sweep_expired_leases()?;
        if swept > 0 {
            tracing::info!(swept, "reclaimed expired leases");
            self.publish_counts();
        }
        Ok(swept)
    }

    /// Widen the retry budget to a classified category's allowance.
    /// Best-effort; a failure here only narrows retries, never corrupts.
    pub fn raise_max_retries(&self, job_id: i64, to: u32) {
        if let Err(e) = self.db().raise_max_retries(job_id, to) {
            tracing::warn!(job = job_id, error = %e, "raise_max_retries failed");
        }
    }

    fn unlock_session(&self, job: &Job, worker_id: &str) {
        if let Some(session) = &job.session_file {
            let mut locks = self.locks();
            if locks.get(session).map(|holder| holder.as_str()) == Some(worker_id) {
                locks.remove(session);
            }
        }
    }

    pub fn counts(&self) -> Result<(u64, u64)> {
        let by_state = self.db().count_jobs_by_state()?;
        let mut pending = 0;
        let mut leased = 0;
        for (state, count) in by_state {
            match state {
                JobState::Pending => pending = count,
                JobState::Leased => leased = count,
                _ => {}
            }
        }
        Ok((pending, leased))
    }

    fn publish_counts(&self) {
        if let Ok((pending, leased)) = self.counts() {
            self.bus.publish(BusEvent::QueueChanged { pending, leased });
        }
    }
}
