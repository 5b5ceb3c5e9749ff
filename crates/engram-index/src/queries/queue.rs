use chrono::{Duration, Utc};
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use engram_types::{ErrorCategory, Job, JobKind, JobOutcome, JobState};

use crate::db::{Database, format_ts, parse_ts};
use crate::{Error, Result};

// NOTE: Lease Protocol
//
// A job row moves pending -> leased -> {succeeded, failed, cancelled}, or
// back to pending on sweep/retry/orderly release. Every transition that
// requires ownership re-checks (state = 'leased' AND worker_id = ? AND
// lease_expires_at >= now) inside the same transaction, so a worker whose
// lease was reclaimed cannot complete a job another worker now holds.
//
// retry_count only moves on classified failures. Lease expiry and orderly
// shutdown release the row without touching it.

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub kind: JobKind,
    pub session_file: Option<String>,
    pub segment_boundary: Option<String>,
    pub max_retries: u32,
    pub prompt_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LeaseRequest<'a> {
    pub worker_id: &'a str,
    pub kinds: &'a [JobKind],
    pub lease_duration: Duration,
    /// Session files currently held by other workers (advisory per-session
    /// serialization, enforced at lease time)
    pub locked_sessions: &'a [String],
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let kind: String = row.get("kind")?;
    let state: String = row.get("state")?;
    let category: Option<String> = row.get("error_category")?;
    Ok(Job {
        id: row.get("id")?,
        kind: JobKind::parse(&kind).unwrap_or(JobKind::Initial),
        session_file: row.get("session_file")?,
        segment_boundary: row.get("segment_boundary")?,
        state: JobState::parse(&state).unwrap_or(JobState::Pending),
        worker_id: row.get("worker_id")?,
        lease_expires_at: row
            .get::<_, Option<String>>("lease_expires_at")?
            .and_then(|s| parse_ts(&s)),
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        last_error: row.get("last_error")?,
        error_category: category.and_then(|c| ErrorCategory::parse(&c)),
        prompt_version: row.get("prompt_version")?,
        enqueued_at: row
            .get::<_, String>("enqueued_at")
            .map(|s| parse_ts(&s).unwrap_or_else(Utc::now))?,
        started_at: row
            .get::<_, Option<String>>("started_at")?
            .and_then(|s| parse_ts(&s)),
        completed_at: row
            .get::<_, Option<String>>("completed_at")?
            .and_then(|s| parse_ts(&s)),
    })
}

const JOB_COLUMNS: &str = "id, kind, session_file, segment_boundary, state, worker_id, \
     lease_expires_at, retry_count, max_retries, last_error, error_category, \
     prompt_version, enqueued_at, started_at, completed_at";

impl Database {
    /// Atomic insert. A conflicting non-terminal row wins and its id is
    /// returned; `QueueFull` is raised when pending work exceeds `cap`.
    pub fn enqueue_job(&mut self, req: &EnqueueRequest, cap: u64) -> Result<i64> {
        let tx = self.conn.transaction()?;

        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = 'pending'",
            [],
            |row| row.get(0),
        )?;
        let pending = pending as u64;
        if pending >= cap {
            return Err(Error::QueueFull { pending, cap });
        }

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE kind = ?1
                   AND ifnull(session_file, '') = ifnull(?2, '')
                   AND ifnull(segment_boundary, '') = ifnull(?3, '')
                   AND state IN ('pending', 'leased')",
                params![
                    req.kind.as_str(),
                    req.session_file,
                    req.segment_boundary
                ],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok(id);
        }

        tx.execute(
            "INSERT INTO jobs (kind, session_file, segment_boundary, state, max_retries,
                               prompt_version, enqueued_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
            params![
                req.kind.as_str(),
                req.session_file,
                req.segment_boundary,
                req.max_retries,
                req.prompt_version,
                format_ts(Utc::now()),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Atomically select and lease the oldest runnable job.
    ///
    /// Candidates are pending rows (or leased rows whose lease expired),
    /// past their retry backoff, of an accepted kind, and not targeting a
    /// locked session. Tie-break: kind priority, enqueue order, job id.
    pub fn lease_job(&mut self, req: &LeaseRequest<'_>) -> Result<Option<Job>> {
        if req.kinds.is_empty() {
            return Ok(None);
        }

        let now = format_ts(Utc::now());
        let expires = format_ts(Utc::now() + req.lease_duration);

        let kind_marks = vec!["?"; req.kinds.len()].join(", ");
        let mut sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (state = 'pending' OR (state = 'leased' AND lease_expires_at < ?))
               AND (not_before IS NULL OR not_before <= ?)
               AND kind IN ({kind_marks})"
        );
        let mut args: Vec<String> = vec![now.clone(), now.clone()];
        args.extend(req.kinds.iter().map(|k| k.as_str().to_string()));

        if !req.locked_sessions.is_empty() {
            let lock_marks = vec!["?"; req.locked_sessions.len()].join(", ");
            sql.push_str(&format!(
                " AND (session_file IS NULL OR session_file NOT IN ({lock_marks}))"
            ));
            args.extend(req.locked_sessions.iter().cloned());
        }

        sql.push_str(
            " ORDER BY CASE kind
                 WHEN 'initial' THEN 0
                 WHEN 'reanalysis' THEN 1
                 WHEN 'pattern_aggregation' THEN 2
                 WHEN 'clustering' THEN 2
                 WHEN 'connection_discovery' THEN 3
                 ELSE 4
               END, enqueued_at, id
             LIMIT 1",
        );

        let tx = self.conn.transaction()?;
        let candidate = tx
            .query_row(&sql, params_from_iter(args.iter()), job_from_row)
            .optional()?;

        let Some(mut job) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET state = 'leased', worker_id = ?1, lease_expires_at = ?2,
                             started_at = COALESCE(started_at, ?3)
             WHERE id = ?4",
            params![req.worker_id, expires, now, job.id],
        )?;
        tx.commit()?;

        job.state = JobState::Leased;
        job.worker_id = Some(req.worker_id.to_string());
        job.lease_expires_at = parse_ts(&expires);
        Ok(Some(job))
    }

    /// Extend a held lease. Rejected once the lease has expired - the job
    /// may already belong to someone else.
    pub fn extend_lease(
        &mut self,
        job_id: i64,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let updated = self.conn.execute(
            "UPDATE jobs SET lease_expires_at = ?1
             WHERE id = ?2 AND state = 'leased' AND worker_id = ?3 AND lease_expires_at >= ?4",
            params![
                format_ts(now + lease_duration),
                job_id,
                worker_id,
                format_ts(now)
            ],
        )?;
        if updated == 0 {
            return Err(Error::StaleLease { job_id });
        }
        Ok(())
    }

    /// Terminal (or retrying) transition out of `leased`. `retry_delay` is
    /// the backoff before a retried job becomes leasable again.
    pub fn complete_job(
        &mut self,
        job_id: i64,
        worker_id: &str,
        outcome: &JobOutcome,
        retry_delay: Option<Duration>,
    ) -> Result<JobState> {
        let now = Utc::now();
        let now_s = format_ts(now);
        let tx = self.conn.transaction()?;

        let held: Option<(u32, u32)> = tx
            .query_row(
                "SELECT retry_count, max_retries FROM jobs
                 WHERE id = ?1 AND state = 'leased' AND worker_id = ?2 AND lease_expires_at >= ?3",
                params![job_id, worker_id, now_s],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((retry_count, max_retries)) = held else {
            return Err(Error::StaleLease { job_id });
        };

        let final_state = match outcome {
            JobOutcome::Succeeded => {
                tx.execute(
                    "UPDATE jobs SET state = 'succeeded', completed_at = ?1, worker_id = NULL,
                                     lease_expires_at = NULL, last_error = NULL
                     WHERE id = ?2",
                    params![now_s, job_id],
                )?;
                JobState::Succeeded
            }
            JobOutcome::Cancelled => {
                tx.execute(
                    "UPDATE jobs SET state = 'cancelled', completed_at = ?1, worker_id = NULL,
                                     lease_expires_at = NULL
                     WHERE id = ?2",
                    params![now_s, job_id],
                )?;
                JobState::Cancelled
            }
            JobOutcome::Failed { category, message } => {
                let next_retry = retry_count + 1;
                if category.is_retryable() && next_retry <= max_retries {
                    let not_before =
                        format_ts(now + retry_delay.unwrap_or_else(Duration::zero));
                    tx.execute(
                        "UPDATE jobs SET state = 'pending', worker_id = NULL,
                                         lease_expires_at = NULL, retry_count = ?1,
                                         last_error = ?2, error_category = ?3, not_before = ?4
                         WHERE id = ?5",
                        params![next_retry, message, category.as_str(), not_before, job_id],
                    )?;
                    JobState::Pending
                } else {
                    let final_category = if category.is_retryable() {
                        ErrorCategory::MaxRetries
                    } else {
                        *category
                    };
                    tx.execute(
                        "UPDATE jobs SET state = 'failed', worker_id = NULL,
                                         lease_expires_at = NULL, retry_count = ?1,
                                         last_error = ?2, error_category = ?3, completed_at = ?4
                         WHERE id = ?5",
                        params![next_retry, message, final_category.as_str(), now_s, job_id],
                    )?;
                    JobState::Failed
                }
            }
        };

        tx.commit()?;
        Ok(final_state)
    }

    /// Widen a job's retry budget to the classified category's allowance.
    /// Only ever raises - a narrower classification never strands a job
    /// below retries it already earned.
    pub fn raise_max_retries(&mut self, job_id: i64, to: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET max_retries = ?1 WHERE id = ?2 AND max_retries < ?1",
            params![to, job_id],
        )?;
        Ok(())
    }

    /// Orderly release on shutdown: lease goes back to pending with no retry
    /// increment and no error record.
    pub fn release_job(&mut self, job_id: i64, worker_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET state = 'pending', worker_id = NULL, lease_expires_at = NULL
             WHERE id = ?1 AND state = 'leased' AND worker_id = ?2",
            params![job_id, worker_id],
        )?;
        Ok(())
    }

    /// Reclaim expired leases. Returns the number of jobs swept back to
    /// pending. Rows that already exhausted retries are closed out instead.
    pub fn sweep_expired_leases(&mut self) -> Result<usize> {
        let now_s = format_ts(Utc::now());
        let tx = self.conn.transaction()?;

        let _exhausted = tx.execute(
            "UPDATE jobs SET state = 'failed', worker_id = NULL, lease_expires_at = NULL,
                             error_category = 'max_retries', completed_at = ?1,
                             last_error = COALESCE(last_error, 'lease expired with retries exhausted')
             WHERE state = 'leased' AND lease_expires_at < ?1 AND retry_count >= max_retries
               AND retry_count > 0",
            params![now_s],
        )?;

        let swept = tx.execute(
            "UPDATE jobs SET state = 'pending', worker_id = NULL, lease_expires_at = NULL
             WHERE state = 'leased' AND lease_expires_at < ?1",
            params![now_s],
        )?;

        tx.commit()?;
        Ok(swept)
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        let job = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Open (non-terminal) job targeting a specific segment, if any.
    pub fn open_job_for_segment(
        &self,
        session_file: &str,
        segment_boundary: &str,
    ) -> Result<Option<Job>> {
        let job = self
            .conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE session_file = ?1 AND segment_boundary = ?2
                       AND state IN ('pending', 'leased')
                     LIMIT 1"
                ),
                params![session_file, segment_boundary],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn count_jobs_by_state(&self) -> Result<Vec<(JobState, u64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| {
                let state: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((state, count as u64))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(s, c)| JobState::parse(&s).map(|s| (s, c)))
            .collect())
    }

    pub fn list_jobs(&self, states: &[JobState], limit: usize) -> Result<Vec<Job>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let marks = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state IN ({marks})
             ORDER BY enqueued_at DESC, id DESC LIMIT {limit}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(
                params_from_iter(states.iter().map(|s| s.as_str())),
                job_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(kind: JobKind, session: &str, boundary: &str) -> EnqueueRequest {
        EnqueueRequest {
            kind,
            session_file: Some(session.to_string()),
            segment_boundary: Some(boundary.to_string()),
            max_retries: 3,
            prompt_version: Some("v1-deadbeef".to_string()),
        }
    }

    fn lease_req<'a>(worker: &'a str, kinds: &'a [JobKind]) -> LeaseRequest<'a> {
        LeaseRequest {
            worker_id: worker,
            kinds,
            lease_duration: Duration::minutes(5),
            locked_sessions: &[],
        }
    }

    #[test]
    fn enqueue_is_idempotent_per_open_segment() {
        let mut db = Database::open_in_memory().unwrap();
        let first = db
            .enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 100)
            .unwrap();
        let second = db
            .enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 100)
            .unwrap();
        assert_eq!(first, second);

        // Different kind targeting the same segment is a distinct row
        let third = db
            .enqueue_job(&req(JobKind::Reanalysis, "/s/a.jsonl", "start"), 100)
            .unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn queue_full_is_rejected() {
        let mut db = Database::open_in_memory().unwrap();
        db.enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 1)
            .unwrap();
        let err = db
            .enqueue_job(&req(JobKind::Initial, "/s/b.jsonl", "start"), 1)
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull { .. }));
    }

    #[test]
    fn lease_marks_ownership() {
        let mut db = Database::open_in_memory().unwrap();
        let id = db
            .enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 100)
            .unwrap();

        let kinds = [JobKind::Initial];
        let job = db.lease_job(&lease_req("w1", &kinds)).unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Leased);

        // Held lease is invisible to a second worker
        let none = db.lease_job(&lease_req("w2", &kinds)).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn lease_respects_session_locks() {
        let mut db = Database::open_in_memory().unwrap();
        db.enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 100)
            .unwrap();

        let kinds = [JobKind::Initial];
        let locked = vec!["/s/a.jsonl".to_string()];
        let none = db
            .lease_job(&LeaseRequest {
                worker_id: "w1",
                kinds: &kinds,
                lease_duration: Duration::minutes(5),
                locked_sessions: &locked,
            })
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn initial_preempts_reanalysis() {
        let mut db = Database::open_in_memory().unwrap();
        // Reanalysis enqueued first, initial second
        db.enqueue_job(&req(JobKind::Reanalysis, "/s/a.jsonl", "start"), 100)
            .unwrap();
        let initial = db
            .enqueue_job(&req(JobKind::Initial, "/s/b.jsonl", "start"), 100)
            .unwrap();

        let kinds = [JobKind::Initial, JobKind::Reanalysis];
        let job = db.lease_job(&lease_req("w1", &kinds)).unwrap().unwrap();
        assert_eq!(job.id, initial);
    }

    #[test]
    fn fifo_within_kind() {
        let mut db = Database::open_in_memory().unwrap();
        let first = db
            .enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 100)
            .unwrap();
        db.enqueue_job(&req(JobKind::Initial, "/s/b.jsonl", "start"), 100)
            .unwrap();

        let kinds = [JobKind::Initial];
        let job = db.lease_job(&lease_req("w1", &kinds)).unwrap().unwrap();
        assert_eq!(job.id, first);
    }

    #[test]
    fn stale_complete_is_rejected_after_sweep() {
        let mut db = Database::open_in_memory().unwrap();
        db.enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 100)
            .unwrap();

        let kinds = [JobKind::Initial];
        // Negative lease duration: expires immediately
        let job = db
            .lease_job(&LeaseRequest {
                worker_id: "w1",
                kinds: &kinds,
                lease_duration: Duration::seconds(-1),
                locked_sessions: &[],
            })
            .unwrap()
            .unwrap();

        assert_eq!(db.sweep_expired_leases().unwrap(), 1);

        // Another worker re-leases
        let stolen = db.lease_job(&lease_req("w2", &kinds)).unwrap().unwrap();
        assert_eq!(stolen.id, job.id);

        // First worker's complete must be rejected
        let err = db
            .complete_job(job.id, "w1", &JobOutcome::Succeeded, None)
            .unwrap_err();
        assert!(matches!(err, Error::StaleLease { .. }));

        // Second worker's complete goes through
        let state = db
            .complete_job(stolen.id, "w2", &JobOutcome::Succeeded, None)
            .unwrap();
        assert_eq!(state, JobState::Succeeded);
    }

    #[test]
    fn sweep_does_not_touch_retry_count() {
        let mut db = Database::open_in_memory().unwrap();
        db.enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 100)
            .unwrap();

        let kinds = [JobKind::Initial];
        let job = db
            .lease_job(&LeaseRequest {
                worker_id: "w1",
                kinds: &kinds,
                lease_duration: Duration::seconds(-1),
                locked_sessions: &[],
            })
            .unwrap()
            .unwrap();
        db.sweep_expired_leases().unwrap();

        let swept = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(swept.state, JobState::Pending);
        assert_eq!(swept.retry_count, 0);
    }

    #[test]
    fn failed_retryable_goes_back_to_pending_with_backoff() {
        let mut db = Database::open_in_memory().unwrap();
        let id = db
            .enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 100)
            .unwrap();

        let kinds = [JobKind::Initial];
        db.lease_job(&lease_req("w1", &kinds)).unwrap().unwrap();
        let state = db
            .complete_job(
                id,
                "w1",
                &JobOutcome::Failed {
                    category: ErrorCategory::Transient,
                    message: "rate limited".to_string(),
                },
                Some(Duration::minutes(10)),
            )
            .unwrap();
        assert_eq!(state, JobState::Pending);

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.retry_count, 1);

        // Backoff makes it invisible to an immediate lease
        let none = db.lease_job(&lease_req("w1", &kinds)).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn permanent_failure_is_terminal() {
        let mut db = Database::open_in_memory().unwrap();
        let id = db
            .enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 100)
            .unwrap();

        let kinds = [JobKind::Initial];
        db.lease_job(&lease_req("w1", &kinds)).unwrap().unwrap();
        let state = db
            .complete_job(
                id,
                "w1",
                &JobOutcome::Failed {
                    category: ErrorCategory::Permanent,
                    message: "malformed header".to_string(),
                },
                None,
            )
            .unwrap();
        assert_eq!(state, JobState::Failed);

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.error_category, Some(ErrorCategory::Permanent));
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn retries_exhaust_to_max_retries_category() {
        let mut db = Database::open_in_memory().unwrap();
        let id = db
            .enqueue_job(
                &EnqueueRequest {
                    max_retries: 1,
                    ..req(JobKind::Initial, "/s/a.jsonl", "start")
                },
                100,
            )
            .unwrap();

        let kinds = [JobKind::Initial];
        let fail = JobOutcome::Failed {
            category: ErrorCategory::Transient,
            message: "timeout".to_string(),
        };

        db.lease_job(&lease_req("w1", &kinds)).unwrap().unwrap();
        assert_eq!(
            db.complete_job(id, "w1", &fail, None).unwrap(),
            JobState::Pending
        );
        db.lease_job(&lease_req("w1", &kinds)).unwrap().unwrap();
        assert_eq!(
            db.complete_job(id, "w1", &fail, None).unwrap(),
            JobState::Failed
        );

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.error_category, Some(ErrorCategory::MaxRetries));
        assert_eq!(job.retry_count, 2);
    }

    #[test]
    fn release_returns_job_without_penalty() {
        let mut db = Database::open_in_memory().unwrap();
        let id = db
            .enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 100)
            .unwrap();

        let kinds = [JobKind::Initial];
        db.lease_job(&lease_req("w1", &kinds)).unwrap().unwrap();
        db.release_job(id, "w1").unwrap();

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.error_category.is_none());
    }

    #[test]
    fn retries_preserve_job_id() {
        let mut db = Database::open_in_memory().unwrap();
        let id = db
            .enqueue_job(&req(JobKind::Initial, "/s/a.jsonl", "start"), 100)
            .unwrap();

        let kinds = [JobKind::Initial];
        db.lease_job(&lease_req("w1", &kinds)).unwrap().unwrap();
        db.complete_job(
            id,
            "w1",
            &JobOutcome::Failed {
                category: ErrorCategory::Transient,
                message: "connect refused".to_string(),
            },
            None,
        )
        .unwrap();

        let retried = db.lease_job(&lease_req("w2", &kinds)).unwrap().unwrap();
        assert_eq!(retried.id, id);
        assert_eq!(retried.retry_count, 1);
    }
}
