use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a queued job does when executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Initial,
    Reanalysis,
    ConnectionDiscovery,
    EmbeddingBackfill,
    Clustering,
    PatternAggregation,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Initial,
        JobKind::Reanalysis,
        JobKind::ConnectionDiscovery,
        JobKind::EmbeddingBackfill,
        JobKind::Clustering,
        JobKind::PatternAggregation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Initial => "initial",
            JobKind::Reanalysis => "reanalysis",
            JobKind::ConnectionDiscovery => "connection_discovery",
            JobKind::EmbeddingBackfill => "embedding_backfill",
            JobKind::Clustering => "clustering",
            JobKind::PatternAggregation => "pattern_aggregation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Lease ordering rank. Lower ranks are leased first; discovery and
    /// backfill only run when nothing above them is available.
    pub fn priority_rank(&self) -> u8 {
        match self {
            JobKind::Initial => 0,
            JobKind::Reanalysis => 1,
            JobKind::PatternAggregation => 2,
            JobKind::Clustering => 2,
            JobKind::ConnectionDiscovery => 3,
            JobKind::EmbeddingBackfill => 4,
        }
    }

    /// Kinds that invoke the analyzer subprocess and therefore target one
    /// specific session segment.
    pub fn is_analysis(&self) -> bool {
        matches!(self, JobKind::Initial | JobKind::Reanalysis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "leased" => Some(JobState::Leased),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Classified failure category driving retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Unknown,
    MaxRetries,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::MaxRetries => "max_retries",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(ErrorCategory::Transient),
            "permanent" => Some(ErrorCategory::Permanent),
            "unknown" => Some(ErrorCategory::Unknown),
            "max_retries" => Some(ErrorCategory::MaxRetries),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Unknown)
    }
}

/// How a worker finished a leased job
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded,
    Failed {
        category: ErrorCategory,
        message: String,
    },
    Cancelled,
}

/// Durable queue record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    pub session_file: Option<String>,
    pub segment_boundary: Option<String>,
    pub state: JobState,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub prompt_version: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in JobKind::ALL {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("nonsense"), None);
    }

    #[test]
    fn initial_outranks_everything() {
        for kind in JobKind::ALL {
            if kind != JobKind::Initial {
                assert!(JobKind::Initial.priority_rank() < kind.priority_rank());
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Leased.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn retryability_follows_category() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::Unknown.is_retryable());
        assert!(!ErrorCategory::Permanent.is_retryable());
        assert!(!ErrorCategory::MaxRetries.is_retryable());
    }
}
