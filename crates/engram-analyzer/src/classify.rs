use std::time::Duration;

use engram_types::ErrorCategory;

/// Classification result: the retry category and the per-category retry
/// budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub category: ErrorCategory,
    pub max_retries: u32,
}

const PERMANENT_SIGNALS: &[&str] = &[
    "file not found",
    "no such file",
    "empty session",
    "malformed header",
    "malformed session header",
];

const RATE_LIMIT_SIGNALS: &[&str] = &["rate limit", "rate-limit", "429", "overloaded"];

const NETWORK_SIGNALS: &[&str] = &[
    "connection refused",
    "connect refused",
    "connection reset",
    "timed out",
    "network is unreachable",
    "dns error",
];

/// Map a failed invocation (stderr text, exit code, timeout flag) onto a
/// retry category.
pub fn classify_failure(stderr: &str, exit_code: Option<i32>, timed_out: bool) -> Classified {
    if timed_out {
        return Classified {
            category: ErrorCategory::Transient,
            max_retries: 3,
        };
    }

    let stderr = stderr.to_lowercase();

    if PERMANENT_SIGNALS.iter().any(|s| stderr.contains(s)) {
        return Classified {
            category: ErrorCategory::Permanent,
            max_retries: 0,
        };
    }

    if RATE_LIMIT_SIGNALS.iter().any(|s| stderr.contains(s)) {
        return Classified {
            category: ErrorCategory::Transient,
            max_retries: 5,
        };
    }

    if NETWORK_SIGNALS.iter().any(|s| stderr.contains(s)) {
        return Classified {
            category: ErrorCategory::Transient,
            max_retries: 3,
        };
    }

    let _ = exit_code;
    Classified {
        category: ErrorCategory::Unknown,
        max_retries: 2,
    }
}

/// Schema validation with nothing salvageable is always permanent.
pub fn schema_failure() -> Classified {
    Classified {
        category: ErrorCategory::Permanent,
        max_retries: 0,
    }
}

/// Exponential backoff with jitter, capped at `ceiling`.
pub fn backoff_delay(retry_count: u32, base: Duration, ceiling: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << retry_count.min(16));
    let capped = exp.min(ceiling);

    // Up to 25% jitter so synchronized retries fan out
    let jitter_range = capped.as_millis() as u64 / 4;
    let jitter = if jitter_range > 0 {
        rand::random_range(0..jitter_range)
    } else {
        0
    };
    capped + Duration::from_millis(jitter)
}
