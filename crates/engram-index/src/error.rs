use std::fmt;

/// Result type for engram-index operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the index layer
#[derive(Debug)]
pub enum Error {
    /// Database operation failed
    Database(rusqlite::Error),

    /// IO operation failed
    Io(std::io::Error),

    /// Query-specific error (invalid input, not found, etc.)
    Query(String),

    /// Queue insert rejected: pending count exceeds the configured cap
    QueueFull { pending: u64, cap: u64 },

    /// A lease operation was attempted by a worker that no longer holds the
    /// lease (expired or reclaimed by sweep)
    StaleLease { job_id: i64 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Database(err) => write!(f, "Database error: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Query(msg) => write!(f, "Query error: {}", msg),
            Error::QueueFull { pending, cap } => {
                write!(f, "Queue full: {} pending jobs (cap {})", pending, cap)
            }
            Error::StaleLease { job_id } => {
                write!(f, "Stale lease on job {}", job_id)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Query(_) | Error::QueueFull { .. } | Error::StaleLease { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
