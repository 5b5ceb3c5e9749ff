use std::fmt;

/// Result type for engram-runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the runtime layer
#[derive(Debug)]
pub enum Error {
    /// Index/database layer error
    Index(engram_index::Error),

    /// Session parsing error
    Session(engram_session::Error),

    /// Analyzer invocation error
    Analyzer(engram_analyzer::Error),

    /// IO operation failed
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Embedding provider error
    Embedding(String),

    /// Invalid operation or state
    InvalidOperation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Index(err) => write!(f, "Index error: {}", err),
            Error::Session(err) => write!(f, "Session error: {}", err),
            Error::Analyzer(err) => write!(f, "Analyzer error: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Embedding(msg) => write!(f, "Embedding provider error: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Index(err) => Some(err),
            Error::Session(err) => Some(err),
            Error::Analyzer(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Config(_) | Error::Embedding(_) | Error::InvalidOperation(_) => None,
        }
    }
}

impl From<engram_index::Error> for Error {
    fn from(err: engram_index::Error) -> Self {
        Error::Index(err)
    }
}

impl From<engram_session::Error> for Error {
    fn from(err: engram_session::Error) -> Self {
        Error::Session(err)
    }
}

impl From<engram_analyzer::Error> for Error {
    fn from(err: engram_analyzer::Error) -> Self {
        Error::Analyzer(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}
