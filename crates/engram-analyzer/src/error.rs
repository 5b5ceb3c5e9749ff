use std::fmt;
use std::path::PathBuf;

/// Result type for engram-analyzer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur when driving the analyzer subprocess
#[derive(Debug)]
pub enum Error {
    /// Analyzer binary missing or not executable
    MissingBinary(PathBuf),

    /// Spawning or waiting on the subprocess failed
    Spawn(std::io::Error),

    /// IO against the prompt file or payload failed
    Io(std::io::Error),

    /// Execution was cancelled by daemon shutdown; the caller releases the
    /// lease without classifying a failure
    Interrupted,

    /// Analyzer stdout did not contain a usable document
    InvalidOutput(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingBinary(path) => {
                write!(f, "Analyzer binary not found: {}", path.display())
            }
            Error::Spawn(err) => write!(f, "Failed to run analyzer: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Interrupted => write!(f, "Analyzer invocation interrupted by shutdown"),
            Error::InvalidOutput(msg) => write!(f, "Invalid analyzer output: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Spawn(err) | Error::Io(err) => Some(err),
            Error::MissingBinary(_) | Error::Interrupted | Error::InvalidOutput(_) => None,
        }
    }
}
