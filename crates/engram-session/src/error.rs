use std::fmt;
use std::path::PathBuf;

/// Result type for engram-session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while reading session files
#[derive(Debug)]
pub enum Error {
    /// IO operation failed
    Io(std::io::Error),

    /// File exists but contains no records
    EmptySession(PathBuf),

    /// First record is missing or is not a session header
    MalformedHeader { path: PathBuf, detail: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::EmptySession(path) => write!(f, "Empty session file: {}", path.display()),
            Error::MalformedHeader { path, detail } => {
                write!(f, "Malformed session header in {}: {}", path.display(), detail)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::EmptySession(_) | Error::MalformedHeader { .. } => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
