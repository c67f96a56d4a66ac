//! Opaque error categories (spec §7). Each binding maps these to its native form; the
//! core itself never terminates the process on an `Internal` error.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LslError>;

#[derive(Debug, thiserror::Error)]
pub enum LslError {
    /// An API call with a finite timeout expired before completion. Recoverable by retry.
    #[error("operation timed out")]
    Timeout,

    /// The stream's producer has disappeared and recovery is disabled or permanently failed.
    #[error("stream is lost")]
    Lost,

    /// Malformed input: wrong channel count, unknown format, invalid query, bad port, etc.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Unexpected runtime fault. The affected operation fails but the process must not die.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LslError {
    pub fn argument(msg: impl Into<String>) -> Self {
        LslError::Argument(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        LslError::Internal(msg.into())
    }
}

/// A category tag, useful for bindings that want to switch on the kind without
/// pattern-matching the full enum (e.g. a future C ABI layer, out of scope here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Lost,
    Argument,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Lost => "lost",
            ErrorKind::Argument => "argument",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl LslError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LslError::Timeout => ErrorKind::Timeout,
            LslError::Lost => ErrorKind::Lost,
            LslError::Argument(_) => ErrorKind::Argument,
            LslError::Internal(_) => ErrorKind::Internal,
            LslError::Io(_) => ErrorKind::Internal,
        }
    }
}
