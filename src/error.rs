//! Error types shared by the session, protocol, and evaluation layers.
//!
//! Every fallible operation in the library returns [`SessionError`]. The
//! first five variants are the failure categories callers are expected to
//! branch on; the remainder describe transport conditions of the async
//! implementation (a request abandoned on teardown, a child that exited
//! mid-call, an opt-in timeout).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The configured executable is missing or could not be spawned.
    #[error("Process unavailable at {}: {reason}", .path.display())]
    ProcessUnavailable {
        /// Executable path that was attempted
        path: PathBuf,
        /// Human readable cause
        reason: String,
    },

    /// A frame or payload could not be decoded.
    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    /// The interpreter wrote to its error stream during an evaluation.
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// An artifact could not be read from scratch space or written to storage.
    #[error("Artifact I/O error for {}: {source}", .path.display())]
    ArtifactIo {
        /// File that failed
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The environment snapshot was not valid JSON.
    #[error("Environment snapshot parse error: {0}")]
    EnvironmentParse(#[source] serde_json::Error),

    /// The language server answered with a JSON-RPC error object.
    #[error("Server error {code}: {message}")]
    Server {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
    },

    /// A pending request was rejected because its session went away.
    #[error("Request abandoned: {0}")]
    Abandoned(String),

    /// The child's output stream closed before the call completed.
    #[error("Process exited before the call completed")]
    ProcessExited,

    /// The call did not complete within the configured timeout.
    #[error("Timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Build a [`SessionError::ProcessUnavailable`] from any displayable cause.
    pub fn unavailable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SessionError::ProcessUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
