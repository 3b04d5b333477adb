//! Error types for testbridge

use thiserror::Error;

/// Result type alias using testbridge Error
pub type Result<T> = std::result::Result<T, Error>;

/// testbridge error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Pipe error: {0}")]
    Pipe(String),

    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Failed to write test ids file: {0}")]
    TestIdsFile(String),

    #[error("Runner process failed: {0}")]
    Process(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error was produced by a cancellation request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<crate::framing::FrameError> for Error {
    fn from(e: crate::framing::FrameError) -> Self {
        match e {
            crate::framing::FrameError::Io(io) => Error::Io(io),
            other => Error::Protocol(other.to_string()),
        }
    }
}
