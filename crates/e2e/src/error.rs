//! Error types for the fake runner harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("Invalid runner script: {0}")]
    Script(String),

    #[error("Pipe error: {0}")]
    Pipe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Protocol(#[from] testbridge_common::Error),

    #[error(transparent)]
    Frame(#[from] testbridge_common::FrameError),
}

pub type E2eResult<T> = Result<T, E2eError>;
