//! testbridge Common Library
//!
//! Wire protocol shared by the host and runner-side tooling: the
//! Content-Length framing codec and the typed discovery/execution payloads.

pub mod error;
pub mod framing;
pub mod protocol;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use framing::{Frame, FrameCodec, FrameError};
pub use protocol::{
    CoveragePayload, DiscoveryPayload, ExecutionMessage, ExecutionPayload, FileCoverageMetrics,
    Outcome, PayloadStatus, RawTestNode, RpcEnvelope, TestOutcomeRecord,
};
pub use types::*;

/// testbridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default directory for pipe sockets and test-id files
pub fn default_runtime_dir() -> std::path::PathBuf {
    std::env::temp_dir()
}
