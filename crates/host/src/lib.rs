//! testbridge host
//!
//! Launches out-of-process test runners, receives their results over a
//! per-request pipe, and reconciles them into a per-workspace test tree.
//!
//! ```text
//!  WorkspaceTestAdapter ── discover_tests / execute_tests (coalesced)
//!        │
//!        ├── DiscoveryAdapter ──┐
//!        └── ExecutionAdapter ──┤  one ExecutionInstance per batch
//!                               │
//!             spawn runner ─────┼──── TEST_RUN_PIPE ────► pipe (Unix socket)
//!                               │                           │ Content-Length frames
//!             supervise (exit / │                           ▼
//!             cancel / output)  │                     ResultResolver
//!                               │                           │
//!                               └────────────────────► reconciler ──► TestTree
//!                                                            TestRun
//! ```

pub mod config;
pub mod deferred;
pub mod discovery;
pub mod execution;
pub mod framework;
pub mod instance;
pub mod pipe;
pub mod process;
pub mod reconciler;
pub mod resolver;
pub mod run;
pub mod telemetry;
pub mod tree;
pub mod workspace;

pub use config::{HostConfig, SettingsProvider, StaticSettings, TestingSettings};
pub use deferred::Deferred;
pub use discovery::{DiscoveryAdapter, TestDiscoveryAdapter};
pub use execution::{ExecutionAdapter, TestExecutionAdapter};
pub use framework::{RunProfile, RunnerSetup};
pub use instance::ExecutionInstance;
pub use pipe::{drain_pipe, start_pipe, PipeHandle, PipeNamer, PipeOptions};
pub use process::{
    CommandSpawner, OutputSink, ProcessHandle, ProcessSpawner, RunnerCommand, TracingOutput,
};
pub use resolver::ResultResolver;
pub use run::{FileCoverage, RunSummary, TestResult, TestRun, TestState};
pub use telemetry::{TelemetryEvent, TelemetrySink, TracingTelemetry};
pub use tree::{EntityKind, SharedTestTree, TestEntity, TestTree};
pub use workspace::{SharedResult, WorkspaceTestAdapter};
