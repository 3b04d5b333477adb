//! testbridge end-to-end harness
//!
//! Drives the real host stack (pipes, process supervision, reconciliation)
//! against `fake-runner`, a small binary that plays the part of the Python
//! runner plugins. What the fake runner does is described by a
//! [`RunnerScript`] passed through the environment.
//!
//! ```text
//! ┌──────────────────────────┐   spawn (program swapped)   ┌──────────────┐
//! │ WorkspaceTestAdapter     │ ──────────────────────────► │ fake-runner  │
//! │   DiscoveryAdapter /     │        FAKE_RUNNER_SCRIPT    │  stdout/err  │
//! │   ExecutionAdapter       │        TEST_RUN_PIPE         │  frames      │
//! │        ▲                 │        RUN_TEST_IDS_PIPE     │  exit code   │
//! │        └── pipe ◄────────┼──────────────────────────────┤              │
//! └──────────────────────────┘   Content-Length frames      └──────────────┘
//! ```

pub mod error;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use testbridge_host::{CommandSpawner, ProcessSpawner, RunnerCommand};
use tokio::process::Child;

pub use error::{E2eError, E2eResult};

/// Environment variable carrying the serialized [`RunnerScript`]
pub const SCRIPT_ENV: &str = "FAKE_RUNNER_SCRIPT";

/// What the fake runner does, in order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerScript {
    /// File the runner writes its pid to on startup
    pub pid_file: Option<PathBuf>,
    /// Lines printed to stdout
    pub stdout: Vec<String>,
    /// Lines printed to stderr
    pub stderr: Vec<String>,
    /// Wait before connecting to the pipe
    pub delay_ms: u64,
    /// Bytes sent on a separate connection before the payloads
    pub raw: Option<String>,
    /// `params` bodies sent as framed messages
    pub payloads: Vec<serde_json::Value>,
    /// Report this outcome for every id in the test-ids file
    pub echo_ids: Option<String>,
    /// Wait after sending, before exiting
    pub linger_ms: u64,
    /// Process exit code
    pub exit_code: i32,
}

impl RunnerScript {
    pub fn to_env(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_env() -> E2eResult<Self> {
        let raw = std::env::var(SCRIPT_ENV).map_err(|_| E2eError::MissingEnv(SCRIPT_ENV))?;
        serde_json::from_str(&raw).map_err(|e| E2eError::Script(e.to_string()))
    }

    /// Whether the runner needs a pipe connection at all
    pub fn connects(&self) -> bool {
        self.raw.is_some() || !self.payloads.is_empty() || self.echo_ids.is_some()
    }
}

/// Spawner that launches `fake-runner` in place of the requested program.
/// The original command (arguments, cwd, environment) is otherwise kept and
/// recorded for inspection.
pub struct FakeSpawner {
    binary: PathBuf,
    script: Mutex<RunnerScript>,
    spawned: Mutex<Vec<RunnerCommand>>,
}

impl FakeSpawner {
    pub fn new(binary: impl Into<PathBuf>, script: RunnerScript) -> Self {
        Self {
            binary: binary.into(),
            script: Mutex::new(script),
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Script used by later spawns
    pub fn set_script(&self, script: RunnerScript) {
        *self.script.lock() = script;
    }

    /// Commands requested so far, as the adapters built them
    pub fn spawned(&self) -> Vec<RunnerCommand> {
        self.spawned.lock().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().len()
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, command: &RunnerCommand) -> testbridge_common::Result<Child> {
        self.spawned.lock().push(command.clone());

        let script = self.script.lock().to_env()?;
        let mut fake = command.clone();
        fake.program = self.binary.display().to_string();
        fake.env.insert(SCRIPT_ENV.to_string(), script);
        CommandSpawner.spawn(&fake).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_defaults_from_partial_json() {
        let script: RunnerScript = serde_json::from_str(r#"{"exit_code": 5}"#).unwrap();
        assert_eq!(script.exit_code, 5);
        assert!(!script.connects());
    }

    #[test]
    fn test_connects() {
        let script = RunnerScript {
            echo_ids: Some("success".to_string()),
            ..Default::default()
        };
        assert!(script.connects());
    }
}
