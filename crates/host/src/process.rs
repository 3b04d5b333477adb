//! Runner process handling
//!
//! Spawning goes through [`ProcessSpawner`] so tests and embedders can decide
//! how runners are launched. [`supervise`] drives a spawned child: stdout and
//! stderr are normalized and forwarded to the [`OutputSink`], the exit status
//! is classified against the adapter's [`ExitCodePolicy`], and cancellation
//! kills the child.

use async_trait::async_trait;
use futures::future::join_all;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use testbridge_common::{fix_log_lines, Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deferred::Deferred;

// ============================================================================
// Exit code policies
// ============================================================================

/// Exit codes an adapter treats as success, with their documented meaning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodePolicy {
    pub name: &'static str,
    pub allowed: &'static [(i32, &'static str)],
}

/// pytest: 0 all passed, 5 no tests collected
pub const PYTEST_DISCOVERY: ExitCodePolicy = ExitCodePolicy {
    name: "pytest discovery",
    allowed: &[(0, "ok"), (5, "no tests collected")],
};

/// pytest: 0 all passed, 1 some tests failed, 5 no tests collected
pub const PYTEST_EXECUTION: ExitCodePolicy = ExitCodePolicy {
    name: "pytest execution",
    allowed: &[(0, "ok"), (1, "tests failed"), (5, "no tests collected")],
};

pub const UNITTEST_DISCOVERY: ExitCodePolicy = ExitCodePolicy {
    name: "unittest discovery",
    allowed: &[(0, "ok")],
};

/// unittest: 1 when the run was unsuccessful, 5 when no tests ran (3.12+)
pub const UNITTEST_EXECUTION: ExitCodePolicy = ExitCodePolicy {
    name: "unittest execution",
    allowed: &[(0, "ok"), (1, "tests failed"), (5, "no tests ran")],
};

/// How a runner process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitClass {
    Success { code: i32, meaning: &'static str },
    Failure(ProcessFailure),
}

/// Exit code and/or terminating signal of a failed runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFailure {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl std::fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "null".to_string());
        let signal = self.signal.as_deref().unwrap_or("null");
        write!(f, "Code: {}, Signal: {}", code, signal)
    }
}

impl ProcessFailure {
    /// Text attached to error payloads synthesized from a failed exit
    pub fn termination_message(&self, cwd: &str) -> String {
        format!(
            " \n The python test process was terminated before it could exit on its own, \
             the process errored with: {} for workspace {}",
            self, cwd
        )
    }
}

impl ExitCodePolicy {
    pub fn classify(&self, status: ExitStatus) -> ExitClass {
        if let Some(code) = status.code() {
            if let Some((_, meaning)) = self.allowed.iter().find(|(c, _)| *c == code) {
                return ExitClass::Success { code, meaning };
            }
        }
        ExitClass::Failure(ProcessFailure {
            code: status.code(),
            signal: status.signal().map(signal_name),
        })
    }
}

fn signal_name(raw: i32) -> String {
    Signal::try_from(raw)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| raw.to_string())
}

// ============================================================================
// Collaborators
// ============================================================================

/// Receives runner output destined for the user
pub trait OutputSink: Send + Sync {
    fn append(&self, text: &str);
}

/// Output sink that logs runner output
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingOutput;

impl OutputSink for TracingOutput {
    fn append(&self, text: &str) {
        info!(target: "testbridge::runner", "{}", text.trim_end());
    }
}

/// Forwards output to several sinks
pub struct TeeOutput {
    sinks: Vec<Arc<dyn OutputSink>>,
}

impl TeeOutput {
    pub fn new(sinks: Vec<Arc<dyn OutputSink>>) -> Self {
        Self { sinks }
    }
}

impl OutputSink for TeeOutput {
    fn append(&self, text: &str) {
        for sink in &self.sinks {
            sink.append(text);
        }
    }
}

/// Fully resolved runner invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

impl std::fmt::Display for RunnerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Launches runner subprocesses
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, command: &RunnerCommand) -> Result<Child>;
}

/// Spawns runners as plain child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandSpawner;

#[async_trait]
impl ProcessSpawner for CommandSpawner {
    async fn spawn(&self, command: &RunnerCommand) -> Result<Child> {
        debug!("Spawning {} in {}", command, command.cwd.display());
        Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.cwd)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn {
                program: command.program.clone(),
                reason: e.to_string(),
            })
    }
}

/// Pid-based handle for killing a runner owned by someone else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn from_child(child: &Child) -> Option<Self> {
        child.id().map(Self::new)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        kill(Pid::from_raw(self.pid as i32), None).is_ok()
    }

    /// Send SIGTERM
    pub fn kill(&self) -> Result<()> {
        kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM)
            .map_err(|e| Error::Process(format!("Failed to kill pid {}: {}", self.pid, e)))
    }
}

// ============================================================================
// Handlers
// ============================================================================

type FailureReporter = Box<dyn Fn(&ProcessFailure) + Send + Sync>;

/// Callbacks attached to one runner process
pub struct ProcessHandlers {
    label: String,
    cwd: String,
    policy: ExitCodePolicy,
    completion: Deferred<()>,
    output: Arc<dyn OutputSink>,
    on_failure: FailureReporter,
}

impl ProcessHandlers {
    pub fn new(
        label: impl Into<String>,
        cwd: impl Into<String>,
        policy: ExitCodePolicy,
        completion: Deferred<()>,
        output: Arc<dyn OutputSink>,
        on_failure: impl Fn(&ProcessFailure) + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            cwd: cwd.into(),
            policy,
            completion,
            output,
            on_failure: Box::new(on_failure),
        }
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn completion(&self) -> &Deferred<()> {
        &self.completion
    }

    pub fn on_stdout(&self, chunk: &str) {
        self.output.append(&format!("{}\r\n", fix_log_lines(chunk)));
    }

    pub fn on_stderr(&self, chunk: &str) {
        self.output.append(&format!("{}\r\n", fix_log_lines(chunk)));
    }

    /// Classify the exit status as soon as the process exits
    pub fn on_exit(&self, status: ExitStatus) -> ExitClass {
        let class = self.policy.classify(status);
        match &class {
            ExitClass::Success { code, meaning } => {
                debug!("{} subprocess exited with code {} ({})", self.label, code, meaning)
            }
            ExitClass::Failure(failure) => warn!(
                "{} subprocess exited unsuccessfully for workspace {}: {}",
                self.label, self.cwd, failure
            ),
        }
        class
    }

    /// Runs once stdio and the result pipe are drained. Reports failures and
    /// resolves the completion.
    pub fn on_close(&self, status: ExitStatus) -> ExitClass {
        let class = self.policy.classify(status);
        if let ExitClass::Failure(failure) = &class {
            (self.on_failure)(failure);
        }
        self.completion.resolve(());
        class
    }

    /// Cancellation path: `on_close` never runs, so resolve here
    pub fn on_cancelled(&self) {
        if self.completion.resolve(()) {
            debug!("{} completion resolved by cancellation", self.label);
        }
    }
}

/// Result of supervising a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervision {
    /// Exited on its own; stdio fully drained
    Exited(ExitStatus),
    /// The token fired before the child exited or before its stdio closed
    Cancelled,
}

/// Drive `child` until it exits or `cancel` fires.
///
/// On cancellation the child is killed (failures are logged), reaped, and the
/// completion is resolved before returning. Cancellation also cuts short the
/// wait for stdio to close after the child has exited.
pub async fn supervise(
    mut child: Child,
    handlers: Arc<ProcessHandlers>,
    cancel: &CancellationToken,
) -> Supervision {
    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(forward_lines(out, Arc::clone(&handlers), Stream::Stdout)));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(forward_lines(err, Arc::clone(&handlers), Stream::Stderr)));

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    match exited {
        Some(Ok(status)) => {
            handlers.on_exit(status);
            // Anything the runner spawned may still hold stdout or stderr
            let mut readers: Vec<_> = [stdout, stderr].into_iter().flatten().collect();
            let drained = tokio::select! {
                _ = join_all(readers.iter_mut()) => true,
                _ = cancel.cancelled() => false,
            };
            if drained {
                Supervision::Exited(status)
            } else {
                debug!("Cancelled while draining runner output");
                for reader in readers {
                    reader.abort();
                }
                handlers.on_cancelled();
                Supervision::Cancelled
            }
        }
        Some(Err(e)) => {
            warn!("Failed to wait for runner process: {}", e);
            handlers.on_cancelled();
            Supervision::Cancelled
        }
        None => {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill runner process: {}", e);
            }
            handlers.on_cancelled();
            if let Err(e) = child.wait().await {
                warn!("Failed to reap runner process: {}", e);
            }
            for reader in [stdout, stderr].into_iter().flatten() {
                reader.abort();
            }
            Supervision::Cancelled
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    handlers: Arc<ProcessHandlers>,
    stream: Stream,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(&['\r', '\n'][..]);
                match stream {
                    Stream::Stdout => handlers.on_stdout(line),
                    Stream::Stderr => handlers.on_stderr(line),
                }
            }
            Err(e) => {
                debug!("Runner {:?} closed: {}", stream, e);
                break;
            }
        }
    }
}
