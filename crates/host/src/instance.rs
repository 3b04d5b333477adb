//! Execution subprocess instance
//!
//! Everything one execution runner needs lives here: its run ids and the
//! temp file carrying them, its process handle, its cancellation token and
//! the deferred first terminal payload. Instances never share mutable state,
//! so any number of them can run side by side.

use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;
use testbridge_common::{Error, ExecutionPayload, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::deferred::Deferred;
use crate::process::ProcessHandle;

pub struct ExecutionInstance {
    workspace: PathBuf,
    run_ids: Vec<String>,
    pipe_name: Mutex<Option<PathBuf>>,
    ids_file: Mutex<Option<NamedTempFile>>,
    process: Mutex<Option<ProcessHandle>>,
    cancel: Mutex<Option<CancellationToken>>,
    result: Deferred<ExecutionPayload>,
    disposed: AtomicBool,
}

impl ExecutionInstance {
    pub fn new(workspace: impl Into<PathBuf>, run_ids: Vec<String>) -> Self {
        Self {
            workspace: workspace.into(),
            run_ids,
            pipe_name: Mutex::new(None),
            ids_file: Mutex::new(None),
            process: Mutex::new(None),
            cancel: Mutex::new(None),
            result: Deferred::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn run_ids(&self) -> &[String] {
        &self.run_ids
    }

    /// Write the run ids, one per line, to a fresh `test-ids-*.txt` file
    /// owned by this instance. Returns its path.
    pub async fn initialize(&self) -> Result<PathBuf> {
        let contents = self.run_ids.join("\n");
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
            let mut file = tempfile::Builder::new()
                .prefix("test-ids-")
                .suffix(".txt")
                .tempfile()?;
            file.write_all(contents.as_bytes())?;
            file.flush()?;
            Ok(file)
        })
        .await
        .map_err(|e| Error::Internal(format!("test ids writer panicked: {}", e)))?
        .map_err(|e| Error::TestIdsFile(e.to_string()))?;

        let path = file.path().to_path_buf();
        debug!("Wrote {} run ids to {}", self.run_ids.len(), path.display());
        *self.ids_file.lock() = Some(file);
        Ok(path)
    }

    pub fn ids_file(&self) -> Option<PathBuf> {
        self.ids_file.lock().as_ref().map(|f| f.path().to_path_buf())
    }

    pub fn set_pipe_name(&self, name: impl Into<PathBuf>) {
        *self.pipe_name.lock() = Some(name.into());
    }

    pub fn pipe_name(&self) -> Option<PathBuf> {
        self.pipe_name.lock().clone()
    }

    pub fn set_process(&self, process: ProcessHandle) {
        *self.process.lock() = Some(process);
    }

    pub fn set_cancellation_token(&self, token: CancellationToken) {
        *self.cancel.lock() = Some(token);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .lock()
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    /// Offer a payload. The first `success` or `error` payload becomes the
    /// instance result; anything after it, and everything once cancelled,
    /// is dropped. Returns whether the payload settled the result.
    pub fn handle_data_received(&self, payload: &ExecutionPayload) -> bool {
        if self.is_cancelled() {
            trace!("Instance cancelled; discarding payload");
            return false;
        }
        if !payload.status.is_terminal() {
            return false;
        }
        if self.result.resolve(payload.clone()) {
            true
        } else {
            trace!("Instance result already settled; ignoring payload");
            false
        }
    }

    pub fn execution_result(&self) -> Option<ExecutionPayload> {
        self.result.peek()
    }

    /// Wait for the first terminal payload
    pub async fn wait_result(&self) -> ExecutionPayload {
        self.result.wait().await
    }

    /// Release the process and the temp file. Both are always attempted and
    /// neither failure is propagated. Later calls do nothing.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(process) = self.process.lock().take() {
            if process.is_running() {
                if let Err(e) = process.kill() {
                    warn!("Failed to kill runner {}: {}", process.pid(), e);
                }
            }
        }

        if let Some(file) = self.ids_file.lock().take() {
            let path = file.path().to_path_buf();
            match file.close() {
                Ok(()) => trace!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Test ids file {} already gone", path.display())
                }
                Err(e) => warn!("Failed to remove test ids file {}: {}", path.display(), e),
            }
        }
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for ExecutionInstance {
    fn drop(&mut self) {
        self.dispose();
    }
}
