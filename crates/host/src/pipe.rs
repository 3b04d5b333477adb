//! Result pipe transport
//!
//! Each discovery or execution request gets its own Unix domain socket. The
//! runner connects back using the path passed in `TEST_RUN_PIPE` and writes
//! Content-Length framed JSON-RPC messages. Decoded `params` values are pushed
//! into a bounded channel that the owning adapter reads from.

use futures::{FutureExt, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use testbridge_common::{Error, FrameCodec, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Generates collision-resistant pipe paths
#[derive(Debug, Clone)]
pub struct PipeNamer {
    dir: PathBuf,
    prefix: String,
}

impl PipeNamer {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Fresh socket path for `channel` (e.g. `discovery`, `results`)
    pub fn next(&self, channel: &str) -> PathBuf {
        self.dir.join(format!(
            "{}-{}-{}.sock",
            self.prefix,
            channel,
            Uuid::new_v4().simple()
        ))
    }
}

impl Default for PipeNamer {
    fn default() -> Self {
        Self::new(testbridge_common::default_runtime_dir(), "testbridge")
    }
}

/// Pipe behaviour knobs
#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// Dispose once the last connected runner hangs up
    pub close_on_disconnect: bool,
    /// Message channel capacity
    pub capacity: usize,
}

impl PipeOptions {
    /// One runner connection per request
    pub fn single_client() -> Self {
        Self {
            close_on_disconnect: true,
            capacity: 64,
        }
    }

    /// Runners may open several connections over the life of the process
    pub fn multi_client() -> Self {
        Self {
            close_on_disconnect: false,
            capacity: 256,
        }
    }
}

struct PipeState {
    name: PathBuf,
    cancel: CancellationToken,
    accepting: CancellationToken,
    disposed: AtomicBool,
}

impl PipeState {
    fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        match std::fs::remove_file(&self.name) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove pipe {}: {}", self.name.display(), e),
        }
        debug!("Disposed pipe {}", self.name.display());
        true
    }
}

/// Owner handle for an open pipe. Dropping it disposes the pipe.
pub struct PipeHandle {
    state: Arc<PipeState>,
}

impl PipeHandle {
    /// Path the runner connects to
    pub fn name(&self) -> &Path {
        &self.state.name
    }

    /// Stop accepting new connections; open ones drain to EOF
    pub fn close(&self) {
        self.state.accepting.cancel();
    }

    /// Tear everything down. Safe to call repeatedly; returns `true` only
    /// for the call that actually released the pipe.
    pub fn dispose(&self) -> bool {
        self.state.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::Acquire)
    }
}

impl Drop for PipeHandle {
    fn drop(&mut self) {
        self.state.dispose();
    }
}

/// Bind a pipe at `name` and start accepting runner connections.
///
/// The pipe is disposed automatically when `parent` is cancelled.
pub async fn start_pipe(
    name: PathBuf,
    options: PipeOptions,
    parent: &CancellationToken,
) -> Result<(PipeHandle, mpsc::Receiver<serde_json::Value>)> {
    let listener = UnixListener::bind(&name)
        .map_err(|e| Error::Pipe(format!("Failed to bind {}: {}", name.display(), e)))?;

    let cancel = parent.child_token();
    let state = Arc::new(PipeState {
        name,
        accepting: cancel.child_token(),
        cancel,
        disposed: AtomicBool::new(false),
    });
    let (tx, rx) = mpsc::channel(options.capacity.max(1));

    debug!("Listening on pipe {}", state.name.display());

    tokio::spawn(accept_loop(listener, tx, Arc::clone(&state), options));

    let watcher = Arc::clone(&state);
    tokio::spawn(async move {
        watcher.cancel.cancelled().await;
        if watcher.dispose() {
            debug!("Pipe {} cancelled", watcher.name.display());
        }
    });

    Ok((PipeHandle { state }, rx))
}

/// Wait for the task reading a closed pipe to finish. If `cancel` fires
/// first the pipe is disposed and the reader aborted; returns `false` then.
///
/// A process that outlives the runner can keep a connection open forever,
/// so cancellation must not depend on the reader reaching EOF.
pub async fn drain_pipe(
    pipe: &PipeHandle,
    mut reader: JoinHandle<()>,
    cancel: &CancellationToken,
) -> bool {
    let drained = tokio::select! {
        joined = &mut reader => {
            if let Err(e) = joined {
                warn!("Reader for {} failed: {}", pipe.name().display(), e);
            }
            true
        }
        _ = cancel.cancelled() => false,
    };
    if !drained {
        debug!("Cancelled while draining {}", pipe.name().display());
        pipe.dispose();
        reader.abort();
    }
    drained
}

/// Why the accept loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptEnd {
    /// `close()` was called; queued connections are still served
    Closed,
    /// The last runner disconnected from a single-client pipe
    HungUp,
    /// The listener broke
    Failed,
}

impl AcceptEnd {
    fn disposes(self) -> bool {
        matches!(self, AcceptEnd::HungUp | AcceptEnd::Failed)
    }
}

async fn accept_loop(
    listener: UnixListener,
    tx: mpsc::Sender<serde_json::Value>,
    state: Arc<PipeState>,
    options: PipeOptions,
) {
    let active = Arc::new(AtomicUsize::new(0));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
    let mut next_id = 0usize;

    let mut serve = |stream: UnixStream| {
        next_id += 1;
        active.fetch_add(1, Ordering::AcqRel);
        trace!("Runner connected to {} (connection {})", state.name.display(), next_id);

        let tx = tx.clone();
        let cancel = state.cancel.clone();
        let active = Arc::clone(&active);
        let done_tx = done_tx.clone();
        let id = next_id;
        tokio::spawn(async move {
            read_connection(stream, tx, cancel, id).await;
            active.fetch_sub(1, Ordering::AcqRel);
            let _ = done_tx.send(());
        });
    };

    let end = loop {
        tokio::select! {
            _ = state.accepting.cancelled() => break AcceptEnd::Closed,
            Some(()) = done_rx.recv() => {
                if options.close_on_disconnect && active.load(Ordering::Acquire) == 0 {
                    debug!("Last runner disconnected from {}", state.name.display());
                    break AcceptEnd::HungUp;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => serve(stream),
                Err(e) => {
                    warn!("Accept failed on {}: {}", state.name.display(), e);
                    break AcceptEnd::Failed;
                }
            }
        }
    };

    if end == AcceptEnd::Closed {
        // Runners that connected before the close still get served
        while let Some(Ok((stream, _))) = listener.accept().now_or_never() {
            serve(stream);
        }
    }

    if end.disposes() {
        state.dispose();
    }
}

async fn read_connection(
    stream: UnixStream,
    tx: mpsc::Sender<serde_json::Value>,
    cancel: CancellationToken,
    id: usize,
) {
    let mut frames = FramedRead::new(stream, FrameCodec::new());

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            None => {
                trace!("Connection {} closed", id);
                break;
            }
            Some(Ok(frame)) => match frame.envelope() {
                Ok(envelope) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = tx.send(envelope.params) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("Discarding undecodable message on connection {}: {}", id, e),
            },
            Some(Err(e)) => {
                error!(
                    "Protocol error on connection {}: {}; dropping buffered data",
                    id, e
                );
                break;
            }
        }
    }
}
