//! First-writer-wins one-shot value
//!
//! Bridges completion signals coming from several places (pipe messages,
//! process exit, cancellation) into a single awaitable value. Only the first
//! `resolve` takes effect; later calls report `false` and change nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable handle to a value that is resolved at most once
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    resolved: AtomicBool,
    tx: watch::Sender<Option<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                resolved: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Resolve with `value`. Returns `false` if already resolved.
    pub fn resolve(&self, value: T) -> bool {
        if self
            .inner
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.inner.tx.send_replace(Some(value));
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.load(Ordering::Acquire)
    }

    /// Resolved value, if any
    pub fn peek(&self) -> Option<T> {
        (*self.inner.tx.borrow()).clone()
    }

    /// Wait for the value
    pub async fn wait(&self) -> T {
        let mut rx = self.inner.tx.subscribe();
        loop {
            if let Some(value) = (*rx.borrow_and_update()).clone() {
                return value;
            }
            // The sender lives in `inner`, which `self` keeps alive
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
