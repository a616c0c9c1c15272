//! Cooperative shutdown flag.
//!
//! Multi-step ledger operations poll the flag at their yield points and
//! before committing. Once set, they stop advancing; steps that were already
//! committed stay committed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;

#[derive(Default)]
struct TerminationState {
    requested: AtomicBool,
    /// Sections that must finish before the process may exit.
    deferring: AtomicUsize,
    notify: Notify,
}

/// Shared termination flag. Clones refer to the same state.
#[derive(Clone, Default)]
pub struct Termination {
    inner: Arc<TerminationState>,
}

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolve once termination has been requested.
    pub async fn requested(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Mark a section (block append, checkpoint save/load) that shutdown must wait for.
    pub fn defer(&self) -> DeferGuard {
        self.inner.deferring.fetch_add(1, Ordering::SeqCst);
        DeferGuard { state: Arc::clone(&self.inner) }
    }

    /// Resolve once no deferring section is running.
    pub async fn drained(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.deferring.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps shutdown waiting while alive.
pub struct DeferGuard {
    state: Arc<TerminationState>,
}

impl Drop for DeferGuard {
    fn drop(&mut self) {
        self.state.deferring.fetch_sub(1, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }
}
