//! Process-level handler for fatal conditions.
//!
//! A fatal condition is an internal consistency violation: lock misuse, a
//! storage failure, a failing hook, a missing master branch. There is no
//! local recovery. The handler records the first reason, halts further
//! ledger mutation and wakes whoever is waiting on [`FatalHandler::halted`]
//! (the node event loop, which then shuts down for operator intervention).

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::error;

use crate::error::BrookError;

#[derive(Default)]
struct FatalState {
    halted: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

/// Shared fatal handler. Clones refer to the same state.
#[derive(Clone, Default)]
pub struct FatalHandler {
    inner: Arc<FatalState>,
}

impl FatalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a fatal condition and halt mutation.
    ///
    /// Only the first reason is kept; later reports are logged too.
    pub fn raise(&self, condition: &dyn Display) {
        let reason = condition.to_string();
        error!(%reason, "fatal condition, halting ledger mutation");
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.halted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Raise `err` if it belongs to the fatal tier, then hand it back.
    pub fn check(&self, err: BrookError) -> BrookError {
        if err.is_fatal() && !matches!(err, BrookError::Halted(_)) {
            self.raise(&err);
        }
        err
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Refuse with [`BrookError::Halted`] once a fatal condition was raised.
    pub fn ensure_running(&self) -> Result<(), BrookError> {
        if self.is_halted() {
            return Err(BrookError::Halted(self.reason().unwrap_or_default()));
        }
        Ok(())
    }

    /// Resolve once a fatal condition has been raised.
    pub async fn halted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_halted() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BlockError, LockError};

    #[test]
    fn fresh_handler_is_running() {
        let fatal = FatalHandler::new();
        assert!(!fatal.is_halted());
        assert!(fatal.ensure_running().is_ok());
        assert_eq!(fatal.reason(), None);
    }

    #[test]
    fn raise_halts_and_keeps_first_reason() {
        let fatal = FatalHandler::new();
        fatal.raise(&"first");
        fatal.raise(&"second");
        assert!(fatal.is_halted());
        assert_eq!(fatal.reason().as_deref(), Some("first"));
        assert!(matches!(fatal.ensure_running(), Err(BrookError::Halted(r)) if r == "first"));
    }

    #[test]
    fn check_only_raises_fatal_tier() {
        let fatal = FatalHandler::new();
        let _ = fatal.check(BlockError::NoTransactions.into());
        assert!(!fatal.is_halted());

        let _ = fatal.check(LockError::DoubleRelease { label: "t".into() }.into());
        assert!(fatal.is_halted());
    }

    #[tokio::test]
    async fn halted_wakes_waiter() {
        let fatal = FatalHandler::new();
        let waiter = {
            let fatal = fatal.clone();
            tokio::spawn(async move { fatal.halted().await })
        };
        tokio::task::yield_now().await;
        fatal.raise(&"boom");
        waiter.await.unwrap();
    }
}
