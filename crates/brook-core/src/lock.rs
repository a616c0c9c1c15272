//! Cooperative exclusive lock for the ledger.
//!
//! Every ledger operation runs inside a critical section obtained from
//! [`LedgerLock::acquire`]. The lock counts holders instead of tracking
//! owners: a caller proceeds when the current holder count is at most its
//! `allowance`. An outer operation that already holds the lock calls inner
//! operations with `allowance + 1`, so a nested call re-enters instead of
//! deadlocking, and the whole nested operation stays atomic.
//!
//! Callers that cannot proceed wait in a FIFO queue. A release hands the
//! freed slot straight to the next eligible waiter, stopping at the first
//! waiter that is still not eligible.
//!
//! Misuse is fatal: releasing a guard twice, releasing with no holders, or
//! releasing a ticket the lock does not know about are reported to the
//! [`FatalHandler`] and returned as [`LockError`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::LockError;
use crate::fatal::FatalHandler;

struct Waiter {
    ticket: u64,
    allowance: usize,
    label: &'static str,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    holders: usize,
    next_ticket: u64,
    /// Granted tickets in grant order.
    active: Vec<(u64, &'static str)>,
    waiters: VecDeque<Waiter>,
}

struct LockInner {
    state: Mutex<LockState>,
    fatal: FatalHandler,
}

impl LockInner {
    fn release_ticket(&self, ticket: u64, label: &'static str) -> Result<(), LockError> {
        let mut state = self.state.lock();
        if state.holders == 0 {
            return Err(LockError::ExcessRelease { label: label.to_string() });
        }
        let pos = state
            .active
            .iter()
            .position(|(t, _)| *t == ticket)
            .ok_or_else(|| LockError::UnknownTicket { ticket, label: label.to_string() })?;
        state.active.remove(pos);
        state.holders -= 1;
        debug!(target: "brook::lock", label, holders = state.holders, "released");
        Self::wake(&mut state);
        Ok(())
    }

    fn wake(state: &mut LockState) {
        loop {
            let eligible = matches!(state.waiters.front(), Some(w) if state.holders <= w.allowance);
            if !eligible {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else { break };
            // A failed send means the waiter gave up; skip it.
            if waiter.grant.send(()).is_ok() {
                state.holders += 1;
                state.active.push((waiter.ticket, waiter.label));
                debug!(target: "brook::lock", label = waiter.label, holders = state.holders, "granted to waiter");
            }
        }
    }

    /// Drop a cancelled waiter. It may have been the front waiter blocking
    /// eligible ones behind it, so the queue is served again.
    fn forget_waiter(&self, ticket: u64) {
        let mut state = self.state.lock();
        state.waiters.retain(|w| w.ticket != ticket);
        Self::wake(&mut state);
    }
}

/// Holder-counting lock shared by every ledger component.
#[derive(Clone)]
pub struct LedgerLock {
    inner: Arc<LockInner>,
}

impl LedgerLock {
    pub fn new(fatal: FatalHandler) -> Self {
        Self {
            inner: Arc::new(LockInner {
                state: Mutex::new(LockState::default()),
                fatal,
            }),
        }
    }

    /// Enter a critical section.
    ///
    /// Proceeds at once when the holder count is at most `allowance`,
    /// otherwise waits in FIFO order.
    pub async fn acquire(&self, allowance: usize, label: &'static str) -> LockGuard {
        loop {
            let mut pending = match self.grant_or_enqueue(allowance, label) {
                Ok(guard) => return guard,
                Err(pending) => pending,
            };
            if (&mut pending.rx).await.is_ok() {
                return pending.into_guard();
            }
        }
    }

    /// Release a guard obtained from this lock.
    pub fn release(&self, guard: &mut LockGuard) -> Result<(), LockError> {
        if !Arc::ptr_eq(&self.inner, &guard.inner) {
            let err = LockError::UnknownTicket { ticket: guard.ticket, label: guard.label.to_string() };
            self.inner.fatal.raise(&err);
            return Err(err);
        }
        guard.release()
    }

    /// Number of outstanding holders.
    pub fn holders(&self) -> usize {
        self.inner.state.lock().holders
    }

    /// Number of callers waiting for the lock.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Labels of all holders followed by all waiters, oldest first.
    pub fn pending_operations(&self) -> Vec<&'static str> {
        let state = self.inner.state.lock();
        state
            .active
            .iter()
            .map(|(_, label)| *label)
            .chain(state.waiters.iter().map(|w| w.label))
            .collect()
    }

    fn grant_or_enqueue(&self, allowance: usize, label: &'static str) -> Result<LockGuard, PendingGrant> {
        let mut state = self.inner.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        if state.holders <= allowance {
            state.holders += 1;
            state.active.push((ticket, label));
            debug!(target: "brook::lock", label, allowance, holders = state.holders, "acquired");
            return Ok(LockGuard {
                inner: Arc::clone(&self.inner),
                ticket,
                label,
                released: false,
            });
        }

        let (grant, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { ticket, allowance, label, grant });
        debug!(target: "brook::lock", label, allowance, holders = state.holders, queued = state.waiters.len(), "waiting");
        Err(PendingGrant {
            inner: Arc::clone(&self.inner),
            rx,
            ticket,
            label,
            claimed: false,
        })
    }
}

/// A queued acquire. Dropping it before the grant is claimed gives the slot
/// back (or leaves the queue), so cancelled acquires never leak a holder.
struct PendingGrant {
    inner: Arc<LockInner>,
    rx: oneshot::Receiver<()>,
    ticket: u64,
    label: &'static str,
    claimed: bool,
}

impl PendingGrant {
    fn into_guard(mut self) -> LockGuard {
        self.claimed = true;
        LockGuard {
            inner: Arc::clone(&self.inner),
            ticket: self.ticket,
            label: self.label,
            released: false,
        }
    }
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            if let Err(err) = self.inner.release_ticket(self.ticket, self.label) {
                self.inner.fatal.raise(&err);
            }
        } else {
            self.inner.forget_waiter(self.ticket);
        }
    }
}

/// Proof of holding the ledger lock.
///
/// Release explicitly with [`LockGuard::release`] to observe misuse errors;
/// a guard that goes out of scope unreleased is released on drop.
pub struct LockGuard {
    inner: Arc<LockInner>,
    ticket: u64,
    label: &'static str,
    released: bool,
}

impl LockGuard {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            let err = LockError::DoubleRelease { label: self.label.to_string() };
            self.inner.fatal.raise(&err);
            return Err(err);
        }
        self.released = true;
        self.inner
            .release_ticket(self.ticket, self.label)
            .inspect_err(|err| self.inner.fatal.raise(err))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}
