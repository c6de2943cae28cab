//! Queued requests and the handles callers wait on.

use super::LockEngine;
use crate::error::{LockError, Result};
use crate::locks::{LockHandle, LockKey, LockRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// Where a queued request stands.
#[derive(Debug)]
pub(crate) enum TicketState {
    Waiting,
    Granted(LockRecord),
    Failed(LockError),
    Cancelled,
    /// The grant was turned into a [`LockHandle`].
    Claimed,
}

/// Shared state of one queued request.
///
/// Every transition out of `Waiting` happens once, under the ticket mutex;
/// whoever wins it owns the consequences (a grant nobody claims is released).
#[derive(Debug)]
pub(crate) struct Ticket {
    pub(crate) key: LockKey,
    pub(crate) holder_id: String,
    pub(crate) started: Instant,
    pub(crate) deadline: Instant,
    state: Mutex<TicketState>,
    ready: Condvar,
}

impl Ticket {
    pub(crate) fn new(key: LockKey, holder_id: String, timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            key,
            holder_id,
            started,
            deadline: started + timeout,
            state: Mutex::new(TicketState::Waiting),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TicketState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn is_waiting(&self) -> bool {
        matches!(*self.lock(), TicketState::Waiting)
    }

    pub(crate) fn is_overdue(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Leave `Waiting` for `next`. Returns false if already settled.
    pub(crate) fn settle(&self, next: TicketState) -> bool {
        let mut state = self.lock();
        if !matches!(*state, TicketState::Waiting) {
            return false;
        }
        *state = next;
        self.ready.notify_all();
        true
    }

    /// A grant nobody claimed yet, marking the ticket cancelled.
    pub(crate) fn take_unclaimed_grant(&self) -> Option<LockRecord> {
        let mut state = self.lock();
        if !matches!(*state, TicketState::Granted(_)) {
            return None;
        }
        match std::mem::replace(&mut *state, TicketState::Cancelled) {
            TicketState::Granted(record) => Some(record),
            _ => None,
        }
    }

    /// Final result once settled; claims a grant.
    pub(crate) fn take_outcome(&self) -> Option<Result<LockRecord>> {
        let mut state = self.lock();
        match &*state {
            TicketState::Waiting => None,
            TicketState::Granted(_) => match std::mem::replace(&mut *state, TicketState::Claimed) {
                TicketState::Granted(record) => Some(Ok(record)),
                _ => None,
            },
            TicketState::Failed(err) => Some(Err(err.clone())),
            TicketState::Cancelled | TicketState::Claimed => Some(Err(LockError::Cancelled {
                key: self.key.to_string(),
            })),
        }
    }

    /// Block until settled, woken, or `timeout` passes.
    fn wait_timeout(&self, timeout: Duration, token: &CancellationToken) {
        let state = self.lock();
        if !matches!(*state, TicketState::Waiting) || token.is_cancelled() {
            return;
        }
        let _ = self.ready.wait_timeout(state, timeout);
    }

    fn wake(&self) {
        let _state = self.lock();
        self.ready.notify_all();
    }
}

/// Cooperative cancellation for blocking acquisitions.
///
/// Clones share state: cancelling any clone cancels every wait using it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    waiters: Mutex<Vec<Weak<Ticket>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let waiters = std::mem::take(
            &mut *self
                .inner
                .waiters
                .lock()
                .unwrap_or_else(|p| p.into_inner()),
        );
        for ticket in waiters.iter().filter_map(Weak::upgrade) {
            ticket.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn register(&self, ticket: &Arc<Ticket>) {
        let mut waiters = self
            .inner
            .waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(Arc::downgrade(ticket));
    }
}

/// Result of [`LockEngine::submit`].
#[derive(Debug)]
pub enum Acquisition {
    /// Granted immediately.
    Held(LockHandle),
    /// Queued behind the current holder.
    Queued(PendingLock),
}

impl Acquisition {
    pub fn is_held(&self) -> bool {
        matches!(self, Acquisition::Held(_))
    }
}

/// A queued request. Dropping it without waiting cancels the request, and
/// releases the lock if it was granted in the meantime.
#[derive(Debug)]
pub struct PendingLock {
    engine: LockEngine,
    ticket: Arc<Ticket>,
    done: bool,
}

impl PendingLock {
    pub(crate) fn new(engine: LockEngine, ticket: Arc<Ticket>) -> Self {
        Self {
            engine,
            ticket,
            done: false,
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.ticket.key
    }

    pub fn holder_id(&self) -> &str {
        &self.ticket.holder_id
    }

    /// Zero-based place in the key's queue; `None` once no longer queued.
    pub fn position(&self) -> Option<usize> {
        self.engine
            .queue_position(&self.ticket.key, &self.ticket.holder_id)
    }

    /// Block until granted, failed, or timed out.
    pub fn wait(self) -> Result<LockHandle> {
        self.wait_with(&CancellationToken::new())
    }

    /// Block until granted, failed, timed out, or `token` is cancelled.
    pub fn wait_with(mut self, token: &CancellationToken) -> Result<LockHandle> {
        token.register(&self.ticket);
        let retry = self.engine.retry_policy();
        let mut attempt = 0u32;

        loop {
            if let Some(outcome) = self.ticket.take_outcome() {
                self.done = true;
                return outcome.map(|record| LockHandle::new(self.engine.clone(), record));
            }

            if token.is_cancelled() {
                self.engine.cancel_ticket(&self.ticket);
                continue;
            }

            let now = Instant::now();
            if now >= self.ticket.deadline {
                self.engine.expire_ticket(&self.ticket);
                continue;
            }

            // Only the head of the queue polls the backend.
            let delay = if self.engine.is_queue_head(&self.ticket) {
                attempt += 1;
                self.engine.dispatch(&self.ticket.key);
                retry.delay_for(attempt)
            } else {
                retry.base_delay
            };

            self.ticket
                .wait_timeout(delay.min(self.ticket.deadline - now), token);
        }
    }

    /// Non-blocking check. `Ok(None)` while still queued.
    pub fn try_wait(&mut self) -> Result<Option<LockHandle>> {
        if self.done {
            return Err(LockError::Cancelled {
                key: self.ticket.key.to_string(),
            });
        }
        if self.ticket.is_waiting() && self.ticket.is_overdue() {
            self.engine.expire_ticket(&self.ticket);
        }
        match self.ticket.take_outcome() {
            None => Ok(None),
            Some(outcome) => {
                self.done = true;
                outcome.map(|record| Some(LockHandle::new(self.engine.clone(), record)))
            }
        }
    }

    /// Withdraw the request.
    pub fn cancel(mut self) {
        self.done = true;
        self.engine.cancel_ticket(&self.ticket);
    }
}

impl Drop for PendingLock {
    fn drop(&mut self) {
        if !self.done {
            self.engine.cancel_ticket(&self.ticket);
        }
    }
}
