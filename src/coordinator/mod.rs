//! Acquisition coordinator: the engine callers talk to.
//!
//! A request first tries the active backend directly. If the key is held (or
//! already has waiters that outrank it) the request joins the key's wait
//! queue and the caller gets a [`PendingLock`]. From then on the queue, not
//! retry timing, decides who goes next:
//!
//! - only the head of a key's queue polls the backend, with backoff;
//! - every release and expiry sweep dispatches the head immediately: the entry
//!   is taken off the queue, a grant is attempted on its behalf, and on
//!   failure it goes back at its original position.
//!
//! Backend failures are reported to the [`FallbackController`], which may
//! switch the active backend; the request is then retried against the new one.
//!
//! The engine remembers every lock it granted until the holder releases it
//! or it expires. After a switch to the embedded table those records stand in
//! for distributed locks the table cannot see.
//!
//! # Locking order
//!
//! Grant gate (read side, see [`FallbackController`]) before the held map.
//! Queue state mutex before any ticket mutex. Backend calls never run under
//! the queue mutex.

mod background;
mod ticket;

#[cfg(test)]
mod tests;

pub use background::BackgroundTasks;
pub use ticket::{Acquisition, CancellationToken, PendingLock};

use crate::backend::{DistributedStore, EmbeddedStore, LockBackend, RedisCache};
use crate::config::EngineConfig;
use crate::deadlock::DeadlockDetector;
use crate::error::{LockError, Result};
use crate::events::AuditLog;
use crate::fallback::{BackendMode, FallbackController};
use crate::locks::{LockHandle, LockKey, LockRecord, LockRequest};
use crate::monitor::{EngineMetrics, HealthMonitor, MetricsSink, TracingSink};
use crate::queue::WaitQueue;
use crate::retry::RetryPolicy;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use ticket::{Ticket, TicketState};
use tracing::{debug, info, warn};

/// Backends handed to [`LockEngine::with_backends`].
#[derive(Default)]
pub struct Backends {
    pub distributed: Option<Arc<dyn LockBackend>>,
    pub embedded: Option<Arc<dyn LockBackend>>,
}

type TicketId = (LockKey, String);

#[derive(Debug)]
struct QueueState {
    queue: WaitQueue,
    tickets: HashMap<TicketId, Arc<Ticket>>,
    /// Keys whose head is currently being granted on its behalf.
    in_flight: HashSet<LockKey>,
}

struct EngineInner {
    config: EngineConfig,
    fallback: FallbackController,
    queue: Mutex<QueueState>,
    detector: DeadlockDetector,
    retry: RetryPolicy,
    metrics: Arc<EngineMetrics>,
    monitor: HealthMonitor,
    audit: Arc<AuditLog>,
    /// Locks granted through this engine and not yet released or expired.
    held: Mutex<HashMap<LockKey, LockRecord>>,
}

/// Entry point for acquiring and releasing project-workspace locks.
///
/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct LockEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for LockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockEngine")
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl LockEngine {
    /// Build an engine and its backends from config.
    ///
    /// The distributed backend is used when [`EngineConfig::uses_distributed`];
    /// the embedded table is opened when it is the only backend or serves as
    /// fallback (`fallback.legacy_enabled`).
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let distributed: Option<Arc<dyn LockBackend>> = if config.uses_distributed() {
            let cache = RedisCache::new(&config.redis)?;
            Some(Arc::new(DistributedStore::new(cache)))
        } else {
            None
        };

        let embedded: Option<Arc<dyn LockBackend>> =
            if distributed.is_none() || config.fallback.legacy_enabled {
                Some(Arc::new(EmbeddedStore::open(&config.data_dir)?))
            } else {
                None
            };

        Self::with_backends(
            config,
            Backends {
                distributed,
                embedded,
            },
            Box::new(TracingSink),
        )
    }

    /// Build an engine over caller-supplied backends and metrics sink.
    pub fn with_backends(
        config: EngineConfig,
        backends: Backends,
        sink: Box<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let audit = Arc::new(if config.audit_log {
            AuditLog::in_dir(&config.data_dir)
        } else {
            AuditLog::disabled()
        });
        let metrics = Arc::new(EngineMetrics::new());
        let fallback = FallbackController::new(
            backends.distributed,
            backends.embedded,
            config.fallback,
            audit.clone(),
            metrics.clone(),
        )?;
        let queue = if config.features.priority_queue {
            WaitQueue::new()
        } else {
            WaitQueue::fifo()
        };
        let retry = RetryPolicy::from_config(&config.retry, config.features.retry_mechanism);

        info!(
            mode = %fallback.mode(),
            lock_ttl_secs = config.lock_ttl_secs,
            "lock engine ready"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                fallback,
                queue: Mutex::new(QueueState {
                    queue,
                    tickets: HashMap::new(),
                    in_flight: HashSet::new(),
                }),
                detector: DeadlockDetector::new(),
                retry,
                metrics,
                monitor: HealthMonitor::new(sink),
                audit,
                held: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> BackendMode {
        self.inner.fallback.mode()
    }

    pub fn fallback(&self) -> &FallbackController {
        &self.inner.fallback
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.inner.monitor
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.inner.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn held_map(&self) -> MutexGuard<'_, HashMap<LockKey, LockRecord>> {
        self.inner.held.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Forget a granted lock once `holder_id` no longer holds it.
    fn forget_held(&self, key: &LockKey, holder_id: &str) {
        let mut held = self.held_map();
        if held.get(key).is_some_and(|r| r.holder_id == holder_id) {
            held.remove(key);
        }
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    /// Acquire `key`, blocking until granted, failed, timed out, or cancelled.
    ///
    /// Acquiring a key `holder_id` already holds succeeds at once with a
    /// second handle to the same lock. The lock is not counted twice: the
    /// first handle released or dropped frees it for everyone, so a holder
    /// that re-acquires should [`detach`](LockHandle::detach) one of them.
    pub fn acquire(
        &self,
        key: LockKey,
        holder_id: impl Into<String>,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled {
                key: key.to_string(),
            });
        }
        match self.submit(key, holder_id, priority)? {
            Acquisition::Held(handle) => Ok(handle),
            Acquisition::Queued(pending) => pending.wait_with(cancel),
        }
    }

    /// Try once and queue on contention, without blocking on the queue.
    ///
    /// Re-entrant like [`acquire`](Self::acquire): a holder submitting for a
    /// key it holds gets [`Acquisition::Held`] with a handle sharing the lock.
    pub fn submit(
        &self,
        key: LockKey,
        holder_id: impl Into<String>,
        priority: i32,
    ) -> Result<Acquisition> {
        let holder_id = holder_id.into();
        if holder_id.trim().is_empty() {
            return Err(LockError::InvalidKey(
                "holder id must not be empty".to_string(),
            ));
        }
        let priority = if self.inner.config.features.priority_queue {
            priority
        } else {
            0
        };

        {
            let mut state = self.lock_queue();
            if state.queue.contains(&key, &holder_id) {
                return Err(LockError::AlreadyWaiting {
                    key: key.to_string(),
                    holder_id,
                });
            }
            // Newcomers never jump ahead of waiters.
            if state.in_flight.contains(&key) || state.queue.outranked_by_queue(&key, priority) {
                let pending = self.enqueue_locked(&mut state, &key, &holder_id, priority)?;
                return Ok(Acquisition::Queued(pending));
            }
        }

        let request = LockRequest::new(key.clone(), holder_id.clone(), self.inner.config.lock_ttl())
            .with_priority(priority);
        match self.acquire_now(&request)? {
            Some(record) => Ok(Acquisition::Held(LockHandle::new(self.clone(), record))),
            None => {
                let mut state = self.lock_queue();
                let pending = self.enqueue_locked(&mut state, &key, &holder_id, priority)?;
                Ok(Acquisition::Queued(pending))
            }
        }
    }

    fn enqueue_locked(
        &self,
        state: &mut QueueState,
        key: &LockKey,
        holder_id: &str,
        priority: i32,
    ) -> Result<PendingLock> {
        let entry = state.queue.enqueue(key, holder_id, priority)?;
        let ticket = Arc::new(Ticket::new(
            key.clone(),
            holder_id.to_string(),
            self.inner.config.acquisition_timeout(),
        ));
        state
            .tickets
            .insert((key.clone(), holder_id.to_string()), ticket.clone());
        self.inner.metrics.record_contention();
        debug!(
            key = %key,
            holder = %holder_id,
            priority = entry.priority,
            depth = state.queue.depth(key),
            "lock request queued"
        );
        Ok(PendingLock::new(self.clone(), ticket))
    }

    /// Newcomer attempt, retrying backend failures and following fallback.
    fn acquire_now(&self, request: &LockRequest) -> Result<Option<LockRecord>> {
        let max_attempts = self.inner.config.fallback.failure_threshold.max(1);
        let mut attempt = 0u32;

        loop {
            let mode_before = self.mode();
            match self.try_grant(request) {
                Ok(granted) => return Ok(granted),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    let switched = self.report_backend_error(mode_before, &e);
                    if attempt > max_attempts {
                        return Err(e);
                    }
                    if switched || self.mode() != mode_before {
                        debug!(key = %request.key, to = %self.mode(), "retrying on new backend");
                        continue;
                    }
                    if !self.inner.config.features.retry_mechanism || attempt == max_attempts {
                        return Err(e);
                    }
                    let delay = self.inner.retry.delay_for(attempt);
                    debug!(key = %request.key, attempt, ?delay, error = %e, "backend error, retrying");
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn at_capacity(&self, request: &LockRequest) -> bool {
        let max = self.inner.config.performance.max_concurrent_locks as usize;
        if max == 0 {
            return false;
        }
        let now = Utc::now();
        let held = self.held_map();
        if held
            .get(&request.key)
            .is_some_and(|r| r.holder_id == request.holder_id && r.is_live_at(now))
        {
            return false;
        }
        held.values().filter(|r| r.is_live_at(now)).count() >= max
    }

    /// One grant attempt against the active backend. `Ok(None)` means contended.
    fn try_grant(&self, request: &LockRequest) -> Result<Option<LockRecord>> {
        // No mode switch until this grant is recorded in `held`.
        let _gate = self.inner.fallback.grant_gate();

        if self.at_capacity(request) {
            debug!(key = %request.key, "engine at max_concurrent_locks, treating as contended");
            return Ok(None);
        }

        let (mode, backend) = self.inner.fallback.active();
        let fallen_back = mode == BackendMode::Embedded && self.inner.fallback.standby().is_some();

        // The embedded table cannot see locks granted on the distributed
        // backend before the switch.
        if fallen_back {
            let known = self
                .held_map()
                .get(&request.key)
                .filter(|r| r.is_live_at(Utc::now()))
                .cloned();
            match known {
                Some(record) if record.holder_id != request.holder_id => {
                    debug!(
                        key = %request.key,
                        holder = %record.holder_id,
                        "key held by a lock the embedded table cannot see, treating as contended"
                    );
                    return Ok(None);
                }
                Some(record) if record.pending_migration => {}
                Some(record) => return Ok(Some(record)),
                None => {}
            }
        }

        match self.inner.fallback.residual_lock(&request.key) {
            Ok(Some(residual)) if residual.holder_id != request.holder_id => return Ok(None),
            Ok(_) => {}
            Err(e) => {
                warn!(key = %request.key, error = %e, "cannot check local lock, treating as contended");
                return Ok(None);
            }
        }

        let outcome = backend.try_acquire(&request.clone().tagged_for_migration(fallen_back))?;
        if mode == BackendMode::Distributed {
            self.inner.fallback.record_success();
        }

        // Re-entrant: a grant made on this holder's behalf counts as ours.
        if outcome.granted || outcome.record.holder_id == request.holder_id {
            self.held_map()
                .insert(request.key.clone(), outcome.record.clone());
            self.inner.metrics.record_grant();
            info!(
                key = %request.key,
                holder = %request.holder_id,
                backend = %mode,
                expires_at = %outcome.record.expires_at,
                "lock granted"
            );
            Ok(Some(outcome.record))
        } else {
            Ok(None)
        }
    }

    /// Returns true when the report switched backends.
    fn report_backend_error(&self, mode: BackendMode, error: &LockError) -> bool {
        warn!(backend = %mode, error = %error, "lock backend error");
        match mode {
            BackendMode::Distributed => self.inner.fallback.record_failure(error),
            BackendMode::Embedded => {
                self.inner.metrics.record_backend_error();
                false
            }
        }
    }

    // =========================================================================
    // Queue dispatch
    // =========================================================================

    pub(crate) fn queue_position(&self, key: &LockKey, holder_id: &str) -> Option<usize> {
        self.lock_queue().queue.position(key, holder_id)
    }

    pub(crate) fn is_queue_head(&self, ticket: &Ticket) -> bool {
        self.lock_queue()
            .queue
            .head(&ticket.key)
            .is_some_and(|head| head.holder_id == ticket.holder_id)
    }

    /// Attempt a grant for the head of `key`'s queue.
    pub(crate) fn dispatch(&self, key: &LockKey) {
        loop {
            let (entry, ticket) = {
                let mut state = self.lock_queue();
                if state.in_flight.contains(key) {
                    return;
                }
                let Some(entry) = state.queue.pop_head(key) else {
                    return;
                };
                let id = (key.clone(), entry.holder_id.clone());
                let Some(ticket) = state.tickets.get(&id).cloned() else {
                    continue;
                };
                if !ticket.is_waiting() {
                    state.tickets.remove(&id);
                    continue;
                }
                if ticket.is_overdue() {
                    self.fail_timed_out_locked(&mut state, &ticket);
                    continue;
                }
                state.in_flight.insert(key.clone());
                (entry, ticket)
            };

            let request = LockRequest::new(
                key.clone(),
                entry.holder_id.clone(),
                self.inner.config.lock_ttl(),
            )
            .with_priority(entry.priority);
            let mode_before = self.mode();
            let result = self.try_grant(&request);

            let mut state = self.lock_queue();
            state.in_flight.remove(key);
            match result {
                Ok(Some(record)) => {
                    state.tickets.remove(&(key.clone(), entry.holder_id.clone()));
                    drop(state);
                    if ticket.settle(TicketState::Granted(record.clone())) {
                        debug!(key = %key, holder = %entry.holder_id, "queued request granted");
                    } else {
                        // Cancelled or timed out while the grant was in flight.
                        debug!(key = %key, holder = %entry.holder_id, "releasing grant nobody waits for");
                        self.release_quietly(&record);
                    }
                    return;
                }
                Ok(None) => {
                    state.queue.reinsert(entry);
                    return;
                }
                Err(e) => {
                    state.queue.reinsert(entry);
                    drop(state);
                    if e.is_transient() {
                        self.report_backend_error(mode_before, &e);
                    } else {
                        warn!(key = %key, error = %e, "queued grant attempt failed");
                    }
                    return;
                }
            }
        }
    }

    fn fail_timed_out_locked(&self, state: &mut QueueState, ticket: &Ticket) {
        let waited = ticket.started.elapsed();
        let failed = ticket.settle(TicketState::Failed(LockError::AcquisitionTimeout {
            key: ticket.key.to_string(),
            waited,
        }));
        state.queue.remove(&ticket.key, &ticket.holder_id);
        state
            .tickets
            .remove(&(ticket.key.clone(), ticket.holder_id.clone()));
        if failed {
            self.inner.metrics.record_timeout();
            info!(
                key = %ticket.key,
                holder = %ticket.holder_id,
                waited_secs = waited.as_secs(),
                "lock request timed out"
            );
        }
    }

    pub(crate) fn expire_ticket(&self, ticket: &Ticket) {
        let mut state = self.lock_queue();
        self.fail_timed_out_locked(&mut state, ticket);
    }

    /// Fail every queued request past its deadline.
    pub fn expire_overdue(&self) -> usize {
        let mut state = self.lock_queue();
        let overdue: Vec<Arc<Ticket>> = state
            .tickets
            .values()
            .filter(|t| t.is_overdue() && t.is_waiting())
            .cloned()
            .collect();
        for ticket in &overdue {
            self.fail_timed_out_locked(&mut state, ticket);
        }
        overdue.len()
    }

    pub(crate) fn cancel_ticket(&self, ticket: &Ticket) {
        {
            let mut state = self.lock_queue();
            if ticket.settle(TicketState::Cancelled) {
                state.queue.remove(&ticket.key, &ticket.holder_id);
                state
                    .tickets
                    .remove(&(ticket.key.clone(), ticket.holder_id.clone()));
                self.inner.metrics.record_cancellation();
                debug!(key = %ticket.key, holder = %ticket.holder_id, "lock request cancelled");
                return;
            }
        }
        if let Some(record) = ticket.take_unclaimed_grant() {
            self.inner.metrics.record_cancellation();
            self.release_quietly(&record);
        }
    }

    // =========================================================================
    // Release & renew
    // =========================================================================

    /// Release `key` if `holder_id` holds it. Releasing twice returns false.
    pub fn release(&self, key: &LockKey, holder_id: &str) -> Result<bool> {
        let released = self.on_backends(|backend| backend.release(key, holder_id));
        if released.is_ok() {
            // Released now, or already gone from every backend that answered.
            self.forget_held(key, holder_id);
        }
        self.dispatch(key);

        let released = released?;
        if released {
            self.inner.metrics.record_release();
            info!(key = %key, holder = %holder_id, "lock released");
        }
        Ok(released)
    }

    fn release_quietly(&self, record: &LockRecord) {
        if let Err(e) = self.release(&record.key, &record.holder_id) {
            warn!(key = %record.key, holder = %record.holder_id, error = %e, "failed to release lock");
        }
    }

    /// Extend the holder's lock by `ttl` from now.
    pub fn renew(&self, key: &LockKey, holder_id: &str, ttl: Duration) -> Result<bool> {
        let renewed = self.on_backends(|backend| backend.renew(key, holder_id, ttl))?;
        if renewed
            && let Some(record) = self.held_map().get_mut(key)
            && record.holder_id == holder_id
        {
            record.expires_at = crate::locks::record::expiry_from(Utc::now(), ttl);
        }
        Ok(renewed)
    }

    /// Run a holder-scoped mutation on the active backend, falling through to
    /// the standby when the active one does not know the holder.
    ///
    /// `Ok(false)` only when every backend answered; otherwise the first error.
    fn on_backends(&self, op: impl Fn(&dyn LockBackend) -> Result<bool>) -> Result<bool> {
        let (mode, active) = self.inner.fallback.active();
        let mut first_error = match op(active.as_ref()) {
            Ok(true) => {
                if mode == BackendMode::Distributed {
                    self.inner.fallback.record_success();
                }
                return Ok(true);
            }
            Ok(false) => None,
            Err(e) => {
                if e.is_transient() {
                    self.report_backend_error(mode, &e);
                }
                Some(e)
            }
        };

        if let Some(standby) = self.inner.fallback.standby() {
            match op(standby.as_ref()) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    debug!(backend = %standby.kind(), error = %e, "standby backend error");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    // =========================================================================
    // Queries & operator actions
    // =========================================================================

    /// The live lock on `key`, if any.
    pub fn get_lock(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        let (_, active) = self.inner.fallback.active();
        active.get(key)
    }

    /// Every live lock on the active backend, sorted by key.
    pub fn list_locks(&self) -> Result<Vec<LockRecord>> {
        let (_, active) = self.inner.fallback.active();
        let mut locks = active.list_held()?;
        locks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(locks)
    }

    /// Queue depth of `key`.
    pub fn queue_depth(&self, key: &LockKey) -> usize {
        self.lock_queue().queue.depth(key)
    }

    /// Release a lock regardless of who holds it.
    pub fn clear_lock(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        let record = match self.get_lock(key)? {
            Some(record) => Some(record),
            None => match self.inner.fallback.standby() {
                Some(standby) => standby.get(key).unwrap_or(None),
                None => None,
            },
        };
        let Some(record) = record else {
            return Ok(None);
        };

        if !self.release(key, &record.holder_id)? {
            return Ok(None);
        }
        warn!(key = %key, holder = %record.holder_id, "lock cleared by operator");
        self.inner.audit.record(
            crate::events::Event::new(crate::events::EventAction::LockClear)
                .with_key(key)
                .with_details(serde_json::json!({ "holder_id": record.holder_id })),
        );
        Ok(Some(record))
    }

    /// Release every lock in `repository` held by pull request `pull`.
    ///
    /// Holder ids of pull-request jobs are `pr-<n>` or `pr-<n>-<suffix>`.
    pub fn unlock_by_pull(&self, repository: &str, pull: u64) -> Result<Vec<LockRecord>> {
        let exact = format!("pr-{}", pull);
        let prefix = format!("pr-{}-", pull);

        let mut released = Vec::new();
        for record in self.list_locks()? {
            let matches = record.key.repository() == repository
                && (record.holder_id == exact || record.holder_id.starts_with(&prefix));
            if matches && self.release(&record.key, &record.holder_id)? {
                released.push(record);
            }
        }

        if !released.is_empty() {
            info!(repository, pull, count = released.len(), "unlocked pull request");
            self.inner.audit.record(
                crate::events::Event::new(crate::events::EventAction::UnlockPull).with_details(
                    serde_json::json!({
                        "repository": repository,
                        "pull": pull,
                        "keys": released.iter().map(|r| r.key.to_string()).collect::<Vec<_>>(),
                    }),
                ),
            );
        }
        Ok(released)
    }
}
