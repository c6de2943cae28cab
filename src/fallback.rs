//! Switching between the distributed and embedded backends.
//!
//! The controller owns the [`BackendMode`] and is the only place that changes
//! it. Callers read the active backend as a snapshot through
//! [`FallbackController::active`]; a transition swaps the mode under a write
//! lock so every later snapshot sees the new backend.
//!
//! # Transitions
//!
//! - `Distributed -> Embedded` after `failure_threshold` consecutive failures,
//!   or once a failure streak has lasted `fallback_timeout`. Requires
//!   `auto_fallback` and an embedded backend.
//! - `Embedded -> Distributed` after `recovery_threshold` consecutive
//!   successful pings, and only once [`reconcile`](FallbackController::reconcile)
//!   has pushed every lock granted during the outage back to the cache.
//!
//! Both transitions hold the write side of the grant gate, and the
//! coordinator grants under its read side. A grant therefore lands entirely
//! before or entirely after a switch, and reconciliation sees every lock the
//! embedded table handed out.

use crate::backend::{BackendKind, LockBackend};
use crate::config::FallbackConfig;
use crate::error::{LockError, Result};
use crate::events::{AuditLog, Event, EventAction};
use crate::locks::{LockKey, LockRecord, LockRequest};
use crate::monitor::EngineMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Which backend currently serves lock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    Distributed,
    Embedded,
}

impl BackendMode {
    pub fn backend_kind(self) -> BackendKind {
        match self {
            BackendMode::Distributed => BackendKind::Distributed,
            BackendMode::Embedded => BackendKind::Embedded,
        }
    }
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.backend_kind())
    }
}

/// Mode plus the time it was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeState {
    pub mode: BackendMode,
    pub since: DateTime<Utc>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Locks now held in the distributed store.
    pub migrated: Vec<LockKey>,
    /// Locks kept locally because another holder owns the key remotely.
    pub conflicts: Vec<LockKey>,
    /// Tagged records that expired before they could be migrated.
    pub expired: usize,
    /// Locks whose migration failed; they stay local and keep blocking the key.
    pub failed: Vec<LockKey>,
}

#[derive(Debug, Default)]
struct Streak {
    failures: u32,
    successes: u32,
    failing_since: Option<Instant>,
}

pub struct FallbackController {
    distributed: Option<Arc<dyn LockBackend>>,
    embedded: Option<Arc<dyn LockBackend>>,
    /// Backend of the initial mode.
    home: Arc<dyn LockBackend>,
    config: FallbackConfig,
    state: RwLock<ModeState>,
    /// Readers are grants in progress, writers are mode switches.
    grants: RwLock<()>,
    streak: Mutex<Streak>,
    /// Keys whose local lock lost reconciliation and must still block grants.
    residual: Mutex<BTreeSet<LockKey>>,
    audit: Arc<AuditLog>,
    metrics: Arc<EngineMetrics>,
}

impl std::fmt::Debug for FallbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackController")
            .field("mode", &self.mode())
            .field("has_distributed", &self.distributed.is_some())
            .field("has_embedded", &self.embedded.is_some())
            .finish()
    }
}

impl FallbackController {
    /// Starts on the distributed backend when one is given.
    pub fn new(
        distributed: Option<Arc<dyn LockBackend>>,
        embedded: Option<Arc<dyn LockBackend>>,
        config: FallbackConfig,
        audit: Arc<AuditLog>,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self> {
        let (mode, home) = match (&distributed, &embedded) {
            (Some(backend), _) => (BackendMode::Distributed, backend.clone()),
            (None, Some(backend)) => (BackendMode::Embedded, backend.clone()),
            (None, None) => {
                return Err(LockError::Config(
                    "at least one lock backend must be configured".to_string(),
                ));
            }
        };

        Ok(Self {
            distributed,
            embedded,
            home,
            config,
            state: RwLock::new(ModeState {
                mode,
                since: Utc::now(),
            }),
            grants: RwLock::new(()),
            streak: Mutex::new(Streak::default()),
            residual: Mutex::new(BTreeSet::new()),
            audit,
            metrics,
        })
    }

    pub fn mode(&self) -> BackendMode {
        self.mode_state().mode
    }

    pub fn mode_state(&self) -> ModeState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn backend(&self, mode: BackendMode) -> Option<&Arc<dyn LockBackend>> {
        match mode {
            BackendMode::Distributed => self.distributed.as_ref(),
            BackendMode::Embedded => self.embedded.as_ref(),
        }
    }

    /// Snapshot of the mode and the backend serving it.
    pub fn active(&self) -> (BackendMode, Arc<dyn LockBackend>) {
        let mode = self.mode();
        // Transitions only move to modes whose backend exists.
        let backend = self
            .backend(mode)
            .cloned()
            .unwrap_or_else(|| self.home.clone());
        (mode, backend)
    }

    /// The backend not currently serving requests, if configured.
    pub fn standby(&self) -> Option<Arc<dyn LockBackend>> {
        let standby = match self.mode() {
            BackendMode::Distributed => BackendMode::Embedded,
            BackendMode::Embedded => BackendMode::Distributed,
        };
        self.backend(standby).cloned()
    }

    /// Every configured backend, active first.
    pub fn backends(&self) -> Vec<Arc<dyn LockBackend>> {
        let (_, active) = self.active();
        let mut out = vec![active];
        out.extend(self.standby());
        out
    }

    /// Held by the coordinator from reading the active backend until the
    /// grant is recorded. Mode switches wait for it.
    pub(crate) fn grant_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.grants.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Whether locks granted now would need migrating later.
    pub fn grants_need_migration(&self) -> bool {
        self.mode() == BackendMode::Embedded && self.distributed.is_some()
    }

    /// Report a distributed-backend failure seen by an operation or ping.
    ///
    /// Returns true when this report switched the engine to embedded.
    pub fn record_failure(&self, error: &LockError) -> bool {
        if self.mode() != BackendMode::Distributed {
            return false;
        }
        self.metrics.record_backend_error();

        let should_switch = {
            let mut streak = self.streak.lock().unwrap_or_else(|p| p.into_inner());
            streak.successes = 0;
            streak.failures += 1;
            let started = *streak.failing_since.get_or_insert_with(Instant::now);
            let timed_out = started.elapsed() >= Duration::from_secs(self.config.fallback_timeout_secs);
            debug!(failures = streak.failures, error = %error, "distributed backend failure");
            streak.failures >= self.config.failure_threshold || timed_out
        };

        if !should_switch || !self.config.auto_fallback || self.embedded.is_none() {
            return false;
        }
        let _switching = self.grants.write().unwrap_or_else(|p| p.into_inner());
        self.transition(
            BackendMode::Distributed,
            BackendMode::Embedded,
            &error.to_string(),
        )
    }

    /// Report a successful distributed-backend call while in distributed mode.
    pub fn record_success(&self) {
        if self.mode() != BackendMode::Distributed {
            return;
        }
        let mut streak = self.streak.lock().unwrap_or_else(|p| p.into_inner());
        streak.failures = 0;
        streak.failing_since = None;
    }

    /// One health tick: ping the distributed backend and apply transitions.
    ///
    /// Returns the kind and ping latency of the active backend when it answered.
    pub fn check(&self) -> Option<(BackendKind, Duration)> {
        match self.mode() {
            BackendMode::Distributed => {
                let (_, backend) = self.active();
                let started = Instant::now();
                match backend.ping() {
                    Ok(()) => {
                        self.record_success();
                        Some((backend.kind(), started.elapsed()))
                    }
                    Err(e) => {
                        warn!(error = %e, "distributed backend ping failed");
                        self.record_failure(&e);
                        None
                    }
                }
            }
            BackendMode::Embedded => {
                let latency = {
                    let (_, embedded) = self.active();
                    let started = Instant::now();
                    embedded
                        .ping()
                        .ok()
                        .map(|_| (embedded.kind(), started.elapsed()))
                };
                if let Some(distributed) = &self.distributed {
                    self.attempt_recovery(distributed);
                }
                latency
            }
        }
    }

    fn attempt_recovery(&self, distributed: &Arc<dyn LockBackend>) {
        let recovered = match distributed.ping() {
            Ok(()) => {
                let mut streak = self.streak.lock().unwrap_or_else(|p| p.into_inner());
                streak.successes += 1;
                debug!(successes = streak.successes, "distributed backend answered");
                streak.successes >= self.config.recovery_threshold
            }
            Err(e) => {
                debug!(error = %e, "distributed backend still unavailable");
                self.streak.lock().unwrap_or_else(|p| p.into_inner()).successes = 0;
                false
            }
        };
        if !recovered {
            return;
        }

        let _switching = self.grants.write().unwrap_or_else(|p| p.into_inner());
        match self.reconcile() {
            Ok(report) => {
                let reason = format!(
                    "recovered; {} migrated, {} conflicts, {} failed",
                    report.migrated.len(),
                    report.conflicts.len(),
                    report.failed.len()
                );
                self.transition(BackendMode::Embedded, BackendMode::Distributed, &reason);
            }
            Err(e) => {
                warn!(error = %e, "reconciliation failed, staying on embedded backend");
                self.streak.lock().unwrap_or_else(|p| p.into_inner()).successes = 0;
            }
        }
    }

    /// Push every lock granted during fallback into the distributed store.
    ///
    /// A key the distributed store already holds for someone else keeps its
    /// local lock until natural release or expiry. So does a key whose
    /// migration fails; only failing to list the embedded table aborts.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let (Some(distributed), Some(embedded)) = (&self.distributed, &self.embedded) else {
            return Ok(report);
        };

        for record in embedded.list_held()? {
            if !record.pending_migration {
                continue;
            }
            let ttl = record.remaining_ttl();
            if ttl.is_zero() {
                report.expired += 1;
                continue;
            }

            let request = LockRequest::new(record.key.clone(), record.holder_id.clone(), ttl)
                .with_priority(record.priority);
            let outcome = match distributed.try_acquire(&request) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.keep_local(&record, &e);
                    report.failed.push(record.key);
                    continue;
                }
            };

            if outcome.granted || outcome.record.holder_id == record.holder_id {
                // Held in both stores until the local record is gone.
                if let Err(e) = embedded.release(&record.key, &record.holder_id) {
                    self.keep_local(&record, &e);
                    report.failed.push(record.key);
                    continue;
                }
                self.metrics.record_reconciled();
                self.audit.record(
                    Event::new(EventAction::Reconciled)
                        .with_key(&record.key)
                        .with_details(json!({
                            "holder_id": record.holder_id,
                            "remaining_ttl_secs": ttl.as_secs(),
                        })),
                );
                report.migrated.push(record.key);
            } else {
                self.report_conflict(&record, &outcome.record);
                report.conflicts.push(record.key);
            }
        }

        Ok(report)
    }

    fn keep_local(&self, local: &LockRecord, error: &LockError) {
        warn!(
            key = %local.key,
            holder = %local.holder_id,
            error = %error,
            "could not migrate local lock, keeping it"
        );
        self.track_residual(&local.key);
    }

    fn track_residual(&self, key: &LockKey) {
        self.residual
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.clone());
    }

    fn report_conflict(&self, local: &LockRecord, remote: &LockRecord) {
        let conflict = LockError::ReconciliationConflict {
            key: local.key.to_string(),
            local_holder: local.holder_id.clone(),
            remote_holder: remote.holder_id.clone(),
        };
        warn!(key = %local.key, error = %conflict, "keeping local lock until it is released");
        self.metrics.record_reconciliation_conflict();
        self.audit.record(
            Event::new(EventAction::ReconciliationConflict)
                .with_key(&local.key)
                .with_details(json!({
                    "local_holder": local.holder_id,
                    "remote_holder": remote.holder_id,
                    "local_expires_at": local.expires_at,
                })),
        );
        self.track_residual(&local.key);
    }

    /// Live local locks left behind by reconciliation, for the wait-for graph.
    pub fn residual_locks(&self) -> Vec<LockRecord> {
        let keys: Vec<LockKey> = self
            .residual
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();
        keys.iter()
            .filter_map(|key| match self.residual_lock(key) {
                Ok(record) => record,
                Err(e) => {
                    debug!(key = %key, error = %e, "cannot read residual lock");
                    None
                }
            })
            .collect()
    }

    /// A live local lock on `key` left behind by a reconciliation conflict.
    ///
    /// Only meaningful in distributed mode; stale entries are dropped here.
    pub fn residual_lock(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        if self.mode() != BackendMode::Distributed {
            return Ok(None);
        }
        let tracked = self
            .residual
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(key);
        if !tracked {
            return Ok(None);
        }
        let Some(embedded) = &self.embedded else {
            return Ok(None);
        };

        match embedded.get(key)? {
            Some(record) => Ok(Some(record)),
            None => {
                self.residual
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(key);
                Ok(None)
            }
        }
    }

    fn transition(&self, from: BackendMode, to: BackendMode, reason: &str) -> bool {
        {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            if state.mode != from {
                return false;
            }
            *state = ModeState {
                mode: to,
                since: Utc::now(),
            };
        }
        *self.streak.lock().unwrap_or_else(|p| p.into_inner()) = Streak::default();

        self.metrics.record_fallback_transition();
        info!(from = %from, to = %to, reason = %reason, "lock backend mode changed");
        self.audit.record(Event::new(EventAction::ModeTransition).with_details(json!({
            "from": from,
            "to": to,
            "reason": reason,
        })));
        true
    }
}
