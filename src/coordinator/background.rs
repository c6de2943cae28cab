//! Periodic work: health checks, expiry sweeps, deadlock scans, metrics.
//!
//! Each loop runs on its own named thread and sleeps on a shared stop signal,
//! so [`BackgroundTasks::shutdown`] returns as soon as every loop notices.

use super::{LockEngine, TicketState};
use crate::backend::BackendKind;
use crate::deadlock::DeadlockReport;
use crate::error::{LockError, Result};
use crate::events::{Event, EventAction};
use crate::fallback::BackendMode;
use crate::locks::{LockKey, LockRecord};
use crate::monitor::{BackendHealth, HealthReport, MetricsSnapshot};
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    /// Sleep for `interval`; true once stop was requested.
    fn wait(&self, interval: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(|p| p.into_inner());
        if *stopped {
            return true;
        }
        let (stopped, _) = self
            .wake
            .wait_timeout_while(stopped, interval, |stopped| !*stopped)
            .unwrap_or_else(|p| p.into_inner());
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(|p| p.into_inner()) = true;
        self.wake.notify_all();
    }
}

/// Running background loops. Stops and joins them on [`shutdown`](Self::shutdown) or drop.
#[derive(Debug)]
pub struct BackgroundTasks {
    stop: Arc<StopSignal>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    fn stop_and_join(&mut self) {
        self.stop.stop();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("background lock task panicked");
            }
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl LockEngine {
    /// Start the health loop, plus the deadlock and metrics loops when enabled.
    pub fn start_background(&self) -> Result<BackgroundTasks> {
        let mut tasks = BackgroundTasks {
            stop: Arc::new(StopSignal::default()),
            handles: Vec::new(),
        };
        let config = self.config();

        tasks.spawn(
            "tflock-health",
            config.health_check_interval(),
            self,
            |engine| engine.health_tick(),
        )?;

        if config.features.deadlock_detection {
            tasks.spawn("tflock-deadlock", config.deadlock_interval(), self, |engine| {
                if let Err(e) = engine.detect_deadlocks() {
                    warn!(error = %e, "deadlock scan failed");
                }
            })?;
        }

        if config.features.queue_monitoring {
            tasks.spawn("tflock-metrics", config.metrics_interval(), self, |engine| {
                engine.publish_metrics();
            })?;
        }

        debug!(threads = tasks.thread_count(), "background lock tasks started");
        Ok(tasks)
    }

    /// One health tick: ping and fallback transitions, expiry sweep, timeouts,
    /// then dispatch of queued keys.
    pub fn health_tick(&self) {
        if let Some((backend, latency)) = self.inner.fallback.check() {
            self.inner.metrics.record_ping_latency(backend, latency);
        }

        self.sweep_expired();
        self.prune_held();
        self.expire_overdue();

        let batch = self.inner.config.performance.queue_batch_size as usize;
        let keys = self.lock_queue().queue.keys_with_waiters();
        for key in keys.into_iter().take(batch) {
            self.dispatch(&key);
        }
    }

    /// Remove expired locks and hand their keys to the next waiter.
    pub fn sweep_expired(&self) -> Vec<LockRecord> {
        let now = Utc::now();
        let (_, active) = self.inner.fallback.active();
        let mut swept = match active.sweep_expired(now) {
            Ok(swept) => swept,
            Err(e) => {
                warn!(backend = %active.kind(), error = %e, "expiry sweep failed");
                Vec::new()
            }
        };

        // Residual local locks outlive a switch back to distributed.
        if let Some(standby) = self.inner.fallback.standby()
            && standby.kind() == BackendKind::Embedded
        {
            match standby.sweep_expired(now) {
                Ok(more) => swept.extend(more),
                Err(e) => debug!(error = %e, "standby expiry sweep failed"),
            }
        }

        let mut keys = BTreeSet::new();
        for record in &swept {
            self.forget_held(&record.key, &record.holder_id);
            self.inner.metrics.record_expiration();
            info!(key = %record.key, holder = %record.holder_id, "lock expired");
            self.inner.audit.record(
                Event::new(EventAction::LockExpired)
                    .with_key(&record.key)
                    .with_details(json!({
                        "holder_id": record.holder_id,
                        "expires_at": record.expires_at,
                    })),
            );
            keys.insert(record.key.clone());
        }

        for key in &keys {
            self.dispatch(key);
        }
        swept
    }

    /// Forget granted locks that are gone: expired, or absent from every
    /// backend. A backend that cannot answer keeps the record, so it still
    /// blocks the key and counts toward `max_concurrent_locks`.
    fn prune_held(&self) {
        let now = Utc::now();
        let candidates: Vec<LockRecord> = {
            let mut held = self.held_map();
            held.retain(|_, record| record.is_live_at(now));
            held.values().cloned().collect()
        };
        if candidates.is_empty() {
            return;
        }

        let backends = self.inner.fallback.backends();
        for record in candidates {
            let mut still_held = false;
            for backend in &backends {
                match backend.get(&record.key) {
                    Ok(Some(current)) if current.holder_id == record.holder_id => {
                        still_held = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(backend = %backend.kind(), key = %record.key, error = %e, "cannot confirm lock");
                        still_held = true;
                        break;
                    }
                }
            }
            if still_held {
                continue;
            }

            let mut held = self.held_map();
            if held.get(&record.key) == Some(&record) {
                held.remove(&record.key);
                debug!(key = %record.key, holder = %record.holder_id, "lock gone from every backend");
            }
        }
    }

    /// Every lock that blocks a key: the active backend's, residual local
    /// locks after recovery, and pre-fallback grants the embedded table
    /// cannot see.
    fn blocking_locks(&self) -> Result<Vec<LockRecord>> {
        let (mode, active) = self.inner.fallback.active();
        let mut held = active.list_held()?;

        let mut extra = self.inner.fallback.residual_locks();
        if mode == BackendMode::Embedded {
            let now = Utc::now();
            extra.extend(
                self.held_map()
                    .values()
                    .filter(|record| record.is_live_at(now))
                    .cloned(),
            );
        }
        for record in extra {
            if !held.iter().any(|h| h.key == record.key) {
                held.push(record);
            }
        }
        Ok(held)
    }

    /// Find wait-for cycles and fail one queued request per cycle.
    pub fn detect_deadlocks(&self) -> Result<Vec<DeadlockReport>> {
        if !self.inner.config.features.deadlock_detection {
            return Ok(Vec::new());
        }

        let held = self.blocking_locks()?;
        let waiting = self.lock_queue().queue.snapshot();

        let mut broken = Vec::new();
        for report in self.inner.detector.scan(&held, &waiting) {
            if self.fail_victim(&report.victim.key, &report.victim.holder_id) {
                self.inner.metrics.record_deadlock_broken();
                warn!(
                    key = %report.victim.key,
                    victim = %report.victim.holder_id,
                    cycle = ?report.cycle,
                    "deadlock broken"
                );
                self.inner.audit.record(
                    Event::new(EventAction::DeadlockBroken)
                        .with_key(&report.victim.key)
                        .with_details(json!({
                            "victim": report.victim.holder_id,
                            "priority": report.victim.priority,
                            "cycle": report.cycle,
                        })),
                );
                broken.push(report);
            }
        }
        Ok(broken)
    }

    fn fail_victim(&self, key: &LockKey, holder_id: &str) -> bool {
        let mut state = self.lock_queue();
        let id = (key.clone(), holder_id.to_string());
        let Some(ticket) = state.tickets.get(&id).cloned() else {
            return false;
        };
        let failed = ticket.settle(TicketState::Failed(LockError::DeadlockBroken {
            key: key.to_string(),
            holder_id: holder_id.to_string(),
        }));
        if failed {
            state.queue.remove(key, holder_id);
            state.tickets.remove(&id);
        }
        failed
    }

    /// Sample the engine and push a snapshot to the metrics sink.
    pub fn publish_metrics(&self) -> MetricsSnapshot {
        let (mode, active) = self.inner.fallback.active();
        let held_locks = match active.list_held() {
            Ok(held) => held.len(),
            Err(e) => {
                debug!(error = %e, "cannot count held locks");
                0
            }
        };
        let (queue_depths, queued_total) = {
            let state = self.lock_queue();
            (state.queue.depths(), state.queue.total_depth())
        };

        let snapshot = MetricsSnapshot {
            at: Utc::now(),
            mode,
            held_locks,
            queue_depths,
            queued_total,
            ping_latency_ms: self.inner.metrics.last_ping_latency_ms(),
            counters: self.inner.metrics.counters(),
        };
        self.inner.metrics.record_snapshot(&snapshot);
        self.inner.monitor.publish(snapshot.clone());
        snapshot
    }

    /// Ping every configured backend and summarize engine state.
    pub fn health(&self) -> HealthReport {
        let backends = self
            .inner
            .fallback
            .backends()
            .iter()
            .map(|backend| {
                let started = Instant::now();
                let result = backend.ping();
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                BackendHealth {
                    kind: backend.kind(),
                    reachable: result.is_ok(),
                    latency_ms: result.as_ref().ok().map(|_| latency_ms),
                    error: result.err().map(|e| e.to_string()),
                }
            })
            .collect();
        let state = self.inner.fallback.mode_state();

        HealthReport {
            mode: state.mode,
            mode_since: state.since,
            backends,
            queued_total: self.lock_queue().queue.total_depth(),
            counters: self.inner.metrics.counters(),
        }
    }
}

impl BackgroundTasks {
    fn spawn(
        &mut self,
        name: &str,
        interval: Duration,
        engine: &LockEngine,
        tick: impl Fn(&LockEngine) + Send + 'static,
    ) -> Result<()> {
        let engine = engine.clone();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !stop.wait(interval) {
                    tick(&engine);
                }
            })
            .map_err(|e| LockError::Io(format!("failed to spawn thread '{}': {}", name, e)))?;
        self.handles.push(handle);
        Ok(())
    }
}
