//! Engine metrics, periodic snapshots, and the sinks they are pushed to.
//!
//! Every event the coordinator and fallback controller count is emitted
//! through the `metrics` facade, so whichever recorder the host process
//! installs (Prometheus, statsd, ...) sees it. Without a recorder the macros
//! are no-ops.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `tflock_lock_grants_total` | Counter | - |
//! | `tflock_lock_contentions_total` | Counter | - |
//! | `tflock_lock_timeouts_total` | Counter | - |
//! | `tflock_lock_cancellations_total` | Counter | - |
//! | `tflock_deadlocks_broken_total` | Counter | - |
//! | `tflock_backend_errors_total` | Counter | - |
//! | `tflock_reconciliation_conflicts_total` | Counter | - |
//! | `tflock_reconciled_locks_total` | Counter | - |
//! | `tflock_lock_expirations_total` | Counter | - |
//! | `tflock_lock_releases_total` | Counter | - |
//! | `tflock_fallback_transitions_total` | Counter | - |
//! | `tflock_backend_ping_seconds` | Histogram | `backend` |
//! | `tflock_held_locks` | Gauge | - |
//! | `tflock_queue_depth` | Gauge | - |
//! | `tflock_embedded_mode` | Gauge | - |
//!
//! [`EngineMetrics`] also keeps a local copy of each counter for the pull
//! API: the metrics loop turns them into a [`MetricsSnapshot`], hands it to a
//! [`MetricsSink`], and keeps it for [`HealthMonitor::latest`].

use crate::backend::BackendKind;
use crate::fallback::BackendMode;
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

// ============================================================================
// Metric Names
// ============================================================================

/// Locks granted.
pub const LOCK_GRANTS: &str = "tflock_lock_grants_total";

/// Requests that found their key held and had to wait.
pub const LOCK_CONTENTIONS: &str = "tflock_lock_contentions_total";

/// Requests that gave up after the acquisition timeout.
pub const LOCK_TIMEOUTS: &str = "tflock_lock_timeouts_total";

/// Requests cancelled by their caller.
pub const LOCK_CANCELLATIONS: &str = "tflock_lock_cancellations_total";

/// Waiters failed to break a wait-for cycle.
pub const DEADLOCKS_BROKEN: &str = "tflock_deadlocks_broken_total";

/// Backend calls that failed.
pub const BACKEND_ERRORS: &str = "tflock_backend_errors_total";

/// Embedded locks that could not be migrated because the key was held remotely.
pub const RECONCILIATION_CONFLICTS: &str = "tflock_reconciliation_conflicts_total";

/// Embedded locks migrated to the distributed backend.
pub const RECONCILED_LOCKS: &str = "tflock_reconciled_locks_total";

/// Locks removed by the expiry sweep.
pub const LOCK_EXPIRATIONS: &str = "tflock_lock_expirations_total";

/// Locks released by their holder or an operator.
pub const LOCK_RELEASES: &str = "tflock_lock_releases_total";

/// Switches between the distributed and embedded backends.
pub const FALLBACK_TRANSITIONS: &str = "tflock_fallback_transitions_total";

/// Round trip of a health ping to the active backend.
pub const BACKEND_PING: &str = "tflock_backend_ping_seconds";

/// Locks held on the active backend at the last metrics tick.
pub const HELD_LOCKS: &str = "tflock_held_locks";

/// Requests waiting across all keys at the last metrics tick.
pub const QUEUE_DEPTH: &str = "tflock_queue_depth";

/// 1 while the engine runs on the embedded fallback, 0 otherwise.
pub const EMBEDDED_MODE: &str = "tflock_embedded_mode";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all lock engine metric descriptions.
///
/// Call this once at startup, after the host has installed its recorder.
pub fn register_metrics() {
    describe_counter!(LOCK_GRANTS, "Total locks granted");
    describe_counter!(LOCK_CONTENTIONS, "Total lock requests that had to wait");
    describe_counter!(LOCK_TIMEOUTS, "Total lock requests that timed out");
    describe_counter!(LOCK_CANCELLATIONS, "Total lock requests cancelled");
    describe_counter!(DEADLOCKS_BROKEN, "Total deadlock victims failed");
    describe_counter!(BACKEND_ERRORS, "Total failed backend calls");
    describe_counter!(
        RECONCILIATION_CONFLICTS,
        "Total fallback locks that conflicted with a distributed holder"
    );
    describe_counter!(RECONCILED_LOCKS, "Total fallback locks migrated back");
    describe_counter!(LOCK_EXPIRATIONS, "Total locks removed after their TTL");
    describe_counter!(LOCK_RELEASES, "Total locks released");
    describe_counter!(FALLBACK_TRANSITIONS, "Total backend mode switches");
    describe_histogram!(BACKEND_PING, "Backend health ping latency in seconds");
    describe_gauge!(HELD_LOCKS, "Locks currently held on the active backend");
    describe_gauge!(QUEUE_DEPTH, "Lock requests currently waiting");
    describe_gauge!(EMBEDDED_MODE, "Whether the embedded fallback is active");
}

// ============================================================================
// Engine Metrics
// ============================================================================

/// Counters bumped by the engine. Each bump goes to the `metrics` recorder
/// and to a relaxed atomic kept for [`EngineMetrics::counters`].
#[derive(Debug, Default)]
pub struct EngineMetrics {
    grants: AtomicU64,
    contentions: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    deadlocks_broken: AtomicU64,
    backend_errors: AtomicU64,
    reconciliation_conflicts: AtomicU64,
    reconciled: AtomicU64,
    expirations: AtomicU64,
    releases: AtomicU64,
    fallback_transitions: AtomicU64,
    last_ping_micros: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub grants: u64,
    pub contentions: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub deadlocks_broken: u64,
    pub backend_errors: u64,
    pub reconciliation_conflicts: u64,
    pub reconciled: u64,
    pub expirations: u64,
    pub releases: u64,
    pub fallback_transitions: u64,
}

macro_rules! engine_counters {
    ($($inc:ident => $field:ident : $name:ident),* $(,)?) => {
        $(
            pub fn $inc(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
                counter!($name).increment(1);
            }
        )*
    };
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    engine_counters! {
        record_grant => grants: LOCK_GRANTS,
        record_contention => contentions: LOCK_CONTENTIONS,
        record_timeout => timeouts: LOCK_TIMEOUTS,
        record_cancellation => cancellations: LOCK_CANCELLATIONS,
        record_deadlock_broken => deadlocks_broken: DEADLOCKS_BROKEN,
        record_backend_error => backend_errors: BACKEND_ERRORS,
        record_reconciliation_conflict => reconciliation_conflicts: RECONCILIATION_CONFLICTS,
        record_reconciled => reconciled: RECONCILED_LOCKS,
        record_expiration => expirations: LOCK_EXPIRATIONS,
        record_release => releases: LOCK_RELEASES,
        record_fallback_transition => fallback_transitions: FALLBACK_TRANSITIONS,
    }

    pub fn record_ping_latency(&self, backend: BackendKind, latency: Duration) {
        histogram!(BACKEND_PING, "backend" => backend.to_string()).record(latency.as_secs_f64());
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.last_ping_micros.store(micros, Ordering::Relaxed);
    }

    /// Updates the point-in-time gauges from a metrics tick.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn record_snapshot(&self, snapshot: &MetricsSnapshot) {
        gauge!(HELD_LOCKS).set(snapshot.held_locks as f64);
        gauge!(QUEUE_DEPTH).set(snapshot.queued_total as f64);
        gauge!(EMBEDDED_MODE).set(match snapshot.mode {
            BackendMode::Embedded => 1.0,
            BackendMode::Distributed => 0.0,
        });
    }

    /// Latency of the most recent successful ping of the active backend.
    pub fn last_ping_latency_ms(&self) -> Option<f64> {
        match self.last_ping_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(micros as f64 / 1000.0),
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            grants: load(&self.grants),
            contentions: load(&self.contentions),
            timeouts: load(&self.timeouts),
            cancellations: load(&self.cancellations),
            deadlocks_broken: load(&self.deadlocks_broken),
            backend_errors: load(&self.backend_errors),
            reconciliation_conflicts: load(&self.reconciliation_conflicts),
            reconciled: load(&self.reconciled),
            expirations: load(&self.expirations),
            releases: load(&self.releases),
            fallback_transitions: load(&self.fallback_transitions),
        }
    }
}

/// Everything the metrics loop samples in one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub at: DateTime<Utc>,
    pub mode: BackendMode,
    pub held_locks: usize,
    pub queue_depths: BTreeMap<String, usize>,
    pub queued_total: usize,
    pub ping_latency_ms: Option<f64>,
    pub counters: CounterSnapshot,
}

/// Destination for periodic snapshots.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, snapshot: &MetricsSnapshot);
}

/// Emits each snapshot as one structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn publish(&self, snapshot: &MetricsSnapshot) {
        let c = &snapshot.counters;
        info!(
            target: "tflock::metrics",
            mode = %snapshot.mode,
            held = snapshot.held_locks,
            queued = snapshot.queued_total,
            ping_ms = snapshot.ping_latency_ms,
            grants = c.grants,
            contentions = c.contentions,
            timeouts = c.timeouts,
            deadlocks_broken = c.deadlocks_broken,
            backend_errors = c.backend_errors,
            reconciliation_conflicts = c.reconciliation_conflicts,
            expirations = c.expirations,
            releases = c.releases,
            fallback_transitions = c.fallback_transitions,
            "lock engine metrics"
        );
    }
}

/// Pushes snapshots to a sink and keeps the latest one for pull access.
pub struct HealthMonitor {
    sink: Box<dyn MetricsSink>,
    latest: RwLock<Option<MetricsSnapshot>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor").finish_non_exhaustive()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(Box::new(TracingSink))
    }
}

impl HealthMonitor {
    pub fn new(sink: Box<dyn MetricsSink>) -> Self {
        Self {
            sink,
            latest: RwLock::new(None),
        }
    }

    pub fn publish(&self, snapshot: MetricsSnapshot) {
        self.sink.publish(&snapshot);
        *self.latest.write().unwrap_or_else(|p| p.into_inner()) = Some(snapshot);
    }

    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Reachability of one backend, as reported by [`LockEngine::health`](crate::LockEngine::health).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendHealth {
    pub kind: BackendKind,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// On-demand health summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub mode: BackendMode,
    pub mode_since: DateTime<Utc>,
    pub backends: Vec<BackendHealth>,
    pub queued_total: usize,
    pub counters: CounterSnapshot,
}

impl HealthReport {
    /// Healthy when the backend the engine is using answers.
    pub fn is_healthy(&self) -> bool {
        let active = self.mode.backend_kind();
        self.backends
            .iter()
            .any(|b| b.kind == active && b.reachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Collect(Arc<Mutex<Vec<MetricsSnapshot>>>);

    impl MetricsSink for Collect {
        fn publish(&self, snapshot: &MetricsSnapshot) {
            self.0.lock().unwrap().push(snapshot.clone());
        }
    }

    fn snapshot(metrics: &EngineMetrics) -> MetricsSnapshot {
        MetricsSnapshot {
            at: Utc::now(),
            mode: BackendMode::Embedded,
            held_locks: 1,
            queue_depths: BTreeMap::new(),
            queued_total: 0,
            ping_latency_ms: metrics.last_ping_latency_ms(),
            counters: metrics.counters(),
        }
    }

    #[test]
    fn counters_accumulate() {
        let metrics = EngineMetrics::new();
        metrics.record_grant();
        metrics.record_grant();
        metrics.record_timeout();

        let c = metrics.counters();
        assert_eq!(c.grants, 2);
        assert_eq!(c.timeouts, 1);
        assert_eq!(c.deadlocks_broken, 0);
    }

    #[test]
    fn ping_latency_is_reported_in_ms() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.last_ping_latency_ms(), None);
        metrics.record_ping_latency(BackendKind::Embedded, Duration::from_micros(2_500));
        assert_eq!(metrics.last_ping_latency_ms(), Some(2.5));
    }

    #[test]
    fn monitor_pushes_and_keeps_latest() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let monitor = HealthMonitor::new(Box::new(Collect(collected.clone())));
        assert!(monitor.latest().is_none());

        let metrics = EngineMetrics::new();
        monitor.publish(snapshot(&metrics));
        metrics.record_release();
        monitor.publish(snapshot(&metrics));

        assert_eq!(collected.lock().unwrap().len(), 2);
        assert_eq!(monitor.latest().unwrap().counters.releases, 1);
    }

    #[test]
    fn counters_reach_the_installed_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            register_metrics();
            let metrics = EngineMetrics::new();
            metrics.record_grant();
            metrics.record_grant();
            metrics.record_fallback_transition();
            metrics.record_ping_latency(BackendKind::Distributed, Duration::from_millis(3));
            metrics.record_snapshot(&snapshot(&metrics));
        });

        let rendered = handle.render();
        assert!(rendered.contains("tflock_lock_grants_total 2"), "{rendered}");
        assert!(rendered.contains("tflock_fallback_transitions_total 1"));
        assert!(rendered.contains("tflock_held_locks 1"));
        assert!(rendered.contains("tflock_embedded_mode 1"));
        assert!(rendered.contains("tflock_backend_ping_seconds"));
        assert!(rendered.contains("backend=\"distributed\""));
    }

    #[test]
    fn snapshot_serializes_as_json() {
        let json = serde_json::to_string(&snapshot(&EngineMetrics::new())).unwrap();
        assert!(json.contains("\"mode\":\"embedded\""));
        assert!(json.contains("\"held_locks\":1"));
    }
}
