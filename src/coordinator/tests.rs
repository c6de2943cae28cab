//! Tests for the acquisition coordinator.

use super::*;
use crate::events::EventAction;
use crate::monitor::TracingSink;
use crate::backend::{AcquireOutcome, BackendKind, CacheClient};
use crate::test_support::{MemoryCache, embedded_store, key, memory_store, test_config, wait_until};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tempfile::TempDir;

type MemoryStore = crate::backend::DistributedStore<Arc<MemoryCache>>;

fn embedded_engine_with(config: impl FnOnce(&mut EngineConfig)) -> (TempDir, LockEngine) {
    let (dir, embedded) = embedded_store();
    let mut cfg = test_config(dir.path());
    config(&mut cfg);
    let engine = LockEngine::with_backends(
        cfg,
        Backends {
            distributed: None,
            embedded: Some(embedded as Arc<dyn LockBackend>),
        },
        Box::new(TracingSink),
    )
    .unwrap();
    (dir, engine)
}

fn embedded_engine() -> (TempDir, LockEngine) {
    embedded_engine_with(|_| {})
}

struct Dual {
    _dir: TempDir,
    cache: Arc<MemoryCache>,
    distributed: Arc<MemoryStore>,
    engine: LockEngine,
}

fn dual_engine() -> Dual {
    dual_engine_with(|_| {})
}

fn dual_engine_with(config: impl FnOnce(&mut EngineConfig)) -> Dual {
    let (dir, embedded) = embedded_store();
    let (cache, distributed) = memory_store();
    let mut cfg = test_config(dir.path());
    config(&mut cfg);
    let engine = LockEngine::with_backends(
        cfg,
        Backends {
            distributed: Some(distributed.clone() as Arc<dyn LockBackend>),
            embedded: Some(embedded as Arc<dyn LockBackend>),
        },
        Box::new(TracingSink),
    )
    .unwrap();
    Dual {
        _dir: dir,
        cache,
        distributed,
        engine,
    }
}

fn held(acquisition: Acquisition) -> LockHandle {
    match acquisition {
        Acquisition::Held(handle) => handle,
        Acquisition::Queued(pending) => panic!("expected grant, queued for {}", pending.key()),
    }
}

fn queued(acquisition: Acquisition) -> PendingLock {
    match acquisition {
        Acquisition::Queued(pending) => pending,
        Acquisition::Held(handle) => panic!("expected queue, granted {}", handle.key()),
    }
}

fn granted(pending: &mut PendingLock) -> LockHandle {
    pending
        .try_wait()
        .unwrap()
        .unwrap_or_else(|| panic!("{} not granted yet", pending.holder_id()))
}

/// Embedded table whose listing stalls, so a recovery pass spends a while
/// between reading the table and switching backends.
struct SlowListing {
    table: Arc<crate::backend::EmbeddedStore>,
    delay: Duration,
}

impl LockBackend for SlowListing {
    fn kind(&self) -> BackendKind {
        self.table.kind()
    }

    fn try_acquire(&self, request: &LockRequest) -> Result<AcquireOutcome> {
        self.table.try_acquire(request)
    }

    fn release(&self, key: &LockKey, holder_id: &str) -> Result<bool> {
        self.table.release(key, holder_id)
    }

    fn renew(&self, key: &LockKey, holder_id: &str, ttl: Duration) -> Result<bool> {
        self.table.renew(key, holder_id, ttl)
    }

    fn get(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        self.table.get(key)
    }

    fn list_held(&self) -> Result<Vec<LockRecord>> {
        std::thread::sleep(self.delay);
        self.table.list_held()
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>> {
        self.table.sweep_expired(now)
    }

    fn ping(&self) -> Result<()> {
        self.table.ping()
    }
}

/// Hammer one key from `threads` workers and count overlapping holders.
///
/// Acquire failures (backend outages) skip the round; a release that fails
/// is retried until it lands so no lock outlives its worker.
fn run_contention(
    engine: &LockEngine,
    threads: usize,
    rounds: usize,
    max_hold_us: u64,
) -> (usize, usize) {
    let inside = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    let grants = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..threads)
        .map(|i| {
            let engine = engine.clone();
            let inside = inside.clone();
            let violations = violations.clone();
            let grants = grants.clone();
            std::thread::spawn(move || {
                let mut rng = rand::rng();
                for round in 0..rounds {
                    let holder = format!("job-{}-{}", i, round);
                    let Ok(handle) =
                        engine.acquire(key("default"), holder.clone(), 0, &CancellationToken::new())
                    else {
                        continue;
                    };
                    grants.fetch_add(1, Ordering::SeqCst);
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_micros(rng.random_range(0..=max_hold_us)));
                    inside.fetch_sub(1, Ordering::SeqCst);

                    if handle.release().is_err() {
                        assert!(wait_until(Duration::from_secs(5), || {
                            engine.release(&key("default"), &holder).is_ok()
                        }));
                    }
                    std::thread::sleep(Duration::from_micros(rng.random_range(0..=max_hold_us)));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    (
        violations.load(Ordering::SeqCst),
        grants.load(Ordering::SeqCst),
    )
}

#[test]
fn test_grants_free_key_immediately() {
    let (_dir, engine) = embedded_engine();

    let handle = held(engine.submit(key("default"), "pr-42-plan", 0).unwrap());
    assert_eq!(handle.holder_id(), "pr-42-plan");

    let record = engine.get_lock(&key("default")).unwrap().unwrap();
    assert_eq!(record.holder_id, "pr-42-plan");
    assert_eq!(engine.metrics().counters().grants, 1);
}

#[test]
fn test_plan_handoff_between_pull_requests() {
    let (_dir, engine) = embedded_engine();

    let first = held(engine.submit(key("default"), "pr-42-plan", 0).unwrap());
    let pending = queued(engine.submit(key("default"), "pr-43-plan", 0).unwrap());
    assert_eq!(pending.position(), Some(0));
    assert_eq!(engine.queue_depth(&key("default")), 1);

    assert!(first.release().unwrap());

    let second = pending.wait().unwrap();
    assert_eq!(second.holder_id(), "pr-43-plan");
    assert_eq!(
        engine.get_lock(&key("default")).unwrap().unwrap().holder_id,
        "pr-43-plan"
    );
    assert_eq!(engine.queue_depth(&key("default")), 0);
}

#[test]
fn test_blocking_acquire_waits_for_release() {
    let (_dir, engine) = embedded_engine();
    let first = held(engine.submit(key("default"), "pr-1", 0).unwrap());

    let waiter = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            engine
                .acquire(key("default"), "pr-2", 0, &CancellationToken::new())
                .map(|h| h.holder_id().to_string())
        })
    };

    assert!(wait_until(Duration::from_secs(2), || {
        engine.queue_depth(&key("default")) == 1
    }));
    drop(first);

    assert_eq!(waiter.join().unwrap().unwrap(), "pr-2");
}

#[test]
fn test_mutual_exclusion_under_contention() {
    let (_dir, engine) = embedded_engine();
    let inside = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            let inside = inside.clone();
            let violations = violations.clone();
            std::thread::spawn(move || {
                for round in 0..3 {
                    let handle = engine
                        .acquire(
                            key("default"),
                            format!("job-{}-{}", i, round),
                            0,
                            &CancellationToken::new(),
                        )
                        .unwrap();
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    assert!(handle.release().unwrap());
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(engine.metrics().counters().grants, 24);
    assert!(engine.get_lock(&key("default")).unwrap().is_none());
}

#[test]
fn test_mutual_exclusion_randomized() {
    let mut rng = rand::rng();
    for _ in 0..4 {
        let threads = rng.random_range(2..=10);
        let rounds = rng.random_range(1..=4);
        let max_hold_us = rng.random_range(0..=3_000);

        let (_dir, engine) = embedded_engine();
        let (violations, grants) = run_contention(&engine, threads, rounds, max_hold_us);
        assert_eq!(violations, 0, "embedded: {threads} threads x {rounds} rounds");
        assert_eq!(grants, threads * rounds);

        let dual = dual_engine();
        let (violations, grants) = run_contention(&dual.engine, threads, rounds, max_hold_us);
        assert_eq!(violations, 0, "distributed: {threads} threads x {rounds} rounds");
        assert_eq!(grants, threads * rounds);
        assert!(dual.distributed.get(&key("default")).unwrap().is_none());
    }
}

#[test]
fn test_mutual_exclusion_across_backend_switches() {
    let dual = dual_engine();
    let stop = Arc::new(AtomicBool::new(false));

    let flapper = {
        let engine = dual.engine.clone();
        let cache = dual.cache.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut rng = rand::rng();
            let mut switches = 0;
            while !stop.load(Ordering::SeqCst) {
                cache.set_available(switches % 2 == 1);
                for _ in 0..2 {
                    engine.health_tick();
                }
                switches += 1;
                std::thread::sleep(Duration::from_millis(rng.random_range(5..=30)));
            }
            cache.set_available(true);
            switches
        })
    };

    let (violations, grants) = run_contention(&dual.engine, 6, 8, 2_000);
    stop.store(true, Ordering::SeqCst);
    let switches = flapper.join().unwrap();

    assert_eq!(violations, 0, "{grants} grants over {switches} outage flips");
    assert!(grants > 0);
}

#[test]
fn test_priority_then_fifo_grant_order() {
    let (_dir, engine) = embedded_engine();
    let holder = held(engine.submit(key("default"), "holder", 0).unwrap());

    let mut low_a = queued(engine.submit(key("default"), "low-a", 0).unwrap());
    let mut high_a = queued(engine.submit(key("default"), "high-a", 5).unwrap());
    let mut low_b = queued(engine.submit(key("default"), "low-b", 0).unwrap());
    let mut high_b = queued(engine.submit(key("default"), "high-b", 5).unwrap());
    assert_eq!(high_a.position(), Some(0));
    assert_eq!(low_b.position(), Some(3));

    holder.release().unwrap();
    let h = granted(&mut high_a);
    assert!(low_a.try_wait().unwrap().is_none());

    h.release().unwrap();
    let h = granted(&mut high_b);
    h.release().unwrap();
    let h = granted(&mut low_a);
    h.release().unwrap();
    let h = granted(&mut low_b);
    assert_eq!(h.holder_id(), "low-b");
}

#[test]
fn test_fifo_when_priority_queue_disabled() {
    let (_dir, engine) = embedded_engine_with(|c| c.features.priority_queue = false);
    let holder = held(engine.submit(key("default"), "holder", 0).unwrap());

    let mut first = queued(engine.submit(key("default"), "first", 0).unwrap());
    let mut urgent = queued(engine.submit(key("default"), "urgent", 100).unwrap());

    holder.release().unwrap();
    let h = granted(&mut first);
    assert!(urgent.try_wait().unwrap().is_none());
    h.release().unwrap();
    granted(&mut urgent);
}

#[test]
fn test_release_is_idempotent() {
    let (_dir, engine) = embedded_engine();
    let handle = held(engine.submit(key("default"), "pr-1", 0).unwrap());

    assert!(engine.release(&key("default"), "pr-1").unwrap());
    assert!(!engine.release(&key("default"), "pr-1").unwrap());
    assert!(!handle.release().unwrap());
    assert!(!engine.release(&key("default"), "never-held").unwrap());
    assert_eq!(engine.metrics().counters().releases, 1);
}

#[test]
fn test_renew_extends_expiry() {
    let (_dir, engine) = embedded_engine();
    let mut handle = held(engine.submit(key("default"), "pr-1", 0).unwrap());
    let before = handle.record().expires_at;

    std::thread::sleep(Duration::from_millis(10));
    assert!(handle.renew().unwrap());
    assert!(handle.record().expires_at > before);

    engine.release(&key("default"), "pr-1").unwrap();
    assert!(!handle.renew().unwrap());
}

#[test]
fn test_expired_lock_is_swept_and_handed_off() {
    let (_dir, engine) = embedded_engine_with(|c| c.lock_ttl_secs = 1);
    let stale = held(engine.submit(key("default"), "pr-1", 0).unwrap()).detach();
    let mut pending = queued(engine.submit(key("default"), "pr-2", 0).unwrap());

    std::thread::sleep(Duration::from_millis(1_100));
    let swept = engine.sweep_expired();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].holder_id, stale.holder_id);

    let handle = granted(&mut pending);
    assert_eq!(handle.holder_id(), "pr-2");
    assert_eq!(engine.metrics().counters().expirations, 1);

    let actions: Vec<_> = engine
        .audit()
        .read_all()
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&EventAction::LockExpired));
}

#[test]
fn test_queued_request_times_out() {
    let (_dir, engine) = embedded_engine_with(|c| c.performance.acquisition_timeout_secs = 1);
    let _holder = held(engine.submit(key("default"), "pr-1", 0).unwrap());

    let started = Instant::now();
    let err = engine
        .acquire(key("default"), "pr-2", 0, &CancellationToken::new())
        .unwrap_err();

    assert!(matches!(err, LockError::AcquisitionTimeout { .. }));
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(engine.queue_depth(&key("default")), 0);
    assert_eq!(engine.metrics().counters().timeouts, 1);
}

#[test]
fn test_overdue_tickets_expire_without_waiter() {
    let (_dir, engine) = embedded_engine_with(|c| c.performance.acquisition_timeout_secs = 1);
    let _holder = held(engine.submit(key("default"), "pr-1", 0).unwrap());
    let mut pending = queued(engine.submit(key("default"), "pr-2", 0).unwrap());

    std::thread::sleep(Duration::from_millis(1_050));
    assert_eq!(engine.expire_overdue(), 1);
    assert!(matches!(
        pending.try_wait(),
        Err(LockError::AcquisitionTimeout { .. })
    ));
}

#[test]
fn test_cancellation_token_stops_waiting() {
    let (_dir, engine) = embedded_engine();
    let _holder = held(engine.submit(key("default"), "pr-1", 0).unwrap());
    let token = CancellationToken::new();

    let waiter = {
        let engine = engine.clone();
        let token = token.clone();
        std::thread::spawn(move || engine.acquire(key("default"), "pr-2", 0, &token))
    };

    assert!(wait_until(Duration::from_secs(2), || {
        engine.queue_depth(&key("default")) == 1
    }));
    token.cancel();

    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, LockError::Cancelled { .. }));
    assert_eq!(engine.queue_depth(&key("default")), 0);
    assert_eq!(engine.metrics().counters().cancellations, 1);

    // A cancelled token refuses new work up front.
    assert!(matches!(
        engine.acquire(key("staging"), "pr-3", 0, &token),
        Err(LockError::Cancelled { .. })
    ));
}

#[test]
fn test_dropping_pending_lock_leaves_queue() {
    let (_dir, engine) = embedded_engine();
    let holder = held(engine.submit(key("default"), "pr-1", 0).unwrap());

    let pending = queued(engine.submit(key("default"), "pr-2", 0).unwrap());
    drop(pending);
    assert_eq!(engine.queue_depth(&key("default")), 0);

    holder.release().unwrap();
    assert!(engine.get_lock(&key("default")).unwrap().is_none());
}

#[test]
fn test_cancel_after_grant_releases_lock() {
    let (_dir, engine) = embedded_engine();
    let holder = held(engine.submit(key("default"), "pr-1", 0).unwrap());
    let pending = queued(engine.submit(key("default"), "pr-2", 0).unwrap());

    // Release grants pr-2 on its behalf before it gets to wait.
    holder.release().unwrap();
    assert_eq!(
        engine.get_lock(&key("default")).unwrap().unwrap().holder_id,
        "pr-2"
    );

    pending.cancel();
    assert!(engine.get_lock(&key("default")).unwrap().is_none());
}

#[test]
fn test_holder_cannot_queue_twice_for_same_key() {
    let (_dir, engine) = embedded_engine();
    let _holder = held(engine.submit(key("default"), "pr-1", 0).unwrap());
    let _pending = queued(engine.submit(key("default"), "pr-2", 0).unwrap());

    let err = engine.submit(key("default"), "pr-2", 0).unwrap_err();
    assert!(matches!(err, LockError::AlreadyWaiting { .. }));
}

#[test]
fn test_same_holder_reacquire_is_reentrant() {
    let (_dir, engine) = embedded_engine();
    let first = held(engine.submit(key("default"), "pr-1", 0).unwrap()).detach();
    let again = held(engine.submit(key("default"), "pr-1", 0).unwrap());
    assert_eq!(again.record().acquired_at, first.acquired_at);
}

#[test]
fn test_reentrant_handles_share_one_lock() {
    let (_dir, engine) = embedded_engine();
    let first = held(engine.submit(key("default"), "pr-1", 0).unwrap());
    let second = held(engine.submit(key("default"), "pr-1", 0).unwrap());

    // Either handle frees the lock for everyone.
    drop(second);
    assert!(engine.get_lock(&key("default")).unwrap().is_none());
    assert!(!first.release().unwrap());
}

#[test]
fn test_empty_holder_id_is_rejected() {
    let (_dir, engine) = embedded_engine();
    assert!(matches!(
        engine.submit(key("default"), "  ", 0),
        Err(LockError::InvalidKey(_))
    ));
}

#[test]
fn test_expired_distributed_lock_frees_capacity() {
    let dual = dual_engine_with(|c| {
        c.lock_ttl_secs = 1;
        c.performance.max_concurrent_locks = 1;
    });
    let engine = &dual.engine;
    held(engine.submit(key("a"), "pr-1", 0).unwrap()).detach();
    // Dropping the pending request leaves the queue again.
    queued(engine.submit(key("b"), "pr-2", 0).unwrap());

    // The cache drops the entry itself, so the sweep never sees it.
    std::thread::sleep(Duration::from_millis(1_200));
    assert!(engine.sweep_expired().is_empty());
    engine.health_tick();

    let handle = held(engine.submit(key("b"), "pr-2", 0).unwrap());
    assert_eq!(handle.holder_id(), "pr-2");
}

#[test]
fn test_max_concurrent_locks_queues_excess() {
    let (_dir, engine) = embedded_engine_with(|c| c.performance.max_concurrent_locks = 1);
    let first = held(engine.submit(key("a"), "pr-1", 0).unwrap());
    let mut pending = queued(engine.submit(key("b"), "pr-2", 0).unwrap());

    first.release().unwrap();
    engine.health_tick();
    granted(&mut pending);
}

#[test]
fn test_deadlock_two_cycle_fails_newest_request() {
    let (_dir, engine) = embedded_engine();
    let _a = held(engine.submit(key("a"), "pr-1", 0).unwrap());
    let b = held(engine.submit(key("b"), "pr-2", 0).unwrap());

    let mut first_wait = queued(engine.submit(key("b"), "pr-1", 0).unwrap());
    let second_wait = queued(engine.submit(key("a"), "pr-2", 0).unwrap());

    let reports = engine.detect_deadlocks().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].victim.holder_id, "pr-2");

    let err = second_wait.wait().unwrap_err();
    assert_eq!(
        err,
        LockError::DeadlockBroken {
            key: key("a").to_string(),
            holder_id: "pr-2".to_string(),
        }
    );
    assert_eq!(err.exit_code(), crate::exit_codes::DEADLOCK_BROKEN);
    assert_eq!(first_wait.position(), Some(0));
    assert_eq!(engine.metrics().counters().deadlocks_broken, 1);

    // The survivor proceeds once the victim's job lets go.
    drop(b);
    granted(&mut first_wait);
    assert!(engine.detect_deadlocks().unwrap().is_empty());
}

#[test]
fn test_deadlock_scan_sees_residual_local_locks() {
    let dual = dual_engine();
    let engine = &dual.engine;
    let token = CancellationToken::new();

    dual.cache.set_available(false);
    let _local = engine.acquire(key("b"), "pr-2", 0, &token).unwrap();
    dual.cache.set_available(true);

    // Reconciliation loses key b to a remote holder, who then leaves.
    let remote = LockRequest::new(key("b"), "pr-9", Duration::from_secs(60));
    assert!(dual.distributed.try_acquire(&remote).unwrap().granted);
    engine.health_tick();
    engine.health_tick();
    assert_eq!(engine.mode(), BackendMode::Distributed);
    assert!(dual.distributed.release(&key("b"), "pr-9").unwrap());

    let _a = held(engine.submit(key("a"), "pr-1", 0).unwrap());
    let _first_wait = queued(engine.submit(key("b"), "pr-1", 0).unwrap());
    let second_wait = queued(engine.submit(key("a"), "pr-2", 0).unwrap());

    let reports = engine.detect_deadlocks().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].victim.holder_id, "pr-2");
    assert!(matches!(
        second_wait.wait(),
        Err(LockError::DeadlockBroken { .. })
    ));
}

#[test]
fn test_deadlock_scan_sees_locks_from_before_fallback() {
    let dual = dual_engine();
    let engine = &dual.engine;
    let _a = held(engine.submit(key("a"), "pr-1", 0).unwrap());

    dual.cache.set_available(false);
    engine.health_tick();
    engine.health_tick();
    assert_eq!(engine.mode(), BackendMode::Embedded);

    let _b = held(engine.submit(key("b"), "pr-2", 0).unwrap());
    let _first_wait = queued(engine.submit(key("b"), "pr-1", 0).unwrap());
    let _second_wait = queued(engine.submit(key("a"), "pr-2", 0).unwrap());

    let reports = engine.detect_deadlocks().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].victim.holder_id, "pr-2");
}

#[test]
fn test_deadlock_detection_toggle() {
    let (_dir, engine) = embedded_engine_with(|c| c.features.deadlock_detection = false);
    let _a = held(engine.submit(key("a"), "pr-1", 0).unwrap());
    let _b = held(engine.submit(key("b"), "pr-2", 0).unwrap());
    let _w1 = queued(engine.submit(key("b"), "pr-1", 0).unwrap());
    let _w2 = queued(engine.submit(key("a"), "pr-2", 0).unwrap());

    assert!(engine.detect_deadlocks().unwrap().is_empty());
}

#[test]
fn test_fallback_round_trip_reconciles_locks() {
    let dual = dual_engine();
    let engine = &dual.engine;
    let token = CancellationToken::new();
    assert_eq!(engine.mode(), BackendMode::Distributed);

    let before_outage = engine.acquire(key("a"), "pr-1", 0, &token).unwrap();

    dual.cache.set_available(false);
    let during_outage = engine.acquire(key("b"), "pr-2", 0, &token).unwrap();
    assert_eq!(engine.mode(), BackendMode::Embedded);
    assert!(during_outage.record().pending_migration);

    // Locks granted before the outage stay releasable once the cache answers.
    dual.cache.set_available(true);
    assert!(before_outage.release().unwrap());

    engine.health_tick();
    assert_eq!(engine.mode(), BackendMode::Embedded);
    engine.health_tick();
    assert_eq!(engine.mode(), BackendMode::Distributed);

    let migrated = dual.distributed.get(&key("b")).unwrap().unwrap();
    assert_eq!(migrated.holder_id, "pr-2");

    // No duplicate grant after the switch back.
    let mut waiter = queued(engine.submit(key("b"), "pr-3", 0).unwrap());
    assert!(during_outage.release().unwrap());
    assert_eq!(granted(&mut waiter).holder_id(), "pr-3");

    let actions: Vec<_> = engine
        .audit()
        .read_all()
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions
            .iter()
            .filter(|a| **a == EventAction::ModeTransition)
            .count(),
        2
    );
    assert!(actions.contains(&EventAction::Reconciled));
}

#[test]
fn test_reconciliation_conflict_keeps_local_lock() {
    let dual = dual_engine();
    let engine = &dual.engine;
    let token = CancellationToken::new();

    dual.cache.set_available(false);
    let local = engine.acquire(key("b"), "pr-2", 0, &token).unwrap();
    assert_eq!(engine.mode(), BackendMode::Embedded);
    dual.cache.set_available(true);

    // Another engine grabbed the key in the cache meanwhile.
    let remote = LockRequest::new(key("b"), "pr-9", Duration::from_secs(60));
    assert!(dual.distributed.try_acquire(&remote).unwrap().granted);

    engine.health_tick();
    engine.health_tick();
    assert_eq!(engine.mode(), BackendMode::Distributed);
    assert_eq!(engine.metrics().counters().reconciliation_conflicts, 1);

    // The remote holder leaves, but the local lock still blocks the key.
    assert!(dual.distributed.release(&key("b"), "pr-9").unwrap());
    let mut waiter = queued(engine.submit(key("b"), "pr-5", 0).unwrap());

    assert!(local.release().unwrap());
    assert_eq!(granted(&mut waiter).holder_id(), "pr-5");
}

#[test]
fn test_fallback_respects_locks_granted_before_outage() {
    let dual = dual_engine();
    let engine = &dual.engine;
    let first = held(engine.submit(key("a"), "pr-1", 0).unwrap());

    dual.cache.set_available(false);
    engine.health_tick();
    engine.health_tick();
    assert_eq!(engine.mode(), BackendMode::Embedded);
    // The unreachable cache cannot confirm the lock, so it is kept.
    engine.health_tick();

    let mut waiter = queued(engine.submit(key("a"), "pr-2", 0).unwrap());
    let again = held(engine.submit(key("a"), "pr-1", 0).unwrap()).detach();
    assert_eq!(again.acquired_at, first.record().acquired_at);
    assert!(waiter.try_wait().unwrap().is_none());

    dual.cache.set_available(true);
    assert!(first.release().unwrap());
    assert_eq!(granted(&mut waiter).holder_id(), "pr-2");
}

#[test]
fn test_grant_during_recovery_is_migrated() {
    let (dir, table) = embedded_store();
    let (cache, distributed) = memory_store();
    let engine = LockEngine::with_backends(
        test_config(dir.path()),
        Backends {
            distributed: Some(distributed.clone() as Arc<dyn LockBackend>),
            embedded: Some(Arc::new(SlowListing {
                table,
                delay: Duration::from_millis(300),
            }) as Arc<dyn LockBackend>),
        },
        Box::new(TracingSink),
    )
    .unwrap();

    cache.set_available(false);
    engine.health_tick();
    engine.health_tick();
    assert_eq!(engine.mode(), BackendMode::Embedded);
    cache.set_available(true);
    engine.health_tick();
    assert_eq!(engine.mode(), BackendMode::Embedded);

    // This tick reconciles and switches back while the submit below runs.
    let recovery = {
        let engine = engine.clone();
        std::thread::spawn(move || engine.health_tick())
    };
    std::thread::sleep(Duration::from_millis(100));
    let first = held(engine.submit(key("c"), "pr-7", 0).unwrap());
    recovery.join().unwrap();
    assert_eq!(engine.mode(), BackendMode::Distributed);

    assert_eq!(
        distributed.get(&key("c")).unwrap().unwrap().holder_id,
        "pr-7"
    );
    let mut waiter = queued(engine.submit(key("c"), "pr-8", 0).unwrap());
    assert!(first.release().unwrap());
    assert_eq!(granted(&mut waiter).holder_id(), "pr-8");
}

#[test]
fn test_unreadable_cache_entry_does_not_trigger_fallback() {
    let dual = dual_engine();
    let engine = &dual.engine;
    dual.cache
        .set_if_absent(&key("bad").storage_key(), "garbage", Duration::from_secs(60))
        .unwrap();

    let handle = held(engine.submit(key("bad"), "pr-1", 0).unwrap());
    assert_eq!(engine.mode(), BackendMode::Distributed);
    assert_eq!(engine.metrics().counters().backend_errors, 0);
    assert_eq!(
        dual.distributed.get(&key("bad")).unwrap().unwrap().holder_id,
        "pr-1"
    );
    assert!(handle.release().unwrap());
}

#[test]
fn test_outage_without_fallback_surfaces_error() {
    let (dir, _) = embedded_store();
    let (cache, distributed) = memory_store();
    let engine = LockEngine::with_backends(
        test_config(dir.path()),
        Backends {
            distributed: Some(distributed as Arc<dyn LockBackend>),
            embedded: None,
        },
        Box::new(TracingSink),
    )
    .unwrap();

    cache.set_available(false);
    let err = engine
        .acquire(key("a"), "pr-1", 0, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, LockError::BackendUnavailable { .. }));
    assert_eq!(err.exit_code(), crate::exit_codes::BACKEND_UNAVAILABLE);
    assert_eq!(engine.mode(), BackendMode::Distributed);
}

#[test]
fn test_unlock_by_pull_releases_matching_holders() {
    let (_dir, engine) = embedded_engine();
    let other_repo = LockKey::new("org/other", "envs/prod", "default").unwrap();

    held(engine.submit(key("a"), "pr-7-plan", 0).unwrap()).detach();
    held(engine.submit(key("b"), "pr-7", 0).unwrap()).detach();
    held(engine.submit(key("c"), "pr-70-plan", 0).unwrap()).detach();
    held(engine.submit(other_repo.clone(), "pr-7-plan", 0).unwrap()).detach();

    let released = engine.unlock_by_pull("org/repo", 7).unwrap();
    let keys: Vec<_> = released.iter().map(|r| r.key.clone()).collect();
    assert_eq!(keys, vec![key("a"), key("b")]);

    assert!(engine.get_lock(&key("c")).unwrap().is_some());
    assert!(engine.get_lock(&other_repo).unwrap().is_some());
    assert!(engine.unlock_by_pull("org/repo", 7).unwrap().is_empty());
}

#[test]
fn test_clear_lock_is_audited() {
    let (_dir, engine) = embedded_engine();
    held(engine.submit(key("a"), "pr-1", 0).unwrap()).detach();

    let cleared = engine.clear_lock(&key("a")).unwrap().unwrap();
    assert_eq!(cleared.holder_id, "pr-1");
    assert!(engine.clear_lock(&key("a")).unwrap().is_none());

    let events = engine.audit().read_all().unwrap();
    assert_eq!(events.last().unwrap().action, EventAction::LockClear);
}

#[test]
fn test_list_locks_sorted_by_key() {
    let (_dir, engine) = embedded_engine();
    let _b = held(engine.submit(key("b"), "pr-2", 0).unwrap());
    let _a = held(engine.submit(key("a"), "pr-1", 0).unwrap());

    let locks = engine.list_locks().unwrap();
    assert_eq!(locks.len(), 2);
    assert_eq!(locks[0].key, key("a"));
}

#[test]
fn test_health_report_lists_backends() {
    let dual = dual_engine();
    let report = dual.engine.health();
    assert_eq!(report.mode, BackendMode::Distributed);
    assert_eq!(report.backends.len(), 2);
    assert!(report.is_healthy());

    dual.cache.set_available(false);
    let report = dual.engine.health();
    assert!(!report.is_healthy());
    assert!(report.backends[0].error.is_some());
}

#[test]
fn test_background_tasks_hand_off_expired_lock() {
    let (_dir, engine) = embedded_engine_with(|c| c.lock_ttl_secs = 1);
    held(engine.submit(key("default"), "pr-1", 0).unwrap()).detach();
    let mut pending = queued(engine.submit(key("default"), "pr-2", 0).unwrap());

    let tasks = engine.start_background().unwrap();
    assert_eq!(tasks.thread_count(), 3);

    let mut handle = None;
    assert!(wait_until(Duration::from_secs(3), || {
        handle = pending.try_wait().unwrap();
        handle.is_some()
    }));
    assert!(wait_until(Duration::from_secs(1), || engine
        .monitor()
        .latest()
        .is_some()));

    tasks.shutdown();
    assert_eq!(handle.unwrap().holder_id(), "pr-2");
}

#[test]
fn test_publish_metrics_reports_queue_depth() {
    let (_dir, engine) = embedded_engine();
    let _holder = held(engine.submit(key("default"), "pr-1", 0).unwrap());
    let _pending = queued(engine.submit(key("default"), "pr-2", 0).unwrap());

    let snapshot = engine.publish_metrics();
    assert_eq!(snapshot.held_locks, 1);
    assert_eq!(snapshot.queued_total, 1);
    assert_eq!(snapshot.queue_depths[&key("default").to_string()], 1);
    assert_eq!(snapshot.counters.contentions, 1);
    assert_eq!(engine.monitor().latest(), Some(snapshot));
}
