//! Shared fixtures for unit tests.

use crate::backend::{CacheClient, DistributedStore, EmbeddedStore};
use crate::config::EngineConfig;
use crate::error::{LockError, Result};
use crate::locks::LockKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// In-process stand-in for Redis with switchable availability.
#[derive(Debug, Default)]
pub(crate) struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub(crate) fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LockError::unavailable("distributed", "connection refused"))
        } else {
            Ok(())
        }
    }

    /// Live entries only; expired ones are dropped on access like a real cache.
    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        entries
    }
}

impl CacheClient for MemoryCache {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let mut entries = self.live();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.live().get(key).map(|(value, _)| value.clone()))
    }

    fn replace_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.check()?;
        let mut entries = self.live();
        match entries.get(key) {
            Some((current, _)) if current == expected => {
                entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        self.check()?;
        let mut entries = self.live();
        match entries.get(key) {
            Some((current, _)) if current == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut keys: Vec<String> = self
            .live()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn ping(&self) -> Result<()> {
        self.check()
    }
}

/// Config tuned for fast tests: short intervals, no jitter, no background noise.
pub(crate) fn test_config(data_dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.data_dir = data_dir.to_path_buf();
    config.lock_ttl_secs = 60;
    config.performance.acquisition_timeout_secs = 5;
    config.performance.health_check_interval_ms = 20;
    config.performance.metrics_interval_ms = 50;
    config.performance.deadlock_interval_factor = 1;
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    config.retry.jitter_percent = 0.0;
    config.fallback.failure_threshold = 2;
    config.fallback.recovery_threshold = 2;
    config
}

/// Embedded store in a fresh temp dir.
pub(crate) fn embedded_store() -> (TempDir, Arc<EmbeddedStore>) {
    let temp_dir = TempDir::new().unwrap();
    let store = EmbeddedStore::open(temp_dir.path()).unwrap();
    (temp_dir, Arc::new(store))
}

/// Distributed store over a shared [`MemoryCache`] the test can take down.
pub(crate) fn memory_store() -> (Arc<MemoryCache>, Arc<DistributedStore<Arc<MemoryCache>>>) {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(DistributedStore::new(cache.clone()));
    (cache, store)
}

pub(crate) fn key(workspace: &str) -> LockKey {
    LockKey::new("org/repo", "envs/prod", workspace).unwrap()
}

/// Poll `cond` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
