//! EngineConfig struct definition and default implementation.

use super::types::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Immutable configuration snapshot for one engine instance.
///
/// This struct represents the contents of `tflock.yaml`. Unknown fields are
/// ignored for forward compatibility. Build it once at startup and share it by
/// `Arc`; changing settings means building a new engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // =========================================================================
    // Storage
    // =========================================================================
    #[serde(default)]
    pub backend: BackendSelection,

    /// Directory holding the embedded lock table and the audit log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Lifetime of a held lock without renewal.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Whether to append transitions to `<data_dir>/events.ndjson`.
    #[serde(default = "default_true")]
    pub audit_log: bool,

    #[serde(default)]
    pub redis: RedisConfig,

    // =========================================================================
    // Behaviour
    // =========================================================================
    #[serde(default)]
    pub features: FeatureToggles,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendSelection::default(),
            data_dir: default_data_dir(),
            lock_ttl_secs: default_lock_ttl_secs(),
            audit_log: default_true(),
            redis: RedisConfig::default(),
            features: FeatureToggles::default(),
            fallback: FallbackConfig::default(),
            performance: PerformanceConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Whether the engine should start against the distributed backend.
    pub fn uses_distributed(&self) -> bool {
        match self.backend {
            BackendSelection::Embedded => false,
            BackendSelection::Distributed => true,
            BackendSelection::Auto => !self.redis.addresses.is_empty(),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_secs(self.performance.acquisition_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.performance.health_check_interval_ms)
    }

    pub fn deadlock_interval(&self) -> Duration {
        self.health_check_interval() * self.performance.deadlock_interval_factor.max(1)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.performance.metrics_interval_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback.fallback_timeout_secs)
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_millis(self.redis.conn_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.redis.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.redis.write_timeout_ms)
    }
}
