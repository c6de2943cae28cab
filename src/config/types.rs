//! Configuration sections, enums and defaults.

use serde::{Deserialize, Serialize};

/// Which backend the engine starts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendSelection {
    /// Single-node file-backed table only.
    Embedded,
    /// Redis-compatible cache, with the embedded table as fallback target.
    Distributed,
    /// Distributed when `redis.addresses` is non-empty, else embedded.
    #[default]
    Auto,
}

impl BackendSelection {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "embedded" => Some(Self::Embedded),
            "distributed" => Some(Self::Distributed),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Named retry tunings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPreset {
    /// 1s base, 30s cap.
    Default,
    /// 500ms base, 60s cap.
    Aggressive,
    /// 2s base, 15s cap.
    Conservative,
}

/// Connection parameters for the distributed backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// `host:port` endpoints, tried in order when opening a connection.
    pub addresses: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    pub db: i64,

    /// Idle connections kept for reuse.
    pub pool_size: u32,

    pub conn_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,

    /// Rejected by validation: the lock scripts need every key on one node.
    pub cluster_mode: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            username: None,
            password: None,
            db: 0,
            pool_size: default_pool_size(),
            conn_timeout_ms: default_conn_timeout_ms(),
            read_timeout_ms: default_io_timeout_ms(),
            write_timeout_ms: default_io_timeout_ms(),
            cluster_mode: false,
        }
    }
}

/// Feature toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureToggles {
    /// When off, every request is queued with priority 0 (pure FIFO).
    pub priority_queue: bool,
    pub deadlock_detection: bool,
    /// When off, backend errors are not retried and queued waits poll at the
    /// base delay without growth.
    pub retry_mechanism: bool,
    /// Enables the periodic metrics loop.
    pub queue_monitoring: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            priority_queue: true,
            deadlock_detection: true,
            retry_mechanism: true,
            queue_monitoring: true,
        }
    }
}

/// Fallback policy between the distributed and embedded backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Keep the embedded table available as fallback target.
    pub legacy_enabled: bool,
    /// Switch backends automatically on sustained failure.
    pub auto_fallback: bool,
    /// A failure streak older than this forces the switch even below the threshold.
    pub fallback_timeout_secs: u64,
    /// Consecutive failures before switching to embedded (N).
    pub failure_threshold: u32,
    /// Consecutive successful pings before switching back (M).
    pub recovery_threshold: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            legacy_enabled: true,
            auto_fallback: true,
            fallback_timeout_secs: 30,
            failure_threshold: 3,
            recovery_threshold: 3,
        }
    }
}

/// Performance tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Cap on locks held through this engine; 0 means unlimited.
    pub max_concurrent_locks: u32,
    /// Keys whose queue head is re-dispatched per health tick.
    pub queue_batch_size: u32,
    pub acquisition_timeout_secs: u64,
    pub health_check_interval_ms: u64,
    pub metrics_interval_ms: u64,
    /// Deadlock scans run every `health_check_interval_ms * factor`.
    pub deadlock_interval_factor: u32,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_locks: 0,
            queue_batch_size: 100,
            acquisition_timeout_secs: 300,
            health_check_interval_ms: 5_000,
            metrics_interval_ms: 60_000,
            deadlock_interval_factor: 2,
        }
    }
}

/// Backoff tuning for queued waits and backend retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Overrides the explicit values below when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<RetryPreset>,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.1 = ±10%).
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            preset: None,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_percent: 0.1,
        }
    }
}

// Default value functions for serde
pub(crate) fn default_data_dir() -> std::path::PathBuf {
    std::path::PathBuf::from(".tflock")
}
pub(crate) fn default_lock_ttl_secs() -> u64 {
    2 * 60 * 60
}
pub(crate) fn default_pool_size() -> u32 {
    10
}
pub(crate) fn default_conn_timeout_ms() -> u64 {
    5_000
}
pub(crate) fn default_io_timeout_ms() -> u64 {
    3_000
}
pub(crate) fn default_true() -> bool {
    true
}
