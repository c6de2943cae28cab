//! Storage backends for lock records.
//!
//! Both backends implement [`LockBackend`] with identical semantics:
//!
//! - [`EmbeddedStore`]: single-node table of JSON record files, guarded by an
//!   in-process mutex and an advisory file lock.
//! - [`DistributedStore`]: Redis-compatible cache driven through
//!   compare-and-swap primitives, shared by every engine process.
//!
//! The backend is the only writer of persisted lock state. Higher layers
//! (queue, deadlock detector, fallback) keep their bookkeeping in memory.

pub mod cache;
pub mod distributed;
pub mod embedded;

pub use cache::{CacheClient, RedisCache};
pub use distributed::DistributedStore;
pub use embedded::EmbeddedStore;

use crate::error::Result;
use crate::locks::{LockKey, LockRecord, LockRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which storage engine a backend talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Embedded,
    Distributed,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Embedded => write!(f, "embedded"),
            BackendKind::Distributed => write!(f, "distributed"),
        }
    }
}

/// Result of one `try_acquire` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOutcome {
    /// Whether the caller now holds the lock.
    pub granted: bool,
    /// The caller's new record when granted, the current holder's otherwise.
    pub record: LockRecord,
}

impl AcquireOutcome {
    pub fn granted(record: LockRecord) -> Self {
        Self {
            granted: true,
            record,
        }
    }

    pub fn contended(record: LockRecord) -> Self {
        Self {
            granted: false,
            record,
        }
    }
}

/// Uniform contract over a storage engine holding lock records with TTL.
///
/// Every method is bounded in time: adapters never wait for a lock to free up,
/// that is the coordinator's job. Storage that cannot be reached in time
/// surfaces as [`LockError::BackendUnavailable`](crate::error::LockError).
/// How an unreadable record is treated is up to each store.
pub trait LockBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Atomically create a `Held` record unless a live one exists for the key.
    ///
    /// Performs no mutation when the key is held, even by the same holder.
    fn try_acquire(&self, request: &LockRequest) -> Result<AcquireOutcome>;

    /// Delete the record if `holder_id` is its current holder.
    fn release(&self, key: &LockKey, holder_id: &str) -> Result<bool>;

    /// Push `expires_at` to `now + ttl` if `holder_id` holds a live record.
    fn renew(&self, key: &LockKey, holder_id: &str, ttl: Duration) -> Result<bool>;

    /// Current live record for the key, if any.
    fn get(&self, key: &LockKey) -> Result<Option<LockRecord>>;

    /// Snapshot of every live held record. Call again to restart.
    fn list_held(&self) -> Result<Vec<LockRecord>>;

    /// Remove held records whose `expires_at <= now`, returning them as `Expired`.
    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>>;

    /// Lightweight liveness check.
    fn ping(&self) -> Result<()>;
}
