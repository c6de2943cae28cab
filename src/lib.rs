//! tflock: locking engine for Terraform pull-request automation.
//!
//! Jobs triggered by pull-request events take an exclusive lock on a
//! `(repository, project_path, workspace)` triple before planning or applying.
//! The [`LockEngine`] hands out those locks against a Redis-compatible cache,
//! falls back to a file-backed table on the local node when the cache is down,
//! queues contended requests by priority, and breaks wait-for cycles.
//!
//! ```no_run
//! use tflock::{CancellationToken, EngineConfig, LockEngine, LockKey};
//!
//! # fn main() -> tflock::Result<()> {
//! let engine = LockEngine::new(EngineConfig::load_or_default("tflock.yaml")?)?;
//! let _background = engine.start_background()?;
//!
//! let key = LockKey::new("org/infra", "envs/prod", "default")?;
//! let lock = engine.acquire(key, "pr-42-plan", 0, &CancellationToken::new())?;
//! // ... run terraform plan ...
//! lock.release()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod deadlock;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod fallback;
pub mod fs;
pub mod locks;
pub mod monitor;
pub mod queue;
pub mod retry;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use coordinator::{Acquisition, Backends, BackgroundTasks, CancellationToken, LockEngine, PendingLock};
pub use error::{LockError, Result};
pub use fallback::BackendMode;
pub use locks::{LockHandle, LockKey, LockRecord};
