//! Lock model: keys, records, and the handle returned to lock holders.
//!
//! # Keys
//!
//! A [`LockKey`] names one Terraform project-workspace:
//! `(repository, project_path, workspace)`. Both backends persist it under
//! the storage key `atlantis:enhanced:lock:<repo>/<project>/<workspace>`.
//!
//! # Records
//!
//! A [`LockRecord`] is the JSON value stored for a held key:
//! - `holder_id`: opaque id of the job holding the lock (e.g. `pr-42-plan`)
//! - `acquired_at` / `expires_at`: RFC3339 timestamps, `expires_at` pushed
//!   forward by renewals
//! - `priority`, `state`, `pending_migration`, and `owner` (`user@HOST`)
//!
//! A record whose `expires_at` has passed no longer blocks anyone, whether or
//! not the backend has removed it yet.
//!
//! # RAII Handles
//!
//! Granted locks are returned as [`LockHandle`]s that release the lock when
//! dropped. If the release fails during drop, a warning is logged but the
//! program does not crash.

mod guard;
pub mod key;
pub mod record;

// Re-export public API
pub use guard::LockHandle;
pub use key::{KEY_PREFIX, LockKey};
pub use record::{LockRecord, LockRequest, LockState};
