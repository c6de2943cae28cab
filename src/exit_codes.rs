//! Exit code constants for the tflock CLI.
//!
//! - 0: Success
//! - 1: User error (bad args, invalid config, invalid key)
//! - 2: Lock busy (acquisition timed out or was cancelled)
//! - 3: Lock backend unavailable
//! - 4: Acquisition failed to break a deadlock

/// Successful execution.
pub const SUCCESS: i32 = 0;

/// User error: bad arguments, invalid configuration, or invalid lock key.
pub const USER_ERROR: i32 = 1;

/// Another operation holds the lock and the wait did not succeed.
pub const LOCK_BUSY: i32 = 2;

/// Neither the distributed nor the embedded backend could serve the request.
pub const BACKEND_UNAVAILABLE: i32 = 3;

/// The request was chosen as the victim of a detected deadlock.
pub const DEADLOCK_BROKEN: i32 = 4;
