//! Error types for the locking engine.
//!
//! Uses thiserror for derive macros. Every variant maps to an exit code and to
//! a user-facing category so the job runner can tell a busy project from a
//! deadlock from a degraded lock system.

use crate::exit_codes;
use std::time::Duration;
use thiserror::Error;

/// Main error type for lock operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The storage backend could not be reached, timed out, or is corrupted.
    #[error("lock backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The queued wait exceeded the acquisition timeout.
    #[error("timed out after {}s waiting for lock '{key}'", .waited.as_secs())]
    AcquisitionTimeout { key: String, waited: Duration },

    /// This request was chosen to break a wait-for cycle.
    #[error("lock request for '{key}' by '{holder_id}' was failed to break a deadlock")]
    DeadlockBroken { key: String, holder_id: String },

    /// The caller does not hold the lock it tried to release or renew.
    #[error("'{holder_id}' does not hold lock '{key}'")]
    NotHolder { key: String, holder_id: String },

    /// A lock granted during fallback collided with a live distributed lock.
    #[error("lock '{key}' held locally by '{local_holder}' is held remotely by '{remote_holder}'")]
    ReconciliationConflict {
        key: String,
        local_holder: String,
        remote_holder: String,
    },

    /// The holder already has a queued request for this key.
    #[error("'{holder_id}' is already waiting for lock '{key}'")]
    AlreadyWaiting { key: String, holder_id: String },

    /// The caller cancelled a queued acquisition.
    #[error("lock request for '{key}' was cancelled")]
    Cancelled { key: String },

    /// A lock key component was empty or malformed.
    #[error("invalid lock key: {0}")]
    InvalidKey(String),

    /// Configuration could not be read or failed validation.
    #[error("{0}")]
    Config(String),

    /// Local filesystem failure outside of a backend operation.
    #[error("{0}")]
    Io(String),
}

/// How the job runner should present a failure to the end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Another operation is in progress; retry later.
    Busy,
    /// Deadlock victim; retry immediately.
    Deadlock,
    /// The lock system is degraded; escalate.
    Degraded,
    /// Caller or operator mistake.
    Invalid,
}

impl LockError {
    pub(crate) fn unavailable(backend: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        LockError::BackendUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the appropriate exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            LockError::BackendUnavailable { .. } => exit_codes::BACKEND_UNAVAILABLE,
            LockError::AcquisitionTimeout { .. }
            | LockError::AlreadyWaiting { .. }
            | LockError::Cancelled { .. } => exit_codes::LOCK_BUSY,
            LockError::DeadlockBroken { .. } => exit_codes::DEADLOCK_BROKEN,
            LockError::ReconciliationConflict { .. } => exit_codes::BACKEND_UNAVAILABLE,
            LockError::NotHolder { .. }
            | LockError::InvalidKey(_)
            | LockError::Config(_)
            | LockError::Io(_) => exit_codes::USER_ERROR,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            LockError::AcquisitionTimeout { .. }
            | LockError::AlreadyWaiting { .. }
            | LockError::Cancelled { .. } => ErrorCategory::Busy,
            LockError::DeadlockBroken { .. } => ErrorCategory::Deadlock,
            LockError::BackendUnavailable { .. } | LockError::ReconciliationConflict { .. } => {
                ErrorCategory::Degraded
            }
            LockError::NotHolder { .. }
            | LockError::InvalidKey(_)
            | LockError::Config(_)
            | LockError::Io(_) => ErrorCategory::Invalid,
        }
    }

    /// Whether the coordinator may retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, LockError::BackendUnavailable { .. })
    }
}

/// Result type alias for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;
