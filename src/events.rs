//! Audit log for lock-system transitions.
//!
//! Events are appended in NDJSON format (one JSON object per line) to
//! `<data_dir>/events.ndjson`. The log records what operators need to
//! reconstruct an incident: backend mode transitions, reconciliation results,
//! deadlock victims, expirations and manual clears.
//!
//! # Event Format
//!
//! - `ts`: RFC3339 timestamp
//! - `action`: what happened (`mode_transition`, `deadlock_broken`, ...)
//! - `actor`: the `user@HOST` of the engine process
//! - `key`: optional lock key the event concerns
//! - `details`: freeform object with action-specific fields
//!
//! Audit writes are best effort. A failed append is logged and never fails the
//! lock operation that produced it.

use crate::error::{LockError, Result};
use crate::locks::LockKey;
use crate::locks::record::owner_string;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// File name of the audit log inside the data directory.
pub const EVENTS_FILE_NAME: &str = "events.ndjson";

/// Actions that can be logged as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// Backend mode switched between distributed and embedded.
    ModeTransition,
    /// A fallback lock was migrated to the distributed store.
    Reconciled,
    /// A fallback lock collided with a live distributed lock.
    ReconciliationConflict,
    /// A waiter was failed to break a wait-for cycle.
    DeadlockBroken,
    /// A held lock passed its expiry and was swept.
    LockExpired,
    /// Lock cleared manually by an operator.
    LockClear,
    /// All locks of a pull request released at once.
    UnlockPull,
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventAction::ModeTransition => write!(f, "mode_transition"),
            EventAction::Reconciled => write!(f, "reconciled"),
            EventAction::ReconciliationConflict => write!(f, "reconciliation_conflict"),
            EventAction::DeadlockBroken => write!(f, "deadlock_broken"),
            EventAction::LockExpired => write!(f, "lock_expired"),
            EventAction::LockClear => write!(f, "lock_clear"),
            EventAction::UnlockPull => write!(f, "unlock_pull"),
        }
    }
}

/// An event record for the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,

    pub action: EventAction,

    /// The engine process that performed the action (e.g., `user@HOST`).
    pub actor: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    pub details: Value,
}

impl Event {
    pub fn new(action: EventAction) -> Self {
        Self {
            ts: Utc::now(),
            action,
            actor: owner_string(),
            key: None,
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_key(mut self, key: &LockKey) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Serialize the event to a single-line JSON string.
    pub fn to_ndjson_line(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| LockError::Io(format!("failed to serialize event to JSON: {}", e)))
    }
}

/// Append-only NDJSON sink. A disabled log drops every event.
#[derive(Debug)]
pub struct AuditLog {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(EVENTS_FILE_NAME))
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an event, logging instead of failing when the write does not succeed.
    pub fn record(&self, event: Event) {
        if let Err(e) = self.append(&event) {
            warn!(action = %event.action, error = %e, "failed to append audit event");
        }
    }

    /// Append an event, creating the file and its directory on first use.
    pub fn append(&self, event: &Event) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json_line = event.to_ndjson_line()?;
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                LockError::Io(format!(
                    "failed to create events directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                LockError::Io(format!(
                    "failed to open events file '{}': {}",
                    path.display(),
                    e
                ))
            })?;

        writeln!(file, "{}", json_line).map_err(|e| {
            LockError::Io(format!(
                "failed to write event to '{}': {}",
                path.display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Read every event back, skipping lines that do not parse.
    pub fn read_all(&self) -> Result<Vec<Event>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            LockError::Io(format!(
                "failed to read events file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
