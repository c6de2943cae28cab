//! Lock records and the requests that create them.

use super::key::LockKey;
use crate::error::{LockError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Pending,
    Held,
    Released,
    Expired,
    Failed,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LockState::Pending => "pending",
            LockState::Held => "held",
            LockState::Released => "released",
            LockState::Expired => "expired",
            LockState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One held or pending lock, as persisted by the backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: LockKey,

    /// Opaque id of the job that holds the lock (e.g. `pr-42-plan`).
    pub holder_id: String,

    pub acquired_at: DateTime<Utc>,

    /// `acquired_at + ttl`, pushed forward by renewals.
    pub expires_at: DateTime<Utc>,

    #[serde(default)]
    pub priority: i32,

    pub state: LockState,

    /// Set on locks granted by the embedded store while falling back, so the
    /// reconciliation pass knows which records to migrate.
    #[serde(default)]
    pub pending_migration: bool,

    /// `user@host` of the process that granted the lock.
    #[serde(default)]
    pub owner: String,
}

impl LockRecord {
    /// Build a freshly held record for the request, starting now.
    pub fn held(request: &LockRequest) -> Self {
        Self::held_at(request, Utc::now())
    }

    pub(crate) fn held_at(request: &LockRequest, now: DateTime<Utc>) -> Self {
        Self {
            key: request.key.clone(),
            holder_id: request.holder_id.clone(),
            acquired_at: now,
            expires_at: expiry_from(now, request.ttl),
            priority: request.priority,
            state: LockState::Held,
            pending_migration: request.pending_migration,
            owner: owner_string(),
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| LockError::Io(format!("failed to parse lock record: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| LockError::Io(format!("failed to serialize lock record: {}", e)))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the record still blocks other holders.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.state == LockState::Held && !self.is_expired_at(now)
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Format the age as a human-readable string.
    pub fn age_string(&self) -> String {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        let minutes = age.num_minutes();
        let hours = age.num_hours();
        let days = age.num_days();

        if days > 0 {
            format!("{}d {}h", days, hours % 24)
        } else if hours > 0 {
            format!("{}h {}m", hours, minutes % 60)
        } else {
            format!("{}m", minutes)
        }
    }
}

impl std::fmt::Display for LockRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (holder: {}, age: {}, priority: {}, {}{})",
            self.key,
            self.holder_id,
            self.age_string(),
            self.priority,
            self.state,
            if self.pending_migration {
                ", pending migration"
            } else {
                ""
            }
        )
    }
}

/// Parameters of one `try_acquire` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub key: LockKey,
    pub holder_id: String,
    pub priority: i32,
    pub ttl: Duration,
    pub pending_migration: bool,
}

impl LockRequest {
    pub fn new(key: LockKey, holder_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key,
            holder_id: holder_id.into(),
            priority: 0,
            ttl,
            pending_migration: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn tagged_for_migration(mut self, tagged: bool) -> Self {
        self.pending_migration = tagged;
        self
    }
}

/// `now + ttl`, saturating instead of overflowing on absurd TTLs.
pub(crate) fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Get the `user@host` owner string for lock records and audit events.
pub(crate) fn owner_string() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    format!("{}@{}", user, host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LockRequest {
        let key = LockKey::new("org/repo", "envs/prod", "default").unwrap();
        LockRequest::new(key, "pr-42-plan", Duration::from_secs(7200))
    }

    #[test]
    fn held_record_expires_after_ttl() {
        let now = Utc::now();
        let record = LockRecord::held_at(&request(), now);

        assert_eq!(record.state, LockState::Held);
        assert_eq!(record.expires_at - record.acquired_at, ChronoDuration::hours(2));
        assert!(record.is_live_at(now));
        assert!(!record.is_live_at(now + ChronoDuration::hours(2)));
        assert!(!record.owner.is_empty());
    }

    #[test]
    fn record_json_keeps_every_field() {
        let record = LockRecord::held(&request().with_priority(5).tagged_for_migration(true));
        let json = record.to_json().unwrap();

        assert!(json.contains("\"holder_id\":\"pr-42-plan\""));
        assert!(json.contains("\"state\":\"held\""));
        assert_eq!(LockRecord::from_json(&json).unwrap(), record);
    }

    #[test]
    fn record_parses_without_optional_fields() {
        let json = r#"{
            "key": {"repository": "org/repo", "project_path": ".", "workspace": "default"},
            "holder_id": "pr-7-apply",
            "acquired_at": "2026-01-01T00:00:00Z",
            "expires_at": "2026-01-01T02:00:00Z",
            "state": "held"
        }"#;
        let record = LockRecord::from_json(json).unwrap();
        assert_eq!(record.priority, 0);
        assert!(!record.pending_migration);
        assert!(record.owner.is_empty());
    }

    #[test]
    fn age_string_scales_units() {
        let mut record = LockRecord::held(&request());
        assert!(record.age_string().ends_with('m'));

        record.acquired_at = Utc::now() - ChronoDuration::hours(2);
        assert!(record.age_string().contains('h'));

        record.acquired_at = Utc::now() - ChronoDuration::days(3);
        assert!(record.age_string().contains('d'));
    }

    #[test]
    fn remaining_ttl_is_zero_when_expired() {
        let mut record = LockRecord::held(&request());
        record.expires_at = Utc::now() - ChronoDuration::seconds(5);
        assert_eq!(record.remaining_ttl(), Duration::ZERO);
        assert!(record.is_expired());
    }
}
