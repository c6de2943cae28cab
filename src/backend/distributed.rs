//! Distributed lock table on a Redis-compatible cache.
//!
//! Each lock is one cache entry under [`LockKey::storage_key`] whose value is
//! the JSON record and whose cache expiry equals the lock TTL. The cache
//! expiry only reclaims memory: liveness is always decided from the record's
//! own `expires_at`, and every mutation is a compare-and-swap against the
//! exact value read, so two engines can never both believe they hold a key.
//!
//! A value that does not parse as a record is logged and treated as a free
//! key: the next acquire swaps it out. It is never a backend failure, so one
//! bad entry cannot push the engine onto the embedded fallback.

use super::cache::CacheClient;
use super::{AcquireOutcome, BackendKind, LockBackend};
use crate::error::{LockError, Result};
use crate::locks::record::expiry_from;
use crate::locks::{KEY_PREFIX, LockKey, LockRecord, LockRequest, LockState};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

/// Compare-and-swap retries before `try_acquire` gives up on a hot key.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Lock table shared by every engine process pointed at the same cache.
#[derive(Debug)]
pub struct DistributedStore<C: CacheClient> {
    cache: C,
}

impl<C: CacheClient> DistributedStore<C> {
    pub fn new(cache: C) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Current raw value and its record, `None` when the value is unreadable.
    fn load(&self, storage_key: &str) -> Result<Option<(String, Option<LockRecord>)>> {
        let Some(raw) = self.cache.get(storage_key)? else {
            return Ok(None);
        };
        match LockRecord::from_json(&raw) {
            Ok(record) => Ok(Some((raw, Some(record)))),
            Err(e) => {
                warn!(key = %storage_key, error = %e, "unreadable lock record");
                Ok(Some((raw, None)))
            }
        }
    }

    /// Every parsable record under the lock namespace.
    fn scan(&self) -> Result<Vec<(String, String, LockRecord)>> {
        let mut records = Vec::new();
        for storage_key in self.cache.scan_prefix(KEY_PREFIX)? {
            // Gone between scan and get, or unreadable
            if let Some((raw, Some(record))) = self.load(&storage_key)? {
                records.push((storage_key, raw, record));
            }
        }
        Ok(records)
    }
}

impl<C: CacheClient> LockBackend for DistributedStore<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }

    fn try_acquire(&self, request: &LockRequest) -> Result<AcquireOutcome> {
        if request.ttl.is_zero() {
            return Err(LockError::Config("lock TTL must be positive".to_string()));
        }

        let storage_key = request.key.storage_key();

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let record = LockRecord::held_at(request, now);
            let value = record.to_json()?;

            if self.cache.set_if_absent(&storage_key, &value, request.ttl)? {
                debug!(key = %request.key, holder = %request.holder_id, "distributed lock granted");
                return Ok(AcquireOutcome::granted(record));
            }

            let Some((raw, existing)) = self.load(&storage_key)? else {
                // Evicted between the two calls; try again
                continue;
            };

            if let Some(existing) = &existing
                && existing.is_live_at(now)
            {
                return Ok(AcquireOutcome::contended(existing.clone()));
            }

            // Past its own expiry even though the cache still has it, or unreadable.
            if self
                .cache
                .replace_if_equals(&storage_key, &raw, &value, request.ttl)?
            {
                match existing {
                    Some(previous) => debug!(
                        key = %request.key,
                        holder = %request.holder_id,
                        previous = %previous.holder_id,
                        "distributed lock granted over expired record"
                    ),
                    None => warn!(
                        key = %request.key,
                        holder = %request.holder_id,
                        "distributed lock granted over unreadable record"
                    ),
                }
                return Ok(AcquireOutcome::granted(record));
            }

            debug!(key = %request.key, attempt, "lost compare-and-swap race, retrying");
        }

        Err(LockError::unavailable(
            BackendKind::Distributed.to_string(),
            format!(
                "lost {} compare-and-swap races on '{}'",
                MAX_CAS_ATTEMPTS, request.key
            ),
        ))
    }

    fn release(&self, key: &LockKey, holder_id: &str) -> Result<bool> {
        let storage_key = key.storage_key();
        match self.load(&storage_key)? {
            Some((raw, Some(record)))
                if record.holder_id == holder_id && record.is_live_at(Utc::now()) =>
            {
                self.cache.delete_if_equals(&storage_key, &raw)
            }
            _ => Ok(false),
        }
    }

    fn renew(&self, key: &LockKey, holder_id: &str, ttl: Duration) -> Result<bool> {
        let storage_key = key.storage_key();
        let now = Utc::now();
        match self.load(&storage_key)? {
            Some((raw, Some(mut record))) if record.holder_id == holder_id && record.is_live_at(now) => {
                record.expires_at = expiry_from(now, ttl);
                let value = record.to_json()?;
                self.cache.replace_if_equals(&storage_key, &raw, &value, ttl)
            }
            _ => Ok(false),
        }
    }

    fn get(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        let now = Utc::now();
        Ok(self
            .load(&key.storage_key())?
            .and_then(|(_, record)| record)
            .filter(|record| record.is_live_at(now)))
    }

    fn list_held(&self) -> Result<Vec<LockRecord>> {
        let now = Utc::now();
        Ok(self
            .scan()?
            .into_iter()
            .map(|(_, _, record)| record)
            .filter(|record| record.is_live_at(now))
            .collect())
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>> {
        let mut swept = Vec::new();
        for (storage_key, raw, mut record) in self.scan()? {
            if record.state == LockState::Held
                && record.is_expired_at(now)
                && self.cache.delete_if_equals(&storage_key, &raw)?
            {
                record.state = LockState::Expired;
                swept.push(record);
            }
        }
        Ok(swept)
    }

    fn ping(&self) -> Result<()> {
        self.cache.ping()
    }
}
