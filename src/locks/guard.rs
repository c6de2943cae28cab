//! RAII handle for a held lock.

use super::{LockKey, LockRecord};
use crate::coordinator::LockEngine;
use crate::error::Result;
use crate::locks::record::expiry_from;
use chrono::Utc;
use tracing::warn;

/// A granted lock.
///
/// When dropped, the lock is released through the engine that granted it.
/// If the release fails, a warning is logged but no panic occurs; the lock
/// then lapses at its TTL.
#[derive(Debug)]
pub struct LockHandle {
    engine: LockEngine,
    record: LockRecord,

    /// Whether the lock has been released or detached manually.
    released: bool,
}

impl LockHandle {
    pub(crate) fn new(engine: LockEngine, record: LockRecord) -> Self {
        Self {
            engine,
            record,
            released: false,
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.record.key
    }

    pub fn holder_id(&self) -> &str {
        &self.record.holder_id
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Push expiry out by the configured TTL. False if the lock was lost.
    pub fn renew(&mut self) -> Result<bool> {
        let ttl = self.engine.config().lock_ttl();
        let renewed = self
            .engine
            .renew(&self.record.key, &self.record.holder_id, ttl)?;
        if renewed {
            self.record.expires_at = expiry_from(Utc::now(), ttl);
        }
        Ok(renewed)
    }

    /// Release now, reporting errors instead of logging them.
    ///
    /// Returns false if the lock had already expired or been cleared.
    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        self.engine
            .release(&self.record.key, &self.record.holder_id)
    }

    /// Keep the lock after this handle goes away.
    ///
    /// Used when a later job (an apply after its plan) releases it with
    /// [`LockEngine::release`] under the same holder id, or lets it expire.
    pub fn detach(mut self) -> LockRecord {
        self.released = true;
        self.record.clone()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self
            .engine
            .release(&self.record.key, &self.record.holder_id)
        {
            warn!(
                key = %self.record.key,
                holder = %self.record.holder_id,
                error = %e,
                "failed to release lock"
            );
        }
    }
}
