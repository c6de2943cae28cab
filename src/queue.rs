//! Per-key priority wait queue.
//!
//! Entries for one key are ordered by `(priority desc, enqueued_at asc, seq asc)`
//! where `seq` is a queue-wide counter that breaks timestamp ties. An entry
//! keeps its ordinal for life, so a head that is popped for a grant attempt
//! and then re-inserted lands back exactly where it was.
//!
//! The queue is plain data; the coordinator wraps it in a mutex.

use crate::error::{LockError, Result};
use crate::locks::LockKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

/// Sort position of an entry within its key's queue.
type Ordinal = (Reverse<i32>, DateTime<Utc>, u64);

/// One request waiting for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitQueueEntry {
    pub key: LockKey,
    pub holder_id: String,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Arrival order across the whole queue.
    pub seq: u64,
}

impl WaitQueueEntry {
    fn ordinal(&self) -> Ordinal {
        (Reverse(self.priority), self.enqueued_at, self.seq)
    }
}

#[derive(Debug, Default)]
struct KeyQueue {
    order: BTreeMap<Ordinal, WaitQueueEntry>,
    by_holder: HashMap<String, Ordinal>,
}

/// Waiters for every contended key.
#[derive(Debug, Default)]
pub struct WaitQueue {
    queues: HashMap<LockKey, KeyQueue>,
    next_seq: u64,
    fifo_only: bool,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that ignores requested priorities and orders purely by arrival.
    pub fn fifo() -> Self {
        Self {
            fifo_only: true,
            ..Self::default()
        }
    }

    /// Append a request for `key`. A holder may wait at most once per key.
    pub fn enqueue(
        &mut self,
        key: &LockKey,
        holder_id: &str,
        priority: i32,
    ) -> Result<WaitQueueEntry> {
        self.enqueue_at(key, holder_id, priority, Utc::now())
    }

    pub(crate) fn enqueue_at(
        &mut self,
        key: &LockKey,
        holder_id: &str,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<WaitQueueEntry> {
        if self.contains(key, holder_id) {
            return Err(LockError::AlreadyWaiting {
                key: key.to_string(),
                holder_id: holder_id.to_string(),
            });
        }

        let entry = WaitQueueEntry {
            key: key.clone(),
            holder_id: holder_id.to_string(),
            priority: if self.fifo_only { 0 } else { priority },
            enqueued_at: now,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.insert(entry.clone());
        Ok(entry)
    }

    /// Put back an entry previously taken with [`pop_head`](Self::pop_head),
    /// at its original position.
    pub fn reinsert(&mut self, entry: WaitQueueEntry) {
        if !self.contains(&entry.key, &entry.holder_id) {
            self.insert(entry);
        }
    }

    fn insert(&mut self, entry: WaitQueueEntry) {
        let queue = self.queues.entry(entry.key.clone()).or_default();
        let ordinal = entry.ordinal();
        queue.by_holder.insert(entry.holder_id.clone(), ordinal);
        queue.order.insert(ordinal, entry);
    }

    pub fn remove(&mut self, key: &LockKey, holder_id: &str) -> Option<WaitQueueEntry> {
        let queue = self.queues.get_mut(key)?;
        let ordinal = queue.by_holder.remove(holder_id)?;
        let entry = queue.order.remove(&ordinal);
        if queue.order.is_empty() {
            self.queues.remove(key);
        }
        entry
    }

    pub fn pop_head(&mut self, key: &LockKey) -> Option<WaitQueueEntry> {
        let queue = self.queues.get_mut(key)?;
        let (_, entry) = queue.order.pop_first()?;
        queue.by_holder.remove(&entry.holder_id);
        if queue.order.is_empty() {
            self.queues.remove(key);
        }
        Some(entry)
    }

    pub fn head(&self, key: &LockKey) -> Option<&WaitQueueEntry> {
        self.queues
            .get(key)
            .and_then(|q| q.order.first_key_value())
            .map(|(_, entry)| entry)
    }

    pub fn contains(&self, key: &LockKey, holder_id: &str) -> bool {
        self.queues
            .get(key)
            .is_some_and(|q| q.by_holder.contains_key(holder_id))
    }

    /// Zero-based position of the holder in the key's queue.
    pub fn position(&self, key: &LockKey, holder_id: &str) -> Option<usize> {
        let queue = self.queues.get(key)?;
        let ordinal = queue.by_holder.get(holder_id)?;
        Some(queue.order.range(..ordinal).count())
    }

    pub fn depth(&self, key: &LockKey) -> usize {
        self.queues.get(key).map_or(0, |q| q.order.len())
    }

    pub fn total_depth(&self) -> usize {
        self.queues.values().map(|q| q.order.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Whether a new request at `priority` must queue behind existing waiters.
    ///
    /// Equal priority loses to anyone already waiting.
    pub fn outranked_by_queue(&self, key: &LockKey, priority: i32) -> bool {
        let priority = if self.fifo_only { 0 } else { priority };
        self.head(key).is_some_and(|head| head.priority >= priority)
    }

    /// Every waiting entry, grouped by key in queue order.
    pub fn snapshot(&self) -> Vec<WaitQueueEntry> {
        let mut keys: Vec<&LockKey> = self.queues.keys().collect();
        keys.sort();
        keys.into_iter()
            .flat_map(|key| self.queues[key].order.values().cloned())
            .collect()
    }

    /// Keys with at least one waiter, oldest head first.
    pub fn keys_with_waiters(&self) -> Vec<LockKey> {
        let mut heads: Vec<&WaitQueueEntry> =
            self.queues.keys().filter_map(|key| self.head(key)).collect();
        heads.sort_by_key(|entry| (entry.enqueued_at, entry.seq));
        heads.into_iter().map(|entry| entry.key.clone()).collect()
    }

    /// Queue depth per storage key, for metrics.
    pub fn depths(&self) -> BTreeMap<String, usize> {
        self.queues
            .iter()
            .map(|(key, q)| (key.to_string(), q.order.len()))
            .collect()
    }
}
