//! Embedded single-node lock table.
//!
//! Records live in `<data_dir>/locks/` as one JSON file per key, named by the
//! SHA-256 of the storage key. Writes go through [`atomic_write`] so a record
//! is never observed half-written.
//!
//! # Concurrency
//!
//! Single writer, multiple readers:
//! - inside the process an `RwLock` serializes mutations and lets lookups
//!   run concurrently;
//! - across processes an advisory lock on `<data_dir>/table.lock` is taken
//!   exclusive for mutations and shared for lookups.
//!
//! A record file that cannot be parsed makes the table unusable for that key
//! and is reported as `BackendUnavailable`, never silently overwritten.

use super::{AcquireOutcome, BackendKind, LockBackend};
use crate::error::{LockError, Result};
use crate::fs::atomic_write;
use crate::locks::record::expiry_from;
use crate::locks::{LockKey, LockRecord, LockRequest, LockState};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const TABLE_LOCK_FILE_NAME: &str = "table.lock";
const RECORDS_DIR_NAME: &str = "locks";

/// How long to wait for another process to release the table lock.
const TABLE_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Backoff between table-lock attempts.
const POLL_INTERVAL_MS: u64 = 10;

/// File-backed lock table for a single node.
#[derive(Debug)]
pub struct EmbeddedStore {
    records_dir: PathBuf,
    table_lock_path: PathBuf,
    access: RwLock<()>,
}

/// Holds both the in-process guard and the advisory file lock.
struct TableGuard<G> {
    _file: File,
    _guard: G,
}

impl EmbeddedStore {
    /// Open (creating if needed) the table under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let records_dir = data_dir.join(RECORDS_DIR_NAME);

        fs::create_dir_all(&records_dir).map_err(|e| {
            LockError::Io(format!(
                "failed to create lock table directory '{}': {}",
                records_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            records_dir,
            table_lock_path: data_dir.join(TABLE_LOCK_FILE_NAME),
            access: RwLock::new(()),
        })
    }

    pub fn records_dir(&self) -> &Path {
        &self.records_dir
    }

    fn record_path(&self, key: &LockKey) -> PathBuf {
        self.records_dir.join(format!("{}.json", key.file_stem()))
    }

    fn unavailable(reason: impl std::fmt::Display) -> LockError {
        LockError::unavailable(BackendKind::Embedded.to_string(), reason)
    }

    fn open_table_lock(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.table_lock_path)
            .map_err(|e| {
                Self::unavailable(format!(
                    "failed to open table lock '{}': {}",
                    self.table_lock_path.display(),
                    e
                ))
            })
    }

    /// Poll for the advisory lock until `TABLE_LOCK_TIMEOUT`.
    fn lock_file(&self, file: &File, exclusive: bool) -> Result<()> {
        let deadline = Instant::now() + TABLE_LOCK_TIMEOUT;
        let poll = Duration::from_millis(POLL_INTERVAL_MS);

        loop {
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(file)
            } else {
                FileExt::try_lock_shared(file)
            };

            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Self::unavailable(format!(
                            "table lock '{}' held by another process for more than {}s",
                            self.table_lock_path.display(),
                            TABLE_LOCK_TIMEOUT.as_secs()
                        )));
                    }
                    thread::sleep(poll);
                }
                Err(e) => {
                    return Err(Self::unavailable(format!(
                        "failed to lock table '{}': {}",
                        self.table_lock_path.display(),
                        e
                    )));
                }
            }
        }
    }

    fn write_access(&self) -> Result<TableGuard<RwLockWriteGuard<'_, ()>>> {
        let guard = self.access.write().unwrap_or_else(|p| p.into_inner());
        let file = self.open_table_lock()?;
        self.lock_file(&file, true)?;
        Ok(TableGuard {
            _file: file,
            _guard: guard,
        })
    }

    fn read_access(&self) -> Result<TableGuard<RwLockReadGuard<'_, ()>>> {
        let guard = self.access.read().unwrap_or_else(|p| p.into_inner());
        let file = self.open_table_lock()?;
        self.lock_file(&file, false)?;
        Ok(TableGuard {
            _file: file,
            _guard: guard,
        })
    }

    fn read_record(&self, path: &Path) -> Result<Option<LockRecord>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Self::unavailable(format!(
                    "failed to read lock record '{}': {}",
                    path.display(),
                    e
                )));
            }
        };

        LockRecord::from_json(&content).map(Some).map_err(|e| {
            Self::unavailable(format!(
                "corrupted lock record '{}': {}",
                path.display(),
                e
            ))
        })
    }

    fn write_record(&self, path: &Path, record: &LockRecord) -> Result<()> {
        let json = record.to_json()?;
        atomic_write(path, json.as_bytes()).map_err(|e| {
            Self::unavailable(format!(
                "failed to write lock record '{}': {}",
                path.display(),
                e
            ))
        })
    }

    fn remove_record(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::unavailable(format!(
                "failed to remove lock record '{}': {}",
                path.display(),
                e
            ))),
        }
    }

    /// Every parsable record file, skipping (and logging) corrupted ones.
    fn scan_records(&self) -> Result<Vec<(PathBuf, LockRecord)>> {
        let entries = fs::read_dir(&self.records_dir).map_err(|e| {
            Self::unavailable(format!(
                "failed to read lock table '{}': {}",
                self.records_dir.display(),
                e
            ))
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                Self::unavailable(format!("failed to read lock table entry: {}", e))
            })?;
            let path = entry.path();

            // Skip temp files and anything else that is not a record
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match self.read_record(&path) {
                Ok(Some(record)) => records.push((path, record)),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable lock record"),
            }
        }

        Ok(records)
    }
}

impl LockBackend for EmbeddedStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn try_acquire(&self, request: &LockRequest) -> Result<AcquireOutcome> {
        if request.ttl.is_zero() {
            return Err(LockError::Config("lock TTL must be positive".to_string()));
        }

        let _table = self.write_access()?;
        let path = self.record_path(&request.key);
        let now = Utc::now();

        if let Some(existing) = self.read_record(&path)?
            && existing.is_live_at(now)
        {
            return Ok(AcquireOutcome::contended(existing));
        }

        let record = LockRecord::held_at(request, now);
        self.write_record(&path, &record)?;
        debug!(key = %request.key, holder = %request.holder_id, "embedded lock granted");
        Ok(AcquireOutcome::granted(record))
    }

    fn release(&self, key: &LockKey, holder_id: &str) -> Result<bool> {
        let _table = self.write_access()?;
        let path = self.record_path(key);

        match self.read_record(&path)? {
            Some(record) if record.holder_id == holder_id && record.is_live_at(Utc::now()) => {
                self.remove_record(&path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn renew(&self, key: &LockKey, holder_id: &str, ttl: Duration) -> Result<bool> {
        let _table = self.write_access()?;
        let path = self.record_path(key);
        let now = Utc::now();

        match self.read_record(&path)? {
            Some(mut record) if record.holder_id == holder_id && record.is_live_at(now) => {
                record.expires_at = expiry_from(now, ttl);
                self.write_record(&path, &record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        let _table = self.read_access()?;
        let record = self.read_record(&self.record_path(key))?;
        Ok(record.filter(|r| r.is_live_at(Utc::now())))
    }

    fn list_held(&self) -> Result<Vec<LockRecord>> {
        let _table = self.read_access()?;
        let now = Utc::now();
        Ok(self
            .scan_records()?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| record.is_live_at(now))
            .collect())
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>> {
        let _table = self.write_access()?;
        let mut swept = Vec::new();

        for (path, mut record) in self.scan_records()? {
            if record.state == LockState::Held && record.is_expired_at(now) {
                self.remove_record(&path)?;
                record.state = LockState::Expired;
                swept.push(record);
            }
        }

        Ok(swept)
    }

    fn ping(&self) -> Result<()> {
        let metadata = fs::metadata(&self.records_dir).map_err(|e| {
            Self::unavailable(format!(
                "lock table '{}' is not accessible: {}",
                self.records_dir.display(),
                e
            ))
        })?;
        if !metadata.is_dir() {
            return Err(Self::unavailable(format!(
                "lock table '{}' is not a directory",
                self.records_dir.display()
            )));
        }
        self.open_table_lock().map(|_| ())
    }
}
