//! Per-backend circuit breaker.
//!
//! A backend must prove itself: with no record it is untrusted. One success
//! admits it; once failures outnumber successes by the configured margin it is
//! excluded again until its next success. There is no half-open state and no
//! cooldown timer.
//!
//! Every mutation is persisted before the lock is released, so concurrent
//! workers can never interleave a read-modify-write and a restart never loses
//! history. Persistence problems are logged and do not fail the caller: the
//! in-memory ledger stays authoritative for the running process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::store::{self, FileLock, StoreError};

/// Failures beyond successes at which a backend stops being trusted.
pub const DEFAULT_FAILURE_MARGIN: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failure margin must be at least 1")]
    InvalidMargin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustRecord {
    pub backend_id: String,
    pub trusted: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl TrustRecord {
    fn new(backend_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            trusted: false,
            success_count: 0,
            failure_count: 0,
            last_updated: now,
        }
    }

    fn over_margin(&self, margin: u32) -> bool {
        self.failure_count.saturating_sub(self.success_count) >= u64::from(margin)
    }
}

/// On-disk layout: records keyed by backend id.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    records: BTreeMap<String, TrustRecord>,
}

#[derive(Debug)]
pub struct TrustLedger {
    records: Mutex<HashMap<String, TrustRecord>>,
    path: Option<PathBuf>,
    failure_margin: u32,
}

impl TrustLedger {
    /// Ledger with no backing file.
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            path: None,
            failure_margin: DEFAULT_FAILURE_MARGIN,
        }
    }

    /// Open (or start) a ledger persisted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let file: LedgerFile = store::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            records: Mutex::new(file.records.into_iter().collect()),
            path: Some(path),
            failure_margin: DEFAULT_FAILURE_MARGIN,
        })
    }

    pub fn with_failure_margin(mut self, margin: u32) -> Result<Self, LedgerError> {
        if margin == 0 {
            return Err(LedgerError::InvalidMargin);
        }
        self.failure_margin = margin;
        Ok(self)
    }

    pub fn failure_margin(&self) -> u32 {
        self.failure_margin
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrustRecord>> {
        // A panic mid-update cannot leave a record half-written: every
        // mutation is a handful of field stores on an owned struct.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Absence of a record means untrusted.
    pub fn is_trusted(&self, backend_id: &str) -> bool {
        self.lock()
            .get(backend_id)
            .map(|r| r.trusted)
            .unwrap_or(false)
    }

    pub fn record(&self, backend_id: &str) -> Option<TrustRecord> {
        self.lock().get(backend_id).cloned()
    }

    /// All records, sorted by backend id.
    pub fn snapshot(&self) -> Vec<TrustRecord> {
        let mut out: Vec<TrustRecord> = self.lock().values().cloned().collect();
        out.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        out
    }

    pub fn record_success(&self, backend_id: &str) -> TrustRecord {
        self.mutate(backend_id, |record, _| {
            record.success_count += 1;
            record.trusted = true;
        })
    }

    pub fn record_failure(&self, backend_id: &str) -> TrustRecord {
        self.mutate(backend_id, |record, margin| {
            record.failure_count += 1;
            if record.over_margin(margin) {
                record.trusted = false;
            }
        })
    }

    /// A response counted as a success at parse time was rejected later by
    /// validation: the success is withdrawn and a failure recorded instead.
    pub fn record_rejected(&self, backend_id: &str) -> TrustRecord {
        self.mutate(backend_id, |record, margin| {
            record.success_count = record.success_count.saturating_sub(1);
            record.failure_count += 1;
            if record.over_margin(margin) {
                record.trusted = false;
            }
        })
    }

    /// Insert or replace a record wholesale (imports, fixtures).
    pub fn seed(&self, record: TrustRecord) {
        let mut records = self.lock();
        records.insert(record.backend_id.clone(), record);
        self.persist_locked(&records);
    }

    fn mutate<F>(&self, backend_id: &str, apply: F) -> TrustRecord
    where
        F: FnOnce(&mut TrustRecord, u32),
    {
        let now = Utc::now();
        let mut records = self.lock();
        let record = records
            .entry(backend_id.to_string())
            .or_insert_with(|| TrustRecord::new(backend_id, now));
        let was_trusted = record.trusted;
        apply(record, self.failure_margin);
        record.last_updated = now;
        let updated = record.clone();

        if was_trusted != updated.trusted {
            tracing::info!(
                backend = backend_id,
                trusted = updated.trusted,
                successes = updated.success_count,
                failures = updated.failure_count,
                "trust flipped"
            );
        }

        self.persist_locked(&records);
        updated
    }

    fn persist_locked(&self, records: &HashMap<String, TrustRecord>) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let file = LedgerFile {
            records: records
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let result = FileLock::acquire(path).and_then(|_lock| store::write_json_atomic(path, &file));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to persist trust ledger");
        }
    }
}
