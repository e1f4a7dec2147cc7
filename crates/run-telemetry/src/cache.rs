// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable on-disk holding area for run telemetry awaiting delivery.
//!
//! Each run owns one directory under `<root>/runs/<run_id>/`:
//!
//! ```text
//! run.json                 run identity (id, name, mode, status)
//! records/<seq:020>.json   one pending record per file
//! confirmed                highest sequence confirmed by the server
//! heartbeat                last heartbeat seen from the producer (RFC 3339)
//! failed.json              marker left by a permanently failed replay
//! ```
//!
//! Every file is written to a `.tmp-` staging name in the same directory and
//! renamed into place, so a reader never observes a partially written
//! record. One process appends (the producer), one process removes (the
//! sender); neither holds a lock while doing so.
//!
//! Removal raises the `confirmed` watermark before unlinking record files.
//! Readers skip anything at or below the watermark, so a crash between the
//! two steps cannot make a confirmed record reappear.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::batch::Batch;
use crate::record::{RunIdentity, RunStatus, SequencedRecord};

const RUNS_DIR: &str = "runs";
const RECORDS_DIR: &str = "records";
const IDENTITY_FILE: &str = "run.json";
const WATERMARK_FILE: &str = "confirmed";
const HEARTBEAT_FILE: &str = "heartbeat";
const FAILURE_FILE: &str = "failed.json";
const STAGING_PREFIX: &str = ".tmp-";
const RECORD_SUFFIX: &str = ".json";
const SEQ_WIDTH: usize = 20;

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors emitted by the [`CacheStore`].
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt cache file {}: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },
    #[error("no cache entry for run {0}")]
    MissingRun(Uuid),
    #[error("run {run_id} cannot be purged: {reason}")]
    NotPurgeable { run_id: Uuid, reason: &'static str },
    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },
}

/// Marker describing why the last replay of a run stopped permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFailure {
    /// First sequence number of the rejected submission, if any.
    pub seq: Option<u64>,
    /// HTTP status returned by the server, if any.
    pub status: Option<u16>,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Cache rooted at one directory, shared by producer and sender processes.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    runs_dir: PathBuf,
}

impl CacheStore {
    /// Opens (creating if needed) the cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        let runs_dir = root.join(RUNS_DIR);
        fs::create_dir_all(&runs_dir)?;
        Ok(Self { root, runs_dir })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string())
    }

    fn records_dir(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join(RECORDS_DIR)
    }

    #[must_use]
    pub fn contains(&self, run_id: Uuid) -> bool {
        self.run_dir(run_id).join(IDENTITY_FILE).is_file()
    }

    /// Writes the run identity, replacing any previous one.
    pub fn write_identity(&self, identity: &RunIdentity) -> Result<(), CacheError> {
        let dir = self.run_dir(identity.run_id);
        fs::create_dir_all(dir.join(RECORDS_DIR))?;
        atomic_write(&dir, IDENTITY_FILE, &serde_json::to_vec_pretty(identity)?)?;
        Ok(())
    }

    /// Creates the cache entry for `identity` unless one exists, returning
    /// the identity that is stored afterwards.
    pub fn ensure_identity(&self, identity: &RunIdentity) -> Result<RunIdentity, CacheError> {
        if self.contains(identity.run_id) {
            return self.read_identity(identity.run_id);
        }
        debug!("Creating cache entry for run {}", identity.run_id);
        self.write_identity(identity)?;
        Ok(identity.clone())
    }

    pub fn read_identity(&self, run_id: Uuid) -> Result<RunIdentity, CacheError> {
        let path = self.run_dir(run_id).join(IDENTITY_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::MissingRun(run_id))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt {
            path,
            message: e.to_string(),
        })
    }

    /// Moves the cached run to `status`, refusing non-monotonic transitions.
    pub fn update_status(&self, run_id: Uuid, status: RunStatus) -> Result<RunIdentity, CacheError> {
        let mut identity = self.read_identity(run_id)?;
        if identity.status == status {
            return Ok(identity);
        }
        if !identity.status.can_transition_to(status) {
            return Err(CacheError::InvalidTransition {
                run_id,
                from: identity.status,
                to: status,
            });
        }
        identity.status = status;
        self.write_identity(&identity)?;
        Ok(identity)
    }

    /// Returns an append handle for an existing cache entry.
    pub fn appender(&self, run_id: Uuid) -> Result<RunAppender, CacheError> {
        if !self.contains(run_id) {
            return Err(CacheError::MissingRun(run_id));
        }
        let records_dir = self.records_dir(run_id);
        fs::create_dir_all(&records_dir)?;
        Ok(RunAppender { records_dir })
    }

    pub fn append(&self, run_id: Uuid, record: &SequencedRecord) -> Result<(), CacheError> {
        self.appender(run_id)?.append(record)
    }

    pub fn append_batch(&self, batch: &Batch) -> Result<(), CacheError> {
        self.appender(batch.run_id)?.append_all(&batch.records)
    }

    /// Highest sequence number confirmed delivered for the run.
    pub fn watermark(&self, run_id: Uuid) -> Result<Option<u64>, CacheError> {
        let path = self.run_dir(run_id).join(WATERMARK_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| CacheError::Corrupt {
                    path,
                    message: e.to_string(),
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Sequence numbers of record files on disk, ascending.
    fn record_seqs(&self, run_id: Uuid) -> Result<Vec<u64>, CacheError> {
        let entries = match fs::read_dir(self.records_dir(run_id)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut seqs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(seq) = entry.file_name().to_str().and_then(parse_record_name) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    /// Snapshot of the pending records of a run, read lazily in ascending
    /// sequence order.
    ///
    /// Records appended after the snapshot is taken show up in the next call.
    pub fn read_pending(&self, run_id: Uuid) -> Result<PendingRecords, CacheError> {
        let watermark = self.watermark(run_id)?;
        let seqs = self
            .record_seqs(run_id)?
            .into_iter()
            .filter(|seq| watermark.map_or(true, |w| *seq > w))
            .collect();
        Ok(PendingRecords {
            records_dir: self.records_dir(run_id),
            seqs,
        })
    }

    pub fn has_pending(&self, run_id: Uuid) -> Result<bool, CacheError> {
        Ok(self.read_pending(run_id)?.remaining() > 0)
    }

    /// Highest sequence number ever written for the run, delivered or not.
    pub fn last_sequence(&self, run_id: Uuid) -> Result<Option<u64>, CacheError> {
        let watermark = self.watermark(run_id)?;
        let last_record = self.record_seqs(run_id)?.last().copied();
        Ok(watermark.max(last_record))
    }

    /// Drops every record with a sequence number at or below `up_to_seq`.
    ///
    /// Idempotent; returns the number of record files removed by this call.
    pub fn remove_confirmed(&self, run_id: Uuid, up_to_seq: u64) -> Result<usize, CacheError> {
        let dir = self.run_dir(run_id);
        if !dir.is_dir() {
            return Ok(0);
        }
        let current = self.watermark(run_id)?;
        let watermark = current.map_or(up_to_seq, |w| w.max(up_to_seq));
        if current != Some(watermark) {
            atomic_write(&dir, WATERMARK_FILE, watermark.to_string().as_bytes())?;
        }

        let mut removed = 0;
        for seq in self.record_seqs(run_id)? {
            if seq > watermark {
                break;
            }
            match fs::remove_file(self.records_dir(run_id).join(record_name(seq))) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(
            "Run {run_id}: confirmed up to {watermark}, removed {removed} records"
        );
        Ok(removed)
    }

    /// Runs that have a cache entry.
    pub fn list_runs(&self) -> Result<BTreeSet<Uuid>, CacheError> {
        let mut runs = BTreeSet::new();
        for entry in fs::read_dir(&self.runs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_str().map(Uuid::parse_str) {
                Some(Ok(run_id)) => {
                    runs.insert(run_id);
                }
                _ => warn!(
                    "Ignoring unexpected entry {}",
                    entry.path().display()
                ),
            }
        }
        Ok(runs)
    }

    /// Deletes everything stored for a run.
    ///
    /// Only allowed once the run is terminal and nothing is pending.
    pub fn purge(&self, run_id: Uuid) -> Result<(), CacheError> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            return Ok(());
        }
        let identity = self.read_identity(run_id)?;
        if !identity.status.is_terminal() {
            return Err(CacheError::NotPurgeable {
                run_id,
                reason: "run is still active",
            });
        }
        if self.has_pending(run_id)? {
            return Err(CacheError::NotPurgeable {
                run_id,
                reason: "records are still pending",
            });
        }
        fs::remove_dir_all(&dir)?;
        debug!("Purged run {run_id}");
        Ok(())
    }

    pub fn touch_heartbeat(&self, run_id: Uuid, at: OffsetDateTime) -> Result<(), CacheError> {
        let formatted = at.format(&Rfc3339).map_err(|e| {
            CacheError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        })?;
        atomic_write(&self.run_dir(run_id), HEARTBEAT_FILE, formatted.as_bytes())?;
        Ok(())
    }

    pub fn read_heartbeat(&self, run_id: Uuid) -> Result<Option<OffsetDateTime>, CacheError> {
        let path = self.run_dir(run_id).join(HEARTBEAT_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => OffsetDateTime::parse(text.trim(), &Rfc3339)
                .map(Some)
                .map_err(|e| CacheError::Corrupt {
                    path,
                    message: e.to_string(),
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn mark_failed(&self, run_id: Uuid, failure: &ReplayFailure) -> Result<(), CacheError> {
        atomic_write(
            &self.run_dir(run_id),
            FAILURE_FILE,
            &serde_json::to_vec_pretty(failure)?,
        )?;
        Ok(())
    }

    pub fn read_failure(&self, run_id: Uuid) -> Result<Option<ReplayFailure>, CacheError> {
        let path = self.run_dir(run_id).join(FAILURE_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CacheError::Corrupt {
                    path,
                    message: e.to_string(),
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear_failure(&self, run_id: Uuid) -> Result<(), CacheError> {
        match fs::remove_file(self.run_dir(run_id).join(FAILURE_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Append handle for one run's record log.
#[derive(Debug)]
pub struct RunAppender {
    records_dir: PathBuf,
}

impl RunAppender {
    /// Persists one record. The record is either fully visible or absent.
    pub fn append(&self, record: &SequencedRecord) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(record)?;
        atomic_write(&self.records_dir, &record_name(record.seq), &bytes)?;
        Ok(())
    }

    pub fn append_all(&self, records: &[SequencedRecord]) -> Result<(), CacheError> {
        for record in records {
            self.append(record)?;
        }
        Ok(())
    }
}

/// Lazy, ascending iterator over a snapshot of pending records.
#[derive(Debug)]
pub struct PendingRecords {
    records_dir: PathBuf,
    seqs: VecDeque<u64>,
}

impl PendingRecords {
    /// Number of records left in this snapshot.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.seqs.len()
    }
}

impl Iterator for PendingRecords {
    type Item = Result<SequencedRecord, CacheError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let seq = self.seqs.pop_front()?;
            let path = self.records_dir.join(record_name(seq));
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                // Removed after the snapshot was taken: already confirmed.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Some(Err(e.into())),
            };
            let record = match serde_json::from_slice::<SequencedRecord>(&bytes) {
                Ok(record) if record.seq == seq => record,
                Ok(record) => {
                    return Some(Err(CacheError::Corrupt {
                        path,
                        message: format!("file holds sequence {}", record.seq),
                    }))
                }
                Err(e) => {
                    return Some(Err(CacheError::Corrupt {
                        path,
                        message: e.to_string(),
                    }))
                }
            };
            return Some(Ok(record));
        }
    }
}

fn record_name(seq: u64) -> String {
    format!("{seq:0width$}{RECORD_SUFFIX}", width = SEQ_WIDTH)
}

fn parse_record_name(name: &str) -> Option<u64> {
    let digits = name.strip_suffix(RECORD_SUFFIX)?;
    if digits.len() != SEQ_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Writes `bytes` to `dir/name` through a staging file and a rename.
fn atomic_write(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let staging = dir.join(format!(
        "{STAGING_PREFIX}{}-{}-{name}",
        std::process::id(),
        STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let result = (|| {
        let mut file = fs::File::create(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&staging, dir.join(name))
    })();
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}
