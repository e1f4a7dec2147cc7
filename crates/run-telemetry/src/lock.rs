// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Machine-wide single-sender lock.
//!
//! At most one sender drains a cache root at a time. The lock is a file at
//! `<root>/sender.lock` created atomically, holding the owner pid and
//! acquisition time. A lock whose owner is gone, whose age exceeds the stale
//! threshold, or whose content cannot be parsed is moved aside, checked and
//! deleted, then re-created.
//!
//! Two senders reclaiming the same stale lock can still race with a third
//! one that finds the path empty: the loser of the rename may move the
//! winner's fresh lock aside and find a new lock already in place when it
//! tries to put it back. The winner then no longer owns the file. Holders
//! detect this through [`LockOwnership::is_held`] and stop before their next
//! run, so the overlap is limited to runs already in flight. Replay is
//! at-least-once, so such an overlap can duplicate records on the server
//! but never loses them.

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

pub const LOCK_FILE_NAME: &str = "sender.lock";

const MAX_ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file error: {0}")]
    Io(#[from] io::Error),
    #[error("lock serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lock {} kept changing while acquiring it", .0.display())]
    Contended(PathBuf),
}

/// Content of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner_pid: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub acquired_at: OffsetDateTime,
}

impl LockInfo {
    fn current() -> Self {
        LockInfo {
            owner_pid: std::process::id(),
            acquired_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Outcome of [`LockManager::try_acquire`].
#[derive(Debug)]
pub enum Acquire {
    Acquired(SenderLock),
    /// Another live sender holds the lock.
    Busy(LockInfo),
}

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    stale_after: Duration,
}

impl LockManager {
    #[must_use]
    pub fn new(root: &Path, stale_after: Duration) -> Self {
        LockManager {
            path: root.join(LOCK_FILE_NAME),
            stale_after,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the lock if it is free or stale. Never blocks.
    pub fn try_acquire(&self) -> Result<Acquire, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let info = LockInfo::current();
            match self.create(&info) {
                Ok(()) => {
                    debug!("Acquired {}", self.path.display());
                    return Ok(Acquire::Acquired(SenderLock {
                        path: self.path.clone(),
                        info,
                        released: false,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let contents = match fs::read_to_string(&self.path) {
                Ok(contents) => contents,
                // Released between our create and read
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let reason = match serde_json::from_str::<LockInfo>(&contents) {
                Ok(holder) => match self.staleness(&holder) {
                    Some(reason) => reason,
                    None => {
                        debug!(
                            "Held by pid {} since {}",
                            holder.owner_pid, holder.acquired_at
                        );
                        return Ok(Acquire::Busy(holder));
                    }
                },
                Err(_) => "corrupt",
            };

            if let Some(holder) = self.reclaim(&contents, reason)? {
                return Ok(Acquire::Busy(holder));
            }
        }

        Err(LockError::Contended(self.path.clone()))
    }

    /// Publishes a fully written lock file with `hard_link`, so readers never
    /// observe a lock without content.
    fn create(&self, info: &LockInfo) -> io::Result<()> {
        let staging = self.path.with_file_name(format!(
            ".{LOCK_FILE_NAME}.{}.{}",
            std::process::id(),
            OffsetDateTime::now_utc().unix_timestamp_nanos()
        ));
        let written = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&staging)
            .and_then(|mut file| {
                let bytes = serde_json::to_vec_pretty(info).map_err(io::Error::from)?;
                file.write_all(&bytes)?;
                file.sync_all()
            });
        let result = written.and_then(|()| fs::hard_link(&staging, &self.path));
        let _ = fs::remove_file(&staging);
        result
    }

    fn staleness(&self, holder: &LockInfo) -> Option<&'static str> {
        if !pid_is_alive(holder.owner_pid) {
            return Some("dead");
        }
        let age = OffsetDateTime::now_utc() - holder.acquired_at;
        let stale_after = time::Duration::try_from(self.stale_after).unwrap_or(time::Duration::MAX);
        if age > stale_after {
            return Some("stale");
        }
        None
    }

    /// Moves a stale lock aside.
    ///
    /// Returns the holder if the file was replaced by a live sender between
    /// inspection and archival, in which case that lock is put back.
    fn reclaim(&self, judged: &str, reason: &str) -> Result<Option<LockInfo>, LockError> {
        let archived = self.path.with_file_name(format!(
            "{LOCK_FILE_NAME}.{reason}.{}.{}",
            OffsetDateTime::now_utc().unix_timestamp_nanos(),
            std::process::id()
        ));
        match fs::rename(&self.path, &archived) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let moved = fs::read_to_string(&archived);
        let outcome = match moved {
            Ok(moved) if moved == judged => {
                warn!("Reclaimed {reason} lock {}", self.path.display());
                Ok(None)
            }
            // Someone else took the lock in the meantime: put it back unless
            // yet another sender already created a new one.
            Ok(moved) => match fs::hard_link(&archived, &self.path) {
                Ok(()) => Ok(serde_json::from_str::<LockInfo>(&moved).ok()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(
                        "Could not restore the lock of another sender, {} was re-created",
                        self.path.display()
                    );
                    Ok(serde_json::from_str::<LockInfo>(&moved).ok())
                }
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        };
        if let Err(e) = fs::remove_file(&archived) {
            debug!("Cannot remove {}: {e}", archived.display());
        }
        outcome
    }
}

/// Held sender lock. Released explicitly or on drop.
#[derive(Debug)]
pub struct SenderLock {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl SenderLock {
    /// Detached check of whether this lock still owns the lock file.
    #[must_use]
    pub fn ownership(&self) -> LockOwnership {
        LockOwnership {
            path: self.path.clone(),
            info: self.info.clone(),
        }
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        // Only remove the file if it is still ours; a reclaimed lock belongs
        // to another sender now.
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<LockInfo>(&contents) {
            Ok(holder) if holder == self.info => {
                fs::remove_file(&self.path)?;
                debug!("Released {}", self.path.display());
            }
            _ => warn!(
                "{} was taken over by another sender, leaving it in place",
                self.path.display()
            ),
        }
        Ok(())
    }
}

/// Lets a drain confirm it still holds the sender lock.
#[derive(Debug, Clone)]
pub struct LockOwnership {
    path: PathBuf,
    info: LockInfo,
}

impl LockOwnership {
    /// Whether the lock file still carries the content written on acquire.
    pub fn is_held(&self) -> Result<bool, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str::<LockInfo>(&contents)
                .is_ok_and(|holder| holder == self.info)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SenderLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}

/// Whether a process with this pid currently exists.
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the existence and permission check.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    true
}
