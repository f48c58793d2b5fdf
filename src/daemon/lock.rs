//! Cooperative cycle lock: one JSON lock file, TTL-based reclaim.
//!
//! There is no kernel lock and no cancellation: a crashed holder leaves its
//! file behind, and the next scheduled run reclaims it once the embedded TTL
//! has passed.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::clock::{Timestamp, secs};
use crate::core::errors::{RemedyError, Result};

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub created_at: Timestamp,
    pub ttl_seconds: u64,
    pub run_id: String,
}

impl LockInfo {
    /// Whether the holder's TTL has run out at `now`.
    ///
    /// A `created_at` further in the future than one TTL can only come from a
    /// badly skewed clock and is treated as stale too.
    #[must_use]
    pub fn is_stale(&self, now: Timestamp) -> bool {
        let ttl = secs(self.ttl_seconds);
        now - self.created_at > ttl || self.created_at - now > ttl
    }
}

/// Result of trying to take the lock.
#[derive(Debug)]
pub enum LockAcquire {
    Acquired(RunLock),
    /// Someone else holds a live lock. `None` when its contents were unreadable.
    Busy(Option<LockInfo>),
}

/// A held cycle lock. Released on drop if the file still carries our run id.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    info: LockInfo,
    recovered: Option<LockInfo>,
    released: bool,
}

impl RunLock {
    /// Try to take the lock at `path` for `ttl_s` seconds.
    pub fn acquire(path: &Path, ttl_s: u64, now: Timestamp) -> Result<LockAcquire> {
        let info = LockInfo {
            pid: std::process::id(),
            created_at: now,
            ttl_seconds: ttl_s,
            run_id: new_run_id(),
        };

        if try_create(path, &info)? {
            return Ok(LockAcquire::Acquired(Self::held(path, info, None)));
        }

        let Some(raw) = read_raw(path)? else {
            // Released between our create attempt and the read.
            return if try_create(path, &info)? {
                Ok(LockAcquire::Acquired(Self::held(path, info, None)))
            } else {
                Ok(LockAcquire::Busy(read_lock(path)?))
            };
        };
        let existing: Option<LockInfo> = serde_json::from_str(&raw).ok();
        let stale = match &existing {
            Some(held) => held.is_stale(now),
            // Unparseable: a holder may be mid-write, so only reclaim after a TTL.
            None => file_age_exceeds(path, now, ttl_s),
        };
        if !stale {
            return Ok(LockAcquire::Busy(existing));
        }

        if !reclaim(path, &raw, &info.run_id)? {
            return Ok(LockAcquire::Busy(read_lock(path)?));
        }
        if try_create(path, &info)? {
            let recovered = existing.or_else(|| {
                Some(LockInfo {
                    pid: 0,
                    created_at: now,
                    ttl_seconds: ttl_s,
                    run_id: "unreadable".to_string(),
                })
            });
            Ok(LockAcquire::Acquired(Self::held(path, info, recovered)))
        } else {
            // Another run created a fresh lock between our reclaim and create.
            Ok(LockAcquire::Busy(read_lock(path)?))
        }
    }

    fn held(path: &Path, info: LockInfo, recovered: Option<LockInfo>) -> Self {
        Self {
            path: path.to_path_buf(),
            info,
            recovered,
            released: false,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    /// The stale lock this acquisition replaced, if any.
    #[must_use]
    pub fn recovered(&self) -> Option<&LockInfo> {
        self.recovered.as_ref()
    }

    /// Remove the lock file if it is still ours. Best-effort.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Ok(Some(current)) = read_lock(&self.path)
            && current.run_id == self.info.run_id
        {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn new_run_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// `Ok(false)` when the file already exists.
fn try_create(path: &Path, info: &LockInfo) -> Result<bool> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| lock_err(parent, &e))?;
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(lock_err(path, &e)),
    };
    let json = serde_json::to_string(info)?;
    file.write_all(json.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|e| lock_err(path, &e))?;
    Ok(true)
}

/// Move a stale lock aside and confirm it still holds the bytes we judged
/// stale.
///
/// `Ok(false)` when another run got there first. A lock that replaced the
/// stale one in the meantime is put back in place untouched.
fn reclaim(path: &Path, observed: &str, run_id: &str) -> Result<bool> {
    let mut side = path.as_os_str().to_owned();
    side.push(format!(".stale.{run_id}"));
    let side = PathBuf::from(side);

    match fs::rename(path, &side) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(lock_err(path, &e)),
    }
    let moved = fs::read_to_string(&side).map_err(|e| lock_err(&side, &e))?;
    if moved == observed {
        let _ = fs::remove_file(&side);
        return Ok(true);
    }

    // hard_link never overwrites a lock created at `path` since the rename.
    if let Err(e) = fs::hard_link(&side, path)
        && e.kind() != ErrorKind::AlreadyExists
    {
        let _ = fs::rename(&side, path);
        return Ok(false);
    }
    let _ = fs::remove_file(&side);
    Ok(false)
}

fn read_raw(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(lock_err(path, &e)),
    }
}

/// Parsed lock contents; `None` if the file is unparseable or vanished.
pub fn read_lock(path: &Path) -> Result<Option<LockInfo>> {
    Ok(read_raw(path)?.and_then(|raw| serde_json::from_str(&raw).ok()))
}

fn file_age_exceeds(path: &Path, now: Timestamp, ttl_s: u64) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| now - DateTime::<Utc>::from(modified) > secs(ttl_s))
        .unwrap_or(false)
}

fn lock_err(path: &Path, e: &std::io::Error) -> RemedyError {
    RemedyError::LockIo {
        path: path.to_path_buf(),
        details: e.to_string(),
    }
}
