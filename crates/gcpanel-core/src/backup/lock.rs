//! Advisory lock on the backup directory
//!
//! Create, sweep and restore mutate the directory and sidecars; they hold a
//! lock file created with `O_EXCL` for their whole duration. The file records
//! the owner's pid and acquisition time so an abandoned lock can be detected.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::metadata::file_time;
use super::LOCK_FILE_NAME;
use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held lock; released on drop
#[derive(Debug)]
pub(crate) struct BackupLock {
    path: PathBuf,
}

impl BackupLock {
    pub(crate) fn acquire(dir: &Path, stale_after: Duration, now: DateTime<Utc>) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);

        // Second attempt only happens after reclaiming a stale lock.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_at: now,
                    };
                    serde_json::to_writer(&mut file, &info)?;
                    file.flush()?;
                    debug!("Acquired backup lock {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let (holder, since) = read_holder(&path)?;
                    let age = now.signed_duration_since(since);
                    let stale = age
                        .to_std()
                        .map(|age| age > stale_after)
                        .unwrap_or(false);

                    if !stale {
                        return Err(Error::Locked(format!(
                            "{} held by {} since {}",
                            path.display(),
                            holder,
                            since.to_rfc3339()
                        )));
                    }

                    warn!(
                        "Reclaiming stale backup lock {} (held by {} since {})",
                        path.display(),
                        holder,
                        since.to_rfc3339()
                    );
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => {
                    return Err(Error::Backup(format!(
                        "Failed to create lock file {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        Err(Error::Locked(format!(
            "{} was re-acquired by another process",
            path.display()
        )))
    }
}

/// Describe the current holder; falls back to the file time for garbage content
fn read_holder(path: &Path) -> Result<(String, DateTime<Utc>)> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        // Released between our open and read
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(("a finished process".to_string(), DateTime::<Utc>::MIN_UTC))
        }
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str::<LockInfo>(&raw) {
        Ok(info) => Ok((format!("pid {}", info.pid), info.acquired_at)),
        Err(_) => {
            let since = fs::metadata(path)
                .map(|m| file_time(&m))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            Ok(("an unknown process".to_string(), since))
        }
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release backup lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join(LOCK_FILE_NAME);

        let lock = BackupLock::acquire(dir.path(), HOUR, Utc::now()).unwrap();
        assert!(lock_path.exists());

        drop(lock);
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_second_holder_is_refused() {
        let dir = TempDir::new().unwrap();
        let _held = BackupLock::acquire(dir.path(), HOUR, Utc::now()).unwrap();

        let err = BackupLock::acquire(dir.path(), HOUR, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Locked(_)));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let old = LockInfo {
            pid: 1,
            acquired_at: now - chrono::Duration::hours(2),
        };
        fs::write(
            dir.path().join(LOCK_FILE_NAME),
            serde_json::to_string(&old).unwrap(),
        )
        .unwrap();

        let lock = BackupLock::acquire(dir.path(), HOUR, now).unwrap();
        let raw = fs::read_to_string(dir.path().join(LOCK_FILE_NAME)).unwrap();
        let info: LockInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(info.pid, std::process::id());
        drop(lock);
    }
}
