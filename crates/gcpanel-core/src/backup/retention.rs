//! Retention sweep

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use super::metadata::{file_time, get_backup_metadata, read_sidecar, sidecar_path};
use super::{is_artifact_name, BackupManager, BACKUP_EXTENSION, METADATA_SUFFIX};
use crate::error::Result;

impl BackupManager {
    /// Delete artifacts older than the retention window
    ///
    /// Returns the number of artifacts removed.
    pub fn cleanup_old_backups(&self) -> Result<usize> {
        self.cleanup_old_backups_at(self.clock.now())
    }

    /// Retention sweep against an explicit reference time
    ///
    /// Per-artifact failures are logged and the sweep continues.
    pub fn cleanup_old_backups_at(&self, now: DateTime<Utc>) -> Result<usize> {
        self.ensure_backup_dir()?;
        let _lock = self.lock()?;

        // A window reaching past the earliest representable time keeps everything.
        let cutoff = Duration::try_days(i64::from(self.config.retention_days))
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        debug!("Removing backups created before {}", cutoff.to_rfc3339());

        let names: Vec<String> = fs::read_dir(&self.config.backup_dir)?
            .filter_map(|entry| match entry {
                Ok(entry) => entry.file_name().into_string().ok(),
                Err(e) => {
                    warn!("Skipping unreadable directory entry: {}", e);
                    None
                }
            })
            .collect();

        let mut removed = 0;
        for name in &names {
            let path = self.config.backup_dir.join(name);

            if is_artifact_name(name) {
                match remove_if_expired(&path, cutoff) {
                    Ok(true) => {
                        removed += 1;
                        info!("Removed old backup: {}", name);
                    }
                    Ok(false) => {}
                    Err(e) => error!("Error processing backup for cleanup: {}: {}", name, e),
                }
            } else if is_orphan_sidecar(name, &self.config.backup_dir) {
                if let Err(e) = remove_orphan_sidecar(&path, cutoff) {
                    warn!("Failed to remove orphaned metadata {}: {}", name, e);
                }
            }
        }

        info!("Retention sweep removed {} backup(s)", removed);
        Ok(removed)
    }
}

fn remove_if_expired(artifact: &Path, cutoff: DateTime<Utc>) -> Result<bool> {
    let resolved = get_backup_metadata(artifact)?;
    if resolved.metadata.created_at >= cutoff {
        return Ok(false);
    }

    fs::remove_file(artifact)?;

    // The artifact is gone either way; a stuck sidecar is only worth a warning.
    let sidecar = sidecar_path(artifact);
    match fs::remove_file(&sidecar) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove metadata {}: {}", sidecar.display(), e),
    }
    Ok(true)
}

fn is_orphan_sidecar(name: &str, dir: &Path) -> bool {
    name.strip_suffix(METADATA_SUFFIX)
        .filter(|artifact| is_artifact_name(artifact) && artifact.ends_with(BACKUP_EXTENSION))
        .map(|artifact| !dir.join(artifact).exists())
        .unwrap_or(false)
}

fn remove_orphan_sidecar(sidecar: &Path, cutoff: DateTime<Utc>) -> Result<()> {
    let created_at = match read_sidecar(sidecar) {
        Ok(metadata) => metadata.created_at,
        Err(_) => file_time(&fs::metadata(sidecar)?),
    };
    if created_at < cutoff {
        fs::remove_file(sidecar)?;
        info!("Removed orphaned metadata: {}", sidecar.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use rusqlite::Connection;
    use tempfile::TempDir;

    use super::*;
    use crate::backup::{ArtifactMetadata, LOCK_FILE_NAME};
    use crate::clock::FixedClock;
    use crate::config::{BackupConfig, DatastoreConfig};

    fn setup(dir: &TempDir, retention_days: u32) -> (BackupManager, Arc<FixedClock>) {
        let db_path = dir.path().join("gcpanel.db");
        Connection::open(&db_path)
            .unwrap()
            .execute_batch("CREATE TABLE rfis (id INTEGER PRIMARY KEY, subject TEXT);")
            .unwrap();

        let config = BackupConfig::new(
            dir.path().join("backups"),
            DatastoreConfig::Sqlite { path: db_path },
        )
        .with_retention_days(retention_days);
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let manager = BackupManager::new(config).with_clock(clock.clone());
        (manager, clock)
    }

    #[test]
    fn test_unbounded_window_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let (manager, clock) = setup(&dir, u32::MAX);

        clock.set(Utc.with_ymd_and_hms(1990, 1, 1, 0, 0, 0).unwrap());
        manager.create_backup(None).unwrap();

        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(manager.cleanup_old_backups_at(now).unwrap(), 0);
        assert_eq!(manager.list_backups().unwrap().len(), 1);
    }

    #[test]
    fn test_retention_boundary() {
        let dir = TempDir::new().unwrap();
        let (manager, clock) = setup(&dir, 30);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        clock.set(now - Duration::days(31));
        let expired = manager.create_backup(None).unwrap();
        clock.set(now - Duration::days(29));
        let kept = manager.create_backup(None).unwrap();

        assert_eq!(manager.cleanup_old_backups_at(now).unwrap(), 1);
        assert!(!expired.path.exists());
        assert!(!sidecar_path(&expired.path).exists());
        assert!(kept.path.exists());
        assert!(sidecar_path(&kept.path).exists());
    }

    #[test]
    fn test_artifact_without_sidecar_uses_file_time() {
        let dir = TempDir::new().unwrap();
        let (manager, clock) = setup(&dir, 30);
        clock.set(Utc::now());

        let artifact = manager.create_backup(None).unwrap();
        fs::remove_file(sidecar_path(&artifact.path)).unwrap();

        // File was just written, so it is inside the window today...
        assert_eq!(manager.cleanup_old_backups_at(Utc::now()).unwrap(), 0);
        assert!(artifact.path.exists());

        // ...and outside it two months from now.
        let later = Utc::now() + Duration::days(60);
        assert_eq!(manager.cleanup_old_backups_at(later).unwrap(), 1);
        assert!(!artifact.path.exists());
    }

    #[test]
    fn test_orphaned_sidecar_removed() {
        let dir = TempDir::new().unwrap();
        let (manager, clock) = setup(&dir, 30);
        clock.set(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());

        let artifact = manager.create_backup(None).unwrap();
        fs::remove_file(&artifact.path).unwrap();
        let sidecar = sidecar_path(&artifact.path);
        assert!(sidecar.exists());

        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(manager.cleanup_old_backups_at(now).unwrap(), 0);
        assert!(!sidecar.exists());
    }

    #[test]
    fn test_unrelated_files_untouched() {
        let dir = TempDir::new().unwrap();
        let (manager, _clock) = setup(&dir, 1);
        fs::create_dir_all(manager.backup_dir()).unwrap();
        let notes = manager.backup_dir().join("README.txt");
        fs::write(&notes, b"keep me").unwrap();

        let far_future = Utc::now() + Duration::days(3650);
        assert_eq!(manager.cleanup_old_backups_at(far_future).unwrap(), 0);
        assert!(notes.exists());
        assert!(!manager.backup_dir().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_sidecar_time_wins_over_file_time() {
        let dir = TempDir::new().unwrap();
        let (manager, _clock) = setup(&dir, 30);
        fs::create_dir_all(manager.backup_dir()).unwrap();

        let artifact = manager.backup_dir().join("imported.sql.gz");
        fs::write(&artifact, b"x").unwrap();
        let metadata = ArtifactMetadata {
            filename: "imported.sql.gz".to_string(),
            created_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            datastore_kind: None,
            size_bytes: 1,
            app_version: None,
        };
        fs::write(
            sidecar_path(&artifact),
            serde_json::to_string(&metadata).unwrap(),
        )
        .unwrap();

        assert_eq!(manager.cleanup_old_backups_at(Utc::now()).unwrap(), 1);
        assert!(!artifact.exists());
    }
}
