//! Backup, verification, retention and point-in-time recovery
//!
//! # Flow
//!
//! 1. [`BackupManager::create_backup`] streams a SQL export of the live
//!    datastore through gzip into the backup directory and writes a JSON
//!    sidecar next to it
//! 2. [`BackupManager::verify_backup`] loads the artifact into a disposable
//!    datastore and runs a liveness query
//! 3. [`BackupManager::cleanup_old_backups`] deletes artifacts older than the
//!    retention window
//!
//! Recovery is separate: [`BackupManager::point_in_time_recovery`] resolves a
//! filename or timestamp to one artifact, takes a safety snapshot of the live
//! state, then restores.
//!
//! # Layout
//!
//! File naming: `backup_YYYYMMDD_HHMMSS.sql.gz` plus `backup_YYYYMMDD_HHMMSS.sql.gz.meta`.
//! Safety snapshots use the `pre_restore_backup` prefix. Mutating operations
//! hold `.gcpanel-backup.lock` in the backup directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::BackupConfig;
use crate::datastore::{open_datastore, Datastore, DatastoreKind};
use crate::error::{Error, Result};

mod create;
mod lock;
mod metadata;
mod recovery;
mod retention;
mod schedule;
mod timestamp;
mod verify;

use lock::BackupLock;

pub use metadata::{get_backup_metadata, sidecar_path};
pub use recovery::RecoveryRequest;
pub use schedule::ScheduledRun;
pub use timestamp::parse_timestamp;
pub use verify::VerificationReport;

/// Extension every artifact carries
pub const BACKUP_EXTENSION: &str = ".sql.gz";
/// Suffix appended to an artifact name for its sidecar
pub const METADATA_SUFFIX: &str = ".meta";
/// Prefix of regular backups
pub const DEFAULT_PREFIX: &str = "backup";
/// Prefix of the snapshot taken right before a restore
pub const SAFETY_PREFIX: &str = "pre_restore_backup";
/// Advisory lock held by mutating operations
pub const LOCK_FILE_NAME: &str = ".gcpanel-backup.lock";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Sidecar contents for one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Artifact filename (not a path)
    pub filename: String,
    /// When the backup was taken
    #[serde(with = "timestamp::serde_format")]
    pub created_at: DateTime<Utc>,
    /// Source datastore; unknown for synthesized metadata
    #[serde(default, alias = "database_type")]
    pub datastore_kind: Option<DatastoreKind>,
    /// Compressed size on disk
    pub size_bytes: u64,
    /// Version of the application that produced the artifact
    #[serde(default, alias = "application_version")]
    pub app_version: Option<String>,
}

/// An artifact on disk with its resolved metadata
#[derive(Debug, Clone, PartialEq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub metadata: ArtifactMetadata,
    /// False when metadata was synthesized from the filesystem
    pub has_sidecar: bool,
}

impl BackupArtifact {
    pub fn filename(&self) -> &str {
        &self.metadata.filename
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.metadata.created_at
    }
}

/// Result of a restore
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    /// The artifact that was restored
    pub restored: BackupArtifact,
    /// Snapshot of the live state taken before the restore; `None` only when
    /// there was no live state to snapshot
    pub safety_snapshot: Option<BackupArtifact>,
}

/// Generate a backup filename
///
/// `backup_20250101_000000.sql.gz` with a timestamp, `backup.sql.gz` without.
pub fn generate_backup_filename(
    prefix: &str,
    at: DateTime<Utc>,
    include_timestamp: bool,
) -> String {
    if include_timestamp {
        format!("{}_{}{}", prefix, at.format(TIMESTAMP_FORMAT), BACKUP_EXTENSION)
    } else {
        format!("{}{}", prefix, BACKUP_EXTENSION)
    }
}

/// Check that `name` is a bare artifact filename
pub fn validate_backup_name(name: &str) -> Result<&str> {
    let bare = Path::new(name)
        .file_name()
        .map(|n| n == name)
        .unwrap_or(false);

    if !bare || name.starts_with('.') || name.contains('\\') {
        return Err(Error::Config(format!(
            "Backup name must be a plain filename: {}",
            name
        )));
    }
    if !name.ends_with(BACKUP_EXTENSION) || name.len() == BACKUP_EXTENSION.len() {
        return Err(Error::Config(format!(
            "Backup name must end with {}: {}",
            BACKUP_EXTENSION, name
        )));
    }
    Ok(name)
}

fn is_artifact_name(name: &str) -> bool {
    name.ends_with(BACKUP_EXTENSION) && !name.starts_with('.')
}

/// Entry point for all backup operations
///
/// Holds the injected configuration, datastore and clock; there is no
/// process-wide state.
pub struct BackupManager {
    config: BackupConfig,
    datastore: Box<dyn Datastore>,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    /// Create a manager for the datastore named in `config`
    pub fn new(config: BackupConfig) -> Self {
        let datastore = open_datastore(&config.datastore, config.command_timeout);
        Self::with_datastore(config, datastore)
    }

    /// Create a manager over an explicit datastore implementation
    pub fn with_datastore(config: BackupConfig, datastore: Box<dyn Datastore>) -> Self {
        Self {
            config,
            datastore,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn backup_dir(&self) -> &Path {
        &self.config.backup_dir
    }

    pub fn datastore(&self) -> &dyn Datastore {
        self.datastore.as_ref()
    }

    fn ensure_backup_dir(&self) -> Result<()> {
        let dir = &self.config.backup_dir;
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| {
                Error::Backup(format!(
                    "Failed to create backup directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            info!("Created backup directory: {}", dir.display());
        }
        Ok(())
    }

    fn lock(&self) -> Result<BackupLock> {
        BackupLock::acquire(
            &self.config.backup_dir,
            self.config.lock_stale_after,
            self.clock.now(),
        )
    }

    /// List all artifacts, newest first
    ///
    /// Read-only: a missing backup directory yields an empty list.
    pub fn list_backups(&self) -> Result<Vec<BackupArtifact>> {
        let dir = &self.config.backup_dir;
        let mut backups = Vec::new();

        if !dir.exists() {
            return Ok(backups);
        }

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = match entry.file_name().to_str() {
                Some(name) if is_artifact_name(name) => name.to_string(),
                _ => continue,
            };
            if !entry.file_type()?.is_file() {
                continue;
            }

            match get_backup_metadata(&entry.path()) {
                Ok(artifact) => backups.push(artifact),
                // Deleted between read_dir and stat; skip it
                Err(e) => warn!("Skipping backup {}: {}", name, e),
            }
        }

        backups.sort_by(|a, b| {
            b.metadata
                .created_at
                .cmp(&a.metadata.created_at)
                .then_with(|| b.metadata.filename.cmp(&a.metadata.filename))
        });

        Ok(backups)
    }

    /// Look up one artifact by filename
    pub fn find_backup(&self, name: &str) -> Result<Option<BackupArtifact>> {
        let name = validate_backup_name(name)?;
        let path = self.config.backup_dir.join(name);
        if !path.is_file() {
            return Ok(None);
        }
        get_backup_metadata(&path).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generate_backup_filename() {
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 22).unwrap();
        assert_eq!(
            generate_backup_filename(DEFAULT_PREFIX, at, true),
            "backup_20250115_143022.sql.gz"
        );
        assert_eq!(
            generate_backup_filename(SAFETY_PREFIX, at, true),
            "pre_restore_backup_20250115_143022.sql.gz"
        );
        assert_eq!(
            generate_backup_filename("nightly", at, false),
            "nightly.sql.gz"
        );
    }

    #[test]
    fn test_validate_backup_name() {
        assert!(validate_backup_name("backup_20250101_000000.sql.gz").is_ok());
        assert!(validate_backup_name("manual.sql.gz").is_ok());

        for bad in [
            "../escape.sql.gz",
            "nested/backup.sql.gz",
            ".hidden.sql.gz",
            "backup.tar.gz",
            ".sql.gz",
            "",
        ] {
            assert!(
                matches!(validate_backup_name(bad), Err(Error::Config(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_metadata_reads_legacy_field_names() {
        let json = r#"{
            "filename": "backup_20240301_120000.sql.gz",
            "created_at": "2024-03-01T12:00:00.123456",
            "database_type": "sqlite",
            "size_bytes": 2048,
            "application_version": "2.1.0"
        }"#;
        let meta: ArtifactMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.datastore_kind, Some(DatastoreKind::FileBased));
        assert_eq!(meta.app_version.as_deref(), Some("2.1.0"));
        assert_eq!(
            meta.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2024-03-01 12:00:00"
        );
    }
}
