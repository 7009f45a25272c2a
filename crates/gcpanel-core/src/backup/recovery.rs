//! Restore and point-in-time recovery
//!
//! Every restore first snapshots the live datastore into a
//! `pre_restore_backup_<ts>.sql.gz` artifact. If that snapshot cannot be
//! taken the live datastore is not touched.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use tracing::{error, info, warn};

use super::metadata::get_backup_metadata;
use super::timestamp::parse_timestamp;
use super::{
    validate_backup_name, BackupArtifact, BackupManager, RestoreOutcome, BACKUP_EXTENSION,
    SAFETY_PREFIX,
};
use crate::error::{Error, Result};

/// What to recover to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryRequest {
    /// A specific artifact in the backup directory
    Filename(String),
    /// The newest artifact taken at or before this instant
    Timestamp(DateTime<Utc>),
}

impl FromStr for RecoveryRequest {
    type Err = Error;

    /// Anything ending in `.sql.gz` is a filename; everything else must parse
    /// as a timestamp.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.ends_with(BACKUP_EXTENSION) {
            return Ok(Self::Filename(validate_backup_name(s)?.to_string()));
        }
        if s.contains('/') || s.contains('\\') {
            return Err(Error::Config(format!(
                "Recovery target must be a backup filename or a timestamp: {}",
                s
            )));
        }
        parse_timestamp(s).map(Self::Timestamp)
    }
}

impl fmt::Display for RecoveryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filename(name) => write!(f, "{}", name),
            Self::Timestamp(at) => write!(f, "{}", at.to_rfc3339()),
        }
    }
}

impl BackupManager {
    /// Resolve a recovery request to exactly one artifact
    ///
    /// For a timestamp this is the artifact with the greatest `created_at`
    /// not after the target.
    pub fn select_backup(&self, request: &RecoveryRequest) -> Result<BackupArtifact> {
        match request {
            RecoveryRequest::Filename(name) => self.find_backup(name)?.ok_or_else(|| {
                Error::NoSuitableBackup(format!("Backup file not found: {}", name))
            }),
            RecoveryRequest::Timestamp(target) => {
                let backups = self.list_backups()?;
                if backups.is_empty() {
                    return Err(Error::NoSuitableBackup(format!(
                        "No backups in {}",
                        self.config.backup_dir.display()
                    )));
                }

                // Newest first, so the first match is the latest one not after target
                backups
                    .into_iter()
                    .find(|b| b.metadata.created_at <= *target)
                    .ok_or_else(|| {
                        Error::NoSuitableBackup(format!(
                            "No backup found before {}",
                            target.to_rfc3339()
                        ))
                    })
            }
        }
    }

    /// Restore the live datastore from an artifact
    ///
    /// A safety snapshot of the current state is written first, and a
    /// snapshot failure leaves the live datastore untouched. The one
    /// exception is when there is no live state at all (for example the
    /// SQLite file does not exist yet): the restore then proceeds without a
    /// snapshot and [`RestoreOutcome::safety_snapshot`] is `None`.
    pub fn restore_backup(&self, artifact: &Path) -> Result<RestoreOutcome> {
        self.ensure_backup_dir()?;
        let _lock = self.lock()?;
        self.restore_unlocked(artifact)
    }

    /// Restore from a backup filename or to a point in time
    ///
    /// The target is parsed before anything else happens, so a malformed
    /// timestamp never touches the datastore or the backup directory.
    pub fn point_in_time_recovery(&self, target: &str) -> Result<RestoreOutcome> {
        let request: RecoveryRequest = target.parse()?;

        self.ensure_backup_dir()?;
        let _lock = self.lock()?;

        let selected = self.select_backup(&request)?;
        info!(
            "Recovering to {} using {} (created {})",
            request,
            selected.filename(),
            selected.created_at().to_rfc3339()
        );
        self.restore_unlocked(&selected.path)
    }

    fn restore_unlocked(&self, artifact: &Path) -> Result<RestoreOutcome> {
        if !artifact.is_file() {
            return Err(Error::Restore(format!(
                "Backup file not found: {}",
                artifact.display()
            )));
        }
        let restored = get_backup_metadata(artifact)?;

        let safety_snapshot = self.take_safety_snapshot()?;
        let snapshot_name = safety_snapshot
            .as_ref()
            .map(|s| s.filename().to_string())
            .unwrap_or_else(|| "(none)".to_string());

        info!(
            "Restoring {} into {}",
            restored.filename(),
            self.datastore.describe()
        );

        let file = File::open(artifact)
            .map_err(|e| Error::Restore(format!("Failed to open {}: {}", artifact.display(), e)))?;
        let mut decoder = GzDecoder::new(BufReader::new(file));

        if let Err(e) = self.datastore.restore(&mut decoder) {
            error!(
                "Restore from {} failed; pre-restore state is in {}",
                restored.filename(),
                snapshot_name
            );
            return Err(match e {
                Error::Timeout { .. } => e,
                other => Error::Restore(format!(
                    "{} could not be restored ({}); safety snapshot: {}",
                    restored.filename(),
                    other,
                    snapshot_name
                )),
            });
        }

        info!("Restore complete: {}", restored.filename());
        Ok(RestoreOutcome {
            restored,
            safety_snapshot,
        })
    }

    fn take_safety_snapshot(&self) -> Result<Option<BackupArtifact>> {
        let err = match self.create_backup_unlocked(None, SAFETY_PREFIX) {
            Ok(snapshot) => {
                info!("Safety snapshot written: {}", snapshot.filename());
                return Ok(Some(snapshot));
            }
            Err(e) => e,
        };

        if !self.datastore.is_present()? {
            warn!("No live datastore to snapshot, restoring without safety snapshot");
            return Ok(None);
        }

        match err {
            Error::Timeout { .. } => Err(err),
            other => Err(Error::Restore(format!(
                "Safety snapshot failed, live datastore left untouched: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};
    use rusqlite::Connection;
    use tempfile::TempDir;

    use super::*;
    use crate::backup::DEFAULT_PREFIX;
    use crate::clock::FixedClock;
    use crate::config::{BackupConfig, DatastoreConfig};
    use crate::datastore::{Datastore, DatastoreKind, DisposableStore};

    struct Fixture {
        _dir: TempDir,
        db_path: std::path::PathBuf,
        clock: Arc<FixedClock>,
        manager: BackupManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("data").join("gcpanel.db");
        fs::create_dir_all(db_path.parent().unwrap()).unwrap();
        Connection::open(&db_path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE projects (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 INSERT INTO projects (name) VALUES ('v1');",
            )
            .unwrap();

        let config = BackupConfig::new(
            dir.path().join("backups"),
            DatastoreConfig::Sqlite {
                path: db_path.clone(),
            },
        );
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let manager = BackupManager::new(config).with_clock(clock.clone());
        Fixture {
            _dir: dir,
            db_path,
            clock,
            manager,
        }
    }

    fn set_name(db: &Path, name: &str) {
        Connection::open(db)
            .unwrap()
            .execute("UPDATE projects SET name = ?1", [name])
            .unwrap();
    }

    fn current_name(db: &Path) -> String {
        Connection::open(db)
            .unwrap()
            .query_row("SELECT name FROM projects", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_request_parsing() {
        assert_eq!(
            "backup_20250101_000000.sql.gz".parse::<RecoveryRequest>().unwrap(),
            RecoveryRequest::Filename("backup_20250101_000000.sql.gz".to_string())
        );
        assert_eq!(
            "2025-01-15".parse::<RecoveryRequest>().unwrap(),
            RecoveryRequest::Timestamp(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap())
        );
        assert!(matches!(
            "../etc/backup.sql.gz".parse::<RecoveryRequest>(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            "yesterday".parse::<RecoveryRequest>(),
            Err(Error::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_point_in_time_selection() {
        let f = fixture();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap();

        for at in [t1, t2, t3] {
            f.clock.set(at);
            f.manager.create_backup(None).unwrap();
        }

        let pick = |at: DateTime<Utc>| {
            f.manager
                .select_backup(&RecoveryRequest::Timestamp(at))
                .map(|b| b.created_at())
        };

        assert_eq!(pick(t2 + Duration::hours(12)).unwrap(), t2);
        assert_eq!(pick(t2).unwrap(), t2);
        assert_eq!(pick(t3 + Duration::days(30)).unwrap(), t3);
        assert!(matches!(
            pick(t1 - Duration::seconds(1)),
            Err(Error::NoSuitableBackup(_))
        ));
    }

    #[test]
    fn test_select_from_empty_directory() {
        let f = fixture();
        let err = f
            .manager
            .select_backup(&RecoveryRequest::Timestamp(Utc::now()))
            .unwrap_err();
        assert!(matches!(err, Error::NoSuitableBackup(_)));

        let err = f
            .manager
            .select_backup(&RecoveryRequest::Filename("missing.sql.gz".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::NoSuitableBackup(_)));
    }

    #[test]
    fn test_recovery_restores_selected_state() {
        let f = fixture();

        f.clock.set(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        f.manager.create_backup(None).unwrap();

        set_name(&f.db_path, "v2");
        f.clock.set(Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap());
        f.manager.create_backup(None).unwrap();

        set_name(&f.db_path, "v3");
        f.clock.set(Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap());
        f.manager.create_backup(None).unwrap();

        set_name(&f.db_path, "live");
        f.clock.set(Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap());

        let outcome = f
            .manager
            .point_in_time_recovery("2025-01-02T12:00:00Z")
            .unwrap();
        assert_eq!(outcome.restored.filename(), "backup_20250102_000000.sql.gz");
        assert_eq!(current_name(&f.db_path), "v2");

        let snapshot = outcome.safety_snapshot.unwrap();
        assert!(snapshot.filename().starts_with(SAFETY_PREFIX));
        assert!(snapshot.path.is_file());

        // The snapshot holds the state from just before the restore
        f.clock.set(Utc.with_ymd_and_hms(2025, 1, 11, 0, 0, 0).unwrap());
        f.manager.restore_backup(&snapshot.path).unwrap();
        assert_eq!(current_name(&f.db_path), "live");
    }

    #[test]
    fn test_failed_restore_keeps_snapshot_and_live_state() {
        let f = fixture();
        fs::create_dir_all(f.manager.backup_dir()).unwrap();
        let corrupt = f.manager.backup_dir().join("corrupt.sql.gz");
        fs::write(&corrupt, b"definitely not gzip").unwrap();

        let err = f.manager.restore_backup(&corrupt).unwrap_err();
        assert!(matches!(err, Error::Restore(_)));
        assert_eq!(current_name(&f.db_path), "v1");

        let snapshots: Vec<_> = f
            .manager
            .list_backups()
            .unwrap()
            .into_iter()
            .filter(|b| b.filename().starts_with(SAFETY_PREFIX))
            .collect();
        assert_eq!(snapshots.len(), 1);
    }

    #[test]
    fn test_restore_without_live_database() {
        let f = fixture();
        let artifact = f.manager.create_backup(None).unwrap();
        fs::remove_file(&f.db_path).unwrap();

        f.clock.advance(Duration::minutes(5));
        let outcome = f.manager.restore_backup(&artifact.path).unwrap();
        assert!(outcome.safety_snapshot.is_none());
        assert_eq!(current_name(&f.db_path), "v1");
    }

    #[test]
    fn test_invalid_timestamp_touches_nothing() {
        let f = fixture();
        let err = f.manager.point_in_time_recovery("not-a-date").unwrap_err();
        assert!(matches!(err, Error::InvalidTimestamp(_)));
        assert!(!f.manager.backup_dir().exists());
        assert_eq!(current_name(&f.db_path), "v1");
    }

    /// Live datastore that exists but cannot be exported
    struct UnexportableStore {
        restored: Arc<AtomicBool>,
    }

    impl Datastore for UnexportableStore {
        fn kind(&self) -> DatastoreKind {
            DatastoreKind::Postgres
        }
        fn describe(&self) -> String {
            "unexportable".to_string()
        }
        fn is_present(&self) -> Result<bool> {
            Ok(true)
        }
        fn export(&self, _sink: &mut (dyn Write + Send)) -> Result<()> {
            Err(Error::Backup("pg_dump: connection refused".to_string()))
        }
        fn disposable(&self) -> Result<Box<dyn DisposableStore>> {
            unimplemented!()
        }
        fn restore(&self, _source: &mut (dyn Read + Send)) -> Result<()> {
            self.restored.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_failed_snapshot_blocks_restore() {
        let dir = TempDir::new().unwrap();
        let restored = Arc::new(AtomicBool::new(false));
        let config = BackupConfig::new(
            dir.path().join("backups"),
            DatastoreConfig::Sqlite {
                path: dir.path().join("unused.db"),
            },
        );
        let manager = BackupManager::with_datastore(
            config,
            Box::new(UnexportableStore {
                restored: restored.clone(),
            }),
        );

        fs::create_dir_all(manager.backup_dir()).unwrap();
        let artifact = manager.backup_dir().join("backup_20250101_000000.sql.gz");
        fs::write(&artifact, b"not inspected").unwrap();

        let err = manager.restore_backup(&artifact).unwrap_err();
        match err {
            Error::Restore(msg) => assert!(msg.contains("Safety snapshot failed"), "{}", msg),
            other => panic!("expected restore error, got {}", other),
        }
        assert!(!restored.load(Ordering::SeqCst));

        // Only the artifact remains; the failed snapshot left no files
        let entries: Vec<_> = fs::read_dir(manager.backup_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert_eq!(entries.len(), 1, "unexpected files: {:?}", entries);
    }

    #[test]
    fn test_missing_artifact_is_a_restore_error() {
        let f = fixture();
        let missing = f
            .manager
            .backup_dir()
            .join(format!("{}_20200101_000000.sql.gz", DEFAULT_PREFIX));
        let err = f.manager.restore_backup(&missing).unwrap_err();
        assert!(matches!(err, Error::Restore(_)));
    }
}
