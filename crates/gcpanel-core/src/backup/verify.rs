//! Backup verification by restoring into a disposable datastore

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::BackupManager;
use crate::error::{Error, Result};

/// Outcome of verifying one artifact in a batch
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub filename: String,
    pub path: PathBuf,
    pub valid: bool,
}

impl BackupManager {
    /// Verify that an artifact can be restored
    ///
    /// Restores into a disposable datastore (never the live one), runs
    /// `SELECT 1`, and tears the disposable instance down on every path.
    /// Any failure in that sequence yields `Ok(false)` with the cause logged;
    /// only configuration errors are returned as `Err`.
    pub fn verify_backup(&self, artifact: &Path) -> Result<bool> {
        if !artifact.is_file() {
            warn!("Backup file not found: {}", artifact.display());
            return Ok(false);
        }

        match self.restore_into_disposable(artifact) {
            Ok(()) => {
                info!("Backup verified: {}", artifact.display());
                Ok(true)
            }
            Err(Error::Config(msg)) => Err(Error::Config(msg)),
            Err(e) => {
                warn!("Backup verification failed for {}: {}", artifact.display(), e);
                Ok(false)
            }
        }
    }

    fn restore_into_disposable(&self, artifact: &Path) -> Result<()> {
        let mut scratch = self.datastore.disposable()?;
        debug!(
            "Verifying {} in disposable datastore {}",
            artifact.display(),
            scratch.name()
        );

        let mut decoder = GzDecoder::new(BufReader::new(File::open(artifact)?));
        scratch.load(&mut decoder)?;
        scratch.probe()
        // scratch dropped here: disposable datastore torn down
    }

    /// Verify every listed artifact, newest first
    ///
    /// A failing artifact is reported and the batch continues.
    pub fn verify_all(&self) -> Result<Vec<VerificationReport>> {
        let backups = self.list_backups()?;
        let mut reports = Vec::with_capacity(backups.len());

        for backup in backups {
            let valid = self.verify_backup(&backup.path)?;
            reports.push(VerificationReport {
                filename: backup.metadata.filename,
                path: backup.path,
                valid,
            });
        }

        let failed = reports.iter().filter(|r| !r.valid).count();
        info!(
            "Verified {} backup(s), {} failed",
            reports.len(),
            failed
        );
        Ok(reports)
    }
}
