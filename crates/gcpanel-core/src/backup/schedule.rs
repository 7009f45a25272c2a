//! The create, verify, sweep sequence run by cron or a systemd timer

use tracing::{error, info};

use super::{BackupArtifact, BackupManager};
use crate::error::{Error, Result};

/// Result of one scheduled run
#[derive(Debug, Clone)]
pub struct ScheduledRun {
    /// The artifact created and verified by this run
    pub artifact: BackupArtifact,
    /// Number of artifacts removed by the retention sweep
    pub removed: usize,
}

impl BackupManager {
    /// Create a backup, verify it, then apply retention
    ///
    /// The sweep only runs once the new artifact has verified, so a broken
    /// export never causes older good backups to be deleted.
    pub fn run_scheduled_backup(&self) -> Result<ScheduledRun> {
        info!("Running scheduled backup...");

        let artifact = self.create_backup(None)?;

        if !self.verify_backup(&artifact.path)? {
            error!(
                "Scheduled backup {} failed verification; skipping retention sweep",
                artifact.filename()
            );
            return Err(Error::Verification(format!(
                "{} could not be restored into a disposable datastore",
                artifact.filename()
            )));
        }

        let removed = self.cleanup_old_backups()?;
        info!(
            "Scheduled backup completed: {} ({} old backup(s) removed)",
            artifact.filename(),
            removed
        );

        Ok(ScheduledRun { artifact, removed })
    }
}
