//! Backup creation
//!
//! The export is streamed through gzip into a hidden temp file in the backup
//! directory, synced, and renamed into place only after the exporter reports
//! success. A failed export therefore never leaves a file that looks like a
//! valid artifact.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{error, info};

use super::metadata::write_sidecar;
use super::{
    generate_backup_filename, validate_backup_name, ArtifactMetadata, BackupArtifact,
    BackupManager, BACKUP_EXTENSION, DEFAULT_PREFIX,
};
use crate::error::{Error, Result};

impl BackupManager {
    /// Create a backup of the live datastore
    ///
    /// # Arguments
    /// * `target_name` - Optional filename override (defaults to
    ///   `backup_<YYYYMMDD_HHMMSS>.sql.gz`, with `_1`, `_2`, ... appended
    ///   when that name is already taken)
    pub fn create_backup(&self, target_name: Option<&str>) -> Result<BackupArtifact> {
        self.ensure_backup_dir()?;
        let _lock = self.lock()?;
        self.create_backup_unlocked(target_name, DEFAULT_PREFIX)
    }

    /// Creation without taking the directory lock; the caller must hold it
    pub(crate) fn create_backup_unlocked(
        &self,
        target_name: Option<&str>,
        prefix: &str,
    ) -> Result<BackupArtifact> {
        let created_at = self.clock.now();
        let dir = &self.config.backup_dir;
        let name = match target_name {
            Some(name) => validate_backup_name(name)?.to_string(),
            None => unused_generated_name(dir, prefix, created_at),
        };
        let path = dir.join(&name);

        if path.exists() {
            return Err(Error::Backup(format!(
                "Backup already exists: {}",
                path.display()
            )));
        }

        info!(
            "Creating backup {} from {}",
            name,
            self.datastore.describe()
        );

        let mut partial = tempfile::Builder::new()
            .prefix(".")
            .suffix(".partial")
            .tempfile_in(dir)
            .map_err(|e| {
                Error::Backup(format!(
                    "Backup directory {} is not writable: {}",
                    dir.display(),
                    e
                ))
            })?;

        {
            let writer = BufWriter::new(partial.as_file_mut());
            let mut encoder = GzEncoder::new(writer, Compression::default());

            self.datastore
                .export(&mut encoder)
                .map_err(|e| creation_error(&name, e))?;

            let mut writer = encoder.finish().map_err(|e| creation_error(&name, e.into()))?;
            writer.flush().map_err(|e| creation_error(&name, e.into()))?;
        }

        partial
            .as_file()
            .sync_all()
            .map_err(|e| creation_error(&name, e.into()))?;

        // noclobber: a concurrent writer outside the lock must not be overwritten
        partial.persist_noclobber(&path).map_err(|e| {
            Error::Backup(format!(
                "Failed to move backup into place at {}: {}",
                path.display(),
                e.error
            ))
        })?;

        let metadata = ArtifactMetadata {
            filename: name.clone(),
            created_at,
            datastore_kind: Some(self.datastore.kind()),
            size_bytes: fs::metadata(&path)?.len(),
            app_version: Some(self.config.app_version.clone()),
        };

        if let Err(e) = write_sidecar(&path, &metadata) {
            error!("Removing {}: metadata could not be written", name);
            let _ = fs::remove_file(&path);
            return Err(creation_error(&name, e));
        }

        info!(
            "Backup complete: {} ({} bytes)",
            metadata.filename, metadata.size_bytes
        );

        Ok(BackupArtifact {
            path,
            metadata,
            has_sidecar: true,
        })
    }
}

/// Tool and datastore errors pass through; plain I/O becomes a backup failure
fn unused_generated_name(dir: &Path, prefix: &str, at: DateTime<Utc>) -> String {
    let base = generate_backup_filename(prefix, at, true);
    let stem = base.strip_suffix(BACKUP_EXTENSION).unwrap_or(&base);

    let mut name = base.clone();
    let mut counter = 0u32;
    while dir.join(&name).exists() {
        counter += 1;
        name = format!("{}_{}{}", stem, counter, BACKUP_EXTENSION);
    }
    name
}

fn creation_error(name: &str, err: Error) -> Error {
    match err {
        Error::Io(e) => Error::Backup(format!("Failed writing {}: {}", name, e)),
        Error::Database(e) => Error::Backup(format!("Export for {} failed: {}", name, e)),
        other => other,
    }
}
