//! Sidecar metadata files
//!
//! Every artifact `<name>.sql.gz` has a JSON sidecar `<name>.sql.gz.meta`.
//! When the sidecar is missing or unreadable, metadata is synthesized from
//! the artifact's filesystem timestamps instead of failing.

use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{ArtifactMetadata, BackupArtifact, METADATA_SUFFIX};
use crate::error::{Error, Result};

/// Path of the sidecar belonging to `artifact`
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}

/// Resolve metadata for an artifact
///
/// Fails only if the artifact itself cannot be read.
pub fn get_backup_metadata(artifact: &Path) -> Result<BackupArtifact> {
    let file_meta = fs::metadata(artifact)?;
    let sidecar = sidecar_path(artifact);

    if sidecar.is_file() {
        match read_sidecar(&sidecar) {
            Ok(metadata) => {
                return Ok(BackupArtifact {
                    path: artifact.to_path_buf(),
                    metadata,
                    has_sidecar: true,
                })
            }
            Err(e) => warn!(
                "Unreadable sidecar {}, falling back to file times: {}",
                sidecar.display(),
                e
            ),
        }
    }

    Ok(BackupArtifact {
        path: artifact.to_path_buf(),
        metadata: ArtifactMetadata {
            filename: file_name(artifact),
            created_at: file_time(&file_meta),
            datastore_kind: None,
            size_bytes: file_meta.len(),
            app_version: None,
        },
        has_sidecar: false,
    })
}

pub(crate) fn read_sidecar(sidecar: &Path) -> Result<ArtifactMetadata> {
    let reader = BufReader::new(File::open(sidecar)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Write a sidecar atomically (temp file + rename)
pub(crate) fn write_sidecar(artifact: &Path, metadata: &ArtifactMetadata) -> Result<()> {
    let sidecar = sidecar_path(artifact);
    let dir = sidecar
        .parent()
        .ok_or_else(|| Error::Backup(format!("No parent directory for {}", sidecar.display())))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".meta.partial")
        .tempfile_in(dir)?;
    serde_json::to_writer_pretty(temp.as_file_mut(), metadata)?;
    temp.as_file_mut().write_all(b"\n")?;
    temp.as_file().sync_all()?;
    temp.persist(&sidecar).map_err(|e| {
        Error::Backup(format!(
            "Failed to write metadata {}: {}",
            sidecar.display(),
            e.error
        ))
    })?;
    Ok(())
}

/// Creation time of a file, falling back to modification time
pub(crate) fn file_time(meta: &fs::Metadata) -> DateTime<Utc> {
    meta.created()
        .or_else(|_| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
