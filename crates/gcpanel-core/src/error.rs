//! Error types for gcPanel backup and recovery

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Restore error: {0}")]
    Restore(String),

    #[error("No suitable backup: {0}")]
    NoSuitableBackup(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Command `{command}` timed out after {}s", .after.as_secs())]
    Timeout { command: String, after: Duration },

    #[error("Backup directory is locked: {0}")]
    Locked(String),
}

pub type Result<T> = std::result::Result<T, Error>;
