//! CLI command implementations
//!
//! - `backup` - Backup commands (create, list, verify, cleanup, restore, recover, scheduled)
//!
//! Shared helpers for resolving configuration live here.

pub mod backup;

use std::io::{self, Write};

use anyhow::{Context, Result};
use gcpanel_core::{BackupConfig, BackupManager};

use crate::cli::Cli;

// Re-export command functions for main.rs
pub use backup::*;

/// Resolve configuration: command-line flags win over environment variables
pub fn load_config<F>(cli: &Cli, env: F) -> Result<BackupConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let flag = |key: &str| -> Option<String> {
        match key {
            "BACKUP_DIR" => cli.backup_dir.as_ref().map(|p| p.display().to_string()),
            "BACKUP_RETENTION_DAYS" => cli.retention_days.map(|d| d.to_string()),
            "DB_PATH" => cli.db_path.as_ref().map(|p| p.display().to_string()),
            "DATABASE_URL" => cli.database_url.clone(),
            _ => None,
        }
    };

    // --db-path alone means file-based mode even if DATABASE_URL is set
    let prefer_file = cli.db_path.is_some() && cli.database_url.is_none();

    BackupConfig::from_lookup(|key| {
        if prefer_file && key == "DATABASE_URL" {
            return None;
        }
        flag(key).or_else(|| env(key))
    })
    .context("Invalid backup configuration")
}

/// Build a manager from the command line and the process environment
pub fn open_manager(cli: &Cli) -> Result<BackupManager> {
    let config = load_config(cli, |key| std::env::var(key).ok())?;
    tracing::debug!("Backup configuration: {:?}", config);
    Ok(BackupManager::new(config))
}

/// Ask for confirmation on stdin
pub fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Format a byte size as human-readable
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
