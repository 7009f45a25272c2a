//! CLI argument definitions using clap
//!
//! This module contains the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// gcPanel backup and recovery
#[derive(Parser)]
#[command(name = "gcpanel-backup")]
#[command(about = "Backup, verify and restore the gcPanel datastore", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Backup directory (overrides BACKUP_DIR)
    #[arg(long, global = true)]
    pub backup_dir: Option<PathBuf>,

    /// Retention window in days (overrides BACKUP_RETENTION_DAYS)
    #[arg(long, global = true)]
    pub retention_days: Option<u32>,

    /// SQLite database path for file-based mode (overrides DB_PATH)
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// PostgreSQL connection URL (overrides DATABASE_URL)
    ///
    /// Prefer DATABASE_URL or POSTGRES_PASSWORD for credentials: values
    /// given here are visible in the process list.
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new backup
    Create {
        /// Backup filename (defaults to backup_<timestamp>.sql.gz)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List available backups, newest first
    List {
        /// Print metadata as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify a backup by restoring it into a disposable datastore
    Verify {
        /// Backup filename (defaults to the newest backup)
        name: Option<String>,

        /// Verify every backup
        #[arg(long, conflicts_with = "name")]
        all: bool,
    },

    /// Delete backups older than the retention window
    Cleanup,

    /// Restore the live datastore from a backup
    Restore {
        /// Backup filename to restore from
        name: String,

        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Point-in-time recovery
    ///
    /// TARGET is a backup filename or a timestamp such as
    /// "2025-01-15T00:00:00Z" or "2025-01-15 08:30"; the newest backup taken
    /// at or before the timestamp is restored.
    Recover {
        /// Backup filename or timestamp
        target: String,

        /// Only show which backup would be restored
        #[arg(long)]
        dry_run: bool,

        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Create, verify, then apply retention (for cron or systemd timers)
    Scheduled,
}
