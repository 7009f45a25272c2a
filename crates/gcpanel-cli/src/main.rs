//! gcPanel backup CLI
//!
//! Usage:
//!   gcpanel-backup create              Create a backup
//!   gcpanel-backup list                List backups, newest first
//!   gcpanel-backup verify --all        Verify every backup
//!   gcpanel-backup cleanup             Apply the retention window
//!   gcpanel-backup recover 2025-01-15  Restore the newest backup at or before a time
//!   gcpanel-backup scheduled           Create, verify, clean up (cron entry point)

mod cli;
mod commands;


use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    let manager = commands::open_manager(&cli)?;

    match &cli.command {
        Commands::Create { name } => commands::cmd_backup_create(&manager, name.as_deref()),
        Commands::List { json } => commands::cmd_backup_list(&manager, *json),
        Commands::Verify { name, all } => {
            commands::cmd_backup_verify(&manager, name.as_deref(), *all)
        }
        Commands::Cleanup => commands::cmd_backup_cleanup(&manager),
        Commands::Restore { name, yes } => commands::cmd_backup_restore(&manager, name, *yes),
        Commands::Recover {
            target,
            dry_run,
            yes,
        } => commands::cmd_backup_recover(&manager, target, *dry_run, *yes),
        Commands::Scheduled => commands::cmd_backup_scheduled(&manager),
    }
}
