//! Backup management commands

use anyhow::{Context, Result};
use gcpanel_core::{BackupArtifact, BackupManager, Error, RecoveryRequest};

use super::{confirm, format_size};

/// Create a new backup and check that it restores
pub fn cmd_backup_create(manager: &BackupManager, name: Option<&str>) -> Result<()> {
    println!("Creating backup of {}...", manager.datastore().describe());

    let artifact = manager
        .create_backup(name)
        .context("Failed to create backup")?;

    println!("Verifying {}...", artifact.filename());
    let valid = manager
        .verify_backup(&artifact.path)
        .with_context(|| format!("Failed to verify {}", artifact.filename()))?;
    if !valid {
        anyhow::bail!(
            "Backup {} was written but failed verification (kept at {} for inspection)",
            artifact.filename(),
            artifact.path.display()
        );
    }

    println!("✅ Backup created and verified: {}", artifact.filename());
    println!("   Location: {}", artifact.path.display());
    println!("   Size: {}", format_size(artifact.metadata.size_bytes));

    Ok(())
}

/// List available backups
pub fn cmd_backup_list(manager: &BackupManager, json: bool) -> Result<()> {
    let backup_dir = manager.backup_dir();
    let backups = manager.list_backups().context("Failed to list backups")?;

    if json {
        let metadata: Vec<_> = backups.iter().map(|b| &b.metadata).collect();
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups found");
        println!("Directory: {}", backup_dir.display());
        return Ok(());
    }

    println!("Available backups ({}):", backup_dir.display());
    println!();
    println!(
        "{:<45} {:>10} {:>16} {:>10}",
        "NAME", "SIZE", "CREATED", "SOURCE"
    );
    println!("{}", "-".repeat(84));

    for backup in &backups {
        println!("{}", format_row(backup));
    }

    Ok(())
}

fn format_row(backup: &BackupArtifact) -> String {
    let created = backup.created_at().format("%Y-%m-%d %H:%M");
    let source = backup
        .metadata
        .datastore_kind
        .map(|k| k.to_string())
        .unwrap_or_else(|| "?".to_string());
    let flag = if backup.has_sidecar { "" } else { " (no metadata)" };

    format!(
        "{:<45} {:>10} {:>16} {:>10}{}",
        backup.filename(),
        format_size(backup.metadata.size_bytes),
        created,
        source,
        flag
    )
}

/// Verify one backup (default: the newest) or all of them
pub fn cmd_backup_verify(manager: &BackupManager, name: Option<&str>, all: bool) -> Result<()> {
    if all {
        let reports = manager.verify_all().context("Failed to verify backups")?;
        if reports.is_empty() {
            println!("No backups to verify");
            return Ok(());
        }

        let mut failed = 0;
        for report in &reports {
            if report.valid {
                println!("✅ {}", report.filename);
            } else {
                failed += 1;
                println!("❌ {}", report.filename);
            }
        }
        println!();
        println!("{} verified, {} failed", reports.len() - failed, failed);

        if failed > 0 {
            anyhow::bail!("{} backup(s) failed verification", failed);
        }
        return Ok(());
    }

    let artifact = match name {
        Some(name) => manager
            .find_backup(name)?
            .ok_or_else(|| anyhow::anyhow!("Backup not found: {}", name))?,
        None => manager
            .list_backups()?
            .into_iter()
            .next()
            .ok_or_else(|| {
                anyhow::anyhow!("No backups found in {}", manager.backup_dir().display())
            })?,
    };

    println!("Verifying {}...", artifact.filename());
    if manager.verify_backup(&artifact.path)? {
        println!("✅ Backup is restorable: {}", artifact.filename());
        Ok(())
    } else {
        anyhow::bail!(
            "Backup failed verification: {} (see log for the cause)",
            artifact.filename()
        )
    }
}

/// Delete backups older than the retention window
pub fn cmd_backup_cleanup(manager: &BackupManager) -> Result<()> {
    let removed = manager
        .cleanup_old_backups()
        .context("Failed to clean up old backups")?;

    println!(
        "✅ Removed {} backup(s) older than {} days",
        removed,
        manager.config().retention_days
    );
    Ok(())
}

/// Restore the live datastore from a named backup
pub fn cmd_backup_restore(manager: &BackupManager, name: &str, yes: bool) -> Result<()> {
    let artifact = manager
        .find_backup(name)?
        .ok_or_else(|| anyhow::anyhow!("Backup not found: {}", name))?;

    if !yes {
        println!(
            "⚠️  This will replace the contents of {} with {}",
            manager.datastore().describe(),
            artifact.filename()
        );
        println!("   A safety snapshot of the current state is taken first.");
        if !confirm("Continue?")? {
            println!("Cancelled");
            return Ok(());
        }
    }

    println!("Restoring from backup: {}", artifact.filename());
    let outcome = manager
        .restore_backup(&artifact.path)
        .with_context(|| format!("Failed to restore {}", artifact.filename()))?;

    println!("✅ Restored from: {}", outcome.restored.filename());
    print_snapshot(outcome.safety_snapshot.as_ref());
    Ok(())
}

/// Restore by filename or to a point in time
pub fn cmd_backup_recover(
    manager: &BackupManager,
    target: &str,
    dry_run: bool,
    yes: bool,
) -> Result<()> {
    let request: RecoveryRequest = target
        .parse()
        .with_context(|| format!("Invalid recovery target: {}", target))?;

    let selected = match manager.select_backup(&request) {
        Ok(selected) => selected,
        Err(Error::NoSuitableBackup(msg)) => anyhow::bail!("No suitable backup: {}", msg),
        Err(e) => return Err(e).context("Failed to select backup"),
    };

    println!(
        "Selected {} (created {})",
        selected.filename(),
        selected.created_at().format("%Y-%m-%d %H:%M:%S UTC")
    );

    if dry_run {
        println!("Dry run: nothing restored");
        return Ok(());
    }

    if !yes
        && !confirm(&format!(
            "⚠️  Replace the contents of {}?",
            manager.datastore().describe()
        ))?
    {
        println!("Cancelled");
        return Ok(());
    }

    let outcome = manager
        .point_in_time_recovery(target)
        .with_context(|| format!("Failed to recover to {}", request))?;

    println!("✅ Recovered using: {}", outcome.restored.filename());
    print_snapshot(outcome.safety_snapshot.as_ref());
    Ok(())
}

/// Create, verify, then sweep
pub fn cmd_backup_scheduled(manager: &BackupManager) -> Result<()> {
    let run = manager
        .run_scheduled_backup()
        .context("Scheduled backup failed")?;

    println!("✅ Backup created and verified: {}", run.artifact.filename());
    println!("   Size: {}", format_size(run.artifact.metadata.size_bytes));
    println!("   Removed: {} old backup(s)", run.removed);
    Ok(())
}

fn print_snapshot(snapshot: Option<&BackupArtifact>) {
    match snapshot {
        Some(snapshot) => println!("   Safety snapshot: {}", snapshot.path.display()),
        None => println!("   No safety snapshot (there was no live data)"),
    }
}
