//! PostgreSQL datastore driven through the client tools
//!
//! Uses `pg_dump` for exports and `psql`, `createdb`, `dropdb` for
//! verification and restores. Credentials go through `PGPASSWORD` in the
//! child environment, never on the command line.
//!
//! Restores load into a staging database. The live database then stops
//! accepting connections, its sessions are terminated and waited for, and
//! the names are swapped inside one transaction on the maintenance database:
//!
//! ```text
//! gcpanel          -> gcpanel_pre_swap_<ts>
//! gcpanel_restore_<ts> -> gcpanel
//! ```
//!
//! after which the previous database is dropped.

use std::io::{Read, Write};
use std::process::{self, Command};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use super::{Datastore, DatastoreKind, DisposableStore};
use crate::config::PostgresConfig;
use crate::error::{Error, Result};
use crate::process::run_command;

/// Database used for `ALTER DATABASE ... RENAME`, which cannot run on the
/// database being renamed
const MAINTENANCE_DB: &str = "postgres";

/// Polls, 100ms apart, for terminated sessions to go away before a swap
const DISCONNECT_ATTEMPTS: u32 = 100;

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// PostgreSQL server reached through `pg_dump` / `psql`
#[derive(Debug, Clone)]
pub struct PostgresDatastore {
    config: PostgresConfig,
    timeout: Duration,
}

impl PostgresDatastore {
    pub fn new(config: PostgresConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    /// A client tool with host, port, user and password applied
    fn tool(&self, program: &str) -> Command {
        client_command(&self.config, program)
    }

    fn psql(&self, dbname: &str) -> Command {
        let mut cmd = self.tool("psql");
        cmd.args(["-X", "-q", "-v", "ON_ERROR_STOP=1", "-d", dbname]);
        cmd
    }

    fn create_database(&self, name: &str) -> Result<()> {
        run_command(
            self.tool("createdb").arg(name),
            self.timeout,
            None,
            None,
        )
        .map_err(|e| e.into_error(Error::Restore))
    }

    fn load_into(&self, dbname: &str, source: &mut (dyn Read + Send)) -> Result<()> {
        run_command(&mut self.psql(dbname), self.timeout, Some(source), None)
            .map_err(|e| e.into_error(Error::Restore))
    }

    fn swap_into_place(&self, staging: &str, retired: &str) -> Result<()> {
        let live = self.config.dbname.as_str();
        let mut cmd = self.psql(MAINTENANCE_DB);
        for statement in swap_statements(live, staging, retired) {
            cmd.arg("-c").arg(statement);
        }

        let result = run_command(&mut cmd, self.timeout, None, None)
            .map_err(|e| e.into_error(Error::Restore));
        if result.is_err() {
            self.reopen_connections(live);
        }
        result
    }

    /// Best-effort undo of `ALLOW_CONNECTIONS false` after a failed swap
    fn reopen_connections(&self, dbname: &str) {
        let mut cmd = self.psql(MAINTENANCE_DB);
        cmd.arg("-c").arg(format!(
            "ALTER DATABASE {} ALLOW_CONNECTIONS true;",
            quote_ident(dbname)
        ));
        if let Err(e) = run_command(&mut cmd, self.timeout, None, None) {
            error!("Failed to re-enable connections to {}: {}", dbname, e);
        }
    }
}

/// Statements that swap `staging` in for `live`, each run as its own `psql -c`
///
/// New sessions are refused first, then existing ones are terminated and
/// waited for, so nothing can reconnect before the renames.
fn swap_statements(live: &str, staging: &str, retired: &str) -> Vec<String> {
    let live_lit = quote_literal(live);
    let live_ident = quote_ident(live);

    let others = format!(
        "FROM pg_stat_activity WHERE datname = {} AND pid <> pg_backend_pid()",
        live_lit
    );
    let wait_body = format!(
        "BEGIN \
           FOR attempt IN 1..{attempts} LOOP \
             PERFORM pg_terminate_backend(pid) {others}; \
             PERFORM pg_stat_clear_snapshot(); \
             IF NOT EXISTS (SELECT 1 {others}) THEN RETURN; END IF; \
             PERFORM pg_sleep(0.1); \
           END LOOP; \
           RAISE EXCEPTION 'sessions still connected to database %', {live_lit}; \
         END",
        attempts = DISCONNECT_ATTEMPTS,
        others = others,
        live_lit = live_lit,
    );

    vec![
        format!("ALTER DATABASE {} ALLOW_CONNECTIONS false;", live_ident),
        format!("DO {};", quote_literal(&wait_body)),
        format!(
            "BEGIN; \
             ALTER DATABASE {live} RENAME TO {retired}; \
             ALTER DATABASE {staging} RENAME TO {live}; \
             COMMIT;",
            live = live_ident,
            retired = quote_ident(retired),
            staging = quote_ident(staging),
        ),
    ]
}

fn client_command(config: &PostgresConfig, program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("-h")
        .arg(&config.host)
        .arg("-p")
        .arg(config.port.to_string());
    if let Some(user) = &config.user {
        cmd.arg("-U").arg(user);
    }
    if let Some(password) = &config.password {
        cmd.env("PGPASSWORD", password);
    }
    cmd
}

impl Datastore for PostgresDatastore {
    fn kind(&self) -> DatastoreKind {
        DatastoreKind::Postgres
    }

    fn describe(&self) -> String {
        format!(
            "postgresql://{}:{}/{}",
            self.config.host, self.config.port, self.config.dbname
        )
    }

    fn export(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        let mut cmd = self.tool("pg_dump");
        cmd.arg("-d").arg(&self.config.dbname);
        run_command(&mut cmd, self.timeout, None, Some(sink))
            .map_err(|e| e.into_error(Error::Backup))
    }

    fn disposable(&self) -> Result<Box<dyn DisposableStore>> {
        let name = format!(
            "gcpanel_verify_{}_{}",
            process::id(),
            SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        self.create_database(&name)?;
        Ok(Box::new(ScratchPostgres {
            store: self.clone(),
            name,
        }))
    }

    fn restore(&self, source: &mut (dyn Read + Send)) -> Result<()> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let staging = format!("{}_restore_{}", self.config.dbname, stamp);
        let retired = format!("{}_pre_swap_{}", self.config.dbname, stamp);

        self.create_database(&staging)?;

        if let Err(e) = self
            .load_into(&staging, source)
            .and_then(|_| self.swap_into_place(&staging, &retired))
        {
            drop_database(&self.config, &staging, self.timeout);
            return Err(e);
        }

        info!(
            "Swapped restored database into place; previous copy renamed to {}",
            retired
        );

        if !drop_database(&self.config, &retired, self.timeout) {
            warn!(
                "Previous database kept as {}; drop it manually once the restore is confirmed",
                retired
            );
        }
        Ok(())
    }
}

/// Verification database dropped on drop
struct ScratchPostgres {
    store: PostgresDatastore,
    name: String,
}

impl DisposableStore for ScratchPostgres {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn load(&mut self, source: &mut (dyn Read + Send)) -> Result<()> {
        self.store.load_into(&self.name, source)
    }

    fn probe(&self) -> Result<()> {
        let mut cmd = self.store.tool("psql");
        cmd.args(["-X", "-t", "-A", "-d", self.name.as_str(), "-c", "SELECT 1"]);

        let mut out = Vec::new();
        run_command(&mut cmd, self.store.timeout, None, Some(&mut out))
            .map_err(|e| e.into_error(Error::Verification))?;

        let answer = String::from_utf8_lossy(&out);
        if answer.trim() != "1" {
            return Err(Error::Verification(format!(
                "liveness query on {} returned {:?}",
                self.name,
                answer.trim()
            )));
        }
        Ok(())
    }
}

impl Drop for ScratchPostgres {
    fn drop(&mut self) {
        drop_database(&self.store.config, &self.name, self.store.timeout);
    }
}

/// Best-effort `dropdb --if-exists`; returns whether it succeeded
fn drop_database(config: &PostgresConfig, name: &str, timeout: Duration) -> bool {
    let mut cmd = client_command(config, "dropdb");
    cmd.arg("--if-exists").arg(name);
    match run_command(&mut cmd, timeout, None, None) {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to drop database {}: {}", name, e);
            false
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
