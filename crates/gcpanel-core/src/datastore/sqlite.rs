//! File-based SQLite datastore
//!
//! Exports are a textual SQL dump equivalent to `sqlite3 .dump`: schema
//! statements followed by one `INSERT` per row, wrapped in a transaction.
//! Restores build a staging database next to the live file and rename it
//! into place, so the live file is never half-written.

use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::{Datastore, DatastoreKind, DisposableStore};
use crate::error::{Error, Result};

/// SQLite database file used as the live datastore
#[derive(Debug, Clone)]
pub struct SqliteDatastore {
    path: PathBuf,
}

impl SqliteDatastore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gcpanel.db".to_string());
        self.path.with_file_name(format!(".{}.restore-staging", name))
    }
}

impl Datastore for SqliteDatastore {
    fn kind(&self) -> DatastoreKind {
        DatastoreKind::FileBased
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    fn is_present(&self) -> Result<bool> {
        Ok(self.path.is_file())
    }

    fn export(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        if !self.path.is_file() {
            return Err(Error::Backup(format!(
                "SQLite database not found: {}",
                self.path.display()
            )));
        }

        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            Error::Backup(format!(
                "Failed to open SQLite database {}: {}",
                self.path.display(),
                e
            ))
        })?;

        // One read transaction so every table comes from the same snapshot.
        let tx = conn.unchecked_transaction()?;
        dump_database(&tx, sink)?;
        tx.commit()?;
        Ok(())
    }

    fn disposable(&self) -> Result<Box<dyn DisposableStore>> {
        let dir = tempfile::Builder::new()
            .prefix("gcpanel-verify-")
            .tempdir()?;
        let path = dir.path().join("verify.db");
        Ok(Box::new(ScratchSqlite { _dir: dir, path }))
    }

    fn restore(&self, source: &mut (dyn Read + Send)) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let staging = StagingFile::new(self.staging_path())?;

        {
            let conn = Connection::open(staging.path())?;
            load_sql(&conn, source)?;
            probe(&conn)?;
        }

        // A WAL or shared-memory file left by the old database must not be
        // replayed on top of the new one.
        for suffix in ["-wal", "-shm", "-journal"] {
            let sidecar = append_to_file_name(&self.path, suffix);
            if sidecar.exists() {
                fs::remove_file(&sidecar)?;
                debug!("Removed stale {}", sidecar.display());
            }
        }

        staging.commit(&self.path)?;
        info!("SQLite database replaced: {}", self.path.display());
        Ok(())
    }
}

/// Disposable SQLite database in its own temp directory
struct ScratchSqlite {
    _dir: TempDir,
    path: PathBuf,
}

impl DisposableStore for ScratchSqlite {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&mut self, source: &mut (dyn Read + Send)) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        load_sql(&conn, source)
    }

    fn probe(&self) -> Result<()> {
        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        probe(&conn)
    }
}

/// Staging file removed on drop unless committed
struct StagingFile {
    path: PathBuf,
    committed: bool,
}

impl StagingFile {
    fn new(path: PathBuf) -> Result<Self> {
        if path.exists() {
            warn!("Removing leftover staging file {}", path.display());
            fs::remove_file(&path)?;
        }
        Ok(Self {
            path,
            committed: false,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn commit(mut self, target: &Path) -> Result<()> {
        fs::rename(&self.path, target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for path in [
            self.path.clone(),
            append_to_file_name(&self.path, "-journal"),
        ] {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove staging file {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn append_to_file_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn load_sql(conn: &Connection, source: &mut (dyn Read + Send)) -> Result<()> {
    let mut sql = String::new();
    source.read_to_string(&mut sql)?;
    conn.execute_batch(&sql)?;
    Ok(())
}

fn probe(conn: &Connection) -> Result<()> {
    let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
    if one != 1 {
        return Err(Error::Verification(format!(
            "liveness query returned {}",
            one
        )));
    }
    Ok(())
}

/// Write a SQL dump of every user table, index, view and trigger
pub(crate) fn dump_database(conn: &Connection, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "PRAGMA foreign_keys=OFF;")?;
    writeln!(out, "BEGIN TRANSACTION;")?;

    let mut stmt = conn.prepare(
        r#"
        SELECT type, name, sql FROM sqlite_master
        WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite\_%' ESCAPE '\'
        ORDER BY CASE type
            WHEN 'table' THEN 0
            WHEN 'view' THEN 1
            WHEN 'index' THEN 2
            ELSE 3
        END, rowid
        "#,
    )?;
    let objects = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let shadow = shadow_tables(conn)?;

    // Shadow tables are recreated by their virtual table, whose rows are
    // dumped through the virtual table itself.
    for (kind, name, sql) in objects.iter().filter(|(_, name, _)| !shadow.contains(name)) {
        writeln!(out, "{};", sql)?;
        if kind == "table" {
            dump_rows(conn, name, out)?;
        }
    }

    let has_sequence: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = 'sqlite_sequence')",
        [],
        |row| row.get(0),
    )?;
    if has_sequence {
        writeln!(out, "DELETE FROM sqlite_sequence;")?;
        dump_rows(conn, "sqlite_sequence", out)?;
    }

    writeln!(out, "COMMIT;")?;
    Ok(())
}

fn shadow_tables(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM pragma_table_list WHERE schema = 'main' AND type = 'shadow'",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(names)
}

fn dump_rows(conn: &Connection, table: &str, out: &mut dyn Write) -> Result<()> {
    let ident = quote_ident(table);
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", ident))?;
    let columns = stmt.column_count();
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns);
        for i in 0..columns {
            values.push(sql_literal(row.get_ref(i)?));
        }
        writeln!(out, "INSERT INTO {} VALUES({});", ident, values.join(","))?;
    }
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) if f.is_infinite() => {
            if f > 0.0 {
                "1e999".to_string()
            } else {
                "-1e999".to_string()
            }
        }
        // Debug keeps a decimal point or exponent so the value stays REAL.
        ValueRef::Real(f) => format!("{:?}", f),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => format!("'{}'", text.replace('\'', "''")),
            Err(_) => format!("CAST(X'{}' AS TEXT)", hex::encode(bytes)),
        },
        ValueRef::Blob(bytes) => format!("X'{}'", hex::encode(bytes)),
    }
}
