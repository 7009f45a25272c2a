//! Live datastores that can be exported, probed and restored
//!
//! The backup logic never talks to a database tool directly; it goes through
//! the [`Datastore`] trait so the subprocess-based PostgreSQL implementation
//! and the in-process SQLite implementation are interchangeable.
//!
//! All exports are plain SQL text. Compression is applied by the caller.

use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::DatastoreConfig;
use crate::error::Result;

mod postgres;
mod sqlite;

pub use postgres::PostgresDatastore;
pub use sqlite::SqliteDatastore;

/// Kind of datastore an artifact was taken from
///
/// Serialized with the names older sidecars already use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatastoreKind {
    #[serde(rename = "postgresql")]
    Postgres,
    #[serde(rename = "sqlite")]
    FileBased,
}

impl fmt::Display for DatastoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatastoreKind::Postgres => write!(f, "postgresql"),
            DatastoreKind::FileBased => write!(f, "sqlite"),
        }
    }
}

/// A live datastore
pub trait Datastore: Send + Sync {
    fn kind(&self) -> DatastoreKind;

    /// Short description for log lines; never includes credentials
    fn describe(&self) -> String;

    /// Whether there is live state to snapshot at all
    fn is_present(&self) -> Result<bool> {
        Ok(true)
    }

    /// Write a SQL export of the live datastore into `sink`
    fn export(&self, sink: &mut (dyn Write + Send)) -> Result<()>;

    /// Create a disposable instance, fully separate from the live one
    fn disposable(&self) -> Result<Box<dyn DisposableStore>>;

    /// Replace the live datastore's contents with the SQL read from `source`
    ///
    /// Implementations load into a staging target first and only swap it in
    /// once the load has succeeded.
    fn restore(&self, source: &mut (dyn Read + Send)) -> Result<()>;
}

/// A throwaway datastore used for verification
///
/// Dropping the value tears the instance down.
pub trait DisposableStore {
    fn name(&self) -> String;

    /// Load a SQL export
    fn load(&mut self, source: &mut (dyn Read + Send)) -> Result<()>;

    /// Run a minimal liveness query
    fn probe(&self) -> Result<()>;
}

/// Build the datastore described by `config`
pub fn open_datastore(config: &DatastoreConfig, command_timeout: Duration) -> Box<dyn Datastore> {
    match config {
        DatastoreConfig::Postgres(pg) => {
            Box::new(PostgresDatastore::new(pg.clone(), command_timeout))
        }
        DatastoreConfig::Sqlite { path } => Box::new(SqliteDatastore::new(path.clone())),
    }
}
