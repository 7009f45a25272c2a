//! gcPanel backup and recovery
//!
//! Operational backup subsystem for the gcPanel construction management
//! application:
//! - Compressed SQL backups of the live datastore (PostgreSQL or SQLite)
//! - JSON sidecar metadata next to every artifact
//! - Verification by restoring into a disposable datastore
//! - Retention sweep by age
//! - Restore and point-in-time recovery with a pre-restore safety snapshot

pub mod backup;
pub mod clock;
pub mod config;
pub mod datastore;
pub mod error;

mod process;

pub use backup::{
    generate_backup_filename, get_backup_metadata, parse_timestamp, sidecar_path,
    ArtifactMetadata, BackupArtifact, BackupManager, RecoveryRequest, RestoreOutcome,
    ScheduledRun, VerificationReport,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{BackupConfig, DatastoreConfig, PostgresConfig};
pub use datastore::{
    open_datastore, Datastore, DatastoreKind, DisposableStore, PostgresDatastore, SqliteDatastore,
};
pub use error::{Error, Result};
