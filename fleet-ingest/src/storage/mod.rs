pub mod device;
pub mod drive;
pub mod os_version;
pub mod provider;
pub mod statistics;
pub mod status;

use std::fmt;

use async_trait::async_trait;
use fleet_core::{DeviceId, IngestEvent};

pub use device::{DeviceRecord, DeviceResolver, ResolvedDevice};
pub use drive::{DriveRecord, StorageStore};
pub use os_version::{OsVersionRecord, OsVersionStore};
pub use provider::{ConnectionProvider, Handle, ProviderError, SqliteProvider, apply_schema};
pub use statistics::{StatisticsRecord, StatisticsStore};
pub use status::{StatusRecord, StatusStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Unavailable(#[from] ProviderError),
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("{table}: row for serial {serial} vanished after insert failed")]
    MissingId { table: &'static str, serial: String },
    #[error("{table}: unreadable row: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

/// Coarse classification the pipeline uses to decide how loudly to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Could not reach or keep the database; the handle reconnects on next use.
    Connection,
    /// A uniqueness, check or foreign key constraint rejected the write.
    Constraint,
    /// Any other statement failure.
    Query,
    /// Stored data could not be interpreted.
    Corrupt,
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::Unavailable(_) => FailureKind::Connection,
            StoreError::Sqlx(err) => match err {
                sqlx::Error::Database(db)
                    if db.is_unique_violation()
                        || db.is_check_violation()
                        || db.is_foreign_key_violation() =>
                {
                    FailureKind::Constraint
                }
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => FailureKind::Connection,
                sqlx::Error::ColumnDecode { .. }
                | sqlx::Error::Decode(_)
                | sqlx::Error::ColumnNotFound(_) => FailureKind::Corrupt,
                _ => FailureKind::Query,
            },
            StoreError::MissingId { .. } => FailureKind::Query,
            StoreError::Corrupt { .. } => FailureKind::Corrupt,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Connection => "connection",
            FailureKind::Constraint => "constraint",
            FailureKind::Query => "query",
            FailureKind::Corrupt => "corrupt",
        };
        f.write_str(name)
    }
}

/// Which table a write went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Devices,
    Status,
    OsVersion,
    Storage,
    Statistics,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreKind::Devices => "devices",
            StoreKind::Status => "status",
            StoreKind::OsVersion => "os_version",
            StoreKind::Storage => "storage",
            StoreKind::Statistics => "statistics",
        };
        f.write_str(name)
    }
}

/// Outcome of one successful [`SignalStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The event carried nothing for this store.
    Skipped,
    Inserted { id: i64 },
    Updated { id: i64 },
    /// Storage packets fan out to one row per drive.
    Drives { processed: usize },
}

/// A per-signal table writer keyed by device identity.
#[async_trait]
pub trait SignalStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Writes whatever part of `event` this store is responsible for.
    async fn apply(&self, event: &IngestEvent, device: DeviceId) -> Result<Applied, StoreError>;

    /// Releases the store's database handle.
    async fn close(&self);
}
