use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info, warn};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("failed to open database {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("connection test failed: {0}")]
    Probe(#[source] sqlx::Error),
    #[error("failed to apply schema: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("database handle has been closed")]
    Closed,
}

/// Source of live database connections.
///
/// Stores never open connections themselves: each one holds a [`Handle`]
/// that asks its provider for a fresh connection whenever the cached one is
/// missing or fails its health check.
#[async_trait]
pub trait ConnectionProvider: Send + Sync + 'static {
    /// Opens a new, ready-to-use connection.
    async fn acquire(&self) -> Result<SqliteConnection, ProviderError>;

    /// Cheap liveness probe run before a cached connection is reused.
    async fn healthcheck(&self, conn: &mut SqliteConnection) -> bool {
        conn.ping().await.is_ok()
    }
}

/// Opens connections to a single SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteProvider {
    path: PathBuf,
    options: SqliteConnectOptions,
}

impl SqliteProvider {
    pub fn new(path: impl AsRef<Path>, busy_timeout: Duration) -> Self {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(busy_timeout);

        Self { path, options }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a connection, runs a trivial query and closes it again.
    pub async fn test_connection(&self) -> Result<(), ProviderError> {
        let mut conn = self.acquire().await?;
        sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .map_err(ProviderError::Probe)?;
        conn.close().await.map_err(ProviderError::Probe)?;
        Ok(())
    }
}

#[async_trait]
impl ConnectionProvider for SqliteProvider {
    async fn acquire(&self) -> Result<SqliteConnection, ProviderError> {
        SqliteConnection::connect_with(&self.options)
            .await
            .map_err(|source| ProviderError::Connect {
                path: self.path.clone(),
                source,
            })
    }
}

/// Creates the ingest tables if they do not exist yet.
pub async fn apply_schema(provider: &dyn ConnectionProvider) -> Result<(), ProviderError> {
    let mut conn = provider.acquire().await?;
    MIGRATOR.run(&mut conn).await?;
    conn.close().await.map_err(ProviderError::Probe)?;
    info!("database schema is up to date");
    Ok(())
}

/// A single lazily-opened connection owned by one store.
pub struct Handle {
    provider: Arc<dyn ConnectionProvider>,
    conn: Mutex<Option<SqliteConnection>>,
    closed: AtomicBool,
    owner: &'static str,
}

impl Handle {
    pub fn new(provider: Arc<dyn ConnectionProvider>, owner: &'static str) -> Self {
        Self {
            provider,
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
            owner,
        }
    }

    /// Returns the cached connection, reconnecting first if it is missing or stale.
    pub async fn get(&self) -> Result<MappedMutexGuard<'_, SqliteConnection>, ProviderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProviderError::Closed);
        }

        let mut slot = self.conn.lock().await;

        let healthy = match slot.as_mut() {
            Some(conn) => self.provider.healthcheck(conn).await,
            None => true,
        };
        if !healthy {
            warn!(store = self.owner, "database connection failed its probe, reconnecting");
            if let Some(stale) = slot.take() {
                if let Err(e) = stale.close().await {
                    debug!(store = self.owner, error = %e, "error while dropping stale connection");
                }
            }
        }

        if slot.is_none() {
            *slot = Some(self.provider.acquire().await?);
            debug!(store = self.owner, "database connection opened");
        }

        MutexGuard::try_map(slot, Option::as_mut).map_err(|_| ProviderError::Closed)
    }

    /// Releases the connection. Later calls to [`Handle::get`] fail.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(conn) = self.conn.lock().await.take() {
            if let Err(e) = conn.close().await {
                warn!(store = self.owner, error = %e, "error while closing database connection");
            }
        }
    }
}
