//! SQLite connection handling for the embedding cache.
//!
//! The schema version lives in `PRAGMA user_version`; opening a database
//! applies the migrations it has not seen yet.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;

use super::schema;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Corrupt cached vector for {embedder}/{image_id}: {reason}")]
    CorruptVector {
        embedder: String,
        image_id: String,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Shared SQLite connection of the embedding cache.
///
/// Every call runs on the blocking pool while holding the connection lock.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the cache at `path` and brings its schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
            tracing::debug!(path = %path.display(), "Opened embedding cache");
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))??;

        Self::migrated(conn).await
    }

    /// Opens an in-memory database for testing.
    pub async fn open_in_memory() -> Result<Self> {
        Self::migrated(Connection::open_in_memory()?).await
    }

    async fn migrated(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        let version = db.call(migrate).await?;
        tracing::debug!(version, "Cache schema ready");
        Ok(db)
    }

    /// Schema version recorded in the database.
    pub async fn schema_version(&self) -> Result<usize> {
        self.call(|conn| Ok(user_version(conn)?)).await
    }

    /// Runs `f` with the connection on the blocking pool.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.call(move |conn| f(conn)).await
    }

    /// Runs `f` inside a transaction, committed only when `f` succeeds.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

fn user_version(conn: &Connection) -> rusqlite::Result<usize> {
    conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .map(|v| v as usize)
}

/// Applies the migrations after the recorded `user_version` and returns the new version.
fn migrate(conn: &mut Connection) -> Result<usize> {
    let migrations = schema::all_migrations();
    let current = user_version(conn)?;
    if current > migrations.len() {
        return Err(StorageError::MigrationFailed(format!(
            "cache schema version {current} is newer than this build ({})",
            migrations.len()
        )));
    }

    let tx = conn.transaction()?;
    for (version, migration) in migrations.iter().enumerate().skip(current) {
        tx.execute_batch(migration)
            .map_err(|e| StorageError::MigrationFailed(format!("step {}: {e}", version + 1)))?;
    }
    tx.pragma_update(None, "user_version", migrations.len() as i64)?;
    tx.commit()?;
    Ok(migrations.len())
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
