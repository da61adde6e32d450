//! SQLite storage layer -- schema, catalog, execution log, snapshots.

pub mod catalog;
pub mod executions;
pub mod schema;
pub mod snapshots;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;

pub use self::catalog::Catalog;
pub use self::executions::ExecutionLog;
pub use self::snapshots::SnapshotStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database pool unavailable: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encoding stored value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("query {0} already has a pending execution")]
    Busy(catalog::QueryId),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error("storage task failed: {0}")]
    Blocking(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> StorageResult<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Corrupt(format!("create {}: {}", parent.display(), e)))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Run a blocking storage call off the async executor.
pub async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Blocking(e.to_string()))?
}

/// Save the latest heartbeat of a background service.
pub fn record_heartbeat(pool: &Pool, service: &str, at: &DateTime<Utc>) -> StorageResult<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO service_heartbeats (service_name, last_heartbeat) VALUES (?1, ?2)
         ON CONFLICT(service_name) DO UPDATE SET last_heartbeat = excluded.last_heartbeat",
        rusqlite::params![service, format_ts(at)],
    )?;
    Ok(())
}

pub fn last_heartbeat(pool: &Pool, service: &str) -> StorageResult<Option<DateTime<Utc>>> {
    use rusqlite::OptionalExtension;

    let conn = pool.get()?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT last_heartbeat FROM service_heartbeats WHERE service_name = ?1",
            [service],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_ts).transpose()
}

/// Fixed-width UTC timestamp; lexical order equals time order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp '{}': {}", s, e)))
}

pub(crate) fn parse_id(s: &str) -> StorageResult<uuid::Uuid> {
    uuid::Uuid::parse_str(s).map_err(|e| StorageError::Corrupt(format!("execution id '{}': {}", s, e)))
}

#[cfg(test)]
pub(crate) fn temp_pool() -> (tempfile::TempDir, Pool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(&dir.path().join("test.db")).unwrap();
    (dir, pool)
}
