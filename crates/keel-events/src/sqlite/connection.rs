//! Connection pool construction and per-connection pragmas.
//!
//! The leader is the only writer, but reads (queries, replay, sync batch
//! assembly) come from pooled connections, so every connection gets WAL
//! mode and a busy timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

use crate::errors::{LogError, LogResult};

/// Pool type alias used across the engine.
pub type ConnectionPool = r2d2::Pool<SqliteConnectionManager>;

/// A connection checked out of the pool.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Connection settings applied to every pooled connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Maximum pool size.
    pub max_connections: u32,
    /// SQLite busy timeout.
    pub busy_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

fn apply_pragmas(
    conn: &rusqlite::Connection,
    busy_timeout: Duration,
) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )
}

fn build_pool(manager: SqliteConnectionManager, config: &ConnectionConfig) -> LogResult<ConnectionPool> {
    let busy_timeout = config.busy_timeout;
    let manager = manager.with_init(move |conn| apply_pragmas(conn, busy_timeout));
    r2d2::Pool::builder()
        .max_size(config.max_connections)
        .build(manager)
        .map_err(LogError::Pool)
}

/// Open a pool backed by a file at `path`.
pub fn new_on_disk(path: &std::path::Path, config: &ConnectionConfig) -> LogResult<ConnectionPool> {
    build_pool(SqliteConnectionManager::file(path), config)
}

/// Open a pool backed by a private shared-cache in-memory database.
///
/// Plain `:memory:` would give each pooled connection its own database;
/// a named shared-cache URI keeps them on one store while staying
/// isolated between pools.
pub fn new_in_memory(config: &ConnectionConfig) -> LogResult<ConnectionPool> {
    static NEXT_DB: AtomicU64 = AtomicU64::new(0);
    let uri = format!(
        "file:keel-mem-{}?mode=memory&cache=shared",
        NEXT_DB.fetch_add(1, Ordering::Relaxed)
    );
    let manager = SqliteConnectionManager::file(uri).with_flags(
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    );
    build_pool(manager, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_pool_shares_one_database() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
            let _ = conn.execute("INSERT INTO t VALUES (42)", []).unwrap();
        }
        // A second checkout must see the same database.
        let conn = pool.get().unwrap();
        let x: i64 = conn.query_row("SELECT x FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(x, 42);
    }

    #[test]
    fn separate_pools_are_isolated() {
        let a = new_in_memory(&ConnectionConfig::default()).unwrap();
        let b = new_in_memory(&ConnectionConfig::default()).unwrap();
        a.get()
            .unwrap()
            .execute_batch("CREATE TABLE only_in_a (x INTEGER)")
            .unwrap();
        let err = b
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM only_in_a", [], |row| row.get::<_, i64>(0));
        assert!(err.is_err());
    }

    #[test]
    fn on_disk_pool_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let pool = new_on_disk(&path, &ConnectionConfig::default()).unwrap();
            let conn = pool.get().unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
                .unwrap();
        }
        let pool = new_on_disk(&path, &ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        let x: i64 = conn.query_row("SELECT x FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(x, 1);
    }
}
