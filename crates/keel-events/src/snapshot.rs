//! Raw row-store snapshots for bootstrap and persistence.
//!
//! `export` serializes the entire database (event log, sync watermark, and
//! materialized tables) to bytes through the SQLite backup API; `import`
//! restores them into an open pool. A fresh replica can be bootstrapped
//! from a snapshot instead of replaying the full remote log.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::Connection;
use rusqlite::backup::Backup;
use tracing::instrument;

use crate::errors::LogResult;
use crate::sqlite::connection::ConnectionPool;

fn scratch_path() -> std::path::PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    std::env::temp_dir().join(format!(
        "keel-snapshot-{}-{}.db",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Serialize the whole database to bytes.
#[instrument(skip(pool))]
pub fn export(pool: &ConnectionPool) -> LogResult<Vec<u8>> {
    let src = pool.get()?;
    let path = scratch_path();
    {
        let mut dst = Connection::open(&path)?;
        let backup = Backup::new(&src, &mut dst)?;
        backup.run_to_completion(64, std::time::Duration::ZERO, None)?;
    }
    let bytes = fs::read(&path)?;
    let _ = fs::remove_file(&path);
    Ok(bytes)
}

/// Replace the pool's database contents with a previously exported snapshot.
#[instrument(skip(pool, bytes), fields(len = bytes.len()))]
pub fn import(pool: &ConnectionPool, bytes: &[u8]) -> LogResult<()> {
    let path = scratch_path();
    fs::write(&path, bytes)?;
    let result = (|| {
        let src = Connection::open(&path)?;
        let mut dst = pool.get()?;
        let backup = Backup::new(&src, &mut dst)?;
        backup.run_to_completion(64, std::time::Duration::ZERO, None)?;
        Ok(())
    })();
    let _ = fs::remove_file(&path);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::connection::{ConnectionConfig, new_in_memory};
    use crate::sqlite::migrations::run_migrations;

    #[test]
    fn export_import_round_trip() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            run_migrations(&conn).unwrap();
            let _ = conn
                .execute(
                    "INSERT INTO events VALUES (1, 0, 0, 0, 'x', '{}', 'c', 's')",
                    [],
                )
                .unwrap();
        }

        let bytes = export(&pool).unwrap();
        assert!(!bytes.is_empty());

        let restored = new_in_memory(&ConnectionConfig::default()).unwrap();
        import(&restored, &bytes).unwrap();

        let count: i64 = restored
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
