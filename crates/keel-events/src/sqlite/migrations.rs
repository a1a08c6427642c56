//! Engine schema setup and the schema-version marker.
//!
//! The marker lives in `PRAGMA user_version`. A persisted file whose
//! version differs from [`SCHEMA_VERSION`] is invalidated — every table is
//! dropped and recreated — rather than migrated. Replicas rebuild their
//! materialized state from the backend's event log, so local files are
//! always disposable.

use rusqlite::Connection;
use tracing::warn;

use crate::errors::LogResult;

/// Version of the engine's persisted layout. Bump on any schema change.
pub const SCHEMA_VERSION: i64 = 1;

/// Engine-owned tables: the event log and the sync watermark.
///
/// Application tables (the materialized state) are created separately from
/// the event schema's DDL; see `Materializer::ensure_tables`.
const ENGINE_DDL: &str = "
CREATE TABLE IF NOT EXISTS events (
    global        INTEGER NOT NULL,
    client        INTEGER NOT NULL,
    parent_global INTEGER NOT NULL,
    parent_client INTEGER NOT NULL,
    name          TEXT NOT NULL,
    args          TEXT NOT NULL,
    client_id     TEXT NOT NULL,
    session_id    TEXT NOT NULL,
    PRIMARY KEY (global, client)
);

CREATE TABLE IF NOT EXISTS sync_head (
    id             INTEGER PRIMARY KEY CHECK (id = 0),
    backend_global INTEGER NOT NULL
);

INSERT OR IGNORE INTO sync_head (id, backend_global) VALUES (0, 0);
";

/// Create the engine tables, invalidating any stale layout first.
pub fn run_migrations(conn: &Connection) -> LogResult<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version != 0 && version != SCHEMA_VERSION {
        warn!(
            found = version,
            expected = SCHEMA_VERSION,
            "schema version mismatch, wiping persisted state"
        );
        wipe_all_tables(conn)?;
    }

    conn.execute_batch(ENGINE_DDL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Drop every table in the database (engine and application alike).
fn wipe_all_tables(conn: &Connection) -> LogResult<()> {
    let names: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    for name in names {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{name}\""))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::connection::{ConnectionConfig, new_in_memory};

    #[test]
    fn migrations_create_engine_tables() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let head: i64 = conn
            .query_row("SELECT backend_global FROM sync_head", [], |row| row.get(0))
            .unwrap();
        assert_eq!(head, 0);
    }

    #[test]
    fn migrations_are_idempotent() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
    }

    #[test]
    fn version_mismatch_wipes_state() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
        let _ = conn
            .execute(
                "INSERT INTO events VALUES (1, 0, 0, 0, 'x', '{}', 'c', 's')",
                [],
            )
            .unwrap();

        // Simulate a file written by a different engine version.
        conn.pragma_update(None, "user_version", 999).unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0, "stale log must be invalidated, not kept");
    }
}
