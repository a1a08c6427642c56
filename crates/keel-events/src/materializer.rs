//! Deterministic event materialization.
//!
//! An application declares its state as a closed sum type implementing
//! [`EventSchema`]: one variant per event name, decoded at the boundary
//! (unknown names and malformed payloads are construction-time errors,
//! never runtime surprises) and applied to row-store tables inside a
//! single transaction.
//!
//! The [`Materializer`] enforces the engine's core law: folding the same
//! event sequence over empty state always reproduces identical row-store
//! contents. Boot, crash recovery, and rebase all lean on it.

use std::marker::PhantomData;

use keel_core::Event;
use metrics::counter;
use rusqlite::Transaction;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::errors::{MaterializeError, MaterializeResult};
use crate::sqlite::connection::ConnectionPool;

/// A closed application event schema.
///
/// Implemented by an enum with one variant per event name. `decode` is the
/// only place names and payloads are interpreted; `apply` must be a pure
/// function of the decoded event and current row-store state (no clocks,
/// no randomness, no out-of-band reads) or replicas will diverge.
pub trait EventSchema: Sized + Send + 'static {
    /// Every table the schema materializes into, for reset and bootstrap.
    const TABLES: &'static [&'static str];

    /// DDL creating the schema's tables (`CREATE TABLE IF NOT EXISTS ...`).
    fn tables_ddl() -> &'static str;

    /// Decode an event name + payload into a variant.
    fn decode(name: &str, args: &Value) -> MaterializeResult<Self>;

    /// Apply the variant's row mutations within the given transaction.
    fn apply(&self, tx: &Transaction<'_>) -> MaterializeResult<()>;

    /// Tables this variant writes to; drives reactive query invalidation.
    fn tables(&self) -> &'static [&'static str];
}

/// Applies events to the row store, one transaction per event.
pub struct Materializer<S: EventSchema> {
    pool: ConnectionPool,
    _schema: PhantomData<S>,
}

impl<S: EventSchema> Materializer<S> {
    /// Wrap a pool. Call [`ensure_tables`](Self::ensure_tables) before use.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            _schema: PhantomData,
        }
    }

    /// Create the schema's tables if missing.
    pub fn ensure_tables(&self) -> MaterializeResult<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(S::tables_ddl())?;
        Ok(())
    }

    /// Decode an event without applying it.
    ///
    /// Used by the leader to validate a commit intent before assigning it
    /// an id; a payload that cannot decode must never reach the log.
    pub fn decode(event: &Event) -> MaterializeResult<S> {
        S::decode(&event.name, &event.args)
    }

    /// Materialize one event. Returns the tables it wrote to.
    ///
    /// Decode and apply run atomically; a failure leaves the row store
    /// untouched and is fatal for the store instance (the caller halts
    /// processing rather than risking divergence).
    #[instrument(skip(self, event), fields(id = %event.id, name = %event.name))]
    pub fn apply_event(&self, event: &Event) -> MaterializeResult<&'static [&'static str]> {
        let decoded = S::decode(&event.name, &event.args)?;
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        decoded.apply(&tx)?;
        tx.commit()?;
        counter!("keel_events_materialized_total").increment(1);
        Ok(decoded.tables())
    }

    /// Delete every row from the schema's tables, then re-run the DDL so
    /// seed rows (`INSERT OR IGNORE ...` in the DDL) are restored.
    pub fn reset(&self) -> MaterializeResult<()> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        for table in S::TABLES {
            let _ = tx.execute(&format!("DELETE FROM \"{table}\""), [])?;
        }
        tx.execute_batch(S::tables_ddl())?;
        tx.commit()?;
        Ok(())
    }

    /// Fold a sequence of events over empty state.
    ///
    /// Resets the schema tables first, then applies in order. Any decode
    /// or apply failure aborts the replay with state reset again, so the
    /// caller never serves reads against a partially-applied log.
    #[instrument(skip(self, events))]
    pub fn replay<I, E>(&self, events: I) -> Result<u64, ReplayError<E>>
    where
        I: IntoIterator<Item = Result<Event, E>>,
    {
        self.ensure_tables().map_err(ReplayError::Materialize)?;
        self.reset().map_err(ReplayError::Materialize)?;
        let mut applied = 0u64;
        for event in events {
            let event = event.map_err(ReplayError::Source)?;
            if let Err(err) = self.apply_event(&event) {
                // Do not leave a half-applied prefix behind.
                let _ = self.reset();
                return Err(ReplayError::Materialize(err));
            }
            applied += 1;
        }
        debug!(applied, "replay complete");
        Ok(applied)
    }
}

/// Replay failure: either the event source or materialization itself.
#[derive(Debug)]
pub enum ReplayError<E> {
    /// The event iterator failed (e.g. a log read error).
    Source(E),
    /// An event failed to decode or apply.
    Materialize(MaterializeError),
}

impl<E: std::fmt::Display> std::fmt::Display for ReplayError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::Source(err) => write!(f, "replay source error: {err}"),
            ReplayError::Materialize(err) => write!(f, "replay materialization error: {err}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for ReplayError<E> {}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use keel_core::EventId;
    use rusqlite::params;
    use serde_json::json;

    use crate::sqlite::connection::{ConnectionConfig, new_in_memory};
    use crate::sqlite::migrations::run_migrations;

    /// Minimal counter/notes schema used across this crate's tests.
    enum TestSchema {
        NoteAdded { id: String, text: String },
        NoteRemoved { id: String },
        CounterBumped { by: i64 },
    }

    impl EventSchema for TestSchema {
        const TABLES: &'static [&'static str] = &["notes", "counters"];

        fn tables_ddl() -> &'static str {
            "CREATE TABLE IF NOT EXISTS notes (
                 id   TEXT PRIMARY KEY,
                 text TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS counters (
                 id    INTEGER PRIMARY KEY CHECK (id = 0),
                 value INTEGER NOT NULL
             );
             INSERT OR IGNORE INTO counters (id, value) VALUES (0, 0);"
        }

        fn decode(name: &str, args: &Value) -> MaterializeResult<Self> {
            let field = |key: &str| {
                args.get(key)
                    .and_then(Value::as_str)
                    .map(String::from)
                    .ok_or_else(|| MaterializeError::invalid_payload(name, format!("missing '{key}'")))
            };
            match name {
                "noteAdded" => Ok(Self::NoteAdded {
                    id: field("id")?,
                    text: field("text")?,
                }),
                "noteRemoved" => Ok(Self::NoteRemoved { id: field("id")? }),
                "counterBumped" => Ok(Self::CounterBumped {
                    by: args.get("by").and_then(Value::as_i64).ok_or_else(|| {
                        MaterializeError::invalid_payload(name, "missing 'by'")
                    })?,
                }),
                other => Err(MaterializeError::UnknownEvent {
                    name: other.to_string(),
                }),
            }
        }

        fn apply(&self, tx: &Transaction<'_>) -> MaterializeResult<()> {
            match self {
                Self::NoteAdded { id, text } => {
                    let _ = tx.execute(
                        "INSERT OR REPLACE INTO notes (id, text) VALUES (?1, ?2)",
                        params![id, text],
                    )?;
                }
                Self::NoteRemoved { id } => {
                    let _ = tx.execute("DELETE FROM notes WHERE id = ?1", params![id])?;
                }
                Self::CounterBumped { by } => {
                    let _ = tx.execute(
                        "UPDATE counters SET value = value + ?1 WHERE id = 0",
                        params![by],
                    )?;
                }
            }
            Ok(())
        }

        fn tables(&self) -> &'static [&'static str] {
            match self {
                Self::NoteAdded { .. } | Self::NoteRemoved { .. } => &["notes"],
                Self::CounterBumped { .. } => &["counters"],
            }
        }
    }

    fn setup() -> Materializer<TestSchema> {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            run_migrations(&conn).unwrap();
        }
        let mat = Materializer::new(pool);
        mat.ensure_tables().unwrap();
        mat
    }

    fn event(global: u64, name: &str, args: Value) -> Event {
        Event {
            id: EventId::new(global, 0),
            parent_id: EventId::ROOT,
            name: name.into(),
            args,
            client_id: "client-a".into(),
            session_id: "session-1".into(),
        }
    }

    fn note_count(mat: &Materializer<TestSchema>) -> i64 {
        mat.pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))
            .unwrap()
    }

    fn counter_value(mat: &Materializer<TestSchema>) -> i64 {
        mat.pool
            .get()
            .unwrap()
            .query_row("SELECT value FROM counters WHERE id = 0", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn apply_event_writes_rows_and_reports_tables() {
        let mat = setup();
        let tables = mat
            .apply_event(&event(1, "noteAdded", json!({"id": "n1", "text": "hi"})))
            .unwrap();
        assert_eq!(tables, &["notes"]);
        assert_eq!(note_count(&mat), 1);

        let tables = mat
            .apply_event(&event(2, "counterBumped", json!({"by": 3})))
            .unwrap();
        assert_eq!(tables, &["counters"]);
        assert_eq!(counter_value(&mat), 3);
    }

    #[test]
    fn unknown_event_is_fatal_and_leaves_state_untouched() {
        let mat = setup();
        mat.apply_event(&event(1, "noteAdded", json!({"id": "n1", "text": "hi"})))
            .unwrap();

        let err = mat
            .apply_event(&event(2, "somethingElse", json!({})))
            .unwrap_err();
        assert_matches!(err, MaterializeError::UnknownEvent { name } if name == "somethingElse");
        assert_eq!(note_count(&mat), 1);
    }

    #[test]
    fn invalid_payload_is_fatal() {
        let mat = setup();
        let err = mat
            .apply_event(&event(1, "noteAdded", json!({"id": "n1"})))
            .unwrap_err();
        assert_matches!(err, MaterializeError::InvalidPayload { .. });
    }

    #[test]
    fn replay_reproduces_state() {
        let mat = setup();
        let history = vec![
            event(1, "noteAdded", json!({"id": "n1", "text": "one"})),
            event(2, "noteAdded", json!({"id": "n2", "text": "two"})),
            event(3, "counterBumped", json!({"by": 5})),
            event(4, "noteRemoved", json!({"id": "n1"})),
        ];
        for e in &history {
            mat.apply_event(e).unwrap();
        }
        let notes_before = note_count(&mat);
        let counter_before = counter_value(&mat);

        // Replaying the same history from empty state must agree exactly.
        let applied = mat
            .replay(history.into_iter().map(Ok::<_, std::convert::Infallible>))
            .unwrap();
        assert_eq!(applied, 4);
        assert_eq!(note_count(&mat), notes_before);
        assert_eq!(counter_value(&mat), counter_before);
    }

    #[test]
    fn replay_failure_resets_state() {
        let mat = setup();
        let history = vec![
            event(1, "noteAdded", json!({"id": "n1", "text": "one"})),
            event(2, "unknownThing", json!({})),
        ];
        let err = mat
            .replay(history.into_iter().map(Ok::<_, std::convert::Infallible>))
            .unwrap_err();
        assert_matches!(err, ReplayError::Materialize(MaterializeError::UnknownEvent { .. }));
        // No partially-applied prefix may survive.
        assert_eq!(note_count(&mat), 0);
    }
}
