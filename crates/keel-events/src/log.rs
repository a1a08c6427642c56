//! The durable, append-only event log.
//!
//! Events are keyed by `(global, client)` and the table is monotonic in
//! EventId order: [`EventLog::append`] rejects any id that is not strictly
//! greater than the current head. Appends are serialized by the leader;
//! the log itself only enforces the invariant.
//!
//! Replay and sync both read through [`EventLog::range`], a paged cursor
//! that re-issues its SELECT per page so it stays valid across other
//! writes (restartable, lazy, finite).

use keel_core::{Event, EventId};
use metrics::counter;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, instrument};

use crate::errors::{LogError, LogResult};
use crate::sqlite::connection::ConnectionPool;

/// Rows fetched per [`EventLog::range`] page.
const RANGE_PAGE_SIZE: usize = 256;

/// The event log over a pooled SQLite store.
#[derive(Clone)]
pub struct EventLog {
    pool: ConnectionPool,
}

impl EventLog {
    /// Wrap a pool whose engine tables already exist (see `run_migrations`).
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// The underlying pool (shared with the materializer and snapshots).
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The highest appended id, if any.
    pub fn head(&self) -> LogResult<Option<EventId>> {
        let conn = self.pool.get()?;
        Self::head_on(&conn)
    }

    fn head_on(conn: &Connection) -> LogResult<Option<EventId>> {
        let head = conn
            .query_row(
                "SELECT global, client FROM events
                 ORDER BY global DESC, client DESC LIMIT 1",
                [],
                |row| Ok(EventId::new(row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(head)
    }

    /// Append a single event.
    ///
    /// Fails with [`LogError::OutOfOrder`] unless `event.id` strictly
    /// exceeds the current head (or the log is empty).
    #[instrument(skip(self, event), fields(id = %event.id, name = %event.name))]
    pub fn append(&self, event: &Event) -> LogResult<()> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        Self::append_on(&tx, event)?;
        tx.commit()?;
        counter!("keel_log_appends_total").increment(1);
        Ok(())
    }

    /// Append a batch inside one transaction; same ordering check per element.
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub fn append_batch(&self, events: &[Event]) -> LogResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        for event in events {
            Self::append_on(&tx, event)?;
        }
        tx.commit()?;
        counter!("keel_log_appends_total").increment(events.len() as u64);
        Ok(())
    }

    fn append_on(conn: &Connection, event: &Event) -> LogResult<()> {
        if let Some(head) = Self::head_on(conn)? {
            if event.id <= head {
                return Err(LogError::OutOfOrder {
                    head,
                    attempted: event.id,
                });
            }
        }
        let _ = conn.execute(
            "INSERT INTO events
                 (global, client, parent_global, parent_client,
                  name, args, client_id, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id.global,
                event.id.client,
                event.parent_id.global,
                event.parent_id.client,
                event.name,
                event.args.to_string(),
                event.client_id,
                event.session_id,
            ],
        )?;
        Ok(())
    }

    /// Lazy paged cursor over `[from, to]` in id order.
    pub fn range(&self, from: EventId, to: EventId) -> EventRange {
        EventRange {
            log: self.clone(),
            next_after: None,
            from,
            to,
            buffered: Vec::new(),
            done: false,
        }
    }

    /// Cursor over the whole log.
    pub fn range_all(&self) -> EventRange {
        // Ids are stored as SQLite INTEGERs, so the bindable ceiling is i64.
        self.range(
            EventId::ROOT,
            EventId::new(i64::MAX as u64, i64::MAX as u64),
        )
    }

    /// All speculative (`client > 0`) events in id order.
    pub fn local_only(&self) -> LogResult<Vec<Event>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT global, client, parent_global, parent_client,
                    name, args, client_id, session_id
             FROM events WHERE client > 0 ORDER BY global, client",
        )?;
        let rows = stmt
            .query_map([], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove all speculative events, returning them in id order.
    ///
    /// Rebase-only entry point: the caller immediately re-appends the
    /// payloads under fresh confirmed ids.
    #[instrument(skip(self))]
    pub fn remove_local_only(&self) -> LogResult<Vec<Event>> {
        let removed = self.local_only()?;
        if !removed.is_empty() {
            let conn = self.pool.get()?;
            let _ = conn.execute("DELETE FROM events WHERE client > 0", [])?;
            debug!(count = removed.len(), "removed local-only events for rebase");
        }
        Ok(removed)
    }

    /// Confirmed events with `global` beyond the given watermark.
    pub fn confirmed_after(&self, global: u64) -> LogResult<Vec<Event>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT global, client, parent_global, parent_client,
                    name, args, client_id, session_id
             FROM events WHERE client = 0 AND global > ?1 ORDER BY global",
        )?;
        let rows = stmt
            .query_map(params![global], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove confirmed events past the watermark, returning them in order.
    ///
    /// Used when a push conflicts: locally-confirmed events the backend
    /// never accepted go back into the pending pile and are re-issued on
    /// top of whatever the next pull brings.
    #[instrument(skip(self))]
    pub fn remove_confirmed_after(&self, global: u64) -> LogResult<Vec<Event>> {
        let removed = self.confirmed_after(global)?;
        if !removed.is_empty() {
            let conn = self.pool.get()?;
            let _ = conn.execute(
                "DELETE FROM events WHERE client = 0 AND global > ?1",
                params![global],
            )?;
            debug!(count = removed.len(), "removed unpushed confirmed events");
        }
        Ok(removed)
    }

    /// Highest `global` the sync backend has confirmed.
    pub fn backend_head(&self) -> LogResult<u64> {
        let conn = self.pool.get()?;
        let head = conn.query_row("SELECT backend_global FROM sync_head WHERE id = 0", [], |row| {
            row.get(0)
        })?;
        Ok(head)
    }

    /// Persist the backend watermark after a successful push or pull.
    pub fn set_backend_head(&self, global: u64) -> LogResult<()> {
        let conn = self.pool.get()?;
        let _ = conn.execute(
            "UPDATE sync_head SET backend_global = ?1 WHERE id = 0",
            params![global],
        )?;
        Ok(())
    }

    /// Total number of stored events.
    pub fn len(&self) -> LogResult<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Whether the log holds no events.
    pub fn is_empty(&self) -> LogResult<bool> {
        Ok(self.len()? == 0)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let raw: String = row.get(5)?;
    // A stored payload that no longer parses is log corruption; serving it
    // as some placeholder would push a rewritten event through replay and
    // sync. Surface it.
    let args = serde_json::from_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Event {
        id: EventId::new(row.get(0)?, row.get(1)?),
        parent_id: EventId::new(row.get(2)?, row.get(3)?),
        name: row.get(4)?,
        args,
        client_id: row.get(6)?,
        session_id: row.get(7)?,
    })
}

/// Paged cursor returned by [`EventLog::range`].
///
/// Each page is one SELECT keyed past the last delivered id, so the cursor
/// survives interleaved appends and can be dropped and restarted cheaply.
pub struct EventRange {
    log: EventLog,
    next_after: Option<EventId>,
    from: EventId,
    to: EventId,
    buffered: Vec<Event>,
    done: bool,
}

impl EventRange {
    fn fetch_page(&mut self) -> LogResult<()> {
        let conn = self.log.pool.get()?;
        // Exclusive lower bound after the first page, inclusive on the first.
        let (lo, inclusive) = match self.next_after {
            Some(id) => (id, false),
            None => (self.from, true),
        };
        let cmp = if inclusive { ">=" } else { ">" };
        let sql = format!(
            "SELECT global, client, parent_global, parent_client,
                    name, args, client_id, session_id
             FROM events
             WHERE (global > ?1 OR (global = ?1 AND client {cmp} ?2))
               AND (global < ?3 OR (global = ?3 AND client <= ?4))
             ORDER BY global, client LIMIT ?5"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    lo.global,
                    lo.client,
                    self.to.global,
                    self.to.client,
                    RANGE_PAGE_SIZE as i64
                ],
                row_to_event,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        if rows.len() < RANGE_PAGE_SIZE {
            self.done = true;
        }
        if let Some(last) = rows.last() {
            self.next_after = Some(last.id);
        }
        // Reverse so pop() yields in ascending order.
        self.buffered = rows;
        self.buffered.reverse();
        Ok(())
    }
}

impl Iterator for EventRange {
    type Item = LogResult<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() {
            if self.done {
                return None;
            }
            if let Err(err) = self.fetch_page() {
                self.done = true;
                return Some(Err(err));
            }
        }
        self.buffered.pop().map(Ok)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// trim — confirmed-suffix extraction
// ─────────────────────────────────────────────────────────────────────────────

/// Reduce a broadcast/persist batch to the minimal suffix representing the
/// current confirmed state.
///
/// A batch may carry one or more runs of speculative (local-only) events
/// followed by their now-confirmed replacements. The confirmed suffix is
/// the longest strictly-ascending tail, minus any leading elements that an
/// earlier id in the batch already supersedes (an id inversion marks where
/// replacements restarted). A batch that is already ascending comes back
/// unchanged, so trim is idempotent.
#[must_use]
pub fn trim(batch: &[Event]) -> &[Event] {
    if batch.len() < 2 {
        return batch;
    }

    // Start of the longest strictly-ascending tail.
    let mut tail = batch.len() - 1;
    while tail > 0 && batch[tail - 1].id < batch[tail].id {
        tail -= 1;
    }
    if tail == 0 {
        return batch;
    }

    // Highest id before the tail; anything in the tail below it was
    // superseded by the replacements that id belongs to.
    let max_before = batch[..tail]
        .iter()
        .map(|e| e.id)
        .max()
        .unwrap_or(EventId::ROOT);
    let mut start = tail;
    while start < batch.len() && batch[start].id < max_before {
        start += 1;
    }
    if start == batch.len() {
        // Nothing in the tail reaches the earlier head; keep the tail.
        start = tail;
    }
    &batch[start..]
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    use crate::sqlite::connection::{ConnectionConfig, new_in_memory};
    use crate::sqlite::migrations::run_migrations;

    fn setup() -> EventLog {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            run_migrations(&conn).unwrap();
        }
        EventLog::new(pool)
    }

    fn event(global: u64, client: u64) -> Event {
        Event {
            id: EventId::new(global, client),
            parent_id: EventId::ROOT,
            name: "noteAdded".into(),
            args: json!({"n": global * 100 + client}),
            client_id: "client-a".into(),
            session_id: "session-1".into(),
        }
    }

    #[test]
    fn append_and_head() {
        let log = setup();
        assert!(log.head().unwrap().is_none());

        log.append(&event(1, 0)).unwrap();
        log.append(&event(1, 1)).unwrap();
        log.append(&event(2, 0)).unwrap();

        assert_eq!(log.head().unwrap(), Some(EventId::new(2, 0)));
        assert_eq!(log.len().unwrap(), 3);
    }

    #[test]
    fn append_out_of_order_fails() {
        let log = setup();
        log.append(&event(2, 0)).unwrap();

        let err = log.append(&event(1, 0)).unwrap_err();
        assert_matches!(
            err,
            LogError::OutOfOrder { head, attempted }
                if head == EventId::new(2, 0) && attempted == EventId::new(1, 0)
        );
    }

    #[test]
    fn append_duplicate_fails() {
        let log = setup();
        log.append(&event(1, 0)).unwrap();
        let err = log.append(&event(1, 0)).unwrap_err();
        assert_matches!(err, LogError::OutOfOrder { .. });
    }

    #[test]
    fn append_batch_is_atomic() {
        let log = setup();
        log.append(&event(1, 0)).unwrap();

        // Second element is out of order; nothing from the batch must land.
        let result = log.append_batch(&[event(2, 0), event(2, 0)]);
        assert!(result.is_err());
        assert_eq!(log.len().unwrap(), 1);
    }

    #[test]
    fn range_pages_through_everything() {
        let log = setup();
        let events: Vec<Event> = (1..=600).map(|g| event(g, 0)).collect();
        log.append_batch(&events).unwrap();

        let replayed: Vec<Event> = log.range_all().map(Result::unwrap).collect();
        assert_eq!(replayed.len(), 600);
        assert_eq!(replayed.first().unwrap().id, EventId::new(1, 0));
        assert_eq!(replayed.last().unwrap().id, EventId::new(600, 0));
        // Ascending throughout.
        assert!(replayed.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn range_all_reads_large_ids() {
        let log = setup();
        log.append(&event(1, 0)).unwrap();
        // Globals past the u32 range must still bind as SQL parameters.
        log.append(&event(u64::from(u32::MAX) + 7, 3)).unwrap();

        let all: Vec<Event> = log.range_all().map(Result::unwrap).collect();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].id, EventId::new(u64::from(u32::MAX) + 7, 3));
    }

    #[test]
    fn corrupt_stored_payload_surfaces_an_error() {
        let log = setup();
        log.append(&event(1, 0)).unwrap();
        {
            let conn = log.pool().get().unwrap();
            let _ = conn
                .execute("UPDATE events SET args = 'not json' WHERE global = 1", [])
                .unwrap();
        }

        assert_matches!(log.confirmed_after(0), Err(LogError::Sqlite(_)));
        let first = log.range_all().next().unwrap();
        assert!(first.is_err());
    }

    #[test]
    fn range_respects_bounds() {
        let log = setup();
        for g in 1..=10 {
            log.append(&event(g, 0)).unwrap();
        }
        let slice: Vec<Event> = log
            .range(EventId::new(3, 0), EventId::new(7, 0))
            .map(Result::unwrap)
            .collect();
        assert_eq!(slice.len(), 5);
        assert_eq!(slice[0].id, EventId::new(3, 0));
        assert_eq!(slice[4].id, EventId::new(7, 0));
    }

    #[test]
    fn local_only_round_trip() {
        let log = setup();
        log.append(&event(1, 0)).unwrap();
        log.append(&event(1, 1)).unwrap();
        log.append(&event(1, 2)).unwrap();

        let removed = log.remove_local_only().unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].id, EventId::new(1, 1));
        assert_eq!(removed[1].id, EventId::new(1, 2));
        assert_eq!(log.head().unwrap(), Some(EventId::new(1, 0)));
    }

    #[test]
    fn confirmed_after_skips_local_only() {
        let log = setup();
        log.append(&event(1, 0)).unwrap();
        log.append(&event(2, 0)).unwrap();
        log.append(&event(2, 1)).unwrap();

        let batch = log.confirmed_after(1).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, EventId::new(2, 0));
    }

    #[test]
    fn remove_confirmed_after_keeps_watermarked_prefix() {
        let log = setup();
        log.append(&event(1, 0)).unwrap();
        log.append(&event(2, 0)).unwrap();
        log.append(&event(3, 0)).unwrap();
        log.append(&event(3, 1)).unwrap();

        let removed = log.remove_confirmed_after(1).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].id, EventId::new(2, 0));
        assert_eq!(removed[1].id, EventId::new(3, 0));
        // The local-only event and the watermarked prefix survive.
        assert_eq!(log.len().unwrap(), 2);
        assert_eq!(log.head().unwrap(), Some(EventId::new(3, 1)));
    }

    #[test]
    fn backend_head_round_trip() {
        let log = setup();
        assert_eq!(log.backend_head().unwrap(), 0);
        log.set_backend_head(7).unwrap();
        assert_eq!(log.backend_head().unwrap(), 7);
    }

    // ── trim ──────────────────────────────────────────────────────────

    fn ids(batch: &[Event]) -> Vec<(u64, u64)> {
        batch.iter().map(|e| (e.id.global, e.id.client)).collect()
    }

    #[test]
    fn trim_worked_example() {
        let batch: Vec<Event> = [(0, 1), (0, 2), (1, 0), (0, 1), (0, 2), (1, 0), (1, 1)]
            .iter()
            .map(|&(g, c)| event(g, c))
            .collect();
        assert_eq!(ids(trim(&batch)), vec![(1, 0), (1, 1)]);
    }

    #[test]
    fn trim_single_rebase_cycle() {
        let batch: Vec<Event> = [(0, 1), (0, 2), (1, 0), (0, 1), (1, 0)]
            .iter()
            .map(|&(g, c)| event(g, c))
            .collect();
        // The final ascending tail is [(0,1),(1,0)]; only (1,0) reaches
        // the earlier head, so the superseded (0,1) is dropped too.
        assert_eq!(ids(trim(&batch)), vec![(1, 0)]);
    }

    #[test]
    fn trim_empty_and_singleton() {
        assert!(trim(&[]).is_empty());
        let one = vec![event(0, 1)];
        assert_eq!(trim(&one).len(), 1);
    }

    proptest! {
        // An already-ascending batch is returned unchanged (idempotence).
        #[test]
        fn trim_ascending_unchanged(globals in proptest::collection::vec(0u64..20, 1..32)) {
            let mut sorted = globals;
            sorted.sort_unstable();
            sorted.dedup();
            let batch: Vec<Event> = sorted.iter().map(|&g| event(g, 0)).collect();
            prop_assert_eq!(ids(trim(&batch)), ids(&batch));
        }

        // trim output is always ascending, so trim(trim(x)) == trim(x).
        #[test]
        fn trim_is_idempotent(pairs in proptest::collection::vec((0u64..6, 0u64..4), 0..24)) {
            let batch: Vec<Event> = pairs.iter().map(|&(g, c)| event(g, c)).collect();
            let once: Vec<Event> = trim(&batch).to_vec();
            let twice = trim(&once);
            prop_assert_eq!(ids(&once), ids(twice));
        }
    }
}
