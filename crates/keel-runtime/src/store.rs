//! The caller-facing store facade.
//!
//! A [`Store`] owns one coordinator task and the reactive graph for its
//! context. Commits go through the hub's intent queue regardless of role,
//! so application code never cares whether this context currently leads.
//! Live queries are plain SQL over the materialized tables, registered
//! with the tables they depend on and re-fetched when a commit touches
//! those tables.

use std::marker::PhantomData;
use std::sync::Arc;

use keel_core::{Event, EventId};
use keel_events::{
    ConnectionPool, EventLog, EventSchema, LogError, new_in_memory, new_on_disk, snapshot,
};
use keel_reactive::{NodeId, ReactiveGraph, SubscriptionId};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{Storage, StoreConfig};
use crate::coordinator::{Coordinator, LeaderState, ShutdownCause, SyncRequest};
use crate::errors::RuntimeError;
use crate::hub::{CommitError, CommitIntent, Hub};
use crate::sync::{SyncBackend, SyncStatus};

/// Pending explicit sync requests.
const SYNC_REQUEST_CAPACITY: usize = 8;

/// One store context: facade over the coordinator, log, and graph.
pub struct Store<S: EventSchema> {
    hub: Hub,
    config: StoreConfig,
    pool: ConnectionPool,
    graph: Arc<Mutex<ReactiveGraph>>,
    state_rx: watch::Receiver<LeaderState>,
    sync_status_rx: watch::Receiver<SyncStatus>,
    sync_tx: mpsc::Sender<SyncRequest>,
    cancel: CancellationToken,
    _schema: PhantomData<fn() -> S>,
}

impl<S: EventSchema + Sync> Store<S> {
    /// Open a store with no sync backend. Commits are confirmed locally.
    pub fn open(hub: &Hub, config: StoreConfig) -> Result<Self, RuntimeError> {
        Self::open_inner(hub, config, None)
    }

    /// Open a store that reconciles against `backend`. Commits are
    /// speculative until a sync round confirms them.
    pub fn open_with_backend(
        hub: &Hub,
        config: StoreConfig,
        backend: Arc<dyn SyncBackend>,
    ) -> Result<Self, RuntimeError> {
        Self::open_inner(hub, config, Some(backend))
    }

    fn open_inner(
        hub: &Hub,
        config: StoreConfig,
        backend: Option<Arc<dyn SyncBackend>>,
    ) -> Result<Self, RuntimeError> {
        let pool = match &config.storage {
            Storage::Memory => new_in_memory(&config.connection)?,
            Storage::OnDisk(path) => new_on_disk(path, &config.connection)?,
        };
        let graph = Arc::new(Mutex::new(ReactiveGraph::new()));
        let (state_tx, state_rx) = watch::channel(LeaderState::Booting);
        let (sync_status_tx, sync_status_rx) = watch::channel(SyncStatus::default());
        let (sync_tx, sync_requests) = mpsc::channel(SYNC_REQUEST_CAPACITY);
        let cancel = CancellationToken::new();

        let coordinator = Coordinator::<S>::new(
            hub.clone(),
            config.clone(),
            pool.clone(),
            Arc::clone(&graph),
            backend,
            state_tx,
            sync_status_tx,
            sync_requests,
            cancel.clone(),
        );
        let _ = tokio::spawn(coordinator.run());

        Ok(Self {
            hub: hub.clone(),
            config,
            pool,
            graph,
            state_rx,
            sync_status_rx,
            sync_tx,
            cancel,
            _schema: PhantomData,
        })
    }

    // ── commits ──────────────────────────────────────────────────────────

    /// Commit an event and wait for it to be durable.
    ///
    /// Works from any role: followers forward over the bus. Returns the
    /// assigned id.
    pub async fn commit(
        &self,
        name: impl Into<String>,
        args: Value,
    ) -> Result<EventId, RuntimeError> {
        let (intent, ack_rx) = self.intent(name.into(), args);
        self.hub
            .intent_sender(&self.config.store_id)
            .send(intent)
            .await
            .map_err(|_| RuntimeError::ShutDown)?;

        let ack = tokio::time::timeout(self.config.commit_timeout, ack_rx)
            .await
            .map_err(|_| RuntimeError::Timeout("commit acknowledgement"))?;
        match ack {
            Ok(Ok(id)) => Ok(id),
            Ok(Err(CommitError::InvalidPayload { name, reason })) => Err(
                RuntimeError::CommitRejected(format!("invalid payload for '{name}': {reason}")),
            ),
            Ok(Err(CommitError::StoreFailed(reason))) => Err(RuntimeError::Terminal(reason)),
            // Ack dropped: the leader died mid-handoff. Retryable.
            Err(_) => Err(RuntimeError::ShutDown),
        }
    }

    /// Commit without waiting for acknowledgement.
    pub fn commit_detached(&self, name: impl Into<String>, args: Value) {
        let (intent, _ack_rx) = self.intent(name.into(), args);
        let sender = self.hub.intent_sender(&self.config.store_id);
        let _ = tokio::spawn(async move {
            let _ = sender.send(intent).await;
        });
    }

    fn intent(
        &self,
        name: String,
        args: Value,
    ) -> (CommitIntent, oneshot::Receiver<Result<EventId, CommitError>>) {
        let (ack, ack_rx) = oneshot::channel();
        (
            CommitIntent {
                name,
                args,
                client_id: self.config.client_id.clone(),
                session_id: self.config.session_id.clone(),
                ack,
            },
            ack_rx,
        )
    }

    // ── reactive queries ─────────────────────────────────────────────────

    /// Register a live SQL query over the materialized tables.
    ///
    /// The node re-fetches whenever a commit touches one of `tables`. Rows
    /// come back as a JSON array of objects keyed by column name; a fetch
    /// failure yields `null`.
    pub fn query_node(&self, tables: &[&str], sql: &str) -> NodeId {
        let pool = self.pool.clone();
        let sql = sql.to_owned();
        self.graph.lock().query(tables, move || run_query(&pool, &sql))
    }

    /// Current value of a node, evaluating it if stale.
    pub fn read(&self, node: NodeId) -> Value {
        self.graph.lock().read(node)
    }

    /// Observe a node; the callback fires at most once per flush.
    ///
    /// Callbacks run after the graph lock is released, so they may call
    /// back into the store (`read`, `subscribe`, `with_graph`).
    pub fn subscribe(
        &self,
        node: NodeId,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Option<SubscriptionId> {
        self.graph.lock().subscribe(node, callback)
    }

    /// Run a closure against the graph for anything the convenience
    /// methods do not cover (computed nodes, sources, cleanup).
    pub fn with_graph<R>(&self, f: impl FnOnce(&mut ReactiveGraph) -> R) -> R {
        f(&mut self.graph.lock())
    }

    // ── state & sync ─────────────────────────────────────────────────────

    /// This context's current coordination state.
    pub fn state(&self) -> LeaderState {
        self.state_rx.borrow().clone()
    }

    /// A watch over the coordination state.
    pub fn state_watch(&self) -> watch::Receiver<LeaderState> {
        self.state_rx.clone()
    }

    /// Wait until the state satisfies the predicate.
    pub async fn wait_for_state(&self, mut predicate: impl FnMut(&LeaderState) -> bool) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|state| predicate(state)).await;
    }

    /// Connectivity as of the last sync round.
    pub fn sync_status(&self) -> SyncStatus {
        self.sync_status_rx.borrow().clone()
    }

    /// A watch over sync connectivity.
    pub fn sync_status_watch(&self) -> watch::Receiver<SyncStatus> {
        self.sync_status_rx.clone()
    }

    /// Run a sync round now and wait for it to settle, bounded by
    /// [`SyncConfig::request_timeout`](crate::SyncConfig::request_timeout).
    ///
    /// Only the leader talks to the backend; followers get
    /// [`RuntimeError::NotLeader`].
    pub async fn sync_now(&self) -> Result<(), RuntimeError> {
        if self.state() != LeaderState::Leading {
            return Err(RuntimeError::NotLeader);
        }
        let (request, reply) = SyncRequest::new();
        self.sync_tx
            .send(request)
            .await
            .map_err(|_| RuntimeError::ShutDown)?;
        let settled = tokio::time::timeout(self.config.sync.request_timeout, reply)
            .await
            .map_err(|_| RuntimeError::Timeout("sync round"))?;
        settled.map_err(|_| RuntimeError::ShutDown)?
    }

    // ── log access & snapshots ───────────────────────────────────────────

    /// The highest id in the local log.
    pub fn head(&self) -> Result<Option<EventId>, RuntimeError> {
        Ok(EventLog::new(self.pool.clone()).head()?)
    }

    /// The full local log in id order.
    pub fn events(&self) -> Result<Vec<Event>, RuntimeError> {
        let events = EventLog::new(self.pool.clone())
            .range_all()
            .collect::<Result<Vec<_>, LogError>>()?;
        Ok(events)
    }

    /// Serialize the whole database (log, watermark, materialized tables).
    pub fn export_snapshot(&self) -> Result<Vec<u8>, RuntimeError> {
        Ok(snapshot::export(&self.pool)?)
    }

    /// Overwrite the database from a snapshot.
    ///
    /// Intended for seeding and backup tooling. A live context does not
    /// notice the swap; reopen the store afterwards.
    pub fn import_snapshot(&self, bytes: &[u8]) -> Result<(), RuntimeError> {
        Ok(snapshot::import(&self.pool, bytes)?)
    }

    /// Stop the coordinator and wait for the terminal state.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.wait_for_state(|state| matches!(state, LeaderState::ShutDown(_)))
            .await;
    }

    /// Whether the store ended in a fatal state, and why.
    pub fn fatal_cause(&self) -> Option<String> {
        match self.state() {
            LeaderState::ShutDown(ShutdownCause::Fatal(reason)) => Some(reason),
            _ => None,
        }
    }
}

fn run_query(pool: &ConnectionPool, sql: &str) -> Value {
    match fetch_rows(pool, sql) {
        Ok(rows) => Value::Array(rows),
        Err(err) => {
            warn!(error = %err, "live query fetch failed");
            Value::Null
        }
    }
}

fn fetch_rows(pool: &ConnectionPool, sql: &str) -> Result<Vec<Value>, LogError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = serde_json::Map::with_capacity(columns.len());
        for (index, name) in columns.iter().enumerate() {
            let value = match row.get_ref(index)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::from(v),
                ValueRef::Real(v) => Value::from(v),
                ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
                ValueRef::Blob(blob) => Value::Array(blob.iter().map(|&b| Value::from(b)).collect()),
            };
            let _ = object.insert(name.clone(), value);
        }
        out.push(Value::Object(object));
    }
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
