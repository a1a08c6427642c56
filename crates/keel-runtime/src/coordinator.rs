//! The per-context coordination state machine.
//!
//! Every store context runs one coordinator task. The task loops through
//! `Electing → Leading | Following` until cancelled or dead:
//!
//! - The **leader** is the single writer. It recovers state by replaying
//!   the log, then serves commit intents from the bus queue, refreshes its
//!   lease on a heartbeat, and schedules sync rounds against the backend.
//!   A round runs as its own task so backend latency never starves the
//!   heartbeat or the intent queue; round writes serialize with commits
//!   through a shared gate and re-check lease ownership first.
//! - **Followers** watch the bus: committed events invalidate their local
//!   reactive queries, missed heartbeats or a leader shutdown send them
//!   back to election.
//!
//! Fatal errors (ordering violations, materialization failures) put the
//! context into a terminal `ShutDown(Fatal)` state and are broadcast so
//! sibling contexts sharing the database terminate too.

use std::sync::Arc;

use keel_core::{Event, EventId, next_pair};
use keel_events::{
    ConnectionPool, EventLog, EventSchema, Materializer, run_migrations, trim,
};
use keel_reactive::ReactiveGraph;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::config::StoreConfig;
use crate::errors::RuntimeError;
use crate::hub::{CommitError, CommitIntent, Hub, LeaseGuard};
use crate::sync::{PushResult, SyncBackend, SyncError, SyncStatus};

/// Where a context currently sits in the coordination state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// The coordinator task has not started electing yet.
    Booting,
    /// Between roles; trying to take the lease.
    Electing,
    /// This context holds the lease and is the single writer.
    Leading,
    /// Another context leads; commits are forwarded over the bus.
    Following,
    /// Terminal. `Requested` after a clean shutdown, `Fatal` otherwise.
    ShutDown(ShutdownCause),
}

/// Why a context (or its leader) stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownCause {
    /// Shutdown was requested by the owner.
    Requested,
    /// An unrecoverable error; the store must not serve further writes.
    Fatal(String),
}

/// Messages on a store's broadcast bus.
#[derive(Clone, Debug)]
pub enum BusMessage {
    /// Events the leader appended (commits, pulled events, rebases).
    Committed {
        /// The appended events in id order.
        events: Vec<Event>,
    },
    /// Periodic liveness signal from the leader.
    Heartbeat,
    /// The leader stopped; followers re-elect or terminate.
    LeaderShutdown {
        /// Clean step-down or fatal store error.
        cause: ShutdownCause,
    },
}

/// Request for an immediate sync round, answered once the round settles.
#[derive(Debug)]
pub struct SyncRequest {
    pub(crate) reply: oneshot::Sender<Result<(), RuntimeError>>,
}

impl SyncRequest {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Result<(), RuntimeError>>) {
        let (reply, rx) = oneshot::channel();
        (Self { reply }, rx)
    }
}

enum Step {
    Reelect,
    Stop,
    Fatal(String),
}

enum RoundFailure {
    Retryable(SyncError),
    /// The lease moved to another context mid-round; abandon quietly.
    LostLease,
    Fatal(String),
}

pub(crate) struct Coordinator<S: EventSchema> {
    hub: Hub,
    config: StoreConfig,
    pool: ConnectionPool,
    log: EventLog,
    materializer: Materializer<S>,
    graph: Arc<Mutex<ReactiveGraph>>,
    backend: Option<Arc<dyn SyncBackend>>,
    state_tx: watch::Sender<LeaderState>,
    sync_status_tx: watch::Sender<SyncStatus>,
    sync_requests: Option<mpsc::Receiver<SyncRequest>>,
    /// Serializes log/row-store writes between commit processing and an
    /// in-flight sync round's rebase. Backend I/O and backoff sleeps run
    /// outside the gate, so commits queue only at the append step.
    write_gate: Arc<AsyncMutex<()>>,
    cancel: CancellationToken,
}

impl<S: EventSchema + Sync> Coordinator<S> {
    pub(crate) fn new(
        hub: Hub,
        config: StoreConfig,
        pool: ConnectionPool,
        graph: Arc<Mutex<ReactiveGraph>>,
        backend: Option<Arc<dyn SyncBackend>>,
        state_tx: watch::Sender<LeaderState>,
        sync_status_tx: watch::Sender<SyncStatus>,
        sync_requests: mpsc::Receiver<SyncRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            hub,
            config,
            log: EventLog::new(pool.clone()),
            materializer: Materializer::new(pool.clone()),
            pool,
            graph,
            backend,
            state_tx,
            sync_status_tx,
            sync_requests: Some(sync_requests),
            write_gate: Arc::new(AsyncMutex::new(())),
            cancel,
        }
    }

    /// Drive the state machine until shutdown. Consumes the coordinator.
    #[instrument(skip_all, fields(store_id = %self.config.store_id))]
    pub(crate) async fn run(mut self) {
        let cause = loop {
            if self.cancel.is_cancelled() {
                break ShutdownCause::Requested;
            }
            self.set_state(LeaderState::Electing);
            let ttl = self.config.election.lease_timeout;
            let step = match self.hub.try_acquire(&self.config.store_id, ttl) {
                Some(guard) => self.lead(guard).await,
                None => self.follow().await,
            };
            match step {
                Step::Reelect => {}
                Step::Stop => break ShutdownCause::Requested,
                Step::Fatal(reason) => break ShutdownCause::Fatal(reason),
            }
        };
        info!(?cause, "coordinator stopped");
        self.set_state(LeaderState::ShutDown(cause));
    }

    // ── leader ───────────────────────────────────────────────────────────

    async fn lead(&mut self, guard: LeaseGuard) -> Step {
        if let Err(reason) = self.recover() {
            return self.fail(reason);
        }
        self.set_state(LeaderState::Leading);
        info!("leading");

        let cancel = self.cancel.clone();
        let holder = guard.holder();
        let mut intents = self.hub.take_intents(&self.config.store_id);
        let mut sync_requests = self.sync_requests.take();

        let mut heartbeat = tokio::time::interval(self.config.election.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync_timer = self
            .config
            .sync
            .interval
            .filter(|_| self.backend.is_some())
            .map(tokio::time::interval);
        if let Some(timer) = sync_timer.as_mut() {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        // At most one round in flight; explicit requests received while it
        // runs wait for it alongside the one that started it.
        let mut round: Option<JoinHandle<Result<(), RoundFailure>>> = None;
        let mut waiters: Vec<oneshot::Sender<Result<(), RuntimeError>>> = Vec::new();

        let step = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.publish(BusMessage::LeaderShutdown {
                        cause: ShutdownCause::Requested,
                    });
                    break Step::Stop;
                }

                _ = heartbeat.tick() => {
                    if !guard.refresh(self.config.election.lease_timeout) {
                        warn!("lease lost, stepping down");
                        break Step::Reelect;
                    }
                    self.publish(BusMessage::Heartbeat);
                }

                intent = intents.recv() => {
                    let Some(first) = intent else {
                        // Channel was replaced out from under us.
                        break Step::Reelect;
                    };
                    let mut batch = vec![first];
                    while let Ok(next) = intents.try_recv() {
                        batch.push(next);
                    }
                    let gate = Arc::clone(&self.write_gate);
                    let _gate = gate.lock().await;
                    if let Err(reason) = self.process_commits(batch) {
                        self.publish(BusMessage::LeaderShutdown {
                            cause: ShutdownCause::Fatal(reason.clone()),
                        });
                        break Step::Fatal(reason);
                    }
                }

                request = recv_opt(&mut sync_requests) => {
                    let Some(request) = request else {
                        // Store handle gone; stop polling a closed channel.
                        sync_requests = None;
                        continue;
                    };
                    waiters.push(request.reply);
                    if round.is_none() {
                        round = Some(self.spawn_round(holder));
                    }
                }

                () = tick_opt(&mut sync_timer) => {
                    if round.is_none() {
                        round = Some(self.spawn_round(holder));
                    }
                }

                outcome = join_opt(&mut round) => {
                    round = None;
                    match outcome {
                        Ok(()) => {
                            for reply in waiters.drain(..) {
                                let _ = reply.send(Ok(()));
                            }
                        }
                        Err(RoundFailure::Retryable(err)) => {
                            for reply in waiters.drain(..) {
                                let _ = reply.send(Err(err.clone().into()));
                            }
                        }
                        Err(RoundFailure::LostLease) => {
                            for reply in waiters.drain(..) {
                                let _ = reply.send(Err(RuntimeError::NotLeader));
                            }
                            warn!("lease lost mid-round, stepping down");
                            break Step::Reelect;
                        }
                        Err(RoundFailure::Fatal(reason)) => {
                            for reply in waiters.drain(..) {
                                let _ = reply
                                    .send(Err(RuntimeError::Terminal(reason.clone())));
                            }
                            self.publish(BusMessage::LeaderShutdown {
                                cause: ShutdownCause::Fatal(reason.clone()),
                            });
                            break Step::Fatal(reason);
                        }
                    }
                }
            }
        };

        if let Some(handle) = round.take() {
            // Aborts land on an await point, never inside a rebase; the
            // round's writes are also lease-checked under the gate.
            handle.abort();
        }
        self.sync_requests = sync_requests;
        if matches!(step, Step::Stop | Step::Reelect) {
            self.hub.return_intents(&self.config.store_id, intents);
        }
        step
    }

    /// Leader boot: migrate, create schema tables, replay the full log.
    fn recover(&mut self) -> Result<(), String> {
        {
            let conn = self.log.pool().get().map_err(|e| e.to_string())?;
            run_migrations(&conn).map_err(|e| e.to_string())?;
        }
        self.materializer
            .ensure_tables()
            .map_err(|e| e.to_string())?;
        let applied = self
            .materializer
            .replay(self.log.range_all())
            .map_err(|e| e.to_string())?;
        debug!(applied, "boot replay complete");
        refresh_queries(&self.graph, S::TABLES);
        Ok(())
    }

    /// Commit a batch of intents: validate, assign ids, materialize,
    /// append, notify. Any log or apply failure is fatal.
    fn process_commits(&mut self, batch: Vec<CommitIntent>) -> Result<(), String> {
        let mut head = self
            .log
            .head()
            .map_err(|e| e.to_string())?
            .unwrap_or(EventId::ROOT);
        // With a backend, fresh commits are speculative until synced.
        let local_only = self.backend.is_some();

        let mut committed: Vec<(Event, oneshot::Sender<Result<EventId, CommitError>>)> =
            Vec::new();
        let mut affected: Vec<&'static str> = Vec::new();

        for intent in batch {
            // Validate before assigning an id; a payload that cannot
            // decode must never reach the log.
            if let Err(err) = S::decode(&intent.name, &intent.args) {
                debug!(name = %intent.name, error = %err, "rejected commit intent");
                let _ = intent.ack.send(Err(CommitError::InvalidPayload {
                    name: intent.name,
                    reason: err.to_string(),
                }));
                continue;
            }

            let (id, parent_id) = next_pair(head, local_only);
            let event = Event {
                id,
                parent_id,
                name: intent.name,
                args: intent.args,
                client_id: intent.client_id,
                session_id: intent.session_id,
            };

            let tables = match self.materializer.apply_event(&event) {
                Ok(tables) => tables,
                Err(err) => {
                    let reason = err.to_string();
                    let _ = intent.ack.send(Err(CommitError::StoreFailed(reason.clone())));
                    return Err(reason);
                }
            };
            if let Err(err) = self.log.append(&event) {
                let reason = err.to_string();
                let _ = intent.ack.send(Err(CommitError::StoreFailed(reason.clone())));
                return Err(reason);
            }

            head = id;
            affected.extend_from_slice(tables);
            committed.push((event, intent.ack));
        }

        if committed.is_empty() {
            return Ok(());
        }
        affected.sort_unstable();
        affected.dedup();
        refresh_queries(&self.graph, &affected);

        let events: Vec<Event> = committed.iter().map(|(event, _)| event.clone()).collect();
        counter!("keel_commits_total").increment(events.len() as u64);
        self.publish(BusMessage::Committed { events });
        for (event, ack) in committed {
            let _ = ack.send(Ok(event.id));
        }
        Ok(())
    }

    fn spawn_round(&self, holder: u64) -> JoinHandle<Result<(), RoundFailure>> {
        let driver = SyncDriver::<S> {
            hub: self.hub.clone(),
            store_id: self.config.store_id.clone(),
            holder,
            log: self.log.clone(),
            materializer: Materializer::new(self.pool.clone()),
            graph: Arc::clone(&self.graph),
            backend: self.backend.clone(),
            backoff: self.config.sync.backoff.clone(),
            push_batch_limit: self.config.sync.push_batch_limit,
            sync_status_tx: self.sync_status_tx.clone(),
            write_gate: Arc::clone(&self.write_gate),
        };
        tokio::spawn(driver.run())
    }

    // ── follower ─────────────────────────────────────────────────────────

    async fn follow(&mut self) -> Step {
        self.set_state(LeaderState::Following);
        debug!("following");
        let mut bus = self.hub.subscribe(&self.config.store_id);
        let lease_timeout = self.config.election.lease_timeout;
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Step::Stop,

                received = tokio::time::timeout(lease_timeout, bus.recv()) => {
                    match received {
                        Err(_elapsed) => {
                            debug!("leader went silent, standing for election");
                            return Step::Reelect;
                        }
                        Ok(Ok(BusMessage::Heartbeat)) => {}
                        Ok(Ok(BusMessage::Committed { events })) => {
                            self.absorb_commits(&events);
                        }
                        Ok(Ok(BusMessage::LeaderShutdown { cause })) => match cause {
                            ShutdownCause::Requested => return Step::Reelect,
                            ShutdownCause::Fatal(reason) => return Step::Fatal(reason),
                        },
                        Ok(Err(RecvError::Lagged(skipped))) => {
                            warn!(skipped, "fell behind the bus, refreshing all queries");
                            refresh_queries(&self.graph, S::TABLES);
                        }
                        Ok(Err(RecvError::Closed)) => return Step::Reelect,
                    }
                }
            }
        }
    }

    /// Invalidate the queries touched by events another context committed.
    fn absorb_commits(&mut self, events: &[Event]) {
        let mut affected: Vec<&'static str> = Vec::new();
        for event in events {
            match S::decode(&event.name, &event.args) {
                Ok(decoded) => affected.extend_from_slice(decoded.tables()),
                Err(err) => {
                    // The leader validated this; disagreement means our
                    // schema view is stale. Refresh everything.
                    warn!(name = %event.name, error = %err, "undecodable bus event");
                    affected.extend_from_slice(S::TABLES);
                }
            }
        }
        affected.sort_unstable();
        affected.dedup();
        refresh_queries(&self.graph, &affected);
    }

    // ── shared plumbing ──────────────────────────────────────────────────

    fn publish(&self, message: BusMessage) {
        self.hub.publish(&self.config.store_id, message);
    }

    fn set_state(&self, state: LeaderState) {
        let _ = self.state_tx.send_replace(state);
    }

    fn fail(&self, reason: String) -> Step {
        self.publish(BusMessage::LeaderShutdown {
            cause: ShutdownCause::Fatal(reason.clone()),
        });
        Step::Fatal(reason)
    }
}

// ── sync rounds ──────────────────────────────────────────────────────────

/// One sync round, run as its own task so the leader loop stays live.
///
/// Pull and push I/O and backoff sleeps proceed without any lock held.
/// Log and row-store writes (rebase, watermark advance) take the shared
/// write gate and re-verify lease ownership first: a leader deposed
/// mid-round abandons the round instead of writing behind its successor.
struct SyncDriver<S: EventSchema> {
    hub: Hub,
    store_id: String,
    holder: u64,
    log: EventLog,
    materializer: Materializer<S>,
    graph: Arc<Mutex<ReactiveGraph>>,
    backend: Option<Arc<dyn SyncBackend>>,
    backoff: BackoffPolicy,
    push_batch_limit: usize,
    sync_status_tx: watch::Sender<SyncStatus>,
    write_gate: Arc<AsyncMutex<()>>,
}

impl<S: EventSchema> SyncDriver<S> {
    /// Run the round to completion, retrying with backoff.
    ///
    /// Conflicts and transport errors are retryable (the next attempt
    /// pulls again before pushing); log and materializer failures during
    /// rebase are fatal.
    async fn run(self) -> Result<(), RoundFailure> {
        let Some(backend) = self.backend.clone() else {
            return Ok(());
        };
        self.set_status(SyncStatus::Syncing);

        let mut attempt = 0u32;
        loop {
            match self.try_sync(backend.as_ref()).await {
                Ok(()) => {
                    self.set_status(SyncStatus::InSync);
                    counter!("keel_sync_rounds_total").increment(1);
                    return Ok(());
                }
                Err(RoundFailure::LostLease) => {
                    self.set_status(SyncStatus::Idle);
                    return Err(RoundFailure::LostLease);
                }
                Err(RoundFailure::Fatal(reason)) => {
                    self.set_status(SyncStatus::Degraded(reason.clone()));
                    return Err(RoundFailure::Fatal(reason));
                }
                Err(RoundFailure::Retryable(err)) => {
                    if !self.backoff.allows(attempt) {
                        let last = err.to_string();
                        self.set_status(SyncStatus::Degraded(last.clone()));
                        counter!("keel_sync_failures_total").increment(1);
                        return Err(RoundFailure::Retryable(SyncError::RetriesExhausted {
                            attempts: attempt + 1,
                            last,
                        }));
                    }
                    debug!(attempt, error = %err, "sync attempt failed, backing off");
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One pull-rebase-push attempt.
    async fn try_sync(&self, backend: &dyn SyncBackend) -> Result<(), RoundFailure> {
        let since = self.log.backend_head().map_err(fatal)?;
        let pulled = backend
            .pull(since)
            .await
            .map_err(RoundFailure::Retryable)?;

        {
            let _gate = self.write_gate.lock().await;
            if !self.hub.holds(&self.store_id, self.holder) {
                return Err(RoundFailure::LostLease);
            }
            let has_speculative = !self.log.local_only().map_err(fatal)?.is_empty();
            if !pulled.is_empty() || has_speculative {
                self.rebase(&pulled)?;
            }
        }

        loop {
            let watermark = self.log.backend_head().map_err(fatal)?;
            let mut pending = self.log.confirmed_after(watermark).map_err(fatal)?;
            if pending.is_empty() {
                return Ok(());
            }
            pending.truncate(self.push_batch_limit);

            match backend
                .push(&pending)
                .await
                .map_err(RoundFailure::Retryable)?
            {
                PushResult::Accepted => {
                    let _gate = self.write_gate.lock().await;
                    if !self.hub.holds(&self.store_id, self.holder) {
                        return Err(RoundFailure::LostLease);
                    }
                    // Non-empty by the check above.
                    if let Some(last) = pending.last() {
                        self.log.set_backend_head(last.id.global).map_err(fatal)?;
                    }
                }
                PushResult::Conflict { remote_head } => {
                    debug!(remote_head, "push conflict");
                    return Err(RoundFailure::Retryable(SyncError::Conflict { remote_head }));
                }
            }
        }
    }

    /// Integrate pulled events underneath our unconfirmed ones.
    ///
    /// Everything the backend has not accepted — speculative events and
    /// confirmed-but-unpushed ones from a conflicted round — comes out of
    /// the log, the pulled events go in, and the pending payloads are
    /// re-issued on top under fresh confirmed ids. The row store is then
    /// rebuilt by full replay: applying the same payloads in a different
    /// order can produce different rows, so no incremental shortcut is
    /// sound. Callers hold the write gate.
    fn rebase(&self, pulled: &[Event]) -> Result<(), RoundFailure> {
        let watermark = self.log.backend_head().map_err(fatal)?;
        let mut pending = self.log.remove_confirmed_after(watermark).map_err(fatal)?;
        pending.extend(self.log.remove_local_only().map_err(fatal)?);

        if !pulled.is_empty() {
            self.log.append_batch(pulled).map_err(fatal)?;
            if let Some(last) = pulled.last() {
                self.log.set_backend_head(last.id.global).map_err(fatal)?;
            }
        }

        let mut head = self
            .log
            .head()
            .map_err(fatal)?
            .unwrap_or(EventId::ROOT);
        let mut reissued = Vec::with_capacity(pending.len());
        for event in &pending {
            let (id, parent_id) = next_pair(head, false);
            let fresh = event.reissued(id, parent_id);
            self.log.append(&fresh).map_err(fatal)?;
            head = id;
            reissued.push(fresh);
        }

        self.materializer
            .replay(self.log.range_all())
            .map_err(|e| fatal(e.to_string()))?;
        refresh_queries(&self.graph, S::TABLES);
        counter!("keel_rebases_total").increment(1);
        info!(
            pulled = pulled.len(),
            reissued = reissued.len(),
            "rebased local events"
        );

        // Notify with the batch trimmed to its confirmed suffix.
        let mut batch = pending;
        batch.extend_from_slice(pulled);
        batch.append(&mut reissued);
        let confirmed = trim(&batch).to_vec();
        if !confirmed.is_empty() {
            self.hub
                .publish(&self.store_id, BusMessage::Committed { events: confirmed });
        }
        Ok(())
    }

    fn set_status(&self, status: SyncStatus) {
        let _ = self.sync_status_tx.send_replace(status);
    }
}

fn fatal(err: impl std::fmt::Display) -> RoundFailure {
    RoundFailure::Fatal(err.to_string())
}

/// Invalidate and re-evaluate, then deliver notifications with the graph
/// lock released so subscribers can re-enter the store.
fn refresh_queries(graph: &Mutex<ReactiveGraph>, affected: &[&str]) {
    let notifications = {
        let mut graph = graph.lock();
        graph.invalidate_tables(affected);
        graph.flush_deferred()
    };
    for (callback, value) in notifications {
        callback(&value);
    }
}

/// Receive from an optional channel; pends forever when absent so it can
/// sit in a `select!` without a guard.
async fn recv_opt(rx: &mut Option<mpsc::Receiver<SyncRequest>>) -> Option<SyncRequest> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Tick an optional interval; pends forever when absent.
async fn tick_opt(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            let _ = interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Await an optional in-flight sync round; pends forever when none runs.
async fn join_opt(
    handle: &mut Option<JoinHandle<Result<(), RoundFailure>>>,
) -> Result<(), RoundFailure> {
    match handle {
        Some(handle) => match handle.await {
            Ok(outcome) => outcome,
            Err(err) => Err(RoundFailure::Fatal(format!("sync round task failed: {err}"))),
        },
        None => std::future::pending().await,
    }
}
