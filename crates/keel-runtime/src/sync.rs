//! The sync backend contract and the in-process reference backend.
//!
//! A backend is a dumb confirmed-event log: it accepts pushes that extend
//! its head contiguously and serves pulls past a watermark. All rebase
//! intelligence lives on the client side (see the coordinator); the
//! backend never rewrites events.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{Event, EventId};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

/// Sync failure modes.
///
/// None of these are fatal for the store: conflicts trigger a
/// pull-rebase-retry cycle and transport errors are retried with backoff.
#[derive(Clone, Debug, Error)]
pub enum SyncError {
    /// The pushed batch did not extend the backend's head contiguously.
    #[error("push conflict: remote head at global {remote_head}")]
    Conflict {
        /// The backend's current confirmed head.
        remote_head: u64,
    },
    /// The backend was unreachable or answered garbage.
    #[error("sync transport error: {0}")]
    Transport(String),
    /// A round gave up after exhausting its retry budget.
    #[error("sync abandoned after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// The last underlying failure.
        last: String,
    },
}

/// Connectivity as observed by the leader's sync loop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SyncStatus {
    /// No round has run yet (or no backend is configured).
    #[default]
    Idle,
    /// A round is in flight.
    Syncing,
    /// The last round completed; local confirmed state matches the backend.
    InSync,
    /// Rounds are failing; the store keeps working locally.
    Degraded(String),
}

/// Outcome of a push.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushResult {
    /// The batch now extends the backend's log.
    Accepted,
    /// The batch would not extend the head contiguously; pull first.
    Conflict {
        /// The backend's current confirmed head.
        remote_head: u64,
    },
}

/// A remote (or remote-standing) store of confirmed events.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Confirmed events with `global` beyond `since`, in order.
    async fn pull(&self, since: u64) -> Result<Vec<Event>, SyncError>;

    /// Offer a batch of confirmed events extending the backend's head.
    async fn push(&self, events: &[Event]) -> Result<PushResult, SyncError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryBackend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryBackendInner {
    log: Vec<Event>,
    fail_next: u32,
}

/// In-process [`SyncBackend`] holding its log in memory.
///
/// Doubles as the test backend and as a same-process hub for wiring two
/// stores together. Extra knobs (`commit_remote`, `fail_next_requests`)
/// simulate concurrent writers and flaky transport.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryBackendInner>>,
}

impl MemoryBackend {
    /// An empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The backend's confirmed head (0 when empty).
    #[must_use]
    pub fn head(&self) -> u64 {
        self.inner
            .lock()
            .log
            .last()
            .map_or(0, |event| event.id.global)
    }

    /// Snapshot of the backend's full log.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().log.clone()
    }

    /// Append an event directly, as another client's confirmed commit.
    ///
    /// Assigns the next global slot itself. Returns the assigned id.
    pub fn commit_remote(
        &self,
        name: impl Into<String>,
        args: Value,
        client_id: impl Into<String>,
    ) -> EventId {
        let mut inner = self.inner.lock();
        let head = inner.log.last().map_or(0, |event| event.id.global);
        let id = EventId::new(head + 1, 0);
        inner.log.push(Event {
            id,
            parent_id: EventId::new(head, 0),
            name: name.into(),
            args,
            client_id: client_id.into(),
            session_id: "remote".to_owned(),
        });
        id
    }

    /// Make the next `n` pull/push calls fail with a transport error.
    pub fn fail_next_requests(&self, n: u32) {
        self.inner.lock().fail_next = n;
    }

    fn check_failure(inner: &mut MemoryBackendInner) -> Result<(), SyncError> {
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(SyncError::Transport("injected failure".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncBackend for MemoryBackend {
    async fn pull(&self, since: u64) -> Result<Vec<Event>, SyncError> {
        let mut inner = self.inner.lock();
        Self::check_failure(&mut inner)?;
        Ok(inner
            .log
            .iter()
            .filter(|event| event.id.global > since)
            .cloned()
            .collect())
    }

    async fn push(&self, events: &[Event]) -> Result<PushResult, SyncError> {
        let mut inner = self.inner.lock();
        Self::check_failure(&mut inner)?;
        if events.is_empty() {
            return Ok(PushResult::Accepted);
        }

        let head = inner.log.last().map_or(0, |event| event.id.global);
        let mut expected = head + 1;
        for event in events {
            if event.id.client != 0 || event.id.global != expected {
                return Ok(PushResult::Conflict { remote_head: head });
            }
            expected += 1;
        }
        inner.log.extend_from_slice(events);
        Ok(PushResult::Accepted)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
