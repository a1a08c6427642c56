//! Process-group coordination: election leases and per-store buses.
//!
//! A [`Hub`] is shared by every store context in the process. It owns two
//! things per store id:
//!
//! - **Lease table**: the election primitive. `try_acquire` is an atomic
//!   test-and-set under one lock; exactly one context holds the lease at
//!   a time, and an expired lease (missed heartbeats) is up for grabs.
//! - **Bus**: a broadcast channel the leader publishes commits and
//!   heartbeats on, plus an mpsc intent queue followers use to forward
//!   commit requests to whoever currently leads.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use keel_core::EventId;
use metrics::gauge;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::coordinator::BusMessage;

/// Broadcast buffer per store bus. Slow followers that fall further behind
/// see `Lagged` and refresh all their queries instead of replaying.
const BUS_CAPACITY: usize = 1024;

/// Commit intents queued ahead of the leader.
const INTENT_CAPACITY: usize = 256;

/// A commit request forwarded to the leader.
#[derive(Debug)]
pub struct CommitIntent {
    /// Event name (schema discriminator).
    pub name: String,
    /// Event payload.
    pub args: serde_json::Value,
    /// Replica id of the committing context.
    pub client_id: String,
    /// Session id of the committing context.
    pub session_id: String,
    /// Fulfilled with the assigned id once the event is durable.
    pub ack: oneshot::Sender<Result<EventId, CommitError>>,
}

/// Why a commit intent was not committed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommitError {
    /// The payload failed schema validation; it never reached the log.
    #[error("invalid payload for '{name}': {reason}")]
    InvalidPayload {
        /// Event name from the intent.
        name: String,
        /// Decoder's complaint.
        reason: String,
    },
    /// The store hit a fatal error while processing this intent.
    #[error("store failed: {0}")]
    StoreFailed(String),
}

struct Lease {
    holder: u64,
    expires_at: Instant,
}

struct Bus {
    broadcast: broadcast::Sender<BusMessage>,
    intents_tx: mpsc::Sender<CommitIntent>,
    intents_rx: Option<mpsc::Receiver<CommitIntent>>,
}

impl Bus {
    fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BUS_CAPACITY);
        let (intents_tx, intents_rx) = mpsc::channel(INTENT_CAPACITY);
        Self {
            broadcast,
            intents_tx,
            intents_rx: Some(intents_rx),
        }
    }
}

#[derive(Default)]
struct HubInner {
    leases: Mutex<HashMap<String, Lease>>,
    buses: Mutex<HashMap<String, Bus>>,
    next_holder: AtomicU64,
}

/// Shared coordination state for every store context in the process.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// A fresh hub with no leases or buses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the leadership lease for `store_id`.
    ///
    /// Succeeds when no live lease exists or the current one has expired.
    /// Returns `None` while another context holds a live lease.
    pub fn try_acquire(&self, store_id: &str, ttl: Duration) -> Option<LeaseGuard> {
        let now = Instant::now();
        let mut leases = self.inner.leases.lock();
        if let Some(lease) = leases.get(store_id) {
            if lease.expires_at > now {
                return None;
            }
        }
        let holder = self.inner.next_holder.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = leases.insert(
            store_id.to_owned(),
            Lease {
                holder,
                expires_at: now + ttl,
            },
        );
        debug!(store_id, holder, "lease acquired");
        gauge!("keel_hub_leases").increment(1.0);
        Some(LeaseGuard {
            hub: self.clone(),
            store_id: store_id.to_owned(),
            holder,
        })
    }

    /// Subscribe to the store's broadcast bus.
    pub fn subscribe(&self, store_id: &str) -> broadcast::Receiver<BusMessage> {
        let mut buses = self.inner.buses.lock();
        buses
            .entry(store_id.to_owned())
            .or_insert_with(Bus::new)
            .broadcast
            .subscribe()
    }

    /// Publish a message on the store's bus. Lost messages (no receivers)
    /// are fine; a context always re-reads the database on boot.
    pub fn publish(&self, store_id: &str, message: BusMessage) {
        let mut buses = self.inner.buses.lock();
        let bus = buses.entry(store_id.to_owned()).or_insert_with(Bus::new);
        let _ = bus.broadcast.send(message);
    }

    /// A sender for forwarding commit intents to the current leader.
    ///
    /// Fetched per commit, not cached: the channel is replaced when a new
    /// leader takes over after an unclean handoff.
    pub fn intent_sender(&self, store_id: &str) -> mpsc::Sender<CommitIntent> {
        let mut buses = self.inner.buses.lock();
        buses
            .entry(store_id.to_owned())
            .or_insert_with(Bus::new)
            .intents_tx
            .clone()
    }

    /// Take the intent receiver; called by a context right after winning
    /// the election.
    ///
    /// When the previous leader returned it on step-down the queued intents
    /// survive the handoff. When it vanished with a dead leader, a fresh
    /// channel replaces it and the stranded intents' acks drop, which the
    /// committing contexts observe as a retryable failure.
    pub fn take_intents(&self, store_id: &str) -> mpsc::Receiver<CommitIntent> {
        let mut buses = self.inner.buses.lock();
        let bus = buses.entry(store_id.to_owned()).or_insert_with(Bus::new);
        match bus.intents_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::channel(INTENT_CAPACITY);
                bus.intents_tx = tx;
                rx
            }
        }
    }

    /// Return the intent receiver on graceful step-down.
    pub fn return_intents(&self, store_id: &str, rx: mpsc::Receiver<CommitIntent>) {
        let mut buses = self.inner.buses.lock();
        if let Some(bus) = buses.get_mut(store_id) {
            bus.intents_rx = Some(rx);
        }
    }

    /// Whether `holder` still owns a live lease on `store_id`.
    ///
    /// Checked by a leader's spawned tasks before they write: a deposed
    /// leader must not write behind its successor's back.
    pub(crate) fn holds(&self, store_id: &str, holder: u64) -> bool {
        let leases = self.inner.leases.lock();
        leases
            .get(store_id)
            .is_some_and(|lease| lease.holder == holder && lease.expires_at > Instant::now())
    }

    fn release(&self, store_id: &str, holder: u64) {
        let mut leases = self.inner.leases.lock();
        if leases.get(store_id).is_some_and(|l| l.holder == holder) {
            let _ = leases.remove(store_id);
            debug!(store_id, holder, "lease released");
            gauge!("keel_hub_leases").decrement(1.0);
        }
    }

    fn refresh(&self, store_id: &str, holder: u64, ttl: Duration) -> bool {
        let mut leases = self.inner.leases.lock();
        match leases.get_mut(store_id) {
            Some(lease) if lease.holder == holder => {
                lease.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        }
    }
}

/// Holds the leadership lease for one store; releases it on drop.
pub struct LeaseGuard {
    hub: Hub,
    store_id: String,
    holder: u64,
}

impl LeaseGuard {
    /// Extend the lease. Returns `false` if the lease was lost (expired
    /// and reclaimed by another context), in which case the holder must
    /// stop acting as leader.
    #[must_use]
    pub fn refresh(&self, ttl: Duration) -> bool {
        self.hub.refresh(&self.store_id, self.holder, ttl)
    }

    pub(crate) fn holder(&self) -> u64 {
        self.holder
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.hub.release(&self.store_id, self.holder);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
