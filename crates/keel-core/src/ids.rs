//! The [`EventId`] causal identifier and its successor function.
//!
//! Every committed event carries an `EventId` — a `(global, client)` pair.
//! The `global` half is assigned by whichever process currently leads the
//! store and advances monotonically for confirmed (synced) events. The
//! `client` half advances only among local-only events that share a
//! `global` value; `client > 0` therefore marks a speculative event that
//! the sync backend has not confirmed yet and that may be rebased.
//!
//! The derived `Ord` gives the lexicographic `(global, client)` total
//! order that the event log, the sync protocol, and the rebase algorithm
//! all rely on.

use serde::{Deserialize, Serialize};

/// Causal identifier for a committed event.
///
/// Total order: compare `global` first, then `client` (derived `Ord`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId {
    /// Authority-assigned slot; monotonic among confirmed events.
    pub global: u64,
    /// Local-only counter within a `global` slot; 0 for confirmed events.
    pub client: u64,
}

impl EventId {
    /// The identifier every log starts from.
    pub const ROOT: EventId = EventId::new(0, 0);

    /// Construct an id from its two halves.
    #[must_use]
    pub const fn new(global: u64, client: u64) -> Self {
        Self { global, client }
    }

    /// Whether this id denotes a speculative local-only event.
    #[must_use]
    pub const fn is_local_only(&self) -> bool {
        self.client > 0
    }

    /// `self >= other` under the `(global, client)` order.
    ///
    /// Kept as a named helper because call sites read better than a bare
    /// comparison operator when the two sides come from different logs.
    #[must_use]
    pub fn is_greater_or_equal(&self, other: &EventId) -> bool {
        self >= other
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}.{}", self.global, self.client)
    }
}

/// Compute the `(id, parent_id)` pair for the next event after `current`.
///
/// - `local_only`: the parent is `current` itself and the new id stays in
///   the same `global` slot at `client + 1`. Local-only events never
///   advance `global`.
/// - confirmed: the parent is `current` collapsed onto its confirmed slot
///   `(current.global, 0)` and the new id opens the next slot
///   `(current.global + 1, 0)`. Confirming a run of local-only events thus
///   always lands them on a single new `global` slot.
#[must_use]
pub fn next_pair(current: EventId, local_only: bool) -> (EventId, EventId) {
    if local_only {
        (
            EventId::new(current.global, current.client + 1),
            current,
        )
    } else {
        (
            EventId::new(current.global + 1, 0),
            EventId::new(current.global, 0),
        )
    }
}
