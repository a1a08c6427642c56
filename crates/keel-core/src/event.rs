//! The [`Event`] struct — the core persisted event type.
//!
//! Events are stored as a flat struct with identity fields at the top level
//! and `args` kept as opaque [`serde_json::Value`]. Decoding `name` + `args`
//! into a typed schema variant happens at the materialization boundary, not
//! here; the log, the bus, and the sync protocol all treat events as opaque.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::EventId;

/// A committed event.
///
/// Immutable once appended to a log. A local-only event (`id.client > 0`)
/// is never mutated either — it is superseded during rebase by a fresh
/// event carrying the same `name`/`args` under a confirmed id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Causal identifier assigned by the leader at commit time.
    pub id: EventId,
    /// The id this event was causally built on.
    pub parent_id: EventId,
    /// Event name — the schema discriminator.
    pub name: String,
    /// Event-specific payload (opaque JSON).
    pub args: Value,
    /// Stable id of the client replica that committed the event.
    pub client_id: String,
    /// Id of the session (tab, worker) that committed the event.
    pub session_id: String,
}

impl Event {
    /// Rebuild this event's payload under a fresh `(id, parent_id)` pair.
    ///
    /// Used by rebase: superseded local-only events keep their `name`,
    /// `args`, and origin fields but are re-issued under confirmed ids.
    #[must_use]
    pub fn reissued(&self, id: EventId, parent_id: EventId) -> Event {
        Event {
            id,
            parent_id,
            name: self.name.clone(),
            args: self.args.clone(),
            client_id: self.client_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}
