//! Error types for the storage layer.
//!
//! Two families, matching the engine's error taxonomy:
//!
//! - **[`LogError`]**: event-log failures. `OutOfOrder` is a programming /
//!   integration bug (appends must be serialized through the leader) and is
//!   never retried.
//! - **[`MaterializeError`]**: materialization failures. Always fatal for
//!   the store instance — an unknown event or bad payload applied on one
//!   replica but skipped on another would diverge the replicas.

use keel_core::EventId;
use thiserror::Error;

/// Result alias for log operations.
pub type LogResult<T> = std::result::Result<T, LogError>;

/// Result alias for materialization.
pub type MaterializeResult<T> = std::result::Result<T, MaterializeError>;

/// Event log errors.
#[derive(Debug, Error)]
pub enum LogError {
    /// Append id not strictly greater than the current head.
    #[error("out-of-order append: head is {head}, attempted {attempted}")]
    OutOfOrder {
        /// Current head of the log.
        head: EventId,
        /// The id the caller tried to append.
        attempted: EventId,
    },

    /// Underlying SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Snapshot export/import failure.
    #[error("snapshot i/o error: {0}")]
    Snapshot(#[from] std::io::Error),
}

/// Materialization errors. All variants are fatal for the store.
#[derive(Debug, Error)]
pub enum MaterializeError {
    /// Event name not present in the schema's closed variant set.
    #[error("unknown event name '{name}'")]
    UnknownEvent {
        /// The unrecognized discriminator.
        name: String,
    },

    /// Payload failed schema validation for a known event name.
    #[error("invalid payload for event '{name}': {reason}")]
    InvalidPayload {
        /// Event name the payload was decoded against.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Underlying SQLite error while applying row mutations.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl MaterializeError {
    /// Shorthand for payload decode failures.
    pub fn invalid_payload(name: &str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidPayload {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}
