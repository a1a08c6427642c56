//! Runtime error taxonomy.
//!
//! Ordering violations and materialization failures are fatal for the
//! store instance. Sync conflicts and transport failures are retried
//! internally and only ever surface as degraded connectivity, never as
//! store failure.

use thiserror::Error;

use crate::sync::SyncError;

/// Errors surfaced by the store facade and coordinator.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Event log failure (ordering violations are fatal).
    #[error(transparent)]
    Log(#[from] keel_events::LogError),

    /// Materialization failure. Fatal for this store instance.
    #[error(transparent)]
    Materialize(#[from] keel_events::MaterializeError),

    /// Sync failure that exhausted its retry budget.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The commit was rejected by the leader.
    #[error("commit rejected: {0}")]
    CommitRejected(String),

    /// The store has shut down (or its leader task is gone).
    #[error("store is shut down")]
    ShutDown,

    /// The store hit a fatal error and is in its terminal state.
    #[error("store is in terminal error state: {0}")]
    Terminal(String),

    /// Operation requires this context to be the leader.
    #[error("not the leader for this store")]
    NotLeader,

    /// A blocking call exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}
