//! # keel-runtime
//!
//! Leader coordination, sync protocol, and the store facade.
//!
//! - **Hub**: process-group coordination — the election lease table
//!   (atomic test-and-set per store id) and the per-store message bus
//! - **Coordinator**: the `Booting → Electing → Leading | Following`
//!   state machine; the leader task is the single writer for the row
//!   store and event log, followers forward commit intents over the bus
//! - **Sync**: push/pull reconciliation with a remote backend, rebase of
//!   pending local-only events, bounded retry with configurable backoff
//! - **Store**: the caller-facing facade — commit, live queries,
//!   subscriptions, sync triggers, shutdown
//!
//! ## Crate Position
//!
//! Aggregation layer. Depends on: keel-core, keel-events, keel-reactive.

#![deny(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod hub;
pub mod store;
pub mod sync;

pub use backoff::BackoffPolicy;
pub use config::{ElectionConfig, Storage, StoreConfig, SyncConfig};
pub use coordinator::{BusMessage, LeaderState, ShutdownCause};
pub use errors::RuntimeError;
pub use hub::{CommitError, CommitIntent, Hub, LeaseGuard};
pub use store::Store;
pub use sync::{MemoryBackend, PushResult, SyncBackend, SyncError, SyncStatus};
