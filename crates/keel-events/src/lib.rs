//! # keel-events
//!
//! Event log, materializer, and SQLite row store for the keel engine.
//!
//! - **[`log::EventLog`]**: durable, append-only, EventId-ordered event
//!   storage with paged replay and the [`log::trim`] batch-suffix rule
//! - **[`materializer`]**: the [`materializer::EventSchema`] closed sum
//!   type seam and the deterministic [`materializer::Materializer`] that
//!   folds events onto row-store tables
//! - **[`sqlite`]**: connection pool, pragmas, and the schema-version
//!   marker that invalidates (never migrates) stale persisted files
//! - **[`snapshot`]**: raw row-store export/import for bootstrap
//!
//! ## Crate Position
//!
//! Storage layer. Depends on: keel-core.
//! Depended on by: keel-runtime.

#![deny(unsafe_code)]

pub mod errors;
pub mod log;
pub mod materializer;
pub mod snapshot;
pub mod sqlite;

pub use errors::{LogError, MaterializeError};
pub use log::{EventLog, trim};
pub use materializer::{EventSchema, Materializer, ReplayError};
pub use sqlite::connection::{ConnectionConfig, ConnectionPool, new_in_memory, new_on_disk};
pub use sqlite::migrations::run_migrations;
