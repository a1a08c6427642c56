//! # keel-core
//!
//! Foundation types for the keel local-first event-sourcing engine.
//!
//! This crate provides the shared vocabulary that all other keel crates
//! depend on:
//!
//! - **[`ids::EventId`]**: the `(global, client)` causal identifier pair and
//!   its successor function [`ids::next_pair`]
//! - **[`event::Event`]**: the immutable committed-event wire/storage struct
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other keel crates.

#![deny(unsafe_code)]

pub mod event;
pub mod ids;

pub use event::Event;
pub use ids::{EventId, next_pair};
