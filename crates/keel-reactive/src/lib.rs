//! # keel-reactive
//!
//! Dependency-tracked incremental recomputation for the keel engine.
//!
//! A [`ReactiveGraph`] holds three node kinds: **source** cells (explicit
//! values), **query** sources (row-store reads keyed by the tables they
//! depend on), and **computed** nodes (derived via a read function whose
//! dependencies are auto-tracked on every evaluation). Writes and commit
//! notifications mark transitive dependents dirty; reads re-evaluate
//! lazily and cache; subscriber callbacks are coalesced so observers see
//! at most one notification per discrete state transition.
//!
//! The graph is strictly single-threaded per store: the owning coordinator
//! is the only caller, so there is no interior locking. Nodes live in an
//! arena addressed by generational [`NodeId`] handles — dependency and
//! dependent sets are index sets, never owning pointers, so cyclic
//! back-references cannot leak.
//!
//! ## Crate Position
//!
//! Leaf crate. Depended on by: keel-runtime.

#![deny(unsafe_code)]

pub mod graph;

pub use graph::{NodeId, ReactiveGraph, SubscriberCallback, SubscriptionId};
