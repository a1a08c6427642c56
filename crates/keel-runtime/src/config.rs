//! Store, election, and sync configuration.

use std::path::PathBuf;
use std::time::Duration;

use keel_events::ConnectionConfig;

use crate::backoff::BackoffPolicy;

/// Where the store's SQLite database lives.
#[derive(Clone, Debug)]
pub enum Storage {
    /// Private in-memory database, one per store context. Useful for
    /// tests and throwaway sessions.
    Memory,
    /// On-disk database shared by every context opening the same path.
    OnDisk(PathBuf),
}

/// Leader election timing.
#[derive(Clone, Debug)]
pub struct ElectionConfig {
    /// Interval between leader heartbeats (lease refresh + bus ping).
    pub heartbeat_interval: Duration,
    /// Lease age after which followers treat the leader as gone and
    /// stand for election. Must comfortably exceed the heartbeat.
    pub lease_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            lease_timeout: Duration::from_secs(3),
        }
    }
}

/// Sync scheduling and retry behavior.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Retry backoff for conflicted or failed rounds.
    pub backoff: BackoffPolicy,
    /// Interval between automatic sync rounds while leading. `None`
    /// disables the timer; rounds then run only via explicit trigger.
    pub interval: Option<Duration>,
    /// Maximum events pushed per round.
    pub push_batch_limit: usize,
    /// Deadline for a blocking [`crate::Store::sync_now`] to settle. Must
    /// cover a full retry schedule under `backoff`.
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            interval: Some(Duration::from_secs(15)),
            push_batch_limit: 512,
            request_timeout: Duration::from_secs(180),
        }
    }
}

/// Full configuration for opening a [`crate::Store`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Identifies the logical store within the hub. Contexts sharing a
    /// store id share one election and one bus.
    pub store_id: String,
    /// Stable client replica id stamped onto committed events.
    pub client_id: String,
    /// Session identifier stamped onto committed events.
    pub session_id: String,
    /// Database location.
    pub storage: Storage,
    /// SQLite pool tuning.
    pub connection: ConnectionConfig,
    /// Election timing.
    pub election: ElectionConfig,
    /// Sync scheduling.
    pub sync: SyncConfig,
    /// Deadline for a blocking `commit` to be acknowledged.
    pub commit_timeout: Duration,
}

impl StoreConfig {
    /// In-memory config with sensible defaults, keyed by store id.
    #[must_use]
    pub fn in_memory(store_id: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            client_id: "client-local".to_owned(),
            session_id: "local".to_owned(),
            storage: Storage::Memory,
            connection: ConnectionConfig::default(),
            election: ElectionConfig::default(),
            sync: SyncConfig::default(),
            commit_timeout: Duration::from_secs(10),
        }
    }

    /// On-disk config with sensible defaults.
    #[must_use]
    pub fn on_disk(store_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            storage: Storage::OnDisk(path.into()),
            ..Self::in_memory(store_id)
        }
    }
}
