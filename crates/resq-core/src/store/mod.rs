//! Data store adapter.
//!
//! All registry and queue state lives in a shared key-value server. The
//! [`Store`] trait is the seam between the runtime and that server:
//! [`RedisStore`] talks to Redis in production, [`MemoryStore`] backs tests
//! and development without a server.

pub mod memory;
pub mod redis;

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Default namespace prefix for all keys.
pub const DEFAULT_NAMESPACE: &str = "resque";

/// Number of connection attempts made by [`Store::reconnect`].
pub const RECONNECT_ATTEMPTS: u32 = 3;

/// Base delay for the linear reconnect backoff (attempt `n` waits `n` times
/// this long).
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Errors from data store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A command against the server failed.
    #[error("data store command failed: {0}")]
    Command(#[from] ::redis::RedisError),

    /// The connection could not be re-established.
    #[error("could not reconnect to the data store after {attempts} attempts: {source}")]
    Reconnect {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// The error from the final attempt.
        source: ::redis::RedisError,
    },

    /// A registry value could not be interpreted.
    #[error("malformed registry value for '{key}': {detail}")]
    MalformedValue {
        /// Key holding the value.
        key: String,
        /// What was wrong with it.
        detail: String,
    },
}

/// Typed operations against the shared key-value server.
///
/// Implementations must be safe against concurrent access from other
/// supervisors; every operation maps to a single atomic server command or an
/// atomic pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append an encoded payload to `queue` and register the queue name.
    async fn push(&self, queue: &str, payload: &str) -> Result<(), StoreError>;

    /// Non-blocking pop from the head of `queue`.
    async fn pop(&self, queue: &str) -> Result<Option<String>, StoreError>;

    /// Entries `lo..=hi` of `queue` (negative indices count from the tail).
    async fn range(&self, queue: &str, lo: isize, hi: isize) -> Result<Vec<String>, StoreError>;

    /// Remove every occurrence of `payload` from `queue`; returns the count
    /// removed.
    async fn remove(&self, queue: &str, payload: &str) -> Result<u64, StoreError>;

    /// Names of all queues that have ever been pushed to and not removed.
    async fn queues(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Delete a queue and its registration.
    async fn remove_queue(&self, queue: &str) -> Result<(), StoreError>;

    /// Identities in the worker membership set.
    async fn worker_ids(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Whether `id` is registered.
    async fn worker_exists(&self, id: &str) -> Result<bool, StoreError>;

    /// Add `id` to the membership set and stamp its started-at time.
    async fn register(&self, id: &str, started_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Remove `id` and every key referencing it: membership, working
    /// payload, started-at, heartbeat, and the worker's private counters.
    async fn unregister(&self, id: &str) -> Result<(), StoreError>;

    /// Record what `id` is currently working on.
    async fn set_payload(&self, id: &str, encoded: &str) -> Result<(), StoreError>;

    /// The working payload of `id`, if any.
    async fn get_payload(&self, id: &str) -> Result<Option<String>, StoreError>;

    /// Clear the working payload of `id`.
    async fn clear_payload(&self, id: &str) -> Result<(), StoreError>;

    /// When `id` registered, if known.
    async fn started_at(&self, id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Stamp `time` as the last heartbeat of `id`.
    async fn heartbeat(&self, id: &str, time: DateTime<Utc>) -> Result<(), StoreError>;

    /// Every recorded heartbeat, keyed by identity.
    async fn all_heartbeats(&self) -> Result<HashMap<String, DateTime<Utc>>, StoreError>;

    /// Drop the heartbeat entry of `id`.
    async fn remove_heartbeat(&self, id: &str) -> Result<(), StoreError>;

    /// The server's clock, not the client's.
    async fn server_time(&self) -> Result<DateTime<Utc>, StoreError>;

    /// Try to take the fleet-wide pruning lock for `ttl`.
    ///
    /// Must use an atomic set-if-absent-with-expiry so a crashed holder
    /// releases automatically. Returns `false` when another supervisor holds
    /// the lock.
    async fn acquire_prune_lock(&self, id: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Bulk [`Store::get_payload`] for `ids`.
    async fn workers_map(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Option<String>>, StoreError>;

    /// Atomically increment the counter `name`, returning the new value.
    async fn counter_incr(&self, name: &str) -> Result<u64, StoreError>;

    /// Current value of counter `name` (0 when absent).
    async fn counter_get(&self, name: &str) -> Result<u64, StoreError>;

    /// Delete counter `name`.
    async fn counter_clear(&self, name: &str) -> Result<(), StoreError>;

    /// Append an encoded failure record to the failure list.
    async fn push_failure(&self, record: &str) -> Result<(), StoreError>;

    /// Number of recorded failures.
    async fn failure_count(&self) -> Result<u64, StoreError>;

    /// Failure records `lo..=hi`.
    async fn failures(&self, lo: isize, hi: isize) -> Result<Vec<String>, StoreError>;

    /// Drop all failure records.
    async fn clear_failures(&self) -> Result<(), StoreError>;

    /// Re-open the underlying connection.
    ///
    /// Retries up to [`RECONNECT_ATTEMPTS`] times with linear backoff, then
    /// fails. Children call this on entry so they never share the parent's
    /// connection.
    async fn reconnect(&self) -> Result<(), StoreError>;
}

/// Key layout under a namespace prefix.
///
/// The layout is wire-compatible with the conventional `resque:` registry so
/// existing dashboards and producers can read it.
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    /// Create a key space under `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The list holding queue `name`.
    #[must_use]
    pub fn queue(&self, name: &str) -> String {
        format!("{}:queue:{name}", self.namespace)
    }

    /// The set of known queue names.
    #[must_use]
    pub fn queues(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    /// The worker membership set.
    #[must_use]
    pub fn workers(&self) -> String {
        format!("{}:workers", self.namespace)
    }

    /// The working payload of worker `id`.
    #[must_use]
    pub fn worker(&self, id: &str) -> String {
        format!("{}:worker:{id}", self.namespace)
    }

    /// The started-at stamp of worker `id`.
    #[must_use]
    pub fn worker_started(&self, id: &str) -> String {
        format!("{}:worker:{id}:started", self.namespace)
    }

    /// The heartbeat hash.
    #[must_use]
    pub fn heartbeats(&self) -> String {
        format!("{}:workers:heartbeat", self.namespace)
    }

    /// Counter `name`.
    #[must_use]
    pub fn stat(&self, name: &str) -> String {
        format!("{}:stat:{name}", self.namespace)
    }

    /// The failure list.
    #[must_use]
    pub fn failed(&self) -> String {
        format!("{}:failed", self.namespace)
    }

    /// The fleet-wide pruning lock.
    #[must_use]
    pub fn prune_lock(&self) -> String {
        format!("{}:pruning_dead_worker_in_progress", self.namespace)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}
