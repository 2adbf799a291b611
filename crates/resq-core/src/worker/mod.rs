//! Worker identity and registry membership.
//!
//! A worker is known to the fleet by the identity string `host:pid:q1,q2`,
//! created on register and immutable until unregister. Unregistering also
//! records a dirty-exit failure for any job the worker still had in flight,
//! then removes every key referencing the identity.

pub mod child;
pub mod heartbeat;
pub mod procline;
pub mod pruner;
pub mod signals;
pub mod supervisor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::{self, DirtyExitKind, FailureRecord};
use crate::job::{JobError, Payload};
use crate::stats;
use crate::store::{Store, StoreError};

/// Errors from the worker runtime.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A data store round-trip failed.
    #[error("data store error: {0}")]
    Store(#[from] StoreError),

    /// A payload or registry value failed to encode or decode.
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// An identity string did not have the `host:pid:queues` shape.
    #[error("invalid worker identity '{0}'")]
    InvalidIdentity(String),

    /// The local hostname could not be determined.
    #[error("could not determine hostname: {0}")]
    Hostname(#[source] nix::Error),

    /// A child processor could not be spawned.
    #[error("failed to spawn child processor: {0}")]
    Spawn(#[source] std::io::Error),

    /// A signal could not be installed or delivered.
    #[error("signal error: {0}")]
    Signal(String),

    /// Teardown failed after the supervise loop had already erred.
    #[error("teardown failed: {error} (while handling: {cause})")]
    Teardown {
        /// The teardown error.
        error: Box<WorkerError>,
        /// The error teardown was cleaning up after.
        cause: Box<WorkerError>,
    },
}

/// A worker identity: `(host, pid, queues[])`, rendered `host:pid:q1,q2`.
///
/// Equality is string equality on the rendered form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    host: String,
    pid: u32,
    queues: Vec<String>,
}

impl WorkerId {
    /// Build an identity from explicit parts.
    #[must_use]
    pub fn new(host: impl Into<String>, pid: u32, queues: Vec<String>) -> Self {
        Self {
            host: host.into(),
            pid,
            queues,
        }
    }

    /// The identity of this process: local hostname, our PID, `queues`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hostname cannot be read.
    pub fn local(queues: Vec<String>) -> Result<Self, WorkerError> {
        let host = nix::unistd::gethostname()
            .map_err(WorkerError::Hostname)?
            .to_string_lossy()
            .into_owned();
        Ok(Self::new(host, std::process::id(), queues))
    }

    /// The host part.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The pid part.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The queue list part.
    #[must_use]
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Whether this worker watches every queue (`*` configured).
    #[must_use]
    pub fn watches_all(&self) -> bool {
        self.queues.iter().any(|q| q == "*")
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.pid, self.queues.join(","))
    }
}

impl std::str::FromStr for WorkerId {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let (Some(queues), Some(pid), Some(host)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(WorkerError::InvalidIdentity(s.to_string()));
        };
        let pid = pid
            .parse()
            .map_err(|_| WorkerError::InvalidIdentity(s.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            pid,
            queues: queues.split(',').map(str::to_string).collect(),
        })
    }
}

/// The registry entry describing what a worker is currently executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingPayload {
    /// Queue the job was reserved from.
    pub queue: String,
    /// When execution started (server time).
    pub run_at: DateTime<Utc>,
    /// The reserved payload.
    pub payload: Payload,
}

impl WorkingPayload {
    /// Encode to the stored representation.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Codec`] if serialization fails.
    pub fn encode(&self) -> Result<String, JobError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a stored entry.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Codec`] for malformed entries.
    pub fn decode(raw: &str) -> Result<Self, JobError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Add `id` to the membership set, stamping its started-at time.
///
/// # Errors
///
/// Returns an error on data store failure.
pub async fn register(store: &dyn Store, id: &WorkerId) -> Result<(), WorkerError> {
    let now = store.server_time().await?;
    store.register(&id.to_string(), now).await?;
    tracing::info!(worker = %id, "registered worker");
    Ok(())
}

/// Remove `id` from the registry.
///
/// If the worker still has a working payload, a dirty-exit failure is
/// recorded against it first (`cause` overrides the default `DirtyExit`
/// label). The store then atomically drops membership, payload, started-at,
/// heartbeat, and the worker's private counters.
///
/// # Errors
///
/// Returns an error on data store failure.
pub async fn unregister(
    store: &dyn Store,
    id: &WorkerId,
    cause: Option<DirtyExitKind>,
) -> Result<(), WorkerError> {
    let key = id.to_string();
    if let Some(raw) = store.get_payload(&key).await? {
        match WorkingPayload::decode(&raw) {
            Ok(working) => {
                let kind = cause.unwrap_or(DirtyExitKind::DirtyExit);
                let now = store.server_time().await?;
                let record =
                    FailureRecord::orphaned(&working.queue, working.payload, &key, kind, now);
                failure::record(store, &record).await?;
                stats::incr_failed(store, &key).await?;
                tracing::warn!(worker = %id, cause = %kind, "recorded dirty exit for in-flight job");
            }
            Err(err) => {
                tracing::warn!(worker = %id, error = %err, "dropping malformed working payload");
            }
        }
    }
    store.unregister(&key).await?;
    tracing::info!(worker = %id, "unregistered worker");
    Ok(())
}

/// Whether `id` currently holds a non-empty working payload (I1: that is
/// the definition of `working`; otherwise it is idle).
///
/// # Errors
///
/// Returns an error on data store failure.
pub async fn is_working(store: &dyn Store, id: &WorkerId) -> Result<bool, WorkerError> {
    Ok(store
        .get_payload(&id.to_string())
        .await?
        .is_some_and(|raw| !raw.is_empty()))
}

/// Every registered worker together with what it is working on, for
/// inspection tooling. Workers with malformed payloads are reported idle.
///
/// # Errors
///
/// Returns an error on data store failure.
pub async fn working(
    store: &dyn Store,
) -> Result<Vec<(String, Option<WorkingPayload>)>, WorkerError> {
    let ids: Vec<String> = store.worker_ids().await?.into_iter().collect();
    let map = store.workers_map(&ids).await?;
    Ok(ids
        .into_iter()
        .map(|id| {
            let payload = map
                .get(&id)
                .and_then(Clone::clone)
                .and_then(|raw| WorkingPayload::decode(&raw).ok());
            (id, payload)
        })
        .collect())
}
