//! Dead-worker pruning.
//!
//! Supervisors garbage-collect registry entries left behind by crashed
//! peers. The whole pass is gated by a fleet-wide lock so at most one
//! supervisor prunes at a time, and the per-worker rules are deliberately
//! conservative: a fleet may mix hosts, queue assignments, and even client
//! implementations, and the pruner only acts where it has authority.

use std::collections::HashSet;
use std::time::Duration;

use super::{unregister, WorkerError, WorkerId};
use crate::failure::DirtyExitKind;
use crate::store::Store;

/// Source of the worker PIDs currently live on this host.
///
/// The production implementation walks the OS process table; tests inject a
/// fixed set.
pub trait ProcessList: Send + Sync {
    /// PIDs of processes that look like workers.
    fn worker_pids(&self) -> Vec<u32>;
}

/// [`ProcessList`] backed by the OS process table, filtered by a
/// process-name/command-line pattern.
#[derive(Debug, Clone)]
pub struct SystemProcesses {
    pattern: String,
}

impl SystemProcesses {
    /// Match processes whose name or command line contains `pattern`.
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// Match processes that look like this binary.
    #[must_use]
    pub fn for_current_exe() -> Self {
        let pattern = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "resq-worker".to_string());
        Self::new(pattern)
    }
}

impl ProcessList for SystemProcesses {
    fn worker_pids(&self) -> Vec<u32> {
        use sysinfo::System;

        let system = System::new_all();
        system
            .processes()
            .iter()
            .filter(|(_, process)| {
                process.name().contains(&self.pattern)
                    || process.cmd().iter().any(|arg| arg.contains(&self.pattern))
            })
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }
}

/// What a prune pass did.
#[derive(Debug, Default)]
pub struct PruneReport {
    /// Whether this supervisor won the pruning lock.
    pub lock_acquired: bool,
    /// Identities removed from the registry.
    pub pruned: Vec<String>,
}

/// Evict registry entries for workers that are provably gone.
///
/// Entry is gated on the pruning lock (TTL = `heartbeat_interval`); losing
/// the lock skips the pass entirely. A worker with an expired heartbeat is
/// unregistered with a `PruneDeadWorkerDirtyExit` cause. Workers that never
/// heartbeated may simply predate the heartbeat protocol, so they are only
/// eligible for the PID check, and that check applies only to workers on
/// this host whose queue list matches ours (or when we watch `*`); pruning
/// across queue assignments would synthesize failures for job classes this
/// process knows nothing about.
///
/// # Errors
///
/// Returns an error on data store failure.
pub async fn prune_dead_workers(
    store: &dyn Store,
    me: &WorkerId,
    heartbeat_interval: Duration,
    prune_interval: Duration,
    processes: &dyn ProcessList,
) -> Result<PruneReport, WorkerError> {
    let mut report = PruneReport::default();
    if !store
        .acquire_prune_lock(&me.to_string(), heartbeat_interval)
        .await?
    {
        tracing::debug!("another supervisor holds the pruning lock; skipping");
        return Ok(report);
    }
    report.lock_acquired = true;

    let ids = store.worker_ids().await?;
    if ids.is_empty() {
        return Ok(report);
    }

    let heartbeats = store.all_heartbeats().await?;
    let now = store.server_time().await?;
    let local_pids: HashSet<u32> = processes.worker_pids().into_iter().collect();
    let max_age =
        chrono::Duration::from_std(prune_interval).unwrap_or_else(|_| chrono::Duration::MAX);

    for id in ids {
        let Ok(worker) = id.parse::<WorkerId>() else {
            tracing::warn!(worker = %id, "leaving unparsable worker identity alone");
            continue;
        };

        let expired = heartbeats
            .get(&id)
            .is_some_and(|beat| now.signed_duration_since(*beat) > max_age);
        if expired {
            tracing::warn!(worker = %id, "pruning worker with expired heartbeat");
            unregister(store, &worker, Some(DirtyExitKind::PruneDeadWorkerDirtyExit)).await?;
            report.pruned.push(id);
            continue;
        }

        if worker.host() != me.host() {
            continue;
        }
        if worker.queues() != me.queues() && !me.watches_all() {
            continue;
        }
        if local_pids.contains(&worker.pid()) {
            continue;
        }

        tracing::warn!(worker = %id, "pruning worker with no live process");
        unregister(store, &worker, None).await?;
        report.pruned.push(id);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::failure::FailureRecord;
    use crate::job::Payload;
    use crate::store::MemoryStore;
    use crate::worker::{register, WorkingPayload};

    struct FakePids(Vec<u32>);

    impl ProcessList for FakePids {
        fn worker_pids(&self) -> Vec<u32> {
            self.0.clone()
        }
    }

    const HEARTBEAT: Duration = Duration::from_millis(10);
    const PRUNE_AGE: Duration = Duration::from_secs(60);

    fn me_on(host: &str, queues: &[&str]) -> WorkerId {
        WorkerId::new(host, 1, queues.iter().map(|q| (*q).to_string()).collect())
    }

    #[tokio::test]
    async fn test_skips_entirely_without_the_lock() {
        let store = MemoryStore::new();
        store
            .acquire_prune_lock("someone-else", Duration::from_secs(60))
            .await
            .unwrap();

        let report = prune_dead_workers(
            &store,
            &me_on("host1", &["q"]),
            HEARTBEAT,
            PRUNE_AGE,
            &FakePids(vec![]),
        )
        .await
        .unwrap();

        assert!(!report.lock_acquired);
        assert!(report.pruned.is_empty());
    }

    #[tokio::test]
    async fn test_expired_heartbeat_is_pruned_with_cause() {
        let store = MemoryStore::new();
        let dead = WorkerId::new("elsewhere", 999, vec!["qA".into()]);
        register(&store, &dead).await.unwrap();
        store
            .heartbeat(&dead.to_string(), Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        let working = WorkingPayload {
            queue: "qA".to_string(),
            run_at: Utc::now(),
            payload: Payload::new("UpdateGraph", vec![json!(1)]),
        };
        store
            .set_payload(&dead.to_string(), &working.encode().unwrap())
            .await
            .unwrap();

        let report = prune_dead_workers(
            &store,
            &me_on("host1", &["q"]),
            HEARTBEAT,
            PRUNE_AGE,
            &FakePids(vec![]),
        )
        .await
        .unwrap();

        assert_eq!(report.pruned, [dead.to_string()]);
        assert!(!store.worker_exists(&dead.to_string()).await.unwrap());
        let raw = store.failures(0, -1).await.unwrap().remove(0);
        let record = FailureRecord::decode(&raw).unwrap();
        assert_eq!(record.exception, "PruneDeadWorkerDirtyExit");
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_survives() {
        let store = MemoryStore::new();
        let alive = WorkerId::new("elsewhere", 999, vec!["qA".into()]);
        register(&store, &alive).await.unwrap();
        store
            .heartbeat(&alive.to_string(), Utc::now())
            .await
            .unwrap();

        let report = prune_dead_workers(
            &store,
            &me_on("host1", &["q"]),
            HEARTBEAT,
            PRUNE_AGE,
            &FakePids(vec![]),
        )
        .await
        .unwrap();

        assert!(report.pruned.is_empty());
        assert!(store.worker_exists(&alive.to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_never_heartbeated_worker_is_not_pruned_by_expiry() {
        let store = MemoryStore::new();
        // Same host, same queues, and its PID is live: it stays, even though
        // it has never sent a heartbeat.
        let quiet = WorkerId::new("host1", 555, vec!["q".into()]);
        register(&store, &quiet).await.unwrap();

        let report = prune_dead_workers(
            &store,
            &me_on("host1", &["q"]),
            HEARTBEAT,
            PRUNE_AGE,
            &FakePids(vec![555]),
        )
        .await
        .unwrap();

        assert!(report.pruned.is_empty());
        assert!(store.worker_exists(&quiet.to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_respects_host_boundaries() {
        let store = MemoryStore::new();
        let foreign = WorkerId::new("host1", 999, vec!["qA".into()]);
        register(&store, &foreign).await.unwrap();

        // A supervisor on host2 has no authority over host1's PIDs.
        let report = prune_dead_workers(
            &store,
            &me_on("host2", &["qA"]),
            HEARTBEAT,
            PRUNE_AGE,
            &FakePids(vec![]),
        )
        .await
        .unwrap();

        assert!(report.pruned.is_empty());
        assert!(store.worker_exists(&foreign.to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_same_host_dead_pid_is_soft_pruned() {
        let store = MemoryStore::new();
        let dead = WorkerId::new("host1", 999, vec!["qA".into()]);
        register(&store, &dead).await.unwrap();

        let report = prune_dead_workers(
            &store,
            &me_on("host1", &["qA"]),
            HEARTBEAT,
            PRUNE_AGE,
            &FakePids(vec![1, 2]),
        )
        .await
        .unwrap();

        assert_eq!(report.pruned, [dead.to_string()]);
        assert!(!store.worker_exists(&dead.to_string()).await.unwrap());
        // Soft prune of an idle worker records no failure.
        assert_eq!(store.failure_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_skips_other_queue_assignments() {
        let store = MemoryStore::new();
        let other = WorkerId::new("host1", 999, vec!["other".into()]);
        register(&store, &other).await.unwrap();

        let report = prune_dead_workers(
            &store,
            &me_on("host1", &["qA"]),
            HEARTBEAT,
            PRUNE_AGE,
            &FakePids(vec![]),
        )
        .await
        .unwrap();

        assert!(report.pruned.is_empty());
    }

    #[tokio::test]
    async fn test_star_watcher_prunes_across_queues() {
        let store = MemoryStore::new();
        let other = WorkerId::new("host1", 999, vec!["other".into()]);
        register(&store, &other).await.unwrap();

        let report = prune_dead_workers(
            &store,
            &me_on("host1", &["*"]),
            HEARTBEAT,
            PRUNE_AGE,
            &FakePids(vec![]),
        )
        .await
        .unwrap();

        assert_eq!(report.pruned, [other.to_string()]);
    }

    #[tokio::test]
    async fn test_second_prune_is_a_no_op() {
        let store = MemoryStore::new();
        let dead = WorkerId::new("host1", 999, vec!["qA".into()]);
        register(&store, &dead).await.unwrap();
        let me = me_on("host1", &["qA"]);

        let first = prune_dead_workers(&store, &me, HEARTBEAT, PRUNE_AGE, &FakePids(vec![]))
            .await
            .unwrap();
        assert_eq!(first.pruned.len(), 1);

        // Wait out the lock TTL so the second pass actually runs.
        tokio::time::sleep(HEARTBEAT * 3).await;
        let second = prune_dead_workers(&store, &me, HEARTBEAT, PRUNE_AGE, &FakePids(vec![]))
            .await
            .unwrap();
        assert!(second.lock_acquired);
        assert!(second.pruned.is_empty());
    }
}
