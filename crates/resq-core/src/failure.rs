//! Durable failure records.
//!
//! Every non-suppressed job failure becomes one record on the failure list:
//! pipeline errors from a live child, and the synthetic dirty-exit records
//! written when a worker is unregistered while still holding a working
//! payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobError, Payload};
use crate::store::Store;

/// Cause attached to a failure synthesized for an orphaned working payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyExitKind {
    /// The worker went away with a job in flight.
    DirtyExit,
    /// A pruner evicted a dead worker that had a job in flight.
    PruneDeadWorkerDirtyExit,
}

impl DirtyExitKind {
    /// The exception label written to the record.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::DirtyExit => "DirtyExit",
            Self::PruneDeadWorkerDirtyExit => "PruneDeadWorkerDirtyExit",
        }
    }
}

impl std::fmt::Display for DirtyExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One entry on the failure list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// When the failure was recorded (server time).
    pub failed_at: DateTime<Utc>,
    /// Queue the job came from.
    pub queue: String,
    /// Identity of the worker it failed on.
    pub worker: String,
    /// The job payload as it was reserved.
    pub payload: Payload,
    /// Coarse exception label (e.g. `TermException`, `DirtyExit`).
    pub exception: String,
    /// Human-readable error detail.
    pub error: String,
}

impl FailureRecord {
    /// Build a record for a pipeline error raised while `worker` executed
    /// `job`.
    #[must_use]
    pub fn for_job(job: &Job, worker: &str, error: &JobError, failed_at: DateTime<Utc>) -> Self {
        Self {
            failed_at,
            queue: job.queue().to_string(),
            worker: worker.to_string(),
            payload: job.payload().clone(),
            exception: exception_label(error).to_string(),
            error: error.to_string(),
        }
    }

    /// Build a record for a payload orphaned by a worker that never reported
    /// an outcome.
    #[must_use]
    pub fn orphaned(
        queue: &str,
        payload: Payload,
        worker: &str,
        kind: DirtyExitKind,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            failed_at,
            queue: queue.to_string(),
            worker: worker.to_string(),
            payload,
            exception: kind.label().to_string(),
            error: format!("worker {worker} exited with a job still in flight"),
        }
    }

    /// Encode to the stored representation.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Codec`] if serialization fails.
    pub fn encode(&self) -> Result<String, JobError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Codec`] for malformed records.
    pub fn decode(raw: &str) -> Result<Self, JobError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Append `record` to the failure list.
///
/// # Errors
///
/// Returns an error if encoding or the push fails.
pub async fn record(store: &dyn Store, failure: &FailureRecord) -> Result<(), JobError> {
    store.push_failure(&failure.encode()?).await?;
    Ok(())
}

/// Coarse exception label for a pipeline error.
#[must_use]
pub fn exception_label(error: &JobError) -> &'static str {
    match error {
        JobError::Codec(_) => "DecodeError",
        JobError::UnknownClass(_) => "NoHandlerError",
        JobError::DontPerform => "DontPerform",
        JobError::Terminated => "TermException",
        JobError::Interrupted => "DirtyExit",
        JobError::Failed(_) => "JobExecutionError",
        JobError::FailureHookFailed { .. } => "FailureHookError",
        JobError::Store(_) => "DataStoreError",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_record_round_trips_through_the_store() {
        let store = MemoryStore::new();
        let job = Job::new("q", Payload::new("UpdateGraph", vec![json!("a")]));
        let failure = FailureRecord::for_job(
            &job,
            "host:1:q",
            &JobError::failed("boom"),
            Utc::now(),
        );

        record(&store, &failure).await.unwrap();

        assert_eq!(store.failure_count().await.unwrap(), 1);
        let raw = store.failures(0, -1).await.unwrap().remove(0);
        let decoded = FailureRecord::decode(&raw).unwrap();
        assert_eq!(decoded.queue, "q");
        assert_eq!(decoded.worker, "host:1:q");
        assert_eq!(decoded.exception, "JobExecutionError");
        assert_eq!(decoded.error, "boom");
        assert_eq!(decoded.payload.class, "UpdateGraph");
    }

    #[test]
    fn test_exception_labels() {
        assert_eq!(exception_label(&JobError::Terminated), "TermException");
        assert_eq!(exception_label(&JobError::Interrupted), "DirtyExit");
        assert_eq!(
            exception_label(&JobError::UnknownClass("X".into())),
            "NoHandlerError"
        );
    }

    #[test]
    fn test_orphaned_record_carries_the_cause() {
        let payload = Payload::new("X", vec![]);
        let failure = FailureRecord::orphaned(
            "q",
            payload,
            "host:9:q",
            DirtyExitKind::PruneDeadWorkerDirtyExit,
            Utc::now(),
        );
        assert_eq!(failure.exception, "PruneDeadWorkerDirtyExit");
    }
}
