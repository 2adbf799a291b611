//! Job records and the queue wire format.
//!
//! A queue entry is a JSON object with the keys `class`, `args`, `id`, and
//! `generation`. Encoding is deterministic (fixed field order, sorted object
//! keys inside `args`), which lets [`destroy`] match entries by string
//! equality on their encoded form.

pub mod hooks;
pub mod registry;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Store, StoreError};

/// Errors raised while building, decoding, or executing jobs.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// No handler is registered under the payload's class name.
    #[error("no handler registered for job class '{0}'")]
    UnknownClass(String),

    /// A before hook signalled that the job should not run.
    ///
    /// This is a control-flow signal, not a failure: the pipeline returns
    /// cleanly and neither after hooks nor failure hooks run.
    #[error("job aborted by before hook")]
    DontPerform,

    /// The running job was cancelled by a TERM/INT shutdown.
    #[error("job terminated during shutdown")]
    Terminated,

    /// The running job was aborted by an operator (USR1) and the processor
    /// kept going.
    #[error("job aborted by operator")]
    Interrupted,

    /// The handler (or a hook) failed.
    #[error("{0}")]
    Failed(String),

    /// A failure hook itself failed while handling `original`.
    #[error("failure hook '{hook}' also failed: {secondary} (original error: {original})")]
    FailureHookFailed {
        /// Name of the failure hook that raised.
        hook: String,
        /// The hook's own error, stringified.
        secondary: String,
        /// The error the hook was invoked for.
        original: Box<JobError>,
    },

    /// A data store round-trip failed.
    #[error("data store error: {0}")]
    Store(#[from] StoreError),
}

impl JobError {
    /// Build a [`JobError::Failed`] from anything displayable.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Immutable envelope carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Runtime class name, resolved against the handler registry.
    pub class: String,
    /// Positional arguments for the handler.
    pub args: Vec<Value>,
    /// Opaque id, 32 hex chars, stable across [`Job::recreate`].
    pub id: String,
    /// Starts at 1; incremented each time the envelope is re-enqueued.
    pub generation: u32,
}

impl Payload {
    /// Build a first-generation payload with a fresh random id.
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
            id: fresh_id(),
            generation: 1,
        }
    }

    /// Encode to the wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Codec`] if an argument cannot be serialized.
    pub fn encode(&self) -> Result<String, JobError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Codec`] for anything that is not a well-formed
    /// payload object.
    pub fn decode(raw: &str) -> Result<Self, JobError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// The payload this one becomes when requeued: same id, next generation.
    #[must_use]
    pub fn next_generation(&self) -> Self {
        Self {
            class: self.class.clone(),
            args: self.args.clone(),
            id: self.id.clone(),
            generation: self.generation + 1,
        }
    }
}

/// A 128-bit random id rendered as 32 lowercase hex chars.
fn fresh_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// An in-flight job: a decoded payload bound to the queue it came from.
///
/// The worker back-reference is a relation only (the identity string), never
/// ownership. The two atomic flags are writable from hooks running on
/// another task.
#[derive(Debug)]
pub struct Job {
    queue: String,
    payload: Payload,
    worker: Option<String>,
    failure_hooks_ran: AtomicBool,
    skip_failed_queue: AtomicBool,
}

impl Job {
    /// Bind `payload` to the queue it was reserved from.
    #[must_use]
    pub fn new(queue: impl Into<String>, payload: Payload) -> Self {
        Self {
            queue: queue.into(),
            payload,
            worker: None,
            failure_hooks_ran: AtomicBool::new(false),
            skip_failed_queue: AtomicBool::new(false),
        }
    }

    /// The queue this job was reserved from.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The decoded payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Handler arguments.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.payload.args
    }

    /// Associate the executing worker's identity.
    pub fn set_worker(&mut self, id: impl Into<String>) {
        self.worker = Some(id.into());
    }

    /// Identity of the worker executing this job, if assigned.
    #[must_use]
    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    /// Whether a hook asked for the failure record to be suppressed.
    #[must_use]
    pub fn skip_failed_queue(&self) -> bool {
        self.skip_failed_queue.load(Ordering::Acquire)
    }

    /// Suppress the durable failure record for this job.
    ///
    /// Nothing in the core sets this; it exists for hooks that handle
    /// failures themselves (e.g. a retry hook re-enqueueing the job).
    pub fn set_skip_failed_queue(&self) {
        self.skip_failed_queue.store(true, Ordering::Release);
    }

    /// Flip the one-shot failure-hook flag, returning whether the hooks had
    /// already run.
    pub(crate) fn mark_failure_hooks_ran(&self) -> bool {
        self.failure_hooks_ran.swap(true, Ordering::AcqRel)
    }

    /// Requeue this job's payload with `generation + 1` and the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded or pushed.
    pub async fn recreate(&self, store: &dyn Store) -> Result<Payload, JobError> {
        let next = self.payload.next_generation();
        store.push(&self.queue, &next.encode()?).await?;
        Ok(next)
    }
}

/// Reserve the next job from `queue`, or `None` when it is empty.
///
/// # Errors
///
/// Returns an error if the pop fails or the entry does not decode.
pub async fn reserve(store: &dyn Store, queue: &str) -> Result<Option<Job>, JobError> {
    match store.pop(queue).await? {
        Some(raw) => Ok(Some(Job::new(queue, Payload::decode(&raw)?))),
        None => Ok(None),
    }
}

/// Remove queued jobs matching `class` (and `args`, when given) from
/// `queue`; returns the number removed.
///
/// Linear in queue length, and it decodes every entry, so it can be slow on
/// deep queues. Entries that do not decode are left in place.
///
/// # Errors
///
/// Returns an error on data store failure.
pub async fn destroy(
    store: &dyn Store,
    queue: &str,
    class: &str,
    args: Option<&[Value]>,
) -> Result<u64, JobError> {
    let mut removed = 0;
    let mut seen = HashSet::new();
    for raw in store.range(queue, 0, -1).await? {
        // An identical encoded form was already LREM'd in full.
        if !seen.insert(raw.clone()) {
            continue;
        }
        let Ok(payload) = Payload::decode(&raw) else {
            continue;
        };
        if payload.class != class {
            continue;
        }
        if let Some(args) = args {
            if payload.args != args {
                continue;
            }
        }
        removed += store.remove(queue, &raw).await?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_payload_round_trip() {
        let payload = Payload::new("UpdateGraph", vec![json!("a"), json!({"k": [1, 2]})]);
        let decoded = Payload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_fresh_id_is_32_hex_chars() {
        let payload = Payload::new("X", vec![]);
        assert_eq!(payload.id.len(), 32);
        assert!(payload.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(payload.generation, 1);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let payload = Payload::new("X", vec![json!({"b": 1, "a": 2})]);
        assert_eq!(payload.encode().unwrap(), payload.encode().unwrap());

        // Round-tripping must not change the encoded form either, or destroy
        // could never match what producers pushed.
        let round = Payload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(round.encode().unwrap(), payload.encode().unwrap());
    }

    #[test]
    fn test_wire_keys() {
        let payload = Payload::new("UpdateGraph", vec![json!(1)]);
        let value: Value = serde_json::from_str(&payload.encode().unwrap()).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("class"));
        assert!(object.contains_key("args"));
        assert!(object.contains_key("id"));
        assert!(object.contains_key("generation"));
    }

    #[tokio::test]
    async fn test_reserve_empty_queue() {
        let store = MemoryStore::new();
        assert!(reserve(&store, "empty").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recreate_keeps_id_bumps_generation() {
        let store = MemoryStore::new();
        let payload = Payload::new("X", vec![json!("a")]);
        store.push("q", &payload.encode().unwrap()).await.unwrap();

        let job = reserve(&store, "q").await.unwrap().unwrap();
        let next = job.recreate(&store).await.unwrap();

        assert_eq!(next.id, payload.id);
        assert_eq!(next.generation, 2);

        let requeued = reserve(&store, "q").await.unwrap().unwrap();
        assert_eq!(requeued.payload().id, payload.id);
        assert_eq!(requeued.payload().generation, 2);
    }

    #[tokio::test]
    async fn test_destroy_by_class_and_args() {
        let store = MemoryStore::new();
        let a = Payload::new("UpdateGraph", vec![json!("a")]);
        let b = Payload::new("UpdateGraph", vec![json!("b")]);
        store.push("q", &a.encode().unwrap()).await.unwrap();
        store.push("q", &b.encode().unwrap()).await.unwrap();

        let removed = destroy(&store, "q", "UpdateGraph", Some(&[json!("b")]))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        // The "a" job is untouched; destroying by class alone now drains it.
        assert_eq!(store.range("q", 0, -1).await.unwrap().len(), 1);
        let removed = destroy(&store, "q", "UpdateGraph", None).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.pop("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destroy_ignores_other_classes() {
        let store = MemoryStore::new();
        let keep = Payload::new("SendEmail", vec![]);
        store.push("q", &keep.encode().unwrap()).await.unwrap();

        assert_eq!(destroy(&store, "q", "UpdateGraph", None).await.unwrap(), 0);
        assert_eq!(store.range("q", 0, -1).await.unwrap().len(), 1);
    }

    #[test]
    fn test_skip_failed_queue_flag() {
        let job = Job::new("q", Payload::new("X", vec![]));
        assert!(!job.skip_failed_queue());
        job.set_skip_failed_queue();
        assert!(job.skip_failed_queue());
    }

    #[test]
    fn test_failure_hook_flag_is_one_shot() {
        let job = Job::new("q", Payload::new("X", vec![]));
        assert!(!job.mark_failure_hooks_ran());
        assert!(job.mark_failure_hooks_ran());
    }
}
