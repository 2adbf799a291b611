//! Producer-side front door.
//!
//! Producers enqueue through a [`Client`] rather than touching the store
//! directly. The optional inline mode executes jobs synchronously in the
//! caller, for tests that want enqueue-and-assert without a worker fleet.

use std::sync::Arc;

use serde_json::Value;

use crate::job::registry::JobRegistry;
use crate::job::{self, hooks, Job, JobError, Payload};
use crate::store::Store;

/// Enqueues, destroys, and (inline) executes jobs.
pub struct Client {
    store: Arc<dyn Store>,
    registry: Arc<JobRegistry>,
    inline: bool,
}

impl Client {
    /// Build a client over `store`, resolving classes against `registry`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, registry: Arc<JobRegistry>) -> Self {
        Self {
            store,
            registry,
            inline: false,
        }
    }

    /// Toggle inline mode: `create` executes immediately in the caller
    /// instead of pushing.
    #[must_use]
    pub fn inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }

    /// Build a payload with a fresh id and generation 1, then either push it
    /// to `queue` or, in inline mode, execute it right now.
    ///
    /// Inline execution re-encodes and re-decodes the args first, so the
    /// performed payload matches what a worker would have been delivered;
    /// semantic drift between the two paths shows up in tests instead of
    /// production.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the push fails, or (inline) whatever
    /// the pipeline raises.
    pub async fn create(
        &self,
        queue: &str,
        class: &str,
        args: Vec<Value>,
    ) -> Result<Payload, JobError> {
        let payload = Payload::new(class, args);
        if self.inline {
            let delivered = Payload::decode(&payload.encode()?)?;
            let job = Arc::new(Job::new(queue, delivered));
            hooks::run(self.registry.as_ref(), &job).await?;
        } else {
            self.store.push(queue, &payload.encode()?).await?;
            tracing::debug!(queue, class, job_id = %payload.id, "job enqueued");
        }
        Ok(payload)
    }

    /// Remove queued jobs matching `class` (and `args`, when given); returns
    /// the number removed. See [`job::destroy`] for the cost caveat.
    ///
    /// # Errors
    ///
    /// Returns an error on data store failure.
    pub async fn destroy(
        &self,
        queue: &str,
        class: &str,
        args: Option<&[Value]>,
    ) -> Result<u64, JobError> {
        job::destroy(self.store.as_ref(), queue, class, args).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("inline", &self.inline)
            .finish_non_exhaustive()
    }
}
