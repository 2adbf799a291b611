//! Child processor.
//!
//! A child reserves and executes up to K jobs, then exits so the supervisor
//! reforks it into a clean address space. One job runs at a time, on its own
//! task so TERM/USR1 can cancel it while the processor records the outcome.

use std::sync::Arc;
use std::time::Duration;

use super::procline;
use super::signals::ChildSignals;
use super::{WorkerError, WorkingPayload};
use crate::config::{ConfigError, WorkerConfig};
use crate::failure::{self, FailureRecord};
use crate::job::hooks::{self, Outcome};
use crate::job::registry::JobRegistry;
use crate::job::{self, Job, JobError};
use crate::queues::QueueResolver;
use crate::stats;
use crate::store::Store;

/// How often a paused child re-checks its flags.
const PAUSE_POLL: Duration = Duration::from_millis(250);

/// Reserves and executes jobs inside a forked worker process.
pub struct ChildProcessor {
    store: Arc<dyn Store>,
    registry: Arc<JobRegistry>,
    resolver: QueueResolver,
    worker_id: String,
    jobs_per_fork: u32,
    interval: Duration,
    procline_prefix: String,
}

impl ChildProcessor {
    /// Build a processor from explicit parts.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<JobRegistry>,
        resolver: QueueResolver,
        worker_id: impl Into<String>,
        jobs_per_fork: u32,
        interval: Duration,
        procline_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            resolver,
            worker_id: worker_id.into(),
            jobs_per_fork: jobs_per_fork.max(1),
            interval,
            procline_prefix: procline_prefix.into(),
        }
    }

    /// Build a processor from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured queue list does not resolve.
    pub fn from_config(
        store: Arc<dyn Store>,
        registry: Arc<JobRegistry>,
        config: &WorkerConfig,
        worker_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let resolver = QueueResolver::new(config.queues.clone())?;
        Ok(Self::new(
            store,
            registry,
            resolver,
            worker_id,
            config.jobs_per_fork,
            config.interval,
            config.procline_prefix.clone(),
        ))
    }

    /// Run the processing loop; returns how many jobs were executed.
    ///
    /// The child reconnects to the data store on entry so it never shares a
    /// connection with the process that spawned it. The loop ends after K
    /// jobs, on TERM/QUIT, or (with a zero interval) when the queues drain.
    ///
    /// # Errors
    ///
    /// Returns an error on data store failure; job failures are recorded and
    /// do not stop the loop.
    pub async fn run(&self, signals: ChildSignals) -> Result<u32, WorkerError> {
        self.store.reconnect().await?;

        let mut executed = 0;
        while executed < self.jobs_per_fork {
            let Some(job) = self.next_job(&signals).await? else {
                break;
            };
            self.process(job, &signals).await?;
            executed += 1;
            if signals.term_requested() || signals.quit_requested() {
                break;
            }
        }
        tracing::info!(worker = %self.worker_id, executed, "child processor exiting");
        Ok(executed)
    }

    /// Block until a job is reserved, or return `None` when the processor
    /// should exit instead (shutdown, or an empty pass in single-shot mode).
    async fn next_job(&self, signals: &ChildSignals) -> Result<Option<Job>, WorkerError> {
        loop {
            if signals.term_requested() || signals.quit_requested() {
                return Ok(None);
            }

            if signals.paused() {
                procline::set(&self.procline_prefix, &procline::State::Paused);
                let mut paused_rx = signals.paused_rx();
                tokio::select! {
                    _ = tokio::time::sleep(PAUSE_POLL) => {}
                    _ = async { let _ = paused_rx.wait_for(|paused| !*paused).await; } => {}
                }
                continue;
            }

            // Strict priority: first hit wins, later queues are not touched.
            let queues = self.resolver.resolve(self.store.as_ref()).await?;
            for queue in &queues {
                match job::reserve(self.store.as_ref(), queue).await {
                    Ok(Some(job)) => return Ok(Some(job)),
                    Ok(None) => {}
                    Err(JobError::Codec(err)) => {
                        tracing::warn!(%queue, error = %err, "dropping undecodable queue entry");
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            if self.interval.is_zero() {
                return Ok(None);
            }
            procline::set(&self.procline_prefix, &procline::State::Waiting { queues });
            let mut term_rx = signals.term_rx();
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = async { let _ = term_rx.wait_for(|term| *term).await; } => {}
            }
        }
    }

    /// Execute one job and record its outcome.
    async fn process(&self, mut job: Job, signals: &ChildSignals) -> Result<(), WorkerError> {
        job.set_worker(&self.worker_id);

        let run_at = self.store.server_time().await?;
        let working = WorkingPayload {
            queue: job.queue().to_string(),
            run_at,
            payload: job.payload().clone(),
        };
        self.store
            .set_payload(&self.worker_id, &working.encode()?)
            .await?;
        procline::set(
            &self.procline_prefix,
            &procline::State::Processing {
                queue: job.queue().to_string(),
                since: run_at.timestamp(),
                class: job.payload().class.clone(),
            },
        );

        let job = Arc::new(job);
        let registry = Arc::clone(&self.registry);
        let pipeline_job = Arc::clone(&job);
        let mut task =
            tokio::spawn(async move { hooks::run(registry.as_ref(), &pipeline_job).await });

        let mut term_rx = signals.term_rx();
        let mut abort_rx = signals.abort_rx();
        // Only USR1s delivered from here on abort this job.
        abort_rx.borrow_and_update();

        let result: Result<Outcome, JobError> = tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(err) if err.is_panic() => Err(JobError::failed("job handler panicked")),
                Err(_) => Err(JobError::Interrupted),
            },
            _ = async { let _ = term_rx.wait_for(|term| *term).await; } => {
                task.abort();
                let _ = (&mut task).await;
                Err(JobError::Terminated)
            }
            _ = abort_rx.changed() => {
                task.abort();
                let _ = (&mut task).await;
                Err(JobError::Interrupted)
            }
        };

        match result {
            Ok(Outcome::Performed) => {
                stats::incr_processed(self.store.as_ref(), &self.worker_id).await?;
                tracing::info!(
                    worker = %self.worker_id,
                    class = %job.payload().class,
                    job_id = %job.payload().id,
                    "job processed"
                );
            }
            Ok(Outcome::Aborted) => {
                tracing::debug!(
                    worker = %self.worker_id,
                    class = %job.payload().class,
                    job_id = %job.payload().id,
                    "job declined to run"
                );
            }
            Err(err) => {
                if job.skip_failed_queue() {
                    tracing::warn!(
                        worker = %self.worker_id,
                        job_id = %job.payload().id,
                        error = %err,
                        "job failed (failure record suppressed)"
                    );
                } else {
                    let failed_at = self.store.server_time().await?;
                    let record = FailureRecord::for_job(&job, &self.worker_id, &err, failed_at);
                    failure::record(self.store.as_ref(), &record).await?;
                    tracing::warn!(
                        worker = %self.worker_id,
                        job_id = %job.payload().id,
                        error = %err,
                        "job failed"
                    );
                }
                stats::incr_failed(self.store.as_ref(), &self.worker_id).await?;
            }
        }

        self.store.clear_payload(&self.worker_id).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ChildProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessor")
            .field("worker_id", &self.worker_id)
            .field("jobs_per_fork", &self.jobs_per_fork)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
