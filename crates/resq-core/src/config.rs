//! Worker configuration.
//!
//! Configuration comes from the environment (the `QUEUES`/`RESQUE_*`
//! variables every deployment already sets) or programmatically through the
//! builder. Validation happens at construction: a worker with no queues or
//! with `thread_count > 1` never starts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors, fatal at construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No queue was configured.
    #[error("no queue configured: set QUEUES/QUEUE or pass queues explicitly")]
    NoQueues,

    /// `thread_count` above 1 is reserved and rejected.
    #[error("thread_count {0} is not supported; each child executes one job at a time")]
    ThreadCount(u32),

    /// An environment variable did not parse.
    #[error("invalid value for {var}: {detail}")]
    Invalid {
        /// Variable name.
        var: String,
        /// What was wrong.
        detail: String,
    },

    /// A configured queue pattern is not a valid glob.
    #[error("invalid queue pattern '{pattern}': {detail}")]
    QueuePattern {
        /// The offending pattern.
        pattern: String,
        /// Parser detail.
        detail: String,
    },
}

/// Everything a supervisor and its children need to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Configured queue list, in priority order. May contain glob patterns.
    pub queues: Vec<String>,

    /// Number of child processors kept running (N).
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,

    /// Jobs a child executes before exiting so the supervisor reforks it (K).
    #[serde(default = "default_jobs_per_fork")]
    pub jobs_per_fork: u32,

    /// Reserved; must be 1.
    #[serde(default = "default_thread_count")]
    pub thread_count: u32,

    /// Seconds a TERM'd child gets to clean up before it is hard-killed.
    #[serde(default = "default_term_timeout")]
    pub term_timeout: f64,

    /// Sleep between reservation attempts and supervise-loop checks.
    /// Zero means single-shot: drain the queues once and exit.
    #[serde(default = "default_interval")]
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Cadence of the heartbeat loop; also the prune lock TTL.
    #[serde(default = "default_heartbeat_interval")]
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Heartbeats older than this mark a worker dead.
    #[serde(default = "default_prune_interval")]
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,

    /// Prefix prepended to the process title.
    #[serde(default)]
    pub procline_prefix: String,

    /// Data store URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Key namespace in the data store.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

const fn default_worker_count() -> u32 {
    1
}

const fn default_jobs_per_fork() -> u32 {
    1
}

const fn default_thread_count() -> u32 {
    1
}

const fn default_term_timeout() -> f64 {
    30.0
}

const fn default_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_prune_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_namespace() -> String {
    crate::store::DEFAULT_NAMESPACE.to_string()
}

impl WorkerConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }

    /// Build a configuration from the process environment.
    ///
    /// Recognized variables: `QUEUES`/`QUEUE` (comma-separated),
    /// `WORKER_COUNT`, `JOBS_PER_FORK`, `THREAD_COUNT`,
    /// `RESQUE_TERM_TIMEOUT`, `RESQUE_PROCLINE_PREFIX`, `REDIS_URL`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unparsable values, an empty queue list,
    /// or `THREAD_COUNT > 1`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::env_builder()?.build()
    }

    /// An environment-seeded builder, for callers that layer their own
    /// overrides (CLI flags) on top before building.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unparsable environment values.
    pub fn env_builder() -> Result<WorkerConfigBuilder, ConfigError> {
        let mut builder = Self::builder();

        if let Some(raw) = env_nonempty("QUEUES").or_else(|| env_nonempty("QUEUE")) {
            builder = builder.queues(raw.split(',').map(str::trim).filter(|q| !q.is_empty()));
        }
        if let Some(raw) = env_nonempty("WORKER_COUNT") {
            builder = builder.worker_count(parse_env("WORKER_COUNT", &raw)?);
        }
        if let Some(raw) = env_nonempty("JOBS_PER_FORK") {
            builder = builder.jobs_per_fork(parse_env("JOBS_PER_FORK", &raw)?);
        }
        if let Some(raw) = env_nonempty("THREAD_COUNT") {
            builder = builder.thread_count(parse_env("THREAD_COUNT", &raw)?);
        }
        if let Some(raw) = env_nonempty("RESQUE_TERM_TIMEOUT") {
            builder = builder.term_timeout(parse_term_timeout(&raw)?);
        }
        if let Some(prefix) = env_nonempty("RESQUE_PROCLINE_PREFIX") {
            builder = builder.procline_prefix(prefix);
        }
        if let Some(url) = env_nonempty("REDIS_URL") {
            builder = builder.redis_url(url);
        }

        Ok(builder)
    }

    /// The tracing directive implied by `VVERBOSE`/`VERBOSE`/`LOGGING`.
    #[must_use]
    pub fn log_directive() -> &'static str {
        if env_nonempty("VVERBOSE").is_some() {
            "debug"
        } else if env_nonempty("VERBOSE").is_some() || env_nonempty("LOGGING").is_some() {
            "info"
        } else {
            "warn"
        }
    }

    /// Whether `BACKGROUND` asks the worker to daemonize.
    #[must_use]
    pub fn background_requested() -> bool {
        env_nonempty("BACKGROUND").is_some()
    }

    /// Path from `PIDFILE`, if set.
    #[must_use]
    pub fn pidfile() -> Option<std::path::PathBuf> {
        env_nonempty("PIDFILE").map(std::path::PathBuf::from)
    }

    /// `term_timeout` as a [`Duration`] (clamped at zero).
    #[must_use]
    pub fn term_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.term_timeout.max(0.0))
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_env<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
        var: var.to_string(),
        detail: err.to_string(),
    })
}

/// `RESQUE_TERM_TIMEOUT` accepts float seconds, or `false`/`0` for an
/// immediate hard kill.
fn parse_term_timeout(raw: &str) -> Result<f64, ConfigError> {
    if raw.eq_ignore_ascii_case("false") {
        return Ok(0.0);
    }
    let value: f64 = parse_env("RESQUE_TERM_TIMEOUT", raw)?;
    Ok(value.max(0.0))
}

/// Builder for [`WorkerConfig`].
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    queues: Vec<String>,
    worker_count: Option<u32>,
    jobs_per_fork: Option<u32>,
    thread_count: Option<u32>,
    term_timeout: Option<f64>,
    interval: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    prune_interval: Option<Duration>,
    procline_prefix: Option<String>,
    redis_url: Option<String>,
    namespace: Option<String>,
}

impl WorkerConfigBuilder {
    /// Set the queue list (priority order, glob patterns allowed).
    #[must_use]
    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Set the child processor count.
    #[must_use]
    pub const fn worker_count(mut self, count: u32) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Set how many jobs a child executes before exiting.
    #[must_use]
    pub const fn jobs_per_fork(mut self, jobs: u32) -> Self {
        self.jobs_per_fork = Some(jobs);
        self
    }

    /// Set the reserved thread count (anything above 1 is rejected).
    #[must_use]
    pub const fn thread_count(mut self, threads: u32) -> Self {
        self.thread_count = Some(threads);
        self
    }

    /// Set the TERM grace period in seconds.
    #[must_use]
    pub const fn term_timeout(mut self, seconds: f64) -> Self {
        self.term_timeout = Some(seconds);
        self
    }

    /// Set the reservation/supervise sleep interval.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Set the heartbeat cadence.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Set the heartbeat age past which a worker counts as dead.
    #[must_use]
    pub const fn prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = Some(interval);
        self
    }

    /// Set the process title prefix.
    #[must_use]
    pub fn procline_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.procline_prefix = Some(prefix.into());
        self
    }

    /// Set the data store URL.
    #[must_use]
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Set the key namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoQueues`] when the queue list is empty,
    /// [`ConfigError::ThreadCount`] when `thread_count > 1`.
    pub fn build(self) -> Result<WorkerConfig, ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }
        let thread_count = self.thread_count.unwrap_or(default_thread_count());
        if thread_count > 1 {
            return Err(ConfigError::ThreadCount(thread_count));
        }
        Ok(WorkerConfig {
            queues: self.queues,
            worker_count: self.worker_count.unwrap_or(default_worker_count()).max(1),
            jobs_per_fork: self.jobs_per_fork.unwrap_or(default_jobs_per_fork()).max(1),
            thread_count: thread_count.max(1),
            term_timeout: self
                .term_timeout
                .unwrap_or(default_term_timeout())
                .max(0.0),
            interval: self.interval.unwrap_or(default_interval()),
            heartbeat_interval: self
                .heartbeat_interval
                .unwrap_or(default_heartbeat_interval()),
            prune_interval: self.prune_interval.unwrap_or(default_prune_interval()),
            procline_prefix: self.procline_prefix.unwrap_or_default(),
            redis_url: self.redis_url.unwrap_or_else(default_redis_url),
            namespace: self.namespace.unwrap_or_else(default_namespace),
        })
    }
}
