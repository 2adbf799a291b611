//! resq-worker - Redis-backed job worker
//!
//! The default invocation runs a supervisor: it registers a worker identity,
//! heartbeats, prunes dead peers, and keeps N child processors running. The
//! hidden `child` subcommand is what the supervisor spawns; each child
//! reserves and executes up to `jobs_per_fork` jobs, then exits so it is
//! reforked with a clean address space.
//!
//! # Fork Safety
//!
//! Daemonization (`BACKGROUND`) uses `fork()`, which is only sound while the
//! process is single-threaded. `#[tokio::main]` would spawn runtime worker
//! threads before our code runs, so this binary uses a synchronous `main()`
//! that daemonizes first and only then constructs the Tokio runtime.

mod jobs;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use resq_core::config::WorkerConfig;
use resq_core::store::{RedisStore, Store};
use resq_core::worker::child::ChildProcessor;
use resq_core::worker::pruner::SystemProcesses;
use resq_core::worker::signals::ChildSignals;
use resq_core::worker::supervisor::{ChildSpec, Supervisor};
use resq_core::worker::WorkerId;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// resq worker - supervises child processors that execute queued jobs
#[derive(Parser, Debug)]
#[command(name = "resq-worker")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Option<Mode>,

    /// Queues to watch, highest priority first (falls back to QUEUES/QUEUE)
    #[arg(long, value_delimiter = ',')]
    queues: Vec<String>,

    /// Seconds to sleep when every queue is empty (0 drains once and exits)
    #[arg(long, default_value_t = 5.0)]
    interval: f64,

    /// Number of child processors (falls back to WORKER_COUNT)
    #[arg(long)]
    worker_count: Option<u32>,

    /// Jobs a child executes before being reforked (falls back to JOBS_PER_FORK)
    #[arg(long)]
    jobs_per_fork: Option<u32>,

    /// Data store URL (falls back to REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run a single child processor. Spawned by the supervisor; not meant
    /// to be invoked by hand.
    #[command(hide = true)]
    Child {
        /// Identity of the owning supervisor.
        #[arg(long)]
        worker_id: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Children are spawned, never daemonized; only a foreground supervisor
    // asked to go to the background forks.
    let is_child = matches!(args.mode, Some(Mode::Child { .. }));
    if !is_child && WorkerConfig::background_requested() {
        daemonize().context("daemonization failed")?;
    }

    // Safe now: any fork() already happened while we were single-threaded.
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    init_tracing();

    let config = build_config(&args).context("invalid worker configuration")?;

    match &args.mode {
        Some(Mode::Child { worker_id }) => run_child(config, worker_id.clone()).await,
        None => run_supervisor(config).await,
    }
}

/// `RUST_LOG` wins; otherwise `VVERBOSE`/`VERBOSE`/`LOGGING` pick the level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(WorkerConfig::log_directive()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Environment first, CLI flags override.
fn build_config(args: &Args) -> Result<WorkerConfig> {
    let mut builder = WorkerConfig::env_builder()?;
    if !args.queues.is_empty() {
        builder = builder.queues(args.queues.clone());
    }
    if let Some(count) = args.worker_count {
        builder = builder.worker_count(count);
    }
    if let Some(jobs) = args.jobs_per_fork {
        builder = builder.jobs_per_fork(jobs);
    }
    if let Some(url) = &args.redis_url {
        builder = builder.redis_url(url);
    }
    builder = builder.interval(Duration::from_secs_f64(args.interval.max(0.0)));
    Ok(builder.build()?)
}

fn open_store(config: &WorkerConfig) -> Result<Arc<dyn Store>> {
    let store = RedisStore::open_with_namespace(&config.redis_url, &config.namespace)
        .context("could not open data store")?;
    Ok(Arc::new(store))
}

async fn run_supervisor(config: WorkerConfig) -> Result<()> {
    let store = open_store(&config)?;
    let id = WorkerId::local(config.queues.clone())?;

    let exe = std::env::current_exe().context("could not resolve worker binary path")?;
    let spec = ChildSpec::builder()
        .program(exe)
        .args(child_args(&config, &id))
        .build();

    let pid_path = WorkerConfig::pidfile();
    if let Some(path) = &pid_path {
        write_pid_file(path)?;
    }

    info!(
        worker = %id,
        queues = ?config.queues,
        worker_count = config.worker_count,
        jobs_per_fork = config.jobs_per_fork,
        "starting supervisor (pid: {})",
        std::process::id()
    );

    let mut supervisor = Supervisor::new(
        config,
        id,
        store,
        spec,
        Arc::new(SystemProcesses::for_current_exe()),
    );
    let outcome = supervisor.work().await;

    if let Some(path) = &pid_path {
        remove_pid_file(path);
    }
    outcome.context("supervisor exited with an error")?;
    info!("supervisor shutdown complete");
    Ok(())
}

async fn run_child(config: WorkerConfig, worker_id: String) -> Result<()> {
    let store = open_store(&config)?;
    let registry = Arc::new(jobs::registry());
    let processor = ChildProcessor::from_config(store, registry, &config, worker_id)?;
    let (signals, _driver) = ChildSignals::install()?;

    processor.run(signals).await.context("child processor failed")?;
    Ok(())
}

/// Argument list a spawned child is started with. Everything else (the
/// `RESQUE_*` family, `REDIS_URL`) is inherited through the environment.
fn child_args(config: &WorkerConfig, id: &WorkerId) -> Vec<String> {
    vec![
        "--queues".to_string(),
        config.queues.join(","),
        "--interval".to_string(),
        config.interval.as_secs_f64().to_string(),
        "--jobs-per-fork".to_string(),
        config.jobs_per_fork.to_string(),
        "--redis-url".to_string(),
        config.redis_url.clone(),
        "child".to_string(),
        "--worker-id".to_string(),
        id.to_string(),
    ]
}

fn write_pid_file(path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    info!("PID file written to {:?}", path);
    Ok(())
}

fn remove_pid_file(path: &PathBuf) {
    if path.exists() {
        if let Err(err) = std::fs::remove_file(path) {
            warn!("failed to remove PID file: {err}");
        }
    }
}

/// Double-fork/setsid daemonization.
///
/// Must be called before the Tokio runtime exists: `fork()` duplicates only
/// the calling thread, and a mutex held by any other thread would stay
/// locked forever in the child.
#[cfg(unix)]
#[allow(unsafe_code)] // fork() requires unsafe
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: no runtime and no worker threads exist yet; the process is
    // single-threaded, so forking cannot strand a locked mutex.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    // New session: drop the controlling terminal.
    setsid()?;

    // SAFETY: still single-threaded; see above. The second fork keeps the
    // daemon from ever reacquiring a terminal.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    std::env::set_current_dir("/")?;
    Ok(())
}

#[cfg(not(unix))]
fn daemonize() -> Result<()> {
    // No daemon support here; run in the foreground instead.
    eprintln!("BACKGROUND is not supported on this platform; running in foreground");
    Ok(())
}
