//! Supervisor process.
//!
//! The supervisor owns the worker identity. It registers, heartbeats, and
//! prunes; it spawns N child processor processes and refills the pool as
//! children exit; and it fans incoming signals out to the children,
//! escalating TERM to a hard kill when the grace period runs out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use super::heartbeat::HeartbeatLoop;
use super::procline;
use super::pruner::{self, ProcessList};
use super::signals::{SupervisorSignal, SupervisorSignals};
use super::{register, unregister, WorkerError, WorkerId};
use crate::config::WorkerConfig;
use crate::store::Store;

/// How a child processor is launched.
///
/// The worker binary points this at itself with a `child` argument; tests
/// point it anywhere.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ChildSpec {
    /// Start building a spec.
    #[must_use]
    pub fn builder() -> ChildSpecBuilder {
        ChildSpecBuilder::default()
    }

    /// The program that will be spawned.
    #[must_use]
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(false);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Builder for [`ChildSpec`].
#[derive(Debug, Default)]
pub struct ChildSpecBuilder {
    program: Option<PathBuf>,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ChildSpecBuilder {
    /// Set the program to spawn.
    #[must_use]
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Set the argument list.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Build the spec.
    ///
    /// # Panics
    ///
    /// Panics if no program was set.
    #[must_use]
    pub fn build(self) -> ChildSpec {
        ChildSpec {
            program: self.program.expect("program is required"),
            args: self.args,
            envs: self.envs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    None,
    KillAfterGrace,
    AwaitChildren,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Directive {
    forward: Option<Signal>,
    escalation: Escalation,
}

/// The long-running parent process that owns a worker identity.
pub struct Supervisor {
    config: WorkerConfig,
    id: WorkerId,
    store: Arc<dyn Store>,
    spec: ChildSpec,
    processes: Arc<dyn ProcessList>,
    children: HashMap<u32, Child>,
    shutdown: bool,
    paused: bool,
}

impl Supervisor {
    /// Build a supervisor. `spec` launches one child processor; `processes`
    /// feeds the pruner's PID check.
    #[must_use]
    pub fn new(
        config: WorkerConfig,
        id: WorkerId,
        store: Arc<dyn Store>,
        spec: ChildSpec,
        processes: Arc<dyn ProcessList>,
    ) -> Self {
        Self {
            config,
            id,
            store,
            spec,
            processes,
            children: HashMap::new(),
            shutdown: false,
            paused: false,
        }
    }

    /// The identity this supervisor registers under.
    #[must_use]
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// PIDs of the live children.
    #[must_use]
    pub fn child_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.children.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Run the worker until shutdown.
    ///
    /// Startup installs signal handlers, starts the heartbeat loop, prunes
    /// dead peers, registers the identity, and fans out the children. The
    /// supervise loop then reaps and reforks until a shutdown signal (or,
    /// with a zero interval, until the single-shot children drain and exit).
    /// Teardown always runs; a teardown failure after a supervise failure
    /// surfaces both.
    ///
    /// # Errors
    ///
    /// Returns the supervise error, the teardown error, or both combined.
    pub async fn work(&mut self) -> Result<(), WorkerError> {
        let mut signals = SupervisorSignals::install()?;
        let heartbeat = HeartbeatLoop::start(
            Arc::clone(&self.store),
            &self.id,
            self.config.heartbeat_interval,
        );

        let run = self.startup_and_supervise(&mut signals).await;

        let teardown = unregister(self.store.as_ref(), &self.id, None).await;
        heartbeat.stop().await;

        match (run, teardown) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Err(err)) => Err(err),
            (Err(cause), Err(error)) => Err(WorkerError::Teardown {
                error: Box::new(error),
                cause: Box::new(cause),
            }),
        }
    }

    async fn startup_and_supervise(
        &mut self,
        signals: &mut SupervisorSignals,
    ) -> Result<(), WorkerError> {
        pruner::prune_dead_workers(
            self.store.as_ref(),
            &self.id,
            self.config.heartbeat_interval,
            self.config.prune_interval,
            self.processes.as_ref(),
        )
        .await?;
        register(self.store.as_ref(), &self.id).await?;
        procline::set(&self.config.procline_prefix, &procline::State::Starting);

        for _ in 0..self.config.worker_count {
            self.spawn_child().await?;
        }
        self.set_forked_procline();
        tracing::info!(
            worker = %self.id,
            children = ?self.child_pids(),
            "supervisor running"
        );

        if self.config.interval.is_zero() {
            self.supervise_single_shot(signals).await
        } else {
            self.supervise(signals).await
        }
    }

    async fn supervise(&mut self, signals: &mut SupervisorSignals) -> Result<(), WorkerError> {
        while !self.shutdown {
            tokio::select! {
                sig = signals.recv() => self.handle_signal(sig).await,
                _ = tokio::time::sleep(self.config.interval) => {
                    self.reap_children();
                    self.respawn_missing().await?;
                }
            }
        }
        Ok(())
    }

    /// Single-shot mode: no reforking, just wait for the fan-out to drain
    /// the queues and exit.
    async fn supervise_single_shot(
        &mut self,
        signals: &mut SupervisorSignals,
    ) -> Result<(), WorkerError> {
        loop {
            self.reap_children();
            if self.children.is_empty() || self.shutdown {
                return Ok(());
            }
            tokio::select! {
                sig = signals.recv() => self.handle_signal(sig).await,
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    /// Flag updates and fan-out for one signal. The handler itself never
    /// touches the data store.
    async fn handle_signal(&mut self, sig: SupervisorSignal) {
        tracing::info!(signal = ?sig, "supervisor received signal");
        let directive = self.transition(sig);
        if let Some(forward) = directive.forward {
            self.forward_to_children(forward);
        }
        match directive.escalation {
            Escalation::None => {}
            Escalation::KillAfterGrace => self.kill_children_after_grace().await,
            Escalation::AwaitChildren => self.await_children().await,
        }
        match sig {
            SupervisorSignal::Usr2 => {
                procline::set(&self.config.procline_prefix, &procline::State::Paused);
            }
            SupervisorSignal::Cont | SupervisorSignal::Usr1 => self.set_forked_procline(),
            _ => {}
        }
    }

    fn transition(&mut self, sig: SupervisorSignal) -> Directive {
        match sig {
            SupervisorSignal::Term | SupervisorSignal::Int => {
                self.shutdown = true;
                Directive {
                    forward: Some(Signal::SIGTERM),
                    escalation: Escalation::KillAfterGrace,
                }
            }
            SupervisorSignal::Quit => {
                self.shutdown = true;
                Directive {
                    forward: Some(Signal::SIGQUIT),
                    escalation: Escalation::AwaitChildren,
                }
            }
            SupervisorSignal::Usr1 => {
                self.paused = false;
                Directive {
                    forward: Some(Signal::SIGUSR1),
                    escalation: Escalation::None,
                }
            }
            SupervisorSignal::Usr2 => {
                self.paused = true;
                Directive {
                    forward: Some(Signal::SIGUSR2),
                    escalation: Escalation::None,
                }
            }
            SupervisorSignal::Cont => {
                self.paused = false;
                Directive {
                    forward: Some(Signal::SIGCONT),
                    escalation: Escalation::None,
                }
            }
        }
    }

    fn forward_to_children(&self, sig: Signal) {
        for pid in self.children.keys() {
            if let Err(err) = nix::sys::signal::kill(Pid::from_raw(*pid as i32), sig) {
                // The child may have exited between reaps.
                tracing::warn!(pid, signal = %sig, error = %err, "could not forward signal");
            }
        }
    }

    async fn spawn_child(&mut self) -> Result<(), WorkerError> {
        let child = self
            .spec
            .command()
            .spawn()
            .map_err(WorkerError::Spawn)?;
        let Some(pid) = child.id() else {
            return Err(WorkerError::Spawn(std::io::Error::other(
                "child exited before its pid could be read",
            )));
        };
        tracing::info!(pid, "spawned child processor");
        if self.paused {
            // A child forked during a pause starts paused too.
            let _ = nix::sys::signal::kill(Pid::from_raw(pid as i32), Signal::SIGUSR2);
        }
        self.children.insert(pid, child);
        Ok(())
    }

    /// Reap every child that has exited; never blocks.
    fn reap_children(&mut self) {
        let mut exited = Vec::new();
        for (pid, child) in &mut self.children {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(pid, %status, "reaped child processor");
                    exited.push(*pid);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(pid, error = %err, "could not poll child; dropping it");
                    exited.push(*pid);
                }
            }
        }
        for pid in exited {
            self.children.remove(&pid);
        }
    }

    /// Keep the pool at N children until shutdown.
    async fn respawn_missing(&mut self) -> Result<(), WorkerError> {
        if self.shutdown {
            return Ok(());
        }
        let missing = (self.config.worker_count as usize).saturating_sub(self.children.len());
        for _ in 0..missing {
            self.spawn_child().await?;
        }
        if missing > 0 {
            self.set_forked_procline();
        }
        Ok(())
    }

    /// TERM escalation: give the children the grace period, then hard-kill
    /// whatever is still alive. A zero grace kills immediately.
    async fn kill_children_after_grace(&mut self) {
        let grace = self.config.term_timeout_duration();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            self.reap_children();
            if self.children.is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for (pid, child) in &mut self.children {
            tracing::warn!(pid, "child outlived the grace period; killing");
            let _ = child.start_kill();
        }
        self.await_children().await;
    }

    /// QUIT escalation: children finish their current job on their own time.
    async fn await_children(&mut self) {
        loop {
            self.reap_children();
            if self.children.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn set_forked_procline(&self) {
        procline::set(
            &self.config.procline_prefix,
            &procline::State::Forked {
                pids: self.child_pids(),
                at: chrono::Utc::now().timestamp(),
            },
        );
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("id", &self.id.to_string())
            .field("children", &self.child_pids())
            .field("shutdown", &self.shutdown)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}
