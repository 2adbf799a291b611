//! Signal plumbing for supervisor and child processes.
//!
//! Handlers never do work: the tokio signal driver only marks a flag or
//! channel, and the runtime loops act on what they observe. Signals that the
//! host platform cannot deliver are logged at warn and skipped, except TERM
//! and INT which every supported platform must provide.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::WorkerError;

/// Signals the supervisor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorSignal {
    /// Shut down now; grace period then hard kill.
    Term,
    /// Same as TERM.
    Int,
    /// Shut down once current jobs finish.
    Quit,
    /// Abort the running jobs, keep going; also un-pauses.
    Usr1,
    /// Pause reservation.
    Usr2,
    /// Resume reservation.
    Cont,
}

fn required(kind: SignalKind, name: &str) -> Result<Signal, WorkerError> {
    signal(kind).map_err(|err| WorkerError::Signal(format!("cannot install {name} handler: {err}")))
}

fn optional(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::warn!(signal = name, error = %err, "signal unavailable on this platform");
            None
        }
    }
}

fn sigcont_kind() -> SignalKind {
    SignalKind::from_raw(nix::sys::signal::Signal::SIGCONT as i32)
}

/// Wait for the next delivery on an optional stream; pends forever when the
/// stream is unavailable or closed.
async fn next_signal(stream: &mut Option<Signal>) {
    match stream {
        Some(stream) => {
            if stream.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// The supervisor's set of signal streams.
pub struct SupervisorSignals {
    term: Option<Signal>,
    int: Option<Signal>,
    quit: Option<Signal>,
    usr1: Option<Signal>,
    usr2: Option<Signal>,
    cont: Option<Signal>,
}

impl SupervisorSignals {
    /// Install handlers for TERM, INT, QUIT, USR1, USR2, CONT.
    ///
    /// # Errors
    ///
    /// Returns an error only if TERM or INT cannot be installed.
    pub fn install() -> Result<Self, WorkerError> {
        Ok(Self {
            term: Some(required(SignalKind::terminate(), "TERM")?),
            int: Some(required(SignalKind::interrupt(), "INT")?),
            quit: optional(SignalKind::quit(), "QUIT"),
            usr1: optional(SignalKind::user_defined1(), "USR1"),
            usr2: optional(SignalKind::user_defined2(), "USR2"),
            cont: optional(sigcont_kind(), "CONT"),
        })
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> SupervisorSignal {
        tokio::select! {
            _ = next_signal(&mut self.term) => SupervisorSignal::Term,
            _ = next_signal(&mut self.int) => SupervisorSignal::Int,
            _ = next_signal(&mut self.quit) => SupervisorSignal::Quit,
            _ = next_signal(&mut self.usr1) => SupervisorSignal::Usr1,
            _ = next_signal(&mut self.usr2) => SupervisorSignal::Usr2,
            _ = next_signal(&mut self.cont) => SupervisorSignal::Cont,
        }
    }
}

impl std::fmt::Debug for SupervisorSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorSignals").finish_non_exhaustive()
    }
}

/// Flag view of the signals a child processor acts on.
///
/// Cheap to clone; every clone observes the same flags. The loops read the
/// flags between jobs and select on the receivers while a job runs.
#[derive(Debug, Clone)]
pub struct ChildSignals {
    term: watch::Receiver<bool>,
    quit: watch::Receiver<bool>,
    paused: watch::Receiver<bool>,
    abort: watch::Receiver<u32>,
}

impl ChildSignals {
    /// Build a detached flag set plus the control half that drives it.
    /// Used by tests and by [`ChildSignals::install`].
    #[must_use]
    pub fn channel() -> (ChildSignalControl, Self) {
        let (term_tx, term) = watch::channel(false);
        let (quit_tx, quit) = watch::channel(false);
        let (paused_tx, paused) = watch::channel(false);
        let (abort_tx, abort) = watch::channel(0);
        (
            ChildSignalControl {
                term: term_tx,
                quit: quit_tx,
                paused: paused_tx,
                abort: abort_tx,
            },
            Self {
                term,
                quit,
                paused,
                abort,
            },
        )
    }

    /// Install OS handlers and spawn the driver task translating deliveries
    /// into flag updates.
    ///
    /// # Errors
    ///
    /// Returns an error only if TERM or INT cannot be installed.
    pub fn install() -> Result<(Self, JoinHandle<()>), WorkerError> {
        let (control, flags) = Self::channel();

        let mut term = Some(required(SignalKind::terminate(), "TERM")?);
        let mut int = Some(required(SignalKind::interrupt(), "INT")?);
        let mut quit = optional(SignalKind::quit(), "QUIT");
        let mut usr1 = optional(SignalKind::user_defined1(), "USR1");
        let mut usr2 = optional(SignalKind::user_defined2(), "USR2");
        let mut cont = optional(sigcont_kind(), "CONT");

        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = next_signal(&mut term) => control.term(),
                    _ = next_signal(&mut int) => control.term(),
                    _ = next_signal(&mut quit) => control.quit(),
                    _ = next_signal(&mut usr1) => control.abort_job(),
                    _ = next_signal(&mut usr2) => control.pause(),
                    _ = next_signal(&mut cont) => control.resume(),
                }
            }
        });

        Ok((flags, driver))
    }

    /// TERM/INT was delivered: abort the running job and exit.
    #[must_use]
    pub fn term_requested(&self) -> bool {
        *self.term.borrow()
    }

    /// QUIT was delivered: finish the current job, then exit.
    #[must_use]
    pub fn quit_requested(&self) -> bool {
        *self.quit.borrow()
    }

    /// USR2 was delivered and no CONT/USR1 since: stop reserving.
    #[must_use]
    pub fn paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// A receiver that resolves when TERM arrives.
    #[must_use]
    pub fn term_rx(&self) -> watch::Receiver<bool> {
        self.term.clone()
    }

    /// A receiver that ticks on each USR1.
    #[must_use]
    pub fn abort_rx(&self) -> watch::Receiver<u32> {
        self.abort.clone()
    }

    /// A receiver over the paused flag.
    #[must_use]
    pub fn paused_rx(&self) -> watch::Receiver<bool> {
        self.paused.clone()
    }
}

/// Sender half used by the signal driver (and tests) to flip child flags.
#[derive(Debug)]
pub struct ChildSignalControl {
    term: watch::Sender<bool>,
    quit: watch::Sender<bool>,
    paused: watch::Sender<bool>,
    abort: watch::Sender<u32>,
}

impl ChildSignalControl {
    /// TERM/INT: exit after aborting the running job.
    pub fn term(&self) {
        let _ = self.term.send(true);
    }

    /// QUIT: exit after the current job.
    pub fn quit(&self) {
        let _ = self.quit.send(true);
    }

    /// USR2: stop taking new jobs.
    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    /// CONT: resume taking jobs.
    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }

    /// USR1: abort the running job, keep reserving; also un-pauses.
    pub fn abort_job(&self) {
        self.abort.send_modify(|count| *count += 1);
        let _ = self.paused.send(false);
    }
}
