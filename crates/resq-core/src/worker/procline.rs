//! Process title handling.
//!
//! Titles follow `<PREFIX>resque-<VERSION>: <STATE>` so operators can see at
//! a glance what each worker process is doing. The full title goes to the
//! log; on Linux the kernel-visible name is additionally set (truncated, as
//! `PR_SET_NAME` allows 15 bytes).

/// Crate version baked into every title.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What a worker process is currently doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Supervisor is starting up.
    Starting,
    /// Supervisor finished fan-out.
    Forked {
        /// PIDs of the live children.
        pids: Vec<u32>,
        /// Unix epoch of the fork.
        at: i64,
    },
    /// Child is executing a job.
    Processing {
        /// Queue the job came from.
        queue: String,
        /// Unix epoch when execution started.
        since: i64,
        /// Job class name.
        class: String,
    },
    /// Child is polling for work.
    Waiting {
        /// The resolved queue list being polled.
        queues: Vec<String>,
    },
    /// Reservation is paused.
    Paused,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Forked { pids, at } => {
                let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
                write!(f, "Forked worker children {} at {at}", pids.join(","))
            }
            Self::Processing {
                queue,
                since,
                class,
            } => write!(f, "Processing {queue} since {since} [{class}]"),
            Self::Waiting { queues } => write!(f, "Waiting for {}", queues.join(",")),
            Self::Paused => write!(f, "Paused"),
        }
    }
}

/// Render the full title for `state`.
#[must_use]
pub fn format(prefix: &str, state: &State) -> String {
    format!("{prefix}resque-{VERSION}: {state}")
}

/// Update the process title.
pub fn set(prefix: &str, state: &State) {
    let title = format(prefix, state);
    tracing::debug!(procline = %title, "process title updated");

    #[cfg(target_os = "linux")]
    {
        let mut end = title.len().min(15);
        while !title.is_char_boundary(end) {
            end -= 1;
        }
        if let Ok(cname) = std::ffi::CString::new(&title[..end]) {
            let _ = nix::sys::prctl::set_name(&cname);
        }
    }
}
