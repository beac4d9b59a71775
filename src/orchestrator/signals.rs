//! Termination analysis for worker processes.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// The process was already reaped elsewhere.
    Vanished,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Whether the process no longer runs.
    pub fn is_terminated(&self) -> bool {
        !matches!(self, Self::StillAlive)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            // The OOM killer and an operator's `kill -9` look the same here.
            Self::Signaled(Signal::SIGKILL) => {
                "killed by SIGKILL (possibly out of memory)".to_string()
            }
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Vanished => "reaped elsewhere".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),

        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),

        WaitStatus::StillAlive => TerminationReason::StillAlive,

        // Stopped or continued children are still alive.
        WaitStatus::Stopped(..) | WaitStatus::Continued(_) => TerminationReason::StillAlive,

        _ => TerminationReason::Unknown,
    }
}
