//! Handles to forked worker processes.

use super::signals::{TerminationReason, analyze_wait_status};
use crate::segment::ResultKey;
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use tracing::warn;

/// A worker process and the result slot it publishes to.
#[derive(Debug)]
pub(crate) struct ChildHandle {
    pid: Pid,
    key: ResultKey,
    launched_at: Instant,
}

impl ChildHandle {
    pub fn new(pid: Pid, key: ResultKey) -> Self {
        Self {
            pid,
            key,
            launched_at: Instant::now(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn key(&self) -> ResultKey {
        self.key
    }

    pub fn elapsed(&self) -> Duration {
        self.launched_at.elapsed()
    }

    /// Reap the process if it has exited (non-blocking).
    ///
    /// Returns `None` while it is still running. A pid that is no longer
    /// our child counts as reaped.
    pub fn try_wait(&self) -> Option<TerminationReason> {
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return None,
                Ok(status) => {
                    let reason = analyze_wait_status(status);
                    return reason.is_terminated().then_some(reason);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Some(TerminationReason::Vanished),
                Err(e) => {
                    warn!(pid = %self.pid, error = %e, "waitpid failed; treating worker as reaped");
                    return Some(TerminationReason::Unknown);
                }
            }
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&self) -> TerminationReason {
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    let reason = analyze_wait_status(status);
                    if reason.is_terminated() {
                        return reason;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return TerminationReason::Vanished,
                Err(e) => {
                    warn!(pid = %self.pid, error = %e, "waitpid failed; treating worker as reaped");
                    return TerminationReason::Unknown;
                }
            }
        }
    }
}
