//! Fork-based task orchestration.
//!
//! An [`Orchestrator`] owns one shared memory segment and the workers that
//! publish into it. Each [`run`](Orchestrator::run) reserves a result slot,
//! forks, and hands back a [`Promise`] for the slot. The worker runs the
//! task, stores the outcome and exits without returning to the caller.
//!
//! # Lifecycle
//!
//! - The segment is created by the first `run`, not by `new`.
//! - Finished workers are collected by [`reap`](Orchestrator::reap) or
//!   [`wait_for_children`](Orchestrator::wait_for_children). Reaping a
//!   worker that never published fails its slot with
//!   [`ErrorCode::WorkerDied`], so its promise stops waiting.
//! - [`shutdown`](Orchestrator::shutdown) (also run on drop in the
//!   orchestrating process) waits for all workers and removes the segment.

mod child;
mod interrupt;
mod keys;
mod signals;
mod worker;

pub use signals::TerminationReason;
pub use worker::{EXIT_NO_SEGMENT, EXIT_OK, EXIT_TASK_FAILED, EXIT_UNSTORED};

use crate::config::OrchestratorConfig;
use crate::error::{ForkFutError, Result};
use crate::payload::ErrorCode;
use crate::promise::Promise;
use crate::runtime;
use crate::segment::{ReserveError, ResultKey, Segment, SegmentStats, SegmentToken, TokenLock};
use child::ChildHandle;
use keys::KeyGenerator;
use nix::unistd::{ForkResult, fork};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// Launches tasks in forked workers and tracks them until they exit.
#[derive(Debug)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    segment: Option<Arc<Segment>>,
    token: Option<SegmentToken>,
    token_lock: Option<TokenLock>,
    keys: KeyGenerator,
    children: Vec<ChildHandle>,
    removed: bool,
}

impl Orchestrator {
    /// Create an orchestrator. No segment exists until the first `run`.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let keys = KeyGenerator::new(config.key_bound);
        Ok(Self {
            config,
            segment: None,
            token: None,
            token_lock: None,
            keys,
            children: Vec::new(),
            removed: false,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run `task` in a new worker process.
    ///
    /// The returned promise resolves to the task's value, to void for `()`
    /// or `None`, or to an error code when the task returns `Err`, panics,
    /// or its worker dies.
    ///
    /// Fails without forking when every result slot is held by an
    /// unreleased promise or when the segment cannot be created.
    pub fn run<T, E, F>(&mut self, task: F) -> Result<Promise<T>>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        T: Serialize + DeserializeOwned,
        E: Display,
    {
        let segment = self.ensure_segment()?;
        let key = self.reserve_key(&segment)?;

        // SAFETY: the child only runs the task against its own mapping of
        // the segment and leaves through `_exit`; it never returns here.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                debug!(pid = %child, key = %key, "Forked worker");
                self.children.push(ChildHandle::new(child, key));
                Ok(Promise::new(key, segment, self.config.poll_interval))
            }
            Ok(ForkResult::Child) => {
                runtime::mark_child();
                worker::reset_signal_handlers();
                let status = worker::run_task(segment.key(), key, task);
                // SAFETY: `_exit` ends the process without running atexit
                // hooks or flushing stdio buffers copied from the parent.
                unsafe { nix::libc::_exit(status) }
            }
            Err(e) => {
                segment.remove_slot(key);
                warn!(key = %key, error = %e, "fork failed");
                Err(ForkFutError::Launch(e))
            }
        }
    }

    /// Collect workers that have exited, without blocking.
    ///
    /// Returns how many were collected.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        let mut index = 0;
        while index < self.children.len() {
            match self.children[index].try_wait() {
                Some(reason) => {
                    let child = self.children.swap_remove(index);
                    self.record_exit(&child, &reason);
                    reaped += 1;
                }
                None => index += 1,
            }
        }
        if reaped > 0 {
            trace!(reaped, remaining = self.children.len(), "Reaped workers");
        }
        reaped
    }

    /// Block until every worker launched by this orchestrator has exited.
    #[instrument(level = "debug", skip(self), fields(children = self.children.len()))]
    pub fn wait_for_children(&mut self) {
        for child in std::mem::take(&mut self.children) {
            let reason = child.wait();
            self.record_exit(&child, &reason);
        }
    }

    /// Number of launched workers not yet reaped.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Remove the segment and its transient token file.
    ///
    /// Does nothing in a worker process. Fails while workers are still
    /// running, since they could not publish afterwards. Promises that are
    /// still pending resolve to [`ErrorCode::SegmentRemoved`]; later calls
    /// to `run` fail with [`ForkFutError::SegmentRemoved`].
    pub fn remove_segment(&mut self) -> Result<()> {
        if runtime::is_child() {
            trace!("Segment removal skipped in worker");
            return Ok(());
        }

        self.reap();
        if !self.children.is_empty() {
            return Err(ForkFutError::ChildrenStillRunning(self.children.len()));
        }

        self.removed = true;
        if let Some(segment) = self.segment.take() {
            interrupt::unregister(segment.name());
            segment.unlink()?;
            info!(name = %segment.name(), "Removed segment");
        }
        self.token_lock = None;
        if let Some(token) = self.token.take() {
            token.remove()?;
        }
        Ok(())
    }

    /// Wait for all workers, then remove the segment.
    #[instrument(level = "debug", skip(self))]
    pub fn shutdown(&mut self) -> Result<()> {
        if runtime::is_child() {
            return Ok(());
        }
        self.wait_for_children();
        self.remove_segment()
    }

    /// Usage figures for the segment, once it exists.
    pub fn segment_stats(&self) -> Option<SegmentStats> {
        self.segment.as_ref().map(|segment| segment.stats())
    }

    fn ensure_segment(&mut self) -> Result<Arc<Segment>> {
        if self.removed {
            return Err(ForkFutError::SegmentRemoved);
        }
        if let Some(segment) = &self.segment {
            return Ok(Arc::clone(segment));
        }

        let token = self.config.token()?;
        let lock = token.lock()?;
        let segment = Segment::create(
            token.key()?,
            self.config.segment_size,
            self.config.slot_capacity,
        )?;
        info!(
            name = %segment.name(),
            size = %self.config.segment_size,
            slots = self.config.slot_capacity,
            "Created segment"
        );

        if self.config.drain_on_interrupt {
            let transient = token.is_transient().then(|| token.path().to_path_buf());
            if let Err(e) = interrupt::register(segment.name(), transient) {
                if let Err(unlink) = segment.unlink() {
                    warn!(name = %segment.name(), error = %unlink, "Failed to remove segment");
                }
                drop(lock);
                if let Err(remove) = token.remove() {
                    warn!(error = %remove, "Failed to remove token file");
                }
                return Err(e);
            }
        }

        let segment = Arc::new(segment);
        self.segment = Some(Arc::clone(&segment));
        self.token_lock = Some(lock);
        self.token = Some(token);
        Ok(segment)
    }

    /// Take the next key whose slot is free and reserve it.
    fn reserve_key(&mut self, segment: &Segment) -> Result<ResultKey> {
        let capacity = self.config.slot_capacity;
        // Occupied keys are held by live promises; there are at most
        // `capacity` of them, so one more attempt must hit a free key.
        for _ in 0..=capacity {
            let key = self.keys.next_key();
            match segment.reserve(key) {
                Ok(()) => return Ok(key),
                Err(ReserveError::Occupied) => trace!(key = %key, "Key still in use, skipping"),
                Err(ReserveError::TableFull) => {
                    return Err(ForkFutError::ResultSlotsExhausted { capacity });
                }
                Err(ReserveError::Removed) => return Err(ForkFutError::SegmentRemoved),
            }
        }
        Err(ForkFutError::ResultSlotsExhausted { capacity })
    }

    fn record_exit(&self, child: &ChildHandle, reason: &TerminationReason) {
        let unpublished = self
            .segment
            .as_ref()
            .is_some_and(|segment| segment.fail(child.key(), ErrorCode::WorkerDied));

        if unpublished {
            warn!(
                pid = %child.pid(),
                key = %child.key(),
                reason = %reason,
                "Worker exited without publishing a result"
            );
        } else if !reason.is_success() {
            debug!(
                pid = %child.pid(),
                key = %child.key(),
                reason = %reason,
                elapsed_ms = child.elapsed().as_millis() as u64,
                "Worker exited"
            );
        } else {
            trace!(
                pid = %child.pid(),
                key = %child.key(),
                elapsed_ms = child.elapsed().as_millis() as u64,
                "Worker finished"
            );
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if runtime::is_child() || self.removed {
            return;
        }
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Failed to shut down orchestrator");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySize;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> OrchestratorConfig {
        OrchestratorConfig::new()
            .with_segment_size(MemorySize::from_kib(256))
            .with_slot_capacity(8)
            .with_token_dir(dir)
    }

    #[test]
    fn test_new_does_not_create_segment() {
        let dir = tempdir().unwrap();
        let orchestrator = Orchestrator::new(config(dir.path())).unwrap();
        assert!(orchestrator.segment_stats().is_none());
        assert_eq!(orchestrator.child_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let err = Orchestrator::new(config(dir.path()).with_slot_capacity(0)).unwrap_err();
        assert!(matches!(err, ForkFutError::Config(_)));
    }

    #[test]
    fn test_reserve_key_skips_occupied() {
        let dir = tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(config(dir.path()).with_key_bound(8)).unwrap();
        let segment = orchestrator.ensure_segment().unwrap();

        // Keys 0..7 in use; release 3 and wrap around to it.
        for raw in 0..8 {
            segment.reserve(ResultKey::new(raw)).unwrap();
        }
        orchestrator.keys = KeyGenerator::new(8);
        segment.remove_slot(ResultKey::new(3));

        assert_eq!(orchestrator.reserve_key(&segment).unwrap(), ResultKey::new(3));
        assert!(matches!(
            orchestrator.reserve_key(&segment),
            Err(ForkFutError::ResultSlotsExhausted { capacity: 8 })
        ));
        orchestrator.remove_segment().unwrap();
    }

    #[test]
    fn test_remove_segment_removes_token() {
        let dir = tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(config(dir.path())).unwrap();
        orchestrator.ensure_segment().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        orchestrator.remove_segment().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(orchestrator.segment_stats().is_none());
        assert!(matches!(
            orchestrator.ensure_segment(),
            Err(ForkFutError::SegmentRemoved)
        ));

        // Idempotent.
        orchestrator.remove_segment().unwrap();
    }
}
