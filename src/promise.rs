//! Handle to the result of a task running in a worker process.

use crate::payload::{ErrorCode, SlotPayload};
use crate::runtime;
use crate::segment::{ResultKey, Segment};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Resolution state of a [`Promise`].
///
/// Only ever moves from `Pending` to one of the other variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    Pending,
    /// The task returned a value.
    Value(T),
    /// The task returned `()` or `None`.
    Void,
    /// No value is available; the code says why.
    Error(ErrorCode),
}

impl<T> Resolution<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Result of one task, bound to its slot in the shared segment.
///
/// Dropping the promise in the orchestrating process frees the slot; in a
/// worker process it leaves the segment alone.
#[derive(Debug)]
pub struct Promise<T> {
    key: ResultKey,
    state: Resolution<T>,
    segment: Arc<Segment>,
    poll_interval: Duration,
}

impl<T: DeserializeOwned> Promise<T> {
    pub(crate) fn new(key: ResultKey, segment: Arc<Segment>, poll_interval: Duration) -> Self {
        Self {
            key,
            state: Resolution::Pending,
            segment,
            poll_interval,
        }
    }

    pub fn key(&self) -> ResultKey {
        self.key
    }

    /// Check the slot once without blocking.
    ///
    /// Caches the outcome on first success; later calls return `true`
    /// without touching the segment. A promise whose segment was removed
    /// before its result arrived resolves to [`ErrorCode::SegmentRemoved`].
    pub fn is_resolved(&mut self) -> bool {
        if !self.state.is_pending() {
            return true;
        }

        match self.segment.fetch(self.key) {
            Some(payload) => {
                self.state = decode(payload);
                trace!(key = %self.key, "Promise resolved");
                true
            }
            None if self.segment.is_removed() => {
                self.state = Resolution::Error(ErrorCode::SegmentRemoved);
                true
            }
            None => false,
        }
    }

    /// Block until the task's outcome is available.
    ///
    /// Polls the segment, sleeping `poll_interval` between checks. Does not
    /// return until the worker publishes, the orchestrator marks the worker
    /// dead (see [`Orchestrator::reap`](crate::Orchestrator::reap)), or the
    /// segment is removed.
    pub fn resolve(&mut self) -> &mut Self {
        while !self.is_resolved() {
            std::thread::sleep(self.poll_interval);
        }
        self
    }

    /// Like [`resolve`](Self::resolve), but give up after `timeout`.
    ///
    /// Returns whether the promise is resolved. The task keeps running
    /// either way.
    pub fn resolve_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_resolved() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

impl<T> Promise<T> {
    pub fn resolution(&self) -> &Resolution<T> {
        &self.state
    }

    /// The task's value, if resolved with one. Never blocks.
    pub fn value(&self) -> Option<&T> {
        match &self.state {
            Resolution::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Take the value out, releasing the slot.
    pub fn into_value(mut self) -> Option<T> {
        match std::mem::replace(&mut self.state, Resolution::Pending) {
            Resolution::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self.state, Resolution::Void)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.state, Resolution::Error(_))
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self.state {
            Resolution::Error(code) => Some(code),
            _ => None,
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if runtime::is_child() {
            return;
        }
        self.segment.remove_slot(self.key);
    }
}

fn decode<T: DeserializeOwned>(payload: SlotPayload) -> Resolution<T> {
    match payload {
        SlotPayload::Value(bytes) => match SlotPayload::decode(&bytes) {
            Ok(value) => Resolution::Value(value),
            Err(e) => {
                warn!(error = %e, "Failed to decode task value");
                Resolution::Error(ErrorCode::DecodeFailed)
            }
        },
        SlotPayload::Void => Resolution::Void,
        SlotPayload::Error(code) => Resolution::Error(code),
    }
}
