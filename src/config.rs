//! Orchestrator configuration.
//!
//! # Environment Variables
//!
//! - `FORKFUT_SEGMENT_SIZE` - Segment size, e.g. "16M" or "1G"
//! - `FORKFUT_SLOT_CAPACITY` - Number of result slots in the segment
//! - `FORKFUT_TOKEN_PATH` - Stable file the segment key is derived from
//! - `FORKFUT_POLL_INTERVAL_US` - Future polling interval in microseconds

use crate::error::{ForkFutError, Result};
use crate::memory::{DEFAULT_SEGMENT_SIZE, MemorySize};
use crate::segment::SegmentToken;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Default number of result slots.
pub const DEFAULT_SLOT_CAPACITY: usize = 4096;

/// Result keys wrap to zero at this bound.
pub const DEFAULT_KEY_BOUND: u32 = 10_000_000;

/// Default sleep between polls in `Future::resolve`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for an [`Orchestrator`](crate::Orchestrator).
///
/// All settings take effect when the segment is created on the first `run`.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Total segment size (default: 16 MiB). Bounds the bytes of all results
    /// that are published but not yet dropped.
    pub segment_size: MemorySize,
    /// Maximum number of unreleased futures (default: 4096).
    pub slot_capacity: usize,
    /// Stable token file for key derivation (default: a transient file).
    pub token_path: Option<PathBuf>,
    /// Directory for the transient token file (default: the system temp dir).
    pub token_dir: Option<PathBuf>,
    /// Key generator wrap bound (default: 10,000,000).
    pub key_bound: u32,
    /// Sleep between polls while resolving (default: 1 ms).
    pub poll_interval: Duration,
    /// Drain workers and remove the segment on SIGINT/SIGTERM/SIGHUP (default: false).
    pub drain_on_interrupt: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            slot_capacity: DEFAULT_SLOT_CAPACITY,
            token_path: None,
            token_dir: None,
            key_bound: DEFAULT_KEY_BOUND,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_on_interrupt: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segment_size(mut self, size: MemorySize) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_slot_capacity(mut self, capacity: usize) -> Self {
        self.slot_capacity = capacity;
        self
    }

    pub fn with_token_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_path = Some(path.into());
        self
    }

    pub fn with_token_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.token_dir = Some(dir.into());
        self
    }

    pub fn with_key_bound(mut self, bound: u32) -> Self {
        self.key_bound = bound;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_drain_on_interrupt(mut self, enabled: bool) -> Self {
        self.drain_on_interrupt = enabled;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("FORKFUT_SEGMENT_SIZE") {
            match value.parse() {
                Ok(size) => self.segment_size = size,
                Err(e) => warn!(value = %value, error = %e, "Ignoring FORKFUT_SEGMENT_SIZE"),
            }
        }

        if let Ok(value) = std::env::var("FORKFUT_SLOT_CAPACITY") {
            match value.parse() {
                Ok(capacity) => self.slot_capacity = capacity,
                Err(e) => warn!(value = %value, error = %e, "Ignoring FORKFUT_SLOT_CAPACITY"),
            }
        }

        if let Ok(path) = std::env::var("FORKFUT_TOKEN_PATH") {
            self.token_path = Some(PathBuf::from(path));
        }

        if let Ok(value) = std::env::var("FORKFUT_POLL_INTERVAL_US") {
            match value.parse() {
                Ok(micros) => self.poll_interval = Duration::from_micros(micros),
                Err(e) => warn!(value = %value, error = %e, "Ignoring FORKFUT_POLL_INTERVAL_US"),
            }
        }

        self
    }

    /// Check settings that cannot be fixed up later.
    pub fn validate(&self) -> Result<()> {
        if self.slot_capacity == 0 {
            return Err(ForkFutError::Config("slot capacity must be at least 1".into()));
        }
        if self.key_bound == 0 {
            return Err(ForkFutError::Config("key bound must be at least 1".into()));
        }
        if (self.key_bound as usize) < self.slot_capacity {
            return Err(ForkFutError::Config(format!(
                "key bound {} is smaller than the slot capacity {}",
                self.key_bound, self.slot_capacity
            )));
        }
        Ok(())
    }

    /// Create the token file the segment key is derived from.
    pub(crate) fn token(&self) -> Result<SegmentToken> {
        let token = match (&self.token_path, &self.token_dir) {
            (Some(path), _) => SegmentToken::stable(path)?,
            (None, Some(dir)) => SegmentToken::transient(dir)?,
            (None, None) => SegmentToken::transient(&std::env::temp_dir())?,
        };
        Ok(token)
    }
}
