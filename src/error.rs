//! Error types for forkfut.

use thiserror::Error;

/// Main error type for forkfut.
#[derive(Error, Debug)]
pub enum ForkFutError {
    #[error("Failed to fork worker process: {0}")]
    Launch(#[source] nix::Error),

    #[error("Shared memory {op} failed for '{name}': {source}")]
    Segment {
        op: &'static str,
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("Shared memory segment '{0}' has an unrecognized layout")]
    BadSegment(String),

    #[error("Segment of {size} bytes is too small: at least {required} bytes are needed")]
    SegmentTooSmall { size: u64, required: u64 },

    #[error("All {capacity} result slots are in use. Raise the slot capacity or drop resolved futures.")]
    ResultSlotsExhausted { capacity: usize },

    #[error("Segment arena is full: {requested} bytes requested, {available} bytes free")]
    SegmentFull { requested: usize, available: u64 },

    #[error("Cannot remove segment while {0} worker process(es) are still running")]
    ChildrenStillRunning(usize),

    #[error("Token '{}' is locked by another orchestrator", path.display())]
    SegmentInUse { path: std::path::PathBuf },

    #[error("The shared memory segment has already been removed")]
    SegmentRemoved,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to install interrupt handler: {0}")]
    Interrupt(#[from] ctrlc::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for forkfut operations.
pub type Result<T> = std::result::Result<T, ForkFutError>;
