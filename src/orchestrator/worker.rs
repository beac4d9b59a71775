//! Code that runs inside a forked worker process.

use crate::payload::{ErrorCode, SlotPayload};
use crate::segment::{ResultKey, Segment, SegmentKey};
use nix::sys::signal::{SigHandler, Signal, signal};
use serde::Serialize;
use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

/// The task produced a value or void and it was stored.
pub const EXIT_OK: i32 = 0;
/// The task returned an error or panicked.
pub const EXIT_TASK_FAILED: i32 = 1;
/// The outcome could not be stored in the segment.
pub const EXIT_UNSTORED: i32 = 2;
/// The worker could not attach to the segment.
pub const EXIT_NO_SEGMENT: i32 = 3;

/// Signals the orchestrating process may catch for drain-on-interrupt.
const INHERITED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Restore default dispositions for signals a parent handler may have taken.
///
/// A handler inherited across `fork` would only notify a thread that does
/// not exist in the worker, leaving the worker unkillable by these signals.
pub(crate) fn reset_signal_handlers() {
    for sig in INHERITED_SIGNALS {
        // SAFETY: installing SIG_DFL runs no Rust code in signal context.
        if let Err(e) = unsafe { signal(sig, SigHandler::SigDfl) } {
            warn!(signal = ?sig, error = %e, "Failed to reset signal handler");
        }
    }
}

/// Run `task` and publish its outcome under `key`.
///
/// Returns the exit status for the worker. Never unwinds.
pub(crate) fn run_task<T, E, F>(segment_key: SegmentKey, key: ResultKey, task: F) -> i32
where
    F: FnOnce() -> std::result::Result<T, E>,
    T: Serialize,
    E: Display,
{
    let segment = match Segment::attach(segment_key) {
        Ok(segment) => segment,
        Err(e) => {
            error!(key = %key, error = %e, "Worker could not attach to segment");
            return EXIT_NO_SEGMENT;
        }
    };

    let (payload, mut status) = match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(value)) => match SlotPayload::encode(&value) {
            payload @ SlotPayload::Error(_) => (payload, EXIT_UNSTORED),
            payload => (payload, EXIT_OK),
        },
        Ok(Err(e)) => {
            error!(key = %key, error = %e, "Task failed");
            (SlotPayload::Error(ErrorCode::TaskFailed), EXIT_TASK_FAILED)
        }
        Err(panic) => {
            error!(key = %key, message = %panic_message(panic.as_ref()), "Task panicked");
            (SlotPayload::Error(ErrorCode::TaskPanicked), EXIT_TASK_FAILED)
        }
    };

    match segment.publish(key, &payload) {
        Ok(true) => {}
        Ok(false) => debug!(key = %key, "Result slot was released before the task finished"),
        Err(e) => {
            error!(key = %key, error = %e, "Failed to store task result");
            status = EXIT_UNSTORED;
        }
    }

    status
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySize;
    use crate::segment::SegmentToken;
    use tempfile::tempdir;

    // `run_task` is safe to call in-process: it only attaches and publishes.
    fn with_segment(f: impl FnOnce(&Segment)) {
        let dir = tempdir().unwrap();
        let token = SegmentToken::transient(dir.path()).unwrap();
        let segment = Segment::create(token.key().unwrap(), MemorySize::from_kib(64), 8).unwrap();
        f(&segment);
        segment.unlink().unwrap();
    }

    #[test]
    fn test_value_is_published() {
        with_segment(|segment| {
            let key = ResultKey::new(1);
            segment.reserve(key).unwrap();

            let status = run_task(segment.key(), key, || Ok::<_, String>(vec![1, 2, 3]));
            assert_eq!(status, EXIT_OK);
            assert_eq!(segment.fetch(key), Some(SlotPayload::encode(&vec![1, 2, 3])));
        });
    }

    #[test]
    fn test_error_is_published() {
        with_segment(|segment| {
            let key = ResultKey::new(2);
            segment.reserve(key).unwrap();

            let status = run_task(segment.key(), key, || Err::<i32, _>("bad input"));
            assert_eq!(status, EXIT_TASK_FAILED);
            assert_eq!(
                segment.fetch(key),
                Some(SlotPayload::Error(ErrorCode::TaskFailed))
            );
        });
    }

    #[test]
    fn test_panic_is_published() {
        with_segment(|segment| {
            let key = ResultKey::new(3);
            segment.reserve(key).unwrap();

            let status = run_task(segment.key(), key, || -> Result<i32, String> {
                panic!("boom")
            });
            assert_eq!(status, EXIT_TASK_FAILED);
            assert_eq!(
                segment.fetch(key),
                Some(SlotPayload::Error(ErrorCode::TaskPanicked))
            );
        });
    }

    #[test]
    fn test_oversized_value_is_unstored() {
        with_segment(|segment| {
            let key = ResultKey::new(4);
            segment.reserve(key).unwrap();

            let status = run_task(segment.key(), key, || Ok::<_, String>(vec![7u32; 100_000]));
            assert_eq!(status, EXIT_UNSTORED);
            assert_eq!(
                segment.fetch(key),
                Some(SlotPayload::Error(ErrorCode::SegmentFull))
            );
        });
    }

    #[test]
    fn test_missing_segment() {
        let dir = tempdir().unwrap();
        let token = SegmentToken::transient(dir.path()).unwrap();
        let status = run_task(token.key().unwrap(), ResultKey::new(0), || Ok::<_, String>(1));
        assert_eq!(status, EXIT_NO_SEGMENT);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(5);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
