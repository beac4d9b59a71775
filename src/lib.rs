//! forkfut - run closures in forked worker processes.
//!
//! An [`Orchestrator`] forks one worker per task. Each worker runs its
//! closure, serializes the outcome into a POSIX shared memory segment and
//! exits. The caller holds a [`Promise`] that resolves once the outcome is
//! in the segment.
//!
//! ```no_run
//! use forkfut::{Orchestrator, OrchestratorConfig};
//!
//! # fn main() -> forkfut::Result<()> {
//! let mut orchestrator = Orchestrator::new(OrchestratorConfig::default())?;
//! let mut answer = orchestrator.run(|| Ok::<_, std::io::Error>(6 * 7))?;
//! assert_eq!(answer.resolve().value(), Some(&42));
//! orchestrator.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod payload;
pub mod promise;
pub mod runtime;
pub mod segment;

pub use config::OrchestratorConfig;
pub use error::{ForkFutError, Result};
pub use memory::MemorySize;
pub use orchestrator::{Orchestrator, TerminationReason};
pub use payload::{ErrorCode, SlotPayload};
pub use promise::{Promise, Resolution};
pub use runtime::RuntimeRole;
pub use segment::{ResultKey, SegmentStats};
