//! Process role tracking across `fork`.
//!
//! Every process starts as [`RuntimeRole::Parent`]. The child branch of a fork
//! calls [`mark_child`] before running any task code, and the flag is never
//! reset afterwards, so a child of a child is still a child. Teardown paths
//! (slot removal, segment removal, interrupt draining) only run in the parent.

use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide role flag. `true` until the process becomes a forked worker.
static IN_PARENT: AtomicBool = AtomicBool::new(true);

/// Role of the current process in the fork tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeRole {
    /// The orchestrating process; owns cleanup responsibility.
    Parent,
    /// A forked worker; never removes slots or segments.
    Child,
}

impl std::fmt::Display for RuntimeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parent => write!(f, "parent"),
            Self::Child => write!(f, "child"),
        }
    }
}

/// Mark the current process as a forked worker.
pub fn mark_child() {
    IN_PARENT.store(false, Ordering::SeqCst);
}

/// Current role of this process.
pub fn role() -> RuntimeRole {
    if IN_PARENT.load(Ordering::SeqCst) {
        RuntimeRole::Parent
    } else {
        RuntimeRole::Child
    }
}

pub fn is_child() -> bool {
    role() == RuntimeRole::Child
}

pub fn is_parent() -> bool {
    role() == RuntimeRole::Parent
}
