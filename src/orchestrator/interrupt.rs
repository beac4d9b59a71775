//! Drain-and-remove handling for SIGINT, SIGTERM and SIGHUP.
//!
//! One process-wide handler covers every registered segment. Workers reset
//! these signals to their default action right after `fork`, so only the
//! orchestrating process drains children and unlinks segments.

use crate::error::Result;
use crate::runtime;
use crate::segment;
use nix::errno::Errno;
use nix::sys::wait::wait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

/// Exit status after an interrupt (128 + SIGINT).
const INTERRUPTED_EXIT: i32 = 130;

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Segments to remove on interrupt, with their transient token files.
static REGISTERED: Mutex<Vec<(String, Option<PathBuf>)>> = Mutex::new(Vec::new());

fn registered() -> MutexGuard<'static, Vec<(String, Option<PathBuf>)>> {
    REGISTERED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `segment_name` (and `token`) if the process is interrupted.
pub(crate) fn register(segment_name: &str, token: Option<PathBuf>) -> Result<()> {
    registered().push((segment_name.to_string(), token));

    if !HANDLER_INSTALLED.swap(true, Ordering::SeqCst)
        && let Err(e) = ctrlc::set_handler(on_interrupt)
    {
        HANDLER_INSTALLED.store(false, Ordering::SeqCst);
        unregister(segment_name);
        if matches!(e, ctrlc::Error::MultipleHandlers) {
            warn!("Another interrupt handler is installed; segments will not be drained on Ctrl+C");
            return Ok(());
        }
        return Err(e.into());
    }
    Ok(())
}

pub(crate) fn unregister(segment_name: &str) {
    registered().retain(|(name, _)| name != segment_name);
}

fn on_interrupt() {
    if runtime::is_child() {
        return;
    }

    eprintln!("\nReceived interrupt, waiting for workers...");
    let drained = drain_children();
    info!(workers = drained, "Drained workers after interrupt");

    for (name, token) in registered().drain(..) {
        if let Err(e) = segment::unlink_by_name(&name) {
            error!(name = %name, error = %e, "Failed to remove segment");
        }
        if let Some(path) = token
            && let Err(e) = std::fs::remove_file(&path)
        {
            warn!(path = %path.display(), error = %e, "Failed to remove token file");
        }
    }

    std::process::exit(INTERRUPTED_EXIT);
}

/// Wait for every child of this process. Returns how many were reaped.
fn drain_children() -> usize {
    let mut reaped = 0;
    loop {
        match wait() {
            Ok(_) => reaped += 1,
            Err(Errno::EINTR) => continue,
            Err(_) => return reaped,
        }
    }
}
