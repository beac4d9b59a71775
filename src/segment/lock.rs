//! Process-shared spin lock living in the segment header.
//!
//! The lock word holds the pid of the holder. A worker that is killed while
//! holding the lock would otherwise wedge every other process, so waiters
//! periodically check whether the holder still exists and take the lock over
//! from a dead one.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

/// Busy spins before yielding the CPU.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Attempts between liveness checks of the holder.
const LIVENESS_CHECK_INTERVAL: u32 = 1024;

/// Holds the segment lock until dropped.
pub(crate) struct LockGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

/// Acquire the lock stored in `word`.
pub(crate) fn lock(word: &AtomicU32) -> LockGuard<'_> {
    let me = std::process::id();
    let mut attempts: u32 = 0;

    loop {
        let holder = match word.compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return LockGuard { word },
            Err(holder) => holder,
        };

        attempts = attempts.wrapping_add(1);
        if attempts < SPINS_BEFORE_YIELD {
            std::hint::spin_loop();
            continue;
        }

        if attempts % LIVENESS_CHECK_INTERVAL == 0
            && holder != 0
            && holder != me
            && !holder_alive(holder)
            && word
                .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            warn!(holder, "Took over segment lock from a dead process");
            return LockGuard { word };
        }

        std::thread::yield_now();
    }
}

/// Whether `pid` names a live (non-zombie) process.
fn holder_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None::<Signal>) {
        Err(Errno::ESRCH) => false,
        _ => !is_zombie(raw),
    }
}

/// A worker that died but has not been reaped yet still answers `kill(pid, 0)`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    // Format: "pid (comm) state ..."; comm may contain spaces or parens.
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: i32) -> bool {
    false
}
