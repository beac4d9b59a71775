//! POSIX shared memory segment holding result slots.
//!
//! One segment exists per orchestrator. The parent creates it before the
//! first fork; every worker opens it again by name and maps it on its own.
//! Result slots are addressed by [`ResultKey`] through an open-addressing
//! table, and value bytes live in a small arena after the table.
//!
//! # Slot lifecycle
//!
//! ```text
//!  parent: reserve ──► Reserved ──► worker: publish ──► Ready ──► parent: remove_slot
//!                         │                                           │
//!                         └──── parent: fail (worker died) ──► Ready ─┘
//! ```

mod arena;
mod key;
mod layout;
mod lock;

pub use key::{ResultKey, SegmentKey, SegmentToken, TokenLock};

use crate::error::{ForkFutError, Result};
use crate::memory::MemorySize;
use crate::payload::{ErrorCode, SlotPayload, TAG_ERROR};
use arena::Arena;
use layout::{
    LAYOUT_VERSION, Layout, MAGIC, NIL, SLOT_EMPTY, SLOT_READY, SLOT_RESERVED, SLOT_TOMBSTONE,
    SegmentHeader, SlotEntry,
};
use lock::{LockGuard, lock};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use std::mem::size_of;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use tracing::{debug, trace, warn};

/// Why a slot could not be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReserveError {
    /// The key's previous slot has not been removed yet.
    Occupied,
    /// Every table entry is in use.
    TableFull,
    /// The segment was unlinked.
    Removed,
}

/// Point-in-time view of segment usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStats {
    pub total_bytes: u64,
    pub slot_capacity: usize,
    pub live_slots: u64,
    pub arena_bytes: u64,
    pub free_bytes: u64,
}

/// A mapping of the shared memory segment in this process.
///
/// Dropping the handle unmaps it; only [`Segment::unlink`] destroys the
/// segment itself.
#[derive(Debug)]
pub struct Segment {
    key: SegmentKey,
    name: String,
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
    removed: AtomicBool,
}

// SAFETY: all shared state behind `base` is atomics or bytes guarded by the
// process-shared segment lock.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create and format a new segment for `key`.
    ///
    /// A leftover object with the same name (from a crashed run) is unlinked
    /// and creation retried once. Callers must hold the token's
    /// [`TokenLock`], or a live segment could be taken for a leftover.
    pub fn create(key: SegmentKey, size: MemorySize, slot_capacity: usize) -> Result<Self> {
        let name = key.shm_name();
        let too_small = || ForkFutError::SegmentTooSmall {
            size: size.as_bytes(),
            required: Layout::required_len(slot_capacity) as u64,
        };
        let len = size.to_usize().ok_or_else(too_small)?;
        let layout = Layout::compute(len, slot_capacity).ok_or_else(too_small)?;

        let flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let fd = match shm_open(name.as_str(), flags, mode) {
            Err(Errno::EEXIST) => {
                warn!(name = %name, "Removing stale shared memory segment");
                let _ = shm_unlink(name.as_str());
                shm_open(name.as_str(), flags, mode)
            }
            other => other,
        }
        .map_err(|source| segment_error("shm_open", &name, source))?;

        let mapped = nix::unistd::ftruncate(&fd, len as nix::libc::off_t)
            .map_err(|source| segment_error("ftruncate", &name, source))
            .and_then(|()| map(&fd, len, &name));
        let base = match mapped {
            Ok(base) => base,
            Err(e) => {
                let _ = shm_unlink(name.as_str());
                return Err(e);
            }
        };

        let segment = Self {
            key,
            name,
            base,
            len,
            layout,
            removed: AtomicBool::new(false),
        };
        segment.format();
        debug!(
            name = %segment.name,
            size = %size,
            slot_capacity,
            arena_bytes = layout.arena_len,
            "Created shared memory segment"
        );
        Ok(segment)
    }

    /// Open and map an existing segment.
    pub fn attach(key: SegmentKey) -> Result<Self> {
        let name = key.shm_name();
        let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|source| segment_error("shm_open", &name, source))?;
        let file = File::from(fd);
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| ForkFutError::BadSegment(name.clone()))?;
        if len < size_of::<SegmentHeader>() {
            return Err(ForkFutError::BadSegment(name));
        }
        let base = map(&file, len, &name)?;

        // SAFETY: the mapping is at least one header long and page aligned.
        let header = unsafe { &*base.as_ptr().cast::<SegmentHeader>() };
        let layout = (header.magic.load(Acquire) == MAGIC
            && header.version.load(Acquire) == LAYOUT_VERSION)
            .then(|| Layout::from_header(header, len))
            .flatten();
        let Some(layout) = layout else {
            // SAFETY: mapped above with this length.
            let _ = unsafe { munmap(base.cast(), len) };
            return Err(ForkFutError::BadSegment(name));
        };

        trace!(name = %name, "Attached shared memory segment");
        Ok(Self {
            key,
            name,
            base,
            len,
            layout,
            removed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> SegmentKey {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(SeqCst)
    }

    /// Claim the slot for `key` ahead of the worker that will fill it.
    pub(crate) fn reserve(&self, key: ResultKey) -> std::result::Result<(), ReserveError> {
        if self.is_removed() {
            return Err(ReserveError::Removed);
        }
        let _guard = self.lock();
        let capacity = self.layout.slot_capacity;
        let start = self.home(key);
        let mut target = None;

        for step in 0..capacity {
            let index = (start + step) % capacity;
            let entry = self.entry(index);
            match entry.state.load(Relaxed) {
                SLOT_EMPTY => {
                    target.get_or_insert(index);
                    break;
                }
                SLOT_TOMBSTONE => {
                    target.get_or_insert(index);
                }
                _ if entry.key.load(Relaxed) == u64::from(key.as_u32()) => {
                    return Err(ReserveError::Occupied);
                }
                _ => {}
            }
        }

        let entry = self.entry(target.ok_or(ReserveError::TableFull)?);
        entry.key.store(u64::from(key.as_u32()), Relaxed);
        entry.tag.store(0, Relaxed);
        entry.code.store(0, Relaxed);
        entry.offset.store(NIL, Relaxed);
        entry.len.store(0, Relaxed);
        entry.state.store(SLOT_RESERVED, Release);
        self.header().live_slots.fetch_add(1, Relaxed);
        Ok(())
    }

    /// Store the outcome of the task bound to `key`.
    ///
    /// Returns `Ok(false)` when the reservation no longer exists (the parent
    /// already dropped the future), in which case nothing is written. If the
    /// value bytes do not fit, the slot is published as
    /// [`ErrorCode::SegmentFull`] and `SegmentFull` is returned.
    pub fn publish(&self, key: ResultKey, payload: &SlotPayload) -> Result<bool> {
        let _guard = self.lock();
        let Some(entry) = self.find(key).filter(|e| e.state.load(Relaxed) == SLOT_RESERVED) else {
            return Ok(false);
        };

        let bytes = payload.bytes();
        if !bytes.is_empty() {
            let arena = self.arena();
            let Some(offset) = arena.alloc(bytes.len()) else {
                entry.tag.store(TAG_ERROR, Relaxed);
                entry.code.store(ErrorCode::SegmentFull.as_raw(), Relaxed);
                entry.state.store(SLOT_READY, Release);
                return Err(ForkFutError::SegmentFull {
                    requested: bytes.len(),
                    available: arena.free_bytes(),
                });
            };
            arena.write(offset, bytes);
            entry.offset.store(offset, Relaxed);
            entry.len.store(bytes.len() as u64, Relaxed);
        }

        entry.tag.store(payload.tag(), Relaxed);
        entry.code.store(payload.code(), Relaxed);
        entry.state.store(SLOT_READY, Release);
        Ok(true)
    }

    /// The stored outcome for `key`, if its worker has published one.
    pub fn fetch(&self, key: ResultKey) -> Option<SlotPayload> {
        if self.is_removed() {
            return None;
        }
        let _guard = self.lock();
        let entry = self.find(key)?;
        if entry.state.load(Acquire) != SLOT_READY {
            return None;
        }

        let tag = entry.tag.load(Relaxed);
        let code = entry.code.load(Relaxed);
        let offset = entry.offset.load(Relaxed);
        let bytes = if offset == NIL {
            Vec::new()
        } else {
            match self.arena().read(offset, entry.len.load(Relaxed)) {
                Some(bytes) => bytes,
                None => return Some(SlotPayload::Error(ErrorCode::DecodeFailed)),
            }
        };
        Some(SlotPayload::from_parts(tag, code, bytes))
    }

    /// Whether `key` is reserved and still waiting for its worker.
    pub fn is_pending(&self, key: ResultKey) -> bool {
        if self.is_removed() {
            return false;
        }
        let _guard = self.lock();
        self.find(key)
            .is_some_and(|e| e.state.load(Relaxed) == SLOT_RESERVED)
    }

    /// Resolve a still-reserved slot with `code`. Returns whether it was reserved.
    pub fn fail(&self, key: ResultKey, code: ErrorCode) -> bool {
        if self.is_removed() {
            return false;
        }
        let _guard = self.lock();
        let Some(entry) = self.find(key).filter(|e| e.state.load(Relaxed) == SLOT_RESERVED) else {
            return false;
        };
        entry.tag.store(TAG_ERROR, Relaxed);
        entry.code.store(code.as_raw(), Relaxed);
        entry.state.store(SLOT_READY, Release);
        true
    }

    /// Free the slot for `key`. Returns whether a slot was removed.
    pub fn remove_slot(&self, key: ResultKey) -> bool {
        if self.is_removed() {
            return false;
        }
        let _guard = self.lock();
        let Some(entry) = self.find(key) else {
            return false;
        };

        let offset = entry.offset.load(Relaxed);
        if offset != NIL {
            self.arena().free(offset);
        }
        entry.offset.store(NIL, Relaxed);
        entry.state.store(SLOT_TOMBSTONE, Release);

        let header = self.header();
        if header.live_slots.fetch_sub(1, Relaxed) == 1 {
            // Nothing live: drop the tombstones so lookup chains start short again.
            for index in 0..self.layout.slot_capacity {
                self.entry(index).state.store(SLOT_EMPTY, Relaxed);
            }
        }
        true
    }

    /// Destroy the segment. Idempotent.
    ///
    /// Mappings that still exist (futures, this handle) stay valid until
    /// dropped, but every slot query on a removed segment reports nothing.
    pub fn unlink(&self) -> Result<()> {
        if self.removed.swap(true, SeqCst) {
            return Ok(());
        }
        match shm_unlink(self.name.as_str()) {
            Ok(()) | Err(Errno::ENOENT) => {
                debug!(name = %self.name, "Removed shared memory segment");
                Ok(())
            }
            Err(source) => Err(segment_error("shm_unlink", &self.name, source)),
        }
    }

    pub fn stats(&self) -> SegmentStats {
        let _guard = self.lock();
        let header = self.header();
        SegmentStats {
            total_bytes: self.len as u64,
            slot_capacity: self.layout.slot_capacity,
            live_slots: header.live_slots.load(Relaxed),
            arena_bytes: self.layout.arena_len as u64,
            free_bytes: header.free_bytes.load(Relaxed),
        }
    }

    /// Write a fresh header, empty table and single-block arena.
    fn format(&self) {
        let header = self.header();
        header.version.store(LAYOUT_VERSION, Relaxed);
        header.total_len.store(self.len as u64, Relaxed);
        header
            .slot_capacity
            .store(self.layout.slot_capacity as u64, Relaxed);
        header
            .arena_offset
            .store(self.layout.arena_offset as u64, Relaxed);
        header.arena_len.store(self.layout.arena_len as u64, Relaxed);
        header.live_slots.store(0, Relaxed);
        self.arena().format();
        header.magic.store(MAGIC, Release);
    }

    fn lock(&self) -> LockGuard<'_> {
        lock(&self.header().lock)
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping starts with a header and outlives `self`.
        unsafe { &*self.base.as_ptr().cast::<SegmentHeader>() }
    }

    fn entry(&self, index: usize) -> &SlotEntry {
        debug_assert!(index < self.layout.slot_capacity);
        let offset = self.layout.table_offset + index * size_of::<SlotEntry>();
        // SAFETY: the layout places `slot_capacity` entries at `table_offset`.
        unsafe { &*self.base.as_ptr().add(offset).cast::<SlotEntry>() }
    }

    fn arena(&self) -> Arena<'_> {
        // SAFETY: the layout places an aligned arena of `arena_len` bytes
        // at `arena_offset`, inside the mapping.
        unsafe {
            let base = self.base.add(self.layout.arena_offset);
            Arena::new(base, self.layout.arena_len, self.header())
        }
    }

    fn home(&self, key: ResultKey) -> usize {
        key.as_u32() as usize % self.layout.slot_capacity
    }

    /// Reserved or ready entry for `key`. Caller holds the lock.
    fn find(&self, key: ResultKey) -> Option<&SlotEntry> {
        let capacity = self.layout.slot_capacity;
        let start = self.home(key);
        for step in 0..capacity {
            let entry = self.entry((start + step) % capacity);
            match entry.state.load(Acquire) {
                SLOT_EMPTY => return None,
                SLOT_RESERVED | SLOT_READY if entry.key.load(Relaxed) == u64::from(key.as_u32()) => {
                    return Some(entry);
                }
                _ => {}
            }
        }
        None
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` describe a mapping created by `map`.
        if let Err(e) = unsafe { munmap(self.base.cast(), self.len) } {
            warn!(name = %self.name, error = %e, "munmap failed");
        }
    }
}

fn map<F: AsFd>(fd: F, len: usize, name: &str) -> Result<NonNull<u8>> {
    let length = NonZeroUsize::new(len).ok_or_else(|| ForkFutError::BadSegment(name.to_string()))?;
    // SAFETY: a fresh shared mapping of a shm object; no existing Rust
    // references alias it.
    let ptr = unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(|source| segment_error("mmap", name, source))?;
    Ok(ptr.cast())
}

fn segment_error(op: &'static str, name: &str, source: Errno) -> ForkFutError {
    ForkFutError::Segment {
        op,
        name: name.to_string(),
        source,
    }
}

/// Unlink a segment by name without a mapped handle.
pub(crate) fn unlink_by_name(name: &str) -> Result<()> {
    match shm_unlink(name) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(source) => Err(segment_error("shm_unlink", name, source)),
    }
}
