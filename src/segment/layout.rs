//! In-segment memory layout.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬─────────────────────────┐
//! │ SegmentHeader│ SlotEntry × slot_capacity    │ arena (value bytes)     │
//! │   64 bytes   │   40 bytes each              │   16-byte aligned       │
//! └──────────────┴──────────────────────────────┴─────────────────────────┘
//! ```
//!
//! Every field is an atomic so any process can hold a shared reference into
//! the mapping. Fields other than `lock` and slot `state` are only written
//! while the segment lock is held.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// "FORKFUT1"
pub(crate) const MAGIC: u64 = 0x464f_524b_4655_5431;
pub(crate) const LAYOUT_VERSION: u32 = 1;

/// Arena offset of "no block".
pub(crate) const NIL: u64 = u64::MAX;

pub(crate) const ARENA_ALIGN: usize = 16;

/// Smallest arena worth creating a segment for.
pub(crate) const MIN_ARENA: usize = 4096;

/// Slot entry states.
pub(crate) const SLOT_EMPTY: u32 = 0;
pub(crate) const SLOT_RESERVED: u32 = 1;
pub(crate) const SLOT_READY: u32 = 2;
pub(crate) const SLOT_TOMBSTONE: u32 = 3;

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct SegmentHeader {
    pub magic: AtomicU64,
    pub version: AtomicU32,
    /// Pid of the lock holder, 0 when free.
    pub lock: AtomicU32,
    pub total_len: AtomicU64,
    pub slot_capacity: AtomicU64,
    pub arena_offset: AtomicU64,
    pub arena_len: AtomicU64,
    /// Offset of the first free arena block, or [`NIL`].
    pub free_head: AtomicU64,
    pub free_bytes: AtomicU64,
    /// Reserved plus ready slots.
    pub live_slots: AtomicU64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct SlotEntry {
    pub state: AtomicU32,
    pub tag: AtomicU32,
    pub key: AtomicU64,
    pub code: AtomicU32,
    pub _pad: AtomicU32,
    /// Arena offset of the value bytes, or [`NIL`].
    pub offset: AtomicU64,
    pub len: AtomicU64,
}

/// Byte offsets of the regions of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub slot_capacity: usize,
    pub table_offset: usize,
    pub arena_offset: usize,
    pub arena_len: usize,
}

impl Layout {
    /// Lay out a segment of `total_len` bytes, or `None` if it is too small.
    pub fn compute(total_len: usize, slot_capacity: usize) -> Option<Self> {
        if slot_capacity == 0 {
            return None;
        }
        let table_offset = size_of::<SegmentHeader>();
        let table_len = slot_capacity.checked_mul(size_of::<SlotEntry>())?;
        let arena_offset = align_up(table_offset.checked_add(table_len)?, ARENA_ALIGN)?;
        let arena_len = total_len.checked_sub(arena_offset)? & !(ARENA_ALIGN - 1);
        if arena_len < MIN_ARENA {
            return None;
        }
        Some(Self {
            slot_capacity,
            table_offset,
            arena_offset,
            arena_len,
        })
    }

    /// Smallest segment that can hold `slot_capacity` slots.
    pub fn required_len(slot_capacity: usize) -> usize {
        let table_end = size_of::<SegmentHeader>()
            .saturating_add(slot_capacity.saturating_mul(size_of::<SlotEntry>()));
        align_up(table_end, ARENA_ALIGN)
            .unwrap_or(usize::MAX)
            .saturating_add(MIN_ARENA)
    }

    /// Rebuild the layout recorded in an attached segment's header.
    pub fn from_header(header: &SegmentHeader, mapped_len: usize) -> Option<Self> {
        use std::sync::atomic::Ordering::Acquire;

        let slot_capacity = usize::try_from(header.slot_capacity.load(Acquire)).ok()?;
        let arena_offset = usize::try_from(header.arena_offset.load(Acquire)).ok()?;
        let arena_len = usize::try_from(header.arena_len.load(Acquire)).ok()?;
        let expected = Self::compute(mapped_len, slot_capacity)?;
        (expected.arena_offset == arena_offset && expected.arena_len == arena_len)
            .then_some(expected)
    }
}

pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}
