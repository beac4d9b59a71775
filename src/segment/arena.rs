//! First-fit free-list allocator for value bytes.
//!
//! Every block starts with a 16-byte header `[size: u64][next: u64]`; `size`
//! includes the header and `next` is only meaningful while the block is free.
//! The free list is kept sorted by offset so neighbours coalesce on free.
//! All methods must be called with the segment lock held.

use super::layout::{ARENA_ALIGN, NIL, SegmentHeader, align_up};
use std::ptr::NonNull;
use std::sync::atomic::Ordering::Relaxed;

const BLOCK_HEADER: u64 = 16;
const MIN_BLOCK: u64 = 32;

pub(crate) struct Arena<'a> {
    base: NonNull<u8>,
    len: u64,
    header: &'a SegmentHeader,
}

impl<'a> Arena<'a> {
    /// # Safety
    /// `base` must point to `len` writable bytes aligned to 16 that stay
    /// mapped for `'a`, and `len` must be a multiple of 16.
    pub unsafe fn new(base: NonNull<u8>, len: usize, header: &'a SegmentHeader) -> Self {
        Self {
            base,
            len: len as u64,
            header,
        }
    }

    /// Turn the whole arena into a single free block.
    pub fn format(&self) {
        self.write_u64(0, self.len);
        self.write_u64(8, NIL);
        self.header.free_head.store(0, Relaxed);
        self.header.free_bytes.store(self.len, Relaxed);
    }

    pub fn free_bytes(&self) -> u64 {
        self.header.free_bytes.load(Relaxed)
    }

    /// Allocate room for `payload_len` bytes; returns the payload offset.
    pub fn alloc(&self, payload_len: usize) -> Option<u64> {
        let need = (payload_len as u64).checked_add(BLOCK_HEADER)?;
        let need = (align_up(usize::try_from(need).ok()?, ARENA_ALIGN)? as u64).max(MIN_BLOCK);

        let mut prev = NIL;
        let mut cur = self.header.free_head.load(Relaxed);
        while cur != NIL {
            let size = self.block_size(cur)?;
            let next = self.block_next(cur)?;
            if size >= need {
                let taken = if size - need >= MIN_BLOCK {
                    let rest = cur + need;
                    self.write_u64(rest, size - need);
                    self.write_u64(rest + 8, next);
                    self.link(prev, rest);
                    self.write_u64(cur, need);
                    need
                } else {
                    self.link(prev, next);
                    size
                };
                self.header.free_bytes.fetch_sub(taken, Relaxed);
                return Some(cur + BLOCK_HEADER);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Return the block whose payload starts at `payload_offset`.
    pub fn free(&self, payload_offset: u64) {
        let Some(block) = payload_offset.checked_sub(BLOCK_HEADER) else {
            return;
        };
        let Some(size) = self.block_size(block) else {
            return;
        };
        self.header.free_bytes.fetch_add(size, Relaxed);

        let mut prev = NIL;
        let mut cur = self.header.free_head.load(Relaxed);
        while cur != NIL && cur < block {
            prev = cur;
            cur = self.block_next(cur).unwrap_or(NIL);
        }

        let mut size = size;
        let mut next = cur;
        if cur != NIL && block + size == cur {
            size += self.block_size(cur).unwrap_or(0);
            next = self.block_next(cur).unwrap_or(NIL);
        }

        match self.block_size(prev) {
            Some(prev_size) if prev + prev_size == block => {
                self.write_u64(prev, prev_size + size);
                self.write_u64(prev + 8, next);
            }
            _ => {
                self.write_u64(block, size);
                self.write_u64(block + 8, next);
                self.link(prev, block);
            }
        }
    }

    pub fn write(&self, offset: u64, bytes: &[u8]) {
        if !self.in_bounds(offset, bytes.len() as u64) {
            return;
        }
        // SAFETY: bounds checked above; the lock gives exclusive access.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(offset as usize),
                bytes.len(),
            );
        }
    }

    /// Copy `len` bytes out; `None` if the range is outside the arena.
    pub fn read(&self, offset: u64, len: u64) -> Option<Vec<u8>> {
        if !self.in_bounds(offset, len) {
            return None;
        }
        let len = usize::try_from(len).ok()?;
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                len,
            );
        }
        Some(out)
    }

    fn link(&self, prev: u64, target: u64) {
        if prev == NIL {
            self.header.free_head.store(target, Relaxed);
        } else {
            self.write_u64(prev + 8, target);
        }
    }

    fn block_size(&self, block: u64) -> Option<u64> {
        self.read_u64(block)
    }

    fn block_next(&self, block: u64) -> Option<u64> {
        self.read_u64(block.checked_add(8)?)
    }

    fn in_bounds(&self, offset: u64, len: u64) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len)
    }

    fn read_u64(&self, offset: u64) -> Option<u64> {
        if offset % 8 != 0 || !self.in_bounds(offset, 8) {
            return None;
        }
        // SAFETY: aligned and in bounds.
        Some(unsafe { self.base.as_ptr().add(offset as usize).cast::<u64>().read() })
    }

    fn write_u64(&self, offset: u64, value: u64) {
        if offset % 8 != 0 || !self.in_bounds(offset, 8) {
            return;
        }
        // SAFETY: aligned and in bounds.
        unsafe {
            self.base
                .as_ptr()
                .add(offset as usize)
                .cast::<u64>()
                .write(value)
        }
    }
}
