// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reference-counted byte buffer with separate read and write cursors.
//!
//! Invariant: `0 <= read_idx <= write_idx <= capacity <= max_capacity`.
//! Readable bytes are `[read_idx, write_idx)`, writable bytes are
//! `[write_idx, capacity)`. Capacity grows on demand up to `max_capacity`
//! by moving to a larger pool slot (contents in the readable window are
//! preserved at their offsets).
//!
//! Sharing model: `duplicate`/`slice` produce views over the same backing
//! memory without touching the reference count; `retain`/`release` adjust
//! it explicitly. When the count reaches zero the slot returns to its arena
//! and any further access is a programming error (panics).

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::arena::{Arena, SlotParts};
use super::chunk::Chunk;
use super::NORMAL_CEILING;
use crate::error::{Error, Result};

/// Byte order applied by the multi-byte accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Network order; the default.
    #[default]
    Big,
    Little,
}

/// Where a buffer's bytes live.
pub(crate) enum RegionKind {
    Pooled {
        arena: Arc<Arena>,
        chunk: Arc<Chunk>,
        handle: i64,
        offset: usize,
    },
    Unpooled {
        data: Box<[u8]>,
    },
    /// Backing store already returned; any access is an error.
    Dead,
}

pub(crate) struct Region {
    pub(crate) kind: RegionKind,
    /// Logical capacity visible through the buffer API.
    pub(crate) capacity: usize,
    /// Bytes actually reserved in the slot (normalized size).
    pub(crate) slot_cap: usize,
}

impl Region {
    fn dead() -> Self {
        Self {
            kind: RegionKind::Dead,
            capacity: 0,
            slot_cap: 0,
        }
    }

    fn bytes(&self) -> &[u8] {
        match &self.kind {
            RegionKind::Pooled { chunk, offset, .. } => {
                // SAFETY: the handle owns [offset, offset + slot_cap) until
                // freed; per-buffer access is serialized by the region lock.
                unsafe { &chunk.slice(*offset, self.slot_cap)[..self.capacity] }
            }
            RegionKind::Unpooled { data } => &data[..self.capacity],
            RegionKind::Dead => panic!("buffer accessed after release"),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let capacity = self.capacity;
        match &mut self.kind {
            RegionKind::Pooled { chunk, offset, .. } => {
                // SAFETY: exclusive logical ownership of the slot (live
                // handle), and the region write lock excludes concurrent
                // access through any duplicate of this buffer.
                unsafe { &mut chunk.slice_mut(*offset, self.slot_cap)[..capacity] }
            }
            RegionKind::Unpooled { data } => &mut data[..capacity],
            RegionKind::Dead => panic!("buffer accessed after release"),
        }
    }
}

/// Return a region's slot to wherever it came from.
pub(crate) fn release_region(region: Region) {
    match region.kind {
        RegionKind::Pooled {
            arena,
            chunk,
            handle,
            offset,
        } => super::allocator::free_pooled_slot(&arena, chunk, handle, offset, region.slot_cap),
        RegionKind::Unpooled { .. } | RegionKind::Dead => {}
    }
}

pub(crate) struct Shared {
    refs: AtomicUsize,
    region: RwLock<Region>,
    max_capacity: usize,
    /// While `Some`, reallocation stashes replaced regions here instead of
    /// freeing them; `resume_deallocations` drains the stash.
    suspended: Mutex<Option<Vec<Region>>>,
}

/// A view window applied by `slice`/`duplicate`-derived buffers.
#[derive(Clone, Copy)]
struct View {
    off: usize,
    len: usize,
}

pub struct ByteBuf {
    shared: Arc<Shared>,
    view: Option<View>,
    read_idx: usize,
    write_idx: usize,
    endian: Endianness,
}

impl ByteBuf {
    pub(crate) fn new_pooled(parts: SlotParts, capacity: usize, max_capacity: usize) -> Self {
        debug_assert!(capacity <= parts.slot_cap);
        Self::from_region(
            Region {
                kind: RegionKind::Pooled {
                    arena: parts.arena,
                    chunk: parts.chunk,
                    handle: parts.handle,
                    offset: parts.offset,
                },
                capacity,
                slot_cap: parts.slot_cap,
            },
            max_capacity,
        )
    }

    pub(crate) fn new_unpooled(capacity: usize, max_capacity: usize) -> Self {
        Self::from_region(
            Region {
                kind: RegionKind::Unpooled {
                    data: vec![0u8; capacity].into_boxed_slice(),
                },
                capacity,
                slot_cap: capacity,
            },
            max_capacity,
        )
    }

    fn from_region(region: Region, max_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                refs: AtomicUsize::new(1),
                region: RwLock::new(region),
                max_capacity,
                suspended: Mutex::new(None),
            }),
            view: None,
            read_idx: 0,
            write_idx: 0,
            endian: Endianness::Big,
        }
    }

    // ===== Cursors and capacity =====

    pub fn capacity(&self) -> usize {
        match self.view {
            Some(v) => v.len,
            None => self.shared.region.read().capacity,
        }
    }

    pub fn max_capacity(&self) -> usize {
        match self.view {
            Some(v) => v.len,
            None => self.shared.max_capacity,
        }
    }

    pub fn read_index(&self) -> usize {
        self.read_idx
    }

    pub fn write_index(&self) -> usize {
        self.write_idx
    }

    /// Move the read cursor. Panics if the cursor invariant would break.
    pub fn set_read_index(&mut self, idx: usize) {
        assert!(idx <= self.write_idx, "read index past write index");
        self.read_idx = idx;
    }

    /// Move the write cursor. Panics if the cursor invariant would break.
    pub fn set_write_index(&mut self, idx: usize) {
        assert!(
            idx >= self.read_idx && idx <= self.capacity(),
            "write index outside [read index, capacity]"
        );
        self.write_idx = idx;
    }

    /// Reset both cursors to zero without touching contents.
    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_idx - self.read_idx
    }

    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.write_idx
    }

    pub fn is_readable(&self) -> bool {
        self.write_idx > self.read_idx
    }

    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    /// Switch the byte order used by multi-byte accessors.
    pub fn set_endianness(&mut self, endian: Endianness) {
        self.endian = endian;
    }

    /// Raw address of the first byte, for zero-copy native I/O.
    pub fn memory_address(&self) -> Option<usize> {
        self.check_live();
        let region = self.shared.region.read();
        let base = region.bytes().as_ptr() as usize;
        Some(base + self.view.map_or(0, |v| v.off))
    }

    // ===== Reference counting =====

    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }

    /// Increment the reference count.
    pub fn retain(&self) -> &Self {
        loop {
            let cur = self.shared.refs.load(Ordering::Acquire);
            assert!(cur > 0, "retain on a released buffer");
            if self
                .shared
                .refs
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return self;
            }
        }
    }

    /// Decrement the reference count; returns true when the backing store
    /// was freed by this call.
    pub fn release(&self) -> bool {
        loop {
            let cur = self.shared.refs.load(Ordering::Acquire);
            assert!(cur > 0, "buffer released more times than retained");
            if self
                .shared
                .refs
                .compare_exchange(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if cur != 1 {
                return false;
            }
            let old = std::mem::replace(&mut *self.shared.region.write(), Region::dead());
            release_region(old);
            if let Some(stash) = self.shared.suspended.lock().take() {
                for region in stash {
                    release_region(region);
                }
            }
            return true;
        }
    }

    // ===== Derived buffers =====

    /// A view sharing this buffer's memory and refcount, with independent
    /// cursors. Does not retain; retain first if the view outlives `self`.
    pub fn duplicate(&self) -> ByteBuf {
        self.check_live();
        ByteBuf {
            shared: self.shared.clone(),
            view: self.view,
            read_idx: self.read_idx,
            write_idx: self.write_idx,
            endian: self.endian,
        }
    }

    /// `duplicate` plus a retain, for handing to another owner.
    pub fn retained_duplicate(&self) -> ByteBuf {
        self.retain();
        self.duplicate()
    }

    /// A view over the current readable window `[read_idx, write_idx)`.
    /// The slice's capacity is fixed; it cannot grow. Does not retain.
    pub fn slice(&self) -> ByteBuf {
        self.check_live();
        let base = self.view.map_or(0, |v| v.off);
        let len = self.readable_bytes();
        ByteBuf {
            shared: self.shared.clone(),
            view: Some(View {
                off: base + self.read_idx,
                len,
            }),
            read_idx: 0,
            write_idx: len,
            endian: self.endian,
        }
    }

    // ===== Positional access =====

    pub fn get_byte(&self, idx: usize) -> u8 {
        assert!(idx < self.capacity(), "index beyond capacity");
        self.with_bytes(|b| b[idx])
    }

    pub fn set_byte(&mut self, idx: usize, value: u8) {
        assert!(idx < self.capacity(), "index beyond capacity");
        self.with_bytes_mut(|b| b[idx] = value);
    }

    // ===== Cursor-based reads =====

    pub fn read_u8(&mut self) -> u8 {
        let mut one = [0u8; 1];
        self.read_bytes(&mut one);
        one[0]
    }

    pub fn read_u16(&mut self) -> u16 {
        let mut raw = [0u8; 2];
        self.read_bytes(&mut raw);
        match self.endian {
            Endianness::Big => u16::from_be_bytes(raw),
            Endianness::Little => u16::from_le_bytes(raw),
        }
    }

    pub fn read_u32(&mut self) -> u32 {
        let mut raw = [0u8; 4];
        self.read_bytes(&mut raw);
        match self.endian {
            Endianness::Big => u32::from_be_bytes(raw),
            Endianness::Little => u32::from_le_bytes(raw),
        }
    }

    pub fn read_u64(&mut self) -> u64 {
        let mut raw = [0u8; 8];
        self.read_bytes(&mut raw);
        match self.endian {
            Endianness::Big => u64::from_be_bytes(raw),
            Endianness::Little => u64::from_le_bytes(raw),
        }
    }

    /// Copy readable bytes into `dst`, advancing the read cursor.
    /// Panics when fewer than `dst.len()` bytes are readable.
    pub fn read_bytes(&mut self, dst: &mut [u8]) {
        assert!(
            dst.len() <= self.readable_bytes(),
            "read past the write index"
        );
        let start = self.read_idx;
        self.with_bytes(|b| dst.copy_from_slice(&b[start..start + dst.len()]));
        self.read_idx += dst.len();
    }

    // ===== Cursor-based writes =====

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        let raw = match self.endian {
            Endianness::Big => value.to_be_bytes(),
            Endianness::Little => value.to_le_bytes(),
        };
        self.write_bytes(&raw)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        let raw = match self.endian {
            Endianness::Big => value.to_be_bytes(),
            Endianness::Little => value.to_le_bytes(),
        };
        self.write_bytes(&raw)
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        let raw = match self.endian {
            Endianness::Big => value.to_be_bytes(),
            Endianness::Little => value.to_le_bytes(),
        };
        self.write_bytes(&raw)
    }

    /// Append `src`, growing capacity as needed (fails with `Allocation`
    /// once `max_capacity` would be exceeded — never truncates).
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_writable(src.len())?;
        let start = self.write_idx;
        self.with_bytes_mut(|b| b[start..start + src.len()].copy_from_slice(src));
        self.write_idx += src.len();
        Ok(())
    }

    /// Guarantee room for `n` more bytes, reallocating within
    /// `max_capacity` if required.
    pub fn ensure_writable(&mut self, n: usize) -> Result<()> {
        if self.writable_bytes() >= n {
            return Ok(());
        }
        if self.view.is_some() {
            return Err(Error::alloc("derived buffer cannot grow"));
        }
        let needed = self.write_idx + n;
        if needed > self.shared.max_capacity {
            return Err(Error::alloc(format!(
                "write of {} bytes exceeds max capacity {}",
                n, self.shared.max_capacity
            )));
        }
        let target = needed
            .next_power_of_two()
            .max(64)
            .min(self.shared.max_capacity);
        self.adjust_capacity(target)
    }

    /// Shift readable bytes to offset zero, reclaiming consumed space.
    pub fn discard_read_bytes(&mut self) {
        if self.read_idx == 0 {
            return;
        }
        let (start, len) = (self.read_idx, self.readable_bytes());
        if len > 0 {
            self.with_bytes_mut(|b| b.copy_within(start..start + len, 0));
        }
        self.read_idx = 0;
        self.write_idx = len;
    }

    // ===== Reallocation =====

    /// Grow or shrink to `new_capacity`. Within the reserved slot this is a
    /// bookkeeping change; otherwise a new slot is taken and the readable
    /// window is copied across at its original offsets.
    pub(crate) fn adjust_capacity(&mut self, new_capacity: usize) -> Result<()> {
        self.check_live();
        assert!(self.view.is_none(), "derived buffer cannot be resized");
        if new_capacity > self.shared.max_capacity {
            return Err(Error::alloc("capacity beyond max capacity"));
        }
        let mut region = self.shared.region.write();
        if new_capacity == region.capacity {
            return Ok(());
        }
        // Same-slot fast path.
        if new_capacity <= region.slot_cap {
            region.capacity = new_capacity;
            drop(region);
            self.clamp_cursors(new_capacity);
            return Ok(());
        }

        let mut fresh = allocate_region_like(&region, new_capacity)?;
        let keep_from = self.read_idx.min(new_capacity);
        let keep_to = self.write_idx.min(new_capacity);
        if keep_to > keep_from {
            let src = region.bytes();
            fresh.bytes_mut()[keep_from..keep_to].copy_from_slice(&src[keep_from..keep_to]);
        }
        let old = std::mem::replace(&mut *region, fresh);
        drop(region);

        let mut suspended = self.shared.suspended.lock();
        match suspended.as_mut() {
            Some(stash) => stash.push(old),
            None => release_region(old),
        }
        drop(suspended);
        self.clamp_cursors(new_capacity);
        Ok(())
    }

    fn clamp_cursors(&mut self, capacity: usize) {
        if self.read_idx > capacity {
            self.read_idx = capacity;
        }
        if self.write_idx > capacity {
            self.write_idx = capacity;
        }
        if self.read_idx > self.write_idx {
            self.read_idx = self.write_idx;
        }
    }

    /// Defer freeing of slots replaced by reallocation until
    /// [`resume_deallocations`](Self::resume_deallocations).
    pub fn suspend_deallocations(&self) {
        let mut suspended = self.shared.suspended.lock();
        if suspended.is_none() {
            *suspended = Some(Vec::new());
        }
    }

    /// Free every slot stashed while deallocations were suspended.
    pub fn resume_deallocations(&self) {
        if let Some(stash) = self.shared.suspended.lock().take() {
            for region in stash {
                release_region(region);
            }
        }
    }

    // ===== I/O bridges =====

    /// Fill writable space from a reader with a single `read` call;
    /// advances the write cursor by the amount read.
    pub(crate) fn write_from_reader(&mut self, r: &mut impl io::Read) -> io::Result<usize> {
        self.check_live();
        let start = self.write_idx;
        let n = {
            let mut region = self.shared.region.write();
            let off = self.view.map_or(0, |v| v.off);
            let cap = match self.view {
                Some(v) => v.len,
                None => region.capacity,
            };
            let bytes = region.bytes_mut();
            r.read(&mut bytes[off + start..off + cap])?
        };
        self.write_idx += n;
        Ok(n)
    }

    /// Fill writable space through `f`, which reports how many bytes it
    /// produced; used for datagram receives where the source is not a
    /// `Read` impl.
    pub(crate) fn fill_from(
        &mut self,
        f: impl FnOnce(&mut [u8]) -> io::Result<usize>,
    ) -> io::Result<usize> {
        self.check_live();
        let start = self.write_idx;
        let n = {
            let mut region = self.shared.region.write();
            let off = self.view.map_or(0, |v| v.off);
            let cap = match self.view {
                Some(v) => v.len,
                None => region.capacity,
            };
            let bytes = region.bytes_mut();
            f(&mut bytes[off + start..off + cap])?
        };
        self.write_idx += n;
        Ok(n)
    }

    /// Drain readable bytes into a writer with a single `write` call;
    /// advances the read cursor by the amount written.
    pub(crate) fn read_into_writer(&mut self, w: &mut impl io::Write) -> io::Result<usize> {
        self.check_live();
        let (start, end) = (self.read_idx, self.write_idx);
        let n = {
            let region = self.shared.region.read();
            let off = self.view.map_or(0, |v| v.off);
            let bytes = region.bytes();
            w.write(&bytes[off + start..off + end])?
        };
        self.read_idx += n;
        Ok(n)
    }

    /// Run `f` over the readable window without consuming it.
    pub fn with_readable<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let (start, end) = (self.read_idx, self.write_idx);
        self.with_bytes(|b| f(&b[start..end]))
    }

    /// Copy of the readable window; test and logging helper.
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_readable(<[u8]>::to_vec)
    }

    // ===== Internals =====

    fn check_live(&self) {
        assert!(
            self.shared.refs.load(Ordering::Acquire) > 0,
            "buffer accessed after release"
        );
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.check_live();
        let region = self.shared.region.read();
        let all = region.bytes();
        match self.view {
            Some(v) => f(&all[v.off..v.off + v.len]),
            None => f(all),
        }
    }

    fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.check_live();
        let mut region = self.shared.region.write();
        let view = self.view;
        let all = region.bytes_mut();
        match view {
            Some(v) => f(&mut all[v.off..v.off + v.len]),
            None => f(all),
        }
    }
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuf")
            .field("read_idx", &self.read_idx)
            .field("write_idx", &self.write_idx)
            .field("capacity", &self.capacity())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Allocate a replacement region of `capacity` bytes, pooled from the same
/// arena when the old region was pooled and the size still pools.
fn allocate_region_like(old: &Region, capacity: usize) -> Result<Region> {
    match &old.kind {
        RegionKind::Pooled { arena, .. } if capacity <= NORMAL_CEILING => {
            let parts = arena.allocate(capacity)?;
            Ok(Region {
                kind: RegionKind::Pooled {
                    arena: arena.clone(),
                    chunk: parts.chunk,
                    handle: parts.handle,
                    offset: parts.offset,
                },
                capacity,
                slot_cap: parts.slot_cap,
            })
        }
        _ => Ok(Region {
            kind: RegionKind::Unpooled {
                data: vec![0u8; capacity].into_boxed_slice(),
            },
            capacity,
            slot_cap: capacity,
        }),
    }
}
