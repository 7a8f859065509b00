// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A chunk: one contiguous 16 MiB region managed by a buddy tree.
//!
//! The tree has `MAX_ORDER + 1` levels; leaves are 8 KiB pages. A node at
//! depth `d` spans `CHUNK_SIZE >> d` bytes. Allocation marks a node unusable
//! and propagates the change to the root; freeing restores the node's own
//! depth and re-merges fully free buddies on the way up.
//!
//! Handles pack the addressing the same way `SlabHandle` packs pool/slot:
//! a plain run handle is the node id, a subpage handle carries the bitmap
//! index in the upper half plus a marker bit.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::subpage::Subpage;
use super::{CHUNK_SIZE, MAX_ORDER, PAGE_SIZE};

/// Marks a buddy node as fully allocated.
const UNUSABLE: u8 = (MAX_ORDER + 1) as u8;

/// Marker bit distinguishing subpage handles from run handles.
const SUBPAGE_BIT: i64 = 0x4000_0000_0000_0000;

static NEXT_CHUNK_ID: AtomicU64 = AtomicU64::new(1);

/// Encode a subpage allocation: marker | bitmap index | leaf node id.
pub(crate) fn subpage_handle(node: u32, bitmap_idx: u32) -> i64 {
    SUBPAGE_BIT | (i64::from(bitmap_idx) << 32) | i64::from(node)
}

pub(crate) fn is_subpage_handle(handle: i64) -> bool {
    handle & SUBPAGE_BIT != 0
}

pub(crate) fn handle_node(handle: i64) -> u32 {
    (handle & 0xFFFF_FFFF) as u32
}

pub(crate) fn handle_bitmap_idx(handle: i64) -> u32 {
    ((handle & !SUBPAGE_BIT) >> 32) as u32
}

/// Buddy-tree bookkeeping plus the subpages carved out of leaf pages.
///
/// Locked by the owning arena; lock order is always arena -> chunk.
pub(crate) struct ChunkState {
    /// `memory_map[id]` = shallowest depth at which `id`'s subtree can still
    /// satisfy an allocation; `UNUSABLE` when fully allocated.
    memory_map: Vec<u8>,
    /// Immutable depth of each node (floor(log2(id))).
    depth_map: Vec<u8>,
    /// Live subpages keyed by their leaf node id.
    pub(crate) subpages: HashMap<u32, Subpage>,
    /// Bytes still allocatable from the buddy tree.
    pub(crate) free_bytes: usize,
    /// Usage bucket this chunk currently sits in (maintained by the arena).
    pub(crate) bucket: usize,
}

/// One pooled memory region.
pub(crate) struct Chunk {
    id: u64,
    memory: UnsafeCell<Box<[u8]>>,
    pub(crate) state: Mutex<ChunkState>,
}

// SAFETY: the raw memory is only dereferenced through `slice`/`slice_mut`,
// whose callers guarantee exclusive logical ownership of the addressed slot
// (buddy/bitmap bookkeeping hands each slot to exactly one buffer, and the
// buffer serializes its own accesses).
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    pub(crate) fn new() -> Arc<Self> {
        let node_count = 1usize << (MAX_ORDER + 1);
        let mut memory_map = vec![0u8; node_count];
        let mut depth_map = vec![0u8; node_count];
        for id in 1..node_count {
            let depth = (usize::BITS - 1 - (id as usize).leading_zeros()) as u8;
            memory_map[id] = depth;
            depth_map[id] = depth;
        }
        let id = NEXT_CHUNK_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!("[Alloc] chunk {} created ({} bytes)", id, CHUNK_SIZE);
        Arc::new(Self {
            id,
            memory: UnsafeCell::new(vec![0u8; CHUNK_SIZE].into_boxed_slice()),
            state: Mutex::new(ChunkState {
                memory_map,
                depth_map,
                subpages: HashMap::new(),
                free_bytes: CHUNK_SIZE,
                bucket: 0,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Immutable view of `len` bytes at `offset`.
    ///
    /// SAFETY: caller must logically own `[offset, offset + len)` via a live
    /// allocation handle; concurrent readers of the same slot are fine,
    /// concurrent writers must be excluded by the caller.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= CHUNK_SIZE, "slot out of chunk bounds");
        let data = &*self.memory.get();
        &data[offset..offset + len]
    }

    /// Mutable view of `len` bytes at `offset`.
    ///
    /// SAFETY: caller must hold exclusive logical ownership of
    /// `[offset, offset + len)`; the buddy/bitmap bookkeeping guarantees slots
    /// never overlap, and the buffer layer serializes per-slot access.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= CHUNK_SIZE, "slot out of chunk bounds");
        let data = &mut *self.memory.get();
        &mut data[offset..offset + len]
    }
}

impl ChunkState {
    /// Allocate a run at `depth`, returning the node id.
    ///
    /// Walks down from the root picking whichever child can still satisfy the
    /// request; fails when the root itself cannot.
    pub(crate) fn allocate_run(&mut self, depth: u32) -> Option<u32> {
        if u32::from(self.memory_map[1]) > depth {
            return None;
        }
        let mut id = 1usize;
        for _ in 0..depth {
            id <<= 1;
            if u32::from(self.memory_map[id]) > depth {
                id ^= 1; // buddy
            }
        }
        debug_assert_eq!(self.memory_map[id], self.depth_map[id], "node not free");
        self.memory_map[id] = UNUSABLE;
        self.update_parents_alloc(id);
        self.free_bytes -= CHUNK_SIZE >> depth;
        Some(id as u32)
    }

    /// Return a run to the tree, re-merging buddies where possible.
    pub(crate) fn free_run(&mut self, node: u32) {
        let id = node as usize;
        debug_assert_eq!(self.memory_map[id], UNUSABLE, "freeing an unallocated run");
        self.memory_map[id] = self.depth_map[id];
        self.free_bytes += CHUNK_SIZE >> u32::from(self.depth_map[id]);
        self.update_parents_free(id);
    }

    pub(crate) fn run_length(&self, node: u32) -> usize {
        CHUNK_SIZE >> u32::from(self.depth_map[node as usize])
    }

    pub(crate) fn run_offset(&self, node: u32) -> usize {
        let depth = u32::from(self.depth_map[node as usize]);
        let shifted = (node as usize) ^ (1usize << depth);
        shifted * self.run_length(node)
    }

    /// Allocate one leaf page and install a subpage of `elem_size` slots on
    /// it. Returns the leaf node id.
    pub(crate) fn allocate_subpage_run(&mut self, elem_size: usize) -> Option<u32> {
        let node = self.allocate_run(MAX_ORDER)?;
        debug_assert_eq!(self.run_length(node), PAGE_SIZE);
        self.subpages.insert(node, Subpage::new(elem_size));
        Some(node)
    }

    /// Drop an exhausted-then-emptied subpage and free its page.
    pub(crate) fn release_subpage_run(&mut self, node: u32) {
        let removed = self.subpages.remove(&node);
        debug_assert!(removed.is_some(), "releasing unknown subpage");
        self.free_run(node);
    }

    fn update_parents_alloc(&mut self, mut id: usize) {
        while id > 1 {
            let parent = id >> 1;
            let v1 = self.memory_map[id];
            let v2 = self.memory_map[id ^ 1];
            self.memory_map[parent] = v1.min(v2);
            id = parent;
        }
    }

    fn update_parents_free(&mut self, mut id: usize) {
        while id > 1 {
            let parent = id >> 1;
            let own_depth = self.depth_map[id];
            let v1 = self.memory_map[id];
            let v2 = self.memory_map[id ^ 1];
            if v1 == own_depth && v2 == own_depth {
                // both buddies fully free: the parent becomes one free block
                self.memory_map[parent] = self.depth_map[parent];
            } else {
                self.memory_map[parent] = v1.min(v2);
            }
            id = parent;
        }
    }
}
