// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! An arena: a set of chunks plus per-size-class subpage pools.
//!
//! Chunks are kept in usage buckets (0/25/50/75/100 %) so allocation wear
//! spreads across partially-full chunks instead of hammering the freshest
//! one. Any thread may free into any arena; the arena lock serializes all
//! bookkeeping, and the chunk lock nests strictly inside it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::chunk::{
    handle_bitmap_idx, handle_node, is_subpage_handle, subpage_handle, Chunk,
};
use super::{
    normalize_capacity, small_class_index, tiny_class_index, CHUNK_SIZE, MAX_ORDER,
    NORMAL_CEILING, PAGE_SHIFT, PAGE_SIZE, SMALL_CLASS_COUNT, SMALL_FLOOR, TINY_CLASS_COUNT,
};
use crate::error::{Error, Result};

/// Usage buckets; fresh chunks start in `QINIT` and never return to it.
const QINIT: usize = 0;
const Q000: usize = 1;
const Q025: usize = 2;
const Q050: usize = 3;
const Q075: usize = 4;
const Q100: usize = 5;
const BUCKET_COUNT: usize = 6;

/// Allocation preference: mostly-full first so sparse chunks can drain.
const ALLOC_ORDER: [usize; 5] = [Q050, Q025, Q000, QINIT, Q075];

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// One pooled slot as handed to the buffer layer.
pub(crate) struct SlotParts {
    pub(crate) arena: Arc<Arena>,
    pub(crate) chunk: Arc<Chunk>,
    pub(crate) handle: i64,
    pub(crate) offset: usize,
    /// Size actually reserved (normalized); logical capacity may be smaller.
    pub(crate) slot_cap: usize,
}

/// Reference to a subpage with free slots, kept in a per-class pool list.
struct PoolRef {
    chunk: Arc<Chunk>,
    node: u32,
}

struct ArenaInner {
    buckets: [Vec<Arc<Chunk>>; BUCKET_COUNT],
    tiny_pools: Vec<Vec<PoolRef>>,
    small_pools: Vec<Vec<PoolRef>>,
}

pub(crate) struct Arena {
    /// Globally unique (used to key thread-local caches).
    gid: u64,
    /// Per-thread cached free slots per size class (allocator config).
    cache_slots: usize,
    inner: Mutex<ArenaInner>,
    active: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArenaStats {
    pub(crate) chunks: usize,
    pub(crate) free_bytes: usize,
    pub(crate) active_allocations: usize,
}

impl Arena {
    pub(crate) fn new(cache_slots: usize) -> Arc<Self> {
        Arc::new(Self {
            gid: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            cache_slots,
            inner: Mutex::new(ArenaInner {
                buckets: Default::default(),
                tiny_pools: (0..TINY_CLASS_COUNT).map(|_| Vec::new()).collect(),
                small_pools: (0..SMALL_CLASS_COUNT).map(|_| Vec::new()).collect(),
            }),
            active: AtomicUsize::new(0),
        })
    }

    pub(crate) fn gid(&self) -> u64 {
        self.gid
    }

    pub(crate) fn cache_slots(&self) -> usize {
        self.cache_slots
    }

    /// Serve one pooled allocation of at least `capacity` bytes.
    ///
    /// Caller guarantees `capacity <= NORMAL_CEILING`; larger requests are
    /// unpooled and never reach an arena.
    pub(crate) fn allocate(self: &Arc<Self>, capacity: usize) -> Result<SlotParts> {
        debug_assert!(capacity <= NORMAL_CEILING);
        let norm = normalize_capacity(capacity);
        let parts = if norm < PAGE_SIZE {
            self.allocate_subpage(norm)
        } else {
            self.allocate_normal(norm)
        }?;
        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(parts)
    }

    /// Return a slot; callable from any thread.
    pub(crate) fn free(&self, chunk: &Arc<Chunk>, handle: i64, slot_cap: usize) {
        let mut inner = self.inner.lock();
        {
            let mut state = chunk.state.lock();
            if is_subpage_handle(handle) {
                let node = handle_node(handle);
                let sp = state
                    .subpages
                    .get_mut(&node)
                    .expect("subpage handle points at a live subpage");
                let was_full = sp.is_full();
                sp.free(handle_bitmap_idx(handle));
                let elem = sp.elem_size();
                if sp.is_empty() {
                    Self::unpool_subpage(&mut inner, chunk, node, elem);
                    state.release_subpage_run(node);
                } else if was_full {
                    Self::pool_for(&mut inner, elem).push(PoolRef {
                        chunk: chunk.clone(),
                        node,
                    });
                }
            } else {
                debug_assert_eq!(state.run_length(handle_node(handle)), slot_cap);
                state.free_run(handle_node(handle));
            }
        }
        self.rebucket(&mut inner, chunk);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> ArenaStats {
        let inner = self.inner.lock();
        let mut chunks = 0;
        let mut free_bytes = 0;
        for bucket in &inner.buckets {
            for chunk in bucket {
                chunks += 1;
                free_bytes += chunk.state.lock().free_bytes;
            }
        }
        ArenaStats {
            chunks,
            free_bytes,
            active_allocations: self.active.load(Ordering::Relaxed),
        }
    }

    // ===== Subpage path (tiny/small) =====

    fn allocate_subpage(self: &Arc<Self>, norm: usize) -> Result<SlotParts> {
        let mut inner = self.inner.lock();

        // Fast path: a partially-used subpage of this class already exists.
        loop {
            let pool = Self::pool_for(&mut inner, norm);
            let Some(pr) = pool.first() else { break };
            let chunk = pr.chunk.clone();
            let node = pr.node;
            let mut state = chunk.state.lock();
            let sp = state
                .subpages
                .get_mut(&node)
                .expect("pooled subpage is live");
            match sp.allocate() {
                Some(bitmap_idx) => {
                    let offset = state.run_offset(node)
                        + state.subpages[&node].slot_offset(bitmap_idx);
                    let is_full = state.subpages[&node].is_full();
                    drop(state);
                    if is_full {
                        Self::pool_for(&mut inner, norm).remove(0);
                    }
                    return Ok(SlotParts {
                        arena: self.clone(),
                        chunk,
                        handle: subpage_handle(node, bitmap_idx),
                        offset,
                        slot_cap: norm,
                    });
                }
                None => {
                    // Stale entry (raced full); drop it and retry.
                    drop(state);
                    Self::pool_for(&mut inner, norm).remove(0);
                }
            }
        }

        // Slow path: carve a fresh page into slots of this class.
        let (chunk, node) = self.claim_subpage_run(&mut inner, norm)?;
        let (offset, bitmap_idx) = {
            let mut state = chunk.state.lock();
            let sp = state
                .subpages
                .get_mut(&node)
                .expect("freshly installed subpage");
            let bitmap_idx = sp.allocate().expect("fresh subpage has slots");
            let offset = state.run_offset(node) + state.subpages[&node].slot_offset(bitmap_idx);
            (offset, bitmap_idx)
        };
        Self::pool_for(&mut inner, norm).push(PoolRef {
            chunk: chunk.clone(),
            node,
        });
        self.rebucket(&mut inner, &chunk);
        Ok(SlotParts {
            arena: self.clone(),
            chunk,
            handle: subpage_handle(node, bitmap_idx),
            offset,
            slot_cap: norm,
        })
    }

    fn claim_subpage_run(
        self: &Arc<Self>,
        inner: &mut ArenaInner,
        elem_size: usize,
    ) -> Result<(Arc<Chunk>, u32)> {
        for &bucket in &ALLOC_ORDER {
            for chunk in &inner.buckets[bucket] {
                let node = chunk.state.lock().allocate_subpage_run(elem_size);
                if let Some(node) = node {
                    return Ok((chunk.clone(), node));
                }
            }
        }
        let chunk = Chunk::new();
        let node = chunk
            .state
            .lock()
            .allocate_subpage_run(elem_size)
            .ok_or_else(|| Error::alloc("fresh chunk could not serve a page"))?;
        inner.buckets[QINIT].push(chunk.clone());
        Ok((chunk, node))
    }

    fn pool_for(inner: &mut ArenaInner, elem_size: usize) -> &mut Vec<PoolRef> {
        if elem_size < SMALL_FLOOR {
            &mut inner.tiny_pools[tiny_class_index(elem_size)]
        } else {
            &mut inner.small_pools[small_class_index(elem_size)]
        }
    }

    fn unpool_subpage(inner: &mut ArenaInner, chunk: &Arc<Chunk>, node: u32, elem_size: usize) {
        let pool = Self::pool_for(inner, elem_size);
        pool.retain(|pr| !(Arc::ptr_eq(&pr.chunk, chunk) && pr.node == node));
    }

    // ===== Normal path (page multiples via the buddy tree) =====

    fn allocate_normal(self: &Arc<Self>, norm: usize) -> Result<SlotParts> {
        debug_assert!(norm >= PAGE_SIZE && norm.is_power_of_two());
        let depth = MAX_ORDER - (norm >> PAGE_SHIFT).trailing_zeros();
        let mut inner = self.inner.lock();

        for &bucket in &ALLOC_ORDER {
            for i in 0..inner.buckets[bucket].len() {
                let chunk = inner.buckets[bucket][i].clone();
                let node = {
                    let mut state = chunk.state.lock();
                    state.allocate_run(depth).map(|n| (n, state.run_offset(n)))
                };
                if let Some((node, offset)) = node {
                    self.rebucket(&mut inner, &chunk);
                    return Ok(SlotParts {
                        arena: self.clone(),
                        chunk,
                        handle: i64::from(node),
                        offset,
                        slot_cap: norm,
                    });
                }
            }
        }

        let chunk = Chunk::new();
        let (node, offset) = {
            let mut state = chunk.state.lock();
            let node = state
                .allocate_run(depth)
                .ok_or_else(|| Error::alloc("fresh chunk could not serve the run"))?;
            (node, state.run_offset(node))
        };
        inner.buckets[QINIT].push(chunk.clone());
        self.rebucket(&mut inner, &chunk);
        Ok(SlotParts {
            arena: self.clone(),
            chunk,
            handle: i64::from(node),
            offset,
            slot_cap: norm,
        })
    }

    // ===== Bucket maintenance =====

    fn rebucket(&self, inner: &mut ArenaInner, chunk: &Arc<Chunk>) {
        let (free, current) = {
            let state = chunk.state.lock();
            (state.free_bytes, state.bucket)
        };
        let usage = 100 - free * 100 / CHUNK_SIZE;

        // A chunk that drained back to fully free (and has been used) is
        // released; its memory drops with the last buffer that references it.
        if free == CHUNK_SIZE && current != QINIT {
            inner.buckets[current].retain(|c| !Arc::ptr_eq(c, chunk));
            log::debug!("[Alloc] arena {} released empty chunk {}", self.gid, chunk.id());
            return;
        }

        let target = if usage == 100 {
            Q100
        } else if usage >= 75 {
            Q075
        } else if usage >= 50 {
            Q050
        } else if usage >= 25 {
            Q025
        } else if usage > 0 {
            Q000
        } else {
            current // fresh and untouched: stays in QINIT
        };
        if target != current {
            inner.buckets[current].retain(|c| !Arc::ptr_eq(c, chunk));
            inner.buckets[target].push(chunk.clone());
            chunk.state.lock().bucket = target;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiny_allocation_is_subpage_backed() {
        let arena = Arena::new(16);
        let parts = arena.allocate(24).expect("tiny alloc");
        assert!(is_subpage_handle(parts.handle));
        assert_eq!(parts.slot_cap, 32);
        arena.free(&parts.chunk, parts.handle, parts.slot_cap);
        assert_eq!(arena.stats().active_allocations, 0);
    }

    #[test]
    fn test_small_allocation_class() {
        let arena = Arena::new(16);
        let parts = arena.allocate(600).expect("small alloc");
        assert!(is_subpage_handle(parts.handle));
        assert_eq!(parts.slot_cap, 1024);
        arena.free(&parts.chunk, parts.handle, parts.slot_cap);
    }

    #[test]
    fn test_normal_allocation_uses_buddy_run() {
        let arena = Arena::new(16);
        let parts = arena.allocate(100_000).expect("normal alloc");
        assert!(!is_subpage_handle(parts.handle));
        assert_eq!(parts.slot_cap, 131_072);
        arena.free(&parts.chunk, parts.handle, parts.slot_cap);
    }

    #[test]
    fn test_same_class_shares_subpage() {
        let arena = Arena::new(16);
        let a = arena.allocate(100).expect("a");
        let b = arena.allocate(100).expect("b");
        assert!(Arc::ptr_eq(&a.chunk, &b.chunk));
        assert_eq!(handle_node(a.handle), handle_node(b.handle));
        assert_ne!(a.offset, b.offset);
        arena.free(&a.chunk, a.handle, a.slot_cap);
        arena.free(&b.chunk, b.handle, b.slot_cap);
    }

    #[test]
    fn test_free_restores_arena_capacity() {
        let arena = Arena::new(16);
        let mut live = Vec::new();
        for _ in 0..64 {
            live.push(arena.allocate(PAGE_SIZE).expect("page run"));
        }
        let used = arena.stats();
        assert_eq!(used.active_allocations, 64);
        for parts in live {
            arena.free(&parts.chunk, parts.handle, parts.slot_cap);
        }
        let after = arena.stats();
        assert_eq!(after.active_allocations, 0);
        // Fully drained chunks are released outright.
        assert_eq!(after.chunks * CHUNK_SIZE, after.free_bytes);
    }

    #[test]
    fn test_cross_thread_free() {
        let arena = Arena::new(16);
        let parts = arena.allocate(2048).expect("alloc");
        let arena2 = arena.clone();
        std::thread::spawn(move || {
            arena2.free(&parts.chunk, parts.handle, parts.slot_cap);
        })
        .join()
        .expect("free thread");
        assert_eq!(arena.stats().active_allocations, 0);
    }
}
