// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The pooled allocator: arenas, thread binding, and the thread-local
//! free-slot cache.
//!
//! Arenas serialize internally, so any thread may allocate and any thread
//! may free. Contention is spread two ways: threads bind to an arena
//! round-robin on first use, and frees of tiny/small slots park in a small
//! per-thread cache so the next same-class allocation skips the arena lock.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::arena::{Arena, SlotParts};
use super::chunk::Chunk;
use super::{normalize_capacity, small_class_index, tiny_class_index, ByteBuf};
use super::{NORMAL_CEILING, PAGE_SIZE, SMALL_CLASS_COUNT, SMALL_FLOOR, TINY_CLASS_COUNT};
use crate::error::{Error, Result};

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Per-thread arena bindings (keyed by allocator id) and slot caches
    /// (keyed by arena gid).
    static BINDINGS: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
    static CACHES: RefCell<HashMap<u64, ClassCaches>> = RefCell::new(HashMap::new());
}

/// Cached free slot, ready for same-class reuse without the arena lock.
struct CachedSlot {
    arena: Arc<Arena>,
    chunk: Arc<Chunk>,
    handle: i64,
    offset: usize,
    slot_cap: usize,
}

struct ClassCaches {
    tiny: Vec<Vec<CachedSlot>>,
    small: Vec<Vec<CachedSlot>>,
    per_class: usize,
}

impl ClassCaches {
    fn new(per_class: usize) -> Self {
        Self {
            tiny: (0..TINY_CLASS_COUNT).map(|_| Vec::new()).collect(),
            small: (0..SMALL_CLASS_COUNT).map(|_| Vec::new()).collect(),
            per_class,
        }
    }

    fn slot_list(&mut self, norm: usize) -> &mut Vec<CachedSlot> {
        if norm < SMALL_FLOOR {
            &mut self.tiny[tiny_class_index(norm)]
        } else {
            &mut self.small[small_class_index(norm)]
        }
    }
}

impl Drop for ClassCaches {
    fn drop(&mut self) {
        for list in self.tiny.iter_mut().chain(self.small.iter_mut()) {
            for slot in list.drain(..) {
                slot.arena.free(&slot.chunk, slot.handle, slot.slot_cap);
            }
        }
    }
}

/// Return a pooled slot; small slots park in the freeing thread's cache.
///
/// Called from the buffer layer on final release and on reallocation.
pub(crate) fn free_pooled_slot(
    arena: &Arc<Arena>,
    chunk: Arc<Chunk>,
    handle: i64,
    offset: usize,
    slot_cap: usize,
) {
    if slot_cap < PAGE_SIZE {
        let parked = CACHES.try_with(|caches| {
            let mut caches = caches.borrow_mut();
            let cache = caches
                .entry(arena.gid())
                .or_insert_with(|| ClassCaches::new(arena.cache_slots()));
            let per_class = cache.per_class;
            let list = cache.slot_list(slot_cap);
            if list.len() < per_class {
                list.push(CachedSlot {
                    arena: arena.clone(),
                    chunk: chunk.clone(),
                    handle,
                    offset,
                    slot_cap,
                });
                true
            } else {
                false
            }
        });
        if parked.unwrap_or(false) {
            return;
        }
    }
    arena.free(&chunk, handle, slot_cap);
}

const DEFAULT_CACHE_SLOTS: usize = 16;

/// Allocator configuration constants that are not size classes.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Number of arenas; defaults to twice the available parallelism.
    pub arena_count: usize,
    /// Cached free slots per size class per thread.
    pub cache_slots_per_class: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            arena_count: cpus * 2,
            cache_slots_per_class: DEFAULT_CACHE_SLOTS,
        }
    }
}

/// Aggregated allocator statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub arenas: usize,
    pub chunks: usize,
    pub free_bytes: usize,
    pub active_allocations: usize,
}

/// Size-classed, arena-backed buffer allocator.
///
/// Shared across event loops; see the module docs for the layout.
pub struct PooledAllocator {
    id: u64,
    arenas: Vec<Arc<Arena>>,
    next_arena: AtomicUsize,
}

impl PooledAllocator {
    pub fn new() -> Self {
        Self::with_config(AllocatorConfig::default())
    }

    pub fn with_config(config: AllocatorConfig) -> Self {
        let arena_count = config.arena_count.max(1);
        log::debug!("[Alloc] allocator with {} arenas", arena_count);
        Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            arenas: (0..arena_count)
                .map(|_| Arena::new(config.cache_slots_per_class))
                .collect(),
            next_arena: AtomicUsize::new(0),
        }
    }

    /// Allocate a buffer with `read_idx = write_idx = 0`.
    ///
    /// Requests above half a chunk bypass the pools entirely and are freed
    /// outright at release.
    pub fn allocate(&self, initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf> {
        if initial_capacity > max_capacity {
            return Err(Error::alloc(format!(
                "initial capacity {} above max capacity {}",
                initial_capacity, max_capacity
            )));
        }
        if initial_capacity > NORMAL_CEILING {
            return Ok(ByteBuf::new_unpooled(initial_capacity, max_capacity));
        }
        let arena = self.bound_arena();
        if let Some(parts) = take_cached(&arena, initial_capacity) {
            return Ok(ByteBuf::new_pooled(parts, initial_capacity, max_capacity));
        }
        let parts = arena.allocate(initial_capacity)?;
        Ok(ByteBuf::new_pooled(parts, initial_capacity, max_capacity))
    }

    /// Grow or shrink `buf` to `new_capacity`, preserving the readable
    /// window. See [`ByteBuf::ensure_writable`] for the auto-growth path.
    pub fn reallocate(&self, buf: &mut ByteBuf, new_capacity: usize) -> Result<()> {
        buf.adjust_capacity(new_capacity)
    }

    /// Flush this thread's cached slots back to their arenas.
    pub fn trim_current_thread_cache(&self) {
        CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            for arena in &self.arenas {
                caches.remove(&arena.gid());
            }
        });
    }

    pub fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats {
            arenas: self.arenas.len(),
            chunks: 0,
            free_bytes: 0,
            active_allocations: 0,
        };
        for arena in &self.arenas {
            let s = arena.stats();
            stats.chunks += s.chunks;
            stats.free_bytes += s.free_bytes;
            stats.active_allocations += s.active_allocations;
        }
        stats
    }

    /// Arena this thread is bound to, binding round-robin on first use.
    fn bound_arena(&self) -> Arc<Arena> {
        let idx = BINDINGS.with(|b| {
            *b.borrow_mut().entry(self.id).or_insert_with(|| {
                self.next_arena.fetch_add(1, Ordering::Relaxed) % self.arenas.len()
            })
        });
        self.arenas[idx].clone()
    }
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Pop a cached slot of the right class for `capacity`, if any.
fn take_cached(arena: &Arc<Arena>, capacity: usize) -> Option<SlotParts> {
    let norm = normalize_capacity(capacity);
    if norm >= PAGE_SIZE {
        return None;
    }
    CACHES.with(|caches| {
        let mut caches = caches.borrow_mut();
        let cache = caches.get_mut(&arena.gid())?;
        let slot = cache.slot_list(norm).pop()?;
        debug_assert_eq!(slot.slot_cap, norm);
        Some(SlotParts {
            arena: slot.arena,
            chunk: slot.chunk,
            handle: slot.handle,
            offset: slot.offset,
            slot_cap: slot.slot_cap,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_allocator() -> PooledAllocator {
        PooledAllocator::with_config(AllocatorConfig {
            arena_count: 1,
            cache_slots_per_class: 4,
        })
    }

    #[test]
    fn test_allocate_fresh_buffer_shape() {
        let alloc = small_allocator();
        let buf = alloc.allocate(100, 4096).expect("alloc");
        assert_eq!(buf.read_index(), 0);
        assert_eq!(buf.write_index(), 0);
        assert_eq!(buf.capacity(), 100);
        assert_eq!(buf.max_capacity(), 4096);
        buf.release();
        alloc.trim_current_thread_cache();
    }

    #[test]
    fn test_initial_above_max_fails() {
        let alloc = small_allocator();
        let err = alloc.allocate(128, 64).expect_err("must fail");
        assert!(matches!(err, Error::Allocation(_)));
    }

    #[test]
    fn test_huge_requests_are_unpooled() {
        let alloc = small_allocator();
        let buf = alloc
            .allocate(NORMAL_CEILING + 1, NORMAL_CEILING * 2)
            .expect("huge alloc");
        assert_eq!(buf.capacity(), NORMAL_CEILING + 1);
        buf.release();
        // Unpooled never touches the arenas
        assert_eq!(alloc.stats().chunks, 0);
    }

    #[test]
    fn test_release_restores_free_slots() {
        let alloc = small_allocator();
        let bufs: Vec<_> = (0..32)
            .map(|_| alloc.allocate(PAGE_SIZE, PAGE_SIZE).expect("page"))
            .collect();
        assert_eq!(alloc.stats().active_allocations, 32);
        for buf in bufs {
            buf.release();
        }
        alloc.trim_current_thread_cache();
        let after = alloc.stats();
        assert_eq!(after.active_allocations, 0);
        // Every surviving chunk is fully free again.
        assert_eq!(after.free_bytes, after.chunks * super::super::CHUNK_SIZE);
    }

    #[test]
    fn test_thread_cache_round_trip() {
        let alloc = small_allocator();
        let buf = alloc.allocate(64, 64).expect("tiny");
        buf.release();
        // The slot parked in the thread cache: arena still counts it active.
        assert_eq!(alloc.stats().active_allocations, 1);
        // Same-class allocation reuses it without touching the arena.
        let again = alloc.allocate(64, 64).expect("tiny again");
        assert_eq!(alloc.stats().active_allocations, 1);
        again.release();
        alloc.trim_current_thread_cache();
        assert_eq!(alloc.stats().active_allocations, 0);
    }

    #[test]
    fn test_reallocate_preserves_content() {
        let alloc = small_allocator();
        let mut buf = alloc.allocate(32, 8192).expect("alloc 32");
        let payload: Vec<u8> = (0u8..32).collect();
        buf.write_bytes(&payload).expect("fill");
        alloc.reallocate(&mut buf, 4096).expect("grow");
        assert_eq!(buf.capacity(), 4096);
        assert_eq!(buf.to_vec(), payload, "content must survive the move");
        // Subsequent writes extend normally
        buf.write_bytes(&[99]).expect("extend");
        assert_eq!(buf.readable_bytes(), 33);
        buf.release();
        alloc.trim_current_thread_cache();
    }

    #[test]
    fn test_suspended_deallocations_stash_old_slot() {
        let alloc = small_allocator();
        let mut buf = alloc.allocate(32, 65536).expect("alloc");
        buf.write_bytes(b"keep me").expect("fill");
        buf.suspend_deallocations();
        alloc.reallocate(&mut buf, 16384).expect("grow past slot");
        // Old slot stashed, not freed: arena still tracks two allocations.
        assert_eq!(alloc.stats().active_allocations, 2);
        buf.resume_deallocations();
        alloc.trim_current_thread_cache();
        assert_eq!(alloc.stats().active_allocations, 1);
        assert_eq!(buf.to_vec(), b"keep me");
        buf.release();
        alloc.trim_current_thread_cache();
    }

    #[test]
    fn test_concurrent_allocate_release() {
        let alloc = Arc::new(PooledAllocator::with_config(AllocatorConfig {
            arena_count: 2,
            cache_slots_per_class: 4,
        }));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let size = 16 + (i % 300) * 7;
                    let buf = alloc.allocate(size, size * 2).expect("alloc");
                    buf.release();
                }
                alloc.trim_current_thread_cache();
            }));
        }
        for h in handles {
            h.join().expect("worker");
        }
        assert_eq!(alloc.stats().active_allocations, 0);
    }
}
