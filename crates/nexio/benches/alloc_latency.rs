// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Bench code readability over pedantic
#![allow(clippy::cast_possible_truncation)] // Bench parameters
#![allow(clippy::missing_panics_doc)] // Benches panic on failure

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nexio::{AllocatorConfig, PooledAllocator};

// ============================================================================
// Pooled allocation benchmarks
// ============================================================================

fn bench_allocate_release_tiny(c: &mut Criterion) {
    c.bench_function("alloc_release_256b", |b| {
        let alloc = PooledAllocator::with_config(AllocatorConfig {
            arena_count: 1,
            cache_slots_per_class: 16,
        });
        b.iter(|| {
            let buf = alloc.allocate(black_box(256), 256).expect("alloc");
            buf.release();
        });
        alloc.trim_current_thread_cache();
    });
}

fn bench_allocate_release_small(c: &mut Criterion) {
    c.bench_function("alloc_release_4k", |b| {
        let alloc = PooledAllocator::with_config(AllocatorConfig {
            arena_count: 1,
            cache_slots_per_class: 16,
        });
        b.iter(|| {
            let buf = alloc.allocate(black_box(4096), 4096).expect("alloc");
            buf.release();
        });
        alloc.trim_current_thread_cache();
    });
}

fn bench_allocate_release_normal(c: &mut Criterion) {
    c.bench_function("alloc_release_64k", |b| {
        let alloc = PooledAllocator::with_config(AllocatorConfig {
            arena_count: 1,
            cache_slots_per_class: 16,
        });
        b.iter(|| {
            let buf = alloc.allocate(black_box(64 * 1024), 64 * 1024).expect("alloc");
            buf.release();
        });
    });
}

fn bench_write_read_cursor_ops(c: &mut Criterion) {
    c.bench_function("bytebuf_write_read_u64", |b| {
        let alloc = PooledAllocator::with_config(AllocatorConfig {
            arena_count: 1,
            cache_slots_per_class: 16,
        });
        let mut buf = alloc.allocate(4096, 4096).expect("alloc");
        b.iter(|| {
            buf.clear();
            for i in 0..64u64 {
                buf.write_u64(black_box(i)).expect("write");
            }
            for _ in 0..64 {
                black_box(buf.read_u64());
            }
        });
        buf.release();
        alloc.trim_current_thread_cache();
    });
}

criterion_group!(
    benches,
    bench_allocate_release_tiny,
    bench_allocate_release_small,
    bench_allocate_release_normal,
    bench_write_read_cursor_ops
);
criterion_main!(benches);
