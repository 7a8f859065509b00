// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Bench code readability over pedantic

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nexio::{FlushNotifier, Promise};

fn bench_add_increase_notify(c: &mut Criterion) {
    c.bench_function("flush_notifier_cycle_16", |b| {
        b.iter(|| {
            let mut notifier = FlushNotifier::new();
            for _ in 0..16 {
                notifier.add(Promise::new(), black_box(128));
            }
            notifier.increase(16 * 128);
            notifier.notify_success();
            black_box(notifier.write_counter())
        });
    });
}

fn bench_interleaved_chunked_flush(c: &mut Criterion) {
    c.bench_function("flush_notifier_chunked", |b| {
        b.iter(|| {
            let mut notifier = FlushNotifier::new();
            for round in 0..8u64 {
                notifier.add(Promise::new(), 1024);
                // Two partial flushes per queued write
                notifier.increase(512);
                notifier.notify_success();
                notifier.increase(512 + round % 3);
                notifier.notify_success();
            }
            black_box(notifier.pending_promises())
        });
    });
}

criterion_group!(benches, bench_add_increase_notify, bench_interleaved_chunked_flush);
criterion_main!(benches);
