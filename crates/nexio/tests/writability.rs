// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writability toggling against the water marks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nexio::{
    local_pair, ChannelConfig, Context, EventLoopGroup, Handler, Message, PooledAllocator,
    Promise, Result,
};

const KIB: usize = 1024;

struct WritabilityWatch {
    edges: Arc<AtomicUsize>,
    went_unwritable: Promise,
    went_writable: Promise,
}

impl Handler for WritabilityWatch {
    fn channel_writability_changed(&mut self, ctx: &Context) -> Result<()> {
        self.edges.fetch_add(1, Ordering::SeqCst);
        if let Some(ch) = ctx.channel() {
            if ch.is_writable() {
                let _ = self.went_writable.succeed();
            } else {
                let _ = self.went_unwritable.succeed();
            }
        }
        ctx.fire_channel_writability_changed();
        Ok(())
    }
}

#[test]
fn test_water_mark_edges_fire_exactly_once() {
    let group = EventLoopGroup::new(2, "wm").expect("group");
    let allocator = Arc::new(PooledAllocator::new());
    let config = ChannelConfig {
        high_water_mark: 64 * KIB,
        low_water_mark: 32 * KIB,
        ..ChannelConfig::default()
    };
    let (writer, reader) = local_pair(&allocator, config);

    let edges = Arc::new(AtomicUsize::new(0));
    let went_unwritable = Promise::new();
    let went_writable = Promise::new();
    writer
        .pipeline()
        .add_last(
            "watch",
            WritabilityWatch {
                edges: edges.clone(),
                went_unwritable: went_unwritable.clone(),
                went_writable: went_writable.clone(),
            },
        )
        .expect("watch handler");

    group.handles()[0]
        .register(&writer)
        .wait_timeout(Duration::from_secs(5))
        .expect("registration completed")
        .expect("registration succeeded");
    group.handles()[1]
        .register(&reader)
        .wait_timeout(Duration::from_secs(5))
        .expect("registration completed")
        .expect("registration succeeded");

    assert!(writer.is_writable());

    // Queue 100 KiB without flushing: one unwritable edge at 64 KiB.
    for _ in 0..10 {
        let mut buf = allocator.allocate(10 * KIB, 10 * KIB).expect("chunk");
        buf.write_bytes(&vec![0u8; 10 * KIB]).expect("fill");
        writer.write(Message::Buf(buf));
    }
    went_unwritable
        .wait_timeout(Duration::from_secs(5))
        .expect("unwritable edge fired")
        .expect("edge report ok");
    assert!(!writer.is_writable());
    assert_eq!(edges.load(Ordering::SeqCst), 1, "exactly one high-water edge");

    // Flush drains the queue; writability returns with one more edge.
    writer.flush();
    went_writable
        .wait_timeout(Duration::from_secs(5))
        .expect("writable edge fired")
        .expect("edge report ok");
    assert!(writer.is_writable());
    assert_eq!(edges.load(Ordering::SeqCst), 2, "exactly one low-water edge");

    group.shutdown();
}
