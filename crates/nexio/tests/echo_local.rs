// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Echo over the in-process transport.
//!
//! A pair of channels on two loops; the server bounces every buffer back.
//! Validates delivery order, write-promise resolution, and that every
//! buffer returns to its arena.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use nexio::{
    local_pair, AllocatorConfig, ChannelConfig, Context, EventLoopGroup, Handler, Message,
    PooledAllocator, Promise, Result,
};

struct EchoServer;

impl Handler for EchoServer {
    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<()> {
        match ctx.channel() {
            Some(ch) => {
                ch.write_and_flush(msg);
            }
            None => msg.release(),
        }
        Ok(())
    }
}

struct Collect {
    sink: Arc<Mutex<Vec<Vec<u8>>>>,
    expected: usize,
    done: Promise,
}

impl Handler for Collect {
    fn channel_read(&mut self, _ctx: &Context, msg: Message) -> Result<()> {
        if let Some(buf) = msg.as_buf() {
            self.sink.lock().push(buf.to_vec());
        }
        msg.release();
        if self.sink.lock().len() >= self.expected {
            let _ = self.done.succeed();
        }
        Ok(())
    }
}

fn trim_on(loops: &EventLoopGroup, allocator: &Arc<PooledAllocator>) {
    for handle in loops.handles() {
        let a = allocator.clone();
        let flushed = Promise::new();
        let p = flushed.clone();
        handle.submit(move || {
            a.trim_current_thread_cache();
            let _ = p.succeed();
        });
        assert!(
            flushed.wait_timeout(Duration::from_secs(5)).is_some(),
            "cache trim ran on the loop"
        );
    }
    allocator.trim_current_thread_cache();
}

#[test]
fn test_echo_roundtrip_ordering_and_refcounts() {
    let group = EventLoopGroup::new(2, "echo").expect("group");
    let allocator = Arc::new(PooledAllocator::with_config(AllocatorConfig {
        arena_count: 1,
        cache_slots_per_class: 8,
    }));
    let (client, server) = local_pair(&allocator, ChannelConfig::default());

    server
        .pipeline()
        .add_last("echo", EchoServer)
        .expect("echo handler");

    let sink = Arc::new(Mutex::new(Vec::new()));
    let done = Promise::new();
    client
        .pipeline()
        .add_last(
            "collect",
            Collect {
                sink: sink.clone(),
                expected: 3,
                done: done.clone(),
            },
        )
        .expect("collect handler");

    group.handles()[0]
        .register(&server)
        .wait_timeout(Duration::from_secs(5))
        .expect("server registration completed")
        .expect("server registration succeeded");
    group.handles()[1]
        .register(&client)
        .wait_timeout(Duration::from_secs(5))
        .expect("client registration completed")
        .expect("client registration succeeded");
    assert!(server.is_active());
    assert!(client.is_active());

    let payloads: [&[u8]; 3] = [b"a", b"bb", b"ccc"];
    let mut write_promises = Vec::new();
    for payload in payloads {
        let mut buf = allocator.allocate(16, 64).expect("payload buffer");
        buf.write_bytes(payload).expect("payload fits");
        write_promises.push(client.write(Message::Buf(buf)));
    }
    client.flush();

    done.wait_timeout(Duration::from_secs(5))
        .expect("echo round trip completed")
        .expect("collect reported success");

    for (i, p) in write_promises.iter().enumerate() {
        let outcome = p
            .wait_timeout(Duration::from_secs(5))
            .expect("write promise resolved");
        assert!(outcome.is_ok(), "write {} succeeded", i);
    }
    assert_eq!(*sink.lock(), vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);

    client
        .close()
        .wait_timeout(Duration::from_secs(5))
        .expect("close completed")
        .expect("close succeeded");
    server
        .close_future()
        .wait_timeout(Duration::from_secs(5))
        .expect("peer closed with the client");

    // Every buffer travelled client -> server -> client and was released;
    // after flushing the per-thread caches the arena must be clean.
    trim_on(&group, &allocator);
    assert_eq!(allocator.stats().active_allocations, 0);

    group.shutdown();
}

#[test]
fn test_write_on_closed_channel_fails_immediately() {
    let group = EventLoopGroup::new(1, "closed").expect("group");
    let allocator = Arc::new(PooledAllocator::new());
    let (client, server) = local_pair(&allocator, ChannelConfig::default());

    group.handles()[0]
        .register(&client)
        .wait_timeout(Duration::from_secs(5))
        .expect("registration completed")
        .expect("registration succeeded");
    group.handles()[0]
        .register(&server)
        .wait_timeout(Duration::from_secs(5))
        .expect("registration completed")
        .expect("registration succeeded");

    client
        .close()
        .wait_timeout(Duration::from_secs(5))
        .expect("close completed")
        .expect("close succeeded");

    let mut buf = allocator.allocate(8, 8).expect("buffer");
    buf.write_bytes(b"late").expect("fits");
    let outcome = client
        .write(Message::Buf(buf))
        .wait_timeout(Duration::from_secs(5))
        .expect("write resolved");
    assert!(
        matches!(outcome, Err(nexio::Error::ChannelClosed)),
        "late write fails with the closed-channel error, got {:?}",
        outcome
    );

    group.shutdown();
}
