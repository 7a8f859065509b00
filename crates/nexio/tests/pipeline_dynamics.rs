// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pipeline structure and event routing.
//!
//! Exercised on unregistered channels: with no loop attached, entry points
//! run inline, which keeps these tests single-threaded and deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use nexio::{
    local_pair, ChannelConfig, Context, Error, Handler, Message, PooledAllocator, Result,
    MASK_INBOUND,
};

fn test_channel() -> (Arc<nexio::Channel>, Arc<PooledAllocator>) {
    let allocator = Arc::new(PooledAllocator::new());
    let (a, _b) = local_pair(&allocator, ChannelConfig::default());
    (a, allocator)
}

#[derive(Default)]
struct Trace {
    reads: AtomicUsize,
    exceptions: Mutex<Vec<String>>,
    added: AtomicUsize,
    removed: AtomicUsize,
}

struct Probe {
    trace: Arc<Trace>,
    fail_reads: bool,
}

impl Handler for Probe {
    fn mask(&self) -> u8 {
        MASK_INBOUND
    }

    fn handler_added(&mut self, _ctx: &Context) -> Result<()> {
        self.trace.added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handler_removed(&mut self, _ctx: &Context) -> Result<()> {
        self.trace.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<()> {
        self.trace.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads {
            msg.release();
            return Err(Error::protocol("probe rejects reads"));
        }
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn exception_caught(&mut self, _ctx: &Context, cause: Error) -> Result<()> {
        self.trace.exceptions.lock().push(cause.to_string());
        Ok(())
    }
}

fn probe(trace: &Arc<Trace>) -> Probe {
    Probe {
        trace: trace.clone(),
        fail_reads: false,
    }
}

#[test]
fn test_add_then_remove_restores_structure() {
    let (ch, _alloc) = test_channel();
    let trace = Arc::new(Trace::default());

    assert!(ch.pipeline().names().is_empty());
    ch.pipeline().add_last("a", probe(&trace)).expect("add a");
    ch.pipeline().add_last("b", probe(&trace)).expect("add b");
    ch.pipeline()
        .add_before("b", "middle", probe(&trace))
        .expect("add middle");
    assert_eq!(ch.pipeline().names(), vec!["a", "middle", "b"]);

    ch.pipeline().remove("middle").expect("remove middle");
    ch.pipeline().remove("a").expect("remove a");
    ch.pipeline().remove("b").expect("remove b");
    assert!(ch.pipeline().names().is_empty(), "structure restored");

    // added/removed pair up into a well-formed sequence
    assert_eq!(trace.added.load(Ordering::SeqCst), 3);
    assert_eq!(trace.removed.load(Ordering::SeqCst), 3);
}

#[test]
fn test_duplicate_names_rejected() {
    let (ch, _alloc) = test_channel();
    let trace = Arc::new(Trace::default());
    ch.pipeline().add_last("dup", probe(&trace)).expect("first");
    let err = ch
        .pipeline()
        .add_last("dup", probe(&trace))
        .expect_err("duplicate must fail");
    assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn test_sentinel_names_protected() {
    let (ch, _alloc) = test_channel();
    let trace = Arc::new(Trace::default());
    assert!(ch.pipeline().add_last("head", probe(&trace)).is_err());
    assert!(ch.pipeline().remove("tail").is_err());
}

#[test]
fn test_exception_skips_to_next_context() {
    // Pipeline [a, b, c] where b fails reads: c must see the exception,
    // not the read.
    let (ch, alloc) = test_channel();
    let (ta, tb, tc) = (
        Arc::new(Trace::default()),
        Arc::new(Trace::default()),
        Arc::new(Trace::default()),
    );
    ch.pipeline().add_last("a", probe(&ta)).expect("a");
    ch.pipeline()
        .add_last(
            "b",
            Probe {
                trace: tb.clone(),
                fail_reads: true,
            },
        )
        .expect("b");
    ch.pipeline().add_last("c", probe(&tc)).expect("c");

    let mut buf = alloc.allocate(8, 8).expect("buffer");
    buf.write_bytes(b"x").expect("fits");
    ch.pipeline().fire_channel_read(Message::Buf(buf));

    assert_eq!(ta.reads.load(Ordering::SeqCst), 1);
    assert_eq!(tb.reads.load(Ordering::SeqCst), 1);
    assert_eq!(tc.reads.load(Ordering::SeqCst), 0, "c never sees the read");
    let seen = tc.exceptions.lock();
    assert_eq!(seen.len(), 1, "c sees the exception instead");
    assert!(seen[0].contains("probe rejects reads"));
}

#[test]
fn test_replace_swaps_in_place() {
    let (ch, _alloc) = test_channel();
    let trace = Arc::new(Trace::default());
    ch.pipeline().add_last("first", probe(&trace)).expect("first");
    ch.pipeline().add_last("last", probe(&trace)).expect("last");
    ch.pipeline()
        .replace("first", "swapped", probe(&trace))
        .expect("replace");
    assert_eq!(ch.pipeline().names(), vec!["swapped", "last"]);
    assert_eq!(trace.removed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_tail_releases_unconsumed_reads() {
    let (ch, alloc) = test_channel();
    // No user handlers: the read falls through to the tail.
    let mut buf = alloc.allocate(64, 64).expect("buffer");
    buf.write_bytes(b"orphan").expect("fits");
    ch.pipeline().fire_channel_read(Message::Buf(buf));

    alloc.trim_current_thread_cache();
    assert_eq!(
        alloc.stats().active_allocations,
        0,
        "tail released the orphaned buffer"
    );
}

#[test]
fn test_outbound_error_fails_promise_and_surfaces_inbound() {
    struct RejectWrites;
    impl Handler for RejectWrites {
        fn write(&mut self, _ctx: &Context, msg: Message, _promise: nexio::Promise) -> Result<()> {
            msg.release();
            Err(Error::protocol("writes disabled"))
        }
    }

    let (ch, alloc) = test_channel();
    let observer = Arc::new(Trace::default());
    ch.pipeline().add_last("observer", probe(&observer)).expect("observer");
    ch.pipeline().add_last("reject", RejectWrites).expect("reject");

    let mut buf = alloc.allocate(8, 8).expect("buffer");
    buf.write_bytes(b"w").expect("fits");
    let promise = ch.write(Message::Buf(buf));

    assert!(promise.is_failed(), "outbound error fails the promise");
    assert!(matches!(promise.cause(), Some(Error::Protocol(_))));
    assert_eq!(
        observer.exceptions.lock().len(),
        1,
        "inbound observers saw the failure"
    );
}
