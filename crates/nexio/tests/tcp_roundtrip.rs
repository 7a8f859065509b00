// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Real sockets on loopback: TCP echo through the bootstraps, and a UDP
//! datagram exchange.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use nexio::{
    Bootstrap, ChannelConfig, Context, EventLoopGroup, Handler, Message, PooledAllocator,
    Promise, Result, ServerBootstrap,
};

struct Echo;

impl Handler for Echo {
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
    received: Arc<Mutex<Vec<u8>>>,
    expected: usize,
    done: Promise,
}

impl Handler for Collect {
    fn channel_read(&mut self, _ctx: &Context, msg: Message) -> Result<()> {
        if let Some(buf) = msg.as_buf() {
            self.received.lock().extend_from_slice(&buf.to_vec());
        }
        msg.release();
        if self.received.lock().len() >= self.expected {
            let _ = self.done.succeed();
        }
        Ok(())
    }
}

#[test]
fn test_tcp_echo_through_bootstraps() {
    let boss = EventLoopGroup::new(1, "boss").expect("boss group");
    let workers = EventLoopGroup::new(2, "worker").expect("worker group");
    let allocator = Arc::new(PooledAllocator::new());

    let server = ServerBootstrap::new(&boss, &workers)
        .allocator(allocator.clone())
        .config(ChannelConfig::default())
        .child_handler(|ch| ch.pipeline().add_last("echo", Echo));
    let (listener, bound) = server
        .bind("127.0.0.1:0".parse().expect("addr"))
        .expect("server setup");
    bound
        .wait_timeout(Duration::from_secs(5))
        .expect("bind completed")
        .expect("bind succeeded");
    let server_addr = listener.local_addr().expect("listener has an address");

    // Random payload larger than one receive prediction, so the echo
    // exercises multiple reads and partial deliveries.
    let payload: Vec<u8> = (0..48 * 1024).map(|_| fastrand::u8(..)).collect();
    let received = Arc::new(Mutex::new(Vec::new()));
    let done = Promise::new();

    let client = Bootstrap::new(workers.next())
        .allocator(allocator.clone())
        .handler({
            let received = received.clone();
            let done = done.clone();
            move |ch| {
                ch.pipeline().add_last(
                    "collect",
                    Collect {
                        received: received.clone(),
                        expected: 48 * 1024,
                        done: done.clone(),
                    },
                )
            }
        });
    let (channel, connected) = client.connect(server_addr).expect("client setup");
    connected
        .wait_timeout(Duration::from_secs(5))
        .expect("connect completed")
        .expect("connect succeeded");
    assert!(channel.is_active());
    assert_eq!(channel.remote_addr(), Some(server_addr));

    let mut buf = allocator
        .allocate(payload.len(), payload.len())
        .expect("payload buffer");
    buf.write_bytes(&payload).expect("payload fits");
    let wrote = channel.write_and_flush(Message::Buf(buf));

    done.wait_timeout(Duration::from_secs(10))
        .expect("echo completed")
        .expect("collect ok");
    assert_eq!(*received.lock(), payload, "bytes identical after round trip");
    assert!(
        wrote
            .wait_timeout(Duration::from_secs(5))
            .expect("write resolved")
            .is_ok(),
        "write promise succeeded"
    );

    channel
        .close()
        .wait_timeout(Duration::from_secs(5))
        .expect("client close completed")
        .expect("client close succeeded");
    workers.shutdown();
    boss.shutdown();
}

#[test]
fn test_udp_datagram_exchange() {
    let group = EventLoopGroup::new(2, "udp").expect("group");
    let allocator = Arc::new(PooledAllocator::new());

    let received = Arc::new(Mutex::new(Vec::new()));
    let done = Promise::new();

    let receiver = Bootstrap::new(group.handles()[0].clone())
        .allocator(allocator.clone())
        .handler({
            let received = received.clone();
            let done = done.clone();
            move |ch| {
                ch.pipeline().add_last(
                    "collect",
                    Collect {
                        received: received.clone(),
                        expected: 5,
                        done: done.clone(),
                    },
                )
            }
        });
    let (rx, rx_bound) = receiver
        .bind_udp("127.0.0.1:0".parse().expect("addr"))
        .expect("receiver setup");
    rx_bound
        .wait_timeout(Duration::from_secs(5))
        .expect("bind completed")
        .expect("bind succeeded");
    let rx_addr = rx.local_addr().expect("receiver has an address");

    let sender = Bootstrap::new(group.handles()[1].clone()).allocator(allocator.clone());
    let (tx, tx_bound) = sender
        .bind_udp("127.0.0.1:0".parse().expect("addr"))
        .expect("sender setup");
    tx_bound
        .wait_timeout(Duration::from_secs(5))
        .expect("bind completed")
        .expect("bind succeeded");

    let mut buf = allocator.allocate(16, 16).expect("datagram buffer");
    buf.write_bytes(b"probe").expect("fits");
    let sent = tx.write_and_flush(Message::Datagram(buf, rx_addr));
    assert!(
        sent.wait_timeout(Duration::from_secs(5))
            .expect("send resolved")
            .is_ok(),
        "datagram send succeeded"
    );

    done.wait_timeout(Duration::from_secs(5))
        .expect("datagram arrived")
        .expect("collect ok");
    assert_eq!(*received.lock(), b"probe");

    group.shutdown();
}
