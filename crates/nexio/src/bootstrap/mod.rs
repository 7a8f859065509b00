// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Programmatic wiring for clients and servers.
//!
//! A [`Bootstrap`] builds one outgoing (or datagram) channel: pick a loop,
//! install handlers, connect or bind. A [`ServerBootstrap`] builds a
//! listener whose accepted children are initialized and spread round-robin
//! over a child loop group, via an acceptor handler installed on the
//! server channel's own pipeline.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::buffer::PooledAllocator;
use crate::channel::{Channel, ChannelConfig, Message};
use crate::concurrent::Promise;
use crate::error::Result;
use crate::eventloop::{EventLoopGroup, EventLoopHandle};
use crate::pipeline::{Context, Handler, MASK_INBOUND};

/// Per-channel pipeline setup callback.
pub type Initializer = Arc<dyn Fn(&Arc<Channel>) -> Result<()> + Send + Sync>;

/// Resolve `to` with whatever `from` resolves to.
fn chain(from: &Promise, to: Promise) {
    from.add_listener(move |outcome| {
        let _ = to.complete(outcome.clone());
    });
}

/// Builder for client and datagram channels.
pub struct Bootstrap {
    event_loop: EventLoopHandle,
    allocator: Arc<PooledAllocator>,
    config: ChannelConfig,
    initializer: Option<Initializer>,
}

impl Bootstrap {
    pub fn new(event_loop: EventLoopHandle) -> Self {
        Self {
            event_loop,
            allocator: Arc::new(PooledAllocator::new()),
            config: ChannelConfig::default(),
            initializer: None,
        }
    }

    /// Share an allocator instead of the bootstrap-private default.
    pub fn allocator(mut self, allocator: Arc<PooledAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Pipeline setup run on every channel this bootstrap creates.
    pub fn handler(
        mut self,
        f: impl Fn(&Arc<Channel>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.initializer = Some(Arc::new(f));
        self
    }

    /// Create, initialize, register, and connect a TCP channel.
    ///
    /// The promise resolves once the connection is established (or failed).
    pub fn connect(&self, addr: SocketAddr) -> Result<(Arc<Channel>, Promise)> {
        let channel = Channel::new_tcp(self.allocator.clone(), self.config.clone());
        if let Some(init) = &self.initializer {
            init(&channel)?;
        }
        let done = Promise::new();
        let registered = self.event_loop.register(&channel);
        let ch = channel.clone();
        let p = done.clone();
        registered.add_listener(move |outcome| match outcome {
            Ok(()) => chain(&ch.connect(addr), p),
            Err(e) => {
                let _ = p.fail(e.clone());
            }
        });
        Ok((channel, done))
    }

    /// Create, initialize, register, and bind a UDP channel.
    pub fn bind_udp(&self, addr: SocketAddr) -> Result<(Arc<Channel>, Promise)> {
        let channel = Channel::new_udp(self.allocator.clone(), self.config.clone());
        if let Some(init) = &self.initializer {
            init(&channel)?;
        }
        let done = Promise::new();
        let registered = self.event_loop.register(&channel);
        let ch = channel.clone();
        let p = done.clone();
        registered.add_listener(move |outcome| match outcome {
            Ok(()) => chain(&ch.bind(addr), p),
            Err(e) => {
                let _ = p.fail(e.clone());
            }
        });
        Ok((channel, done))
    }
}

/// Builder for TCP servers: a parent loop accepts, child loops carry the
/// accepted connections.
pub struct ServerBootstrap {
    parent: EventLoopHandle,
    children: Vec<EventLoopHandle>,
    allocator: Arc<PooledAllocator>,
    config: ChannelConfig,
    child_initializer: Option<Initializer>,
}

impl ServerBootstrap {
    pub fn new(parent_group: &EventLoopGroup, child_group: &EventLoopGroup) -> Self {
        Self {
            parent: parent_group.next(),
            children: child_group.handles().to_vec(),
            allocator: Arc::new(PooledAllocator::new()),
            config: ChannelConfig::default(),
            child_initializer: None,
        }
    }

    pub fn allocator(mut self, allocator: Arc<PooledAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Config inherited by the listener and by accepted children.
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Pipeline setup run on every accepted child before it registers.
    pub fn child_handler(
        mut self,
        f: impl Fn(&Arc<Channel>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.child_initializer = Some(Arc::new(f));
        self
    }

    /// Create the server channel, install the acceptor, register, bind.
    pub fn bind(&self, addr: SocketAddr) -> Result<(Arc<Channel>, Promise)> {
        let server = Channel::new_tcp_server(self.allocator.clone(), self.config.clone());
        server.pipeline().add_last(
            "acceptor",
            Acceptor {
                children: self.children.clone(),
                next: AtomicUsize::new(0),
                initializer: self.child_initializer.clone(),
            },
        )?;
        let done = Promise::new();
        let registered = self.parent.register(&server);
        let ch = server.clone();
        let p = done.clone();
        registered.add_listener(move |outcome| match outcome {
            Ok(()) => chain(&ch.bind(addr), p),
            Err(e) => {
                let _ = p.fail(e.clone());
            }
        });
        Ok((server, done))
    }
}

/// Receives accepted children on the server pipeline, initializes them,
/// and hands each to a child loop.
struct Acceptor {
    children: Vec<EventLoopHandle>,
    next: AtomicUsize,
    initializer: Option<Initializer>,
}

impl Handler for Acceptor {
    fn mask(&self) -> u8 {
        MASK_INBOUND
    }

    fn channel_read(&mut self, _ctx: &Context, msg: Message) -> Result<()> {
        let child = match msg.downcast_user::<Arc<Channel>>() {
            Ok(boxed) => *boxed,
            Err(other) => {
                other.release();
                return Ok(());
            }
        };
        if let Some(init) = &self.initializer {
            if let Err(e) = init(&child) {
                log::warn!("[Boot] child {} initializer failed: {}", child.id(), e);
                let _ = child.close();
                return Ok(());
            }
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.children.len();
        let registered = self.children[idx].register(&child);
        let ch = child;
        registered.add_listener(move |outcome| {
            if let Err(e) = outcome {
                log::warn!("[Boot] child {} registration failed: {}", ch.id(), e);
                let _ = ch.close();
            }
        });
        Ok(())
    }
}
