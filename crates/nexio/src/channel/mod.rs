// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channels: one communicating endpoint each.
//!
//! A channel is created unregistered, joins exactly one event loop for its
//! lifetime, and then walks a one-way state machine:
//!
//! ```text
//! Unregistered -> Registered -> Active -> Inactive -> Closed
//! ```
//!
//! Everything user-visible about a channel mutates on its owning loop
//! thread; off-loop callers go through the pipeline's entry points, which
//! hop onto the loop. The pipeline's head sentinel lands on the `do_*`
//! primitives in this module.

pub(crate) mod adaptive;
pub mod flush_notifier;
pub(crate) mod outbound;

use std::any::Any;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mio::{Interest, Token};
use parking_lot::Mutex;

pub use flush_notifier::FlushNotifier;

use crate::buffer::{ByteBuf, PooledAllocator};
use crate::concurrent::Promise;
use crate::error::Error;
use crate::eventloop::EventLoopHandle;
use crate::pipeline::Pipeline;
use crate::transport::{self, LocalTransport, Transport};

use adaptive::AdaptiveRecvBuf;
use outbound::Outbound;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle states; transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unregistered,
    Registered,
    Active,
    Inactive,
    Closed,
}

/// What flows through a pipeline.
pub enum Message {
    /// Raw bytes (the common case).
    Buf(ByteBuf),
    /// Bytes plus a peer address, for unconnected datagram channels.
    Datagram(ByteBuf, SocketAddr),
    /// A typed message produced by a codec handler.
    User(Box<dyn Any + Send>),
}

impl Message {
    pub fn user<T: Any + Send>(value: T) -> Self {
        Self::User(Box::new(value))
    }

    pub fn as_buf(&self) -> Option<&ByteBuf> {
        match self {
            Self::Buf(buf) | Self::Datagram(buf, _) => Some(buf),
            Self::User(_) => None,
        }
    }

    pub fn into_buf(self) -> Option<ByteBuf> {
        match self {
            Self::Buf(buf) | Self::Datagram(buf, _) => Some(buf),
            Self::User(_) => None,
        }
    }

    pub fn downcast_user<T: Any>(self) -> Result<Box<T>, Message> {
        match self {
            Self::User(any) => any.downcast::<T>().map_err(Message::User),
            other => Err(other),
        }
    }

    /// Release the contained buffer, if any.
    pub fn release(&self) {
        if let Some(buf) = self.as_buf() {
            buf.release();
        }
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.as_buf().map_or(0, ByteBuf::readable_bytes)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buf(buf) => write!(f, "Message::Buf({} bytes)", buf.readable_bytes()),
            Self::Datagram(buf, addr) => {
                write!(f, "Message::Datagram({} bytes, {})", buf.readable_bytes(), addr)
            }
            Self::User(_) => write!(f, "Message::User(..)"),
        }
    }
}

/// Per-channel tunables.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Outbound bytes above which the channel reports unwritable.
    pub high_water_mark: usize,
    /// Outbound bytes below which writability returns.
    pub low_water_mark: usize,
    /// Receive predictor bounds.
    pub recv_min: usize,
    pub recv_initial: usize,
    pub recv_max: usize,
    /// Reads attempted per readiness cycle before yielding to the loop.
    pub max_reads_per_cycle: usize,
    pub nodelay: bool,
    pub reuse_addr: bool,
    pub backlog: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 64 * 1024,
            low_water_mark: 32 * 1024,
            recv_min: 64,
            recv_initial: 2048,
            recv_max: 65536,
            max_reads_per_cycle: 16,
            nodelay: true,
            reuse_addr: true,
            backlog: 128,
        }
    }
}

pub(crate) struct Registration {
    pub(crate) handle: EventLoopHandle,
    pub(crate) token: Token,
}

impl Clone for Registration {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            token: self.token,
        }
    }
}

/// One communication endpoint. See the module docs for the model.
pub struct Channel {
    id: u64,
    parent: Option<Weak<Channel>>,
    config: ChannelConfig,
    allocator: Arc<PooledAllocator>,
    pipeline: Pipeline,
    transport: Mutex<Transport>,
    state: Mutex<ChannelState>,
    outbound: Mutex<Outbound>,
    registration: Mutex<Option<Registration>>,
    pending_connect: Mutex<Option<Promise>>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    recv_alloc: Mutex<AdaptiveRecvBuf>,
    close_promise: Promise,
    write_interest: AtomicBool,
}

impl Channel {
    fn build(
        allocator: Arc<PooledAllocator>,
        config: ChannelConfig,
        transport: Transport,
        parent: Option<Weak<Channel>>,
    ) -> Arc<Self> {
        let recv = AdaptiveRecvBuf::new(config.recv_min, config.recv_initial, config.recv_max);
        let outbound = Outbound::new(config.high_water_mark, config.low_water_mark);
        Arc::new_cyclic(|weak: &Weak<Channel>| Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            parent,
            config,
            allocator,
            pipeline: Pipeline::new(weak.clone()),
            transport: Mutex::new(transport),
            state: Mutex::new(ChannelState::Unregistered),
            outbound: Mutex::new(outbound),
            registration: Mutex::new(None),
            pending_connect: Mutex::new(None),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
            recv_alloc: Mutex::new(recv),
            close_promise: Promise::new(),
            write_interest: AtomicBool::new(false),
        })
    }

    /// A TCP channel ready to `connect`.
    pub fn new_tcp(allocator: Arc<PooledAllocator>, config: ChannelConfig) -> Arc<Self> {
        Self::build(allocator, config, Transport::TcpInit, None)
    }

    /// A TCP server channel ready to `bind`; accepted children surface as
    /// `Message::User(Arc<Channel>)` reads on its pipeline.
    pub fn new_tcp_server(allocator: Arc<PooledAllocator>, config: ChannelConfig) -> Arc<Self> {
        Self::build(allocator, config, Transport::ServerInit, None)
    }

    /// A UDP channel ready to `bind` (or `connect` for a fixed peer).
    pub fn new_udp(allocator: Arc<PooledAllocator>, config: ChannelConfig) -> Arc<Self> {
        Self::build(allocator, config, Transport::UdpInit, None)
    }

    pub(crate) fn new_accepted(
        allocator: Arc<PooledAllocator>,
        config: ChannelConfig,
        stream: mio::net::TcpStream,
        parent: Weak<Channel>,
    ) -> Arc<Self> {
        Self::build(allocator, config, Transport::TcpStream(stream), Some(parent))
    }

    pub(crate) fn new_local(
        allocator: Arc<PooledAllocator>,
        config: ChannelConfig,
        local: LocalTransport,
    ) -> Arc<Self> {
        Self::build(allocator, config, Transport::Local(local), None)
    }

    // ===== Introspection =====

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    pub fn is_registered(&self) -> bool {
        self.registration.lock().is_some()
    }

    /// True while the outbound buffer sits below the high-water mark.
    pub fn is_writable(&self) -> bool {
        self.outbound.lock().is_writable()
    }

    pub fn parent(&self) -> Option<Arc<Channel>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn allocator(&self) -> &Arc<PooledAllocator> {
        &self.allocator
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn event_loop(&self) -> Option<EventLoopHandle> {
        self.registration.lock().as_ref().map(|r| r.handle.clone())
    }

    /// Resolves when the channel has fully closed.
    pub fn close_future(&self) -> Promise {
        self.close_promise.clone()
    }

    // ===== User-facing operations (routed through the pipeline) =====

    pub fn bind(&self, addr: SocketAddr) -> Promise {
        self.pipeline.bind(addr)
    }

    pub fn connect(&self, addr: SocketAddr) -> Promise {
        self.pipeline.connect(addr)
    }

    pub fn write(&self, msg: Message) -> Promise {
        self.pipeline.write(msg)
    }

    pub fn flush(&self) {
        self.pipeline.flush();
    }

    pub fn write_and_flush(&self, msg: Message) -> Promise {
        let promise = self.pipeline.write(msg);
        self.pipeline.flush();
        promise
    }

    pub fn close(&self) -> Promise {
        self.pipeline.close()
    }

    pub fn disconnect(&self) -> Promise {
        self.pipeline.disconnect()
    }

    pub fn deregister(&self) -> Promise {
        self.pipeline.deregister()
    }

    // ===== Registration (loop thread) =====

    pub(crate) fn do_register(self: &Arc<Self>, handle: EventLoopHandle, promise: Promise) {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Unregistered {
                let _ = promise.fail(Error::protocol("channel already registered"));
                return;
            }
            *state = ChannelState::Registered;
        }
        let token = handle.alloc_token();
        *self.registration.lock() = Some(Registration {
            handle: handle.clone(),
            token,
        });

        let attach = self.attach_to_selector(&handle, token);
        match attach {
            Ok(activate) => {
                log::debug!("[Chan] channel {} registered on {}", self.id, handle.name());
                self.pipeline.fire_channel_registered();
                let _ = promise.succeed();
                if activate {
                    self.become_active();
                }
                self.deliver_local_backlog();
            }
            Err(e) => {
                log::warn!("[Chan] channel {} selector attach failed: {}", self.id, e);
                let _ = promise.fail(e.into());
            }
        }
    }

    /// Attach the transport's socket (if it exists yet) to the selector.
    /// Returns whether the channel is immediately active.
    fn attach_to_selector(self: &Arc<Self>, handle: &EventLoopHandle, token: Token) -> io::Result<bool> {
        let mut t = self.transport.lock();
        match &mut *t {
            Transport::TcpStream(stream) => {
                transport::tcp::configure_stream(stream, &self.config);
                handle.registry().register(stream, token, Interest::READABLE)?;
                *self.local_addr.lock() = stream.local_addr().ok();
                *self.remote_addr.lock() = stream.peer_addr().ok();
                drop(t);
                handle.insert_channel(token, self.clone());
                Ok(true)
            }
            Transport::TcpListener(listener) => {
                handle.registry().register(listener, token, Interest::READABLE)?;
                *self.local_addr.lock() = listener.local_addr().ok();
                drop(t);
                handle.insert_channel(token, self.clone());
                Ok(true)
            }
            Transport::Udp(socket) => {
                handle.registry().register(socket, token, Interest::READABLE)?;
                *self.local_addr.lock() = socket.local_addr().ok();
                drop(t);
                handle.insert_channel(token, self.clone());
                Ok(true)
            }
            Transport::Local(_) => {
                let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
                *self.local_addr.lock() = Some(loopback);
                *self.remote_addr.lock() = Some(loopback);
                Ok(true)
            }
            Transport::TcpInit | Transport::ServerInit | Transport::UdpInit => Ok(false),
            Transport::Closed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport already closed",
            )),
        }
    }

    fn become_active(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Registered {
                return;
            }
            *state = ChannelState::Active;
        }
        self.pipeline.fire_channel_active();
        // Early writes may have queued while connecting.
        self.try_flush();
    }

    // ===== I/O primitives (called by the head sentinel, on the loop) =====

    pub(crate) fn do_bind(self: &Arc<Self>, addr: SocketAddr, promise: Promise) {
        let Some(reg) = self.registration.lock().clone() else {
            let _ = promise.fail(Error::NotYetRegistered);
            return;
        };
        let bound = {
            let mut t = self.transport.lock();
            match &mut *t {
                Transport::ServerInit => {
                    transport::tcp::bind_listener(addr, &self.config).and_then(|mut listener| {
                        reg.handle
                            .registry()
                            .register(&mut listener, reg.token, Interest::READABLE)?;
                        let local = listener.local_addr().ok();
                        *t = Transport::TcpListener(listener);
                        Ok(local)
                    })
                }
                Transport::UdpInit => {
                    transport::udp::bind_socket(addr, &self.config).and_then(|mut socket| {
                        reg.handle
                            .registry()
                            .register(&mut socket, reg.token, Interest::READABLE)?;
                        let local = socket.local_addr().ok();
                        *t = Transport::Udp(socket);
                        Ok(local)
                    })
                }
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "transport does not support bind",
                )),
            }
        };
        match bound {
            Ok(local) => {
                *self.local_addr.lock() = local;
                reg.handle.insert_channel(reg.token, self.clone());
                log::debug!("[Chan] channel {} bound to {:?}", self.id, local);
                let _ = promise.succeed();
                self.become_active();
            }
            Err(e) => {
                log::warn!("[Chan] channel {} bind {} failed: {}", self.id, addr, e);
                let _ = promise.fail(e.into());
            }
        }
    }

    pub(crate) fn do_connect(self: &Arc<Self>, addr: SocketAddr, promise: Promise) {
        let Some(reg) = self.registration.lock().clone() else {
            let _ = promise.fail(Error::NotYetRegistered);
            return;
        };
        let started = {
            let mut t = self.transport.lock();
            match &mut *t {
                Transport::TcpInit => mio::net::TcpStream::connect(addr).and_then(|mut stream| {
                    reg.handle.registry().register(
                        &mut stream,
                        reg.token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    *t = Transport::TcpStream(stream);
                    Ok(true)
                }),
                // Datagram "connect" just fixes the peer.
                Transport::Udp(socket) => socket.connect(addr).map(|()| false),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "transport does not support connect",
                )),
            }
        };
        match started {
            Ok(true) => {
                *self.pending_connect.lock() = Some(promise);
                reg.handle.insert_channel(reg.token, self.clone());
            }
            Ok(false) => {
                *self.remote_addr.lock() = Some(addr);
                let _ = promise.succeed();
            }
            Err(e) => {
                log::warn!("[Chan] channel {} connect {} failed: {}", self.id, addr, e);
                let _ = promise.fail(e.into());
            }
        }
    }

    /// Writable readiness while a connect is pending.
    pub(crate) fn finish_connect(self: &Arc<Self>) {
        let Some(promise) = self.pending_connect.lock().take() else {
            return;
        };
        let outcome = {
            let mut t = self.transport.lock();
            match &mut *t {
                Transport::TcpStream(stream) => match stream.take_error() {
                    Ok(Some(e)) | Err(e) => Err(e),
                    Ok(None) => match stream.peer_addr() {
                        Ok(peer) => {
                            let reg = self.registration.lock().clone();
                            if let Some(reg) = reg {
                                let _ = reg.handle.registry().reregister(
                                    stream,
                                    reg.token,
                                    Interest::READABLE,
                                );
                            }
                            transport::tcp::configure_stream(stream, &self.config);
                            Ok(Some((stream.local_addr().ok(), peer)))
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(None),
                        Err(e) => Err(e),
                    },
                },
                _ => Err(io::Error::new(io::ErrorKind::NotConnected, "no stream")),
            }
        };
        match outcome {
            Ok(Some((local, peer))) => {
                *self.local_addr.lock() = local;
                *self.remote_addr.lock() = Some(peer);
                log::debug!("[Chan] channel {} connected to {}", self.id, peer);
                let _ = promise.succeed();
                self.become_active();
            }
            Ok(None) => {
                // Spurious wakeup; keep waiting.
                *self.pending_connect.lock() = Some(promise);
            }
            Err(e) => {
                let cause: Error = e.into();
                let _ = promise.fail(cause.clone());
                self.handle_transport_error(cause);
            }
        }
    }

    pub(crate) fn do_write(self: &Arc<Self>, msg: Message, promise: Promise) {
        if matches!(msg, Message::User(_)) {
            let _ = promise.fail(Error::protocol("unsupported message type reached the transport"));
            return;
        }
        let size = msg.byte_size();
        let mut ob = self.outbound.lock();
        if ob.is_closed() {
            drop(ob);
            msg.release();
            let _ = promise.fail(Error::ChannelClosed);
            return;
        }
        let was_writable = ob.is_writable();
        ob.push(msg, size, promise);
        let now_writable = ob.is_writable();
        drop(ob);
        if was_writable != now_writable {
            self.pipeline.fire_channel_writability_changed();
        }
    }

    pub(crate) fn do_flush(self: &Arc<Self>) {
        self.try_flush();
    }

    /// Push queued bytes at the transport until drained or `WouldBlock`.
    pub(crate) fn try_flush(self: &Arc<Self>) {
        if self.state() != ChannelState::Active {
            return; // not connected yet; entries stay queued
        }
        let reg = self.registration.lock().clone();
        let mut completions: Vec<Promise> = Vec::new();
        let mut error: Option<Error> = None;
        let mut local_delivery: Option<(Arc<Channel>, Vec<ByteBuf>)> = None;
        let (was_writable, now_writable) = {
            let mut ob = self.outbound.lock();
            let was = ob.is_writable();
            let mut t = self.transport.lock();
            match &mut *t {
                Transport::TcpStream(stream) => {
                    error = flush_stream(&mut ob, stream, reg.as_ref(), &self.write_interest);
                }
                Transport::Udp(socket) => {
                    error = flush_datagrams(&mut ob, socket, &self.write_interest, reg.as_ref());
                }
                Transport::Local(local) => {
                    local_delivery = flush_local(&mut ob, local);
                }
                _ => {}
            }
            completions.extend(ob.drain_success());
            (was, ob.is_writable())
        };
        for p in completions {
            let _ = p.succeed();
        }
        if was_writable != now_writable {
            self.pipeline.fire_channel_writability_changed();
        }
        // Hand the moved buffers over outside our own locks; both sides of
        // a pair may be flushing toward each other concurrently.
        if let Some((peer, bufs)) = local_delivery {
            for buf in bufs {
                peer.push_local_inbox(buf);
            }
            schedule_local_delivery(&peer);
        }
        if let Some(cause) = error {
            self.handle_transport_error(cause);
        }
    }

    /// Rearm read interest (the outbound `read` operation).
    pub(crate) fn begin_read(self: &Arc<Self>) {
        let Some(reg) = self.registration.lock().clone() else {
            return;
        };
        let interest = if self.write_interest.load(Ordering::Acquire) {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let mut t = self.transport.lock();
        let res = match &mut *t {
            Transport::TcpStream(stream) => reg.handle.registry().reregister(stream, reg.token, interest),
            Transport::TcpListener(l) => reg.handle.registry().reregister(l, reg.token, interest),
            Transport::Udp(socket) => reg.handle.registry().reregister(socket, reg.token, interest),
            _ => Ok(()),
        };
        if let Err(e) = res {
            log::debug!("[Chan] channel {} read rearm failed: {}", self.id, e);
        }
    }

    // ===== Readiness dispatch (loop thread) =====

    pub(crate) fn read_ready(self: &Arc<Self>) {
        enum Kind {
            Stream,
            Listener,
            Datagram,
        }
        let kind = match &*self.transport.lock() {
            Transport::TcpStream(_) => Kind::Stream,
            Transport::TcpListener(_) => Kind::Listener,
            Transport::Udp(_) => Kind::Datagram,
            _ => return,
        };
        match kind {
            Kind::Stream => self.read_stream(),
            Kind::Listener => self.accept_ready(),
            Kind::Datagram => self.read_datagrams(),
        }
    }

    pub(crate) fn write_ready(self: &Arc<Self>) {
        if self.pending_connect.lock().is_some() {
            self.finish_connect();
        } else {
            self.try_flush();
        }
    }

    fn read_stream(self: &Arc<Self>) {
        let mut eof = false;
        let mut error: Option<Error> = None;
        for _ in 0..self.config.max_reads_per_cycle {
            let size = self.recv_alloc.lock().next_size();
            let mut buf = match self.allocator.allocate(size, size) {
                Ok(buf) => buf,
                Err(e) => {
                    self.pipeline.fire_exception_caught(e);
                    break;
                }
            };
            let read = {
                let mut t = self.transport.lock();
                match &mut *t {
                    Transport::TcpStream(stream) => buf.write_from_reader(stream),
                    _ => {
                        buf.release();
                        return;
                    }
                }
            };
            match read {
                Ok(0) => {
                    buf.release();
                    eof = true;
                    break;
                }
                Ok(n) => {
                    self.recv_alloc.lock().record(n);
                    self.pipeline.fire_channel_read(Message::Buf(buf));
                    if n < size {
                        break; // socket drained
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    buf.release();
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    buf.release();
                }
                Err(e) => {
                    buf.release();
                    error = Some(e.into());
                    break;
                }
            }
        }
        self.pipeline.fire_channel_read_complete();
        if let Some(cause) = error {
            self.handle_transport_error(cause);
        } else if eof {
            log::debug!("[Chan] channel {} end of stream", self.id);
            self.do_close(Promise::new());
        }
    }

    fn accept_ready(self: &Arc<Self>) {
        loop {
            let accepted = {
                let mut t = self.transport.lock();
                match &mut *t {
                    Transport::TcpListener(listener) => listener.accept(),
                    _ => return,
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    log::debug!("[Chan] channel {} accepted {}", self.id, peer);
                    let child = Channel::new_accepted(
                        self.allocator.clone(),
                        self.config.clone(),
                        stream,
                        Arc::downgrade(self),
                    );
                    self.pipeline.fire_channel_read(Message::user(child));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.pipeline.fire_exception_caught(e.into());
                    break;
                }
            }
        }
        self.pipeline.fire_channel_read_complete();
    }

    fn read_datagrams(self: &Arc<Self>) {
        for _ in 0..self.config.max_reads_per_cycle {
            let size = self.recv_alloc.lock().next_size();
            let mut buf = match self.allocator.allocate(size, size) {
                Ok(buf) => buf,
                Err(e) => {
                    self.pipeline.fire_exception_caught(e);
                    break;
                }
            };
            let mut from: Option<SocketAddr> = None;
            let received = {
                let mut t = self.transport.lock();
                match &mut *t {
                    Transport::Udp(socket) => buf.fill_from(|space| {
                        let (n, addr) = socket.recv_from(space)?;
                        from = Some(addr);
                        Ok(n)
                    }),
                    _ => {
                        buf.release();
                        return;
                    }
                }
            };
            match received {
                Ok(n) => {
                    self.recv_alloc.lock().record(n);
                    let addr = from.expect("recv_from reports the sender");
                    self.pipeline.fire_channel_read(Message::Datagram(buf, addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    buf.release();
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    buf.release();
                }
                Err(e) => {
                    buf.release();
                    self.pipeline.fire_exception_caught(e.into());
                    break;
                }
            }
        }
        self.pipeline.fire_channel_read_complete();
    }

    // ===== Local transport plumbing =====

    pub(crate) fn set_local_peer(&self, peer: &Arc<Channel>) {
        if let Transport::Local(local) = &*self.transport.lock() {
            local.set_peer(Arc::downgrade(peer));
        }
    }

    pub(crate) fn push_local_inbox(&self, buf: ByteBuf) {
        if let Transport::Local(local) = &*self.transport.lock() {
            local.push_inbox(buf);
        }
    }

    /// Drain this channel's in-memory inbox as read events (on the loop).
    pub(crate) fn deliver_local(self: &Arc<Self>) {
        let drained = match &*self.transport.lock() {
            Transport::Local(local) => local.drain_inbox(),
            _ => return,
        };
        if drained.is_empty() {
            return;
        }
        for buf in drained {
            self.pipeline.fire_channel_read(Message::Buf(buf));
        }
        self.pipeline.fire_channel_read_complete();
    }

    fn deliver_local_backlog(self: &Arc<Self>) {
        let has_backlog = match &*self.transport.lock() {
            Transport::Local(local) => local.has_inbox(),
            _ => false,
        };
        if has_backlog {
            self.deliver_local();
        }
    }

    // ===== Teardown =====

    pub(crate) fn handle_transport_error(self: &Arc<Self>, cause: Error) {
        log::debug!("[Chan] channel {} transport error: {}", self.id, cause);
        self.pipeline.fire_exception_caught(cause);
        self.do_close(Promise::new());
    }

    pub(crate) fn do_close(self: &Arc<Self>, promise: Promise) {
        let was_active = {
            let mut state = self.state.lock();
            match *state {
                ChannelState::Closed => {
                    let _ = promise.succeed();
                    return;
                }
                prev => {
                    *state = ChannelState::Inactive;
                    prev == ChannelState::Active
                }
            }
        };

        // Fail whatever never reached the wire.
        let (flushed, unflushed) = self.outbound.lock().close();

        // Tear the transport down and leave the selector.
        let mut old = std::mem::replace(&mut *self.transport.lock(), Transport::Closed);
        let reg = self.registration.lock().take();
        if let Some(reg) = &reg {
            let deregistered = match &mut old {
                Transport::TcpStream(stream) => reg.handle.registry().deregister(stream),
                Transport::TcpListener(l) => reg.handle.registry().deregister(l),
                Transport::Udp(socket) => reg.handle.registry().deregister(socket),
                _ => Ok(()),
            };
            if let Err(e) = deregistered {
                log::debug!("[Chan] channel {} deregister failed: {}", self.id, e);
            }
            reg.handle.remove_channel(reg.token);
        }
        let local_peer = match &old {
            Transport::Local(local) => local.peer(),
            _ => None,
        };
        drop(old); // socket closes here

        for p in flushed {
            let _ = p.succeed();
        }
        for p in unflushed {
            let _ = p.fail(Error::ChannelClosed);
        }
        if let Some(p) = self.pending_connect.lock().take() {
            let _ = p.fail(Error::ChannelClosed);
        }

        if was_active {
            self.pipeline.fire_channel_inactive();
        }
        if reg.is_some() {
            self.pipeline.fire_channel_unregistered();
        }
        *self.local_addr.lock() = None;
        *self.remote_addr.lock() = None;
        *self.state.lock() = ChannelState::Closed;

        // A closed in-memory channel takes its peer down, like a FIN.
        if let Some(peer) = local_peer {
            match peer.event_loop() {
                Some(l) => {
                    let _ = l.submit(move || peer.do_close(Promise::new()));
                }
                None => peer.do_close(Promise::new()),
            }
        }

        log::debug!("[Chan] channel {} closed", self.id);
        let _ = self.close_promise.succeed();
        let _ = promise.succeed();
    }

    pub(crate) fn do_deregister(self: &Arc<Self>, promise: Promise) {
        let Some(reg) = self.registration.lock().take() else {
            let _ = promise.fail(Error::NotYetRegistered);
            return;
        };
        {
            let mut t = self.transport.lock();
            let res = match &mut *t {
                Transport::TcpStream(stream) => reg.handle.registry().deregister(stream),
                Transport::TcpListener(l) => reg.handle.registry().deregister(l),
                Transport::Udp(socket) => reg.handle.registry().deregister(socket),
                _ => Ok(()),
            };
            if let Err(e) = res {
                log::debug!("[Chan] channel {} deregister failed: {}", self.id, e);
            }
        }
        reg.handle.remove_channel(reg.token);
        self.pipeline.fire_channel_unregistered();
        let _ = promise.succeed();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("local", &self.local_addr())
            .field("remote", &self.remote_addr())
            .finish()
    }
}

// ============================================================================
// Flush helpers (run under the outbound + transport locks)
// ============================================================================

fn flush_stream(
    ob: &mut Outbound,
    stream: &mut mio::net::TcpStream,
    reg: Option<&Registration>,
    write_interest: &AtomicBool,
) -> Option<Error> {
    loop {
        let Some(entry) = ob.front_mut() else {
            // Fully drained: drop write interest if it was armed.
            if write_interest.swap(false, Ordering::AcqRel) {
                if let Some(reg) = reg {
                    let _ = reg
                        .handle
                        .registry()
                        .reregister(stream, reg.token, Interest::READABLE);
                }
            }
            return None;
        };
        let Some(buf) = entry.msg.as_buf() else {
            // Non-byte message slipped in; drop it (promise fails on close).
            let popped = ob.pop_front().expect("front exists");
            popped.msg.release();
            continue;
        };
        if buf.readable_bytes() == 0 {
            let popped = ob.pop_front().expect("front exists");
            popped.msg.release();
            continue;
        }
        let write = match &mut entry.msg {
            Message::Buf(buf) | Message::Datagram(buf, _) => buf.read_into_writer(stream),
            Message::User(_) => unreachable!("filtered above"),
        };
        match write {
            Ok(0) => return None,
            Ok(n) => {
                ob.written(n);
                let done = entry_consumed(ob);
                if done {
                    let popped = ob.pop_front().expect("front exists");
                    popped.msg.release();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Rearm write interest and yield back to the loop.
                if !write_interest.swap(true, Ordering::AcqRel) {
                    if let Some(reg) = reg {
                        let _ = reg.handle.registry().reregister(
                            stream,
                            reg.token,
                            Interest::READABLE | Interest::WRITABLE,
                        );
                    }
                }
                return None;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Some(e.into()),
        }
    }
}

fn entry_consumed(ob: &mut Outbound) -> bool {
    ob.front_mut()
        .and_then(|e| e.msg.as_buf().map(|b| b.readable_bytes() == 0))
        .unwrap_or(false)
}

fn flush_datagrams(
    ob: &mut Outbound,
    socket: &mut mio::net::UdpSocket,
    write_interest: &AtomicBool,
    reg: Option<&Registration>,
) -> Option<Error> {
    loop {
        let Some(entry) = ob.front_mut() else {
            if write_interest.swap(false, Ordering::AcqRel) {
                if let Some(reg) = reg {
                    let _ = reg
                        .handle
                        .registry()
                        .reregister(socket, reg.token, Interest::READABLE);
                }
            }
            return None;
        };
        let sent = match &entry.msg {
            Message::Datagram(buf, addr) => buf.with_readable(|bytes| socket.send_to(bytes, *addr)),
            Message::Buf(buf) => buf.with_readable(|bytes| socket.send(bytes)),
            Message::User(_) => {
                let popped = ob.pop_front().expect("front exists");
                popped.msg.release();
                continue;
            }
        };
        match sent {
            Ok(n) => {
                ob.written(n);
                let popped = ob.pop_front().expect("front exists");
                popped.msg.release();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !write_interest.swap(true, Ordering::AcqRel) {
                    if let Some(reg) = reg {
                        let _ = reg.handle.registry().reregister(
                            socket,
                            reg.token,
                            Interest::READABLE | Interest::WRITABLE,
                        );
                    }
                }
                return None;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Some(e.into()),
        }
    }
}

/// Drain the queue for an in-memory transfer; every byte "reaches the
/// wire" immediately. The caller pushes the buffers to the peer after
/// releasing this channel's locks.
fn flush_local(ob: &mut Outbound, local: &LocalTransport) -> Option<(Arc<Channel>, Vec<ByteBuf>)> {
    let peer = local.peer()?;
    let mut moved = Vec::new();
    while let Some(entry) = ob.pop_front() {
        let size = entry.msg.byte_size();
        if let Some(buf) = entry.msg.into_buf() {
            moved.push(buf);
        }
        ob.written(size);
    }
    if moved.is_empty() {
        None
    } else {
        Some((peer, moved))
    }
}

fn schedule_local_delivery(peer: &Arc<Channel>) {
    let target = peer.clone();
    match peer.event_loop() {
        Some(l) => {
            let _ = l.submit(move || target.deliver_local());
        }
        // Not registered yet: the backlog drains on registration.
        None => {}
    }
}
