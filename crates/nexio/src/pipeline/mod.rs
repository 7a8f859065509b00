// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The channel pipeline: an ordered chain of named handler contexts.
//!
//! ```text
//!                 inbound events (head -> tail)
//!   +------+    +----------+    +----------+    +------+
//!   | head | -> | handlerA | -> | handlerB | -> | tail |
//!   +------+    +----------+    +----------+    +------+
//!                outbound operations (tail -> head)
//! ```
//!
//! The head sentinel turns outbound operations into channel I/O
//! primitives; the tail sentinel catches whatever inbound events no user
//! handler consumed (logging exceptions, releasing unread buffers). Both
//! always exist: a pipeline is never empty.
//!
//! Entry points on [`Pipeline`] may be called from any thread; they hop to
//! the channel's loop when needed. `fire_*`/operation methods on
//! [`Context`] are for use inside handler callbacks, which already run on
//! the loop.

pub(crate) mod context;
pub(crate) mod handler;

use std::any::Any;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

pub use context::Context;
pub use handler::{Handler, MASK_INBOUND, MASK_OUTBOUND};

use crate::channel::{Channel, Message};
use crate::concurrent::Promise;
use crate::error::{Error, Result};

use context::HandlerCell;

const HEAD_NAME: &str = "head";
const TAIL_NAME: &str = "tail";

enum InsertPos {
    First,
    Last,
    Before(String),
    After(String),
}

pub struct Pipeline {
    channel: Weak<Channel>,
    ctxs: RwLock<Vec<Arc<Context>>>,
}

impl Pipeline {
    pub(crate) fn new(channel: Weak<Channel>) -> Self {
        let head = Context::new(
            HEAD_NAME.to_string(),
            MASK_INBOUND | MASK_OUTBOUND,
            Arc::new(Mutex::new(HeadHandler)),
            channel.clone(),
        );
        let tail = Context::new(
            TAIL_NAME.to_string(),
            MASK_INBOUND,
            Arc::new(Mutex::new(TailHandler)),
            channel.clone(),
        );
        Self {
            channel,
            ctxs: RwLock::new(vec![head, tail]),
        }
    }

    // ===== Introspection =====

    pub fn get(&self, name: &str) -> Option<Arc<Context>> {
        self.ctxs.read().iter().find(|c| c.name() == name).cloned()
    }

    /// User handler names, head to tail (sentinels excluded).
    pub fn names(&self) -> Vec<String> {
        let ctxs = self.ctxs.read();
        ctxs[1..ctxs.len() - 1]
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub(crate) fn head(&self) -> Arc<Context> {
        self.ctxs.read().first().expect("head always exists").clone()
    }

    pub(crate) fn tail(&self) -> Arc<Context> {
        self.ctxs.read().last().expect("tail always exists").clone()
    }

    pub(crate) fn next_matching(&self, from: &Context, mask: u8) -> Option<Arc<Context>> {
        let ctxs = self.ctxs.read();
        let pos = ctxs
            .iter()
            .position(|c| std::ptr::eq(Arc::as_ptr(c), from))?;
        ctxs[pos + 1..].iter().find(|c| c.mask() & mask != 0).cloned()
    }

    pub(crate) fn prev_matching(&self, from: &Context, mask: u8) -> Option<Arc<Context>> {
        let ctxs = self.ctxs.read();
        let pos = ctxs
            .iter()
            .position(|c| std::ptr::eq(Arc::as_ptr(c), from))?;
        ctxs[..pos].iter().rev().find(|c| c.mask() & mask != 0).cloned()
    }

    // ===== Dynamic modification =====

    pub fn add_first(&self, name: &str, handler: impl Handler + 'static) -> Result<()> {
        self.insert(InsertPos::First, name, Arc::new(Mutex::new(handler)))
    }

    pub fn add_last(&self, name: &str, handler: impl Handler + 'static) -> Result<()> {
        self.insert(InsertPos::Last, name, Arc::new(Mutex::new(handler)))
    }

    pub fn add_before(&self, existing: &str, name: &str, handler: impl Handler + 'static) -> Result<()> {
        self.insert(
            InsertPos::Before(existing.to_string()),
            name,
            Arc::new(Mutex::new(handler)),
        )
    }

    pub fn add_after(&self, existing: &str, name: &str, handler: impl Handler + 'static) -> Result<()> {
        self.insert(
            InsertPos::After(existing.to_string()),
            name,
            Arc::new(Mutex::new(handler)),
        )
    }

    /// Add a pre-wrapped (possibly shared) handler instance at the end.
    pub fn add_last_shared(&self, name: &str, handler: HandlerCell) -> Result<()> {
        self.insert(InsertPos::Last, name, handler)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        if name == HEAD_NAME || name == TAIL_NAME {
            return Err(Error::protocol("cannot remove a pipeline sentinel"));
        }
        let removed = {
            let mut ctxs = self.ctxs.write();
            let pos = ctxs
                .iter()
                .position(|c| c.name() == name)
                .ok_or_else(|| Error::protocol(format!("no such handler: {}", name)))?;
            ctxs.remove(pos)
        };
        self.dispatch({
            let ctx = removed;
            move || invoke_removed_hook(ctx)
        });
        Ok(())
    }

    /// Swap the handler at `name` for a new one (same position).
    pub fn replace(&self, name: &str, new_name: &str, handler: impl Handler + 'static) -> Result<()> {
        if name == HEAD_NAME || name == TAIL_NAME {
            return Err(Error::protocol("cannot replace a pipeline sentinel"));
        }
        let cell: HandlerCell = Arc::new(Mutex::new(handler));
        let mask = cell.lock().mask();
        let ctx = Context::new(new_name.to_string(), mask, cell, self.channel.clone());
        let old = {
            let mut ctxs = self.ctxs.write();
            if new_name != name && ctxs.iter().any(|c| c.name() == new_name) {
                return Err(Error::protocol(format!("duplicate handler name: {}", new_name)));
            }
            let pos = ctxs
                .iter()
                .position(|c| c.name() == name)
                .ok_or_else(|| Error::protocol(format!("no such handler: {}", name)))?;
            std::mem::replace(&mut ctxs[pos], ctx.clone())
        };
        self.dispatch(move || invoke_removed_hook(old));
        self.run_added(ctx);
        Ok(())
    }

    fn insert(&self, pos: InsertPos, name: &str, handler: HandlerCell) -> Result<()> {
        if name == HEAD_NAME || name == TAIL_NAME {
            return Err(Error::protocol("handler may not shadow a sentinel name"));
        }
        let mask = handler.lock().mask();
        let ctx = Context::new(name.to_string(), mask, handler, self.channel.clone());
        {
            let mut ctxs = self.ctxs.write();
            if ctxs.iter().any(|c| c.name() == name) {
                return Err(Error::protocol(format!("duplicate handler name: {}", name)));
            }
            let idx = match pos {
                InsertPos::First => 1,
                InsertPos::Last => ctxs.len() - 1,
                InsertPos::Before(rel) => Self::user_position(&ctxs, &rel)?,
                InsertPos::After(rel) => Self::user_position(&ctxs, &rel)? + 1,
            };
            ctxs.insert(idx, ctx.clone());
        }
        self.run_added(ctx);
        Ok(())
    }

    fn user_position(ctxs: &[Arc<Context>], name: &str) -> Result<usize> {
        if name == HEAD_NAME || name == TAIL_NAME {
            return Err(Error::protocol("cannot insert relative to a sentinel"));
        }
        ctxs.iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| Error::protocol(format!("no such handler: {}", name)))
    }

    fn run_added(&self, ctx: Arc<Context>) {
        self.dispatch(move || {
            let res = ctx.handler.lock().handler_added(&ctx);
            if let Err(e) = res {
                // Structural change stands; the hook failure is only logged.
                log::warn!("[Pipeline] handler_added hook for '{}' failed: {}", ctx.name(), e);
            }
        });
    }

    // ===== Inbound entry points =====

    pub fn fire_channel_registered(&self) {
        self.fire(|head| head.invoke_registered());
    }

    pub fn fire_channel_unregistered(&self) {
        self.fire(|head| head.invoke_unregistered());
    }

    pub fn fire_channel_active(&self) {
        self.fire(|head| head.invoke_active());
    }

    pub fn fire_channel_inactive(&self) {
        self.fire(|head| head.invoke_inactive());
    }

    pub fn fire_channel_read(&self, msg: Message) {
        self.fire(move |head| head.invoke_read(msg));
    }

    pub fn fire_channel_read_complete(&self) {
        self.fire(|head| head.invoke_read_complete());
    }

    pub fn fire_channel_writability_changed(&self) {
        self.fire(|head| head.invoke_writability_changed());
    }

    pub fn fire_user_event(&self, event: Box<dyn Any + Send>) {
        self.fire(move |head| head.invoke_user_event(event));
    }

    pub fn fire_exception_caught(&self, cause: Error) {
        self.fire(move |head| head.invoke_exception_caught(cause));
    }

    /// On-loop variant used internally when the caller is already running
    /// on the channel's loop.
    pub(crate) fn fire_exception_now(&self, cause: Error) {
        self.head().invoke_exception_caught(cause);
    }

    fn fire(&self, f: impl FnOnce(Arc<Context>) + Send + 'static) {
        let channel = self.channel.clone();
        self.dispatch(move || {
            if let Some(ch) = channel.upgrade() {
                f(ch.pipeline().head());
            }
        });
    }

    // ===== Outbound entry points =====

    pub fn write(&self, msg: Message) -> Promise {
        let promise = Promise::new();
        self.op(promise.clone(), move |tail, promise| tail.write(msg, promise));
        promise
    }

    pub fn flush(&self) {
        let channel = self.channel.clone();
        self.dispatch(move || {
            if let Some(ch) = channel.upgrade() {
                ch.pipeline().tail().flush();
            }
        });
    }

    pub fn bind(&self, addr: SocketAddr) -> Promise {
        let promise = Promise::new();
        self.op(promise.clone(), move |tail, promise| tail.bind(addr, promise));
        promise
    }

    pub fn connect(&self, addr: SocketAddr) -> Promise {
        let promise = Promise::new();
        self.op(promise.clone(), move |tail, promise| {
            tail.connect(addr, promise);
        });
        promise
    }

    pub fn disconnect(&self) -> Promise {
        let promise = Promise::new();
        self.op(promise.clone(), |tail, promise| tail.disconnect(promise));
        promise
    }

    pub fn close(&self) -> Promise {
        let promise = Promise::new();
        self.op(promise.clone(), |tail, promise| tail.close(promise));
        promise
    }

    pub fn deregister(&self) -> Promise {
        let promise = Promise::new();
        self.op(promise.clone(), |tail, promise| tail.deregister(promise));
        promise
    }

    pub fn read(&self) {
        let channel = self.channel.clone();
        self.dispatch(move || {
            if let Some(ch) = channel.upgrade() {
                ch.pipeline().tail().read();
            }
        });
    }

    fn op(&self, promise: Promise, f: impl FnOnce(Arc<Context>, Promise) + Send + 'static) {
        let channel = self.channel.clone();
        self.dispatch(move || match channel.upgrade() {
            Some(ch) => f(ch.pipeline().tail(), promise),
            None => {
                let _ = promise.fail(Error::ChannelClosed);
            }
        });
    }

    /// Run `f` on the channel's loop; inline when already there (or when
    /// the channel has no loop yet).
    fn dispatch(&self, f: impl FnOnce() + Send + 'static) {
        match self.channel.upgrade().and_then(|ch| ch.event_loop()) {
            Some(l) if !l.is_in_loop() => {
                let _ = l.submit(f);
            }
            _ => f(),
        }
    }
}

/// Recursively retries the removed hook when the handler is mid-callback
/// (a handler removing itself holds its own lock).
fn invoke_removed_hook(ctx: Arc<Context>) {
    let attempted = {
        match ctx.handler.try_lock() {
            Some(mut h) => {
                if let Err(e) = h.handler_removed(&ctx) {
                    log::warn!("[Pipeline] handler_removed hook for '{}' failed: {}", ctx.name(), e);
                }
                true
            }
            None => false,
        }
    };
    if !attempted {
        match ctx.channel().and_then(|ch| ch.event_loop()) {
            Some(l) => {
                let _ = l.submit(move || invoke_removed_hook(ctx));
            }
            None => log::warn!(
                "[Pipeline] handler_removed hook for '{}' skipped (handler busy, no loop)",
                ctx.name()
            ),
        }
    }
}

// ============================================================================
// Sentinels
// ============================================================================

/// Head sentinel: turns outbound operations into channel I/O primitives
/// and originates inbound events from the channel.
struct HeadHandler;

impl Handler for HeadHandler {
    fn bind(&mut self, ctx: &Context, addr: SocketAddr, promise: Promise) -> Result<()> {
        match ctx.channel() {
            Some(ch) => ch.do_bind(addr, promise),
            None => {
                let _ = promise.fail(Error::ChannelClosed);
            }
        }
        Ok(())
    }

    fn connect(&mut self, ctx: &Context, addr: SocketAddr, promise: Promise) -> Result<()> {
        match ctx.channel() {
            Some(ch) => ch.do_connect(addr, promise),
            None => {
                let _ = promise.fail(Error::ChannelClosed);
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, ctx: &Context, promise: Promise) -> Result<()> {
        // Stream transports have no half-open disconnect; same as close.
        self.close(ctx, promise)
    }

    fn close(&mut self, ctx: &Context, promise: Promise) -> Result<()> {
        match ctx.channel() {
            Some(ch) => ch.do_close(promise),
            None => {
                let _ = promise.succeed();
            }
        }
        Ok(())
    }

    fn deregister(&mut self, ctx: &Context, promise: Promise) -> Result<()> {
        match ctx.channel() {
            Some(ch) => ch.do_deregister(promise),
            None => {
                let _ = promise.fail(Error::ChannelClosed);
            }
        }
        Ok(())
    }

    fn read(&mut self, ctx: &Context) -> Result<()> {
        if let Some(ch) = ctx.channel() {
            ch.begin_read();
        }
        Ok(())
    }

    fn write(&mut self, ctx: &Context, msg: Message, promise: Promise) -> Result<()> {
        match ctx.channel() {
            Some(ch) => ch.do_write(msg, promise),
            None => {
                msg.release();
                let _ = promise.fail(Error::ChannelClosed);
            }
        }
        Ok(())
    }

    fn flush(&mut self, ctx: &Context) -> Result<()> {
        if let Some(ch) = ctx.channel() {
            ch.do_flush();
        }
        Ok(())
    }
}

/// Tail sentinel: last stop for inbound events nobody consumed.
struct TailHandler;

impl Handler for TailHandler {
    fn mask(&self) -> u8 {
        MASK_INBOUND
    }

    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<()> {
        log::debug!(
            "[Pipeline] message reached tail unconsumed on channel {}; releasing",
            ctx.channel().map_or(0, |ch| ch.id())
        );
        msg.release();
        Ok(())
    }

    fn user_event(&mut self, _ctx: &Context, _event: Box<dyn Any + Send>) -> Result<()> {
        Ok(())
    }

    fn exception_caught(&mut self, ctx: &Context, cause: Error) -> Result<()> {
        log::warn!(
            "[Pipeline] unhandled exception on channel {}: {}",
            ctx.channel().map_or(0, |ch| ch.id()),
            cause
        );
        Ok(())
    }
}
