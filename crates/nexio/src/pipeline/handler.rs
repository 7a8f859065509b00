// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The handler trait: one pluggable unit of pipeline behavior.
//!
//! Handlers are polymorphic over two capability axes, inbound events and
//! outbound operations, advertised through [`Handler::mask`]. Event walking
//! skips contexts whose mask lacks the matching capability, so an
//! inbound-only handler never sees `write` and an outbound-only handler
//! never sees `channel_read`.
//!
//! Every method has a pass-through default, so a handler overrides exactly
//! the events it cares about. Returning an error from an inbound method
//! surfaces as `exception_caught` at the next context; returning an error
//! from an outbound method fails the operation's promise and fires
//! `exception_caught` inbound.

use std::any::Any;
use std::net::SocketAddr;

use super::context::Context;
use crate::channel::Message;
use crate::concurrent::Promise;
use crate::error::{Error, Result};

/// Handler receives inbound events (reads, lifecycle, exceptions).
pub const MASK_INBOUND: u8 = 0b01;
/// Handler intercepts outbound operations (write, flush, close, ...).
pub const MASK_OUTBOUND: u8 = 0b10;

/// A unit of pipeline behavior. See the module docs for the contract.
pub trait Handler: Send {
    /// Capability mask; defaults to both directions.
    fn mask(&self) -> u8 {
        MASK_INBOUND | MASK_OUTBOUND
    }

    /// Whether one instance may be added to several pipelines. Sharable
    /// handlers must keep their state safe for concurrent pipelines.
    fn is_sharable(&self) -> bool {
        false
    }

    // ===== Lifecycle hooks =====

    fn handler_added(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn handler_removed(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    // ===== Inbound events (head -> tail) =====

    fn channel_registered(&mut self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&mut self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&mut self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&mut self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    /// One message read from the transport. Ownership of `msg` transfers
    /// here: consume it (releasing any buffer) or pass it on.
    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<()> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn channel_read_complete(&mut self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    fn channel_writability_changed(&mut self, ctx: &Context) -> Result<()> {
        ctx.fire_channel_writability_changed();
        Ok(())
    }

    fn user_event(&mut self, ctx: &Context, event: Box<dyn Any + Send>) -> Result<()> {
        ctx.fire_user_event(event);
        Ok(())
    }

    fn exception_caught(&mut self, ctx: &Context, cause: Error) -> Result<()> {
        ctx.fire_exception_caught(cause);
        Ok(())
    }

    // ===== Outbound operations (tail -> head) =====

    fn bind(&mut self, ctx: &Context, addr: SocketAddr, promise: Promise) -> Result<()> {
        ctx.bind(addr, promise);
        Ok(())
    }

    fn connect(&mut self, ctx: &Context, addr: SocketAddr, promise: Promise) -> Result<()> {
        ctx.connect(addr, promise);
        Ok(())
    }

    fn disconnect(&mut self, ctx: &Context, promise: Promise) -> Result<()> {
        ctx.disconnect(promise);
        Ok(())
    }

    fn close(&mut self, ctx: &Context, promise: Promise) -> Result<()> {
        ctx.close(promise);
        Ok(())
    }

    fn deregister(&mut self, ctx: &Context, promise: Promise) -> Result<()> {
        ctx.deregister(promise);
        Ok(())
    }

    /// Request more data from the transport (rearms read interest).
    fn read(&mut self, ctx: &Context) -> Result<()> {
        ctx.read();
        Ok(())
    }

    /// Queue `msg` for transmission; `promise` resolves once the bytes
    /// reach the wire (after a flush).
    fn write(&mut self, ctx: &Context, msg: Message, promise: Promise) -> Result<()> {
        ctx.write(msg, promise);
        Ok(())
    }

    fn flush(&mut self, ctx: &Context) -> Result<()> {
        ctx.flush();
        Ok(())
    }
}
