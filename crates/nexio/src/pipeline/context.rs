// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handler context: one named position in a pipeline.
//!
//! `fire_*` methods walk forward to the next inbound-capable context;
//! operation methods walk backward to the previous outbound-capable one.
//! Both are meant to be called from within handler callbacks, which always
//! run on the channel's loop; off-loop entry points live on
//! [`Pipeline`](super::Pipeline).

use std::any::Any;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::handler::{Handler, MASK_INBOUND, MASK_OUTBOUND};
use crate::channel::{Channel, Message};
use crate::concurrent::Promise;
use crate::error::Error;

pub(crate) type HandlerCell = Arc<Mutex<dyn Handler>>;

pub struct Context {
    name: String,
    mask: u8,
    pub(crate) handler: HandlerCell,
    channel: Weak<Channel>,
}

impl Context {
    pub(crate) fn new(name: String, mask: u8, handler: HandlerCell, channel: Weak<Channel>) -> Arc<Self> {
        Arc::new(Self {
            name,
            mask,
            handler,
            channel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn mask(&self) -> u8 {
        self.mask
    }

    /// The channel this context belongs to, while it is alive.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.upgrade()
    }

    fn next_inbound(&self) -> Option<Arc<Context>> {
        self.channel()?.pipeline().next_matching(self, MASK_INBOUND)
    }

    fn prev_outbound(&self) -> Option<Arc<Context>> {
        self.channel()?.pipeline().prev_matching(self, MASK_OUTBOUND)
    }

    // ===== Inbound event propagation =====

    pub fn fire_channel_registered(&self) {
        if let Some(next) = self.next_inbound() {
            next.invoke_registered();
        }
    }

    pub fn fire_channel_unregistered(&self) {
        if let Some(next) = self.next_inbound() {
            next.invoke_unregistered();
        }
    }

    pub fn fire_channel_active(&self) {
        if let Some(next) = self.next_inbound() {
            next.invoke_active();
        }
    }

    pub fn fire_channel_inactive(&self) {
        if let Some(next) = self.next_inbound() {
            next.invoke_inactive();
        }
    }

    /// Pass `msg` to the next inbound handler; ownership transfers with it.
    pub fn fire_channel_read(&self, msg: Message) {
        match self.next_inbound() {
            Some(next) => next.invoke_read(msg),
            None => msg.release(),
        }
    }

    pub fn fire_channel_read_complete(&self) {
        if let Some(next) = self.next_inbound() {
            next.invoke_read_complete();
        }
    }

    pub fn fire_channel_writability_changed(&self) {
        if let Some(next) = self.next_inbound() {
            next.invoke_writability_changed();
        }
    }

    pub fn fire_user_event(&self, event: Box<dyn Any + Send>) {
        if let Some(next) = self.next_inbound() {
            next.invoke_user_event(event);
        }
    }

    pub fn fire_exception_caught(&self, cause: Error) {
        match self.next_inbound() {
            Some(next) => next.invoke_exception_caught(cause),
            None => log::warn!("[Pipeline] exception reached end of pipeline: {}", cause),
        }
    }

    // ===== Outbound operation propagation =====

    pub fn bind(&self, addr: SocketAddr, promise: Promise) {
        match self.prev_outbound() {
            Some(prev) => prev.invoke_bind(addr, promise),
            None => {
                let _ = promise.fail(Error::ChannelClosed);
            }
        }
    }

    pub fn connect(&self, addr: SocketAddr, promise: Promise) {
        match self.prev_outbound() {
            Some(prev) => prev.invoke_connect(addr, promise),
            None => {
                let _ = promise.fail(Error::ChannelClosed);
            }
        }
    }

    pub fn disconnect(&self, promise: Promise) {
        match self.prev_outbound() {
            Some(prev) => prev.invoke_disconnect(promise),
            None => {
                let _ = promise.fail(Error::ChannelClosed);
            }
        }
    }

    pub fn close(&self, promise: Promise) {
        match self.prev_outbound() {
            Some(prev) => prev.invoke_close(promise),
            None => {
                let _ = promise.fail(Error::ChannelClosed);
            }
        }
    }

    pub fn deregister(&self, promise: Promise) {
        match self.prev_outbound() {
            Some(prev) => prev.invoke_deregister(promise),
            None => {
                let _ = promise.fail(Error::ChannelClosed);
            }
        }
    }

    pub fn read(&self) {
        if let Some(prev) = self.prev_outbound() {
            prev.invoke_read_op();
        }
    }

    pub fn write(&self, msg: Message, promise: Promise) {
        match self.prev_outbound() {
            Some(prev) => prev.invoke_write(msg, promise),
            None => {
                msg.release();
                let _ = promise.fail(Error::ChannelClosed);
            }
        }
    }

    pub fn flush(&self) {
        if let Some(prev) = self.prev_outbound() {
            prev.invoke_flush();
        }
    }

    // ===== Invocation (locks the handler, routes errors) =====

    pub(crate) fn invoke_registered(self: &Arc<Self>) {
        let res = self.handler.lock().channel_registered(self);
        self.route_inbound_error(res);
    }

    pub(crate) fn invoke_unregistered(self: &Arc<Self>) {
        let res = self.handler.lock().channel_unregistered(self);
        self.route_inbound_error(res);
    }

    pub(crate) fn invoke_active(self: &Arc<Self>) {
        let res = self.handler.lock().channel_active(self);
        self.route_inbound_error(res);
    }

    pub(crate) fn invoke_inactive(self: &Arc<Self>) {
        let res = self.handler.lock().channel_inactive(self);
        self.route_inbound_error(res);
    }

    pub(crate) fn invoke_read(self: &Arc<Self>, msg: Message) {
        let res = self.handler.lock().channel_read(self, msg);
        self.route_inbound_error(res);
    }

    pub(crate) fn invoke_read_complete(self: &Arc<Self>) {
        let res = self.handler.lock().channel_read_complete(self);
        self.route_inbound_error(res);
    }

    pub(crate) fn invoke_writability_changed(self: &Arc<Self>) {
        let res = self.handler.lock().channel_writability_changed(self);
        self.route_inbound_error(res);
    }

    pub(crate) fn invoke_user_event(self: &Arc<Self>, event: Box<dyn Any + Send>) {
        let res = self.handler.lock().user_event(self, event);
        self.route_inbound_error(res);
    }

    pub(crate) fn invoke_exception_caught(self: &Arc<Self>, cause: Error) {
        let res = self.handler.lock().exception_caught(self, cause);
        self.route_inbound_error(res);
    }

    pub(crate) fn invoke_bind(self: &Arc<Self>, addr: SocketAddr, promise: Promise) {
        let res = self.handler.lock().bind(self, addr, promise.clone());
        self.route_outbound_error(res, Some(promise));
    }

    pub(crate) fn invoke_connect(self: &Arc<Self>, addr: SocketAddr, promise: Promise) {
        let res = self.handler.lock().connect(self, addr, promise.clone());
        self.route_outbound_error(res, Some(promise));
    }

    pub(crate) fn invoke_disconnect(self: &Arc<Self>, promise: Promise) {
        let res = self.handler.lock().disconnect(self, promise.clone());
        self.route_outbound_error(res, Some(promise));
    }

    pub(crate) fn invoke_close(self: &Arc<Self>, promise: Promise) {
        let res = self.handler.lock().close(self, promise.clone());
        self.route_outbound_error(res, Some(promise));
    }

    pub(crate) fn invoke_deregister(self: &Arc<Self>, promise: Promise) {
        let res = self.handler.lock().deregister(self, promise.clone());
        self.route_outbound_error(res, Some(promise));
    }

    pub(crate) fn invoke_read_op(self: &Arc<Self>) {
        let res = self.handler.lock().read(self);
        self.route_outbound_error(res, None);
    }

    pub(crate) fn invoke_write(self: &Arc<Self>, msg: Message, promise: Promise) {
        let res = self.handler.lock().write(self, msg, promise.clone());
        self.route_outbound_error(res, Some(promise));
    }

    pub(crate) fn invoke_flush(self: &Arc<Self>) {
        let res = self.handler.lock().flush(self);
        self.route_outbound_error(res, None);
    }

    /// An inbound handler error becomes `exception_caught` at the next
    /// context and onward.
    fn route_inbound_error(self: &Arc<Self>, res: crate::error::Result<()>) {
        if let Err(cause) = res {
            match self.next_inbound() {
                Some(next) => next.invoke_exception_caught(cause),
                None => log::warn!("[Pipeline] exception reached end of pipeline: {}", cause),
            }
        }
    }

    /// An outbound handler error fails the operation's promise and also
    /// surfaces inbound so observers (loggers) see it.
    fn route_outbound_error(self: &Arc<Self>, res: crate::error::Result<()>, promise: Option<Promise>) {
        if let Err(cause) = res {
            if let Some(promise) = promise {
                promise.fail(cause.clone());
            }
            if let Some(ch) = self.channel() {
                ch.pipeline().fire_exception_now(cause);
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("mask", &self.mask)
            .finish()
    }
}
