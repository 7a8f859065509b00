// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process transport: a pair of channels joined back to back.
//!
//! A flush moves the queued buffers into the peer's inbox (no copy; the
//! buffer itself changes hands) and pokes the peer's loop to deliver them
//! as read events. Closing one side closes the other, like a FIN.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::{ByteBuf, PooledAllocator};
use crate::channel::{Channel, ChannelConfig};

pub(crate) struct LocalTransport {
    peer: Mutex<Weak<Channel>>,
    inbox: Mutex<VecDeque<ByteBuf>>,
}

impl LocalTransport {
    fn new() -> Self {
        Self {
            peer: Mutex::new(Weak::new()),
            inbox: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn set_peer(&self, peer: Weak<Channel>) {
        *self.peer.lock() = peer;
    }

    pub(crate) fn peer(&self) -> Option<Arc<Channel>> {
        self.peer.lock().upgrade()
    }

    pub(crate) fn push_inbox(&self, buf: ByteBuf) {
        self.inbox.lock().push_back(buf);
    }

    pub(crate) fn has_inbox(&self) -> bool {
        !self.inbox.lock().is_empty()
    }

    pub(crate) fn drain_inbox(&self) -> Vec<ByteBuf> {
        self.inbox.lock().drain(..).collect()
    }
}

/// Create two connected in-memory channels.
///
/// Both start unregistered; register each with an event loop (the same one
/// or different ones) before use. Bytes flushed into either side surface
/// as reads on the other.
pub fn local_pair(
    allocator: &Arc<PooledAllocator>,
    config: ChannelConfig,
) -> (Arc<Channel>, Arc<Channel>) {
    let a = Channel::new_local(allocator.clone(), config.clone(), LocalTransport::new());
    let b = Channel::new_local(allocator.clone(), config, LocalTransport::new());
    a.set_local_peer(&b);
    b.set_local_peer(&a);
    (a, b)
}
