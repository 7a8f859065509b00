// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The outbound buffer: queued writes awaiting flush, plus writability
//! accounting against the high/low water marks.
//!
//! Entries keep their message; partial transmission advances the buffer's
//! read cursor, so the unconsumed remainder naturally stays at the head of
//! the queue. Promises live in the flush notifier, in the same FIFO order
//! as the entries.

use std::collections::VecDeque;

use super::flush_notifier::FlushNotifier;
use super::Message;
use crate::concurrent::Promise;

pub(crate) struct OutEntry {
    pub(crate) msg: Message,
}

pub(crate) struct Outbound {
    queue: VecDeque<OutEntry>,
    pub(crate) notifier: FlushNotifier,
    pending_bytes: usize,
    writable: bool,
    high_water: usize,
    low_water: usize,
    closed: bool,
}

impl Outbound {
    pub(crate) fn new(high_water: usize, low_water: usize) -> Self {
        debug_assert!(low_water <= high_water);
        Self {
            queue: VecDeque::new(),
            notifier: FlushNotifier::new(),
            pending_bytes: 0,
            writable: true,
            high_water,
            low_water,
            closed: false,
        }
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Queue one write; its promise becomes due after `size` flushed bytes.
    pub(crate) fn push(&mut self, msg: Message, size: usize, promise: Promise) {
        debug_assert!(!self.closed);
        self.notifier.add(promise, size as u64);
        self.queue.push_back(OutEntry { msg });
        self.pending_bytes += size;
        self.update_writability();
    }

    /// Account `n` bytes as flushed to the transport.
    pub(crate) fn written(&mut self, n: usize) {
        self.pending_bytes = self.pending_bytes.saturating_sub(n);
        self.notifier.increase(n as u64);
        self.update_writability();
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut OutEntry> {
        self.queue.front_mut()
    }

    pub(crate) fn pop_front(&mut self) -> Option<OutEntry> {
        self.queue.pop_front()
    }

    /// Promises due for success at the current counter; complete them with
    /// the channel's locks released.
    pub(crate) fn drain_success(&mut self) -> Vec<Promise> {
        self.notifier.drain_success()
    }

    /// Refuse further writes, release queued buffers, and split the
    /// promises into (flushed-successes, to-fail).
    pub(crate) fn close(&mut self) -> (Vec<Promise>, Vec<Promise>) {
        self.closed = true;
        for entry in self.queue.drain(..) {
            entry.msg.release();
        }
        self.pending_bytes = 0;
        self.notifier.drain_split()
    }

    /// One hysteresis walk: above high -> unwritable, below low -> writable.
    fn update_writability(&mut self) {
        if self.writable && self.pending_bytes > self.high_water {
            self.writable = false;
        } else if !self.writable && self.pending_bytes < self.low_water {
            self.writable = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteBuf;

    const KIB: usize = 1024;

    fn msg_of(size: usize) -> Message {
        let mut buf = ByteBuf::new_unpooled(size, size);
        buf.write_bytes(&vec![0u8; size]).expect("fill");
        Message::Buf(buf)
    }

    fn outbound_64_32() -> Outbound {
        Outbound::new(64 * KIB, 32 * KIB)
    }

    #[test]
    fn test_writability_flips_once_past_high_water() {
        let mut ob = outbound_64_32();
        assert!(ob.is_writable());
        // Queue 100 KiB in 10 KiB chunks without flushing.
        let mut edges = 0;
        for _ in 0..10 {
            let was = ob.is_writable();
            ob.push(msg_of(10 * KIB), 10 * KIB, Promise::new());
            if was != ob.is_writable() {
                edges += 1;
            }
        }
        assert!(!ob.is_writable());
        assert_eq!(edges, 1, "exactly one high-water edge");
    }

    #[test]
    fn test_writability_returns_below_low_water() {
        let mut ob = outbound_64_32();
        ob.push(msg_of(100 * KIB), 100 * KIB, Promise::new());
        assert!(!ob.is_writable());
        // Flush 80 KiB: 20 KiB pending < 32 KiB low water.
        let mut edges = 0;
        for _ in 0..8 {
            let was = ob.is_writable();
            ob.written(10 * KIB);
            if was != ob.is_writable() {
                edges += 1;
            }
        }
        assert!(ob.is_writable());
        assert_eq!(edges, 1, "exactly one low-water edge");
    }

    #[test]
    fn test_between_marks_keeps_state() {
        let mut ob = outbound_64_32();
        ob.push(msg_of(100 * KIB), 100 * KIB, Promise::new());
        assert_eq!(ob.pending_bytes(), 100 * KIB);
        assert!(!ob.is_writable());
        ob.written(50 * KIB); // 50 KiB pending: between the marks
        assert_eq!(ob.pending_bytes(), 50 * KIB);
        assert!(!ob.is_writable(), "hysteresis holds between marks");
    }

    #[test]
    fn test_close_releases_and_splits_promises() {
        let mut ob = outbound_64_32();
        let (p1, p2) = (Promise::new(), Promise::new());
        ob.push(msg_of(8), 8, p1.clone());
        ob.push(msg_of(8), 8, p2.clone());
        ob.written(8);
        let (due, rest) = ob.close();
        assert_eq!(due.len(), 1);
        assert_eq!(rest.len(), 1);
        assert!(ob.is_closed());
        assert!(ob.is_empty());
    }
}
