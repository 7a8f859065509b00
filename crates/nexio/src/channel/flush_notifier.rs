// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flush-promise notifier: resolves write promises in enqueue order, using
//! the cumulative count of bytes actually flushed as the clock.
//!
//! Each queued promise carries a checkpoint: the counter value at enqueue
//! time plus the pending size of that write. `increase` advances the
//! counter as bytes reach the wire; `notify_success` then resolves every
//! head entry whose checkpoint has been passed. Resolution is strictly
//! FIFO, for failure as well as success.
//!
//! The counter resets to zero whenever the queue drains, and rebases once
//! it reaches 2^60 (subtracting itself from every stored checkpoint), so
//! the arithmetic stays far from overflow at negligible cost.

use std::collections::VecDeque;

use crate::concurrent::Promise;
use crate::error::Error;

/// Counter value that triggers a rebase.
const REBASE_THRESHOLD: u64 = 1 << 60;

struct Entry {
    checkpoint: u64,
    promise: Promise,
}

/// FIFO write-promise resolver over a flushed-bytes counter.
pub struct FlushNotifier {
    write_counter: u64,
    queue: VecDeque<Entry>,
    /// Guards against re-entry from a promise listener completing more
    /// writes on the same notifier; nested calls are deferred to the
    /// caller's drain loop.
    notifying: bool,
}

impl FlushNotifier {
    pub fn new() -> Self {
        Self {
            write_counter: 0,
            queue: VecDeque::new(),
            notifying: false,
        }
    }

    /// Enqueue `promise`, due once `pending` further bytes have flushed.
    pub fn add(&mut self, promise: Promise, pending: u64) {
        let checkpoint = self.write_counter + pending;
        self.queue.push_back(Entry {
            checkpoint,
            promise,
        });
    }

    /// Advance the counter by `delta` newly flushed bytes.
    pub fn increase(&mut self, delta: u64) {
        self.write_counter += delta;
        if self.write_counter >= REBASE_THRESHOLD {
            self.rebase();
        }
    }

    pub fn write_counter(&self) -> u64 {
        self.write_counter
    }

    pub fn pending_promises(&self) -> usize {
        self.queue.len()
    }

    /// Resolve every head entry whose checkpoint has been passed.
    pub fn notify_success(&mut self) {
        if self.notifying {
            return;
        }
        self.notifying = true;
        loop {
            let due = self.pop_due();
            if due.is_empty() {
                break;
            }
            for promise in due {
                promise.succeed();
            }
        }
        self.notifying = false;
        self.reset_if_empty();
    }

    /// Succeed entries already covered by the counter, fail the rest.
    pub fn notify_failure(&mut self, cause: Error) {
        self.notify_failure_split(cause.clone(), cause);
    }

    /// Two-cause variant: the first entry past the counter (the partially
    /// flushed head) fails with `head_cause`, the remainder with
    /// `rest_cause`.
    pub fn notify_failure_split(&mut self, head_cause: Error, rest_cause: Error) {
        let (due, rest) = self.split_at_counter();
        for promise in due {
            promise.succeed();
        }
        let mut rest = rest.into_iter();
        if let Some(head) = rest.next() {
            head.fail(head_cause);
        }
        for promise in rest {
            promise.fail(rest_cause.clone());
        }
        self.reset_if_empty();
    }

    /// Pop entries due at the current counter, for completion by the
    /// caller once its own locks are released.
    pub(crate) fn drain_success(&mut self) -> Vec<Promise> {
        let due = self.pop_due();
        self.reset_if_empty();
        due
    }

    /// Split everything out of the queue: (due-for-success, to-fail).
    pub(crate) fn drain_split(&mut self) -> (Vec<Promise>, Vec<Promise>) {
        let split = self.split_at_counter();
        self.reset_if_empty();
        split
    }

    fn pop_due(&mut self) -> Vec<Promise> {
        let mut due = Vec::new();
        while let Some(head) = self.queue.front() {
            if head.checkpoint > self.write_counter {
                break;
            }
            due.push(self.queue.pop_front().expect("head exists").promise);
        }
        due
    }

    fn split_at_counter(&mut self) -> (Vec<Promise>, Vec<Promise>) {
        let due = self.pop_due();
        let rest = self.queue.drain(..).map(|e| e.promise).collect();
        (due, rest)
    }

    fn reset_if_empty(&mut self) {
        if self.queue.is_empty() {
            self.write_counter = 0;
        }
    }

    fn rebase(&mut self) {
        let base = self.write_counter;
        for entry in &mut self.queue {
            entry.checkpoint = entry.checkpoint.saturating_sub(base);
        }
        self.write_counter = 0;
        log::debug!("[Flush] counter rebased ({} promises pending)", self.queue.len());
    }
}

impl Default for FlushNotifier {
    fn default() -> Self {
        Self::new()
    }
}
