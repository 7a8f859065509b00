// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A fixed pool of event loops with round-robin channel placement.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::event_loop::{EventLoop, EventLoopHandle};

/// Fixed set of loops sharing the channel population.
///
/// A channel picked up via [`next`](Self::next) stays affined to that loop
/// for its whole life; the group only balances placement.
pub struct EventLoopGroup {
    loops: Vec<EventLoopHandle>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Spawn `threads` loops named `base-0`, `base-1`, ...
    pub fn new(threads: usize, base_name: &str) -> io::Result<Self> {
        let count = threads.max(1);
        let mut loops = Vec::with_capacity(count);
        for i in 0..count {
            loops.push(EventLoop::spawn(&format!("{}-{}", base_name, i))?);
        }
        log::debug!("[Loop] group '{}' started with {} loops", base_name, count);
        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// The next loop, round-robin.
    pub fn next(&self) -> EventLoopHandle {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[idx].clone()
    }

    pub fn handles(&self) -> &[EventLoopHandle] {
        &self.loops
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Shut every loop down and wait (bounded) for the threads to exit.
    pub fn shutdown(&self) {
        for handle in &self.loops {
            handle.shutdown();
        }
        for handle in &self.loops {
            if !handle.await_termination(Duration::from_secs(5)) {
                log::warn!("[Loop] {} did not terminate in time", handle.name());
            }
        }
    }
}
