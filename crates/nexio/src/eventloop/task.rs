// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Submitted tasks and their cancellation handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub(crate) struct Task {
    f: Box<dyn FnOnce() + Send>,
    cancelled: Arc<AtomicBool>,
}

impl Task {
    pub(crate) fn new(f: Box<dyn FnOnce() + Send>) -> (Self, TaskHandle) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = TaskHandle {
            cancelled: cancelled.clone(),
        };
        (Self { f, cancelled }, handle)
    }

    /// Run unless cancelled; a cancelled task disappears silently.
    pub(crate) fn run(self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        (self.f)();
    }
}

/// Cancellation handle for a submitted or scheduled task.
///
/// Cancelling after the task started has no effect.
#[derive(Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Mark the task cancelled; returns false when it already was.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A task due at a fixed instant, ordered for a min-heap.
pub(crate) struct TimedTask {
    pub(crate) at: Instant,
    pub(crate) seq: u64,
    pub(crate) task: Task,
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so BinaryHeap pops the earliest deadline first; seq
        // breaks ties in submission order.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_cancel_before_run_suppresses_task() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let (task, handle) = Task::new(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(handle.cancel());
        assert!(!handle.cancel(), "second cancel reports already-cancelled");
        task.run();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_uncancelled_task_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let (task, handle) = Task::new(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        task.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_timed_tasks_pop_in_deadline_order() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for (seq, offset) in [(0u64, 30u64), (1, 10), (2, 20)] {
            let (task, _h) = Task::new(Box::new(|| {}));
            heap.push(TimedTask {
                at: now + Duration::from_millis(offset),
                seq,
                task,
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.seq)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_same_deadline_ties_break_by_submission() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for seq in [2u64, 0, 1] {
            let (task, _h) = Task::new(Box::new(|| {}));
            heap.push(TimedTask { at: now, seq, task });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.seq)).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }
}
