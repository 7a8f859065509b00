// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The event loop: one selector, one task queue, one dedicated thread.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       EventLoop thread                       |
//! |  +--------------------------------------------------------+  |
//! |  |                       mio::Poll                        |  |
//! |  |  - channel sockets (read/write/accept readiness)       |  |
//! |  |  - Waker (cross-thread task submission)                |  |
//! |  +--------------------------------------------------------+  |
//! |        |                  |                   |              |
//! |        v                  v                   v              |
//! |  dispatch ready     drain task queue     run due timers      |
//! +--------------------------------------------------------------+
//! ```
//!
//! Each iteration: select with a bounded quantum, absorb the wake-up race,
//! dispatch readiness to the owning channels, drain the FIFO task queue,
//! fire timers, then check for shutdown. A panic anywhere in dispatch is
//! caught and logged and the loop pauses a second so a persistent failure
//! cannot spin the CPU.

use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::{Mutex, RwLock};

use super::task::{Task, TaskHandle, TimedTask};
use crate::channel::Channel;
use crate::concurrent::Promise;

const WAKER_TOKEN: Token = Token(0);

/// Channel tokens start above the waker's.
const FIRST_CHANNEL_TOKEN: usize = 1;

/// Bound on idle latency for task/timer pickup.
const SELECT_QUANTUM: Duration = Duration::from_millis(10);

/// Deregistrations tolerated before a no-op select compacts the selector.
const CANCELLED_KEY_THRESHOLD: usize = 256;

/// Pause after a caught panic, so a persistently failing handler cannot
/// spin the loop at full speed.
const PANIC_PAUSE: Duration = Duration::from_secs(1);

const MAX_EVENTS: usize = 256;

struct LoopShared {
    name: String,
    tasks: SegQueue<Task>,
    timers: Mutex<BinaryHeap<TimedTask>>,
    timer_seq: AtomicU64,
    waker: Waker,
    registry: Registry,
    waken_up: AtomicBool,
    shutdown: AtomicBool,
    thread_id: RwLock<Option<ThreadId>>,
    channels: Mutex<HashMap<Token, Arc<Channel>>>,
    next_token: AtomicUsize,
    cancelled_keys: AtomicUsize,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a running loop; the cross-thread face of it.
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<LoopShared>,
}

impl EventLoopHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// True when called from the loop's own thread.
    pub fn is_in_loop(&self) -> bool {
        (*self.shared.thread_id.read()) == Some(thread::current().id())
    }

    /// Enqueue `f` for execution on the loop thread, FIFO. Never runs
    /// inline, even when called from the loop itself.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) -> TaskHandle {
        let (task, handle) = Task::new(Box::new(f));
        self.shared.tasks.push(task);
        self.wakeup();
        handle
    }

    /// Run `f` on the loop thread after `delay`.
    pub fn schedule(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TaskHandle {
        let (task, handle) = Task::new(Box::new(f));
        let timed = TimedTask {
            at: Instant::now() + delay,
            seq: self.shared.timer_seq.fetch_add(1, Ordering::Relaxed),
            task,
        };
        self.shared.timers.lock().push(timed);
        self.wakeup();
        handle
    }

    /// Associate `channel` with this loop. The promise resolves once the
    /// channel joined the selector and its pipeline saw `registered`.
    pub fn register(&self, channel: &Arc<Channel>) -> Promise {
        let promise = Promise::new();
        let ch = channel.clone();
        let p = promise.clone();
        let handle = self.clone();
        let _ = self.submit(move || ch.do_register(handle, p));
        promise
    }

    /// Request graceful termination: registered channels close, queued
    /// tasks drain, the thread exits.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            let _ = self.shared.waker.wake();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Wait (bounded) for the loop thread to exit after `shutdown`.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let Some(join) = self.shared.join.lock().take() else {
            return true; // already joined elsewhere
        };
        let deadline = Instant::now() + timeout;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                *self.shared.join.lock() = Some(join);
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _ = join.join();
        true
    }

    /// Wake the selector if someone might be sleeping in it. The CAS keeps
    /// redundant (and costly) waker syscalls off the hot path.
    fn wakeup(&self) {
        if self.is_in_loop() {
            return; // the running iteration drains the queue anyway
        }
        if self
            .shared
            .waken_up
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Err(e) = self.shared.waker.wake() {
                log::debug!("[Loop] {} wake failed: {}", self.shared.name, e);
            }
        }
    }

    // ===== Channel plumbing (crate internal) =====

    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub(crate) fn alloc_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert_channel(&self, token: Token, channel: Arc<Channel>) {
        self.shared.channels.lock().insert(token, channel);
    }

    pub(crate) fn remove_channel(&self, token: Token) {
        self.shared.channels.lock().remove(&token);
        self.shared.cancelled_keys.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventLoopHandle({})", self.shared.name)
    }
}

/// The loop runner; lives on its dedicated thread after [`spawn`].
///
/// [`spawn`]: EventLoop::spawn
pub struct EventLoop {
    poll: Poll,
    events: Events,
    shared: Arc<LoopShared>,
}

impl EventLoop {
    /// Start a loop on a new named thread and hand back its handle.
    pub fn spawn(name: &str) -> io::Result<EventLoopHandle> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        let shared = Arc::new(LoopShared {
            name: name.to_string(),
            tasks: SegQueue::new(),
            timers: Mutex::new(BinaryHeap::new()),
            timer_seq: AtomicU64::new(0),
            waker,
            registry,
            waken_up: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            thread_id: RwLock::new(None),
            channels: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(FIRST_CHANNEL_TOKEN),
            cancelled_keys: AtomicUsize::new(0),
            join: Mutex::new(None),
        });
        let mut event_loop = EventLoop {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            shared: shared.clone(),
        };
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || event_loop.run())?;
        *shared.join.lock() = Some(join);
        Ok(EventLoopHandle { shared })
    }

    fn run(&mut self) {
        *self.shared.thread_id.write() = Some(thread::current().id());
        log::debug!("[Loop] {} started", self.shared.name);
        loop {
            let timeout = self.next_timeout();
            self.shared.waken_up.store(false, Ordering::SeqCst);
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::error!("[Loop] {} select failed: {}", self.shared.name, e);
                    thread::sleep(PANIC_PAUSE);
                }
            }
            // A wake-up that landed between clearing the flag and entering
            // the select would leave the next select blind; re-arm it.
            if self.shared.waken_up.load(Ordering::SeqCst) {
                let _ = self.shared.waker.wake();
            }
            self.dispatch_ready();
            self.run_all_tasks();
            self.run_due_timers();
            if self.shared.shutdown.load(Ordering::Acquire) {
                self.drain_and_exit();
                return;
            }
            self.maybe_compact();
        }
    }

    /// Select quantum, shortened by pending work.
    fn next_timeout(&self) -> Duration {
        if !self.shared.tasks.is_empty() {
            return Duration::ZERO;
        }
        match self.shared.timers.lock().peek() {
            Some(timed) => SELECT_QUANTUM.min(timed.at.saturating_duration_since(Instant::now())),
            None => SELECT_QUANTUM,
        }
    }

    fn dispatch_ready(&mut self) {
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue; // tasks drain every iteration regardless
            }
            let channel = self.shared.channels.lock().get(&token).cloned();
            let Some(channel) = channel else { continue };
            let writable = event.is_writable();
            let readable = event.is_readable();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if writable {
                    channel.write_ready();
                }
                if readable {
                    channel.read_ready();
                }
            }));
            if outcome.is_err() {
                log::error!(
                    "[Loop] {} channel {} dispatch panicked; pausing",
                    self.shared.name,
                    channel.id()
                );
                thread::sleep(PANIC_PAUSE);
            }
        }
    }

    /// Drain the task queue completely, in submission order.
    fn run_all_tasks(&self) {
        while let Some(task) = self.shared.tasks.pop() {
            if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
                log::error!("[Loop] {} task panicked; pausing", self.shared.name);
                thread::sleep(PANIC_PAUSE);
            }
        }
    }

    fn run_due_timers(&self) {
        loop {
            let due = {
                let mut timers = self.shared.timers.lock();
                match timers.peek() {
                    Some(timed) if timed.at <= Instant::now() => timers.pop(),
                    _ => None,
                }
            };
            let Some(timed) = due else { break };
            if catch_unwind(AssertUnwindSafe(|| timed.task.run())).is_err() {
                log::error!("[Loop] {} timer panicked; pausing", self.shared.name);
                thread::sleep(PANIC_PAUSE);
            }
        }
    }

    /// After enough deregistrations, run a no-op select so the selector
    /// compacts its cancelled-key set.
    fn maybe_compact(&mut self) {
        if self.shared.cancelled_keys.load(Ordering::Relaxed) < CANCELLED_KEY_THRESHOLD {
            return;
        }
        self.shared.cancelled_keys.store(0, Ordering::Relaxed);
        if self.poll.poll(&mut self.events, Some(Duration::ZERO)).is_ok() {
            self.dispatch_ready();
        }
    }

    fn drain_and_exit(&mut self) {
        log::debug!("[Loop] {} shutting down", self.shared.name);
        let channels: Vec<Arc<Channel>> = self.shared.channels.lock().values().cloned().collect();
        for channel in channels {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                channel.do_close(Promise::new());
            }));
            if outcome.is_err() {
                log::error!("[Loop] {} close of channel panicked", self.shared.name);
            }
        }
        self.run_all_tasks();
        *self.shared.thread_id.write() = None;
        log::debug!("[Loop] {} stopped", self.shared.name);
    }
}
