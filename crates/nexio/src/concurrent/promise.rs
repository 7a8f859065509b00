// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Write/operation promises with listener callbacks.
//!
//! A promise resolves exactly once; the first completion wins and later
//! attempts report `false`. Listeners registered before completion run at
//! completion time on the completing thread; listeners registered after run
//! immediately on the registering thread. Blocking waits exist for tests
//! and shutdown paths only — loop code never blocks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Error;

type Outcome = Result<(), Error>;
type Listener = Box<dyn FnOnce(&Outcome) + Send>;

enum State {
    Pending(Vec<Listener>),
    Done(Outcome),
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
}

/// Cloneable handle to a one-shot completion.
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Inner>,
}

impl Promise {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                cv: Condvar::new(),
            }),
        }
    }

    /// Resolve successfully. Returns false if already completed.
    pub fn succeed(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Resolve with a failure cause. Returns false if already completed.
    pub fn fail(&self, cause: Error) -> bool {
        self.complete(Err(cause))
    }

    /// Resolve with `outcome`; first completion wins.
    pub fn complete(&self, outcome: Outcome) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(pending) => {
                    let listeners = std::mem::take(pending);
                    *state = State::Done(outcome.clone());
                    self.inner.cv.notify_all();
                    listeners
                }
                State::Done(_) => return false,
            }
        };
        for listener in listeners {
            listener(&outcome);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(Ok(())))
    }

    pub fn is_failed(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(Err(_)))
    }

    /// The outcome, if completed.
    pub fn outcome(&self) -> Option<Outcome> {
        match &*self.inner.state.lock() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    /// The failure cause, if failed.
    pub fn cause(&self) -> Option<Error> {
        match self.outcome() {
            Some(Err(cause)) => Some(cause),
            _ => None,
        }
    }

    /// Run `f` when the promise completes (immediately if it already has).
    pub fn add_listener(&self, f: impl FnOnce(&Outcome) + Send + 'static) {
        let run_now = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(listeners) => {
                    listeners.push(Box::new(f));
                    None
                }
                State::Done(outcome) => Some((f, outcome.clone())),
            }
        };
        if let Some((f, outcome)) = run_now {
            f(&outcome);
        }
    }

    /// Block until completion. Test/shutdown helper; never call on a loop.
    pub fn wait(&self) -> Outcome {
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(outcome) = &*state {
                return outcome.clone();
            }
            self.inner.cv.wait(&mut state);
        }
    }

    /// Block until completion or timeout; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(outcome) = &*state {
                return Some(outcome.clone());
            }
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            if self.inner.cv.wait_for(&mut state, remaining).timed_out() {
                // Final check under the lock to absorb the wake/timeout race
                if let State::Done(outcome) = &*state {
                    return Some(outcome.clone());
                }
                return None;
            }
        }
    }
}

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.state.lock() {
            State::Pending(_) => "pending",
            State::Done(Ok(())) => "success",
            State::Done(Err(_)) => "failed",
        };
        write!(f, "Promise({})", state)
    }
}
