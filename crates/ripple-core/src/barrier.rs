#![forbid(unsafe_code)]

//! Asynchronous join counter.
//!
//! A [`Barrier`] counts units of outstanding work. Each call to
//! [`pending`](Barrier::pending) hands out a [`PendingToken`]; invoking the
//! token completes that unit. Waiters registered with
//! [`wait_for_all`](Barrier::wait_for_all) fire, in registration order, the
//! moment the count returns to zero.
//!
//! # Invariants
//!
//! 1. While the count is above zero no waiter fires.
//! 2. A token completes its unit at most once; a second invocation is a
//!    usage error and leaves the count untouched.
//! 3. Waiters registered while the count is zero fire immediately, so
//!    waiters added from inside a draining waiter join the same drain.
//! 4. If a draining waiter registers new pending work, the drain stops and
//!    the remaining waiters wait for the next zero crossing.
//!
//! # Deferred mode
//!
//! Callbacks and waiters flagged non-immediate (or every callback, when the
//! barrier was built with `defer_all`) are routed through the
//! [`Scheduler`] instead of being called on the current stack.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::scheduler::Scheduler;

type Callback = Box<dyn FnOnce()>;

struct Waiter {
    callback: Callback,
    immediate: bool,
}

struct BarrierState {
    label: String,
    pending: usize,
    waiters: VecDeque<Waiter>,
}

/// Shared join counter. Clones refer to the same counter.
#[derive(Clone)]
pub struct Barrier {
    state: Rc<RefCell<BarrierState>>,
    scheduler: Scheduler,
    defer_all: bool,
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Barrier")
            .field("label", &state.label)
            .field("pending", &state.pending)
            .field("waiters", &state.waiters.len())
            .field("defer_all", &self.defer_all)
            .finish()
    }
}

impl Barrier {
    /// Create a barrier whose deferred callbacks go to `scheduler`.
    ///
    /// With `defer_all`, every callback is deferred regardless of the
    /// `immediate` flag it was registered with.
    #[must_use]
    pub fn new(label: impl Into<String>, scheduler: Scheduler, defer_all: bool) -> Self {
        Self {
            state: Rc::new(RefCell::new(BarrierState {
                label: label.into(),
                pending: 0,
                waiters: VecDeque::new(),
            })),
            scheduler,
            defer_all,
        }
    }

    /// Register one unit of pending work with no completion callback.
    #[must_use]
    pub fn pending(&self) -> PendingToken {
        self.register(None, true)
    }

    /// Register one unit of pending work. `callback` runs when the token is
    /// invoked, before the unit is counted as complete.
    #[must_use]
    pub fn pending_with(&self, callback: impl FnOnce() + 'static, immediate: bool) -> PendingToken {
        self.register(Some(Box::new(callback)), immediate)
    }

    fn register(&self, callback: Option<Callback>, immediate: bool) -> PendingToken {
        self.state.borrow_mut().pending += 1;
        PendingToken {
            barrier: self.clone(),
            used: Rc::new(Cell::new(false)),
            callback: Rc::new(RefCell::new(callback)),
            immediate,
        }
    }

    /// Run `callback` once the count reaches zero (now, if it already is).
    pub fn wait_for_all(&self, callback: impl FnOnce() + 'static, immediate: bool) {
        let waiter = Waiter {
            callback: Box::new(callback),
            immediate,
        };
        {
            let mut state = self.state.borrow_mut();
            if state.pending > 0 {
                state.waiters.push_back(waiter);
                return;
            }
        }
        self.fire(waiter);
    }

    /// Complete one unit of work directly, without a token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Usage`] if nothing is pending.
    pub fn one_done(&self) -> Result<()> {
        {
            let state = self.state.borrow();
            if state.pending == 0 {
                return Err(Error::usage(format!(
                    "barrier '{}' has no pending work",
                    state.label
                )));
            }
        }
        self.complete_one();
        Ok(())
    }

    fn complete_one(&self) {
        let drained = {
            let mut state = self.state.borrow_mut();
            state.pending = state.pending.saturating_sub(1);
            state.pending == 0
        };
        if drained {
            self.drain();
        }
    }

    fn drain(&self) {
        trace!(label = %self.label(), "barrier drained");
        loop {
            let waiter = {
                let mut state = self.state.borrow_mut();
                if state.pending != 0 {
                    break;
                }
                state.waiters.pop_front()
            };
            match waiter {
                Some(waiter) => self.fire(waiter),
                None => break,
            }
        }
    }

    fn fire(&self, waiter: Waiter) {
        if waiter.immediate && !self.defer_all {
            (waiter.callback)();
        } else {
            self.scheduler.defer(waiter.callback);
        }
    }

    /// Units of work still outstanding.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending
    }

    /// `true` if no work is outstanding.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0
    }

    /// Number of waiters queued for the next zero crossing.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.borrow().waiters.len()
    }

    /// Diagnostic label.
    #[must_use]
    pub fn label(&self) -> String {
        self.state.borrow().label.clone()
    }
}

/// Completion handle for one unit of barrier work.
///
/// Clones share the same "used" flag, so the unit completes at most once no
/// matter which clone is invoked.
#[derive(Clone)]
pub struct PendingToken {
    barrier: Barrier,
    used: Rc<Cell<bool>>,
    callback: Rc<RefCell<Option<Callback>>>,
    immediate: bool,
}

impl fmt::Debug for PendingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingToken")
            .field("barrier", &self.barrier.label())
            .field("used", &self.used.get())
            .field("immediate", &self.immediate)
            .finish()
    }
}

impl PendingToken {
    /// Complete this unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenReused`] if the token was already invoked.
    pub fn invoke(&self) -> Result<()> {
        if self.used.replace(true) {
            return Err(Error::TokenReused {
                barrier: self.barrier.label(),
            });
        }
        let callback = self.callback.borrow_mut().take();
        if self.immediate && !self.barrier.defer_all {
            if let Some(callback) = callback {
                callback();
            }
            self.barrier.complete_one();
        } else {
            let barrier = self.barrier.clone();
            self.barrier.scheduler.defer(move || {
                if let Some(callback) = callback {
                    callback();
                }
                barrier.complete_one();
            });
        }
        Ok(())
    }

    /// `true` once the token has been invoked.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used.get()
    }
}
