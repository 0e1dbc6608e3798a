#![forbid(unsafe_code)]

//! Deferred callback queue drained by the host's event loop.
//!
//! This is the engine's only asynchronous suspension point. Work deferred
//! here (barrier callbacks in deferred mode) runs when the host calls
//! [`Scheduler::flush`].
//!
//! # Coalescing
//!
//! The first task queued while the scheduler is idle invokes the host wake
//! hook once. Further tasks ride on that pending flush. If a flush stops at
//! `max_per_flush` with work remaining, the wake hook is invoked again to
//! reschedule the remainder.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::trace;

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce()>;

struct SchedulerInner {
    queue: RefCell<VecDeque<Task>>,
    max_per_flush: Option<usize>,
    wake: RefCell<Option<Rc<dyn Fn()>>>,
    /// A flush has been requested (or is running) and has not yet drained.
    scheduled: Cell<bool>,
    flushes: Cell<u64>,
}

/// Shared handle to a deferred task queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .field("max_per_flush", &self.inner.max_per_flush)
            .field("flushes", &self.inner.flushes.get())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Scheduler {
    /// Create a scheduler. `max_per_flush` caps how many tasks a single
    /// [`flush`](Self::flush) runs; `None` means no cap. A cap of zero is
    /// treated as one.
    #[must_use]
    pub fn new(max_per_flush: Option<usize>) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                queue: RefCell::new(VecDeque::new()),
                max_per_flush: max_per_flush.map(|n| n.max(1)),
                wake: RefCell::new(None),
                scheduled: Cell::new(false),
                flushes: Cell::new(0),
            }),
        }
    }

    /// Install the host hook asked to schedule a flush.
    pub fn set_wake(&self, hook: impl Fn() + 'static) {
        *self.inner.wake.borrow_mut() = Some(Rc::new(hook));
    }

    /// Queue a task for the next flush.
    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.inner.queue.borrow_mut().push_back(Box::new(task));
        if !self.inner.scheduled.replace(true) {
            self.wake();
        }
    }

    /// Run queued tasks, up to the per-flush cap. Returns how many ran.
    pub fn flush(&self) -> usize {
        let cap = self.inner.max_per_flush.unwrap_or(usize::MAX);
        self.inner.scheduled.set(true);
        self.inner.flushes.set(self.inner.flushes.get() + 1);

        let mut ran = 0;
        while ran < cap {
            let task = self.inner.queue.borrow_mut().pop_front();
            let Some(task) = task else {
                break;
            };
            task();
            ran += 1;
        }

        let remaining = self.pending();
        trace!(ran, remaining, "scheduler flush");
        if remaining > 0 {
            self.wake();
        } else {
            self.inner.scheduled.set(false);
        }
        ran
    }

    /// Flush until the queue is empty. Returns the total number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        while self.pending() > 0 {
            total += self.flush();
        }
        total
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// `true` if nothing is queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Number of flushes performed so far.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.get()
    }

    fn wake(&self) {
        let hook = self.inner.wake.borrow().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}
