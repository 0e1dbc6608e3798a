#![forbid(unsafe_code)]

//! Nested change scopes that coalesce deferred work.
//!
//! A change scope is a transaction over notifications. Work queued with
//! [`ScopeStack::on_exit`] does not run when the innermost scope exits if an
//! enclosing scope is still active: the handlers are *transferred* to the
//! parent and run only when the outermost active ancestor exits. Work queued
//! with [`ScopeStack::on_abort`] runs only if the scope is aborted.
//!
//! # Storage
//!
//! Scopes live in an arena of records addressed by [`ScopeId`]. A record's
//! `parent` is an index, never an owning reference, so walking up through
//! terminated ancestors is an index-following loop. The arena is reset when
//! the last live scope terminates; ids from an earlier epoch read as
//! terminated.
//!
//! # State machine
//!
//! ```text
//! Active ──exit()──▶ Exiting ──▶ Terminated
//!   │                   │
//!   └──abort()──▶ Aborting ──▶ Terminated
//! ```
//!
//! A scope counts as active while `Active` or `Exiting`, so scopes created
//! by exit handlers still transfer into their exiting parent and their work
//! joins the same drain.
//!
//! # Runaway detection
//!
//! Each record carries an `exit_version`. A transfer from child `c` into
//! parent `p` computes
//!
//! ```text
//! v = max(p.version, c.version + 1)      if p is not exiting
//! v = max(p.version, c.version) + 1      if p is exiting
//! ```
//!
//! If `v` exceeds the configured limit the child aborts itself and a warning
//! is logged; otherwise `p.version = v`. The counter tracks the depth of a
//! deferral chain and, while a scope is draining, the number of times work
//! re-deferred itself into it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{trace, warn};

use crate::emitter::Emitter;
use crate::error::{Error, Result};

/// Handle to a scope record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId {
    epoch: u32,
    index: u32,
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}.{}", self.epoch, self.index)
    }
}

/// Lifecycle state of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Open and accepting work.
    Active,
    /// Running its exit handlers.
    Exiting,
    /// Running its abort handlers.
    Aborting,
    /// Finished. Never reactivates.
    Terminated,
}

impl ScopeState {
    /// `true` for states in which children transfer work into this scope.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::Exiting)
    }
}

struct ScopeRecord {
    parent: Option<ScopeId>,
    state: ScopeState,
    exit_version: u32,
    exit: Rc<Emitter<()>>,
    abort: Rc<Emitter<()>>,
}

/// Arena of change scopes plus the "current scope" slot.
pub struct ScopeStack {
    records: RefCell<Vec<ScopeRecord>>,
    epoch: Cell<u32>,
    live: Cell<usize>,
    current: Cell<Option<ScopeId>>,
    runaway_limit: u32,
    runaway_aborts: Cell<u64>,
}

impl fmt::Debug for ScopeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeStack")
            .field("current", &self.current.get())
            .field("live", &self.live.get())
            .field("runaway_limit", &self.runaway_limit)
            .field("runaway_aborts", &self.runaway_aborts.get())
            .finish()
    }
}

/// Turns a one-shot closure into an emitter handler.
fn once_handler(f: impl FnOnce() -> Result<()> + 'static) -> impl Fn(&()) -> Result<()> + 'static {
    let slot = RefCell::new(Some(f));
    move |_: &()| match slot.borrow_mut().take() {
        Some(f) => f(),
        None => Ok(()),
    }
}

impl ScopeStack {
    /// Create an empty stack with the given runaway limit.
    #[must_use]
    pub fn new(runaway_limit: u32) -> Self {
        Self {
            records: RefCell::new(Vec::new()),
            epoch: Cell::new(0),
            live: Cell::new(0),
            current: Cell::new(None),
            runaway_limit,
            runaway_aborts: Cell::new(0),
        }
    }

    /// Open a new scope nested in the current one and make it current.
    pub fn begin(&self) -> ScopeId {
        let parent = self.current.get();
        let mut records = self.records.borrow_mut();
        let id = ScopeId {
            epoch: self.epoch.get(),
            index: u32::try_from(records.len()).unwrap_or(u32::MAX),
        };
        records.push(ScopeRecord {
            parent,
            state: ScopeState::Active,
            exit_version: 0,
            exit: Rc::new(Emitter::new()),
            abort: Rc::new(Emitter::new()),
        });
        drop(records);
        self.live.set(self.live.get() + 1);
        self.current.set(Some(id));
        trace!(scope = %id, parent = ?parent, "scope entered");
        id
    }

    /// The innermost active scope, if any.
    #[must_use]
    pub fn current(&self) -> Option<ScopeId> {
        self.current.get()
    }

    /// State of `id`; stale ids read as [`ScopeState::Terminated`].
    #[must_use]
    pub fn state(&self, id: ScopeId) -> ScopeState {
        self.with_record(id, |r| r.state)
            .unwrap_or(ScopeState::Terminated)
    }

    /// `true` while `id` is active or exiting.
    #[must_use]
    pub fn is_active(&self, id: ScopeId) -> bool {
        self.state(id).is_active()
    }

    /// Parent captured when `id` was opened.
    #[must_use]
    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.with_record(id, |r| r.parent).flatten()
    }

    /// Runaway counter of `id`.
    #[must_use]
    pub fn exit_version(&self, id: ScopeId) -> u32 {
        self.with_record(id, |r| r.exit_version).unwrap_or(0)
    }

    /// Configured runaway limit.
    #[must_use]
    pub fn runaway_limit(&self) -> u32 {
        self.runaway_limit
    }

    /// How many scopes have been force-aborted by runaway detection.
    #[must_use]
    pub fn runaway_aborts(&self) -> u64 {
        self.runaway_aborts.get()
    }

    /// Number of exit handlers queued on `id`.
    #[must_use]
    pub fn pending_exit_handlers(&self, id: ScopeId) -> usize {
        self.with_record(id, |r| r.exit.len()).unwrap_or(0)
    }

    fn with_record<R>(&self, id: ScopeId, f: impl FnOnce(&ScopeRecord) -> R) -> Option<R> {
        if id.epoch != self.epoch.get() {
            return None;
        }
        self.records.borrow().get(id.index as usize).map(f)
    }

    fn with_record_mut<R>(&self, id: ScopeId, f: impl FnOnce(&mut ScopeRecord) -> R) -> Option<R> {
        if id.epoch != self.epoch.get() {
            return None;
        }
        self.records.borrow_mut().get_mut(id.index as usize).map(f)
    }

    /// Queue `f` to run when the current scope exits, or run it now if there
    /// is no current scope.
    ///
    /// # Errors
    ///
    /// Only when `f` runs immediately: whatever `f` returns.
    pub fn on_exit(&self, f: impl FnOnce() -> Result<()> + 'static) -> Result<()> {
        match self.current.get() {
            None => f(),
            Some(id) => {
                if let Some(exit) = self.with_record(id, |r| Rc::clone(&r.exit)) {
                    exit.add_once(once_handler(f));
                }
                Ok(())
            }
        }
    }

    /// Queue `f` to run if the current scope is aborted. No-op without a
    /// current scope.
    pub fn on_abort(&self, f: impl FnOnce() -> Result<()> + 'static) {
        let abort = self
            .current
            .get()
            .and_then(|id| self.with_record(id, |r| Rc::clone(&r.abort)));
        if let Some(abort) = abort {
            abort.add_once(once_handler(f));
        }
    }

    /// Abort `id`: run its abort handlers, discard queued exit work, and
    /// terminate it.
    ///
    /// # Errors
    ///
    /// [`Error::ScopeInactive`] if `id` is not active; otherwise the first
    /// abort handler error, returned after cleanup.
    pub fn abort(&self, id: ScopeId) -> Result<()> {
        let emitters = self.with_record_mut(id, |r| {
            if !r.state.is_active() {
                return None;
            }
            r.state = ScopeState::Aborting;
            Some((Rc::clone(&r.exit), Rc::clone(&r.abort)))
        });
        let Some((exit, abort)) = emitters.flatten() else {
            return Err(Error::ScopeInactive(id));
        };
        trace!(scope = %id, "scope aborting");

        let result = abort.invoke(&());
        exit.clear();
        abort.clear();
        self.terminate(id);
        result
    }

    /// Exit `id`.
    ///
    /// Without an active parent, queued exit handlers run now (including any
    /// queued while they run). With an active parent, they are transferred
    /// to it instead, unless the transfer would exceed the runaway limit, in
    /// which case `id` is aborted.
    ///
    /// # Errors
    ///
    /// [`Error::ScopeInactive`] if `id` is not in the `Active` state;
    /// otherwise the first handler error, returned after cleanup.
    pub fn exit(&self, id: ScopeId) -> Result<()> {
        let record = self.with_record(id, |r| {
            (
                r.state,
                r.parent,
                r.exit_version,
                Rc::clone(&r.exit),
                Rc::clone(&r.abort),
            )
        });
        let Some((state, parent, version, exit, abort)) = record else {
            return Err(Error::ScopeInactive(id));
        };
        if state != ScopeState::Active {
            return Err(Error::ScopeInactive(id));
        }

        if exit.is_empty() {
            abort.clear();
            self.terminate(id);
            return Ok(());
        }

        let parent = parent.filter(|p| self.is_active(*p));
        match parent {
            None => {
                self.with_record_mut(id, |r| r.state = ScopeState::Exiting);
                trace!(scope = %id, handlers = exit.len(), "scope exiting");
                let result = exit.invoke(&());
                // An abort from inside a handler has already cleaned up.
                if self.state(id) == ScopeState::Exiting {
                    exit.clear();
                    abort.clear();
                    self.terminate(id);
                }
                result
            }
            Some(parent_id) => {
                let (parent_version, parent_state, parent_exit, parent_abort) = self
                    .with_record(parent_id, |r| {
                        (
                            r.exit_version,
                            r.state,
                            Rc::clone(&r.exit),
                            Rc::clone(&r.abort),
                        )
                    })
                    .ok_or(Error::ScopeInactive(parent_id))?;

                let next = if parent_state == ScopeState::Exiting {
                    parent_version.max(version).saturating_add(1)
                } else {
                    parent_version.max(version.saturating_add(1))
                };
                if next > self.runaway_limit {
                    self.runaway_aborts.set(self.runaway_aborts.get() + 1);
                    warn!(
                        scope = %id,
                        parent = %parent_id,
                        exit_version = next,
                        limit = self.runaway_limit,
                        "runaway change scope aborted: deferred work kept re-triggering itself"
                    );
                    return self.abort(id);
                }

                self.with_record_mut(parent_id, |r| r.exit_version = next);
                exit.drain_into(&parent_exit);
                abort.drain_into(&parent_abort);
                trace!(scope = %id, parent = %parent_id, exit_version = next, "scope transferred");
                self.terminate(id);
                Ok(())
            }
        }
    }

    /// Terminate `id` without running any handlers. Used when unwinding.
    pub fn discard(&self, id: ScopeId) {
        let emitters = self.with_record_mut(id, |r| {
            if r.state == ScopeState::Terminated {
                return None;
            }
            r.state = ScopeState::Aborting;
            Some((Rc::clone(&r.exit), Rc::clone(&r.abort)))
        });
        if let Some((exit, abort)) = emitters.flatten() {
            exit.clear();
            abort.clear();
            self.terminate(id);
        }
    }

    fn terminate(&self, id: ScopeId) {
        let parent = self.with_record_mut(id, |r| {
            r.state = ScopeState::Terminated;
            r.parent
        });
        let Some(parent) = parent else {
            return;
        };

        if self.current.get() == Some(id) {
            let mut next = parent;
            while let Some(candidate) = next {
                if self.is_active(candidate) {
                    break;
                }
                next = self.parent(candidate);
            }
            self.current.set(next);
        }

        let live = self.live.get().saturating_sub(1);
        self.live.set(live);
        if live == 0 {
            self.records.borrow_mut().clear();
            self.epoch.set(self.epoch.get().wrapping_add(1));
            self.current.set(None);
        }
        trace!(scope = %id, "scope terminated");
    }

    /// Run `f` inside a fresh scope, exiting it afterwards even if `f`
    /// fails. A panic unwinding out of `f` discards the scope.
    ///
    /// # Errors
    ///
    /// `f`'s error if it failed, otherwise the exit's error.
    pub fn perform<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let id = self.begin();
        let guard = DiscardOnUnwind { stack: self, id };
        let outcome = f();
        std::mem::forget(guard);
        let exited = self.exit(id);
        match outcome {
            Err(err) => Err(err),
            Ok(value) => exited.map(|()| value),
        }
    }
}

/// Discards a scope if `perform`'s callback panics.
struct DiscardOnUnwind<'a> {
    stack: &'a ScopeStack,
    id: ScopeId,
}

impl Drop for DiscardOnUnwind<'_> {
    fn drop(&mut self) {
        self.stack.discard(self.id);
    }
}
