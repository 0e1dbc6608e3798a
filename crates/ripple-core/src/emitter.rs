#![forbid(unsafe_code)]

//! Multi-subscriber callback list with filtered and one-shot entries.
//!
//! # Design
//!
//! [`Emitter<A>`] keeps an ordered list of handlers. `invoke(args)` walks the
//! list by index, cloning each handler out of the `RefCell` before calling it,
//! so handlers may freely add or remove entries on the same emitter while it
//! is firing. Entries appended during an invocation are reached by the same
//! walk.
//!
//! # Invariants
//!
//! 1. Handlers fire in registration order.
//! 2. A `once` entry is marked applied *before* it is called and is never
//!    called again, even if the emitter is re-invoked from inside it.
//! 3. Removal during an invocation only tombstones the entry; the list is
//!    compacted when the outermost invocation returns, so the walk index
//!    never shifts under a running invocation.
//!
//! # Failure Modes
//!
//! Handler errors are not caught here: `invoke` stops at the first failing
//! handler and returns its error. Remaining handlers do not run.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

/// Shared handler callback.
pub type Handler<A> = Rc<dyn Fn(&A) -> Result<()>>;
/// Shared argument filter.
pub type Filter<A> = Rc<dyn Fn(&A) -> bool>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one registration on an [`Emitter`].
///
/// Ids are unique across all emitters, so an entry keeps its id when it is
/// moved to another emitter with [`Emitter::drain_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

struct Entry<A> {
    id: HandlerId,
    callback: Handler<A>,
    filter: Option<Filter<A>>,
    once: bool,
    applied: bool,
    removed: bool,
}

impl<A> Entry<A> {
    fn is_live(&self) -> bool {
        !self.removed && !(self.once && self.applied)
    }
}

/// Ordered list of callbacks invoked with a shared argument.
pub struct Emitter<A> {
    entries: RefCell<Vec<Entry<A>>>,
    /// Nesting depth of in-flight `invoke` calls.
    depth: Cell<u32>,
}

impl<A> Default for Emitter<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Emitter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("live", &self.len())
            .field("depth", &self.depth.get())
            .finish()
    }
}

impl<A> Emitter<A> {
    /// Create an empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            depth: Cell::new(0),
        }
    }

    /// Register a handler that fires on every invocation.
    pub fn add(&self, handler: impl Fn(&A) -> Result<()> + 'static) -> HandlerId {
        self.add_with(Rc::new(handler), None, false)
    }

    /// Register a handler that fires at most once.
    pub fn add_once(&self, handler: impl Fn(&A) -> Result<()> + 'static) -> HandlerId {
        self.add_with(Rc::new(handler), None, true)
    }

    /// Register a handler with an optional argument filter and one-shot flag.
    pub fn add_with(&self, callback: Handler<A>, filter: Option<Filter<A>>, once: bool) -> HandlerId {
        let id = HandlerId::next();
        self.entries.borrow_mut().push(Entry {
            id,
            callback,
            filter,
            once,
            applied: false,
            removed: false,
        });
        id
    }

    /// Remove a handler. Returns `false` if it was not registered (or has
    /// already fired as a one-shot entry).
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let Some(pos) = entries.iter().position(|e| e.id == id && e.is_live()) else {
            return false;
        };
        if self.depth.get() > 0 {
            entries[pos].removed = true;
        } else {
            entries.remove(pos);
        }
        true
    }

    /// Call every live handler whose filter accepts `args`.
    ///
    /// # Errors
    ///
    /// Returns the first handler error; later handlers are skipped.
    pub fn invoke(&self, args: &A) -> Result<()> {
        self.depth.set(self.depth.get() + 1);
        let result = self.invoke_inner(args);
        self.depth.set(self.depth.get() - 1);
        if self.depth.get() == 0 {
            self.compact();
        }
        result
    }

    fn invoke_inner(&self, args: &A) -> Result<()> {
        let mut index = 0;
        loop {
            let (id, callback, filter) = {
                let entries = self.entries.borrow();
                let Some(entry) = entries.get(index) else {
                    return Ok(());
                };
                index += 1;
                if !entry.is_live() {
                    continue;
                }
                (entry.id, Rc::clone(&entry.callback), entry.filter.clone())
            };

            if filter.is_some_and(|f| !f(args)) {
                continue;
            }

            // Mark one-shot entries before the call so re-entrant invocation skips them.
            {
                let mut entries = self.entries.borrow_mut();
                if let Some(entry) = entries.get_mut(index - 1) {
                    if entry.id == id && entry.once {
                        entry.applied = true;
                    }
                }
            }

            callback(args)?;
        }
    }

    fn compact(&self) {
        self.entries.borrow_mut().retain(Entry::is_live);
    }

    /// `true` if no entry would fire for any argument.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` if no entry would fire for `args`.
    #[must_use]
    pub fn is_empty_for(&self, args: &A) -> bool {
        let filters: Vec<Option<Filter<A>>> = self
            .entries
            .borrow()
            .iter()
            .filter(|e| e.is_live())
            .map(|e| e.filter.clone())
            .collect();
        !filters.iter().any(|f| f.as_ref().is_none_or(|f| f(args)))
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().iter().filter(|e| e.is_live()).count()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.borrow_mut();
        if self.depth.get() > 0 {
            for entry in entries.iter_mut() {
                entry.removed = true;
            }
        } else {
            entries.clear();
        }
    }

    /// Move every live entry (in order) to the end of `other`.
    ///
    /// Moved entries keep their ids, filters, and one-shot flags. Draining an
    /// emitter into itself is a no-op.
    pub fn drain_into(&self, other: &Emitter<A>) {
        if std::ptr::eq(self, other) {
            return;
        }
        let moved: Vec<Entry<A>> = {
            let mut entries = self.entries.borrow_mut();
            let in_flight = self.depth.get() > 0;
            let mut moved = Vec::new();
            for entry in entries.iter_mut().filter(|e| e.is_live()) {
                moved.push(Entry {
                    id: entry.id,
                    callback: Rc::clone(&entry.callback),
                    filter: entry.filter.clone(),
                    once: entry.once,
                    applied: false,
                    removed: false,
                });
                entry.removed = true;
            }
            if !in_flight {
                entries.clear();
            }
            moved
        };
        other.entries.borrow_mut().extend(moved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Handler<()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = Rc::clone(&log);
        let make = move |tag: &'static str| -> Handler<()> {
            let log = Rc::clone(&log2);
            Rc::new(move |_: &()| {
                log.borrow_mut().push(tag);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn fires_in_registration_order() {
        let emitter = Emitter::<()>::new();
        let (log, make) = recorder();
        emitter.add_with(make("a"), None, false);
        emitter.add_with(make("b"), None, false);
        emitter.add_with(make("c"), None, false);

        emitter.invoke(&()).unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn filter_limits_invocation() {
        let emitter = Emitter::<i32>::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        emitter.add_with(
            Rc::new(move |_| {
                h.set(h.get() + 1);
                Ok(())
            }),
            Some(Rc::new(|v: &i32| *v > 10)),
            false,
        );

        emitter.invoke(&5).unwrap();
        emitter.invoke(&50).unwrap();
        assert_eq!(hits.get(), 1);
        assert!(emitter.is_empty_for(&5));
        assert!(!emitter.is_empty_for(&11));
        assert!(!emitter.is_empty());
    }

    #[test]
    fn once_entry_fires_once() {
        let emitter = Emitter::<()>::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        emitter.add_once(move |_| {
            h.set(h.get() + 1);
            Ok(())
        });

        emitter.invoke(&()).unwrap();
        emitter.invoke(&()).unwrap();
        assert_eq!(hits.get(), 1);
        assert!(emitter.is_empty());
    }

    #[test]
    fn once_entry_survives_reentrant_invoke() {
        let emitter = Rc::new(Emitter::<()>::new());
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let weak = Rc::downgrade(&emitter);
        emitter.add_once(move |_| {
            h.set(h.get() + 1);
            if let Some(e) = weak.upgrade() {
                e.invoke(&())?;
            }
            Ok(())
        });

        emitter.invoke(&()).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn handlers_added_during_invoke_fire_in_same_pass() {
        let emitter = Rc::new(Emitter::<()>::new());
        let (log, make) = recorder();
        let weak = Rc::downgrade(&emitter);
        let late = make("late");
        let first = make("first");
        emitter.add(move |args| {
            first(args)?;
            if let Some(e) = weak.upgrade() {
                e.add_with(Rc::clone(&late), None, true);
            }
            Ok(())
        });

        emitter.invoke(&()).unwrap();
        assert_eq!(*log.borrow(), vec!["first", "late"]);
    }

    #[test]
    fn removal_during_invoke_is_deferred() {
        let emitter = Rc::new(Emitter::<()>::new());
        let (log, make) = recorder();
        let second_id = Rc::new(Cell::new(None));
        let weak = Rc::downgrade(&emitter);
        let sid = Rc::clone(&second_id);
        emitter.add(move |_| {
            if let (Some(e), Some(id)) = (weak.upgrade(), sid.get()) {
                assert!(e.remove(id));
            }
            Ok(())
        });
        second_id.set(Some(emitter.add_with(make("second"), None, false)));
        emitter.add_with(make("third"), None, false);

        emitter.invoke(&()).unwrap();
        assert_eq!(*log.borrow(), vec!["third"]);
        assert_eq!(emitter.len(), 2);
    }

    #[test]
    fn remove_unknown_returns_false() {
        let emitter = Emitter::<()>::new();
        let id = emitter.add(|_| Ok(()));
        assert!(emitter.remove(id));
        assert!(!emitter.remove(id));
    }

    #[test]
    fn error_stops_invocation() {
        let emitter = Emitter::<()>::new();
        let (log, make) = recorder();
        emitter.add_with(make("a"), None, false);
        emitter.add(|_| Err(Error::usage("boom")));
        emitter.add_with(make("c"), None, false);

        let err = emitter.invoke(&()).unwrap_err();
        assert_eq!(err, Error::usage("boom"));
        assert_eq!(*log.borrow(), vec!["a"]);
    }

    #[test]
    fn drain_into_moves_live_entries_in_order() {
        let from = Emitter::<()>::new();
        let to = Emitter::<()>::new();
        let (log, make) = recorder();
        to.add_with(make("existing"), None, false);
        from.add_with(make("x"), None, true);
        from.add_with(make("y"), None, true);

        from.drain_into(&to);
        assert!(from.is_empty());
        assert_eq!(to.len(), 3);

        to.invoke(&()).unwrap();
        assert_eq!(*log.borrow(), vec!["existing", "x", "y"]);
    }

    #[test]
    fn clear_during_invoke_stops_remaining() {
        let emitter = Rc::new(Emitter::<()>::new());
        let (log, make) = recorder();
        let weak = Rc::downgrade(&emitter);
        emitter.add(move |_| {
            if let Some(e) = weak.upgrade() {
                e.clear();
            }
            Ok(())
        });
        emitter.add_with(make("never"), None, false);

        emitter.invoke(&()).unwrap();
        assert!(log.borrow().is_empty());
        assert!(emitter.is_empty());
    }
}
