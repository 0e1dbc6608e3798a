#![forbid(unsafe_code)]

//! Nestable, labeled logical batches with deferred "when done" subscribers.
//!
//! A batch is active while its label stack is non-empty. Starting a batch
//! while another is current pushes a label onto the current one; only when
//! the last label is popped does the batch end and its subscribers run.
//!
//! # Invariants
//!
//! 1. At most one batch is current at a time.
//! 2. Subscribers run in FIFO order, exactly once, when the batch ends.
//! 3. A batch that was transferred into another delegates every later
//!    `end`/`resume` to its target.
//!
//! # Crossing asynchronous boundaries
//!
//! ```ignore
//! let batch = batches.suspend_current();   // detaches + holds a label
//! loader.fetch(move || {
//!     if let Some(b) = &batch { batches.resume(b)?; }
//!     // ... apply results inside the original batch ...
//!     if let Some(b) = &batch { batches.end(b)?; } // pops the hold
//! });
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::error::{Error, Result};

/// Label pushed by [`Batches::suspend_current`] to keep a detached batch open.
pub const SUSPENDED_LABEL: &str = "<suspended>";

/// Stable batch identifier, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch#{}", self.0)
    }
}

struct BatchInner {
    id: BatchId,
    labels: Vec<String>,
    subscribers: VecDeque<Box<dyn FnOnce()>>,
    transferred_to: Option<Batch>,
}

/// Shared handle to a batch.
#[derive(Clone)]
pub struct Batch {
    inner: Rc<RefCell<BatchInner>>,
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Batch")
            .field("id", &inner.id)
            .field("labels", &inner.labels)
            .field("subscribers", &inner.subscribers.len())
            .field("transferred", &inner.transferred_to.is_some())
            .finish()
    }
}

impl PartialEq for Batch {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Batch {}

impl Batch {
    fn new(id: BatchId, label: String) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BatchInner {
                id,
                labels: vec![label],
                subscribers: VecDeque::new(),
                transferred_to: None,
            })),
        }
    }

    /// Follow transfer links to the batch that now owns this one's work.
    #[must_use]
    pub fn resolve(&self) -> Batch {
        let mut batch = self.clone();
        loop {
            let next = batch.inner.borrow().transferred_to.clone();
            match next {
                Some(next) => batch = next,
                None => return batch,
            }
        }
    }

    /// Identifier of this handle (not of its transfer target).
    #[must_use]
    pub fn id(&self) -> BatchId {
        self.inner.borrow().id
    }

    /// `true` while the resolved batch still has labels.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.resolve().inner.borrow().labels.is_empty()
    }

    /// Labels of the resolved batch, outermost first.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.resolve().inner.borrow().labels.clone()
    }

    /// `true` if this handle delegates to another batch.
    #[must_use]
    pub fn is_transferred(&self) -> bool {
        self.inner.borrow().transferred_to.is_some()
    }

    /// Move all labels and subscribers into `other`, and delegate every
    /// later operation on this handle to it.
    pub fn transfer_to(&self, other: &Batch) {
        let source = self.resolve();
        let target = other.resolve();
        if source == target {
            return;
        }
        let (labels, subscribers) = {
            let mut inner = source.inner.borrow_mut();
            inner.transferred_to = Some(target.clone());
            (
                std::mem::take(&mut inner.labels),
                std::mem::take(&mut inner.subscribers),
            )
        };
        let mut target_inner = target.inner.borrow_mut();
        target_inner.labels.extend(labels);
        target_inner.subscribers.extend(subscribers);
        debug!(from = %source.id(), to = %target_inner.id, "batch transferred");
    }
}

/// Owner of the "current batch" slot.
pub struct Batches {
    current: RefCell<Option<Batch>>,
    next_id: Cell<u64>,
}

impl Default for Batches {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Batches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batches")
            .field("current", &self.current.borrow())
            .finish()
    }
}

impl Batches {
    /// Create an empty batch slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: RefCell::new(None),
            next_id: Cell::new(1),
        }
    }

    /// The current batch, if one is active.
    #[must_use]
    pub fn current(&self) -> Option<Batch> {
        self.current
            .borrow()
            .as_ref()
            .map(Batch::resolve)
            .filter(Batch::is_active)
    }

    /// `true` if a batch is current.
    #[must_use]
    pub fn is_batching(&self) -> bool {
        self.current().is_some()
    }

    /// Extend the current batch with `label`, or start a new current batch.
    pub fn start(&self, label: impl Into<String>) -> Batch {
        let label = label.into();
        if let Some(current) = self.current() {
            current.inner.borrow_mut().labels.push(label);
            return current;
        }
        let id = BatchId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        debug!(batch = %id, %label, "batch started");
        let batch = Batch::new(id, label);
        *self.current.borrow_mut() = Some(batch.clone());
        batch
    }

    /// Pop one label. When the last label is popped the batch ends: it stops
    /// being current and its subscribers run in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchEnded`] if the batch has no labels left.
    pub fn end(&self, batch: &Batch) -> Result<()> {
        let batch = batch.resolve();
        let ended = {
            let mut inner = batch.inner.borrow_mut();
            if inner.labels.pop().is_none() {
                return Err(Error::BatchEnded(inner.id));
            }
            inner.labels.is_empty()
        };
        if !ended {
            return Ok(());
        }

        {
            let mut current = self.current.borrow_mut();
            if current.as_ref().map(Batch::resolve).as_ref() == Some(&batch) {
                *current = None;
            }
        }
        debug!(batch = %batch.id(), "batch ended");

        loop {
            let next = batch.inner.borrow_mut().subscribers.pop_front();
            match next {
                Some(subscriber) => subscriber(),
                None => return Ok(()),
            }
        }
    }

    /// Make `batch` current again. Any other active current batch is
    /// transferred into it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchEnded`] if `batch` has already ended.
    pub fn resume(&self, batch: &Batch) -> Result<()> {
        let batch = batch.resolve();
        if !batch.is_active() {
            return Err(Error::BatchEnded(batch.id()));
        }
        let previous = self.current.borrow_mut().take();
        if let Some(previous) = previous {
            let previous = previous.resolve();
            if previous != batch && previous.is_active() {
                previous.transfer_to(&batch);
            }
        }
        *self.current.borrow_mut() = Some(batch);
        Ok(())
    }

    /// Detach the current batch so unrelated work can run outside it.
    ///
    /// The detached batch gets a [`SUSPENDED_LABEL`] so it cannot end until
    /// whoever resumes it calls [`end`](Self::end) once more.
    pub fn suspend_current(&self) -> Option<Batch> {
        let batch = self.current()?;
        *self.current.borrow_mut() = None;
        batch
            .inner
            .borrow_mut()
            .labels
            .push(SUSPENDED_LABEL.to_string());
        Some(batch)
    }

    /// Run `f` when the current batch ends, or now if there is none.
    pub fn when_done(&self, f: impl FnOnce() + 'static) {
        match self.current() {
            Some(batch) => batch.inner.borrow_mut().subscribers.push_back(Box::new(f)),
            None => f(),
        }
    }
}
