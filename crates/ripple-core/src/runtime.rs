#![forbid(unsafe_code)]

//! Explicit context holder for the engine's mutable slots.
//!
//! A [`Runtime`] owns the "current scope" and "current batch" slots, the
//! deferred [`Scheduler`], and the [`EngineConfig`]. It is not global:
//! clones share state, and independent runtimes never observe each other.

use std::fmt;
use std::rc::Rc;

use crate::barrier::Barrier;
use crate::batch::Batches;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::scope::ScopeStack;

struct RuntimeInner {
    config: EngineConfig,
    scopes: ScopeStack,
    batches: Batches,
    scheduler: Scheduler,
}

/// Shared handle to one engine instance.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("scopes", &self.inner.scopes)
            .field("batches", &self.inner.batches)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Runtime {
    /// Create a runtime from `config`.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let scheduler = Scheduler::new(config.max_deferred_per_flush);
        Self {
            inner: Rc::new(RuntimeInner {
                scopes: ScopeStack::new(config.runaway_limit),
                batches: Batches::new(),
                scheduler,
                config,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn scopes(&self) -> &ScopeStack {
        &self.inner.scopes
    }

    #[must_use]
    pub fn batches(&self) -> &Batches {
        &self.inner.batches
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// A new barrier wired to this runtime's scheduler and defer mode.
    #[must_use]
    pub fn barrier(&self, label: impl Into<String>) -> Barrier {
        Barrier::new(
            label,
            self.inner.scheduler.clone(),
            self.inner.config.defer_callbacks,
        )
    }

    /// See [`ScopeStack::perform`].
    ///
    /// # Errors
    ///
    /// `f`'s error, or the first error raised by deferred exit work.
    pub fn perform<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.inner.scopes.perform(f)
    }

    /// See [`ScopeStack::on_exit`].
    ///
    /// # Errors
    ///
    /// `f`'s error when it runs immediately.
    pub fn on_exit(&self, f: impl FnOnce() -> Result<()> + 'static) -> Result<()> {
        self.inner.scopes.on_exit(f)
    }

    /// See [`ScopeStack::on_abort`].
    pub fn on_abort(&self, f: impl FnOnce() -> Result<()> + 'static) {
        self.inner.scopes.on_abort(f);
    }

    /// `true` if both handles refer to the same runtime.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn runtimes_are_independent() {
        let a = Runtime::default();
        let b = Runtime::default();
        let scope = a.scopes().begin();
        assert_eq!(a.scopes().current(), Some(scope));
        assert_eq!(b.scopes().current(), None);
        a.scopes().exit(scope).unwrap();
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&a.clone()));
    }

    #[test]
    fn perform_defers_on_exit_work() {
        let rt = Runtime::default();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let rt2 = rt.clone();
        rt.perform(|| {
            rt2.on_exit(move || {
                h.set(h.get() + 1);
                Ok(())
            })?;
            assert_eq!(hits.get(), 0);
            Ok(())
        })
        .unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn config_flows_into_components() {
        let rt = Runtime::new(
            EngineConfig::default()
                .with_runaway_limit(3)
                .with_defer_callbacks(true),
        );
        assert_eq!(rt.scopes().runaway_limit(), 3);

        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        rt.barrier("deferred").wait_for_all(move || h.set(h.get() + 1), true);
        assert_eq!(hits.get(), 0);
        rt.scheduler().run_until_idle();
        assert_eq!(hits.get(), 1);
    }
}
