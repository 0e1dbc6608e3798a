#![forbid(unsafe_code)]

//! Core: notification primitives, change scopes, batches, and the runtime.
//!
//! # Role in ripple
//! `ripple-core` is the bottom layer. It knows nothing about entities or
//! properties; it provides the machinery that lets higher layers defer work
//! until a logical operation has settled.
//!
//! # Primary responsibilities
//! - **Emitter**: ordered, filtered, one-shot-capable subscriber lists.
//! - **Barrier**: join counter with waiters that fire at each zero crossing.
//! - **Batch**: nestable labeled batches with "when done" subscribers.
//! - **ScopeStack**: nested change scopes whose exit work transfers to the
//!   outermost active ancestor, with runaway detection.
//! - **Scheduler**: explicit deferred task queue drained by the host.
//! - **Runtime**: the context value owning all of the above.
//!
//! # How it fits in the system
//! `ripple-model` builds entities, properties, and property chains on these
//! primitives; `ripple-rules` binds computations to their events.

pub mod barrier;
pub mod batch;
pub mod config;
pub mod emitter;
pub mod error;
pub mod runtime;
pub mod scheduler;
pub mod scope;

pub use barrier::{Barrier, PendingToken};
pub use batch::{Batch, BatchId, Batches, SUSPENDED_LABEL};
pub use config::{DEFAULT_RUNAWAY_LIMIT, EngineConfig};
pub use emitter::{Emitter, Filter, Handler, HandlerId};
pub use error::{Error, Result};
pub use runtime::Runtime;
pub use scheduler::{Scheduler, Task};
pub use scope::{ScopeId, ScopeStack, ScopeState};
