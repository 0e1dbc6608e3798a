#![forbid(unsafe_code)]

//! Rules: computations bound to model events.
//!
//! # Role in ripple
//! `ripple-rules` is the top layer of the engine. A [`Rule`] names a root
//! type, the events that trigger it, the paths it depends on and the
//! properties it computes; registration resolves the paths and wires the
//! rule into the model's events.
//!
//! # Primary responsibilities
//! - **Rule**: configuration, asynchronous registration, triggers, and the
//!   per-target scheduling guards.
//! - **ConditionRule**: attach and clear conditions from an assertion.
//! - **CalculatedRule**: lazily computed properties, with minimal list
//!   updates via [`list_diff`].
//! - **validation**: `required`, `range`, `string_length`, and
//!   `allowed_values` condition rules.
//!
//! # How it fits in the system
//! Rules schedule their work through the model's [`ripple_core::Runtime`]:
//! a change inside `perform` defers the rule to the end of the outermost
//! active scope, so a burst of mutations produces one execution.

pub mod calculated;
pub mod condition;
pub mod invocation;
pub mod list_diff;
pub mod rule;
pub mod validation;

pub use calculated::{CalculatedRule, Calculation};
pub use condition::{Assertion, ConditionRule, MessageFn};
pub use invocation::InvocationTypes;
pub use list_diff::{ListSplice, apply_splice, list_diff};
pub use rule::{Rule, RuleFn, RuleKind, RuleState};
