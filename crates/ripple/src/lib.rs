#![forbid(unsafe_code)]

//! Ripple: reactive dependency tracking and rule execution.
//!
//! Rules declare which property paths they depend on and which properties
//! they compute. When a dependency changes, the rule runs once at the end
//! of the enclosing operation instead of once per mutation.
//!
//! ```
//! use ripple::prelude::*;
//!
//! # fn main() -> ripple::Result<()> {
//! let model = Model::default();
//! let order = model.define_type("Order", None)?;
//! order.add_property(PropertyDef::scalar("qty").with_default(1))?;
//! order.add_property(PropertyDef::scalar("price").with_default(10))?;
//! order.add_property(PropertyDef::scalar("total"))?;
//!
//! let total = CalculatedRule::new(|o| {
//!     let qty = o.get("qty")?.as_int().unwrap_or_default();
//!     let price = o.get("price")?.as_int().unwrap_or_default();
//!     Ok(Value::Int(qty * price))
//! });
//! Rule::calculated(&model, &order, "total", total)
//!     .on_change_of(["qty", "price"])
//!     .register()?;
//!
//! let o = model.create("Order")?;
//! model.runtime().perform(|| {
//!     o.set("qty", 3)?;
//!     o.set("price", 7)
//! })?;
//! assert_eq!(o.get("total")?, Value::Int(21));
//! # Ok(())
//! # }
//! ```
//!
//! # Crates
//! - [`ripple_core`]: emitters, barriers, batches, change scopes, runtime.
//! - [`ripple_model`]: entity types, properties, entities, property chains.
//! - [`ripple_rules`]: rules, conditions, calculated properties, validation.

pub use ripple_core;
pub use ripple_model;
pub use ripple_rules;

pub use ripple_core::{Barrier, Batch, EngineConfig, Error, Result, Runtime, ScopeId};
pub use ripple_model::{
    Condition, ConditionCategory, ConditionType, Entity, EntityType, Loader, Model, Property,
    PropertyChain, PropertyDef, Value,
};
pub use ripple_rules::{CalculatedRule, ConditionRule, InvocationTypes, Rule, RuleKind, RuleState};

/// Common imports for defining models and rules.
pub mod prelude {
    pub use ripple_core::{EngineConfig, Error, Result, Runtime};
    pub use ripple_model::{
        ConditionType, Entity, EntityType, Model, PropertyChain, PropertyDef, Value,
    };
    pub use ripple_rules::{CalculatedRule, ConditionRule, Rule, validation};
}
