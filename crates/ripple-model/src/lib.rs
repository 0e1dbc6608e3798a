#![forbid(unsafe_code)]

//! Model: entities, properties, property chains, and path resolution.
//!
//! # Role in ripple
//! `ripple-model` is the object graph the engine reacts to. It raises the
//! lifecycle and change events that rules subscribe to, and resolves the
//! textual dependency paths rules declare into typed [`PropertyChain`]s.
//!
//! # Primary responsibilities
//! - **EntityType / Property**: declarations, inheritance, and events.
//! - **Entity**: value storage, conditions, and per-rule bookkeeping.
//! - **PropertyChain**: multi-hop traversal, fan-out, and change routing.
//! - **Model**: type registry, chain cache, loader boundary, ready gate.

pub mod chain;
pub mod condition;
pub mod entity;
pub mod entity_type;
pub mod loader;
pub mod model;
pub mod property;
pub mod value;

pub use chain::{ChainChange, ChainStep, ChainSubscription, PathSegment, PropertyChain, parse_path};
pub use condition::{Condition, ConditionCategory, ConditionChange, ConditionType};
pub use entity::{Entity, RuleId};
pub use entity_type::EntityType;
pub use loader::Loader;
pub use model::{Model, WeakModel};
pub use property::{ListChange, Property, PropertyAccess, PropertyChange, PropertyDef, PropertyKind};
pub use value::Value;
