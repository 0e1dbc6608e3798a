#![forbid(unsafe_code)]

//! Entity instances.
//!
//! An entity stores one value slot per instance property, the conditions
//! currently attached to it, and the per-target bookkeeping rules use to
//! avoid scheduling themselves twice within one logical operation.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use ripple_core::{Emitter, Error, HandlerId, Result};
use tracing::trace;

use crate::condition::{Condition, ConditionChange};
use crate::entity_type::EntityType;
use crate::value::Value;

static NEXT_ENTITY_KEY: AtomicU64 = AtomicU64::new(1);

/// Identifies a registered rule in per-entity bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u64);

pub(crate) struct EntityInner {
    key: u64,
    id: Option<String>,
    entity_type: EntityType,
    is_new: bool,
    values: RefCell<HashMap<String, Value>>,
    conditions: RefCell<Vec<Condition>>,
    conditions_changed: Emitter<ConditionChange>,
    pending_invocation: RefCell<HashSet<RuleId>>,
    executing: RefCell<HashSet<RuleId>>,
    pending_init: RefCell<HashSet<String>>,
}

/// Shared handle to an entity.
#[derive(Clone)]
pub struct Entity {
    inner: Rc<EntityInner>,
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.key.hash(state);
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.id {
            Some(id) => write!(f, "{}|{id}", self.inner.entity_type.name()),
            None => write!(f, "{}#{}", self.inner.entity_type.name(), self.inner.key),
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({self})")
    }
}

impl Entity {
    fn alloc(entity_type: &EntityType, id: Option<String>, is_new: bool) -> Self {
        Self {
            inner: Rc::new(EntityInner {
                key: NEXT_ENTITY_KEY.fetch_add(1, Ordering::Relaxed),
                id,
                entity_type: entity_type.clone(),
                is_new,
                values: RefCell::new(HashMap::new()),
                conditions: RefCell::new(Vec::new()),
                conditions_changed: Emitter::new(),
                pending_invocation: RefCell::new(HashSet::new()),
                executing: RefCell::new(HashSet::new()),
                pending_init: RefCell::new(HashSet::new()),
            }),
        }
    }

    /// Create a new instance: every instance property gets its default,
    /// then InitNew is raised on the type and each base, base-most first.
    ///
    /// # Errors
    ///
    /// The first error raised by an InitNew handler.
    pub fn create(entity_type: &EntityType) -> Result<Self> {
        let entity = Self::alloc(entity_type, None, true);
        {
            let mut values = entity.inner.values.borrow_mut();
            for property in entity_type.properties() {
                if !property.is_static() {
                    values.insert(property.name().to_string(), property.default_value().clone());
                }
            }
        }
        entity_type.register_instance(&entity);
        trace!(entity = %entity, "entity created");

        let lineage: Vec<EntityType> = entity_type.lineage().cloned().collect();
        for t in lineage.iter().rev() {
            t.init_new().invoke(&entity)?;
        }
        Ok(entity)
    }

    /// Materialize an existing instance from stored data. Only the supplied
    /// values are initialized; InitExisting is raised afterwards.
    ///
    /// # Errors
    ///
    /// [`Error::UnresolvedPath`] for unknown properties, [`Error::Usage`]
    /// for values that do not fit, or the first InitExisting handler error.
    pub fn existing<'a>(
        entity_type: &EntityType,
        id: impl Into<String>,
        values: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Self> {
        let entity = Self::alloc(entity_type, Some(id.into()), false);
        for (name, value) in values {
            let property = entity_type.property(name).ok_or_else(|| Error::UnresolvedPath {
                root: entity_type.name().to_string(),
                path: name.to_string(),
            })?;
            property.init_value(&entity, value)?;
        }
        entity_type.register_instance(&entity);
        trace!(entity = %entity, "entity loaded");

        let lineage: Vec<EntityType> = entity_type.lineage().cloned().collect();
        for t in lineage.iter().rev() {
            t.init_existing().invoke(&entity)?;
        }
        Ok(entity)
    }

    pub(crate) fn downgrade(&self) -> Weak<EntityInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<EntityInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Process-unique key.
    #[must_use]
    pub fn key(&self) -> u64 {
        self.inner.key
    }

    /// External id, for existing instances.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.inner.id.as_deref()
    }

    #[must_use]
    pub fn entity_type(&self) -> &EntityType {
        &self.inner.entity_type
    }

    /// `true` for instances made with [`Entity::create`].
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.inner.is_new
    }

    fn property(&self, name: &str) -> Result<crate::property::Property> {
        self.inner
            .entity_type
            .property(name)
            .ok_or_else(|| Error::UnresolvedPath {
                root: self.inner.entity_type.name().to_string(),
                path: name.to_string(),
            })
    }

    /// Read a property by name, raising its get event.
    ///
    /// # Errors
    ///
    /// [`Error::UnresolvedPath`] for unknown names, or a get handler error.
    pub fn get(&self, name: &str) -> Result<Value> {
        self.property(name)?.value(self)
    }

    /// Write a property by name, raising its changed event.
    ///
    /// # Errors
    ///
    /// [`Error::UnresolvedPath`] for unknown names, [`Error::Usage`] for
    /// values that do not fit, or a changed handler error.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.property(name)?.set_value(self, value)
    }

    /// Read a property by name without raising events.
    #[must_use]
    pub fn peek(&self, name: &str) -> Value {
        self.inner
            .entity_type
            .property(name)
            .map(|p| p.peek(self))
            .unwrap_or_default()
    }

    pub(crate) fn stored(&self, name: &str) -> Option<Value> {
        self.inner.values.borrow().get(name).cloned()
    }

    pub(crate) fn store(&self, name: &str, value: Value) {
        self.inner.values.borrow_mut().insert(name.to_string(), value);
    }

    // ── Rule bookkeeping ──────────────────────────────────────────────────

    /// Mark `rule` as scheduled for this entity. Returns `false` if it
    /// already was.
    pub fn mark_pending_invocation(&self, rule: RuleId) -> bool {
        self.inner.pending_invocation.borrow_mut().insert(rule)
    }

    pub fn clear_pending_invocation(&self, rule: RuleId) {
        self.inner.pending_invocation.borrow_mut().remove(&rule);
    }

    #[must_use]
    pub fn has_pending_invocation(&self, rule: RuleId) -> bool {
        self.inner.pending_invocation.borrow().contains(&rule)
    }

    /// Mark `rule` as running against this entity. Returns `false` if it
    /// already was.
    pub fn begin_execution(&self, rule: RuleId) -> bool {
        self.inner.executing.borrow_mut().insert(rule)
    }

    pub fn end_execution(&self, rule: RuleId) {
        self.inner.executing.borrow_mut().remove(&rule);
    }

    #[must_use]
    pub fn is_executing(&self, rule: RuleId) -> bool {
        self.inner.executing.borrow().contains(&rule)
    }

    /// Mark or clear "not yet computed" for a rule-owned property.
    pub fn set_pending_init(&self, property: &str, pending: bool) {
        let mut set = self.inner.pending_init.borrow_mut();
        if pending {
            set.insert(property.to_string());
        } else {
            set.remove(property);
        }
    }

    #[must_use]
    pub fn is_pending_init(&self, property: &str) -> bool {
        self.inner.pending_init.borrow().contains(property)
    }

    // ── Conditions ────────────────────────────────────────────────────────

    #[must_use]
    pub fn conditions(&self) -> Vec<Condition> {
        self.inner.conditions.borrow().clone()
    }

    /// The condition of the given type code, if present.
    #[must_use]
    pub fn condition(&self, code: &str) -> Option<Condition> {
        self.inner
            .conditions
            .borrow()
            .iter()
            .find(|c| c.code() == code)
            .cloned()
    }

    /// Conditions that concern `property`.
    #[must_use]
    pub fn conditions_for(&self, property: &str) -> Vec<Condition> {
        self.inner
            .conditions
            .borrow()
            .iter()
            .filter(|c| c.concerns(property))
            .cloned()
            .collect()
    }

    /// Attach `condition`, replacing none: a condition with the same code
    /// must be detached first.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] if a condition with the same code is present, or a
    /// conditions-changed handler error.
    pub fn attach_condition(&self, condition: Condition) -> Result<()> {
        {
            let mut conditions = self.inner.conditions.borrow_mut();
            if conditions.iter().any(|c| c.code() == condition.code()) {
                return Err(Error::usage(format!(
                    "condition '{}' is already attached to {self}",
                    condition.code()
                )));
            }
            conditions.push(condition.clone());
        }
        self.inner.conditions_changed.invoke(&ConditionChange {
            entity: self.clone(),
            condition,
            added: true,
        })
    }

    /// Detach the condition with `code`, returning it.
    ///
    /// # Errors
    ///
    /// A conditions-changed handler error.
    pub fn detach_condition(&self, code: &str) -> Result<Option<Condition>> {
        let removed = {
            let mut conditions = self.inner.conditions.borrow_mut();
            conditions
                .iter()
                .position(|c| c.code() == code)
                .map(|pos| conditions.remove(pos))
        };
        let Some(condition) = removed else {
            return Ok(None);
        };
        self.inner.conditions_changed.invoke(&ConditionChange {
            entity: self.clone(),
            condition: condition.clone(),
            added: false,
        })?;
        Ok(Some(condition))
    }

    pub fn add_conditions_changed(
        &self,
        handler: impl Fn(&ConditionChange) -> Result<()> + 'static,
    ) -> HandlerId {
        self.inner.conditions_changed.add(handler)
    }

    pub fn remove_conditions_changed(&self, id: HandlerId) -> bool {
        self.inner.conditions_changed.remove(id)
    }
}
