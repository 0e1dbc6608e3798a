#![forbid(unsafe_code)]

//! Properties: typed slots on entities with change and access events.
//!
//! # Events
//!
//! - **changed**: raised by [`Property::set_value`] and
//!   [`Property::splice`] when the stored value actually changes. List
//!   properties describe the change as [`ListChange`] records.
//! - **get**: raised by [`Property::value`] before the stored value is
//!   read. Lazily computed properties hook this event to compute on first
//!   access.
//!
//! [`Property::peek`] and [`Property::init_value`] bypass both events.
//!
//! # Static properties
//!
//! A static property stores one value for the whole type. It is addressed
//! through any instance, and its events carry that instance.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use ripple_core::{Emitter, Error, HandlerId, Result};

use crate::entity::Entity;
use crate::entity_type::{EntityType, TypeInner};
use crate::value::Value;

/// What a property holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    /// Plain data (bool, number, text).
    Scalar,
    /// Entities of the named type (or its subtypes).
    Reference(String),
}

/// Declaration used by [`EntityType::add_property`].
#[derive(Debug, Clone)]
pub struct PropertyDef {
    name: String,
    kind: PropertyKind,
    is_list: bool,
    is_static: bool,
    default: Value,
}

impl PropertyDef {
    #[must_use]
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Scalar,
            is_list: false,
            is_static: false,
            default: Value::Null,
        }
    }

    #[must_use]
    pub fn reference(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            kind: PropertyKind::Reference(type_name.into()),
            ..Self::scalar(name)
        }
    }

    /// Make the property list-valued. Its default becomes the empty list.
    #[must_use]
    pub fn list(mut self) -> Self {
        self.is_list = true;
        if self.default.is_null() {
            self.default = Value::List(Vec::new());
        }
        self
    }

    /// Make the property type-level.
    #[must_use]
    pub fn type_level(mut self) -> Self {
        self.is_static = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One structural change to a list property.
#[derive(Debug, Clone, PartialEq)]
pub enum ListChange {
    Removed { index: usize, items: Vec<Value> },
    Added { index: usize, items: Vec<Value> },
}

/// Argument of a property's changed event.
#[derive(Debug, Clone)]
pub struct PropertyChange {
    pub entity: Entity,
    pub property: Property,
    pub old: Value,
    pub new: Value,
    /// Structural changes, for list properties.
    pub list_changes: Vec<ListChange>,
}

/// Argument of a property's get event.
#[derive(Debug, Clone)]
pub struct PropertyAccess {
    pub entity: Entity,
    pub property: Property,
}

struct PropertyInner {
    name: String,
    owner: Weak<TypeInner>,
    owner_name: String,
    kind: PropertyKind,
    is_list: bool,
    is_static: bool,
    default: Value,
    static_value: RefCell<Option<Value>>,
    changed: Emitter<PropertyChange>,
    get: Emitter<PropertyAccess>,
}

/// Shared handle to a property declaration.
#[derive(Clone)]
pub struct Property {
    inner: Rc<PropertyInner>,
}

impl PartialEq for Property {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Property {}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Property({}.{})", self.inner.owner_name, self.inner.name)
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.inner.owner_name, self.inner.name)
    }
}

impl Property {
    pub(crate) fn from_def(def: PropertyDef, owner: &EntityType) -> Self {
        Self {
            inner: Rc::new(PropertyInner {
                name: def.name,
                owner: owner.downgrade(),
                owner_name: owner.name().to_string(),
                kind: def.kind,
                is_list: def.is_list,
                is_static: def.is_static,
                default: def.default,
                static_value: RefCell::new(None),
                changed: Emitter::new(),
                get: Emitter::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Declaring type, while it is alive.
    #[must_use]
    pub fn owner(&self) -> Option<EntityType> {
        EntityType::upgrade(&self.inner.owner)
    }

    #[must_use]
    pub fn owner_name(&self) -> &str {
        &self.inner.owner_name
    }

    #[must_use]
    pub fn kind(&self) -> &PropertyKind {
        &self.inner.kind
    }

    /// Name of the referenced type, for reference properties.
    #[must_use]
    pub fn reference_type(&self) -> Option<&str> {
        match &self.inner.kind {
            PropertyKind::Reference(name) => Some(name),
            PropertyKind::Scalar => None,
        }
    }

    #[must_use]
    pub fn is_list(&self) -> bool {
        self.inner.is_list
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        self.inner.is_static
    }

    #[must_use]
    pub fn default_value(&self) -> &Value {
        &self.inner.default
    }

    /// Raise the get event for `target`, then return the stored value.
    ///
    /// # Errors
    ///
    /// The first error raised by a get handler.
    pub fn value(&self, target: &Entity) -> Result<Value> {
        if !self.inner.get.is_empty() {
            self.inner.get.invoke(&PropertyAccess {
                entity: target.clone(),
                property: self.clone(),
            })?;
        }
        Ok(self.peek(target))
    }

    /// Stored value without raising events; `Null` when never initialized.
    #[must_use]
    pub fn peek(&self, target: &Entity) -> Value {
        self.stored(target).unwrap_or_default()
    }

    fn stored(&self, target: &Entity) -> Option<Value> {
        if self.inner.is_static {
            self.inner.static_value.borrow().clone()
        } else {
            target.stored(self.name())
        }
    }

    fn store(&self, target: &Entity, value: Value) {
        if self.inner.is_static {
            *self.inner.static_value.borrow_mut() = Some(value);
        } else {
            target.store(self.name(), value);
        }
    }

    /// `true` once a value has been stored for `target`.
    #[must_use]
    pub fn is_inited(&self, target: &Entity) -> bool {
        if self.inner.is_static {
            self.inner.static_value.borrow().is_some()
        } else {
            target.stored(self.name()).is_some()
        }
    }

    /// Store `value` without raising events.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] if `value` does not fit the property.
    pub fn init_value(&self, target: &Entity, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.check(&value)?;
        self.store(target, value);
        Ok(())
    }

    /// Store `value` and raise the changed event if it differs from the
    /// current value. Storing into an uninitialized slot initializes it.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] if `value` does not fit the property; otherwise the
    /// first error raised by a changed handler.
    pub fn set_value(&self, target: &Entity, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.check(&value)?;
        let previous = self.stored(target);
        if previous.as_ref() == Some(&value) {
            return Ok(());
        }
        self.store(target, value.clone());
        let old = previous.unwrap_or_default();
        if old == value {
            return Ok(());
        }
        let list_changes = if self.inner.is_list {
            replacement_changes(&old, &value)
        } else {
            Vec::new()
        };
        self.raise_changed(PropertyChange {
            entity: target.clone(),
            property: self.clone(),
            old,
            new: value,
            list_changes,
        })
    }

    /// Replace `remove` items starting at `index` with `insert`, raising one
    /// changed event that carries at most one removal and one insertion.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] for non-list properties, out-of-range splices, or
    /// items that do not fit; otherwise the first changed handler error.
    pub fn splice(&self, target: &Entity, index: usize, remove: usize, insert: Vec<Value>) -> Result<()> {
        if !self.inner.is_list {
            return Err(Error::usage(format!("'{self}' is not a list property")));
        }
        let old = self.peek(target);
        let current = old.as_list().map(<[Value]>::to_vec).unwrap_or_default();
        let end = index.checked_add(remove).filter(|end| *end <= current.len());
        let Some(end) = end else {
            return Err(Error::usage(format!(
                "splice {index}..{} out of range for '{self}' (len {})",
                index.saturating_add(remove),
                current.len()
            )));
        };
        if remove == 0 && insert.is_empty() {
            return Ok(());
        }

        let mut items = current;
        let removed: Vec<Value> = items.splice(index..end, insert.iter().cloned()).collect();
        let new = Value::List(items);
        self.check(&new)?;

        let mut list_changes = Vec::with_capacity(2);
        if !removed.is_empty() {
            list_changes.push(ListChange::Removed { index, items: removed });
        }
        if !insert.is_empty() {
            list_changes.push(ListChange::Added { index, items: insert });
        }
        self.store(target, new.clone());
        self.raise_changed(PropertyChange {
            entity: target.clone(),
            property: self.clone(),
            old,
            new,
            list_changes,
        })
    }

    fn raise_changed(&self, change: PropertyChange) -> Result<()> {
        self.inner.changed.invoke(&change)
    }

    fn check(&self, value: &Value) -> Result<()> {
        let fits = |v: &Value| match (&self.inner.kind, v) {
            (_, Value::Null) => true,
            (PropertyKind::Scalar, Value::Entity(_) | Value::List(_)) => false,
            (PropertyKind::Scalar, _) => true,
            (PropertyKind::Reference(name), Value::Entity(e)) => e.entity_type().is_subtype_of_name(name),
            (PropertyKind::Reference(_), _) => false,
        };
        let ok = match (self.inner.is_list, value) {
            (true, Value::List(items)) => items.iter().all(|v| !v.is_null() && fits(v)),
            (true, _) => false,
            (false, v) => fits(v),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::usage(format!(
                "cannot store a {} value in '{self}'",
                value.kind_name()
            )))
        }
    }

    /// Subscribe to changes, optionally only for `obj`.
    pub fn add_changed(
        &self,
        handler: impl Fn(&PropertyChange) -> Result<()> + 'static,
        obj: Option<&Entity>,
        once: bool,
    ) -> HandlerId {
        let filter = obj.cloned().map(|obj| {
            Rc::new(move |change: &PropertyChange| change.entity == obj)
                as Rc<dyn Fn(&PropertyChange) -> bool>
        });
        self.inner.changed.add_with(Rc::new(handler), filter, once)
    }

    /// Raw changed emitter, for subscribers that need a custom filter.
    #[must_use]
    pub fn changed(&self) -> &Emitter<PropertyChange> {
        &self.inner.changed
    }

    pub fn remove_changed(&self, id: HandlerId) -> bool {
        self.inner.changed.remove(id)
    }

    /// Subscribe to reads, optionally only for `obj`.
    pub fn add_get(
        &self,
        handler: impl Fn(&PropertyAccess) -> Result<()> + 'static,
        obj: Option<&Entity>,
        once: bool,
    ) -> HandlerId {
        let filter = obj.cloned().map(|obj| {
            Rc::new(move |access: &PropertyAccess| access.entity == obj)
                as Rc<dyn Fn(&PropertyAccess) -> bool>
        });
        self.inner.get.add_with(Rc::new(handler), filter, once)
    }

    pub fn remove_get(&self, id: HandlerId) -> bool {
        self.inner.get.remove(id)
    }

    /// `true` if some changed subscriber would be notified of a change on
    /// `target`.
    #[must_use]
    pub fn is_watched(&self, target: &Entity) -> bool {
        let probe = PropertyChange {
            entity: target.clone(),
            property: self.clone(),
            old: Value::Null,
            new: Value::Null,
            list_changes: Vec::new(),
        };
        !self.inner.changed.is_empty_for(&probe)
    }
}

/// Change records for wholesale replacement of a list.
fn replacement_changes(old: &Value, new: &Value) -> Vec<ListChange> {
    let mut changes = Vec::with_capacity(2);
    if let Some(items) = old.as_list().filter(|items| !items.is_empty()) {
        changes.push(ListChange::Removed {
            index: 0,
            items: items.to_vec(),
        });
    }
    if let Some(items) = new.as_list().filter(|items| !items.is_empty()) {
        changes.push(ListChange::Added {
            index: 0,
            items: items.to_vec(),
        });
    }
    changes
}
