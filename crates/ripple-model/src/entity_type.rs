#![forbid(unsafe_code)]

//! Entity types: property tables, inheritance, and lifecycle events.
//!
//! Every type keeps a pool of weak references to its live instances
//! (including instances of subtypes), which chain subscriptions without a
//! root filter use to find the roots affected by a change deep in a path.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use ripple_core::{Emitter, Error, HandlerId, Result};

use crate::entity::{Entity, EntityInner};
use crate::property::{Property, PropertyDef};

pub(crate) struct TypeInner {
    name: String,
    base: Option<EntityType>,
    properties: RefCell<Vec<Property>>,
    init_new: Emitter<Entity>,
    init_existing: Emitter<Entity>,
    known: RefCell<Vec<Weak<EntityInner>>>,
}

/// Shared handle to an entity type.
#[derive(Clone)]
pub struct EntityType {
    inner: Rc<TypeInner>,
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EntityType {}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.inner.name)
            .field("base", &self.inner.base.as_ref().map(EntityType::name))
            .field("properties", &self.inner.properties.borrow().len())
            .finish()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

impl EntityType {
    /// Create a type, optionally deriving from `base`.
    #[must_use]
    pub fn new(name: impl Into<String>, base: Option<&EntityType>) -> Self {
        Self {
            inner: Rc::new(TypeInner {
                name: name.into(),
                base: base.cloned(),
                properties: RefCell::new(Vec::new()),
                init_new: Emitter::new(),
                init_existing: Emitter::new(),
                known: RefCell::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<TypeInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<TypeInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn base(&self) -> Option<&EntityType> {
        self.inner.base.as_ref()
    }

    /// This type followed by its bases, most derived first.
    pub fn lineage(&self) -> impl Iterator<Item = &EntityType> {
        std::iter::successors(Some(self), |t| t.base())
    }

    /// `true` if `self` is `other` or derives from it.
    #[must_use]
    pub fn is_subtype_of(&self, other: &EntityType) -> bool {
        self.lineage().any(|t| t == other)
    }

    /// Like [`is_subtype_of`](Self::is_subtype_of), by type name.
    #[must_use]
    pub fn is_subtype_of_name(&self, name: &str) -> bool {
        self.lineage().any(|t| t.name() == name)
    }

    /// Declare a property on this type.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] if the name is already declared on this type or a
    /// base type.
    pub fn add_property(&self, def: PropertyDef) -> Result<Property> {
        if self.property(def.name()).is_some() {
            return Err(Error::usage(format!(
                "property '{}' is already declared on '{}'",
                def.name(),
                self.name()
            )));
        }
        let property = Property::from_def(def, self);
        self.inner.properties.borrow_mut().push(property.clone());
        Ok(property)
    }

    /// Look up a property declared on this type or inherited.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<Property> {
        self.lineage().find_map(|t| {
            t.inner
                .properties
                .borrow()
                .iter()
                .find(|p| p.name() == name)
                .cloned()
        })
    }

    /// All properties, base-most declarations first.
    #[must_use]
    pub fn properties(&self) -> Vec<Property> {
        let mut lineage: Vec<&EntityType> = self.lineage().collect();
        lineage.reverse();
        lineage
            .into_iter()
            .flat_map(|t| t.inner.properties.borrow().clone())
            .collect()
    }

    /// Raised when a new instance of this type (or a subtype) is created.
    #[must_use]
    pub fn init_new(&self) -> &Emitter<Entity> {
        &self.inner.init_new
    }

    /// Raised when an existing instance of this type (or a subtype) is loaded.
    #[must_use]
    pub fn init_existing(&self) -> &Emitter<Entity> {
        &self.inner.init_existing
    }

    pub fn add_init_new(&self, handler: impl Fn(&Entity) -> Result<()> + 'static) -> HandlerId {
        self.inner.init_new.add(handler)
    }

    pub fn add_init_existing(&self, handler: impl Fn(&Entity) -> Result<()> + 'static) -> HandlerId {
        self.inner.init_existing.add(handler)
    }

    /// Live instances of this type and its subtypes, in creation order.
    #[must_use]
    pub fn known(&self) -> Vec<Entity> {
        let mut known = self.inner.known.borrow_mut();
        known.retain(|w| w.strong_count() > 0);
        known.iter().filter_map(Entity::upgrade).collect()
    }

    pub(crate) fn register_instance(&self, entity: &Entity) {
        for t in self.lineage() {
            t.inner.known.borrow_mut().push(entity.downgrade());
        }
    }
}
