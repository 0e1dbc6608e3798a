#![forbid(unsafe_code)]

//! Property chains: multi-hop property paths treated as one virtual property.
//!
//! A chain is an ordered list of steps. Step `i` reads its property on each
//! of its *targets*; the entities found become the targets of step `i + 1`.
//! When a step holds a list, traversal fans out across every element. A
//! step may carry a type filter (from a `<Type>` cast in the path) that its
//! targets must satisfy; targets that fail it are skipped silently.
//!
//! # Invariants
//!
//! 1. A chain has at least one step.
//! 2. A static property only appears in single-step chains.
//! 3. Traversal helpers ([`each`](PropertyChain::each),
//!    [`connects`](PropertyChain::connects),
//!    [`is_inited`](PropertyChain::is_inited)) read stored values and never
//!    raise get events. [`value`](PropertyChain::value) reads through the
//!    getters.
//!
//! # Change subscriptions
//!
//! [`add_changed`](PropertyChain::add_changed) installs one listener per
//! step. A change at step `0` concerns the changed entity itself; a change
//! at a later step concerns every root (the filter root, or every known
//! instance of the root type) that still [`connects`](PropertyChain::connects)
//! to the changed entity through that step.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ripple_core::{Error, Filter, Handler, HandlerId, Result};

use crate::entity::Entity;
use crate::entity_type::EntityType;
use crate::property::{Property, PropertyChange};
use crate::value::Value;

/// One segment of a textual path: `name` or `name<Cast>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub name: String,
    /// Type that narrows the next step's targets.
    pub cast: Option<String>,
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Split `path` into segments.
///
/// # Errors
///
/// [`Error::Usage`] for empty segments, unbalanced casts, or characters
/// outside `[A-Za-z0-9_]`.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let invalid = || Error::usage(format!("invalid property path '{path}'"));
    path.split('.')
        .map(|raw| {
            let raw = raw.trim();
            let (name, cast) = match raw.split_once('<') {
                None => (raw, None),
                Some((name, rest)) => {
                    let cast = rest.strip_suffix('>').ok_or_else(invalid)?;
                    (name, Some(cast.trim()))
                }
            };
            let name = name.trim();
            if !is_identifier(name) || cast.is_some_and(|c| !is_identifier(c)) {
                return Err(invalid());
            }
            Ok(PathSegment {
                name: name.to_string(),
                cast: cast.map(str::to_string),
            })
        })
        .collect()
}

/// One hop of a chain.
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub property: Property,
    /// Type the step's targets must satisfy.
    pub filter: Option<EntityType>,
}

impl ChainStep {
    #[must_use]
    pub fn new(property: Property) -> Self {
        Self {
            property,
            filter: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: EntityType) -> Self {
        self.filter = Some(filter);
        self
    }

    fn accepts(&self, target: &Entity) -> bool {
        self.filter
            .as_ref()
            .is_none_or(|f| target.entity_type().is_subtype_of(f))
    }
}

struct ChainInner {
    root: EntityType,
    path: String,
    steps: Vec<ChainStep>,
}

/// Shared handle to a resolved property path.
#[derive(Clone)]
pub struct PropertyChain {
    inner: Rc<ChainInner>,
}

impl PartialEq for PropertyChain {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for PropertyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyChain({}: {})", self.inner.root.name(), self.inner.path)
    }
}

impl fmt::Display for PropertyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.path)
    }
}

/// Argument handed to chain change handlers.
#[derive(Debug, Clone)]
pub struct ChainChange {
    /// Root whose view of the chain changed.
    pub root: Entity,
    pub chain: PropertyChain,
    /// The underlying single-step change.
    pub change: PropertyChange,
}

/// Handle to the per-step listeners installed by
/// [`PropertyChain::add_changed`].
#[derive(Clone, Default)]
pub struct ChainSubscription {
    registrations: Rc<RefCell<Vec<(Property, HandlerId)>>>,
}

impl fmt::Debug for ChainSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainSubscription")
            .field("listeners", &self.registrations.borrow().len())
            .finish()
    }
}

impl ChainSubscription {
    /// Remove every step listener. Returns `false` if already removed.
    pub fn remove(&self) -> bool {
        let registrations = std::mem::take(&mut *self.registrations.borrow_mut());
        let removed = !registrations.is_empty();
        for (property, id) in registrations {
            property.remove_changed(id);
        }
        removed
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.registrations.borrow().is_empty()
    }
}

impl PropertyChain {
    /// Build a chain from resolved steps.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] if `steps` is empty or a static property appears in
    /// a multi-step chain.
    pub fn new(root: &EntityType, path: impl Into<String>, steps: Vec<ChainStep>) -> Result<Self> {
        let path = path.into();
        if steps.is_empty() {
            return Err(Error::usage(format!("property path '{path}' has no steps")));
        }
        if steps.len() > 1 {
            if let Some(step) = steps.iter().find(|s| s.property.is_static()) {
                return Err(Error::usage(format!(
                    "static property '{}' cannot appear in multi-step path '{path}'",
                    step.property
                )));
            }
        }
        Ok(Self {
            inner: Rc::new(ChainInner {
                root: root.clone(),
                path,
                steps,
            }),
        })
    }

    /// Single-step chain over `property`, rooted at its declaring type.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] if the declaring type has been dropped.
    pub fn single(property: &Property) -> Result<Self> {
        let root = property
            .owner()
            .ok_or_else(|| Error::usage(format!("owner of '{property}' no longer exists")))?;
        Self::new(&root, property.name(), vec![ChainStep::new(property.clone())])
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    #[must_use]
    pub fn root_type(&self) -> &EntityType {
        &self.inner.root
    }

    #[must_use]
    pub fn steps(&self) -> &[ChainStep] {
        &self.inner.steps
    }

    /// Properties of every step, in order.
    #[must_use]
    pub fn properties(&self) -> Vec<Property> {
        self.inner.steps.iter().map(|s| s.property.clone()).collect()
    }

    #[must_use]
    pub fn first_property(&self) -> &Property {
        &self.inner.steps[0].property
    }

    #[must_use]
    pub fn last_property(&self) -> &Property {
        &self.inner.steps[self.inner.steps.len() - 1].property
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.steps.is_empty()
    }

    /// Depth-first traversal from `root`, calling `callback(target,
    /// property)` at every step (or only at steps whose property is
    /// `prop_filter`). Returns `false` if `callback` stopped the traversal
    /// by returning `false`.
    pub fn each(
        &self,
        root: &Entity,
        prop_filter: Option<&Property>,
        mut callback: impl FnMut(&Entity, &Property) -> bool,
    ) -> bool {
        self.walk(root, 0, prop_filter, &mut callback)
    }

    fn walk(
        &self,
        target: &Entity,
        index: usize,
        prop_filter: Option<&Property>,
        callback: &mut dyn FnMut(&Entity, &Property) -> bool,
    ) -> bool {
        let step = &self.inner.steps[index];
        if !step.accepts(target) {
            return true;
        }
        if prop_filter.is_none_or(|p| *p == step.property) && !callback(target, &step.property) {
            return false;
        }
        if index + 1 == self.inner.steps.len() {
            return true;
        }
        step.property
            .peek(target)
            .entities()
            .iter()
            .all(|next| self.walk(next, index + 1, prop_filter, callback))
    }

    /// `true` iff walking from `from_root` reaches `to` as a target of the
    /// step whose property is `via`.
    #[must_use]
    pub fn connects(&self, from_root: &Entity, to: &Entity, via: &Property) -> bool {
        !self.each(from_root, Some(via), |target, _| target != to)
    }

    /// `true` if every reachable step value has been initialized.
    #[must_use]
    pub fn is_inited(&self, root: &Entity) -> bool {
        self.each(root, None, |target, property| property.is_inited(target))
    }

    /// Read through every step, raising get events.
    ///
    /// Returns `Null` if an intermediate step is unset. If an intermediate
    /// step is list-valued, the last property's values are flattened into a
    /// [`Value::List`].
    ///
    /// # Errors
    ///
    /// The first error raised by a get handler.
    pub fn value(&self, root: &Entity) -> Result<Value> {
        let mut targets = vec![root.clone()];
        let mut fanned = false;
        let last = self.inner.steps.len() - 1;
        for (index, step) in self.inner.steps.iter().enumerate() {
            targets.retain(|t| step.accepts(t));
            if index == last {
                if !fanned {
                    return match targets.first() {
                        Some(target) => step.property.value(target),
                        None => Ok(Value::Null),
                    };
                }
                let mut values = Vec::new();
                for target in &targets {
                    match step.property.value(target)? {
                        Value::Null => {}
                        Value::List(items) => values.extend(items),
                        other => values.push(other),
                    }
                }
                return Ok(Value::List(values));
            }
            let mut next = Vec::new();
            for target in &targets {
                let value = step.property.value(target)?;
                fanned |= matches!(value, Value::List(_));
                next.extend(value.entities());
            }
            targets = next;
        }
        Ok(Value::Null)
    }

    /// The single entity the last step is read from, if the path leads to
    /// exactly one (no unset or list-valued intermediate step).
    #[must_use]
    pub fn last_target(&self, root: &Entity) -> Option<Entity> {
        let mut target = root.clone();
        for (index, step) in self.inner.steps.iter().enumerate() {
            if !step.accepts(&target) {
                return None;
            }
            if index + 1 == self.inner.steps.len() {
                return Some(target);
            }
            target = step.property.peek(&target).as_entity()?.clone();
        }
        None
    }

    /// Write the last property on the path's single last target.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] if there is no single last target, otherwise as
    /// [`Property::set_value`].
    pub fn set_value(&self, root: &Entity, value: impl Into<Value>) -> Result<()> {
        let target = self.last_target(root).ok_or_else(|| {
            Error::usage(format!(
                "cannot set '{}' on {root}: path does not lead to a single target",
                self.inner.path
            ))
        })?;
        self.last_property().set_value(&target, value)
    }

    /// Roots affected by `change` observed at step `index`.
    fn affected_roots(
        &self,
        index: usize,
        change: &PropertyChange,
        obj: Option<&Entity>,
        tolerate_partial: bool,
    ) -> Vec<Entity> {
        let step = &self.inner.steps[index];
        let target = &change.entity;
        if !step.accepts(target) {
            return Vec::new();
        }
        let candidates = if index == 0 && !step.property.is_static() {
            let in_scope = target.entity_type().is_subtype_of(&self.inner.root)
                && obj.is_none_or(|o| o == target);
            if in_scope { vec![target.clone()] } else { Vec::new() }
        } else {
            let pool = match obj {
                Some(o) => vec![o.clone()],
                None => {
                    #[cfg(test)]
                    tests::ROOT_SCANS.with(|scans| scans.set(scans.get() + 1));
                    self.inner.root.known()
                }
            };
            if step.property.is_static() {
                pool
            } else {
                pool.into_iter()
                    .filter(|root| self.connects(root, target, &step.property))
                    .collect()
            }
        };
        candidates
            .into_iter()
            .filter(|root| tolerate_partial || self.is_inited(root))
            .collect()
    }

    /// Subscribe to changes anywhere along the chain.
    ///
    /// `handler` runs once per affected root. With `obj`, only that root is
    /// considered. Unless `tolerate_partial`, roots whose chain is not fully
    /// initialized are skipped. A `once` subscription removes all of its
    /// listeners the first time it fires.
    pub fn add_changed(
        &self,
        handler: impl Fn(&ChainChange) -> Result<()> + 'static,
        obj: Option<&Entity>,
        once: bool,
        tolerate_partial: bool,
    ) -> ChainSubscription {
        let handler: Rc<dyn Fn(&ChainChange) -> Result<()>> = Rc::new(handler);
        let subscription = ChainSubscription::default();

        for (index, step) in self.inner.steps.iter().enumerate() {
            // The emitter runs the filter right before the callback for the
            // same change; the callback takes the roots the filter found.
            let found: Rc<RefCell<Option<Vec<Entity>>>> = Rc::default();

            let weak = Rc::downgrade(&self.inner);
            let (filter_obj, filter_found) = (obj.cloned(), Rc::clone(&found));
            let filter: Filter<PropertyChange> = Rc::new(move |change: &PropertyChange| {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                let roots = PropertyChain { inner }.affected_roots(
                    index,
                    change,
                    filter_obj.as_ref(),
                    tolerate_partial,
                );
                let accepted = !roots.is_empty();
                *filter_found.borrow_mut() = accepted.then_some(roots);
                accepted
            });

            let weak = Rc::downgrade(&self.inner);
            let (handler, obj, registrations) = (
                Rc::clone(&handler),
                obj.cloned(),
                Rc::clone(&subscription.registrations),
            );
            let callback: Handler<PropertyChange> = Rc::new(move |change: &PropertyChange| {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                let chain = PropertyChain { inner };
                let cached = found.borrow_mut().take();
                let roots = match cached {
                    Some(roots) => roots,
                    None => chain.affected_roots(index, change, obj.as_ref(), tolerate_partial),
                };
                if roots.is_empty() {
                    return Ok(());
                }
                if once {
                    ChainSubscription {
                        registrations: Rc::clone(&registrations),
                    }
                    .remove();
                }
                for root in roots {
                    handler(&ChainChange {
                        root,
                        chain: chain.clone(),
                        change: change.clone(),
                    })?;
                }
                Ok(())
            });

            let id = step.property.changed().add_with(callback, Some(filter), false);
            subscription
                .registrations
                .borrow_mut()
                .push((step.property.clone(), id));
        }
        subscription
    }
}
