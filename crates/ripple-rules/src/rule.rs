#![forbid(unsafe_code)]

//! Rules: units of work bound to a root type and triggered by model events.
//!
//! # Lifecycle
//!
//! ```text
//! Configuring ──register()──▶ Resolving ──all paths resolved──▶ Registered
//!                                 │
//!                                 └──resolution failed──▶ Failed(err)
//! ```
//!
//! While `Configuring`, the fluent methods ([`Rule::on_init`],
//! [`Rule::on_change_of`], [`Rule::returns`], ...) edit the rule. Once
//! [`Rule::register`] has been called they are ignored.
//!
//! # Triggers
//!
//! | Invocation        | Subscription                    | When the rule runs |
//! |-------------------|---------------------------------|--------------------|
//! | `INIT_NEW`        | root type's init-new event      | inline, in its own `perform` |
//! | `INIT_EXISTING`   | root type's init-existing event | inline, in its own `perform` |
//! | `PROPERTY_CHANGED`| every predicate chain           | on exit of the current scope, once per target |
//! | `PROPERTY_GET`    | every return property's get     | inline, if the value is pending init |
//!
//! A rule with return properties is *lazy*: init events and predicate
//! changes only mark its return properties pending-init, and the rule
//! computes when one of them is read, or right away when somebody watches
//! the return property for changes.
//!
//! # Guards
//!
//! Per target, a scheduled rule is tracked with the entity's
//! pending-invocation set and a running rule with its executing set. A
//! predicate change for a target that is already scheduled or running is
//! dropped, so many mutations in one operation cost one execution and a
//! rule's own writes to its predicates do not reschedule it.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use ripple_core::{Error, Result, Runtime};
use ripple_model::{Entity, EntityType, Model, Property, PropertyAccess, PropertyChain, RuleId, WeakModel};
use tracing::{debug, error, trace};

use crate::calculated::CalculatedRule;
use crate::condition::ConditionRule;
use crate::invocation::InvocationTypes;

/// Body of a custom rule.
pub type RuleFn = Rc<dyn Fn(&Entity) -> Result<()>>;

/// What a rule does when it executes.
#[derive(Clone)]
pub enum RuleKind {
    /// Arbitrary user code.
    Custom(RuleFn),
    /// Attach or clear a condition depending on an assertion.
    Condition(ConditionRule),
    /// Compute the rule's single return property.
    Calculated(CalculatedRule),
}

impl fmt::Debug for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(_) => f.write_str("Custom"),
            Self::Condition(rule) => f.debug_tuple("Condition").field(rule).finish(),
            Self::Calculated(rule) => f.debug_tuple("Calculated").field(rule).finish(),
        }
    }
}

/// Registration state of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleState {
    Configuring,
    /// Waiting for predicate paths to resolve.
    Resolving,
    Registered,
    Failed(Error),
}

impl RuleState {
    #[must_use]
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered)
    }
}

#[derive(Debug, Clone, Default)]
struct RuleOptions {
    invocation: InvocationTypes,
    predicates: Vec<String>,
    returns: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum InitMode {
    Execute,
    MarkPending,
}

struct RuleInner {
    id: RuleId,
    name: String,
    runtime: Runtime,
    model: WeakModel,
    root: EntityType,
    kind: RuleKind,
    options: RefCell<RuleOptions>,
    state: RefCell<RuleState>,
    predicates: RefCell<Vec<PropertyChain>>,
    returns: RefCell<Vec<Property>>,
    registering: Cell<bool>,
}

/// Shared handle to a rule.
#[derive(Clone)]
pub struct Rule {
    inner: Rc<RuleInner>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let options = self.inner.options.borrow();
        f.debug_struct("Rule")
            .field("name", &self.inner.name)
            .field("root", &self.inner.root.name())
            .field("kind", &self.inner.kind)
            .field("invocation", &options.invocation)
            .field("predicates", &options.predicates)
            .field("returns", &options.returns)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Rule {}

impl Rule {
    /// Create an unregistered rule on `root`.
    #[must_use]
    pub fn new(model: &Model, root: &EntityType, name: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            inner: Rc::new(RuleInner {
                id: model.next_rule_id(),
                name: name.into(),
                runtime: model.runtime().clone(),
                model: model.downgrade(),
                root: root.clone(),
                kind,
                options: RefCell::new(RuleOptions::default()),
                state: RefCell::new(RuleState::Configuring),
                predicates: RefCell::new(Vec::new()),
                returns: RefCell::new(Vec::new()),
                registering: Cell::new(false),
            }),
        }
    }

    #[must_use]
    pub fn custom(
        model: &Model,
        root: &EntityType,
        name: impl Into<String>,
        body: impl Fn(&Entity) -> Result<()> + 'static,
    ) -> Self {
        Self::new(model, root, name, RuleKind::Custom(Rc::new(body)))
    }

    #[must_use]
    pub fn condition(model: &Model, root: &EntityType, name: impl Into<String>, rule: ConditionRule) -> Self {
        Self::new(model, root, name, RuleKind::Condition(rule))
    }

    /// A calculated rule for `property` on `root`, named `Type.property`.
    #[must_use]
    pub fn calculated(model: &Model, root: &EntityType, property: &str, rule: CalculatedRule) -> Self {
        let name = format!("{}.{property}", root.name());
        Self::new(model, root, name, RuleKind::Calculated(rule)).returns([property])
    }

    fn downgrade(&self) -> Weak<RuleInner> {
        Rc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<RuleInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn id(&self) -> RuleId {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn root(&self) -> &EntityType {
        &self.inner.root
    }

    #[must_use]
    pub fn kind(&self) -> &RuleKind {
        &self.inner.kind
    }

    #[must_use]
    pub fn state(&self) -> RuleState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn invocation_types(&self) -> InvocationTypes {
        self.inner.options.borrow().invocation
    }

    /// Dependency paths as declared.
    #[must_use]
    pub fn predicate_paths(&self) -> Vec<String> {
        self.inner.options.borrow().predicates.clone()
    }

    /// Resolved dependency chains (empty until registered).
    #[must_use]
    pub fn predicates(&self) -> Vec<PropertyChain> {
        self.inner.predicates.borrow().clone()
    }

    /// Resolved return properties (empty until registration starts).
    #[must_use]
    pub fn return_properties(&self) -> Vec<Property> {
        self.inner.returns.borrow().clone()
    }

    fn is_lazy(&self) -> bool {
        !self.inner.returns.borrow().is_empty()
    }

    // ── Configuration ─────────────────────────────────────────────────────

    fn configure(self, edit: impl FnOnce(&mut RuleOptions)) -> Self {
        if *self.inner.state.borrow() == RuleState::Configuring {
            edit(&mut self.inner.options.borrow_mut());
        } else {
            trace!(rule = %self.inner.name, "ignoring configuration of a registered rule");
        }
        self
    }

    /// Run on both init events.
    #[must_use]
    pub fn on_init(self) -> Self {
        self.configure(|o| o.invocation |= InvocationTypes::INIT)
    }

    #[must_use]
    pub fn on_init_new(self) -> Self {
        self.configure(|o| o.invocation |= InvocationTypes::INIT_NEW)
    }

    #[must_use]
    pub fn on_init_existing(self) -> Self {
        self.configure(|o| o.invocation |= InvocationTypes::INIT_EXISTING)
    }

    /// Run when any of `paths` (relative to the root type) changes.
    #[must_use]
    pub fn on_change_of<I, S>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths: Vec<String> = paths.into_iter().map(Into::into).collect();
        self.configure(move |o| {
            o.invocation |= InvocationTypes::PROPERTY_CHANGED;
            o.predicates.extend(paths);
        })
    }

    /// Declare the properties of the root type this rule computes.
    #[must_use]
    pub fn returns<I, S>(self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let properties: Vec<String> = properties.into_iter().map(Into::into).collect();
        self.configure(move |o| {
            o.invocation |= InvocationTypes::PROPERTY_GET;
            o.returns.extend(properties);
        })
    }

    // ── Registration ──────────────────────────────────────────────────────

    /// Resolve the rule's paths and subscribe to its triggers.
    ///
    /// Paths that need a type from the loader resolve later; in that case
    /// this returns `Ok` with the rule still `Resolving`, and a later
    /// failure is logged and leaves the rule `Failed`.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] if the rule was already registered, returns no
    /// properties despite asking for get triggers, or is a calculated rule
    /// without exactly one return property. Path resolution errors that
    /// happen synchronously are returned as well.
    pub fn register(&self) -> Result<()> {
        {
            let mut state = self.inner.state.borrow_mut();
            if *state != RuleState::Configuring {
                return Err(Error::usage(format!(
                    "rule '{}' is already registered",
                    self.inner.name
                )));
            }
            *state = RuleState::Resolving;
        }
        let options = self.inner.options.borrow().clone();

        let Some(model) = self.inner.model.upgrade() else {
            return Err(self.fail(Error::usage(format!(
                "model of rule '{}' is gone",
                self.inner.name
            ))));
        };
        if let Err(err) = self.check_shape(&options) {
            return Err(self.fail(err));
        }
        match self.resolve_returns(&options) {
            Ok(returns) => *self.inner.returns.borrow_mut() = returns,
            Err(err) => return Err(self.fail(err)),
        }

        debug!(rule = %self.inner.name, paths = options.predicates.len(), "resolving rule predicates");
        self.inner.registering.set(true);
        let barrier = self.inner.runtime.barrier(format!("register {}", self.inner.name));
        let slots: Rc<RefCell<Vec<Option<PropertyChain>>>> =
            Rc::new(RefCell::new(vec![None; options.predicates.len()]));
        let failure: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));

        for (index, path) in options.predicates.iter().enumerate() {
            let token = barrier.pending();
            let (slots, failure) = (Rc::clone(&slots), Rc::clone(&failure));
            let name = self.inner.name.clone();
            model.property(path, &self.inner.root, true, move |outcome| {
                match outcome {
                    Ok(chain) => slots.borrow_mut()[index] = Some(chain),
                    Err(err) => {
                        failure.borrow_mut().get_or_insert(err);
                    }
                }
                if let Err(err) = token.invoke() {
                    error!(rule = %name, %err, "predicate resolution completed twice");
                }
            });
        }

        // Held until resolution settles; the model keeps it after that.
        let rule = self.clone();
        barrier.wait_for_all(
            move || {
                let failure = failure.borrow_mut().take();
                rule.complete_registration(&slots, failure);
            },
            true,
        );
        self.inner.registering.set(false);

        match &*self.inner.state.borrow() {
            RuleState::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Register once the model is ready. Failures are logged.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] if the model has been dropped.
    pub fn register_when_ready(&self) -> Result<()> {
        let model = self
            .inner
            .model
            .upgrade()
            .ok_or_else(|| Error::usage(format!("model of rule '{}' is gone", self.inner.name)))?;
        let rule = self.clone();
        model.when_ready(move || {
            if let Err(err) = rule.register() {
                error!(rule = %rule.inner.name, %err, "rule registration failed");
            }
        });
        Ok(())
    }

    fn check_shape(&self, options: &RuleOptions) -> Result<()> {
        if options.invocation.contains(InvocationTypes::PROPERTY_GET) && options.returns.is_empty() {
            return Err(Error::usage(format!(
                "rule '{}' returns no properties",
                self.inner.name
            )));
        }
        if matches!(self.inner.kind, RuleKind::Calculated(_)) && options.returns.len() != 1 {
            return Err(Error::usage(format!(
                "calculated rule '{}' must return exactly one property, not {}",
                self.inner.name,
                options.returns.len()
            )));
        }
        Ok(())
    }

    fn resolve_returns(&self, options: &RuleOptions) -> Result<Vec<Property>> {
        options
            .returns
            .iter()
            .map(|name| {
                self.inner.root.property(name).ok_or_else(|| Error::UnresolvedPath {
                    root: self.inner.root.name().to_string(),
                    path: name.clone(),
                })
            })
            .collect()
    }

    fn fail(&self, err: Error) -> Error {
        *self.inner.state.borrow_mut() = RuleState::Failed(err.clone());
        err
    }

    fn complete_registration(&self, slots: &RefCell<Vec<Option<PropertyChain>>>, failure: Option<Error>) {
        let chains: Option<Vec<PropertyChain>> = slots.borrow_mut().drain(..).collect();
        let outcome = match (failure, chains) {
            (Some(err), _) => Err(err),
            (None, Some(chains)) => Ok(chains),
            (None, None) => Err(Error::usage(format!(
                "predicates of rule '{}' did not resolve",
                self.inner.name
            ))),
        };

        match outcome {
            Ok(chains) => {
                let Some(model) = self.inner.model.upgrade() else {
                    self.fail(Error::usage(format!("model of rule '{}' is gone", self.inner.name)));
                    return;
                };
                model.retain(Rc::clone(&self.inner) as Rc<dyn Any>);
                self.subscribe(&chains);
                *self.inner.predicates.borrow_mut() = chains;
                *self.inner.state.borrow_mut() = RuleState::Registered;
                debug!(rule = %self.inner.name, root = self.inner.root.name(), "rule registered");
            }
            Err(err) => {
                if !self.inner.registering.get() {
                    error!(rule = %self.inner.name, %err, "rule registration failed");
                }
                self.fail(err);
            }
        }
    }

    fn subscribe(&self, chains: &[PropertyChain]) {
        let invocation = self.inner.options.borrow().invocation;
        let lazy = self.is_lazy();
        let root = &self.inner.root;

        for (flag, emitter) in [
            (InvocationTypes::INIT_NEW, root.init_new()),
            (InvocationTypes::INIT_EXISTING, root.init_existing()),
        ] {
            let mode = if invocation.contains(flag) {
                InitMode::Execute
            } else if lazy {
                InitMode::MarkPending
            } else {
                continue;
            };
            let weak = self.downgrade();
            emitter.add(move |entity: &Entity| match Rule::upgrade(&weak) {
                Some(rule) => rule.handle_init(entity, mode),
                None => Ok(()),
            });
        }

        if invocation.contains(InvocationTypes::PROPERTY_CHANGED) {
            for chain in chains {
                let weak = self.downgrade();
                // Registered rules stay subscribed for the model's lifetime.
                let _subscription = chain.add_changed(
                    move |change| match Rule::upgrade(&weak) {
                        Some(rule) => rule.on_predicate_changed(&change.root),
                        None => Ok(()),
                    },
                    None,
                    false,
                    false,
                );
            }
        }

        if invocation.contains(InvocationTypes::PROPERTY_GET) {
            for property in self.inner.returns.borrow().iter() {
                let weak = self.downgrade();
                property.add_get(
                    move |access: &PropertyAccess| match Rule::upgrade(&weak) {
                        Some(rule) => rule.on_get(access),
                        None => Ok(()),
                    },
                    None,
                    false,
                );
            }
        }
    }

    // ── Triggers ──────────────────────────────────────────────────────────

    fn handle_init(&self, entity: &Entity, mode: InitMode) -> Result<()> {
        match mode {
            InitMode::Execute => self.run_guarded(entity),
            InitMode::MarkPending => {
                self.mark_returns_pending(entity, true);
                Ok(())
            }
        }
    }

    fn on_predicate_changed(&self, target: &Entity) -> Result<()> {
        let id = self.inner.id;
        if target.is_executing(id) || !target.mark_pending_invocation(id) {
            trace!(rule = %self.inner.name, target = %target, "rule already scheduled");
            return Ok(());
        }
        trace!(rule = %self.inner.name, target = %target, "rule scheduled");

        let aborted = target.clone();
        self.inner.runtime.on_abort(move || {
            aborted.clear_pending_invocation(id);
            Ok(())
        });
        let (rule, target) = (self.clone(), target.clone());
        self.inner.runtime.on_exit(move || rule.run_scheduled(&target))
    }

    fn on_get(&self, access: &PropertyAccess) -> Result<()> {
        let entity = &access.entity;
        if !entity.entity_type().is_subtype_of(&self.inner.root)
            || !entity.is_pending_init(access.property.name())
        {
            return Ok(());
        }
        self.run_guarded(entity)
    }

    fn run_scheduled(&self, target: &Entity) -> Result<()> {
        target.clear_pending_invocation(self.inner.id);
        if !self.is_lazy() {
            return self.run_guarded(target);
        }

        self.mark_returns_pending(target, true);
        let watched = self
            .inner
            .returns
            .borrow()
            .iter()
            .any(|property| property.is_watched(target));
        if watched {
            self.run_guarded(target)
        } else {
            trace!(rule = %self.inner.name, target = %target, "return values invalidated");
            Ok(())
        }
    }

    fn mark_returns_pending(&self, target: &Entity, pending: bool) {
        for property in self.inner.returns.borrow().iter() {
            target.set_pending_init(property.name(), pending);
        }
    }

    /// Execute against `target` in its own scope unless already running
    /// there.
    fn run_guarded(&self, target: &Entity) -> Result<()> {
        let id = self.inner.id;
        if !target.begin_execution(id) {
            trace!(rule = %self.inner.name, target = %target, "rule already running");
            return Ok(());
        }
        self.mark_returns_pending(target, false);
        // Cleared before the scope exits so work cascading from this run
        // can schedule the rule again.
        self.inner.runtime.perform(|| {
            let result = self.execute(target);
            target.end_execution(id);
            result
        })
    }

    /// Execute the rule body against `target` right now, with no guards.
    ///
    /// # Errors
    ///
    /// Whatever the body returns; computation errors carry the rule name.
    pub fn execute(&self, target: &Entity) -> Result<()> {
        trace!(rule = %self.inner.name, target = %target, "executing rule");
        let result = match &self.inner.kind {
            RuleKind::Custom(body) => body(target),
            RuleKind::Condition(rule) => rule.execute(self, target),
            RuleKind::Calculated(rule) => rule.execute(self, target),
        };
        result.map_err(|err| err.in_rule(&self.inner.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::PendingToken;
    use ripple_model::{Loader, PropertyDef, Value};

    fn order_model() -> (Model, EntityType) {
        let model = Model::default();
        let order = model.define_type("Order", None).unwrap();
        order.add_property(PropertyDef::scalar("qty").with_default(1)).unwrap();
        order.add_property(PropertyDef::scalar("note")).unwrap();
        order.add_property(PropertyDef::scalar("total")).unwrap();
        (model, order)
    }

    fn counting_rule(model: &Model, order: &EntityType) -> (Rule, Rc<Cell<u32>>) {
        let runs = Rc::new(Cell::new(0));
        let r = Rc::clone(&runs);
        let rule = Rule::custom(model, order, "Order.count", move |_| {
            r.set(r.get() + 1);
            Ok(())
        });
        (rule, runs)
    }

    #[test]
    fn configuration_is_ignored_after_registration() {
        let (model, order) = order_model();
        let (rule, _) = counting_rule(&model, &order);
        let rule = rule.on_change_of(["qty"]);
        rule.register().unwrap();
        assert_eq!(rule.state(), RuleState::Registered);

        let rule = rule.on_change_of(["note"]).on_init();
        assert_eq!(rule.predicate_paths(), vec!["qty".to_string()]);
        assert_eq!(rule.invocation_types(), InvocationTypes::PROPERTY_CHANGED);
        assert!(matches!(rule.register(), Err(Error::Usage(_))));
    }

    #[test]
    fn init_new_runs_rule_inline() {
        let (model, order) = order_model();
        let (rule, runs) = counting_rule(&model, &order);
        rule.on_init_new().register().unwrap();

        model.create("Order").unwrap();
        assert_eq!(runs.get(), 1);
        Entity::existing(&order, "1", Vec::<(&str, Value)>::new()).unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn changes_outside_a_scope_run_immediately() {
        let (model, order) = order_model();
        let (rule, runs) = counting_rule(&model, &order);
        let rule = rule.on_change_of(["qty"]);
        rule.register().unwrap();

        let o = model.create("Order").unwrap();
        o.set("qty", 2).unwrap();
        o.set("qty", 3).unwrap();
        assert_eq!(runs.get(), 2);
        assert!(!o.has_pending_invocation(rule.id()));
    }

    #[test]
    fn changes_inside_perform_run_once_at_exit() {
        let (model, order) = order_model();
        let (rule, runs) = counting_rule(&model, &order);
        let rule = rule.on_change_of(["qty", "note"]);
        rule.register().unwrap();

        let o = model.create("Order").unwrap();
        let target = o.clone();
        let r = Rc::clone(&runs);
        model
            .runtime()
            .perform(|| {
                target.set("qty", 5)?;
                target.set("note", "rush")?;
                target.set("qty", 6)?;
                assert_eq!(r.get(), 0);
                Ok(())
            })
            .unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn aborted_scope_releases_the_guard() {
        let (model, order) = order_model();
        let (rule, runs) = counting_rule(&model, &order);
        let rule = rule.on_change_of(["qty"]);
        rule.register().unwrap();

        let o = model.create("Order").unwrap();
        let scopes = model.runtime().scopes();
        let scope = scopes.begin();
        o.set("qty", 9).unwrap();
        assert!(o.has_pending_invocation(rule.id()));
        scopes.abort(scope).unwrap();

        assert_eq!(runs.get(), 0);
        assert!(!o.has_pending_invocation(rule.id()));
        o.set("qty", 10).unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn returns_without_properties_is_a_usage_error() {
        let (model, order) = order_model();
        let (rule, _) = counting_rule(&model, &order);
        let rule = rule.returns(Vec::<String>::new());
        assert!(matches!(rule.register(), Err(Error::Usage(_))));
        assert!(matches!(rule.state(), RuleState::Failed(Error::Usage(_))));
    }

    #[test]
    fn unknown_predicate_fails_synchronously() {
        let (model, order) = order_model();
        let (rule, runs) = counting_rule(&model, &order);
        let rule = rule.on_change_of(["missing"]);
        let err = rule.register().unwrap_err();
        assert!(matches!(err, Error::UnresolvedPath { .. }));
        assert_eq!(rule.state(), RuleState::Failed(err));

        model.create("Order").unwrap().set("qty", 4).unwrap();
        assert_eq!(runs.get(), 0);
    }

    #[test]
    fn custom_errors_carry_the_rule_name() {
        let (model, order) = order_model();
        let rule = Rule::custom(&model, &order, "Order.fails", |_| Err(Error::computation("boom")))
            .on_change_of(["qty"]);
        rule.register().unwrap();

        let o = model.create("Order").unwrap();
        let err = o.set("qty", 2).unwrap_err();
        assert_eq!(err.to_string(), "rule 'Order.fails' failed: boom");
        assert!(!o.is_executing(rule.id()));
    }

    #[test]
    fn register_when_ready_waits_for_the_gate() {
        let (model, order) = order_model();
        let (rule, runs) = counting_rule(&model, &order);
        let rule = rule.on_init_new();
        rule.register_when_ready().unwrap();
        assert_eq!(rule.state(), RuleState::Configuring);

        model.ready();
        assert!(rule.state().is_registered());
        model.create("Order").unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn dropped_handle_keeps_registered_rule_alive() {
        let (model, order) = order_model();
        let (rule, runs) = counting_rule(&model, &order);
        rule.on_change_of(["qty"]).register().unwrap();

        model.create("Order").unwrap().set("qty", 7).unwrap();
        assert_eq!(runs.get(), 1);
    }

    struct SlowLoader {
        pending: Rc<RefCell<Vec<PendingToken>>>,
        define: bool,
    }

    impl Loader for SlowLoader {
        fn load_type(&self, model: &Model, name: &str, done: PendingToken) {
            if self.define {
                let customer = model.define_type(name, None).unwrap();
                customer.add_property(PropertyDef::scalar("name")).unwrap();
            }
            self.pending.borrow_mut().push(done);
        }

        fn load_property(&self, _model: &Model, _entity: &Entity, _property: &Property, done: PendingToken) {
            self.pending.borrow_mut().push(done);
        }
    }

    fn customer_model(define: bool) -> (Model, EntityType, Rc<RefCell<Vec<PendingToken>>>) {
        let (model, order) = order_model();
        order
            .add_property(PropertyDef::reference("customer", "Customer"))
            .unwrap();
        let pending = Rc::new(RefCell::new(Vec::new()));
        model.set_loader(SlowLoader {
            pending: Rc::clone(&pending),
            define,
        });
        (model, order, pending)
    }

    #[test]
    fn predicates_resolve_after_the_loader_completes() {
        let (model, order, pending) = customer_model(true);
        let (rule, _) = counting_rule(&model, &order);
        let rule = rule.on_change_of(["customer.name", "qty"]);
        rule.register().unwrap();
        assert_eq!(rule.state(), RuleState::Resolving);

        pending.borrow_mut().pop().unwrap().invoke().unwrap();
        assert_eq!(rule.state(), RuleState::Registered);
        let paths: Vec<String> = rule.predicates().iter().map(|c| c.path().to_string()).collect();
        assert_eq!(paths, vec!["customer.name".to_string(), "qty".to_string()]);
    }

    #[test]
    fn asynchronous_resolution_failure_leaves_rule_failed() {
        let (model, order, pending) = customer_model(false);
        let (rule, _) = counting_rule(&model, &order);
        let rule = rule.on_change_of(["customer.name"]);
        rule.register().unwrap();

        pending.borrow_mut().pop().unwrap().invoke().unwrap();
        assert!(matches!(rule.state(), RuleState::Failed(Error::UnresolvedPath { .. })));
    }

    #[test]
    fn failed_registration_is_not_kept_by_the_model() {
        let (model, order) = order_model();
        let (rule, _) = counting_rule(&model, &order);
        let rule = rule.on_change_of(["missing"]);
        let weak = rule.downgrade();
        assert!(rule.register().is_err());

        drop(rule);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn rule_resolving_asynchronously_survives_its_handle() {
        let (model, order, pending) = customer_model(true);
        let (rule, runs) = counting_rule(&model, &order);
        let rule = rule.on_change_of(["customer.name", "qty"]);
        let weak = rule.downgrade();
        rule.register().unwrap();
        drop(rule);
        assert!(weak.upgrade().is_some());

        pending.borrow_mut().pop().unwrap().invoke().unwrap();
        let registered = Rule::upgrade(&weak).unwrap();
        assert!(registered.state().is_registered());
        model.create("Order").unwrap().set("qty", 3).unwrap();
        assert_eq!(runs.get(), 1);
    }
}
