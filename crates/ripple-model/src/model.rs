#![forbid(unsafe_code)]

//! The model: type registry, path resolution, loading, and the ready gate.
//!
//! # Path resolution
//!
//! [`Model::chain`] resolves a textual path against the types registered
//! right now and caches the result per (root type, path).
//! [`Model::property`] is the asynchronous form used during rule
//! registration: when a step refers to a type that is not registered yet and
//! `force_load` is set, the [`Loader`] is asked for it and resolution
//! resumes once the loader completes. While waiting, the current batch is
//! suspended and later resumed around the continuation.
//!
//! # Ready gate
//!
//! Work queued with [`Model::when_ready`] runs once the host calls
//! [`Model::ready`], in queue order. After that it runs immediately.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use ripple_core::{Batch, EngineConfig, Error, Result, Runtime};
use tracing::{debug, error};

use crate::chain::{ChainStep, PropertyChain, parse_path};
use crate::entity::{Entity, RuleId};
use crate::entity_type::EntityType;
use crate::loader::Loader;
use crate::property::Property;

type ReadyTask = Box<dyn FnOnce()>;
type ChainCallback = Box<dyn FnOnce(Result<PropertyChain>)>;

struct ModelInner {
    runtime: Runtime,
    types: RefCell<HashMap<String, EntityType>>,
    chains: RefCell<HashMap<(String, String), PropertyChain>>,
    loader: RefCell<Option<Rc<dyn Loader>>>,
    ready: Cell<bool>,
    ready_queue: RefCell<VecDeque<ReadyTask>>,
    next_rule: Cell<u64>,
    retained: RefCell<Vec<Rc<dyn Any>>>,
}

/// Shared handle to a model.
#[derive(Clone)]
pub struct Model {
    inner: Rc<ModelInner>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("types", &self.inner.types.borrow().len())
            .field("cached_chains", &self.inner.chains.borrow().len())
            .field("ready", &self.inner.ready.get())
            .field("retained", &self.inner.retained.borrow().len())
            .field("runtime", &self.inner.runtime)
            .finish()
    }
}

/// Non-owning handle to a model, for objects the model (indirectly) owns.
#[derive(Clone, Default)]
pub struct WeakModel {
    inner: Weak<ModelInner>,
}

impl fmt::Debug for WeakModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakModel")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl WeakModel {
    #[must_use]
    pub fn upgrade(&self) -> Option<Model> {
        self.inner.upgrade().map(|inner| Model { inner })
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Outcome of one synchronous resolution attempt.
enum Lookup {
    Resolved(PropertyChain),
    MissingType(String),
}

impl Model {
    /// Create a model with a fresh runtime.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_runtime(Runtime::new(config))
    }

    /// Create a model that shares `runtime`.
    #[must_use]
    pub fn with_runtime(runtime: Runtime) -> Self {
        Self {
            inner: Rc::new(ModelInner {
                runtime,
                types: RefCell::new(HashMap::new()),
                chains: RefCell::new(HashMap::new()),
                loader: RefCell::new(None),
                ready: Cell::new(false),
                ready_queue: RefCell::new(VecDeque::new()),
                next_rule: Cell::new(1),
                retained: RefCell::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakModel {
        WeakModel {
            inner: Rc::downgrade(&self.inner),
        }
    }

    // ── Types ─────────────────────────────────────────────────────────────

    /// Register a new type, optionally deriving from a registered base.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] if `name` is taken or `base` is not registered.
    pub fn define_type(&self, name: &str, base: Option<&str>) -> Result<EntityType> {
        if self.inner.types.borrow().contains_key(name) {
            return Err(Error::usage(format!("type '{name}' is already defined")));
        }
        let base = match base {
            Some(base_name) => Some(
                self.entity_type(base_name)
                    .ok_or_else(|| Error::usage(format!("unknown base type '{base_name}' for '{name}'")))?,
            ),
            None => None,
        };
        let entity_type = EntityType::new(name, base.as_ref());
        self.inner
            .types
            .borrow_mut()
            .insert(name.to_string(), entity_type.clone());
        debug!(type_name = name, base = ?base.as_ref().map(EntityType::name), "type defined");
        Ok(entity_type)
    }

    #[must_use]
    pub fn entity_type(&self, name: &str) -> Option<EntityType> {
        self.inner.types.borrow().get(name).cloned()
    }

    /// Create a new instance of the registered type `type_name`.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] for unknown types, or an InitNew handler error.
    pub fn create(&self, type_name: &str) -> Result<Entity> {
        let entity_type = self
            .entity_type(type_name)
            .ok_or_else(|| Error::usage(format!("unknown type '{type_name}'")))?;
        Entity::create(&entity_type)
    }

    /// Install the host loader.
    pub fn set_loader(&self, loader: impl Loader + 'static) {
        *self.inner.loader.borrow_mut() = Some(Rc::new(loader));
    }

    fn loader(&self) -> Option<Rc<dyn Loader>> {
        self.inner.loader.borrow().clone()
    }

    /// Allocate an id for a rule's per-entity bookkeeping.
    pub fn next_rule_id(&self) -> RuleId {
        let id = self.inner.next_rule.get();
        self.inner.next_rule.set(id + 1);
        RuleId(id)
    }

    /// Keep `object` alive for as long as the model is.
    ///
    /// Registered rules park themselves here; the event handlers they
    /// install only hold weak references back to them.
    pub fn retain(&self, object: Rc<dyn Any>) {
        self.inner.retained.borrow_mut().push(object);
    }

    // ── Path resolution ───────────────────────────────────────────────────

    /// Resolve `path` from `root` using only registered types.
    ///
    /// # Errors
    ///
    /// [`Error::Usage`] for malformed paths or static properties in
    /// multi-step paths; [`Error::UnresolvedPath`] for unknown properties or
    /// types.
    pub fn chain(&self, root: &EntityType, path: &str) -> Result<PropertyChain> {
        match self.lookup(root, path)? {
            Lookup::Resolved(chain) => Ok(chain),
            Lookup::MissingType(_) => Err(unresolved(root, path)),
        }
    }

    fn lookup(&self, root: &EntityType, path: &str) -> Result<Lookup> {
        let key = (root.name().to_string(), path.to_string());
        if let Some(chain) = self.inner.chains.borrow().get(&key) {
            if chain.root_type() == root {
                return Ok(Lookup::Resolved(chain.clone()));
            }
        }

        let segments = parse_path(path)?;
        let mut steps = Vec::with_capacity(segments.len());
        let mut current = root.clone();
        let mut filter: Option<EntityType> = None;

        for (index, segment) in segments.iter().enumerate() {
            let property = current
                .property(&segment.name)
                .ok_or_else(|| unresolved(root, path))?;
            let mut step = ChainStep::new(property.clone());
            step.filter = filter.take();
            steps.push(step);

            if index + 1 == segments.len() {
                break;
            }
            let Some(target_name) = property.reference_type() else {
                return Err(unresolved(root, path));
            };
            let Some(target) = self.entity_type(target_name) else {
                return Ok(Lookup::MissingType(target_name.to_string()));
            };
            current = match &segment.cast {
                None => target,
                Some(cast) => {
                    let Some(cast_type) = self.entity_type(cast) else {
                        return Ok(Lookup::MissingType(cast.clone()));
                    };
                    if !cast_type.is_subtype_of(&target) {
                        return Err(Error::usage(format!(
                            "cast to '{cast}' in '{path}' is not a subtype of '{target_name}'"
                        )));
                    }
                    filter = Some(cast_type.clone());
                    cast_type
                }
            };
        }

        let chain = PropertyChain::new(root, path, steps)?;
        self.inner.chains.borrow_mut().insert(key, chain.clone());
        Ok(Lookup::Resolved(chain))
    }

    /// Resolve `path` from `root`, loading missing types through the
    /// loader when `force_load` is set, and hand the outcome to `callback`.
    ///
    /// `callback` runs synchronously when nothing needs loading.
    pub fn property(
        &self,
        path: &str,
        root: &EntityType,
        force_load: bool,
        callback: impl FnOnce(Result<PropertyChain>) + 'static,
    ) {
        self.resolve(
            path.to_string(),
            root.clone(),
            force_load,
            HashSet::new(),
            Box::new(callback),
        );
    }

    fn resolve(
        &self,
        path: String,
        root: EntityType,
        force_load: bool,
        mut attempted: HashSet<String>,
        callback: ChainCallback,
    ) {
        let missing = match self.lookup(&root, &path) {
            Err(err) => return callback(Err(err)),
            Ok(Lookup::Resolved(chain)) => return callback(Ok(chain)),
            Ok(Lookup::MissingType(name)) => name,
        };
        let loader = self
            .loader()
            .filter(|_| force_load && !attempted.contains(&missing));
        let Some(loader) = loader else {
            return callback(Err(unresolved(&root, &path)));
        };

        debug!(type_name = %missing, path = %path, "loading type for path resolution");
        attempted.insert(missing.clone());
        let batch = self.inner.runtime.batches().suspend_current();
        let barrier = self.inner.runtime.barrier(format!("load type {missing}"));
        loader.load_type(self, &missing, barrier.pending());

        let model = self.clone();
        barrier.wait_for_all(
            move || {
                model.within_batch(batch, || {
                    model.resolve(path, root, force_load, attempted, callback);
                });
            },
            true,
        );
    }

    /// Run `f` with `batch` (if any) resumed, then release the hold that
    /// suspending it added.
    fn within_batch(&self, batch: Option<Batch>, f: impl FnOnce()) {
        let batches = self.inner.runtime.batches();
        if let Some(batch) = &batch {
            if let Err(err) = batches.resume(batch) {
                error!(%err, "failed to resume batch after load");
            }
        }
        f();
        if let Some(batch) = &batch {
            if let Err(err) = batches.end(batch) {
                error!(%err, "failed to end batch after load");
            }
        }
    }

    // ── Data loading ──────────────────────────────────────────────────────

    /// `true` if every path is fully initialized from `entity`.
    ///
    /// # Errors
    ///
    /// As [`Model::chain`].
    pub fn is_loaded(&self, entity: &Entity, paths: &[&str]) -> Result<bool> {
        for path in paths {
            if !self.chain(entity.entity_type(), path)?.is_inited(entity) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Make sure `property` is initialized on `entity`, then run `done`.
    ///
    /// Without a loader, or when the value is already present, `done` runs
    /// immediately.
    pub fn load(&self, entity: &Entity, property: &Property, done: impl FnOnce() + 'static) {
        let loader = self.loader().filter(|_| !property.is_inited(entity));
        let Some(loader) = loader else {
            return done();
        };
        debug!(entity = %entity, property = %property, "loading property");
        let batch = self.inner.runtime.batches().suspend_current();
        let barrier = self.inner.runtime.barrier(format!("load {property}"));
        loader.load_property(self, entity, property, barrier.pending());

        let model = self.clone();
        barrier.wait_for_all(move || model.within_batch(batch, done), true);
    }

    // ── Ready gate ────────────────────────────────────────────────────────

    /// Run `f` once the model is ready (now, if it already is).
    pub fn when_ready(&self, f: impl FnOnce() + 'static) {
        if self.inner.ready.get() {
            f();
        } else {
            self.inner.ready_queue.borrow_mut().push_back(Box::new(f));
        }
    }

    /// Open the ready gate and run queued work in order.
    pub fn ready(&self) {
        if self.inner.ready.replace(true) {
            return;
        }
        debug!(queued = self.inner.ready_queue.borrow().len(), "model ready");
        loop {
            let task = self.inner.ready_queue.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.get()
    }
}

fn unresolved(root: &EntityType, path: &str) -> Error {
    Error::UnresolvedPath {
        root: root.name().to_string(),
        path: path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyDef;
    use crate::value::Value;
    use ripple_core::PendingToken;

    fn shop() -> Model {
        let model = Model::default();
        let order = model.define_type("Order", None).unwrap();
        model.define_type("Line", None).unwrap();
        order
            .add_property(PropertyDef::reference("items", "Line").list())
            .unwrap();
        order
            .add_property(PropertyDef::reference("customer", "Customer"))
            .unwrap();
        model
            .entity_type("Line")
            .unwrap()
            .add_property(PropertyDef::scalar("price"))
            .unwrap();
        model
    }

    #[test]
    fn chain_resolves_and_caches() {
        let model = shop();
        let order = model.entity_type("Order").unwrap();
        let a = model.chain(&order, "items.price").unwrap();
        let b = model.chain(&order, "items.price").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.last_property().name(), "price");
    }

    #[test]
    fn chain_reports_unknown_property() {
        let model = shop();
        let order = model.entity_type("Order").unwrap();
        let err = model.chain(&order, "items.nope").unwrap_err();
        assert_eq!(
            err,
            Error::UnresolvedPath {
                root: "Order".into(),
                path: "items.nope".into()
            }
        );
        assert!(model.chain(&order, "items.price.more").is_err());
    }

    #[test]
    fn missing_type_without_loader_is_unresolved() {
        let model = shop();
        let order = model.entity_type("Order").unwrap();
        let result = Rc::new(RefCell::new(None));
        let r = Rc::clone(&result);
        model.property("customer.name", &order, true, move |outcome| {
            *r.borrow_mut() = Some(outcome);
        });
        assert!(matches!(
            result.borrow_mut().take(),
            Some(Err(Error::UnresolvedPath { .. }))
        ));
    }

    struct DeferredLoader {
        pending: Rc<RefCell<Vec<PendingToken>>>,
    }

    impl Loader for DeferredLoader {
        fn load_type(&self, model: &Model, name: &str, done: PendingToken) {
            if name == "Customer" {
                let customer = model.define_type("Customer", None).unwrap();
                customer.add_property(PropertyDef::scalar("name")).unwrap();
            }
            self.pending.borrow_mut().push(done);
        }

        fn load_property(&self, _model: &Model, entity: &Entity, property: &Property, done: PendingToken) {
            property.init_value(entity, Value::from("loaded")).unwrap();
            self.pending.borrow_mut().push(done);
        }
    }

    #[test]
    fn property_waits_for_loader_and_resumes_batch() {
        let model = shop();
        let pending = Rc::new(RefCell::new(Vec::new()));
        model.set_loader(DeferredLoader {
            pending: Rc::clone(&pending),
        });
        let order = model.entity_type("Order").unwrap();

        let batches = model.runtime().batches();
        let batch = batches.start("register");
        let result = Rc::new(RefCell::new(None));
        let (r, m) = (Rc::clone(&result), model.clone());
        model.property("customer.name", &order, true, move |outcome| {
            *r.borrow_mut() = Some((outcome, m.runtime().batches().is_batching()));
        });

        assert!(result.borrow().is_none());
        assert!(!batches.is_batching());
        batches.end(&batch).unwrap();

        let token = pending.borrow_mut().pop().unwrap();
        token.invoke().unwrap();
        let (outcome, was_batching) = result.borrow_mut().take().unwrap();
        assert_eq!(outcome.unwrap().path(), "customer.name");
        assert!(was_batching);
        assert!(!batches.is_batching());
    }

    #[test]
    fn load_runs_done_after_loader_completes() {
        let model = shop();
        let pending = Rc::new(RefCell::new(Vec::new()));
        model.set_loader(DeferredLoader {
            pending: Rc::clone(&pending),
        });
        let line_type = model.entity_type("Line").unwrap();
        let line = Entity::existing(&line_type, "7", Vec::<(&str, Value)>::new()).unwrap();
        let price = line_type.property("price").unwrap();
        assert!(!model.is_loaded(&line, &["price"]).unwrap());

        let done = Rc::new(Cell::new(false));
        let d = Rc::clone(&done);
        model.load(&line, &price, move || d.set(true));
        assert!(!done.get());

        pending.borrow_mut().pop().unwrap().invoke().unwrap();
        assert!(done.get());
        assert!(model.is_loaded(&line, &["price"]).unwrap());
    }

    #[test]
    fn ready_gate_runs_queue_in_order_once() {
        let model = Model::default();
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let l = Rc::clone(&log);
            model.when_ready(move || l.borrow_mut().push(i));
        }
        assert!(log.borrow().is_empty());
        model.ready();
        model.ready();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);

        let l = Rc::clone(&log);
        model.when_ready(move || l.borrow_mut().push(3));
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn weak_handle_does_not_keep_model_alive() {
        let model = Model::default();
        let weak = model.downgrade();
        assert!(weak.upgrade().is_some_and(|m| m.ptr_eq(&model)));
        drop(model);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn define_type_rejects_duplicates_and_unknown_bases() {
        let model = Model::default();
        model.define_type("A", None).unwrap();
        assert!(model.define_type("A", None).is_err());
        assert!(model.define_type("B", Some("Nope")).is_err());
        let c = model.define_type("C", Some("A")).unwrap();
        assert_eq!(c.base().map(EntityType::name), Some("A"));
    }
}
