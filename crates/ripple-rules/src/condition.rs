#![forbid(unsafe_code)]

//! Condition-assertion rules.
//!
//! The assertion answers "does the condition hold for this target?":
//!
//! - `Some(true)`: the condition is attached. An existing condition with a
//!   different message or property set is removed and re-attached, so
//!   subscribers see a remove/add pair instead of a silent edit.
//! - `Some(false)`: any existing condition is removed.
//! - `None`: cannot tell yet. Treated like `Some(false)` unless the rule
//!   preserves state on unknown, in which case nothing changes.

use std::fmt;
use std::rc::Rc;

use ripple_core::Result;
use ripple_model::{Condition, ConditionType, Entity};
use tracing::{debug, trace};

use crate::rule::Rule;

pub type Assertion = Rc<dyn Fn(&Entity) -> Result<Option<bool>>>;
pub type MessageFn = Rc<dyn Fn(&Entity) -> Result<String>>;

#[derive(Clone)]
enum Message {
    /// The condition type's own message.
    TypeDefault,
    Static(String),
    Computed(MessageFn),
}

/// Body of a condition rule.
#[derive(Clone)]
pub struct ConditionRule {
    condition_type: ConditionType,
    assertion: Assertion,
    message: Message,
    properties: Vec<String>,
    preserve_when_unknown: bool,
}

impl fmt::Debug for ConditionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionRule")
            .field("code", &self.condition_type.code)
            .field("category", &self.condition_type.category)
            .field("properties", &self.properties)
            .field("preserve_when_unknown", &self.preserve_when_unknown)
            .finish()
    }
}

impl ConditionRule {
    #[must_use]
    pub fn new(
        condition_type: ConditionType,
        assertion: impl Fn(&Entity) -> Result<Option<bool>> + 'static,
    ) -> Self {
        Self {
            condition_type,
            assertion: Rc::new(assertion),
            message: Message::TypeDefault,
            properties: Vec::new(),
            preserve_when_unknown: false,
        }
    }

    /// Use a fixed message instead of the condition type's.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Message::Static(message.into());
        self
    }

    /// Compute the message from the target each time the condition is
    /// raised.
    #[must_use]
    pub fn with_computed_message(mut self, message: impl Fn(&Entity) -> Result<String> + 'static) -> Self {
        self.message = Message::Computed(Rc::new(message));
        self
    }

    /// Properties the condition concerns. Defaults to the rule's
    /// dependency paths.
    #[must_use]
    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = properties.into_iter().map(Into::into).collect();
        self
    }

    /// Leave any existing condition in place when the assertion returns
    /// `None`.
    #[must_use]
    pub fn preserve_when_unknown(mut self) -> Self {
        self.preserve_when_unknown = true;
        self
    }

    #[must_use]
    pub fn condition_type(&self) -> &ConditionType {
        &self.condition_type
    }

    pub(crate) fn execute(&self, rule: &Rule, target: &Entity) -> Result<()> {
        let verdict = (self.assertion)(target)?;
        let code = self.condition_type.code.as_str();
        match verdict {
            Some(true) => self.raise(rule, target),
            None if self.preserve_when_unknown => {
                trace!(rule = rule.name(), target = %target, code, "condition undetermined, kept");
                Ok(())
            }
            Some(false) | None => {
                if target.detach_condition(code)?.is_some() {
                    debug!(rule = rule.name(), target = %target, code, "condition cleared");
                }
                Ok(())
            }
        }
    }

    fn raise(&self, rule: &Rule, target: &Entity) -> Result<()> {
        let message = match &self.message {
            Message::TypeDefault => self.condition_type.message.clone(),
            Message::Static(message) => message.clone(),
            Message::Computed(message) => message(target)?,
        };
        let properties = if self.properties.is_empty() {
            rule.predicate_paths()
        } else {
            self.properties.clone()
        };
        let condition = Condition::new(self.condition_type.clone(), message, properties);

        let code = self.condition_type.code.as_str();
        if let Some(existing) = target.condition(code) {
            if existing == condition {
                return Ok(());
            }
            target.detach_condition(code)?;
        }
        debug!(rule = rule.name(), target = %target, code, "condition raised");
        target.attach_condition(condition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::Error;
    use ripple_model::{ConditionChange, EntityType, Model, PropertyDef, Value};
    use std::cell::RefCell;

    fn setup() -> (Model, EntityType) {
        let model = Model::default();
        let person = model.define_type("Person", None).unwrap();
        person.add_property(PropertyDef::scalar("age")).unwrap();
        (model, person)
    }

    fn minor(model: &Model, person: &EntityType, rule: ConditionRule) -> Rule {
        let rule = Rule::condition(model, person, "Person.minor", rule).on_change_of(["age"]);
        rule.register().unwrap();
        rule
    }

    fn age_below_18(entity: &Entity) -> Result<Option<bool>> {
        Ok(entity.get("age")?.as_int().map(|age| age < 18))
    }

    #[test]
    fn attaches_and_clears_with_the_assertion() {
        let (model, person) = setup();
        let kind = ConditionType::warning("Person.minor", "Person is a minor");
        minor(&model, &person, ConditionRule::new(kind, age_below_18));

        let p = model.create("Person").unwrap();
        p.set("age", 12).unwrap();
        let condition = p.condition("Person.minor").unwrap();
        assert_eq!(condition.message, "Person is a minor");
        assert_eq!(condition.properties, vec!["age".to_string()]);
        assert_eq!(p.conditions_for("age").len(), 1);

        p.set("age", 30).unwrap();
        assert!(p.condition("Person.minor").is_none());
    }

    #[test]
    fn unknown_clears_unless_preserved() {
        let (model, person) = setup();
        let kind = ConditionType::warning("Person.minor", "minor");
        minor(&model, &person, ConditionRule::new(kind, age_below_18));
        let p = model.create("Person").unwrap();
        p.set("age", 10).unwrap();
        p.set("age", Value::Null).unwrap();
        assert!(p.condition("Person.minor").is_none());

        let (model, person) = setup();
        let kind = ConditionType::warning("Person.minor", "minor");
        minor(
            &model,
            &person,
            ConditionRule::new(kind, age_below_18).preserve_when_unknown(),
        );
        let p = model.create("Person").unwrap();
        p.set("age", 10).unwrap();
        p.set("age", Value::Null).unwrap();
        assert!(p.condition("Person.minor").is_some());
    }

    #[test]
    fn message_change_is_a_remove_add_pair() {
        let (model, person) = setup();
        let kind = ConditionType::error("Person.minor", "minor");
        let rule = ConditionRule::new(kind, age_below_18)
            .with_computed_message(|entity| {
                let age = entity.peek("age").as_int().unwrap_or_default();
                Ok(format!("age {age} is too low"))
            });
        minor(&model, &person, rule);

        let p = model.create("Person").unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        p.add_conditions_changed(move |change: &ConditionChange| {
            l.borrow_mut().push((change.added, change.condition.message.clone()));
            Ok(())
        });

        p.set("age", 10).unwrap();
        p.set("age", 11).unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                (true, "age 10 is too low".to_string()),
                (false, "age 10 is too low".to_string()),
                (true, "age 11 is too low".to_string()),
            ]
        );
    }

    #[test]
    fn unchanged_condition_is_not_reattached() {
        let (model, person) = setup();
        let kind = ConditionType::error("Person.minor", "minor");
        minor(&model, &person, ConditionRule::new(kind, age_below_18));

        let p = model.create("Person").unwrap();
        let events = Rc::new(RefCell::new(0));
        let e = Rc::clone(&events);
        p.add_conditions_changed(move |_| {
            *e.borrow_mut() += 1;
            Ok(())
        });
        p.set("age", 10).unwrap();
        p.set("age", 11).unwrap();
        assert_eq!(*events.borrow(), 1);
    }

    #[test]
    fn assertion_errors_propagate() {
        let (model, person) = setup();
        let kind = ConditionType::error("Person.broken", "broken");
        let rule = Rule::condition(
            &model,
            &person,
            "Person.broken",
            ConditionRule::new(kind, |_| Err(Error::computation("no data"))),
        )
        .on_change_of(["age"]);
        rule.register().unwrap();

        let p = model.create("Person").unwrap();
        let err = p.set("age", 1).unwrap_err();
        assert_eq!(err.to_string(), "rule 'Person.broken' failed: no data");
    }
}
