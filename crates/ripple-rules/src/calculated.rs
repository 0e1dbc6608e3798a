#![forbid(unsafe_code)]

//! Calculated-property rules.

use std::fmt;
use std::rc::Rc;

use ripple_core::{Error, Result};
use ripple_model::{Entity, Value};
use tracing::debug;

use crate::list_diff::list_diff;
use crate::rule::Rule;

pub type Calculation = Rc<dyn Fn(&Entity) -> Result<Value>>;

/// Body of a calculated rule: computes the rule's single return property.
#[derive(Clone)]
pub struct CalculatedRule {
    calculation: Calculation,
    default: Option<Value>,
}

impl fmt::Debug for CalculatedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculatedRule")
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

impl CalculatedRule {
    #[must_use]
    pub fn new(calculation: impl Fn(&Entity) -> Result<Value> + 'static) -> Self {
        Self {
            calculation: Rc::new(calculation),
            default: None,
        }
    }

    /// Store `default` instead of failing when the calculation errors.
    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    #[must_use]
    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub(crate) fn execute(&self, rule: &Rule, target: &Entity) -> Result<()> {
        let properties = rule.return_properties();
        let [property] = properties.as_slice() else {
            return Err(Error::usage(format!(
                "calculated rule '{}' must return exactly one property",
                rule.name()
            )));
        };

        let value = match (self.calculation)(target) {
            Ok(value) => value,
            Err(err) => match &self.default {
                Some(default) => {
                    debug!(rule = rule.name(), target = %target, %err, "calculation failed, storing default");
                    default.clone()
                }
                None => return Err(err),
            },
        };

        if !property.is_list() || !property.is_inited(target) {
            return property.set_value(target, value);
        }
        let new_items = match value {
            Value::List(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(Error::usage(format!(
                    "calculated rule '{}' produced a {} for list property '{property}'",
                    rule.name(),
                    other.kind_name()
                )));
            }
        };
        let current = property.peek(target);
        let old_items = current.as_list().unwrap_or_default();
        match list_diff(old_items, &new_items) {
            Some(splice) => property.splice(target, splice.index, splice.remove, splice.insert),
            None => Ok(()),
        }
    }
}
