#![forbid(unsafe_code)]

//! Built-in validation rules.
//!
//! Each constructor returns an unregistered condition rule on `root` that
//! runs on init and whenever `property` changes, raising an error condition
//! coded `Type.property.Kind` while the value is invalid. A missing value
//! only violates [`required`]; the other validators accept it.

use ripple_model::{ConditionType, Entity, EntityType, Model, Value};

use crate::condition::ConditionRule;
use crate::rule::Rule;

fn validation_rule(
    model: &Model,
    root: &EntityType,
    property: &str,
    kind: &str,
    message: String,
    assertion: impl Fn(&Value) -> Option<bool> + 'static,
) -> Rule {
    let code = format!("{}.{property}.{kind}", root.name());
    let name = property.to_string();
    let body = ConditionRule::new(ConditionType::error(code.clone(), message), move |entity: &Entity| {
        Ok(assertion(&entity.get(&name)?))
    })
    .with_properties([property]);
    Rule::condition(model, root, code, body)
        .on_init()
        .on_change_of([property])
}

fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Text(text) => text.trim().is_empty(),
        Value::List(items) => items.is_empty(),
        _ => false,
    }
}

/// `property` must have a value: not null, blank text, or an empty list.
#[must_use]
pub fn required(model: &Model, root: &EntityType, property: &str) -> Rule {
    validation_rule(
        model,
        root,
        property,
        "Required",
        format!("{property} is required"),
        |value| Some(is_missing(value)),
    )
}

/// Numeric `property` must lie within `min..=max`. Non-numeric values
/// cannot be judged and clear the condition.
#[must_use]
pub fn range(model: &Model, root: &EntityType, property: &str, min: Option<f64>, max: Option<f64>) -> Rule {
    let message = match (min, max) {
        (Some(min), Some(max)) => format!("{property} must be between {min} and {max}"),
        (Some(min), None) => format!("{property} must be at least {min}"),
        (None, Some(max)) => format!("{property} must be at most {max}"),
        (None, None) => format!("{property} is out of range"),
    };
    validation_rule(model, root, property, "Range", message, move |value| {
        if value.is_null() {
            return Some(false);
        }
        let number = value.as_f64()?;
        Some(min.is_some_and(|min| number < min) || max.is_some_and(|max| number > max))
    })
}

/// Text `property` must have between `min` and `max` characters.
#[must_use]
pub fn string_length(
    model: &Model,
    root: &EntityType,
    property: &str,
    min: Option<usize>,
    max: Option<usize>,
) -> Rule {
    let message = match (min, max) {
        (Some(min), Some(max)) => format!("{property} must be {min} to {max} characters long"),
        (Some(min), None) => format!("{property} must be at least {min} characters long"),
        (None, Some(max)) => format!("{property} must be at most {max} characters long"),
        (None, None) => format!("{property} has an invalid length"),
    };
    validation_rule(model, root, property, "StringLength", message, move |value| {
        if value.is_null() {
            return Some(false);
        }
        let length = value.as_text()?.chars().count();
        Some(min.is_some_and(|min| length < min) || max.is_some_and(|max| length > max))
    })
}

/// `property` must be one of `allowed`; for list properties, every item.
#[must_use]
pub fn allowed_values(model: &Model, root: &EntityType, property: &str, allowed: Vec<Value>) -> Rule {
    let message = format!("{property} has a value that is not allowed");
    validation_rule(model, root, property, "AllowedValues", message, move |value| {
        let invalid = |item: &Value| !allowed.contains(item);
        Some(match value {
            Value::Null => false,
            Value::List(items) => items.iter().any(invalid),
            other => invalid(other),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_model::PropertyDef;

    fn setup() -> (Model, EntityType) {
        let model = Model::default();
        let user = model.define_type("User", None).unwrap();
        user.add_property(PropertyDef::scalar("name")).unwrap();
        user.add_property(PropertyDef::scalar("age")).unwrap();
        user.add_property(PropertyDef::scalar("role").with_default("guest")).unwrap();
        (model, user)
    }

    #[test]
    fn required_flags_missing_values_from_init() {
        let (model, user) = setup();
        required(&model, &user, "name").register().unwrap();

        let u = model.create("User").unwrap();
        let condition = u.condition("User.name.Required").unwrap();
        assert_eq!(condition.message, "name is required");
        assert!(condition.concerns("name"));

        u.set("name", "   ").unwrap();
        assert!(u.condition("User.name.Required").is_some());
        u.set("name", "Ada").unwrap();
        assert!(u.conditions().is_empty());
    }

    #[test]
    fn range_checks_numbers_and_ignores_null() {
        let (model, user) = setup();
        range(&model, &user, "age", Some(0.0), Some(150.0))
            .register()
            .unwrap();

        let u = model.create("User").unwrap();
        assert!(u.conditions().is_empty());
        u.set("age", 200).unwrap();
        let condition = u.condition("User.age.Range").unwrap();
        assert_eq!(condition.message, "age must be between 0 and 150");
        u.set("age", 42.5).unwrap();
        assert!(u.conditions().is_empty());
        u.set("age", -1).unwrap();
        assert!(u.condition("User.age.Range").is_some());
    }

    #[test]
    fn string_length_counts_characters() {
        let (model, user) = setup();
        string_length(&model, &user, "name", Some(2), Some(4))
            .register()
            .unwrap();

        let u = model.create("User").unwrap();
        u.set("name", "é").unwrap();
        assert!(u.condition("User.name.StringLength").is_some());
        u.set("name", "éé").unwrap();
        assert!(u.conditions().is_empty());
        u.set("name", "abcde").unwrap();
        assert!(u.condition("User.name.StringLength").is_some());
    }

    #[test]
    fn allowed_values_checks_membership() {
        let (model, user) = setup();
        allowed_values(
            &model,
            &user,
            "role",
            vec![Value::from("guest"), Value::from("admin")],
        )
        .register()
        .unwrap();

        let u = model.create("User").unwrap();
        assert!(u.conditions().is_empty());
        u.set("role", "root").unwrap();
        assert!(u.condition("User.role.AllowedValues").is_some());
        u.set("role", "admin").unwrap();
        assert!(u.conditions().is_empty());
    }

    #[test]
    fn existing_entities_are_validated_on_load() {
        let (model, user) = setup();
        required(&model, &user, "name").register().unwrap();
        let u = Entity::existing(&user, "u1", [("name", Value::from(""))]).unwrap();
        assert!(u.condition("User.name.Required").is_some());
    }
}
