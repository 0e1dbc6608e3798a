#![forbid(unsafe_code)]

//! Conditions: validation results and other flags attached to entities.

use std::fmt;

use crate::entity::Entity;

/// Severity class of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionCategory {
    Error,
    Warning,
    Permission,
}

impl fmt::Display for ConditionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Permission => "permission",
        })
    }
}

/// A kind of condition, identified by its code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionType {
    pub code: String,
    pub category: ConditionCategory,
    /// Message used when the raising rule supplies none.
    pub message: String,
}

impl ConditionType {
    #[must_use]
    pub fn new(code: impl Into<String>, category: ConditionCategory, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            category,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, ConditionCategory::Error, message)
    }

    #[must_use]
    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, ConditionCategory::Warning, message)
    }

    #[must_use]
    pub fn permission(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, ConditionCategory::Permission, message)
    }
}

/// A condition present on one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub condition_type: ConditionType,
    pub message: String,
    /// Names of the properties the condition concerns.
    pub properties: Vec<String>,
}

impl Condition {
    #[must_use]
    pub fn new(condition_type: ConditionType, message: impl Into<String>, properties: Vec<String>) -> Self {
        Self {
            condition_type,
            message: message.into(),
            properties,
        }
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.condition_type.code
    }

    #[must_use]
    pub fn concerns(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p == property)
    }
}

/// Argument of an entity's conditions-changed event.
#[derive(Debug, Clone)]
pub struct ConditionChange {
    pub entity: Entity,
    pub condition: Condition,
    /// `true` when attached, `false` when removed.
    pub added: bool,
}
