#![forbid(unsafe_code)]

//! Error type shared by every ripple crate.
//!
//! # Taxonomy
//!
//! | Kind | Variants | Raised |
//! |------|----------|--------|
//! | Usage | `TokenReused`, `ScopeInactive`, `BatchEnded`, `Usage` | Synchronously at the call site |
//! | Configuration | `UnresolvedPath` | At rule registration |
//! | Computation | `Computation` | By user code inside rules |
//!
//! Runaway scope transfers are not errors: they are logged and the
//! offending scope is aborted.

use std::fmt;

use crate::batch::BatchId;
use crate::scope::ScopeId;

/// Result alias used throughout ripple.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the engine or by user code running inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A barrier token was invoked more than once.
    TokenReused { barrier: String },
    /// `exit()` or `abort()` was called on a scope that is no longer active.
    ScopeInactive(ScopeId),
    /// `end()` or `resume()` was called on a batch with no labels left.
    BatchEnded(BatchId),
    /// Invalid call shape or configuration.
    Usage(String),
    /// A property path could not be resolved against its root type.
    UnresolvedPath { root: String, path: String },
    /// Failure raised by a rule's computation.
    Computation { rule: String, message: String },
}

impl Error {
    /// Shorthand for [`Error::Usage`].
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Build a computation error from user code. The rule name is filled
    /// in by the engine when the error crosses a rule boundary.
    pub fn computation(message: impl Into<String>) -> Self {
        Self::Computation {
            rule: String::new(),
            message: message.into(),
        }
    }

    /// Attach a rule name to a computation error that has none yet.
    #[must_use]
    pub fn in_rule(self, name: &str) -> Self {
        match self {
            Self::Computation { rule, message } if rule.is_empty() => Self::Computation {
                rule: name.to_string(),
                message,
            },
            other => other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenReused { barrier } => {
                write!(f, "pending token for barrier '{barrier}' invoked more than once")
            }
            Self::ScopeInactive(id) => write!(f, "{id} is not active"),
            Self::BatchEnded(id) => write!(f, "{id} has already ended"),
            Self::Usage(msg) => write!(f, "invalid usage: {msg}"),
            Self::UnresolvedPath { root, path } => {
                write!(f, "cannot resolve path '{path}' from type '{root}'")
            }
            Self::Computation { rule, message } if rule.is_empty() => write!(f, "{message}"),
            Self::Computation { rule, message } => write!(f, "rule '{rule}' failed: {message}"),
        }
    }
}

impl std::error::Error for Error {}
