#![forbid(unsafe_code)]

//! Loader boundary: how a model asks the host for missing metadata or data.
//!
//! Implementations may complete synchronously or hold on to the token and
//! invoke it later (for example from a network callback). The model joins
//! on the token through a [`Barrier`](ripple_core::Barrier), so either works.

use ripple_core::PendingToken;

use crate::entity::Entity;
use crate::model::Model;
use crate::property::Property;

/// Host hook for loading types and property values on demand.
pub trait Loader {
    /// Define the type `name` on `model` (see [`Model::define_type`]), then
    /// invoke `done`. Leaving the type undefined makes the pending path
    /// resolution fail.
    fn load_type(&self, model: &Model, name: &str, done: PendingToken);

    /// Initialize `property` on `entity`, then invoke `done`.
    fn load_property(&self, model: &Model, entity: &Entity, property: &Property, done: PendingToken);
}
