//! Domain models shared by the channels and the reconciler.

pub mod property;

pub use property::{NaturalKey, NewProperty, Property};
