//! # homestead-db
//!
//! Reconciles the listing table of a hosted Postgres project. Talks to it over:
//! - **SQL**: direct Postgres connection; can create the table, repair columns and manage policies
//! - **REST**: the PostgREST gateway; can read and insert rows only
//!
//! [`reconcile::reconcile`] is the entry point; [`channel::Backend`] picks the transport.

pub mod channel;
pub mod policy;
pub mod postgres;
pub mod reconcile;
pub mod rest;
pub mod schema;

pub use channel::{Backend, Channel, ChannelKind, Connector, InsertOutcome, SkipReason};
pub use policy::PolicySet;
pub use reconcile::{Inspection, Report, inspect, reconcile};
pub use schema::TableSchema;
