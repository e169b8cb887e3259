//! # homestead-common
//!
//! Shared configuration, error taxonomy and the property model used by the
//! homestead crates. No network I/O lives here.

pub mod config;
pub mod error;
pub mod models;
pub mod validation;
