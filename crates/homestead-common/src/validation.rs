//! Input validation utilities.
//!
//! Seed records are checked here before any connection is opened.

use std::collections::HashMap;

use validator::Validate;

use crate::error::{ReconcileError, ReconcileResult};
use crate::models::NewProperty;

/// Validate every seed record, reporting the first invalid one by 1-based position.
///
/// Records that collide on `key_columns` are rejected too: the second copy
/// could never be inserted, so the seed file is wrong.
pub fn validate_records(records: &[NewProperty], key_columns: &[String]) -> ReconcileResult<()> {
    let mut seen = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        let position = index + 1;
        record
            .validate()
            .map_err(|e| ReconcileError::InvalidRecord {
                position,
                message: format_validation_errors(e),
            })?;

        if key_columns.is_empty() {
            continue;
        }
        if let Some(first) = seen.insert(record.natural_key(key_columns), position) {
            return Err(ReconcileError::InvalidRecord {
                position,
                message: format!(
                    "same {} as record #{first}",
                    key_columns.join(" + ")
                ),
            });
        }
    }
    Ok(())
}

/// Format validation errors into a human-readable string.
fn format_validation_errors(errors: validator::ValidationErrors) -> String {
    let mut messages = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                let msg = e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("invalid value for '{field}'"));
                if msg.starts_with(&**field) {
                    msg
                } else {
                    format!("{field} {msg}")
                }
            })
        })
        .collect::<Vec<_>>();
    messages.sort();
    messages.join("; ")
}
