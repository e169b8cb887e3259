//! Property model: one listing on the site.
//!
//! [`NewProperty`] is what a seed file supplies; [`Property`] is a row as the
//! database returns it, with the server-assigned id and timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn default_status() -> String {
    "available".into()
}

/// A listing to insert. Field names match the table columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct NewProperty {
    #[validate(custom(function = "not_blank"))]
    pub title: String,

    /// Price in the currency's minor unit (VND has no subdivision).
    #[validate(range(min = 0, message = "price must not be negative"))]
    pub price: i64,

    #[validate(custom(function = "not_blank"))]
    pub location: String,

    #[serde(default)]
    #[validate(range(min = 0, message = "bedrooms must not be negative"))]
    pub bedrooms: i32,

    #[serde(default)]
    #[validate(range(min = 0, message = "bathrooms must not be negative"))]
    pub bathrooms: i32,

    /// Floor or lot area in square metres.
    #[validate(range(min = 1, message = "area must be greater than zero"))]
    pub area: i32,

    #[validate(url(message = "image_url must be an absolute URL"))]
    pub image_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Listing category (Villa, Apartment, Land, ...).
    #[serde(rename = "type")]
    #[validate(custom(function = "not_blank"))]
    pub kind: String,

    #[serde(default = "default_status")]
    #[validate(custom(function = "not_blank"))]
    pub status: String,
}

impl NewProperty {
    /// Values of `columns` for this record, as the natural-key tuple.
    pub fn natural_key(&self, columns: &[String]) -> NaturalKey {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => NaturalKey::from_columns(&map, columns),
            _ => NaturalKey(Vec::new()),
        }
    }
}

/// A row of the `properties` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Property {
    pub id: Uuid,
    pub title: String,
    pub price: i64,
    pub location: String,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<i32>,
    pub area: i32,
    pub image_url: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub kind: String,
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Text rendering of the unique-key columns of a row, in key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey(pub Vec<String>);

impl NaturalKey {
    /// Extract the key from a JSON object (REST responses, serialized records).
    pub fn from_columns(row: &serde_json::Map<String, Value>, columns: &[String]) -> Self {
        Self(
            columns
                .iter()
                .map(|column| row.get(column).map(key_text).unwrap_or_default())
                .collect(),
        )
    }
}

fn key_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank").with_message("must not be empty".into()));
    }
    Ok(())
}
