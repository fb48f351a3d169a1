//! Domain records cached by tourcache.
//!
//! - `TouristPlace`, `EnhancedPlace`: the place datasets
//! - `Category`, `City`: reference data
//! - `UserContext`, `UserData`: who the user is and what they saved
//!
//! Every record implements `Cacheable`, which gives the cache and the
//! conflict resolver a record id, timestamps and validation.

pub mod catalog;
pub mod place;
pub mod user;

pub use catalog::{Category, City};
pub use place::{EnhancedPlace, GeoPoint, TouristPlace};
pub use user::{UserContext, UserData};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// A record that can be stored in the cache and reconciled with the remote.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
    /// Unique identifier within its dataset
    fn record_id(&self) -> &str;

    fn updated_at(&self) -> Option<DateTime<Utc>>;

    fn created_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Timestamp used for last-writer-wins: `updatedAt`, falling back to `createdAt`.
    fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at().or_else(|| self.created_at())
    }

    /// Structural checks. Returns a description of the first problem found.
    fn validate(&self) -> Result<(), String>;

    /// Field-level merge with a newer copy. `None` when the record type has
    /// no meaningful merge.
    fn merge(&self, _newer: &Self) -> Option<Self> {
        None
    }
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{} must not be empty", field))
    } else {
        Ok(())
    }
}

fn json_timestamp(value: &Value, fields: &[&str]) -> Option<DateTime<Utc>> {
    fields.iter().find_map(|f| {
        value
            .get(*f)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// Untyped records, as carried in sync queue payloads.
impl Cacheable for Value {
    fn record_id(&self) -> &str {
        self.get("id").and_then(Value::as_str).unwrap_or("")
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        json_timestamp(self, &["updatedAt", "updated_at"])
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        json_timestamp(self, &["createdAt", "created_at"])
    }

    fn validate(&self) -> Result<(), String> {
        if self.is_object() {
            Ok(())
        } else {
            Err("record must be a JSON object".to_string())
        }
    }

    /// Shallow merge: the newer copy's fields win, fields only the older copy
    /// has are kept.
    fn merge(&self, newer: &Self) -> Option<Self> {
        let (Value::Object(older), Value::Object(newer)) = (self, newer) else {
            return None;
        };
        let mut merged = older.clone();
        for (k, v) in newer {
            merged.insert(k.clone(), v.clone());
        }
        Some(Value::Object(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_record_timestamps() {
        let v = json!({ "id": "a", "updatedAt": "2024-03-01T10:00:00Z" });
        assert_eq!(v.record_id(), "a");
        assert_eq!(
            v.modified_at().unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );

        let created_only = json!({ "id": "b", "created_at": "2024-01-01T00:00:00Z" });
        assert!(created_only.updated_at().is_none());
        assert!(created_only.modified_at().is_some());
    }

    #[test]
    fn test_json_merge_keeps_older_only_fields() {
        let older = json!({ "id": "a", "name": "Old", "notes": "keep me" });
        let newer = json!({ "id": "a", "name": "New" });
        let merged = older.merge(&newer).unwrap();
        assert_eq!(merged, json!({ "id": "a", "name": "New", "notes": "keep me" }));

        assert!(json!([1, 2]).merge(&newer).is_none());
    }
}
