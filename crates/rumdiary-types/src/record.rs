//! Stored documents.
//!
//! A [`Record`] is one document in one collection: a time-ordered id, the
//! domain fields, and the `createdAt` / `updatedAt` timestamps the store
//! maintains on save. Serialized, a record is a single flat JSON object:
//!
//! ```text
//! { "_id": "0190...", "createdAt": "...", "updatedAt": "...", "hostname": "example.com" }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::RecordId;

/// A plain field map, as supplied by callers and stored by the database.
pub type Document = serde_json::Map<String, Value>;

/// One stored document belonging to exactly one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier; embeds the creation time.
    #[serde(rename = "_id")]
    pub id: RecordId,

    /// Set by the store the first time the record is saved.
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Set by the store on every save.
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Domain fields.
    #[serde(flatten)]
    pub fields: Document,
}

impl Record {
    /// Field names that belong to the record envelope, not to its fields.
    pub const RESERVED_FIELDS: [&'static str; 3] = ["_id", "createdAt", "updatedAt"];

    /// Build a new, unsaved record with a fresh identifier.
    pub fn new(fields: Document) -> Self {
        Self::with_id(RecordId::new(), fields)
    }

    /// Build an unsaved record with a caller-chosen identifier.
    pub const fn with_id(id: RecordId, fields: Document) -> Self {
        Self {
            id,
            created_at: None,
            updated_at: None,
            fields,
        }
    }

    /// Whether the record has never been saved.
    pub const fn is_new(&self) -> bool {
        self.created_at.is_none()
    }

    /// Read a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Set a field, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Overwrite fields with the entries of `patch`.
    pub fn merge(&mut self, patch: &Document) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Stamp the record for a save at `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        self.updated_at = Some(now);
    }
}
