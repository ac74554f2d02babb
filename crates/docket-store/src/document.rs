//! Stored document representation.

use docket_core::{DocketError, DocketResult, DocumentId};
use serde_json::{Map, Value};

/// A stored document: a JSON object keyed by field name.
pub type Document = Map<String, Value>;

/// Primary key field present on every stored document.
pub const ID_FIELD: &str = "_id";

/// Typed accessors over a [`Document`].
pub trait DocumentExt {
    /// Returns the document's primary key, if present and well formed.
    fn id(&self) -> Option<DocumentId>;

    /// Returns the primary key, assigning a fresh one when missing.
    fn ensure_id(&mut self) -> DocketResult<DocumentId>;

    /// Reads an integer field.
    fn get_i64(&self, field: &str) -> Option<i64>;

    /// Reads a string field.
    fn get_str(&self, field: &str) -> Option<&str>;

    /// Reads a boolean field. Missing or null reads as `false`.
    fn get_flag(&self, field: &str) -> bool;
}

impl DocumentExt for Document {
    fn id(&self) -> Option<DocumentId> {
        self.get(ID_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| DocumentId::parse(s).ok())
    }

    fn ensure_id(&mut self) -> DocketResult<DocumentId> {
        match self.get(ID_FIELD) {
            None | Some(Value::Null) => {
                let id = DocumentId::new();
                self.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
                Ok(id)
            }
            Some(_) => self.id().ok_or_else(|| {
                DocketError::Serialization(format!("Malformed {ID_FIELD} on document"))
            }),
        }
    }

    fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    fn get_flag(&self, field: &str) -> bool {
        self.get(field).and_then(Value::as_bool).unwrap_or(false)
    }
}
