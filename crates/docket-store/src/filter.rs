//! Filters, updates, and sort orders evaluated against documents.

use crate::document::{Document, ID_FIELD};
use serde_json::Value;
use std::cmp::Ordering;

/// A predicate over documents.
///
/// A missing field reads as null. Ordered comparisons only match values
/// of the same kind: numbers compare numerically, strings lexically.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    /// Field equals value.
    Eq(String, Value),
    /// Field is less than or equal to value.
    Lte(String, Value),
    /// Field is missing or null.
    IsNull(String),
    /// Every sub-filter matches.
    And(Vec<Filter>),
    /// At least one sub-filter matches.
    Or(Vec<Filter>),
}

impl Filter {
    /// Shorthand for [`Filter::Eq`].
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    /// Shorthand for [`Filter::Lte`].
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte(field.into(), value.into())
    }

    /// Shorthand for [`Filter::IsNull`].
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull(field.into())
    }

    /// Matches the document with the given primary key.
    pub fn by_id(id: impl ToString) -> Self {
        Self::Eq(ID_FIELD.to_string(), Value::String(id.to_string()))
    }

    /// Evaluates the filter against a document.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Eq(field, expected) => {
                let actual = doc.get(field).unwrap_or(&Value::Null);
                match compare_values(actual, expected) {
                    Some(ordering) => ordering == Ordering::Equal,
                    None => actual == expected,
                }
            }
            Self::Lte(field, bound) => doc
                .get(field)
                .and_then(|actual| compare_values(actual, bound))
                .is_some_and(|ordering| ordering != Ordering::Greater),
            Self::IsNull(field) => doc.get(field).map_or(true, Value::is_null),
            Self::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

/// Compares two scalar JSON values of the same kind.
///
/// Returns `None` for mismatched kinds and for arrays or objects.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        _ => None,
    }
}

/// A set of field mutations applied to one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    set: Vec<(String, Value)>,
    inc: Vec<(String, i64)>,
}

impl Update {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a field. Assigning `Value::Null` clears it.
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((field.into(), value.into()));
        self
    }

    /// Adds `by` to an integer field, treating a missing field as zero.
    #[must_use]
    pub fn inc(mut self, field: impl Into<String>, by: i64) -> Self {
        self.inc.push((field.into(), by));
        self
    }

    /// Returns true if the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.inc.is_empty()
    }

    /// Applies the mutations in place. The primary key is never touched.
    pub fn apply(&self, doc: &mut Document) {
        for (field, value) in &self.set {
            if field != ID_FIELD {
                doc.insert(field.clone(), value.clone());
            }
        }
        for (field, by) in &self.inc {
            if field == ID_FIELD {
                continue;
            }
            let current = doc.get(field).and_then(Value::as_i64).unwrap_or(0);
            doc.insert(field.clone(), Value::from(current + by));
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Orders a result set by one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

impl Sort {
    /// Ascending by `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Ascending,
        }
    }

    /// Descending by `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Descending,
        }
    }

    /// Compares two documents under this ordering. Missing values sort first.
    #[must_use]
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let left = a.get(&self.field).unwrap_or(&Value::Null);
        let right = b.get(&self.field).unwrap_or(&Value::Null);
        let ordering = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => compare_values(left, right).unwrap_or(Ordering::Equal),
        };
        match self.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }

    /// Sorts documents in place, keeping the relative order of ties.
    pub fn sort(&self, docs: &mut [Document]) {
        docs.sort_by(|a, b| self.compare(a, b));
    }
}

impl Default for Sort {
    fn default() -> Self {
        Self::asc(ID_FIELD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test documents are objects"),
        }
    }

    #[test]
    fn test_eq_numeric_and_string() {
        let d = doc(json!({"attempts": 2, "queue": "default"}));
        assert!(Filter::eq("attempts", 2).matches(&d));
        assert!(Filter::eq("attempts", 2.0).matches(&d));
        assert!(!Filter::eq("attempts", "2").matches(&d));
        assert!(Filter::eq("queue", "default").matches(&d));
    }

    #[test]
    fn test_eq_null_matches_missing() {
        let d = doc(json!({"queue": "default"}));
        assert!(Filter::eq("reserved_at", Value::Null).matches(&d));
    }

    #[test]
    fn test_lte() {
        let d = doc(json!({"available_at": 100, "reserved_at": null}));
        assert!(Filter::lte("available_at", 100).matches(&d));
        assert!(Filter::lte("available_at", 150).matches(&d));
        assert!(!Filter::lte("available_at", 99).matches(&d));
        assert!(!Filter::lte("reserved_at", 1_000).matches(&d));
        assert!(!Filter::lte("missing", 1_000).matches(&d));
    }

    #[test]
    fn test_is_null() {
        let d = doc(json!({"a": null, "b": 0}));
        assert!(Filter::is_null("a").matches(&d));
        assert!(Filter::is_null("missing").matches(&d));
        assert!(!Filter::is_null("b").matches(&d));
    }

    #[test]
    fn test_and_or() {
        let d = doc(json!({"reserved": false, "available_at": 10}));
        let claimable = Filter::Or(vec![
            Filter::And(vec![
                Filter::eq("reserved", false),
                Filter::lte("available_at", 10),
            ]),
            Filter::lte("reserved_at", 0),
        ]);
        assert!(claimable.matches(&d));
        assert!(!Filter::And(vec![Filter::All, Filter::eq("reserved", true)]).matches(&d));
        assert!(Filter::And(vec![]).matches(&d));
        assert!(!Filter::Or(vec![]).matches(&d));
    }

    #[test]
    fn test_update_apply() {
        let mut d = doc(json!({"_id": "keep", "attempts": 1, "reserved": false}));
        Update::new()
            .set("reserved", true)
            .set("_id", "changed")
            .inc("attempts", 1)
            .inc("fresh", 2)
            .apply(&mut d);

        assert_eq!(d["reserved"], json!(true));
        assert_eq!(d["_id"], json!("keep"));
        assert_eq!(d["attempts"], json!(2));
        assert_eq!(d["fresh"], json!(2));
    }

    #[test]
    fn test_update_set_null_clears() {
        let mut d = doc(json!({"reserved_at": 10}));
        Update::new().set("reserved_at", Value::Null).apply(&mut d);
        assert!(Filter::is_null("reserved_at").matches(&d));
    }

    #[test]
    fn test_sort_desc_and_missing() {
        let mut docs = vec![
            doc(json!({"n": 2})),
            doc(json!({})),
            doc(json!({"n": 5})),
        ];
        Sort::asc("n").sort(&mut docs);
        assert_eq!(docs[0].get("n"), None);
        assert_eq!(docs[2]["n"], json!(5));

        Sort::desc("n").sort(&mut docs);
        assert_eq!(docs[0]["n"], json!(5));
        assert_eq!(docs[2].get("n"), None);
    }
}
