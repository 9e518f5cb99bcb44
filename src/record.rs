//! Record data model.
//!
//! Stores hand the engine schema-less [`Document`]s; a [`RecordSchema`]
//! turns them into typed [`Record`]s (identity + version + payload) or
//! rejects them as [`MalformedRecord`].
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use sync_bridge::record::{Document, FieldKind, FieldValue, IdKind, RecordSchema};
//!
//! let schema = RecordSchema {
//!     id_field: "id".into(),
//!     id_kind: IdKind::String,
//!     version_field: "version".into(),
//!     sync_fields: BTreeMap::from([("name".to_string(), FieldKind::String)]),
//! };
//!
//! let mut doc = Document::new();
//! doc.insert("id".into(), FieldValue::Str("user.1".into()));
//! doc.insert("version".into(), FieldValue::Int(7));
//! doc.insert("name".into(), FieldValue::Str("Alice".into()));
//!
//! let record = schema.extract(&doc).unwrap();
//! assert_eq!(record.version, 7);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scalar kinds a synchronized payload field may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Int,
    Float,
    String,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::String => write!(f, "string"),
        }
    }
}

/// How the identity is typed in the wide-column store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    #[default]
    String,
    Uuid,
}

/// A single field value as stored on either side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    /// Convert from JSON (document store `_source`). Non-scalar values yield `None`.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::Str(s) => Value::String(s.clone()),
        }
    }

    /// Coerce to the declared kind. Ints widen to floats; nothing else converts.
    fn coerce(&self, kind: FieldKind) -> Option<Self> {
        match (self, kind) {
            (Self::Null, _) => Some(Self::Null),
            (Self::Int(i), FieldKind::Int) => Some(Self::Int(*i)),
            (Self::Int(i), FieldKind::Float) => Some(Self::Float(*i as f64)),
            (Self::Float(f), FieldKind::Float) => Some(Self::Float(*f)),
            (Self::Str(s), FieldKind::String) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    fn approx_size(&self) -> usize {
        match self {
            Self::Str(s) => s.len(),
            _ => 8,
        }
    }
}

/// Raw, untyped row/document as produced by a store.
pub type Document = BTreeMap<String, FieldValue>;

/// A validated record: identity, version and the synchronized payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Strictly increasing per logical update; sole conflict-resolution signal
    pub version: i64,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(id: impl Into<String>, version: i64) -> Self {
        Self {
            id: id.into(),
            version,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Rough in-memory size, used for byte-based batch thresholds.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        self.id.len()
            + 8
            + self
                .fields
                .iter()
                .map(|(k, v)| k.len() + v.approx_size())
                .sum::<usize>()
    }
}

/// Why a document could not be turned into a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    pub id: Option<String>,
    pub reason: String,
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(ref id) => write!(f, "malformed record '{}': {}", id, self.reason),
            None => write!(f, "malformed record: {}", self.reason),
        }
    }
}

impl std::error::Error for MalformedRecord {}

/// Field layout shared by both stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    pub id_field: String,
    pub id_kind: IdKind,
    pub version_field: String,
    pub sync_fields: BTreeMap<String, FieldKind>,
}

impl RecordSchema {
    /// Identity, version, then payload columns, in a stable order.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        let mut cols = vec![self.id_field.as_str(), self.version_field.as_str()];
        cols.extend(self.sync_fields.keys().map(String::as_str));
        cols
    }

    /// Validate a raw document and project it onto the synchronized fields.
    ///
    /// Missing payload fields become [`FieldValue::Null`]; a missing identity,
    /// a missing or negative version, or a kind mismatch is malformed.
    pub fn extract(&self, doc: &Document) -> Result<Record, MalformedRecord> {
        let id = match doc.get(&self.id_field) {
            Some(FieldValue::Str(s)) if !s.is_empty() => s.clone(),
            Some(FieldValue::Int(i)) if self.id_kind == IdKind::String => i.to_string(),
            _ => {
                return Err(MalformedRecord {
                    id: None,
                    reason: format!("missing identity field '{}'", self.id_field),
                })
            }
        };
        if self.id_kind == IdKind::Uuid && uuid::Uuid::parse_str(&id).is_err() {
            return Err(MalformedRecord {
                id: Some(id),
                reason: "identity is not a UUID".to_string(),
            });
        }

        let version = match doc.get(&self.version_field) {
            Some(FieldValue::Int(v)) if *v >= 0 => *v,
            Some(FieldValue::Int(v)) => {
                return Err(MalformedRecord {
                    id: Some(id),
                    reason: format!("negative version {}", v),
                })
            }
            _ => {
                return Err(MalformedRecord {
                    id: Some(id),
                    reason: format!("missing integer version field '{}'", self.version_field),
                })
            }
        };

        let mut fields = BTreeMap::new();
        for (name, kind) in &self.sync_fields {
            let value = match doc.get(name) {
                None => FieldValue::Null,
                Some(raw) => raw.coerce(*kind).ok_or_else(|| MalformedRecord {
                    id: Some(id.clone()),
                    reason: format!("field '{}' is not of kind {}", name, kind),
                })?,
            };
            fields.insert(name.clone(), value);
        }

        Ok(Record { id, version, fields })
    }

    /// Inverse of [`extract`](Self::extract): the document written to a store.
    #[must_use]
    pub fn to_document(&self, record: &Record) -> Document {
        let mut doc = Document::new();
        doc.insert(self.id_field.clone(), FieldValue::Str(record.id.clone()));
        doc.insert(self.version_field.clone(), FieldValue::Int(record.version));
        for name in self.sync_fields.keys() {
            let value = record.fields.get(name).cloned().unwrap_or(FieldValue::Null);
            doc.insert(name.clone(), value);
        }
        doc
    }

    /// Document as a JSON object (document store `_source`).
    #[must_use]
    pub fn to_json(&self, record: &Record) -> Value {
        let map: serde_json::Map<String, Value> = self
            .to_document(record)
            .into_iter()
            .map(|(k, v)| (k, v.to_json()))
            .collect();
        Value::Object(map)
    }

    /// Parse a JSON object into a raw document; non-scalar members are dropped.
    #[must_use]
    pub fn document_from_json(value: &Value) -> Document {
        let mut doc = Document::new();
        if let Value::Object(map) = value {
            for (k, v) in map {
                if let Some(fv) = FieldValue::from_json(v) {
                    doc.insert(k.clone(), fv);
                }
            }
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> RecordSchema {
        RecordSchema {
            id_field: "id".into(),
            id_kind: IdKind::String,
            version_field: "version".into(),
            sync_fields: BTreeMap::from([
                ("data_int".to_string(), FieldKind::Int),
                ("data_float".to_string(), FieldKind::Float),
                ("data_str".to_string(), FieldKind::String),
            ]),
        }
    }

    fn doc(pairs: &[(&str, FieldValue)]) -> Document {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_extract_valid() {
        let d = doc(&[
            ("id", FieldValue::Str("a".into())),
            ("version", FieldValue::Int(3)),
            ("data_int", FieldValue::Int(1)),
            ("data_float", FieldValue::Int(2)),
            ("data_str", FieldValue::Str("x".into())),
            ("ignored", FieldValue::Str("not synced".into())),
        ]);
        let record = schema().extract(&d).unwrap();
        assert_eq!(record.id, "a");
        assert_eq!(record.version, 3);
        // int widened to float
        assert_eq!(record.fields["data_float"], FieldValue::Float(2.0));
        assert!(!record.fields.contains_key("ignored"));
    }

    #[test]
    fn test_missing_payload_field_is_null() {
        let d = doc(&[("id", FieldValue::Str("a".into())), ("version", FieldValue::Int(1))]);
        let record = schema().extract(&d).unwrap();
        assert_eq!(record.fields["data_str"], FieldValue::Null);
    }

    #[test]
    fn test_missing_identity_is_malformed() {
        let d = doc(&[("version", FieldValue::Int(1))]);
        let err = schema().extract(&d).unwrap_err();
        assert!(err.id.is_none());
        assert!(err.reason.contains("identity"));
    }

    #[test]
    fn test_missing_or_negative_version_is_malformed() {
        let d = doc(&[("id", FieldValue::Str("a".into()))]);
        assert!(schema().extract(&d).is_err());

        let d = doc(&[("id", FieldValue::Str("a".into())), ("version", FieldValue::Int(-4))]);
        let err = schema().extract(&d).unwrap_err();
        assert_eq!(err.id.as_deref(), Some("a"));
    }

    #[test]
    fn test_kind_mismatch_is_malformed() {
        let d = doc(&[
            ("id", FieldValue::Str("a".into())),
            ("version", FieldValue::Int(1)),
            ("data_int", FieldValue::Str("seven".into())),
        ]);
        let err = schema().extract(&d).unwrap_err();
        assert!(err.reason.contains("data_int"));
    }

    #[test]
    fn test_uuid_identity_validated() {
        let mut s = schema();
        s.id_kind = IdKind::Uuid;
        let bad = doc(&[("id", FieldValue::Str("nope".into())), ("version", FieldValue::Int(1))]);
        assert!(s.extract(&bad).is_err());

        let id = uuid::Uuid::new_v4().to_string();
        let good = doc(&[("id", FieldValue::Str(id.clone())), ("version", FieldValue::Int(1))]);
        assert_eq!(s.extract(&good).unwrap().id, id);
    }

    #[test]
    fn test_json_document_conversion() {
        let s = schema();
        let value = json!({"id": "a", "version": 9, "data_float": 1.5, "nested": {"x": 1}});
        let d = RecordSchema::document_from_json(&value);
        assert!(!d.contains_key("nested"));

        let record = s.extract(&d).unwrap();
        let back = s.to_json(&record);
        assert_eq!(back["version"], 9);
        assert_eq!(back["data_float"], 1.5);
        assert_eq!(back["data_str"], Value::Null);
    }

    #[test]
    fn test_columns_order() {
        assert_eq!(schema().columns(), vec!["id", "version", "data_float", "data_int", "data_str"]);
    }
}
