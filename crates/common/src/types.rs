// Core document model shared across all Trellis crates.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Application-level field holding the parent link of a document in a tree.
pub const PARENT_FIELD: &str = "parentId";
/// Application-level field holding the fractional sibling sort key.
pub const ORDER_FIELD: &str = "order";
/// Application-level flag marking documents that currently have children.
pub const HAS_CHILDREN_FIELD: &str = "hasChildren";
/// Sentinel parent id marking top-level documents of a tree.
pub const ROOT_SENTINEL: &str = "__root__";

/// The field map of one document.
pub type Fields = BTreeMap<String, FieldValue>;

/// A JSON-like field value.
///
/// The store accepts only this closed set of kinds; anything that parses as
/// JSON maps onto exactly one variant, so match statements over field values
/// stay exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<FieldValue>),
    Object(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Rank used to order values of different kinds deterministically.
    fn kind_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Number(_) => 2,
            Self::String(_) => 3,
            Self::Array(_) => 4,
            Self::Object(_) => 5,
        }
    }

    /// Total order over field values: same-kind values compare naturally,
    /// mixed kinds compare by kind rank. Numbers use IEEE total ordering so
    /// the comparison never panics on NaN.
    pub fn compare(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Array(a), Self::Array(b)) => {
                for (left, right) in a.iter().zip(b.iter()) {
                    match left.compare(right) {
                        Ordering::Equal => continue,
                        unequal => return unequal,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Self::Object(a), Self::Object(b)) => {
                for ((ak, av), (bk, bv)) in a.iter().zip(b.iter()) {
                    match ak.cmp(bk).then_with(|| av.compare(bv)) {
                        Ordering::Equal => continue,
                        unequal => return unequal,
                    }
                }
                a.len().cmp(&b.len())
            }
            (a, b) => a.kind_rank().cmp(&b.kind_rank()),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Hashable, orderable key derived from a [`FieldValue`].
///
/// Numbers are normalized (`-0.0` folds into `0.0`, NaN into one canonical
/// bit pattern) so equal-looking values land in the same group or index
/// bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKey {
    Null,
    Bool(bool),
    Number(u64),
    Text(String),
    Array(Vec<FieldKey>),
    Object(Vec<(String, FieldKey)>),
}

impl FieldKey {
    pub fn of(value: &FieldValue) -> Self {
        match value {
            FieldValue::Null => Self::Null,
            FieldValue::Bool(b) => Self::Bool(*b),
            FieldValue::Number(n) => Self::Number(normalize_bits(*n)),
            FieldValue::String(s) => Self::Text(s.clone()),
            FieldValue::Array(items) => Self::Array(items.iter().map(Self::of).collect()),
            FieldValue::Object(map) => {
                Self::Object(map.iter().map(|(k, v)| (k.clone(), Self::of(v))).collect())
            }
        }
    }

    pub fn to_value(&self) -> FieldValue {
        match self {
            Self::Null => FieldValue::Null,
            Self::Bool(b) => FieldValue::Bool(*b),
            Self::Number(bits) => FieldValue::Number(f64::from_bits(*bits)),
            Self::Text(s) => FieldValue::String(s.clone()),
            Self::Array(items) => FieldValue::Array(items.iter().map(Self::to_value).collect()),
            Self::Object(entries) => FieldValue::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_value())).collect(),
            ),
        }
    }
}

impl PartialOrd for FieldKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_value().compare(&other.to_value())
    }
}

fn normalize_bits(value: f64) -> u64 {
    if value == 0.0 {
        0.0_f64.to_bits()
    } else if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

/// One addressable record in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self { id: id.into(), fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Fractional sibling sort key, when present and numeric.
    pub fn order(&self) -> Option<f64> {
        self.fields.get(ORDER_FIELD).and_then(FieldValue::as_f64)
    }

    /// Parent link, when present and a string.
    pub fn parent_id(&self) -> Option<&str> {
        self.fields.get(PARENT_FIELD).and_then(FieldValue::as_str)
    }

    pub fn has_children(&self) -> bool {
        self.fields.get(HAS_CHILDREN_FIELD).and_then(FieldValue::as_bool).unwrap_or(false)
    }
}

/// `"collection/docId"` path addressing one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocPath {
    pub collection: String,
    pub doc_id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self { collection: collection.into(), doc_id: doc_id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("document path `{0}` must be `collection/docId`")]
    Malformed(String),
}

impl TryFrom<String> for DocPath {
    type Error = PathError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let mut parts = raw.splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(collection), Some(doc_id)) if !collection.is_empty() && !doc_id.is_empty() => {
                Ok(Self::new(collection, doc_id))
            }
            _ => Err(PathError::Malformed(raw)),
        }
    }
}

impl From<DocPath> for String {
    fn from(path: DocPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.doc_id)
    }
}

/// Advisory lock mode.
///
/// A hard lock excludes every other holder; soft locks coexist with each
/// other but are blocked by a hard lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Soft,
    Hard,
}

/// Identity of one connected client, assigned during the hello handshake.
pub type ClientId = Uuid;
