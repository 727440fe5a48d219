//! Payload sanitization and point-id normalization for the vector index.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::vector_store::VectorStoreError;

/// Typed payload values accepted by [`crate::VectorStore::upsert`].
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    TextList(Vec<String>),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
}

pub type Payload = BTreeMap<String, PayloadValue>;

impl From<&str> for PayloadValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for PayloadValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for PayloadValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for PayloadValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for PayloadValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for PayloadValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec<String>> for PayloadValue {
    fn from(v: Vec<String>) -> Self {
        Self::TextList(v)
    }
}

fn float_to_json(v: f64) -> serde_json::Value {
    serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

impl PayloadValue {
    /// Convert to the generic representation sent over the wire.
    ///
    /// Typed lists become ordered generic lists, maps are converted
    /// recursively and non-finite floats become null.
    #[must_use]
    pub fn into_json(self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(b),
            Self::Int(i) => Value::Number(i.into()),
            Self::Float(f) => float_to_json(f),
            Self::Text(s) => Value::String(s),
            Self::TextList(v) => Value::Array(v.into_iter().map(Value::String).collect()),
            Self::IntList(v) => Value::Array(v.into_iter().map(|i| Value::Number(i.into())).collect()),
            Self::FloatList(v) => Value::Array(v.into_iter().map(float_to_json).collect()),
            Self::List(v) => Value::Array(v.into_iter().map(Self::into_json).collect()),
            Self::Map(m) => Value::Object(
                m.into_iter()
                    .map(|(k, v)| (k, v.into_json()))
                    .collect(),
            ),
        }
    }
}

/// Flatten a typed payload into the generic map transmitted to the index.
#[must_use]
pub fn sanitize_payload(payload: Payload) -> HashMap<String, serde_json::Value> {
    payload
        .into_iter()
        .map(|(k, v)| (k, v.into_json()))
        .collect()
}

/// A vector index point id: a UUID string or a numeric fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PointId {
    Uuid(String),
    Num(u64),
}

impl PointId {
    /// Normalize a raw id.
    ///
    /// Accepts lexically valid UUIDs (36 chars, 8-4-4-4-12 hex groups),
    /// lowercased, or unsigned integers.
    ///
    /// # Errors
    ///
    /// Returns [`VectorStoreError::InvalidPointId`] for anything else.
    pub fn parse(raw: &str) -> Result<Self, VectorStoreError> {
        let trimmed = raw.trim();
        if is_lexical_uuid(trimmed) {
            return Ok(Self::Uuid(trimmed.to_ascii_lowercase()));
        }
        trimmed
            .parse::<u64>()
            .map(Self::Num)
            .map_err(|_| VectorStoreError::InvalidPointId(raw.to_owned()))
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(u) => f.write_str(u),
            Self::Num(n) => write!(f, "{n}"),
        }
    }
}

fn is_lexical_uuid(s: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    if s.len() != 36 {
        return false;
    }
    let mut parts = s.split('-');
    for len in GROUPS {
        match parts.next() {
            Some(p) if p.len() == len && p.bytes().all(|b| b.is_ascii_hexdigit()) => {}
            _ => return false,
        }
    }
    parts.next().is_none()
}
