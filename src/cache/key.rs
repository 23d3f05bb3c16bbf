//! Structured query keys and their canonical string form
//!
//! A query is identified by an ordered list of JSON values, e.g.
//! `["todos", {"status": "done", "page": 2}]`. Two keys that differ only in
//! the property order of their objects name the same query, so every key is
//! reduced to a canonical string before it reaches the cache engine:
//! objects have their properties sorted by name (recursively), arrays keep
//! their order.

use crate::cache::types::CacheKey;
use crate::error::{CacheError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// Structured identifier of a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryKey {
    parts: Vec<Value>,
}

impl QueryKey {
    /// Create an empty key
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a part to the key
    pub fn push(mut self, part: impl Into<Value>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// Append any serializable value to the key
    pub fn try_push<S: Serialize>(mut self, part: &S) -> Result<Self> {
        self.parts.push(serde_json::to_value(part)?);
        Ok(self)
    }

    /// The key parts in order
    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    /// Number of parts
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Check if the key has no parts
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The canonical cache key for this query
    pub fn hash(&self) -> CacheKey {
        let canonical = Value::Array(self.parts.iter().map(canonicalize).collect());
        canonical.to_string()
    }

    /// Parse a canonical cache key back into a query key
    pub fn from_hash(hash: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(hash)? {
            Value::Array(parts) => Ok(Self { parts }),
            other => Err(CacheError::SerializationError(format!(
                "cache key is not a JSON array: {}",
                other
            ))),
        }
    }

    /// Check whether every part of `self` matches the leading parts of `other`
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        self.parts.len() <= other.parts.len()
            && self
                .parts
                .iter()
                .zip(&other.parts)
                .all(|(a, b)| canonicalize(a) == canonicalize(b))
    }
}

/// Rebuild a value with the properties of every object sorted by name
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash())
    }
}

impl From<&str> for QueryKey {
    fn from(s: &str) -> Self {
        QueryKey::new().push(s)
    }
}

impl From<String> for QueryKey {
    fn from(s: String) -> Self {
        QueryKey::new().push(s)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self { parts }
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(key: &QueryKey) -> Self {
        key.clone()
    }
}

/// Build a [`QueryKey`] from JSON-like parts
///
/// ```
/// use ouroboros_query::query_key;
///
/// let a = query_key!["todos", { "page": 1, "status": "open" }];
/// let b = query_key!["todos", { "status": "open", "page": 1 }];
/// assert_eq!(a.hash(), b.hash());
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:tt),* $(,)?) => {
        $crate::cache::QueryKey::from(vec![$($crate::__serde_json::json!($part)),*])
    };
}
