//! Query values and their fingerprints
//!
//! A [`Query`] is an immutable description of a data selection. Two queries are
//! the same live query exactly when their canonical JSON is byte-identical, and
//! the [`Fingerprint`] is a SHA-256 digest of that canonical JSON.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{BridgeError, BridgeResult};

/// A stored record. Records are opaque JSON objects to the bridge.
pub type Item = Value;

/// Sort direction for an ordering term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// One ordering term
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

impl Order {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Description of a data selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Table (collection) the query reads from
    pub table: String,

    /// Predicate in the storage engine's own JSON form
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub filter: Value,

    /// Ordering terms, most significant first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<Order>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl Query {
    /// Select everything from `table`
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Value::Null,
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Decode a query received over the channel
    pub fn from_value(value: Value) -> BridgeResult<Self> {
        if value.is_null() {
            return Err(BridgeError::InvalidQuery("query payload is absent".into()));
        }

        let query: Query = serde_json::from_value(value)
            .map_err(|err| BridgeError::InvalidQuery(err.to_string()))?;

        query.validate()?;
        Ok(query)
    }

    /// Reject queries no storage engine could run
    pub fn validate(&self) -> BridgeResult<()> {
        if self.table.is_empty() {
            return Err(BridgeError::InvalidQuery("query has no table".into()));
        }
        Ok(())
    }

    /// Encode for the channel
    pub fn to_value(&self) -> Value {
        // A derived Serialize over String/Value/Vec/Option cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Canonical serialization: object keys sorted at every depth, no whitespace
    pub fn canonical_json(&self) -> String {
        let mut out = String::new();
        write_canonical(&self.to_value(), &mut out);
        out
    }

    /// Multiplexing key for this query
    pub fn fingerprint(&self) -> Fingerprint {
        let digest = Sha256::digest(self.canonical_json().as_bytes());
        Fingerprint(hex::encode(digest))
    }
}

/// Multiplexing key derived from a query's canonical serialization
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint of `query`
pub fn fingerprint(query: &Query) -> Fingerprint {
    query.fingerprint()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
