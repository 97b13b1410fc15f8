//! Identifiers for client groups, clients, queries, and rows.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_128;

/// Cohort of clients sharing one view record.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientGroupId(String);

/// One sync endpoint (e.g. a browser tab) inside a client group.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

/// Hash identifying a registered query. Clients address queries by this
/// hash; the AST travels alongside it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(String);

macro_rules! string_id {
    ($name:ident, $label:literal) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                if value.is_empty() {
                    return Err(IdError::Empty { kind: $label });
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(ClientGroupId, "client group id");
string_id!(ClientId, "client id");
string_id!(QueryHash, "query hash");

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },
    #[error("row key must not be empty")]
    EmptyRowKey,
    #[error("row key column {column:?} carries unsupported value")]
    UnsupportedKeyValue { column: String },
}

/// Primary-key columns and values identifying one upstream row.
///
/// Identity (equality, ordering, hashing) is defined by the canonical JSON
/// rendering with columns in sorted order, so a `RowKey` can key a map no
/// matter how the columns were supplied.
#[derive(Clone)]
pub struct RowKey {
    entries: BTreeMap<String, Value>,
    canonical: String,
}

impl RowKey {
    pub fn new(entries: BTreeMap<String, Value>) -> Result<Self, IdError> {
        if entries.is_empty() {
            return Err(IdError::EmptyRowKey);
        }
        for (column, value) in &entries {
            match value {
                Value::Null | Value::Array(_) | Value::Object(_) => {
                    return Err(IdError::UnsupportedKeyValue {
                        column: column.clone(),
                    });
                }
                _ => {}
            }
        }
        let canonical =
            serde_json::to_string(&entries).expect("string/number/bool map serializes");
        Ok(Self { entries, canonical })
    }

    pub fn single(column: impl Into<String>, value: Value) -> Result<Self, IdError> {
        let mut entries = BTreeMap::new();
        entries.insert(column.into(), value);
        Self::new(entries)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.entries.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn canonical_json(&self) -> &str {
        &self.canonical
    }

    pub fn parse_canonical(json: &str) -> Result<Self, serde_json::Error> {
        let entries: BTreeMap<String, Value> = serde_json::from_str(json)?;
        Ok(Self {
            canonical: serde_json::to_string(&entries).expect("reserialize parsed map"),
            entries,
        })
    }
}

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for RowKey {}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl std::hash::Hash for RowKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl Serialize for RowKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RowKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Self::new(entries).map_err(serde::de::Error::custom)
    }
}

/// Logical identity of a row: schema, table, and primary key values.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId {
    pub schema: String,
    pub table: String,
    pub row_key: RowKey,
}

impl RowId {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, row_key: RowKey) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            row_key,
        }
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}[{:?}]", self.schema, self.table, self.row_key)
    }
}

/// Derives the client-visible identifier for a row.
///
/// A single-column key passes the primitive through as a string; composite
/// keys hash the JSON array of values in primary-key order with xxh3-128.
pub fn client_row_id(table: &str, primary_key: &[String], key: &RowKey) -> Option<String> {
    if let [only] = primary_key {
        let value = key.get(only)?;
        return Some(format!("e/{}/{}", table, primitive_string(value)));
    }
    let mut values = Vec::with_capacity(primary_key.len());
    for column in primary_key {
        values.push(key.get(column)?.clone());
    }
    let encoded = serde_json::to_string(&values).expect("key values serialize");
    Some(format!(
        "e/{}/{:032x}",
        table,
        xxh3_128(encoded.as_bytes())
    ))
}

fn primitive_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
