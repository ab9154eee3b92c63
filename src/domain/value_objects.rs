//! Value Objects - Immutable domain primitives
//!
//! Records, selectors, connectivity snapshots and resolution strategies.
//! They are identified by their value and can be freely shared.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A schemaless record as stored locally and remotely.
pub type Record = Map<String, Value>;

/// Field holding a record's identity.
pub const ID_FIELD: &str = "id";

/// Render a record's identity as a string.
///
/// Strings are returned verbatim, numbers in their decimal form.
/// Any other type (or a missing field) has no identity.
pub fn record_id(record: &Record) -> Option<String> {
    value_to_id(record.get(ID_FIELD)?)
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read a timestamp field from a record.
///
/// Accepts RFC 3339 strings and epoch milliseconds.
pub fn record_timestamp(record: &Record, field: &str) -> Option<DateTime<Utc>> {
    match record.get(field)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Read a numeric version counter from a record.
pub fn record_version(record: &Record, field: &str) -> Option<i64> {
    match record.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Shallow-merge `patch` into `base`; fields in `patch` win.
pub fn merge_records(base: &Record, patch: &Record) -> Record {
    let mut merged = base.clone();
    for (k, v) in patch {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Key/value equality filter identifying target records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector(pub BTreeMap<String, Value>);

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector matching a single record by identity.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().and(ID_FIELD, Value::String(id.into()))
    }

    /// Add an equality condition.
    pub fn and(mut self, field: impl Into<String>, value: Value) -> Self {
        self.0.insert(field.into(), value);
        self
    }

    /// Identity targeted by this selector, if it filters on `id`.
    pub fn id(&self) -> Option<String> {
        self.0.get(ID_FIELD).and_then(value_to_id)
    }

    /// Check whether a record satisfies every condition.
    ///
    /// `id` compares by rendered identity so `"7"` matches `7`.
    pub fn matches(&self, record: &Record) -> bool {
        self.0.iter().all(|(field, expected)| {
            if field == ID_FIELD {
                return value_to_id(expected).is_some() && value_to_id(expected) == record_id(record);
            }
            record.get(field) == Some(expected)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Connectivity snapshot delivered by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// Whether the remote is believed reachable
    pub online: bool,
    /// Link type reported by the host (e.g. "4g", "wifi")
    pub effective_type: Option<String>,
    /// Round-trip estimate in milliseconds
    pub rtt_ms: Option<u64>,
}

impl NetworkStatus {
    pub fn online() -> Self {
        Self {
            online: true,
            ..Default::default()
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }
}

/// Per-field rule for the field-level strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRule {
    /// Keep the local value
    ClientWins,
    /// Keep the remote value
    ServerWins,
    /// Keep the value from whichever snapshot was modified last
    Latest,
}

/// Caller-supplied resolver: `(local, remote, conflicting_fields) -> record`.
pub type CustomResolver = Arc<dyn Fn(&Record, Option<&Record>, &[String]) -> Record + Send + Sync>;

/// How to turn a (local, remote) pair into the record to commit.
#[derive(Clone)]
pub enum ResolutionStrategy {
    LocalWins,
    RemoteWins,
    TimestampWins,
    /// Remote as base, local fields overlaid
    Merge,
    /// Per-field rules; unlisted fields take the remote value
    FieldLevel(HashMap<String, FieldRule>),
    Custom(CustomResolver),
}

impl ResolutionStrategy {
    /// Name recorded on the resolved conflict.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::TimestampWins => "timestamp_wins",
            Self::Merge => "merge",
            Self::FieldLevel(_) => "field_level",
            Self::Custom(_) => "custom",
        }
    }

    /// Parse a configurable strategy name.
    ///
    /// `field_level` and `custom` need caller data and cannot be named in config.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "local_wins" | "client_wins" => Some(Self::LocalWins),
            "remote_wins" | "server_wins" => Some(Self::RemoteWins),
            "timestamp_wins" | "last_write_wins" => Some(Self::TimestampWins),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }

    /// Convenience constructor for a field-level table.
    pub fn field_level<I, K>(rules: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldRule)>,
        K: Into<String>,
    {
        Self::FieldLevel(rules.into_iter().map(|(k, r)| (k.into(), r)).collect())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Record, Option<&Record>, &[String]) -> Record + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }
}

impl fmt::Debug for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldLevel(rules) => f.debug_tuple("FieldLevel").field(rules).finish(),
            other => f.write_str(other.name()),
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
