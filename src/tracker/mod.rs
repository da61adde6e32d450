//! Tracker adapters -- the boundary to the external issue tracker.
//!
//! An adapter turns a stored tracker filter into a normalized list of
//! [`BugRecord`]s. Failures are classified so the execution engine can decide
//! between retrying, failing, and keeping a partial result.

pub mod bugzilla;
pub mod scripted;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tracker-side bug identifier.
pub type BugId = i64;

/// A single tracked field value.
///
/// The set of fields is administrator-configurable, so values are tagged
/// rather than modelled as a fixed struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Date(DateTime<Utc>),
    /// The tracker reported the field, but with no value (cleared).
    Unset,
}

impl FieldValue {
    /// Normalize a raw JSON value from a tracker payload.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FieldValue::Unset,
            Value::Number(n) => n
                .as_f64()
                .map(FieldValue::Number)
                .unwrap_or_else(|| FieldValue::Text(n.to_string())),
            Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(dt) => FieldValue::Date(dt.with_timezone(&Utc)),
                Err(_) => FieldValue::Text(s.clone()),
            },
            Value::Bool(b) => FieldValue::Text(b.to_string()),
            other => FieldValue::Text(other.to_string()),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Date(d) => write!(f, "{}", d.to_rfc3339()),
            FieldValue::Unset => write!(f, "(unset)"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

/// One bug as returned by the tracker. Fields the tracker did not return are
/// simply missing from `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BugRecord {
    pub bug_id: BugId,
    pub fields: BTreeMap<String, FieldValue>,
}

impl BugRecord {
    pub fn new(bug_id: BugId) -> Self {
        Self { bug_id, fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

/// Classified adapter failure.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network, timeout or rate-limit trouble. Worth retrying.
    #[error("transient tracker error: {0}")]
    Transient(String),

    /// The query is invalid or gone on the tracker side.
    #[error("permanent tracker error: {0}")]
    Permanent(String),

    /// Some records were obtained before `source` interrupted the fetch.
    #[error("fetch interrupted after {} records: {source}", .records.len())]
    Partial {
        records: Vec<BugRecord>,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether the underlying cause may go away on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transient(_) => true,
            FetchError::Permanent(_) => false,
            FetchError::Partial { source, .. } => source.is_transient(),
        }
    }
}

/// Interface to the external issue tracker.
#[async_trait::async_trait]
pub trait TrackerAdapter: Send + Sync {
    /// Run `filter` and return the matching bugs with the requested `fields`.
    async fn fetch(&self, filter: &str, fields: &[String]) -> Result<Vec<BugRecord>, FetchError>;

    /// Run only the search step and return the matching bug ids.
    async fn test_filter(&self, filter: &str) -> Result<Vec<BugId>, FetchError>;
}
