//! Core data model for Pitwall: flat records, synchronized documents and calendar events.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pitwall-core";

/// Field stamped on every document on every synchronization run.
pub const UPDATED_AT_FIELD: &str = "_updated_at";
/// Field set once, when the store first sees a document's identity value.
pub const CREATED_AT_FIELD: &str = "_created_at";

/// Scalar or list-of-scalar field value carried by a [`Record`]. Write-only: values are
/// serialized towards the store and never read back through serde.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of the value. NaN never comes back out of here.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    /// Comparison token for identity values, or `None` when the value cannot identify a
    /// document (null, blank text, non-finite float, list).
    ///
    /// The token is kind-qualified so `44` and `"44"` stay distinct, matching how the
    /// store compares filter values. Numbers compare by value, so `1` and `1.0` share a token.
    pub fn identity_token(&self) -> Option<String> {
        match self {
            Value::Null | Value::List(_) => None,
            Value::Text(s) if s.trim().is_empty() => None,
            Value::Float(f) if !f.is_finite() => None,
            Value::Bool(b) => Some(format!("bool:{b}")),
            Value::Int(i) => Some(format!("int:{i}")),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Some(format!("int:{}", *f as i64))
            }
            Value::Float(f) => Some(format!("float:{f}")),
            Value::Timestamp(ts) => Some(format!("ts:{}", ts.to_rfc3339())),
            Value::Text(s) => Some(format!("text:{s}")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Text(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

/// Non-finite floats collapse to null so NaN never reaches the store.
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        if v.is_finite() {
            Value::Float(v)
        } else {
            Value::Null
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

/// One entity instance as a flat field map. Field order is stable (sorted by name).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    pub fn float(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity field `{0}` is missing")]
    Missing(String),
    #[error("identity field `{field}` holds an unusable value: {value}")]
    Unusable { field: String, value: String },
}

/// A record stamped for synchronization.
///
/// The update stamp lives inside the field map as [`UPDATED_AT_FIELD`]; the creation stamp
/// is never part of a document and is only ever written by the store on first insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    fields: Record,
    updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(mut record: Record, updated_at: DateTime<Utc>) -> Self {
        record.remove(CREATED_AT_FIELD);
        record.set(UPDATED_AT_FIELD, updated_at);
        Self {
            fields: record,
            updated_at,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn fields(&self) -> &Record {
        &self.fields
    }

    pub fn into_fields(self) -> Record {
        self.fields
    }

    /// Identity value of this document for `field`, validated as usable.
    pub fn identity(&self, field: &str) -> Result<&Value, IdentityError> {
        let value = self
            .fields
            .get(field)
            .ok_or_else(|| IdentityError::Missing(field.to_string()))?;
        if value.identity_token().is_none() {
            return Err(IdentityError::Unusable {
                field: field.to_string(),
                value: value.to_string(),
            });
        }
        Ok(value)
    }
}

/// Stamp every record with `now` as its update time.
pub fn prepare_documents<I>(records: I, now: DateTime<Utc>) -> Vec<Document>
where
    I: IntoIterator<Item = Record>,
{
    records
        .into_iter()
        .map(|record| Document::new(record, now))
        .collect()
}

/// Session format of a calendar entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFormat {
    Conventional,
    Sprint,
    Testing,
}

impl EventFormat {
    /// Testing sessions never count as competitive events.
    pub fn is_competitive(self) -> bool {
        !matches!(self, EventFormat::Testing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventFormat::Conventional => "conventional",
            EventFormat::Sprint => "sprint",
            EventFormat::Testing => "testing",
        }
    }
}

/// One entry of a season calendar. `(season, round)` identifies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub season: i32,
    pub round: u32,
    pub name: String,
    pub format: EventFormat,
    /// Race start instant.
    pub start: DateTime<Utc>,
    pub first_practice: Option<DateTime<Utc>>,
    pub circuit_id: Option<String>,
    pub circuit_name: Option<String>,
    pub locality: Option<String>,
    pub country: Option<String>,
}

impl CalendarEvent {
    pub fn key(&self) -> (i32, u32) {
        (self.season, self.round)
    }

    /// First on-track instant of the weekend, falling back to the race start.
    pub fn weekend_start(&self) -> DateTime<Utc> {
        self.first_practice.unwrap_or(self.start)
    }
}
