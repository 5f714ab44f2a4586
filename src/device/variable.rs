//! State variables of a device.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Value of a state variable, as decoded by the device protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableValue {
    /// No value (yet)
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl VariableValue {
    /// Returns the value as `f64` for numeric variants.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            VariableValue::Int(v) => Some(*v as f64),
            VariableValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string slice of `Str` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            VariableValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::Null => f.write_str("None"),
            VariableValue::Bool(v) => write!(f, "{v}"),
            VariableValue::Int(v) => write!(f, "{v}"),
            VariableValue::Float(v) => write!(f, "{v}"),
            VariableValue::Str(v) => f.write_str(v),
            VariableValue::Bytes(v) => write!(f, "{:?}", bytes::Bytes::copy_from_slice(v)),
            VariableValue::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            VariableValue::Date(v) => write!(f, "{v}"),
            VariableValue::Time(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for VariableValue {
    fn from(v: bool) -> Self {
        VariableValue::Bool(v)
    }
}

impl From<i64> for VariableValue {
    fn from(v: i64) -> Self {
        VariableValue::Int(v)
    }
}

impl From<i32> for VariableValue {
    fn from(v: i32) -> Self {
        VariableValue::Int(i64::from(v))
    }
}

impl From<f64> for VariableValue {
    fn from(v: f64) -> Self {
        VariableValue::Float(v)
    }
}

impl From<&str> for VariableValue {
    fn from(v: &str) -> Self {
        VariableValue::Str(v.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(v: String) -> Self {
        VariableValue::Str(v)
    }
}

impl From<Vec<u8>> for VariableValue {
    fn from(v: Vec<u8>) -> Self {
        VariableValue::Bytes(v)
    }
}

impl From<DateTime<Utc>> for VariableValue {
    fn from(v: DateTime<Utc>) -> Self {
        VariableValue::DateTime(v)
    }
}

impl From<NaiveDate> for VariableValue {
    fn from(v: NaiveDate) -> Self {
        VariableValue::Date(v)
    }
}

impl From<NaiveTime> for VariableValue {
    fn from(v: NaiveTime) -> Self {
        VariableValue::Time(v)
    }
}

impl<T: Into<VariableValue>> From<Option<T>> for VariableValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(VariableValue::Null, Into::into)
    }
}

/// Declared type of a variable. Mismatching updates are accepted but logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Int,
    Float,
    Str,
    Bytes,
    Bool,
    DateTime,
    Date,
    Time,
    #[default]
    Unknown,
}

impl VariableType {
    /// Whether `value` fits this type. `Null` fits every type; floats accept ints.
    pub fn accepts(self, value: &VariableValue) -> bool {
        match (self, value) {
            (_, VariableValue::Null) | (VariableType::Unknown, _) => true,
            (VariableType::Int, VariableValue::Int(_)) => true,
            (VariableType::Float, VariableValue::Float(_) | VariableValue::Int(_)) => true,
            (VariableType::Str, VariableValue::Str(_)) => true,
            (VariableType::Bytes, VariableValue::Bytes(_)) => true,
            (VariableType::Bool, VariableValue::Bool(_)) => true,
            (VariableType::DateTime, VariableValue::DateTime(_)) => true,
            (VariableType::Date, VariableValue::Date(_)) => true,
            (VariableType::Time, VariableValue::Time(_)) => true,
            _ => false,
        }
    }
}

/// How often a variable is refreshed by the auto-querier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTimeout {
    /// Re-query once the value is older than this
    Every(Duration),
    /// Query until the first value arrives, then only when forced
    Once,
    /// Never auto-queried; updated by the backend or as a side effect
    Passive,
}

impl QueryTimeout {
    /// Seconds as reported in `variablenames`; `None` for non-periodic variables.
    pub fn as_secs_f64(self) -> Option<f64> {
        match self {
            QueryTimeout::Every(d) => Some(d.as_secs_f64()),
            QueryTimeout::Once | QueryTimeout::Passive => None,
        }
    }
}

/// Static declaration of a variable, supplied by the device protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    pub name: String,
    /// Querying any of these refreshes this variable too
    pub depends_from: Vec<String>,
    /// Urgent variables are polled before the others
    pub urgent: bool,
    pub timeout: QueryTimeout,
    pub kind: VariableType,
}

impl VariableInfo {
    /// A variable re-queried every second, the usual default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_from: Vec::new(),
            urgent: false,
            timeout: QueryTimeout::Every(Duration::from_secs(1)),
            kind: VariableType::Unknown,
        }
    }

    pub fn every(mut self, timeout: Duration) -> Self {
        self.timeout = QueryTimeout::Every(timeout);
        self
    }

    /// Query only until the first value arrives.
    pub fn once(mut self) -> Self {
        self.timeout = QueryTimeout::Once;
        self
    }

    pub fn passive(mut self) -> Self {
        self.timeout = QueryTimeout::Passive;
        self
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn depends_from<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_from = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn kind(mut self, kind: VariableType) -> Self {
        self.kind = kind;
        self
    }
}

/// Live state of one variable.
#[derive(Debug, Clone)]
pub struct Variable {
    info: VariableInfo,
    value: VariableValue,
    previous_value: VariableValue,
    /// Last successful update
    timestamp: Option<Instant>,
    /// Last issued query still without reply
    last_query: Option<Instant>,
    /// Last time the value actually changed; cleared to force a change event
    last_change: Option<Instant>,
    timeout: QueryTimeout,
}

impl Variable {
    pub fn new(info: VariableInfo) -> Self {
        Self {
            timeout: info.timeout,
            info,
            value: VariableValue::Null,
            previous_value: VariableValue::Null,
            timestamp: None,
            last_query: None,
            last_change: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &VariableInfo {
        &self.info
    }

    pub fn value(&self) -> &VariableValue {
        &self.value
    }

    pub fn previous_value(&self) -> &VariableValue {
        &self.previous_value
    }

    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    pub fn last_query(&self) -> Option<Instant> {
        self.last_query
    }

    /// Current query timeout (may differ from the declared one).
    pub fn timeout(&self) -> QueryTimeout {
        self.timeout
    }

    pub fn has_value(&self) -> bool {
        self.timestamp.is_some()
    }

    pub fn query_outstanding(&self) -> bool {
        self.last_query.is_some()
    }

    /// Passive variables are never scheduled by the auto-querier.
    pub fn auto_queryable(&self) -> bool {
        !matches!(self.timeout, QueryTimeout::Passive)
    }

    /// Seconds past the timeout: `+inf` if never updated, `-inf` if the
    /// timeout is not periodic. Positive means overdue.
    pub fn overdue_secs(&self, now: Instant) -> f64 {
        let Some(timestamp) = self.timestamp else {
            return f64::INFINITY;
        };
        match self.timeout {
            QueryTimeout::Every(timeout) => {
                now.saturating_duration_since(timestamp).as_secs_f64() - timeout.as_secs_f64()
            }
            QueryTimeout::Once | QueryTimeout::Passive => f64::NEG_INFINITY,
        }
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        self.overdue_secs(now) > 0.0
    }

    /// Stores a fresh value; returns whether it differs from the previous one.
    pub(crate) fn update(&mut self, value: VariableValue, now: Instant) -> bool {
        self.last_query = None;
        self.timestamp = Some(now);
        if self.last_change.is_some() && self.value == value {
            return false;
        }
        self.previous_value = std::mem::replace(&mut self.value, value);
        self.last_change = Some(now);
        true
    }

    pub(crate) fn mark_queried(&mut self, now: Instant) {
        self.last_query = Some(now);
    }

    pub(crate) fn clear_query(&mut self) {
        self.last_query = None;
    }

    /// Makes the next update report a change even if the value is the same.
    pub(crate) fn force_change(&mut self) {
        self.last_change = None;
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<QueryTimeout>) {
        self.timeout = timeout.unwrap_or(self.info.timeout);
    }
}
