// Dynamic property values flowing between callers, the pipeline and the store

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// A property or attribute map. Keys are property names on the application
/// side and attribute names on the store side.
pub type Properties = BTreeMap<String, Value>;

/// A stored item as returned by the store client.
pub type Item = Properties;

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Object(Properties),
    /// A key or filter operator such as `begins` or `between`, used by find.
    Condition(Condition),
}

/// Range/filter operators that can be tunneled into find properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "begins")]
    Begins,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Begins => "begins",
            Operator::Between => "between",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Eq => "=",
            Operator::Ge => ">=",
            Operator::Gt => ">",
        }
    }
}

/// An operator applied to an operand. `Between` carries a two element array.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub op: Operator,
    pub value: Box<Value>,
}

impl Condition {
    pub fn new(op: Operator, value: impl Into<Value>) -> Self {
        Condition {
            op,
            value: Box::new(value.into()),
        }
    }

    pub fn begins(prefix: impl Into<String>) -> Self {
        Condition::new(Operator::Begins, Value::String(prefix.into()))
    }

    pub fn between(low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Condition::new(Operator::Between, Value::Array(vec![low.into(), high.into()]))
    }

    /// Test a stored value against this condition.
    pub fn matches(&self, candidate: &Value) -> bool {
        match self.op {
            Operator::Begins => match (candidate, self.value.as_ref()) {
                (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            Operator::Between => match self.value.as_ref() {
                Value::Array(bounds) if bounds.len() == 2 => {
                    compare(candidate, &bounds[0]).map_or(false, |o| o.is_ge())
                        && compare(candidate, &bounds[1]).map_or(false, |o| o.is_le())
                }
                _ => false,
            },
            Operator::Eq => candidate == self.value.as_ref(),
            Operator::Lt => compare(candidate, &self.value).map_or(false, |o| o.is_lt()),
            Operator::Le => compare(candidate, &self.value).map_or(false, |o| o.is_le()),
            Operator::Ge => compare(candidate, &self.value).map_or(false, |o| o.is_ge()),
            Operator::Gt => compare(candidate, &self.value).map_or(false, |o| o.is_gt()),
        }
    }
}

/// Order two scalar values of the same kind. Mixed kinds are unordered.
pub fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Binary(x), Value::Binary(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Properties> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Properties> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a dotted path such as `address.city`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for part in path.split('.') {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Primitive text form used for template substitution and sentinel keys.
    /// Returns `None` for objects and conditions, which have no text form.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => Some("null".to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(format_number(*n)),
            Value::String(s) => Some(s.clone()),
            Value::Date(d) => Some(iso_string(d)),
            Value::Binary(bytes) => Some(BASE64.encode(bytes)),
            Value::Array(items) => {
                let parts: Option<Vec<String>> = items.iter().map(|v| v.to_text()).collect();
                parts.map(|p| p.join(","))
            }
            Value::Object(_) | Value::Condition(_) => None,
        }
    }

    /// Convert to JSON. Dates become ISO-8601 strings, binaries base64 text.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(d) => serde_json::Value::String(iso_string(d)),
            Value::Binary(bytes) => serde_json::Value::String(BASE64.encode(bytes)),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => properties_to_json(map),
            Value::Condition(cond) => {
                let mut obj = serde_json::Map::new();
                obj.insert(cond.op.as_str().to_string(), cond.value.to_json());
                serde_json::Value::Object(obj)
            }
        }
    }
}

/// Render a number the way a dynamic language prints it: integral values have
/// no fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub fn iso_string(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn properties_to_json(properties: &Properties) -> serde_json::Value {
    serde_json::Value::Object(
        properties
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// Build a property map from a JSON object. Non-objects yield an empty map.
pub fn to_properties(json: serde_json::Value) -> Properties {
    match Value::from(json) {
        Value::Object(map) => map,
        _ => Properties::new(),
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Properties> for Value {
    fn from(map: Properties) -> Self {
        Value::Object(map)
    }
}

impl From<Condition> for Value {
    fn from(cond: Condition) -> Self {
        Value::Condition(cond)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => f.write_str(&text),
            None => write!(f, "{}", self.to_json()),
        }
    }
}
