//! Bound parameter values.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A value carried by a literal or bound as a positional parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Json(serde_json::Value),
    Vector(Vec<f32>),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
}

/// Coarse value category used for DSL type checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Uuid,
    Timestamp,
    Date,
    Json,
    Vector,
    TextArray,
    IntArray,
}

impl SqlValue {
    /// Category of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            SqlValue::Null => ValueKind::Null,
            SqlValue::Bool(_) => ValueKind::Bool,
            SqlValue::Int(_) => ValueKind::Int,
            SqlValue::Float(_) => ValueKind::Float,
            SqlValue::Text(_) => ValueKind::Text,
            SqlValue::Uuid(_) => ValueKind::Uuid,
            SqlValue::Timestamp(_) => ValueKind::Timestamp,
            SqlValue::Date(_) => ValueKind::Date,
            SqlValue::Json(_) => ValueKind::Json,
            SqlValue::Vector(_) => ValueKind::Vector,
            SqlValue::TextArray(_) => ValueKind::TextArray,
            SqlValue::IntArray(_) => ValueKind::IntArray,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Render as an inline SQL literal. Only used for compiler constants.
    pub fn to_sql_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Text(s) => quote_literal(s),
            SqlValue::Uuid(u) => quote_literal(&u.to_string()),
            SqlValue::Timestamp(t) => quote_literal(&t.to_rfc3339()),
            SqlValue::Date(d) => quote_literal(&d.to_string()),
            SqlValue::Json(v) => quote_literal(&v.to_string()),
            SqlValue::Vector(v) => quote_literal(&format_vector(v)),
            SqlValue::TextArray(items) => format!(
                "ARRAY[{}]",
                items.iter().map(|s| quote_literal(s)).collect::<Vec<_>>().join(", ")
            ),
            SqlValue::IntArray(items) => format!(
                "ARRAY[{}]::BIGINT[]",
                items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
            ),
        }
    }

    /// Human-readable form attached to backend errors.
    pub fn render(&self) -> String {
        match self {
            SqlValue::Text(s) => format!("{:?}", s),
            other => other.to_sql_literal(),
        }
    }

    /// JSON view of the value, used by non-SQL filter translators.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(b) => Value::Bool(*b),
            SqlValue::Int(i) => Value::from(*i),
            SqlValue::Float(f) => Value::from(*f),
            SqlValue::Text(s) => Value::String(s.clone()),
            SqlValue::Uuid(u) => Value::String(u.to_string()),
            SqlValue::Timestamp(t) => Value::String(t.to_rfc3339()),
            SqlValue::Date(d) => Value::String(d.to_string()),
            SqlValue::Json(v) => v.clone(),
            SqlValue::Vector(v) => Value::from(v.clone()),
            SqlValue::TextArray(v) => Value::from(v.clone()),
            SqlValue::IntArray(v) => Value::from(v.clone()),
        }
    }

    /// Best-effort conversion from a JSON value.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => SqlValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Json(other.clone()),
        }
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn format_vector(v: &[f32]) -> String {
    format!(
        "[{}]",
        v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(",")
    )
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<f32> for SqlValue {
    fn from(v: f32) -> Self {
        SqlValue::Float(v as f64)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

impl From<Vec<f32>> for SqlValue {
    fn from(v: Vec<f32>) -> Self {
        SqlValue::Vector(v)
    }
}

impl From<Vec<String>> for SqlValue {
    fn from(v: Vec<String>) -> Self {
        SqlValue::TextArray(v)
    }
}

impl From<Vec<i64>> for SqlValue {
    fn from(v: Vec<i64>) -> Self {
        SqlValue::IntArray(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}
