//! Field descriptors.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, LineageError, LineageResult};
use crate::sql::value::SqlValue;

/// Storage type of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    BigInt,
    Float,
    Text,
    Boolean,
    Uuid,
    Timestamp,
    Date,
    Json,
    Vector(usize),
    /// Named Postgres enum type with its allowed labels.
    Enum { name: String, values: Vec<String> },
    TextArray,
    IntArray,
}

impl FieldType {
    /// Column type used in DDL.
    pub fn sql_type(&self) -> String {
        match self {
            FieldType::Integer => "INTEGER".to_string(),
            FieldType::BigInt => "BIGINT".to_string(),
            FieldType::Float => "DOUBLE PRECISION".to_string(),
            FieldType::Text => "TEXT".to_string(),
            FieldType::Boolean => "BOOLEAN".to_string(),
            FieldType::Uuid => "UUID".to_string(),
            FieldType::Timestamp => "TIMESTAMPTZ".to_string(),
            FieldType::Date => "DATE".to_string(),
            FieldType::Json => "JSONB".to_string(),
            FieldType::Vector(dim) => format!("VECTOR({})", dim),
            FieldType::Enum { name, .. } => name.clone(),
            FieldType::TextArray => "TEXT[]".to_string(),
            FieldType::IntArray => "BIGINT[]".to_string(),
        }
    }

    /// Whether a literal of this value may be compared with the field.
    /// `NULL` is always accepted.
    pub fn accepts(&self, value: &SqlValue) -> bool {
        match (self, value) {
            (_, SqlValue::Null) => true,
            (FieldType::Integer | FieldType::BigInt, SqlValue::Int(_)) => true,
            (FieldType::Float, SqlValue::Int(_) | SqlValue::Float(_)) => true,
            (FieldType::Text, SqlValue::Text(_)) => true,
            (FieldType::Boolean, SqlValue::Bool(_)) => true,
            (FieldType::Uuid, SqlValue::Uuid(_)) => true,
            (FieldType::Uuid, SqlValue::Text(s)) => uuid::Uuid::parse_str(s).is_ok(),
            (FieldType::Timestamp, SqlValue::Timestamp(_)) => true,
            (FieldType::Date, SqlValue::Date(_)) => true,
            (FieldType::Json, _) => true,
            (FieldType::Vector(dim), SqlValue::Vector(v)) => v.len() == *dim,
            (FieldType::Enum { values, .. }, SqlValue::Text(s)) => values.contains(s),
            (FieldType::TextArray, SqlValue::TextArray(_) | SqlValue::Text(_)) => true,
            (FieldType::IntArray, SqlValue::IntArray(_) | SqlValue::Int(_)) => true,
            _ => false,
        }
    }

    /// Whether values of this type can be ordered with `<`/`>`.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            FieldType::Integer
                | FieldType::BigInt
                | FieldType::Float
                | FieldType::Text
                | FieldType::Timestamp
                | FieldType::Date
        )
    }
}

/// Foreign key target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub optional: bool,
    pub primary_key: bool,
    pub foreign_key: Option<ForeignKey>,
    pub index: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            optional: false,
            primary_key: false,
            foreign_key: None,
            index: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.foreign_key = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    /// Convert a JSON value into the parameter bound for this column.
    ///
    /// Strings become UUIDs, timestamps or dates where the column says so,
    /// and enum labels are checked against the declared set.
    pub fn value_from_json(&self, value: &Value) -> LineageResult<SqlValue> {
        let converted = match (&self.field_type, value) {
            (_, Value::Null) => Some(SqlValue::Null),
            (FieldType::Integer | FieldType::BigInt, v) => v.as_i64().map(SqlValue::Int),
            (FieldType::Float, v) => v.as_f64().map(SqlValue::Float),
            (FieldType::Boolean, v) => v.as_bool().map(SqlValue::Bool),
            (FieldType::Text, Value::String(s)) => Some(SqlValue::Text(s.clone())),
            (FieldType::Enum { values, .. }, Value::String(s)) if values.contains(s) => {
                Some(SqlValue::Text(s.clone()))
            }
            (FieldType::Uuid, Value::String(s)) => uuid::Uuid::parse_str(s).ok().map(SqlValue::Uuid),
            (FieldType::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| SqlValue::Timestamp(t.with_timezone(&Utc))),
            (FieldType::Date, Value::String(s)) => s.parse::<NaiveDate>().ok().map(SqlValue::Date),
            (FieldType::Json, v) => Some(SqlValue::Json(v.clone())),
            (FieldType::Vector(dim), Value::Array(items)) if items.len() == *dim => items
                .iter()
                .map(|x| x.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<_>>>()
                .map(SqlValue::Vector),
            (FieldType::TextArray, Value::Array(items)) => items
                .iter()
                .map(|x| x.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(SqlValue::TextArray),
            (FieldType::IntArray, Value::Array(items)) => items
                .iter()
                .map(Value::as_i64)
                .collect::<Option<Vec<_>>>()
                .map(SqlValue::IntArray),
            _ => None,
        };
        if !self.optional && !self.primary_key && converted.as_ref().is_some_and(SqlValue::is_null) {
            return Err(LineageError::query_build(
                format!("Field '{}' is not optional", self.name),
                ErrorCode::QryTypeMismatch,
            ));
        }
        converted.ok_or_else(|| {
            LineageError::query_build(
                format!(
                    "Field '{}' of type {} cannot hold {}",
                    self.name,
                    self.field_type.sql_type(),
                    value
                ),
                ErrorCode::QryTypeMismatch,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_types() {
        assert_eq!(FieldType::Vector(3).sql_type(), "VECTOR(3)");
        assert_eq!(FieldType::Json.sql_type(), "JSONB");
        let e = FieldType::Enum {
            name: "mood".into(),
            values: vec!["happy".into()],
        };
        assert_eq!(e.sql_type(), "mood");
    }

    #[test]
    fn test_accepts() {
        assert!(FieldType::Text.accepts(&"a".into()));
        assert!(!FieldType::Text.accepts(&SqlValue::Int(1)));
        assert!(FieldType::Float.accepts(&SqlValue::Int(1)));
        assert!(!FieldType::Integer.accepts(&SqlValue::Float(0.5)));
        assert!(FieldType::Vector(2).accepts(&SqlValue::Vector(vec![1.0, 2.0])));
        assert!(!FieldType::Vector(2).accepts(&SqlValue::Vector(vec![1.0])));
        assert!(FieldType::Integer.accepts(&SqlValue::Null));
    }

    #[test]
    fn test_enum_accepts_only_declared_labels() {
        let e = FieldType::Enum {
            name: "status".into(),
            values: vec!["open".into(), "closed".into()],
        };
        assert!(e.accepts(&"open".into()));
        assert!(!e.accepts(&"pending".into()));
    }

    #[test]
    fn test_value_from_json_follows_column_type() {
        let id = FieldDef::new("artifact_id", FieldType::Uuid);
        let raw = "6f1c2b9e-8d1a-4c7e-9b1f-1a2b3c4d5e6f";
        assert!(matches!(
            id.value_from_json(&serde_json::json!(raw)).unwrap(),
            SqlValue::Uuid(_)
        ));

        let at = FieldDef::new("deleted_at", FieldType::Timestamp).optional();
        assert!(matches!(
            at.value_from_json(&serde_json::json!("2025-01-01T00:00:00Z")).unwrap(),
            SqlValue::Timestamp(_)
        ));
        assert!(at.value_from_json(&serde_json::Value::Null).unwrap().is_null());

        let emb = FieldDef::new("embedding", FieldType::Vector(2));
        assert_eq!(
            emb.value_from_json(&serde_json::json!([0.5, 1.0])).unwrap(),
            SqlValue::Vector(vec![0.5, 1.0])
        );
        assert!(emb.value_from_json(&serde_json::json!([0.5])).is_err());
    }

    #[test]
    fn test_value_from_json_rejects_null_for_required() {
        let title = FieldDef::new("title", FieldType::Text);
        let err = title.value_from_json(&serde_json::Value::Null).unwrap_err();
        assert_eq!(err.code(), ErrorCode::QryTypeMismatch);
        assert!(title.value_from_json(&serde_json::json!(3)).is_err());
    }
}
