//! Conversions between [`SqlValue`] parameters, Postgres wire types and
//! JSON rows.
//!
//! Parameters are bound by the column type Postgres reports for each
//! placeholder, so one `SqlValue::Int` can land in an `INTEGER`, a `BIGINT`
//! or a `DOUBLE PRECISION` column, and `NULL` binds to any of them.

use std::error::Error;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use pgvector::Vector;
use serde_json::{Map, Value};
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::Row;
use uuid::Uuid;

use lineage_core::{ErrorCode, LineageError, LineageResult, SqlValue};

type BoxError = Box<dyn Error + Sync + Send>;

/// A bound parameter.
#[derive(Debug)]
pub struct PgParam<'a>(pub &'a SqlValue);

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self.0 {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(b) => b.to_sql(ty, out),
            SqlValue::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            SqlValue::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            SqlValue::Text(s) => match *ty {
                Type::UUID => Uuid::parse_str(s)?.to_sql(ty, out),
                // enums share the text wire format
                _ => s.as_str().to_sql(ty, out),
            },
            SqlValue::Uuid(u) => match *ty {
                Type::UUID => u.to_sql(ty, out),
                _ => u.to_string().as_str().to_sql(ty, out),
            },
            SqlValue::Timestamp(t) => match *ty {
                Type::TIMESTAMP => t.naive_utc().to_sql(ty, out),
                _ => t.to_sql(ty, out),
            },
            SqlValue::Date(d) => d.to_sql(ty, out),
            SqlValue::Json(v) => v.to_sql(ty, out),
            SqlValue::Vector(v) => Vector::from(v.clone()).to_sql(ty, out),
            SqlValue::TextArray(items) => {
                require_array(ty)?;
                items.to_sql(ty, out)
            }
            SqlValue::IntArray(items) => match ty.kind() {
                Kind::Array(member) if *member == Type::INT4 => items
                    .iter()
                    .map(|i| i32::try_from(*i))
                    .collect::<Result<Vec<_>, _>>()?
                    .to_sql(ty, out),
                _ => {
                    require_array(ty)?;
                    items.to_sql(ty, out)
                }
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn require_array(ty: &Type) -> Result<(), BoxError> {
    match ty.kind() {
        Kind::Array(_) => Ok(()),
        _ => Err(format!("cannot bind an array to a {} column", ty.name()).into()),
    }
}

/// Text-format values: text-like columns and user enum types.
struct RawText(String);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(RawText(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Enum(_)) || <&str as FromSql>::accepts(ty)
    }
}

/// Decode a row into a JSON object keyed by column name.
pub fn row_to_json(row: &Row) -> LineageResult<Value> {
    let mut object = Map::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = column_value(row, idx, column.type_()).map_err(|e| {
            LineageError::backend_with_source(
                format!("Failed to decode column '{}' of type {}", column.name(), column.type_()),
                ErrorCode::DbDecodeFailed,
                e,
            )
        })?;
        object.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(object))
}

fn column_value(row: &Row, idx: usize, ty: &Type) -> Result<Value, tokio_postgres::Error> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::from),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::from),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(|f| Value::from(f as f64)),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::from),
        Type::UUID => row
            .try_get::<_, Option<Uuid>>(idx)?
            .map(|u| Value::String(u.to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|t| Value::String(t.to_rfc3339())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|t| Value::String(t.and_utc().to_rfc3339())),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|d| Value::String(d.to_string())),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx)?,
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            row.try_get::<_, Option<Vec<String>>>(idx)?.map(Value::from)
        }
        Type::INT4_ARRAY => row.try_get::<_, Option<Vec<i32>>>(idx)?.map(Value::from),
        Type::INT8_ARRAY => row.try_get::<_, Option<Vec<i64>>>(idx)?.map(Value::from),
        _ if ty.name() == "vector" => row
            .try_get::<_, Option<Vector>>(idx)?
            .map(|v| Value::from(v.to_vec())),
        _ => row.try_get::<_, Option<RawText>>(idx)?.map(|t| Value::String(t.0)),
    };
    Ok(value.unwrap_or(Value::Null))
}
