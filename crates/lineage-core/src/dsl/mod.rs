//! Typed predicate builder.
//!
//! A [`QueryProxy`] stands in for one aliased table. Asking it for a field
//! yields a [`FieldRef`] whose comparison methods build [`Expr`] nodes after
//! checking the literal against the field's declared type, so mismatches
//! surface while the query is being built. Predicates combine with `&`, `|`
//! and `!`:
//!
//! ```ignore
//! let topic = proxy.field("topic")?;
//! let pred = topic.eq("animals")? | topic.eq("physics")?;
//! ```

use std::sync::Arc;

use crate::error::{ErrorCode, LineageError, LineageResult};
use crate::schema::{EntitySchema, FieldType};
use crate::sql::{param, qcol, DistanceOp, Expr, OrderBy, SqlValue};

/// Field stand-ins for one entity bound to an alias.
#[derive(Debug, Clone)]
pub struct QueryProxy {
    alias: String,
    schema: Arc<EntitySchema>,
}

impl QueryProxy {
    pub fn new(alias: impl Into<String>, schema: Arc<EntitySchema>) -> Self {
        Self {
            alias: alias.into(),
            schema,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    /// The named field, or `QryUnknownField`.
    pub fn field(&self, name: &str) -> LineageResult<FieldRef> {
        let def = self.schema.field(name).ok_or_else(|| {
            LineageError::query_build(
                format!("Entity '{}' has no field '{}'", self.schema.name, name),
                ErrorCode::QryUnknownField,
            )
        })?;
        Ok(FieldRef {
            table: self.alias.clone(),
            name: def.name.clone(),
            field_type: def.field_type.clone(),
        })
    }
}

/// A column of an aliased table together with its declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    table: String,
    name: String,
    field_type: FieldType,
}

impl FieldRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    /// Qualified column expression.
    pub fn expr(&self) -> Expr {
        qcol(&self.table, &self.name)
    }

    /// `field = value`; a `NULL` value becomes `IS NULL`.
    pub fn eq(&self, value: impl Into<SqlValue>) -> LineageResult<Expr> {
        let value = self.check(value.into())?;
        if value.is_null() {
            return Ok(self.expr().is_null());
        }
        Ok(self.expr().eq(param(value)))
    }

    /// `field != value`; a `NULL` value becomes `IS NOT NULL`.
    pub fn neq(&self, value: impl Into<SqlValue>) -> LineageResult<Expr> {
        let value = self.check(value.into())?;
        if value.is_null() {
            return Ok(self.expr().is_not_null());
        }
        Ok(self.expr().neq(param(value)))
    }

    pub fn gt(&self, value: impl Into<SqlValue>) -> LineageResult<Expr> {
        let value = self.check_ordered(value.into())?;
        Ok(self.expr().gt(param(value)))
    }

    pub fn gte(&self, value: impl Into<SqlValue>) -> LineageResult<Expr> {
        let value = self.check_ordered(value.into())?;
        Ok(self.expr().gte(param(value)))
    }

    pub fn lt(&self, value: impl Into<SqlValue>) -> LineageResult<Expr> {
        let value = self.check_ordered(value.into())?;
        Ok(self.expr().lt(param(value)))
    }

    pub fn lte(&self, value: impl Into<SqlValue>) -> LineageResult<Expr> {
        let value = self.check_ordered(value.into())?;
        Ok(self.expr().lte(param(value)))
    }

    pub fn between(
        &self,
        low: impl Into<SqlValue>,
        high: impl Into<SqlValue>,
    ) -> LineageResult<Expr> {
        let low = self.check_ordered(low.into())?;
        let high = self.check_ordered(high.into())?;
        Ok(self.expr().between(param(low), param(high)))
    }

    pub fn in_<V: Into<SqlValue>>(&self, values: impl IntoIterator<Item = V>) -> LineageResult<Expr> {
        Ok(self.expr().in_list(self.check_all(values)?))
    }

    pub fn not_in<V: Into<SqlValue>>(&self, values: impl IntoIterator<Item = V>) -> LineageResult<Expr> {
        Ok(self.expr().not_in_list(self.check_all(values)?))
    }

    pub fn is_null(&self) -> Expr {
        self.expr().is_null()
    }

    pub fn is_not_null(&self) -> Expr {
        self.expr().is_not_null()
    }

    pub fn like(&self, pattern: impl Into<String>) -> LineageResult<Expr> {
        self.require_text("LIKE")?;
        Ok(self.expr().like(param(pattern.into())))
    }

    pub fn ilike(&self, pattern: impl Into<String>) -> LineageResult<Expr> {
        self.require_text("ILIKE")?;
        Ok(self.expr().ilike(param(pattern.into())))
    }

    /// `field = other` across tables. Both fields must share a type.
    pub fn eq_field(&self, other: &FieldRef) -> LineageResult<Expr> {
        if self.field_type != other.field_type {
            return Err(self.mismatch(&format!("field '{}'", other.name)));
        }
        Ok(self.expr().eq(other.expr()))
    }

    /// Vector distance from this field to `query`.
    pub fn distance(&self, op: DistanceOp, query: Vec<f32>) -> LineageResult<Expr> {
        let value = SqlValue::Vector(query);
        if !matches!(self.field_type, FieldType::Vector(_)) || !self.field_type.accepts(&value) {
            return Err(self.mismatch("vector of that length"));
        }
        Ok(self.expr().distance(op, param(value)))
    }

    pub fn asc(&self) -> OrderBy {
        self.expr().asc()
    }

    pub fn desc(&self) -> OrderBy {
        self.expr().desc()
    }

    fn check(&self, value: SqlValue) -> LineageResult<SqlValue> {
        if self.field_type.accepts(&value) {
            Ok(value)
        } else {
            Err(self.mismatch(&format!("{} value", value.kind())))
        }
    }

    fn check_ordered(&self, value: SqlValue) -> LineageResult<SqlValue> {
        if !self.field_type.is_ordered() {
            return Err(LineageError::query_build(
                format!(
                    "Field '{}' of type {} does not support ordering comparisons",
                    self.name,
                    self.field_type.sql_type()
                ),
                ErrorCode::QryTypeMismatch,
            ));
        }
        if value.is_null() {
            return Err(self.mismatch("NULL in an ordering comparison"));
        }
        self.check(value)
    }

    fn check_all<V: Into<SqlValue>>(&self, values: impl IntoIterator<Item = V>) -> LineageResult<Vec<SqlValue>> {
        values
            .into_iter()
            .map(|v| self.check(v.into()))
            .collect()
    }

    fn require_text(&self, op: &str) -> LineageResult<()> {
        match self.field_type {
            FieldType::Text | FieldType::Enum { .. } => Ok(()),
            _ => Err(LineageError::query_build(
                format!("{} needs a text field, '{}' is {}", op, self.name, self.field_type.sql_type()),
                ErrorCode::QryTypeMismatch,
            )),
        }
    }

    fn mismatch(&self, got: &str) -> LineageError {
        LineageError::query_build(
            format!(
                "Cannot compare field '{}' of type {} with {}",
                self.name,
                self.field_type.sql_type(),
                got
            ),
            ErrorCode::QryTypeMismatch,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;
    use crate::sql::{compile_select, SelectQuery, Table};

    fn posts() -> QueryProxy {
        let schema = EntitySchema::builder("posts")
            .field(FieldDef::new("id", FieldType::BigInt).primary_key())
            .field(FieldDef::new("topic", FieldType::Text))
            .field(FieldDef::new("score", FieldType::Float))
            .field(FieldDef::new("published", FieldType::Boolean))
            .field(FieldDef::new("embedding", FieldType::Vector(3)).optional())
            .build()
            .unwrap();
        QueryProxy::new("p", Arc::new(schema))
    }

    #[test]
    fn test_or_of_equalities() {
        let p = posts();
        let topic = p.field("topic").unwrap();
        let pred = topic.eq("animals").unwrap() | topic.eq("physics").unwrap();

        let q = SelectQuery::from(Table::aliased("posts", "p"))
            .column(Expr::Star(None))
            .and_where(pred);
        let compiled = compile_select(&q).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT * FROM posts AS p WHERE (p.topic = $1 OR p.topic = $2)"
        );
        assert_eq!(
            compiled.params,
            vec![SqlValue::Text("animals".into()), SqlValue::Text("physics".into())]
        );
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let p = posts();
        let err = p.field("topic").unwrap().eq(3).unwrap_err();
        assert_eq!(err.code(), ErrorCode::QryTypeMismatch);

        let err = p.field("published").unwrap().gt(true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::QryTypeMismatch);

        let err = p.field("score").unwrap().like("x%").unwrap_err();
        assert_eq!(err.code(), ErrorCode::QryTypeMismatch);

        assert!(p.field("score").unwrap().gt(1).is_ok());
    }

    #[test]
    fn test_unknown_field() {
        let err = posts().field("nope").unwrap_err();
        assert_eq!(err.code(), ErrorCode::QryUnknownField);
    }

    #[test]
    fn test_null_equality_becomes_is_null() {
        let p = posts();
        let pred = p.field("topic").unwrap().eq(SqlValue::Null).unwrap();
        assert_eq!(pred, qcol("p", "topic").is_null());
    }

    #[test]
    fn test_vector_distance_checks_dimension() {
        let emb = posts().field("embedding").unwrap();
        assert!(emb.distance(DistanceOp::Cosine, vec![0.1, 0.2]).is_err());
        assert!(emb.distance(DistanceOp::Cosine, vec![0.1, 0.2, 0.3]).is_ok());
    }
}
