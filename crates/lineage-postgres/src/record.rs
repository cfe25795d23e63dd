//! Writes for plain and turn-versioned rows.
//!
//! Inserts into a turn-versioned table are stamped with the context's branch
//! and turn. Updates change the row in place and keep the stamp it was
//! written with; deletes remove the row.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use lineage_core::sql::{col, param, quote_ident, DeleteQuery, InsertQuery, Table, UpdateQuery};
use lineage_core::{
    compile, EntitySchema, ErrorCode, ExecutionContext, Expr, LineageError, LineageResult,
    SchemaRegistry, SqlExecutor, SqlValue, Statement, Turn,
};

/// Columns that writers set themselves.
const STAMP_COLUMNS: [&str; 5] = ["branch_id", "turn_id", "artifact_id", "version", "deleted_at"];

/// Convert caller-supplied values into `(column, value)` pairs, checked
/// against the schema. Stamp columns are rejected; they are set by the store.
pub(crate) fn bind_values(
    schema: &EntitySchema,
    values: &Map<String, Value>,
) -> LineageResult<Vec<(String, SqlValue)>> {
    let mut bound = Vec::with_capacity(values.len());
    for (name, value) in values {
        let field = schema.field(name).ok_or_else(|| {
            LineageError::query_build(
                format!("Entity '{}' has no field '{}'", schema.name, name),
                ErrorCode::QryUnknownField,
            )
        })?;
        if schema.is_versioned() && STAMP_COLUMNS.contains(&name.as_str()) {
            return Err(LineageError::query_build(
                format!("Field '{}' of '{}' is managed by versioning", name, schema.name),
                ErrorCode::QryUnsupported,
            ));
        }
        bound.push((name.clone(), field.value_from_json(value)?));
    }
    Ok(bound)
}

/// Quoted names of every registered table stamped with a `turn_id`,
/// artifact tables included.
pub(crate) fn versioned_tables(registry: &SchemaRegistry) -> Vec<String> {
    registry
        .entities()
        .filter(|schema| schema.is_versioned())
        .map(|schema| quote_ident(&schema.name))
        .collect()
}

/// The staged turn writes are stamped with.
pub(crate) fn writable_turn(ctx: &ExecutionContext) -> LineageResult<&Turn> {
    let turn = ctx.require_turn()?;
    if !turn.is_staged() {
        return Err(LineageError::versioning(format!(
            "Turn {} is {}, writes need a staged turn",
            turn.id, turn.status
        )));
    }
    Ok(turn)
}

/// Inserts, updates and deletes rows of registered entities.
pub struct RecordStore<X: SqlExecutor> {
    executor: Arc<X>,
    registry: Arc<SchemaRegistry>,
}

impl<X: SqlExecutor> RecordStore<X> {
    pub fn new(executor: Arc<X>, registry: Arc<SchemaRegistry>) -> Self {
        Self { executor, registry }
    }

    /// Insert one row and return it as stored.
    pub async fn insert(
        &self,
        ctx: &ExecutionContext,
        entity: &str,
        values: &Map<String, Value>,
    ) -> LineageResult<Value> {
        let statement = self.insert_statement(ctx, entity, values)?;
        self.fetch_written(&statement, entity).await
    }

    /// Update the row with primary key `id`. Returns `None` when no row
    /// matched.
    pub async fn update(
        &self,
        ctx: &ExecutionContext,
        entity: &str,
        id: impl Into<SqlValue>,
        changes: &Map<String, Value>,
    ) -> LineageResult<Option<Value>> {
        let statement = self.update_statement(ctx, entity, id.into(), changes)?;
        let compiled = compile(&statement)?;
        self.executor.fetch_optional(&compiled).await
    }

    /// Delete the row with primary key `id`. Returns the deleted row.
    pub async fn delete(
        &self,
        ctx: &ExecutionContext,
        entity: &str,
        id: impl Into<SqlValue>,
    ) -> LineageResult<Option<Value>> {
        let schema = self.schema(entity)?;
        if schema.is_versioned() {
            writable_turn(ctx)?;
        }
        let statement: Statement = DeleteQuery {
            table: Table::new(&schema.name),
            where_clause: Some(col(&schema.primary_key).eq(param(id.into()))),
            returning: vec![Expr::Star(None)],
        }
        .into();
        let compiled = compile(&statement)?;
        self.executor.fetch_optional(&compiled).await
    }

    fn schema(&self, entity: &str) -> LineageResult<&EntitySchema> {
        let schema = self.registry.get(entity)?;
        if schema.is_artifact() {
            return Err(LineageError::query_build(
                format!("'{}' is an artifact entity; write it through ArtifactStore", entity),
                ErrorCode::QryUnsupported,
            ));
        }
        Ok(schema.as_ref())
    }

    fn insert_statement(
        &self,
        ctx: &ExecutionContext,
        entity: &str,
        values: &Map<String, Value>,
    ) -> LineageResult<Statement> {
        let schema = self.schema(entity)?;
        let mut bound = bind_values(schema, values)?;
        if schema.is_versioned() {
            let turn = writable_turn(ctx)?;
            bound.push(("branch_id".into(), SqlValue::Int(ctx.branch_id)));
            bound.push(("turn_id".into(), SqlValue::Int(turn.id)));
        }
        let (columns, row): (Vec<String>, Vec<Expr>) =
            bound.into_iter().map(|(c, v)| (c, param(v))).unzip();
        Ok(InsertQuery::values(&schema.name, columns, row)
            .returning(vec![Expr::Star(None)])
            .into())
    }

    fn update_statement(
        &self,
        ctx: &ExecutionContext,
        entity: &str,
        id: SqlValue,
        changes: &Map<String, Value>,
    ) -> LineageResult<Statement> {
        let schema = self.schema(entity)?;
        if schema.is_versioned() {
            writable_turn(ctx)?;
        }
        let set = bind_values(schema, changes)?
            .into_iter()
            .filter(|(c, _)| *c != schema.primary_key)
            .map(|(c, v)| (c, param(v)))
            .collect();
        Ok(UpdateQuery {
            table: Table::new(&schema.name),
            set,
            where_clause: Some(col(&schema.primary_key).eq(param(id))),
            returning: vec![Expr::Star(None)],
        }
        .into())
    }

    async fn fetch_written(&self, statement: &Statement, entity: &str) -> LineageResult<Value> {
        let compiled = compile(statement)?;
        let row = self
            .executor
            .fetch_optional(&compiled)
            .await?
            .ok_or_else(|| LineageError::backend(format!("Insert into '{}' returned no row", entity)))?;
        debug!(entity, "row written");
        Ok(row)
    }
}
