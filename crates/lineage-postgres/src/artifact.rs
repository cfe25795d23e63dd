//! Append-only writes for artifact entities.
//!
//! An artifact is a chain of rows sharing an `artifact_id`. Every change
//! inserts the next `version`; a delete inserts a tombstone version with
//! `deleted_at` set. Nothing is updated in place, so any branch that saw an
//! earlier version keeps seeing it.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use lineage_core::sql::{col, func, inline, param, InsertQuery, Table};
use lineage_core::versioning::rewrite_for_branch;
use lineage_core::{
    compile, CompiledQuery, EntitySchema, ErrorCode, ExecutionContext, Expr, LineageError,
    LineageResult, SchemaRegistry, SelectQuery, SqlExecutor, SqlValue, Turn, VersioningConfig,
};

use crate::record::{bind_values, writable_turn};

/// Reads and writes artifact versions.
pub struct ArtifactStore<X: SqlExecutor> {
    executor: Arc<X>,
    registry: Arc<SchemaRegistry>,
    max_attempts: u32,
}

impl<X: SqlExecutor> ArtifactStore<X> {
    pub fn new(executor: Arc<X>, registry: Arc<SchemaRegistry>, config: &VersioningConfig) -> Self {
        Self {
            executor,
            registry,
            max_attempts: config.artifact_insert_retries.max(1),
        }
    }

    /// Create a new artifact at version 1 under a fresh id.
    pub async fn insert_artifact(
        &self,
        ctx: &ExecutionContext,
        entity: &str,
        values: &Map<String, Value>,
    ) -> LineageResult<Value> {
        let schema = self.schema(entity)?;
        let turn = writable_turn(ctx)?;
        let fields = bind_values(schema, values)?;
        let artifact_id = Uuid::new_v4();
        let row = self
            .append_version(schema, ctx, turn, artifact_id, fields, false)
            .await?;
        info!(entity, artifact_id = %artifact_id, "artifact created");
        Ok(row)
    }

    /// Append a version carrying the visible version's fields with `changes`
    /// applied.
    pub async fn update_artifact(
        &self,
        ctx: &ExecutionContext,
        entity: &str,
        artifact_id: Uuid,
        changes: &Map<String, Value>,
    ) -> LineageResult<Value> {
        let schema = self.schema(entity)?;
        let turn = writable_turn(ctx)?;
        let mut fields = self.carried_fields(ctx, schema, artifact_id).await?;
        for (name, value) in bind_values(schema, changes)? {
            match fields.iter_mut().find(|(n, _)| *n == name) {
                Some(slot) => slot.1 = value,
                None => fields.push((name, value)),
            }
        }
        self.append_version(schema, ctx, turn, artifact_id, fields, false)
            .await
    }

    /// Append a tombstone version. Earlier versions stay in place.
    pub async fn delete_artifact(
        &self,
        ctx: &ExecutionContext,
        entity: &str,
        artifact_id: Uuid,
    ) -> LineageResult<Value> {
        let schema = self.schema(entity)?;
        let turn = writable_turn(ctx)?;
        let fields = self.carried_fields(ctx, schema, artifact_id).await?;
        let row = self
            .append_version(schema, ctx, turn, artifact_id, fields, true)
            .await?;
        info!(entity, artifact_id = %artifact_id, "artifact deleted");
        Ok(row)
    }

    /// The latest live version visible from the context's branch, or the
    /// stored row of an explicit `version` regardless of branch.
    pub async fn get_artifact(
        &self,
        ctx: &ExecutionContext,
        entity: &str,
        artifact_id: Uuid,
        version: Option<i64>,
    ) -> LineageResult<Option<Value>> {
        let schema = self.schema(entity)?;
        let mut query = SelectQuery::from(Table::new(&schema.name))
            .column(Expr::Star(None))
            .and_where(col("artifact_id").eq(param(artifact_id)));
        query = match version {
            Some(v) => query.and_where(col("version").eq(param(v))),
            None => rewrite_for_branch(query, &self.registry, ctx.branch_id, None)?,
        };
        self.executor.fetch_optional(&compile(&query.into())?).await
    }

    fn schema(&self, entity: &str) -> LineageResult<&EntitySchema> {
        let schema = self.registry.get(entity)?;
        if !schema.is_artifact() {
            return Err(LineageError::query_build(
                format!("'{}' is not an artifact entity", entity),
                ErrorCode::QryUnsupported,
            ));
        }
        Ok(schema.as_ref())
    }

    /// Declared fields of the visible version, without the primary key.
    async fn carried_fields(
        &self,
        ctx: &ExecutionContext,
        schema: &EntitySchema,
        artifact_id: Uuid,
    ) -> LineageResult<Vec<(String, SqlValue)>> {
        let current = self
            .get_artifact(ctx, &schema.name, artifact_id, None)
            .await?
            .ok_or_else(|| LineageError::artifact_not_found(artifact_id, ctx.branch_id))?;
        schema
            .user_fields()
            .filter(|f| f.name != schema.primary_key)
            .map(|f| {
                let value = current.get(&f.name).unwrap_or(&Value::Null);
                Ok((f.name.clone(), f.value_from_json(value)?))
            })
            .collect()
    }

    async fn latest_version(&self, schema: &EntitySchema, artifact_id: Uuid) -> LineageResult<i64> {
        let query = SelectQuery::from(Table::new(&schema.name))
            .column_as(
                Expr::Coalesce(vec![func("MAX", vec![col("version")]), inline(0)]),
                "latest",
            )
            .and_where(col("artifact_id").eq(param(artifact_id)));
        let row = self.executor.fetch_optional(&compile(&query.into())?).await?;
        Ok(row.and_then(|r| r["latest"].as_i64()).unwrap_or(0))
    }

    /// Insert the next version, re-reading the version number after a
    /// conflicting concurrent append.
    async fn append_version(
        &self,
        schema: &EntitySchema,
        ctx: &ExecutionContext,
        turn: &Turn,
        artifact_id: Uuid,
        fields: Vec<(String, SqlValue)>,
        tombstone: bool,
    ) -> LineageResult<Value> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let version = self.latest_version(schema, artifact_id).await? + 1;
            let query = version_insert(schema, ctx, turn, artifact_id, version, &fields, tombstone)?;
            match self.executor.fetch_optional(&query).await {
                Ok(Some(row)) => return Ok(row),
                Ok(None) => {
                    return Err(LineageError::backend(format!(
                        "Insert into '{}' returned no row",
                        schema.name
                    )))
                }
                Err(e) if e.is_unique_violation() && attempt < self.max_attempts => {
                    warn!(
                        artifact_id = %artifact_id,
                        version,
                        attempt,
                        "artifact version taken by a concurrent write, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn version_insert(
    schema: &EntitySchema,
    ctx: &ExecutionContext,
    turn: &Turn,
    artifact_id: Uuid,
    version: i64,
    fields: &[(String, SqlValue)],
    tombstone: bool,
) -> LineageResult<CompiledQuery> {
    let deleted_at = if tombstone {
        SqlValue::Timestamp(Utc::now())
    } else {
        SqlValue::Null
    };
    let mut columns: Vec<String> = fields.iter().map(|(c, _)| c.clone()).collect();
    let mut row: Vec<Expr> = fields.iter().map(|(_, v)| param(v.clone())).collect();
    for (column, value) in [
        ("artifact_id", SqlValue::Uuid(artifact_id)),
        ("version", SqlValue::Int(version)),
        ("deleted_at", deleted_at),
        ("branch_id", SqlValue::Int(ctx.branch_id)),
        ("turn_id", SqlValue::Int(turn.id)),
    ] {
        columns.push(column.to_string());
        row.push(param(value));
    }
    compile(
        &InsertQuery::values(&schema.name, columns, row)
            .returning(vec![Expr::Star(None)])
            .into(),
    )
}
