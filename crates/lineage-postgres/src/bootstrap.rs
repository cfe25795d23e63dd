//! Table creation for the version graph and for entity schemas.
//!
//! Every statement is idempotent or has its "already exists" failure
//! swallowed, so bootstrap can run on every start.

use std::sync::Arc;

use tracing::{info, warn};

use lineage_core::sql::quote_ident;

use crate::version_backend::SYNC_BRANCH_IDS;
use lineage_core::{
    CompiledQuery, EntitySchema, FieldDef, FieldType, LineageResult, SqlExecutor, SqlValue,
    VersioningConfig,
};

const CREATE_BRANCHES: &str = "CREATE TABLE IF NOT EXISTS branches (\
id BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY, \
name TEXT, \
current_index BIGINT NOT NULL DEFAULT 0, \
forked_from_index BIGINT, \
forked_from_turn_id BIGINT, \
forked_from_branch_id BIGINT REFERENCES branches (id), \
created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())";

const CREATE_TURNS: &str = "CREATE TABLE IF NOT EXISTS turns (\
id BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY, \
branch_id BIGINT NOT NULL REFERENCES branches (id), \
index BIGINT NOT NULL, \
status TEXT NOT NULL DEFAULT 'staged' CHECK (status IN ('staged', 'committed', 'reverted')), \
created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
ended_at TIMESTAMPTZ, \
message TEXT, \
metadata JSONB, \
UNIQUE (branch_id, index))";

/// Seeds the default branch under its configured id unless that id exists.
const SEED_MAIN: &str = "INSERT INTO branches (id, name, current_index) \
VALUES ($1, $2, 0) ON CONFLICT (id) DO NOTHING RETURNING id";

/// DDL for the `branches` and `turns` tables and their indexes.
pub fn versioning_ddl(config: &VersioningConfig) -> Vec<String> {
    let mut ddl = vec![
        CREATE_BRANCHES.to_string(),
        CREATE_TURNS.to_string(),
        "CREATE INDEX IF NOT EXISTS branches_forked_from_branch_id_idx ON branches (forked_from_branch_id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS turns_branch_id_idx ON turns (branch_id)".to_string(),
    ];
    if config.enforce_single_staged_turn {
        ddl.push(
            "CREATE UNIQUE INDEX IF NOT EXISTS turns_single_staged_idx ON turns (branch_id) \
             WHERE status = 'staged'"
                .to_string(),
        );
    }
    ddl
}

/// DDL for one entity: extension and enum types first, then the table and
/// its indexes.
pub fn entity_table_ddl(schema: &EntitySchema) -> Vec<String> {
    let mut ddl = Vec::new();
    if schema
        .fields
        .iter()
        .any(|f| matches!(f.field_type, FieldType::Vector(_)))
    {
        ddl.push("CREATE EXTENSION IF NOT EXISTS vector".to_string());
    }
    for field in &schema.fields {
        if let FieldType::Enum { name, values } = &field.field_type {
            let labels: Vec<String> = values
                .iter()
                .map(|v| SqlValue::Text(v.clone()).to_sql_literal())
                .collect();
            ddl.push(format!(
                "CREATE TYPE {} AS ENUM ({})",
                quote_ident(name),
                labels.join(", ")
            ));
        }
    }

    let table = quote_ident(&schema.name);
    let mut columns: Vec<String> = schema.fields.iter().map(column_ddl).collect();
    if schema.is_artifact() {
        columns.push("UNIQUE (artifact_id, version)".to_string());
    }
    ddl.push(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table,
        columns.join(", ")
    ));

    for field in &schema.fields {
        if field.primary_key || !(field.index || field.foreign_key.is_some()) {
            continue;
        }
        ddl.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&format!("{}_{}_idx", schema.name, field.name)),
            table,
            quote_ident(&field.name)
        ));
    }
    ddl
}

fn column_ddl(field: &FieldDef) -> String {
    let name = quote_ident(&field.name);
    let mut sql = match (&field.field_type, field.primary_key) {
        (FieldType::Integer | FieldType::BigInt, true) => {
            format!("{} BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY", name)
        }
        (FieldType::Uuid, true) => format!("{} UUID PRIMARY KEY DEFAULT gen_random_uuid()", name),
        (ty, true) => format!("{} {} PRIMARY KEY", name, sql_type(ty)),
        (ty, false) => format!("{} {}", name, sql_type(ty)),
    };
    if !field.primary_key && !field.optional {
        sql.push_str(" NOT NULL");
    }
    if let Some(fk) = &field.foreign_key {
        sql.push_str(&format!(
            " REFERENCES {} ({})",
            quote_ident(&fk.table),
            quote_ident(&fk.column)
        ));
    }
    sql
}

fn sql_type(ty: &FieldType) -> String {
    match ty {
        FieldType::Enum { name, .. } => quote_ident(name),
        other => other.sql_type(),
    }
}

fn seed_main_query(config: &VersioningConfig) -> CompiledQuery {
    CompiledQuery {
        sql: SEED_MAIN.to_string(),
        params: vec![
            SqlValue::Int(config.default_branch_id),
            SqlValue::Text(config.main_branch_name.clone()),
        ],
    }
}

/// Runs DDL through an executor.
pub struct Bootstrap<X: SqlExecutor> {
    executor: Arc<X>,
    config: VersioningConfig,
}

impl<X: SqlExecutor> Bootstrap<X> {
    pub fn new(executor: Arc<X>, config: VersioningConfig) -> Self {
        Self { executor, config }
    }

    /// Create `branches` and `turns` and seed the default branch.
    pub async fn create_versioning_tables(&self) -> LineageResult<()> {
        for statement in versioning_ddl(&self.config) {
            self.run_ddl(&statement).await?;
        }

        let seed = seed_main_query(&self.config);
        if let Some(row) = self.executor.fetch_optional(&seed).await? {
            self.executor
                .fetch(&CompiledQuery {
                    sql: SYNC_BRANCH_IDS.to_string(),
                    params: Vec::new(),
                })
                .await?;
            info!(branch_id = %row["id"], name = %self.config.main_branch_name, "seeded main branch");
        }
        Ok(())
    }

    /// Create the table, enum types and indexes for `schema`.
    pub async fn create_entity_table(&self, schema: &EntitySchema) -> LineageResult<()> {
        for statement in entity_table_ddl(schema) {
            self.run_ddl(&statement).await?;
        }
        info!(table = %schema.name, "entity table ready");
        Ok(())
    }

    /// Drop the table for `schema`. Enum types are left in place.
    pub async fn drop_entity_table(&self, schema: &EntitySchema) -> LineageResult<()> {
        self.run_ddl(&format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            quote_ident(&schema.name)
        ))
        .await?;
        info!(table = %schema.name, "entity table dropped");
        Ok(())
    }

    async fn run_ddl(&self, statement: &str) -> LineageResult<()> {
        let query = CompiledQuery {
            sql: statement.to_string(),
            params: Vec::new(),
        };
        match self.executor.execute(&query).await {
            Ok(_) => Ok(()),
            // concurrent CREATE ... IF NOT EXISTS can still trip the catalog's unique index
            Err(e) if e.is_already_exists() || e.is_unique_violation() => {
                warn!(error = %e, "object already exists, continuing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use lineage_core::{ErrorCode, LineageError, Versioning};

    /// Fails CREATE TYPE as a second bootstrap would, and every DROP.
    #[derive(Default)]
    struct RecordingExecutor {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SqlExecutor for RecordingExecutor {
        async fn fetch(&self, query: &CompiledQuery) -> LineageResult<Vec<Value>> {
            self.seen.lock().unwrap().push(query.sql.clone());
            Ok(vec![json!({"id": 1})])
        }

        async fn execute(&self, query: &CompiledQuery) -> LineageResult<u64> {
            self.seen.lock().unwrap().push(query.sql.clone());
            if query.sql.starts_with("CREATE TYPE") {
                return Err(LineageError::Backend {
                    message: "type \"mood\" already exists".into(),
                    code: ErrorCode::DbAlreadyExists,
                    sql: None,
                    params: Vec::new(),
                    source: None,
                });
            }
            if query.sql.starts_with("DROP") {
                return Err(LineageError::backend("permission denied"));
            }
            Ok(0)
        }
    }

    fn documents() -> EntitySchema {
        EntitySchema::builder("documents")
            .field(FieldDef::new("id", FieldType::BigInt).primary_key())
            .field(FieldDef::new("title", FieldType::Text))
            .field(FieldDef::new("embedding", FieldType::Vector(3)).optional())
            .field(FieldDef::new(
                "mood",
                FieldType::Enum {
                    name: "mood".into(),
                    values: vec!["happy".into(), "sad".into()],
                },
            ))
            .versioning(Versioning::Artifact)
            .build()
            .unwrap()
    }

    #[test]
    fn test_artifact_table_ddl() {
        let ddl = entity_table_ddl(&documents());
        assert_eq!(ddl[0], "CREATE EXTENSION IF NOT EXISTS vector");
        assert_eq!(ddl[1], "CREATE TYPE mood AS ENUM ('happy', 'sad')");
        let table = &ddl[2];
        assert!(table.starts_with("CREATE TABLE IF NOT EXISTS documents (id BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY, title TEXT NOT NULL"));
        assert!(table.contains("embedding VECTOR(3),"));
        assert!(table.contains("deleted_at TIMESTAMPTZ,"));
        assert!(table.contains("branch_id BIGINT NOT NULL REFERENCES branches (id)"));
        assert!(table.ends_with("UNIQUE (artifact_id, version))"));
        assert!(ddl.contains(&"CREATE INDEX IF NOT EXISTS documents_artifact_id_idx ON documents (artifact_id)".to_string()));
        assert!(ddl.contains(&"CREATE INDEX IF NOT EXISTS documents_turn_id_idx ON documents (turn_id)".to_string()));
    }

    #[test]
    fn test_single_staged_index_follows_config() {
        let strict = versioning_ddl(&VersioningConfig::default());
        assert!(strict.iter().any(|s| s.contains("turns_single_staged_idx")));

        let relaxed = versioning_ddl(&VersioningConfig {
            enforce_single_staged_turn: false,
            ..Default::default()
        });
        assert!(!relaxed.iter().any(|s| s.contains("turns_single_staged_idx")));
    }

    #[tokio::test]
    async fn test_already_exists_is_swallowed() {
        let executor = Arc::new(RecordingExecutor::default());
        let bootstrap = Bootstrap::new(executor.clone(), VersioningConfig::default());

        bootstrap.create_versioning_tables().await.unwrap();
        bootstrap.create_entity_table(&documents()).await.unwrap();

        let seen = executor.seen.lock().unwrap();
        assert!(seen.iter().any(|s| s.starts_with("INSERT INTO branches")));
        assert!(seen.iter().any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS documents")));
    }

    #[tokio::test]
    async fn test_main_seeded_under_configured_id() {
        let config = VersioningConfig {
            default_branch_id: 5,
            ..Default::default()
        };
        let seed = seed_main_query(&config);
        assert!(seed.sql.starts_with("INSERT INTO branches (id, name, current_index) VALUES ($1, $2, 0)"));
        assert!(seed.sql.contains("ON CONFLICT (id) DO NOTHING"));
        assert_eq!(seed.params, vec![SqlValue::Int(5), SqlValue::Text("main".into())]);

        let executor = Arc::new(RecordingExecutor::default());
        Bootstrap::new(executor.clone(), config)
            .create_versioning_tables()
            .await
            .unwrap();
        let seen = executor.seen.lock().unwrap();
        let at = seen.iter().position(|s| *s == SEED_MAIN).unwrap();
        assert_eq!(seen[at + 1], SYNC_BRANCH_IDS);
    }

    #[test]
    fn test_other_failures_propagate() {
        let bootstrap = Bootstrap::new(
            Arc::new(RecordingExecutor::default()),
            VersioningConfig::default(),
        );
        let err = tokio_test::block_on(bootstrap.drop_entity_table(&documents())).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DbOperationFailed);
    }
}
