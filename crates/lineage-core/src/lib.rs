//! lineage-core - Core library for lineage.
//!
//! This crate provides the expression AST and Postgres SQL compiler, the
//! relation projection builder, entity schemas, and the branch/turn version
//! graph that gives relational rows Git-like history.
//!
//! # Example
//!
//! ```ignore
//! use lineage_core::{ExecutionContext, QuerySet, VersionGraph};
//!
//! let graph = VersionGraph::new(backend, config.versioning.clone());
//! let main = graph.get_or_create_main().await?;
//! let turn = graph.start_turn(main.id, Some("import".into()), serde_json::Value::Null).await?;
//! graph.commit_turn(turn.id).await?;
//!
//! let feature = graph.fork_from(turn.id, Some("feature".into())).await?;
//! let ctx = ExecutionContext::new(feature.id);
//!
//! let posts = QuerySet::<Post>::new(registry.clone())?
//!     .filter(|p| Ok(p.field("topic")?.eq("animals")? | p.field("topic")?.eq("physics")?))?
//!     .include(QuerySet::<Comment>::new(registry.clone())?)?
//!     .execute(&executor, &ctx)
//!     .await?;
//! ```

pub mod config;
pub mod dsl;
pub mod error;
pub mod query_set;
pub mod schema;
pub mod sql;
pub mod traits;
pub mod versioning;

// Re-export commonly used types
pub use config::{DatabaseConfig, LineageConfig, QdrantConfig, VersioningConfig};
pub use dsl::{FieldRef, QueryProxy};
pub use error::{ErrorCode, LineageError, LineageResult};
pub use query_set::QuerySet;
pub use schema::{
    Cardinality, Entity, EntitySchema, FieldDef, FieldType, Junction, RelationDef,
    SchemaRegistry, Versioning,
};
pub use sql::{compile, compile_select, CompiledQuery, Expr, SelectQuery, SqlValue, Statement};
pub use traits::{Embedder, FilterTranslator, SqlExecutor};
pub use versioning::{
    Branch, BranchDiff, ExecutionContext, MemoryVersionBackend, NewBranch, NewTurn, Turn,
    TurnStatus, VersionBackend, VersionGraph,
};
