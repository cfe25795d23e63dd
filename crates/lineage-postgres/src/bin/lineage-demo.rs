//! lineage demo - walks a conversation through a fork on a live database.
//!
//! # Configuration
//!
//! - `DATABASE_URL` or `LINEAGE_DATABASE_URL` - Postgres connection string
//! - `RUST_LOG` - Optional, log filter (defaults to `info`)
//!
//! The demo creates the `branches`, `turns` and `demo_messages` tables if
//! they are missing and leaves its rows behind.

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lineage_core::{
    Entity, EntitySchema, ExecutionContext, FieldDef, FieldType, LineageConfig, LineageResult,
    QuerySet, SchemaRegistry, Versioning, VersionGraph,
};
use lineage_postgres::{Bootstrap, PostgresExecutor, PostgresVersionBackend, RecordStore};

#[derive(Debug, Deserialize)]
struct DemoMessage {
    id: i64,
    role: String,
    content: String,
    turn_id: i64,
}

impl Entity for DemoMessage {
    const TABLE: &'static str = "demo_messages";

    fn schema() -> LineageResult<EntitySchema> {
        EntitySchema::builder("demo_messages")
            .field(FieldDef::new("id", FieldType::BigInt).primary_key())
            .field(FieldDef::new("role", FieldType::Text))
            .field(FieldDef::new("content", FieldType::Text))
            .versioning(Versioning::Turn)
            .build()
    }
}

fn message(role: &str, content: &str) -> Map<String, Value> {
    let mut values = Map::new();
    values.insert("role".to_string(), json!(role));
    values.insert("content".to_string(), json!(content));
    values
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = LineageConfig::from_env();
    config.validate()?;

    let executor = Arc::new(PostgresExecutor::new(&config.database)?);
    executor.ping().await?;

    let mut registry = SchemaRegistry::new();
    let schema = registry.register_entity::<DemoMessage>()?;
    let registry = Arc::new(registry);

    let bootstrap = Bootstrap::new(executor.clone(), config.versioning.clone());
    bootstrap.create_versioning_tables().await?;
    bootstrap.create_entity_table(&schema).await?;

    let graph = VersionGraph::new(
        Arc::new(PostgresVersionBackend::new(executor.clone()).with_registry(&registry)),
        config.versioning.clone(),
    );
    let store = RecordStore::new(executor.clone(), registry.clone());
    let store = &store;

    let main = graph.get_or_create_main().await?;
    let main_ctx = ExecutionContext::from_config(&config.versioning);

    let (question, _) = graph
        .run_in_turn(&main_ctx, Some("user asks".into()), |ctx| async move {
            store
                .insert(&ctx, DemoMessage::TABLE, &message("user", "What is a turn?"))
                .await
        })
        .await?;
    let (answer, _) = graph
        .run_in_turn(&main_ctx, Some("assistant answers".into()), |ctx| async move {
            store
                .insert(&ctx, DemoMessage::TABLE, &message("assistant", "A unit of change."))
                .await
        })
        .await?;
    graph
        .run_in_turn(&main_ctx, Some("assistant rambles".into()), |ctx| async move {
            store
                .insert(&ctx, DemoMessage::TABLE, &message("assistant", "Also, about turns..."))
                .await
        })
        .await?;

    // Drop the rambling turn and its message from main.
    let dropped = graph.rewind_to(main.id, answer.id).await?;
    println!("rewound main, dropped {} turn(s)", dropped.len());

    // Retry the answer on a branch forked after the question.
    let retry = graph.fork_from(question.id, Some("retry".into())).await?;
    let retry_ctx = ExecutionContext::new(retry.id);
    graph
        .run_in_turn(&retry_ctx, Some("assistant retries".into()), |ctx| async move {
            store
                .insert(
                    &ctx,
                    DemoMessage::TABLE,
                    &message("assistant", "A staged or committed step on a branch."),
                )
                .await
        })
        .await?;

    for ctx in [&main_ctx, &retry_ctx] {
        let messages = QuerySet::<DemoMessage>::new(registry.clone())?
            .order_by("id")?
            .execute(executor.as_ref(), ctx)
            .await?;
        println!("branch {}:", ctx.branch_id);
        for turn in graph.visible_turns(ctx.branch_id).await? {
            println!(
                "  turn {} (branch {}, index {}, {}) {}",
                turn.id,
                turn.branch_id,
                turn.index,
                turn.status,
                turn.message.as_deref().unwrap_or("")
            );
        }
        for m in messages {
            println!("  [{} turn {}] {}: {}", m.id, m.turn_id, m.role, m.content);
        }
    }

    let diff = graph.diff_branches(main.id, retry.id).await?;
    println!("{:#?}", diff);
    Ok(())
}
