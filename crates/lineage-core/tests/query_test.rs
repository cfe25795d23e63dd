//! Integration tests for query building, compilation and hydration.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use lineage_core::sql::{col, param, SelectQuery, Table};
use lineage_core::{
    compile_select, CompiledQuery, Entity, EntitySchema, ExecutionContext, FieldDef, FieldType,
    LineageResult, QuerySet, RelationDef, SchemaRegistry, SqlExecutor, SqlValue, Versioning,
};

#[derive(Debug, Deserialize)]
struct Post {
    id: i64,
    #[serde(default)]
    comments: Vec<Comment>,
}

impl Entity for Post {
    const TABLE: &'static str = "posts";

    fn schema() -> LineageResult<EntitySchema> {
        EntitySchema::builder("posts")
            .field(FieldDef::new("id", FieldType::BigInt).primary_key())
            .field(FieldDef::new("topic", FieldType::Text))
            .relation(RelationDef::one_to_many("comments", "comments", "id", "post_id"))
            .build()
    }
}

#[derive(Debug, Deserialize)]
struct Comment {
    id: i64,
    reliability: f64,
}

impl Entity for Comment {
    const TABLE: &'static str = "comments";

    fn schema() -> LineageResult<EntitySchema> {
        EntitySchema::builder("comments")
            .field(FieldDef::new("id", FieldType::BigInt).primary_key())
            .field(FieldDef::new("post_id", FieldType::BigInt).references("posts", "id"))
            .field(FieldDef::new("reliability", FieldType::Float))
            .relation(RelationDef::one_to_many("likes", "likes", "id", "comment_id"))
            .build()
    }
}

#[derive(Debug, Deserialize)]
struct Like {
    #[allow(dead_code)]
    id: i64,
}

impl Entity for Like {
    const TABLE: &'static str = "likes";

    fn schema() -> LineageResult<EntitySchema> {
        EntitySchema::builder("likes")
            .field(FieldDef::new("id", FieldType::BigInt).primary_key())
            .field(FieldDef::new("comment_id", FieldType::BigInt).references("comments", "id"))
            .versioning(Versioning::Turn)
            .build()
    }
}

fn registry() -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register_entity::<Post>().unwrap();
    registry.register_entity::<Comment>().unwrap();
    registry.register_entity::<Like>().unwrap();
    registry.validate().unwrap();
    Arc::new(registry)
}

/// Returns canned rows and records every statement it receives.
#[derive(Default)]
struct CannedExecutor {
    rows: Vec<Value>,
    seen: Mutex<Vec<CompiledQuery>>,
}

#[async_trait]
impl SqlExecutor for CannedExecutor {
    async fn fetch(&self, query: &CompiledQuery) -> LineageResult<Vec<Value>> {
        self.seen.lock().unwrap().push(query.clone());
        Ok(self.rows.clone())
    }

    async fn execute(&self, query: &CompiledQuery) -> LineageResult<u64> {
        self.seen.lock().unwrap().push(query.clone());
        Ok(0)
    }
}

#[test]
fn test_or_filter_scenario() {
    let compiled = QuerySet::<Post>::new(registry())
        .unwrap()
        .filter(|x| Ok(x.field("topic")?.eq("animals")? | x.field("topic")?.eq("physics")?))
        .unwrap()
        .compile(&ExecutionContext::new(1))
        .unwrap();
    assert!(compiled.sql.ends_with("WHERE (p.topic = $1 OR p.topic = $2)"));
    assert_eq!(
        compiled.params,
        vec![
            SqlValue::Text("animals".into()),
            SqlValue::Text("physics".into())
        ]
    );
}

#[test]
fn test_param_count_follows_predicates() {
    let mut q = SelectQuery::from(Table::new("posts")).column(col("id"));
    for i in 0..5 {
        q.push_where(col(format!("c{}", i)).eq(param(i)));
    }
    let compiled = compile_select(&q).unwrap();
    assert_eq!(compiled.params.len(), 5);
    assert_eq!(
        compiled.params,
        (0..5).map(SqlValue::from).collect::<Vec<_>>()
    );
    assert!(compiled.sql.contains("c4 = $5"));
}

#[tokio::test]
async fn test_include_filtered_relation_scenario() {
    let registry = registry();
    let comments = QuerySet::<Comment>::new(registry.clone())
        .unwrap()
        .filter(|c| c.field("reliability")?.gt(0.5))
        .unwrap();
    let q = QuerySet::<Post>::new(registry)
        .unwrap()
        .select(&["id"])
        .unwrap()
        .include(comments)
        .unwrap();

    let executor = CannedExecutor {
        rows: vec![
            json!({"id": 1, "comments": [{"id": 1, "reliability": 0.9}, {"id": 2, "reliability": 0.7}]}),
            json!({"id": 2, "comments": [{"id": 4, "reliability": 0.6}]}),
        ],
        ..Default::default()
    };
    let posts = q.execute(&executor, &ExecutionContext::new(1)).await.unwrap();

    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].id, 1);
    assert_eq!(posts[0].comments.len(), 2);
    assert_eq!(posts[1].comments.len(), 1);
    assert!(posts.iter().flat_map(|p| &p.comments).all(|c| c.reliability > 0.5));

    let seen = executor.seen.lock().unwrap();
    let sql = &seen[0].sql;
    assert!(sql.contains("LEFT JOIN comments AS c ON (c.post_id = p.id AND c.reliability > $1)"));
    assert!(sql.contains("FILTER (WHERE c.id IS NOT NULL), '[]')"));
    assert!(sql.ends_with("GROUP BY p.id"));
}

#[test]
fn test_nested_versioned_include_is_branch_scoped() {
    let registry = registry();
    let likes = QuerySet::<Like>::new(registry.clone()).unwrap().select(&["id"]).unwrap();
    let comments = QuerySet::<Comment>::new(registry.clone())
        .unwrap()
        .select(&["id"])
        .unwrap()
        .include(likes)
        .unwrap();
    let q = QuerySet::<Post>::new(registry)
        .unwrap()
        .select(&["id"])
        .unwrap()
        .include(comments)
        .unwrap();

    // posts are unversioned, so scoping comes from the nested likes table
    let compiled = q.compile(&ExecutionContext::new(3)).unwrap();
    assert!(compiled.sql.starts_with("WITH RECURSIVE branch_hierarchy AS ("));
    assert!(compiled.sql.contains("filtered_likes AS (SELECT m.* FROM turn_hierarchy AS th INNER JOIN likes AS m ON th.id = m.turn_id)"));
    assert!(compiled.sql.contains("FROM filtered_likes AS l WHERE l.comment_id = c.id"));
    assert_eq!(compiled.params, vec![SqlValue::Int(3)]);
}

#[test]
fn test_empty_select_rejected() {
    let err = compile_select(&SelectQuery::from(Table::new("posts"))).unwrap_err();
    assert_eq!(err.code(), lineage_core::ErrorCode::QryEmptySelect);
}
