//! Scopes queries over versioned tables to what one branch can see.
//!
//! The rewrite prepends three layers of CTEs and re-points every reference
//! to a versioned table at its filtered counterpart:
//!
//! ```text
//! branch_hierarchy   target branch and its ancestors, each with a turn ceiling
//! turn_hierarchy     non-reverted turns under those ceilings
//! filtered_<table>   rows written by visible turns (latest live version for artifacts)
//! ```
//!
//! Visibility is computed entirely at read time. No stored row changes.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::LineageResult;
use crate::schema::SchemaRegistry;
use crate::sql::{
    col, inline, param, qcol, Cte, CteBody, Expr, FromTarget, JoinKind, SelectQuery, Table,
    UnionQuery,
};

pub const BRANCH_HIERARCHY: &str = "branch_hierarchy";
pub const TURN_HIERARCHY: &str = "turn_hierarchy";

/// Name of the CTE standing in for a versioned table.
pub fn filtered_name(table: &str) -> String {
    format!("filtered_{}", table)
}

/// Rewrite `query` to read versioned tables as seen from `branch_id`.
///
/// `turn_limit` caps the visible turns to the most recent `n`. Queries that
/// touch no versioned table are returned unchanged.
pub fn rewrite_for_branch(
    mut query: SelectQuery,
    registry: &SchemaRegistry,
    branch_id: i64,
    turn_limit: Option<u64>,
) -> LineageResult<SelectQuery> {
    let mut versioned = BTreeSet::new();
    query.for_each_table_mut(&mut |t: &mut Table| {
        if is_versioned(registry, &t.name) {
            versioned.insert(t.name.clone());
        }
    });
    if versioned.is_empty() {
        return Ok(query);
    }

    query.for_each_table_mut(&mut |t: &mut Table| {
        if versioned.contains(&t.name) {
            if t.alias.is_none() {
                t.alias = Some(t.name.clone());
            }
            t.name = filtered_name(&t.name);
        }
    });

    let mut ctes = vec![branch_hierarchy(branch_id), turn_hierarchy(turn_limit)];
    for table in &versioned {
        let schema = registry.get(table)?;
        let body = if schema.is_artifact() {
            latest_artifact_rows(table)
        } else {
            turn_rows(table)
        };
        ctes.push(Cte {
            name: filtered_name(table),
            body: CteBody::Select(body),
        });
    }
    debug!(branch_id, tables = ?versioned, "scoping query to branch");
    query.prepend_ctes(ctes);
    Ok(query)
}

fn is_versioned(registry: &SchemaRegistry, table: &str) -> bool {
    registry
        .get(table)
        .map(|s| s.is_versioned())
        .unwrap_or(false)
}

/// The target branch with its own `current_index` as ceiling; each ancestor
/// is capped at the fork index recorded on its child.
fn branch_hierarchy(branch_id: i64) -> Cte {
    let seed = SelectQuery::from(Table::new("branches"))
        .column(col("id"))
        .column(col("name"))
        .column(col("forked_from_index"))
        .column(col("forked_from_branch_id"))
        .column_as(col("current_index"), "start_turn_index")
        .and_where(col("id").eq(param(branch_id)));

    let step = SelectQuery::from(Table::aliased("branches", "b"))
        .column(qcol("b", "id"))
        .column(qcol("b", "name"))
        .column(qcol("b", "forked_from_index"))
        .column(qcol("b", "forked_from_branch_id"))
        .column_as(qcol("bh", "forked_from_index"), "start_turn_index")
        .join(
            JoinKind::Inner,
            Table::aliased(BRANCH_HIERARCHY, "bh"),
            qcol("b", "id").eq(qcol("bh", "forked_from_branch_id")),
        );

    Cte {
        name: BRANCH_HIERARCHY.to_string(),
        body: CteBody::Union(UnionQuery {
            left: Box::new(seed),
            right: Box::new(step),
            all: true,
        }),
    }
}

fn turn_hierarchy(turn_limit: Option<u64>) -> Cte {
    let mut body = SelectQuery::from(Table::aliased(BRANCH_HIERARCHY, "bh"))
        .column(Expr::Star(Some("t".to_string())))
        .join(
            JoinKind::Inner,
            Table::aliased("turns", "t"),
            qcol("bh", "id").eq(qcol("t", "branch_id")),
        )
        .and_where(
            qcol("t", "index")
                .lte(qcol("bh", "start_turn_index"))
                .and(qcol("t", "status").neq(inline("reverted"))),
        );
    if let Some(n) = turn_limit {
        body = body.order_by(qcol("t", "index").desc()).limit(n);
    }
    Cte {
        name: TURN_HIERARCHY.to_string(),
        body: CteBody::Select(body),
    }
}

/// Rows of a turn-versioned table written by a visible turn.
fn turn_rows(table: &str) -> SelectQuery {
    SelectQuery::from(Table::aliased(TURN_HIERARCHY, "th"))
        .column(Expr::Star(Some("m".to_string())))
        .join(
            JoinKind::Inner,
            Table::aliased(table, "m"),
            qcol("th", "id").eq(qcol("m", "turn_id")),
        )
}

/// Newest visible version of each artifact, tombstones removed.
///
/// The version reduction runs before the `deleted_at` filter so a tombstone
/// hides the artifact instead of exposing the version before it.
fn latest_artifact_rows(table: &str) -> SelectQuery {
    let newest = turn_rows(table)
        .distinct_on(vec![qcol("m", "artifact_id")])
        .order_by(qcol("m", "artifact_id").asc())
        .order_by(qcol("m", "version").desc());

    SelectQuery::from(FromTarget::Subquery {
        query: Box::new(newest),
        alias: "latest".to_string(),
    })
    .column(Expr::Star(Some("latest".to_string())))
    .and_where(qcol("latest", "deleted_at").is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, FieldDef, FieldType, Versioning};
    use crate::sql::{compile_select, SqlValue};

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::builder("messages")
                    .field(FieldDef::new("id", FieldType::BigInt).primary_key())
                    .field(FieldDef::new("content", FieldType::Text))
                    .versioning(Versioning::Turn)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                EntitySchema::builder("documents")
                    .field(FieldDef::new("id", FieldType::BigInt).primary_key())
                    .field(FieldDef::new("title", FieldType::Text))
                    .versioning(Versioning::Artifact)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                EntitySchema::builder("users")
                    .field(FieldDef::new("id", FieldType::BigInt).primary_key())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_turn_versioned_rewrite() {
        let q = SelectQuery::from(Table::aliased("messages", "m1"))
            .column(qcol("m1", "content"))
            .and_where(qcol("m1", "content").like(param("%hi%")));
        let rewritten = rewrite_for_branch(q, &registry(), 4, None).unwrap();
        let compiled = compile_select(&rewritten).unwrap();

        assert_eq!(
            compiled.sql,
            "WITH RECURSIVE branch_hierarchy AS (\
             SELECT id, name, forked_from_index, forked_from_branch_id, current_index AS start_turn_index FROM branches WHERE id = $1 \
             UNION ALL \
             SELECT b.id, b.name, b.forked_from_index, b.forked_from_branch_id, bh.forked_from_index AS start_turn_index FROM branches AS b INNER JOIN branch_hierarchy AS bh ON b.id = bh.forked_from_branch_id\
             ), turn_hierarchy AS (\
             SELECT t.* FROM branch_hierarchy AS bh INNER JOIN turns AS t ON bh.id = t.branch_id WHERE (t.index <= bh.start_turn_index AND t.status != 'reverted')\
             ), filtered_messages AS (\
             SELECT m.* FROM turn_hierarchy AS th INNER JOIN messages AS m ON th.id = m.turn_id\
             ) \
             SELECT m1.content FROM filtered_messages AS m1 WHERE m1.content LIKE $2"
        );
        assert_eq!(
            compiled.params,
            vec![SqlValue::Int(4), SqlValue::Text("%hi%".into())]
        );
    }

    #[test]
    fn test_artifact_reduction_precedes_tombstone_filter() {
        let q = SelectQuery::from(Table::new("documents")).column(col("title"));
        let sql = compile_select(&rewrite_for_branch(q, &registry(), 1, None).unwrap())
            .unwrap()
            .sql;
        assert!(sql.contains(
            "filtered_documents AS (SELECT latest.* FROM (SELECT DISTINCT ON (m.artifact_id) m.* FROM turn_hierarchy AS th INNER JOIN documents AS m ON th.id = m.turn_id ORDER BY m.artifact_id ASC, m.version DESC) AS latest WHERE latest.deleted_at IS NULL)"
        ));
        assert!(sql.ends_with("SELECT title FROM filtered_documents AS documents"));
    }

    #[test]
    fn test_turn_limit_orders_recent_turns() {
        let q = SelectQuery::from(Table::new("messages")).column(col("id"));
        let sql = compile_select(&rewrite_for_branch(q, &registry(), 1, Some(5)).unwrap())
            .unwrap()
            .sql;
        assert!(sql.contains("t.status != 'reverted') ORDER BY t.index DESC LIMIT 5)"));
    }

    #[test]
    fn test_unversioned_query_untouched() {
        let q = SelectQuery::from(Table::new("users")).column(col("id"));
        assert_eq!(rewrite_for_branch(q.clone(), &registry(), 1, None).unwrap(), q);
    }

    #[test]
    fn test_nested_versioned_reference_is_rewritten() {
        let inner = SelectQuery::from(Table::aliased("messages", "m1"))
            .column(qcol("m1", "id"))
            .and_where(qcol("m1", "user_id").eq(qcol("u", "id")));
        let q = SelectQuery::from(Table::aliased("users", "u"))
            .column(qcol("u", "id"))
            .column_as(Expr::Subquery(Box::new(inner)), "latest");
        let sql = compile_select(&rewrite_for_branch(q, &registry(), 1, None).unwrap())
            .unwrap()
            .sql;
        assert!(sql.contains("FROM filtered_messages AS m1 WHERE m1.user_id = u.id"));
        assert!(sql.contains("FROM users AS u"));
    }
}
