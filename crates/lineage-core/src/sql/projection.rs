//! Expands relation includes into JSON aggregate projections.
//!
//! A relation included directly on the root becomes a `LEFT JOIN` whose rows
//! are folded back with `json_agg(DISTINCT jsonb_build_object(...))`, and the
//! root gains a `GROUP BY` on its primary key. Anything deeper becomes a
//! correlated subquery, so nested relations never multiply root rows.
//! One-to-one relations, and includes that carry their own ORDER BY, LIMIT
//! or OFFSET, are correlated at every depth since they need per-parent
//! evaluation.

use tracing::debug;

use super::expr::{inline, qcol, Expr, FunctionCall};
use super::query::{FromTarget, Include, Join, JoinKind, SelectItem, SelectQuery};
use super::value::SqlValue;
use crate::error::{ErrorCode, LineageError, LineageResult};
use crate::schema::Cardinality;

/// Rewrite every include marker in `query`.
///
/// `root_primary_key` is the primary key column of the FROM table.
pub fn expand_includes(mut query: SelectQuery, root_primary_key: &str) -> LineageResult<SelectQuery> {
    if !query.has_includes() {
        return Ok(query);
    }
    let root_ref = query
        .from_reference()
        .ok_or_else(|| {
            LineageError::query_build("Include requires a FROM table", ErrorCode::QryUnsupported)
        })?
        .to_string();

    let items = std::mem::take(&mut query.columns);
    let mut joined = false;
    let mut plain_columns = Vec::new();

    for item in items {
        match item {
            SelectItem::Expr { expr, alias } => {
                if let Expr::Column(c) = &expr {
                    if c.table.as_deref() == Some(&root_ref) && c.name != root_primary_key {
                        plain_columns.push(expr.clone());
                    }
                }
                query.columns.push(SelectItem::Expr { expr, alias });
            }
            SelectItem::Include(inc) => {
                let name = inc.relation.name.clone();
                let column = if joins_at_root(&inc) {
                    joined = true;
                    join_include(&mut query, *inc, &root_ref)?
                } else {
                    correlated(*inc, &root_ref)?
                };
                query.columns.push(SelectItem::aliased(column, name));
            }
        }
    }

    if joined {
        let mut group_by = vec![qcol(&root_ref, root_primary_key)];
        group_by.extend(plain_columns);
        query.group_by = group_by;
        debug!(root = %root_ref, "grouping root rows after relation join");
    }
    Ok(query)
}

fn joins_at_root(inc: &Include) -> bool {
    let q = &inc.query;
    inc.relation.cardinality != Cardinality::OneToOne
        && q.order_by.is_empty()
        && q.limit.is_none()
        && q.offset.is_none()
}

fn child_reference(inc: &Include) -> LineageResult<String> {
    match &inc.query.from {
        Some(FromTarget::Table(t)) => Ok(t.reference().to_string()),
        _ => Err(LineageError::query_build(
            format!("Included relation '{}' must select from a table", inc.relation.name),
            ErrorCode::QryUnsupported,
        )),
    }
}

/// Predicates binding the included rows to `parent_ref`.
///
/// For many-to-many relations the first element joins the junction to the
/// target and the second binds the junction to the parent.
fn correlation(inc: &Include, child_ref: &str, parent_ref: &str) -> LineageResult<(Option<Expr>, Expr)> {
    let rel = &inc.relation;
    match rel.cardinality {
        Cardinality::OneToOne | Cardinality::OneToMany => Ok((
            None,
            qcol(child_ref, &rel.foreign_key).eq(qcol(parent_ref, &rel.primary_key)),
        )),
        Cardinality::ManyToMany => {
            let (junction, keys) = match (&inc.junction, &rel.junction) {
                (Some(table), Some(j)) => (table.reference(), &j.keys),
                _ => {
                    return Err(LineageError::query_build(
                        format!("Many-to-many relation '{}' has no junction table", rel.name),
                        ErrorCode::QryNoRelation,
                    ))
                }
            };
            Ok((
                Some(qcol(child_ref, &rel.foreign_key).eq(qcol(junction, &keys[1]))),
                qcol(junction, &keys[0]).eq(qcol(parent_ref, &rel.primary_key)),
            ))
        }
    }
}

/// `jsonb_build_object('k', v, ...)` over the include's select list. Nested
/// includes become correlated subqueries against `child_ref`.
fn json_object(columns: Vec<SelectItem>, child_ref: &str) -> LineageResult<Expr> {
    if columns.is_empty() {
        return Err(LineageError::query_build(
            "Select query has no columns",
            ErrorCode::QryEmptySelect,
        ));
    }
    let mut args = Vec::with_capacity(columns.len() * 2);
    for item in columns {
        let key = item
            .output_name()
            .ok_or_else(|| {
                LineageError::query_build(
                    "Nested projection columns need a name",
                    ErrorCode::QryUnsupported,
                )
            })?
            .to_string();
        let value = match item {
            SelectItem::Expr { expr, .. } => expr,
            SelectItem::Include(nested) => correlated(*nested, child_ref)?,
        };
        args.push(inline(key));
        args.push(value);
    }
    Ok(Expr::Function(FunctionCall::new("jsonb_build_object", args)))
}

fn join_include(root: &mut SelectQuery, inc: Include, root_ref: &str) -> LineageResult<Expr> {
    let child_ref = child_reference(&inc)?;
    let (junction_link, parent_link) = correlation(&inc, &child_ref, root_ref)?;
    let pk = qcol(&child_ref, &inc.target_primary_key);
    let junction = inc.junction.clone();

    let mut child = inc.query;
    let target = child.from.take().ok_or_else(|| {
        LineageError::query_build("Included relation has no FROM table", ErrorCode::QryUnsupported)
    })?;

    match (junction, junction_link) {
        (Some(junction), Some(link)) => {
            root.joins.push(Join {
                kind: JoinKind::Left,
                target: junction.into(),
                on: parent_link,
            });
            let on = match child.where_clause.take() {
                Some(w) => link.and(w),
                None => link,
            };
            root.joins.push(Join {
                kind: JoinKind::Left,
                target,
                on,
            });
        }
        _ => {
            let on = match child.where_clause.take() {
                Some(w) => parent_link.and(w),
                None => parent_link,
            };
            root.joins.push(Join {
                kind: JoinKind::Left,
                target,
                on,
            });
        }
    }
    root.joins.append(&mut child.joins);

    let object = json_object(child.columns, &child_ref)?;
    let agg = FunctionCall::new("json_agg", vec![object])
        .distinct()
        .filter(pk.is_not_null());
    Ok(Expr::Coalesce(vec![
        Expr::Function(agg),
        inline(SqlValue::Text("[]".to_string())),
    ]))
}

/// Correlated subquery producing the nested value for one parent row.
fn correlated(inc: Include, parent_ref: &str) -> LineageResult<Expr> {
    let child_ref = child_reference(&inc)?;
    let (junction_link, parent_link) = correlation(&inc, &child_ref, parent_ref)?;
    let one_to_one = inc.relation.is_one_to_one();
    let mut child = inc.query;

    if let (Some(junction), Some(link)) = (inc.junction, junction_link) {
        child.joins.insert(
            0,
            Join {
                kind: JoinKind::Inner,
                target: junction.into(),
                on: link,
            },
        );
    }
    let user_filter = child.where_clause.take();
    child.where_clause = Some(match user_filter {
        Some(w) => parent_link.and(w),
        None => parent_link,
    });

    let columns = std::mem::take(&mut child.columns);
    let object = json_object(columns, &child_ref)?;

    if one_to_one {
        child.columns = vec![SelectItem::expr(object)];
        child.limit = Some(1);
        return Ok(Expr::Coalesce(vec![
            Expr::Subquery(Box::new(child)),
            inline(SqlValue::Null),
        ]));
    }

    let aggregate = if child.limit.is_some() || child.offset.is_some() {
        let rows_alias = format!("{}_rows", child_ref);
        child.columns = vec![SelectItem::aliased(object, "obj")];
        SelectQuery::from(FromTarget::Subquery {
            query: Box::new(child),
            alias: rows_alias.clone(),
        })
        .column(Expr::Function(FunctionCall::new(
            "json_agg",
            vec![qcol(rows_alias, "obj")],
        )))
    } else {
        let order = std::mem::take(&mut child.order_by);
        child.columns = vec![SelectItem::expr(Expr::Function(
            FunctionCall::new("json_agg", vec![object]).order_by(order),
        ))];
        child
    };

    Ok(Expr::Coalesce(vec![
        Expr::Subquery(Box::new(aggregate)),
        inline(SqlValue::Text("[]".to_string())),
    ]))
}
