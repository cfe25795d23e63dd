//! Lowers queries into SQL text and a positional parameter list.
//!
//! Rendering walks the statement in textual order, so `$N` placeholders are
//! numbered left to right across CTEs, subqueries and the main body.

use tracing::debug;

use super::expr::{Expr, FunctionCall, OrderBy};
use super::query::{
    Cte, CteBody, DeleteQuery, Distinct, FromTarget, InsertQuery, InsertSource, Join, SelectItem,
    SelectQuery, Statement, UnionQuery, UpdateQuery,
};
use super::value::SqlValue;
use crate::error::{ErrorCode, LineageError, LineageResult};

/// SQL text plus the values bound to `$1..$N`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl CompiledQuery {
    /// Parameters rendered for error reports.
    pub fn rendered_params(&self) -> Vec<String> {
        self.params.iter().map(SqlValue::render).collect()
    }
}

/// Compile any statement.
pub fn compile(statement: &Statement) -> LineageResult<CompiledQuery> {
    let mut compiler = SqlCompiler::default();
    let sql = match statement {
        Statement::Select(q) => compiler.select(q)?,
        Statement::Union(u) => compiler.union(u)?,
        Statement::Insert(q) => compiler.insert(q)?,
        Statement::Update(q) => compiler.update(q)?,
        Statement::Delete(q) => compiler.delete(q)?,
    };
    debug!(params = compiler.params.len(), "compiled statement");
    Ok(CompiledQuery {
        sql,
        params: compiler.params,
    })
}

/// Compile a SELECT.
pub fn compile_select(query: &SelectQuery) -> LineageResult<CompiledQuery> {
    let mut compiler = SqlCompiler::default();
    let sql = compiler.select(query)?;
    Ok(CompiledQuery {
        sql,
        params: compiler.params,
    })
}

/// Quote an identifier unless it is a plain lower-case name.
pub fn quote_ident(name: &str) -> String {
    let plain = !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

#[derive(Default)]
struct SqlCompiler {
    params: Vec<SqlValue>,
}

impl SqlCompiler {
    fn push_param(&mut self, value: &SqlValue) -> String {
        self.params.push(value.clone());
        format!("${}", self.params.len())
    }

    fn ctes(&mut self, ctes: &[Cte], recursive: bool) -> LineageResult<String> {
        let recursive = recursive || ctes.iter().any(Cte::is_self_referencing);
        let mut parts = Vec::with_capacity(ctes.len());
        for cte in ctes {
            let body = match &cte.body {
                CteBody::Select(q) => self.select(q)?,
                CteBody::Union(u) => self.union(u)?,
            };
            parts.push(format!("{} AS ({})", quote_ident(&cte.name), body));
        }
        Ok(format!(
            "WITH {}{} ",
            if recursive { "RECURSIVE " } else { "" },
            parts.join(", ")
        ))
    }

    fn select(&mut self, q: &SelectQuery) -> LineageResult<String> {
        if q.columns.is_empty() {
            return Err(LineageError::query_build(
                "Select query has no columns",
                ErrorCode::QryEmptySelect,
            ));
        }

        let mut sql = String::new();
        if !q.ctes.is_empty() {
            sql.push_str(&self.ctes(&q.ctes, q.recursive)?);
        }

        sql.push_str("SELECT ");
        match &q.distinct {
            Distinct::None => {}
            Distinct::All => sql.push_str("DISTINCT "),
            Distinct::On(exprs) => {
                let exprs = self.expr_list(exprs)?;
                sql.push_str(&format!("DISTINCT ON ({}) ", exprs));
            }
        }

        let mut columns = Vec::with_capacity(q.columns.len());
        for item in &q.columns {
            columns.push(self.select_item(item)?);
        }
        sql.push_str(&columns.join(", "));

        if let Some(from) = &q.from {
            sql.push_str(" FROM ");
            sql.push_str(&self.target(from)?);
        }
        for join in &q.joins {
            sql.push(' ');
            sql.push_str(&self.join(join)?);
        }
        if let Some(w) = &q.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&self.expr(w)?);
        }
        if !q.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.expr_list(&q.group_by)?);
        }
        if let Some(h) = &q.having {
            sql.push_str(" HAVING ");
            sql.push_str(&self.expr(h)?);
        }
        if !q.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_list(&q.order_by)?);
        }
        if let Some(limit) = q.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = q.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        Ok(sql)
    }

    fn union(&mut self, u: &UnionQuery) -> LineageResult<String> {
        let left = self.select(&u.left)?;
        let right = self.select(&u.right)?;
        Ok(format!(
            "{} UNION {}{}",
            left,
            if u.all { "ALL " } else { "" },
            right
        ))
    }

    fn select_item(&mut self, item: &SelectItem) -> LineageResult<String> {
        match item {
            SelectItem::Expr { expr, alias } => {
                let rendered = self.expr(expr)?;
                Ok(match alias {
                    Some(a) => format!("{} AS {}", rendered, quote_ident(a)),
                    None => rendered,
                })
            }
            SelectItem::Include(inc) => Err(LineageError::query_build(
                format!(
                    "Relation '{}' must be expanded by the projection builder before compiling",
                    inc.relation.name
                ),
                ErrorCode::QryUnsupported,
            )),
        }
    }

    fn target(&mut self, target: &FromTarget) -> LineageResult<String> {
        match target {
            FromTarget::Table(t) => Ok(match &t.alias {
                Some(alias) => format!("{} AS {}", quote_ident(&t.name), quote_ident(alias)),
                None => quote_ident(&t.name),
            }),
            FromTarget::Subquery { query, alias } => {
                let inner = self.select(query)?;
                Ok(format!("({}) AS {}", inner, quote_ident(alias)))
            }
        }
    }

    fn join(&mut self, join: &Join) -> LineageResult<String> {
        let target = self.target(&join.target)?;
        let on = self.expr(&join.on)?;
        Ok(format!("{} JOIN {} ON {}", join.kind.as_sql(), target, on))
    }

    fn expr_list(&mut self, exprs: &[Expr]) -> LineageResult<String> {
        let mut out = Vec::with_capacity(exprs.len());
        for e in exprs {
            out.push(self.expr(e)?);
        }
        Ok(out.join(", "))
    }

    fn order_list(&mut self, order: &[OrderBy]) -> LineageResult<String> {
        let mut out = Vec::with_capacity(order.len());
        for o in order {
            out.push(format!("{} {}", self.expr(&o.expr)?, o.direction.as_sql()));
        }
        Ok(out.join(", "))
    }

    fn function(&mut self, f: &FunctionCall) -> LineageResult<String> {
        let mut args = self.expr_list(&f.args)?;
        if f.distinct {
            args = format!("DISTINCT {}", args);
        }
        if !f.order_by.is_empty() {
            args = format!("{} ORDER BY {}", args, self.order_list(&f.order_by)?);
        }
        let mut sql = format!("{}({})", f.name, args);
        if let Some(filter) = &f.filter {
            sql.push_str(&format!(" FILTER (WHERE {})", self.expr(filter)?));
        }
        Ok(sql)
    }

    fn expr(&mut self, expr: &Expr) -> LineageResult<String> {
        Ok(match expr {
            Expr::Column(c) => match &c.table {
                Some(t) => format!("{}.{}", quote_ident(t), quote_ident(&c.name)),
                None => quote_ident(&c.name),
            },
            Expr::Star(table) => match table {
                Some(t) => format!("{}.*", quote_ident(t)),
                None => "*".to_string(),
            },
            Expr::Param(v) => self.push_param(v),
            Expr::Inline(v) => v.to_sql_literal(),
            Expr::Compare { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                format!("{} {} {}", l, op.as_sql(), r)
            }
            Expr::In {
                expr,
                values,
                negated,
            } => {
                if values.is_empty() {
                    // x IN () is not valid SQL
                    return Ok(if *negated { "TRUE" } else { "FALSE" }.to_string());
                }
                let e = self.expr(expr)?;
                let placeholders: Vec<String> = values.iter().map(|v| self.push_param(v)).collect();
                format!(
                    "{} {}IN ({})",
                    e,
                    if *negated { "NOT " } else { "" },
                    placeholders.join(", ")
                )
            }
            Expr::Between { expr, low, high } => {
                let e = self.expr(expr)?;
                let lo = self.expr(low)?;
                let hi = self.expr(high)?;
                format!("{} BETWEEN {} AND {}", e, lo, hi)
            }
            Expr::IsNull { expr, negated } => {
                let e = self.expr(expr)?;
                format!("{} IS {}NULL", e, if *negated { "NOT " } else { "" })
            }
            Expr::Like {
                expr,
                pattern,
                case_insensitive,
            } => {
                let e = self.expr(expr)?;
                let p = self.expr(pattern)?;
                format!("{} {} {}", e, if *case_insensitive { "ILIKE" } else { "LIKE" }, p)
            }
            Expr::And(items) => self.junction(items, " AND ", "TRUE")?,
            Expr::Or(items) => self.junction(items, " OR ", "FALSE")?,
            Expr::Not(inner) => format!("NOT ({})", self.expr(inner)?),
            Expr::Function(f) => self.function(f)?,
            Expr::Coalesce(items) => format!("COALESCE({})", self.expr_list(items)?),
            Expr::Distance { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                format!("({} {} {})", l, op.as_sql(), r)
            }
            Expr::Subquery(q) => format!("({})", self.select(q)?),
        })
    }

    fn junction(&mut self, items: &[Expr], sep: &str, empty: &str) -> LineageResult<String> {
        match items {
            [] => Ok(empty.to_string()),
            [single] => self.expr(single),
            _ => Ok(format!("({})", {
                let mut parts = Vec::with_capacity(items.len());
                for i in items {
                    parts.push(self.expr(i)?);
                }
                parts.join(sep)
            })),
        }
    }

    fn returning(&mut self, exprs: &[Expr]) -> LineageResult<String> {
        if exprs.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!(" RETURNING {}", self.expr_list(exprs)?))
        }
    }

    fn insert(&mut self, q: &InsertQuery) -> LineageResult<String> {
        if q.columns.is_empty() {
            return Err(LineageError::query_build(
                format!("Insert into '{}' has no columns", q.table),
                ErrorCode::QryEmptySelect,
            ));
        }
        let columns: Vec<String> = q.columns.iter().map(|c| quote_ident(c)).collect();
        let mut sql = format!("INSERT INTO {} ({})", quote_ident(&q.table), columns.join(", "));
        match &q.source {
            InsertSource::Values(rows) => {
                let mut rendered = Vec::with_capacity(rows.len());
                for row in rows {
                    if row.len() != q.columns.len() {
                        return Err(LineageError::query_build(
                            format!(
                                "Insert into '{}' expects {} values, got {}",
                                q.table,
                                q.columns.len(),
                                row.len()
                            ),
                            ErrorCode::QryTypeMismatch,
                        ));
                    }
                    rendered.push(format!("({})", self.expr_list(row)?));
                }
                sql.push_str(&format!(" VALUES {}", rendered.join(", ")));
            }
            InsertSource::Select(select) => {
                sql.push(' ');
                sql.push_str(&self.select(select)?);
            }
        }
        if q.on_conflict_do_nothing {
            sql.push_str(" ON CONFLICT DO NOTHING");
        }
        sql.push_str(&self.returning(&q.returning)?);
        Ok(sql)
    }

    fn update(&mut self, q: &UpdateQuery) -> LineageResult<String> {
        if q.set.is_empty() {
            return Err(LineageError::query_build(
                format!("Update of '{}' sets no columns", q.table.name),
                ErrorCode::QryEmptySelect,
            ));
        }
        let mut sql = format!("UPDATE {}", self.target(&FromTarget::Table(q.table.clone()))?);
        let mut assignments = Vec::with_capacity(q.set.len());
        for (column, value) in &q.set {
            assignments.push(format!("{} = {}", quote_ident(column), self.expr(value)?));
        }
        sql.push_str(&format!(" SET {}", assignments.join(", ")));
        if let Some(w) = &q.where_clause {
            sql.push_str(&format!(" WHERE {}", self.expr(w)?));
        }
        sql.push_str(&self.returning(&q.returning)?);
        Ok(sql)
    }

    fn delete(&mut self, q: &DeleteQuery) -> LineageResult<String> {
        let mut sql = format!(
            "DELETE FROM {}",
            self.target(&FromTarget::Table(q.table.clone()))?
        );
        if let Some(w) = &q.where_clause {
            sql.push_str(&format!(" WHERE {}", self.expr(w)?));
        }
        sql.push_str(&self.returning(&q.returning)?);
        Ok(sql)
    }
}
