//! Query descriptions consumed by the compiler.

use super::expr::{Expr, OrderBy};
use crate::schema::RelationDef;

/// A physical table or a CTE referenced by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub alias: Option<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }

    pub fn aliased(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: Some(alias.into()),
        }
    }

    /// The name columns should be qualified with.
    pub fn reference(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Target of a FROM clause or a join.
#[derive(Debug, Clone, PartialEq)]
pub enum FromTarget {
    Table(Table),
    Subquery {
        query: Box<SelectQuery>,
        alias: String,
    },
}

impl FromTarget {
    pub fn reference(&self) -> &str {
        match self {
            FromTarget::Table(t) => t.reference(),
            FromTarget::Subquery { alias, .. } => alias,
        }
    }
}

impl From<Table> for FromTarget {
    fn from(t: Table) -> Self {
        FromTarget::Table(t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
            JoinKind::Full => "FULL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub target: FromTarget,
    pub on: Expr,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Distinct {
    #[default]
    None,
    All,
    On(Vec<Expr>),
}

/// Marker asking the projection builder to nest a related entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    /// Relation as declared on the parent entity.
    pub relation: RelationDef,
    /// Aliased junction table for many-to-many relations.
    pub junction: Option<Table>,
    /// Primary key of the included entity.
    pub target_primary_key: String,
    /// Query over the included entity. Its FROM target must be an aliased table.
    pub query: SelectQuery,
}

/// One entry of the select list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Expr { expr: Expr, alias: Option<String> },
    Include(Box<Include>),
}

impl SelectItem {
    pub fn expr(expr: Expr) -> Self {
        SelectItem::Expr { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        SelectItem::Expr {
            expr,
            alias: Some(alias.into()),
        }
    }

    /// Output name of the item: the alias or the bare column name.
    pub fn output_name(&self) -> Option<&str> {
        match self {
            SelectItem::Expr { alias: Some(a), .. } => Some(a),
            SelectItem::Expr { expr, .. } => expr.column_name(),
            SelectItem::Include(inc) => Some(&inc.relation.name),
        }
    }
}

/// Body of a common table expression.
#[derive(Debug, Clone, PartialEq)]
pub enum CteBody {
    Select(SelectQuery),
    Union(UnionQuery),
}

impl CteBody {
    fn queries(&self) -> Vec<&SelectQuery> {
        match self {
            CteBody::Select(q) => vec![q],
            CteBody::Union(u) => vec![&*u.left, &*u.right],
        }
    }

    fn queries_mut(&mut self) -> Vec<&mut SelectQuery> {
        match self {
            CteBody::Select(q) => vec![q],
            CteBody::Union(u) => vec![&mut *u.left, &mut *u.right],
        }
    }

    fn references_table(&self, name: &str) -> bool {
        self.queries().into_iter().any(|q| q.references_table(name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub body: CteBody,
}

impl Cte {
    /// True when the body reads from the CTE itself.
    pub fn is_self_referencing(&self) -> bool {
        self.body.references_table(&self.name)
    }
}

/// `left UNION [ALL] right`.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionQuery {
    pub left: Box<SelectQuery>,
    pub right: Box<SelectQuery>,
    pub all: bool,
}

/// A SELECT statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub ctes: Vec<Cte>,
    pub recursive: bool,
    pub distinct: Distinct,
    pub columns: Vec<SelectItem>,
    pub from: Option<FromTarget>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// `SELECT ... FROM target`.
    pub fn from(target: impl Into<FromTarget>) -> Self {
        Self {
            from: Some(target.into()),
            ..Self::default()
        }
    }

    pub fn column(mut self, expr: Expr) -> Self {
        self.columns.push(SelectItem::expr(expr));
        self
    }

    pub fn column_as(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.columns.push(SelectItem::aliased(expr, alias));
        self
    }

    pub fn item(mut self, item: SelectItem) -> Self {
        self.columns.push(item);
        self
    }

    pub fn join(mut self, kind: JoinKind, target: impl Into<FromTarget>, on: Expr) -> Self {
        self.joins.push(Join {
            kind,
            target: target.into(),
            on,
        });
        self
    }

    /// AND a predicate into the WHERE clause.
    pub fn and_where(mut self, predicate: Expr) -> Self {
        self.push_where(predicate);
        self
    }

    pub fn push_where(&mut self, predicate: Expr) {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    pub fn having(mut self, predicate: Expr) -> Self {
        self.having = Some(predicate);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = Distinct::All;
        self
    }

    pub fn distinct_on(mut self, exprs: Vec<Expr>) -> Self {
        self.distinct = Distinct::On(exprs);
        self
    }

    /// Append a CTE. `recursive` forces `WITH RECURSIVE`; a self-referencing
    /// body sets it regardless.
    pub fn with_cte(mut self, name: impl Into<String>, body: CteBody, recursive: bool) -> Self {
        let cte = Cte {
            name: name.into(),
            body,
        };
        self.recursive |= recursive || cte.is_self_referencing();
        self.ctes.push(cte);
        self
    }

    /// Prepend CTEs so they are visible to any CTE already present.
    pub fn prepend_ctes(&mut self, ctes: Vec<Cte>) {
        if ctes.iter().any(Cte::is_self_referencing) {
            self.recursive = true;
        }
        let existing = std::mem::take(&mut self.ctes);
        self.ctes = ctes;
        self.ctes.extend(existing);
    }

    /// Alias (or bare name) of the FROM target.
    pub fn from_reference(&self) -> Option<&str> {
        self.from.as_ref().map(FromTarget::reference)
    }

    /// Physical name of the FROM table.
    pub fn from_table_name(&self) -> Option<&str> {
        match &self.from {
            Some(FromTarget::Table(t)) => Some(&t.name),
            _ => None,
        }
    }

    /// True when any FROM or JOIN target, at any depth, is the table `name`.
    pub fn references_table(&self, name: &str) -> bool {
        let mut found = false;
        self.for_each_table(&mut |t: &Table| found |= t.name == name);
        found
    }

    /// Re-qualify column references from alias `old` to `new`, at any depth.
    /// FROM, JOIN and junction tables aliased `old` are renamed too, so
    /// aliases must be unique across the whole query tree.
    pub fn rename_qualifier(&mut self, old: &str, new: &str) {
        if let Some(FromTarget::Table(t)) = self.from.as_mut() {
            rename_table(t, old, new);
        }
        if let Distinct::On(exprs) = &mut self.distinct {
            for e in exprs {
                e.rename_qualifier(old, new);
            }
        }
        for item in &mut self.columns {
            match item {
                SelectItem::Expr { expr, .. } => expr.rename_qualifier(old, new),
                SelectItem::Include(inc) => {
                    if let Some(junction) = inc.junction.as_mut() {
                        rename_table(junction, old, new);
                    }
                    inc.query.rename_qualifier(old, new);
                }
            }
        }
        for join in &mut self.joins {
            match &mut join.target {
                FromTarget::Table(t) => rename_table(t, old, new),
                FromTarget::Subquery { query, .. } => query.rename_qualifier(old, new),
            }
            join.on.rename_qualifier(old, new);
        }
        for e in self.where_clause.iter_mut().chain(self.having.iter_mut()) {
            e.rename_qualifier(old, new);
        }
        for e in &mut self.group_by {
            e.rename_qualifier(old, new);
        }
        for o in &mut self.order_by {
            o.expr.rename_qualifier(old, new);
        }
    }

    pub fn has_includes(&self) -> bool {
        self.columns
            .iter()
            .any(|c| matches!(c, SelectItem::Include(_)))
    }

    /// Expressions that may hold subqueries, in every clause.
    fn clause_exprs(&self) -> Vec<&Expr> {
        let mut exprs: Vec<&Expr> = Vec::new();
        if let Distinct::On(on) = &self.distinct {
            exprs.extend(on);
        }
        for item in &self.columns {
            if let SelectItem::Expr { expr, .. } = item {
                exprs.push(expr);
            }
        }
        exprs.extend(self.joins.iter().map(|j| &j.on));
        exprs.extend(self.where_clause.iter().chain(self.having.iter()));
        exprs.extend(&self.group_by);
        exprs.extend(self.order_by.iter().map(|o| &o.expr));
        exprs
    }

    fn clause_exprs_mut(&mut self) -> Vec<&mut Expr> {
        let mut exprs: Vec<&mut Expr> = Vec::new();
        if let Distinct::On(on) = &mut self.distinct {
            exprs.extend(on);
        }
        for item in &mut self.columns {
            if let SelectItem::Expr { expr, .. } = item {
                exprs.push(expr);
            }
        }
        exprs.extend(self.joins.iter_mut().map(|j| &mut j.on));
        exprs.extend(self.where_clause.iter_mut().chain(self.having.iter_mut()));
        exprs.extend(&mut self.group_by);
        exprs.extend(self.order_by.iter_mut().map(|o| &mut o.expr));
        exprs
    }

    /// Visit every table reference, including those inside CTEs, subqueries
    /// and pending includes.
    pub fn for_each_table(&self, f: &mut dyn FnMut(&Table)) {
        for cte in &self.ctes {
            for q in cte.body.queries() {
                q.for_each_table(f);
            }
        }
        let targets = self.from.iter().chain(self.joins.iter().map(|j| &j.target));
        for target in targets {
            match target {
                FromTarget::Table(t) => f(t),
                FromTarget::Subquery { query, .. } => query.for_each_table(f),
            }
        }
        for item in &self.columns {
            if let SelectItem::Include(inc) = item {
                inc.query.for_each_table(f);
            }
        }
        for expr in self.clause_exprs() {
            expr.for_each_subquery(&mut |q: &SelectQuery| q.for_each_table(f));
        }
    }

    /// Mutable twin of [`for_each_table`](Self::for_each_table).
    pub fn for_each_table_mut(&mut self, f: &mut dyn FnMut(&mut Table)) {
        for cte in &mut self.ctes {
            for q in cte.body.queries_mut() {
                q.for_each_table_mut(f);
            }
        }
        if let Some(from) = self.from.as_mut() {
            visit_target(from, f);
        }
        for join in &mut self.joins {
            visit_target(&mut join.target, f);
        }
        for item in &mut self.columns {
            if let SelectItem::Include(inc) = item {
                inc.query.for_each_table_mut(f);
            }
        }
        for expr in self.clause_exprs_mut() {
            expr.for_each_subquery_mut(&mut |q: &mut SelectQuery| q.for_each_table_mut(f));
        }
    }
}

fn rename_table(table: &mut Table, old: &str, new: &str) {
    if table.reference() == old {
        table.alias = Some(new.to_string());
    }
}

fn visit_target(target: &mut FromTarget, f: &mut dyn FnMut(&mut Table)) {
    match target {
        FromTarget::Table(t) => f(t),
        FromTarget::Subquery { query, .. } => query.for_each_table_mut(f),
    }
}

/// Source rows of an INSERT.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    Values(Vec<Vec<Expr>>),
    Select(Box<SelectQuery>),
}

/// `INSERT INTO table (columns) ... RETURNING ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertQuery {
    pub table: String,
    pub columns: Vec<String>,
    pub source: InsertSource,
    pub on_conflict_do_nothing: bool,
    pub returning: Vec<Expr>,
}

impl InsertQuery {
    pub fn values(table: impl Into<String>, columns: Vec<String>, row: Vec<Expr>) -> Self {
        Self {
            table: table.into(),
            columns,
            source: InsertSource::Values(vec![row]),
            on_conflict_do_nothing: false,
            returning: Vec::new(),
        }
    }

    pub fn returning(mut self, exprs: Vec<Expr>) -> Self {
        self.returning = exprs;
        self
    }
}

/// `UPDATE table SET ... WHERE ... RETURNING ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateQuery {
    pub table: Table,
    pub set: Vec<(String, Expr)>,
    pub where_clause: Option<Expr>,
    pub returning: Vec<Expr>,
}

/// `DELETE FROM table WHERE ... RETURNING ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteQuery {
    pub table: Table,
    pub where_clause: Option<Expr>,
    pub returning: Vec<Expr>,
}

/// Any statement the compiler renders.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectQuery),
    Union(UnionQuery),
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
}

impl From<SelectQuery> for Statement {
    fn from(q: SelectQuery) -> Self {
        Statement::Select(q)
    }
}

impl From<InsertQuery> for Statement {
    fn from(q: InsertQuery) -> Self {
        Statement::Insert(q)
    }
}

impl From<UpdateQuery> for Statement {
    fn from(q: UpdateQuery) -> Self {
        Statement::Update(q)
    }
}

impl From<DeleteQuery> for Statement {
    fn from(q: DeleteQuery) -> Self {
        Statement::Delete(q)
    }
}
