//! Backend-neutral expression AST.
//!
//! Nodes are immutable values: combinators consume their inputs and return
//! new nodes. The set of node kinds is closed, so every consumer (the SQL
//! compiler, the vector filter translators) matches exhaustively.

use std::ops::{BitAnd, BitOr, Not};

use super::query::SelectQuery;
use super::value::SqlValue;

/// A column reference, optionally qualified by a table alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub name: String,
}

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Neq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }
}

/// pgvector distance operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceOp {
    L2,
    Cosine,
    InnerProduct,
}

impl DistanceOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            DistanceOp::L2 => "<->",
            DistanceOp::Cosine => "<=>",
            DistanceOp::InnerProduct => "<#>",
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// A single ORDER BY term.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: Direction,
}

/// A function call such as `json_agg(DISTINCT x ORDER BY y) FILTER (WHERE z)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<Expr>,
    pub distinct: bool,
    pub filter: Option<Box<Expr>>,
    pub order_by: Vec<OrderBy>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            args,
            distinct: false,
            filter: None,
            order_by: Vec::new(),
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(Box::new(predicate));
        self
    }

    pub fn order_by(mut self, order: Vec<OrderBy>) -> Self {
        self.order_by = order;
        self
    }
}

/// Expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    /// `*` or `alias.*`.
    Star(Option<String>),
    /// Bound as the next positional parameter.
    Param(SqlValue),
    /// Rendered in place. Reserved for compiler constants such as `'[]'`.
    Inline(SqlValue),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    In {
        expr: Box<Expr>,
        values: Vec<SqlValue>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        case_insensitive: bool,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Function(FunctionCall),
    Coalesce(Vec<Expr>),
    Distance {
        op: DistanceOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Subquery(Box<SelectQuery>),
}

/// Unqualified column reference.
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(ColumnRef {
        table: None,
        name: name.into(),
    })
}

/// Column reference qualified by a table alias.
pub fn qcol(table: impl Into<String>, name: impl Into<String>) -> Expr {
    Expr::Column(ColumnRef {
        table: Some(table.into()),
        name: name.into(),
    })
}

/// Parameterized literal.
pub fn param(value: impl Into<SqlValue>) -> Expr {
    Expr::Param(value.into())
}

/// Inline literal.
pub fn inline(value: impl Into<SqlValue>) -> Expr {
    Expr::Inline(value.into())
}

/// Function call.
pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Expr {
    Expr::Function(FunctionCall::new(name, args))
}

/// `eq(field, value)` combinator form.
pub fn eq(left: Expr, right: Expr) -> Expr {
    left.eq(right)
}

/// `and_(a, b)` combinator form.
pub fn and_(a: Expr, b: Expr) -> Expr {
    a.and(b)
}

/// `or_(a, b)` combinator form.
pub fn or_(a: Expr, b: Expr) -> Expr {
    a.or(b)
}

/// `not_(a)` combinator form.
pub fn not_(a: Expr) -> Expr {
    Expr::Not(Box::new(a))
}

impl Expr {
    fn compare(self, op: CompareOp, right: Expr) -> Expr {
        Expr::Compare {
            op,
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    pub fn eq(self, right: Expr) -> Expr {
        self.compare(CompareOp::Eq, right)
    }

    pub fn neq(self, right: Expr) -> Expr {
        self.compare(CompareOp::Neq, right)
    }

    pub fn gt(self, right: Expr) -> Expr {
        self.compare(CompareOp::Gt, right)
    }

    pub fn gte(self, right: Expr) -> Expr {
        self.compare(CompareOp::Gte, right)
    }

    pub fn lt(self, right: Expr) -> Expr {
        self.compare(CompareOp::Lt, right)
    }

    pub fn lte(self, right: Expr) -> Expr {
        self.compare(CompareOp::Lte, right)
    }

    pub fn in_list(self, values: Vec<SqlValue>) -> Expr {
        Expr::In {
            expr: Box::new(self),
            values,
            negated: false,
        }
    }

    pub fn not_in_list(self, values: Vec<SqlValue>) -> Expr {
        Expr::In {
            expr: Box::new(self),
            values,
            negated: true,
        }
    }

    pub fn between(self, low: Expr, high: Expr) -> Expr {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low),
            high: Box::new(high),
        }
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn like(self, pattern: Expr) -> Expr {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern),
            case_insensitive: false,
        }
    }

    pub fn ilike(self, pattern: Expr) -> Expr {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern),
            case_insensitive: true,
        }
    }

    pub fn distance(self, op: DistanceOp, right: Expr) -> Expr {
        Expr::Distance {
            op,
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    /// Conjunction. Nested `And` nodes on the left are extended in place.
    pub fn and(self, other: Expr) -> Expr {
        match self {
            Expr::And(mut items) => {
                items.push(other);
                Expr::And(items)
            }
            first => Expr::And(vec![first, other]),
        }
    }

    /// Disjunction. Nested `Or` nodes on the left are extended in place.
    pub fn or(self, other: Expr) -> Expr {
        match self {
            Expr::Or(mut items) => {
                items.push(other);
                Expr::Or(items)
            }
            first => Expr::Or(vec![first, other]),
        }
    }

    /// Fold a list of predicates into one conjunction.
    pub fn all(items: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        items.into_iter().reduce(Expr::and)
    }

    pub fn asc(self) -> OrderBy {
        OrderBy {
            expr: self,
            direction: Direction::Asc,
        }
    }

    pub fn desc(self) -> OrderBy {
        OrderBy {
            expr: self,
            direction: Direction::Desc,
        }
    }

    /// Column name when this node is a plain column.
    pub fn column_name(&self) -> Option<&str> {
        match self {
            Expr::Column(c) => Some(&c.name),
            _ => None,
        }
    }

    /// Value carried by a literal node.
    pub fn literal_value(&self) -> Option<&SqlValue> {
        match self {
            Expr::Param(v) | Expr::Inline(v) => Some(v),
            _ => None,
        }
    }

    /// Re-qualify every column that references `old` so it references `new`,
    /// including correlated references inside subqueries.
    pub fn rename_qualifier(&mut self, old: &str, new: &str) {
        match self {
            Expr::Column(c) => {
                if c.table.as_deref() == Some(old) {
                    c.table = Some(new.to_string());
                }
            }
            Expr::Star(t) => {
                if t.as_deref() == Some(old) {
                    *t = Some(new.to_string());
                }
            }
            Expr::Param(_) | Expr::Inline(_) => {}
            Expr::Compare { left, right, .. } | Expr::Distance { left, right, .. } => {
                left.rename_qualifier(old, new);
                right.rename_qualifier(old, new);
            }
            Expr::In { expr, .. } | Expr::IsNull { expr, .. } | Expr::Not(expr) => {
                expr.rename_qualifier(old, new)
            }
            Expr::Between { expr, low, high } => {
                expr.rename_qualifier(old, new);
                low.rename_qualifier(old, new);
                high.rename_qualifier(old, new);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.rename_qualifier(old, new);
                pattern.rename_qualifier(old, new);
            }
            Expr::And(items) | Expr::Or(items) | Expr::Coalesce(items) => {
                for item in items {
                    item.rename_qualifier(old, new);
                }
            }
            Expr::Function(call) => {
                for arg in &mut call.args {
                    arg.rename_qualifier(old, new);
                }
                if let Some(filter) = call.filter.as_mut() {
                    filter.rename_qualifier(old, new);
                }
                for o in &mut call.order_by {
                    o.expr.rename_qualifier(old, new);
                }
            }
            Expr::Subquery(q) => q.rename_qualifier(old, new),
        }
    }

    /// Visit every nested subquery.
    pub fn for_each_subquery(&self, f: &mut dyn FnMut(&SelectQuery)) {
        match self {
            Expr::Subquery(q) => f(q),
            Expr::Compare { left, right, .. } | Expr::Distance { left, right, .. } => {
                left.for_each_subquery(f);
                right.for_each_subquery(f);
            }
            Expr::In { expr, .. } | Expr::IsNull { expr, .. } | Expr::Not(expr) => {
                expr.for_each_subquery(f)
            }
            Expr::Between { expr, low, high } => {
                expr.for_each_subquery(f);
                low.for_each_subquery(f);
                high.for_each_subquery(f);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.for_each_subquery(f);
                pattern.for_each_subquery(f);
            }
            Expr::And(items) | Expr::Or(items) | Expr::Coalesce(items) => {
                for item in items {
                    item.for_each_subquery(f);
                }
            }
            Expr::Function(call) => {
                for e in call.args.iter().chain(call.filter.as_deref()) {
                    e.for_each_subquery(f);
                }
                for o in &call.order_by {
                    o.expr.for_each_subquery(f);
                }
            }
            Expr::Column(_) | Expr::Star(_) | Expr::Param(_) | Expr::Inline(_) => {}
        }
    }

    /// Visit every nested subquery mutably.
    pub fn for_each_subquery_mut(&mut self, f: &mut dyn FnMut(&mut SelectQuery)) {
        match self {
            Expr::Subquery(q) => f(q),
            Expr::Compare { left, right, .. } | Expr::Distance { left, right, .. } => {
                left.for_each_subquery_mut(f);
                right.for_each_subquery_mut(f);
            }
            Expr::In { expr, .. } | Expr::IsNull { expr, .. } | Expr::Not(expr) => {
                expr.for_each_subquery_mut(f)
            }
            Expr::Between { expr, low, high } => {
                expr.for_each_subquery_mut(f);
                low.for_each_subquery_mut(f);
                high.for_each_subquery_mut(f);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.for_each_subquery_mut(f);
                pattern.for_each_subquery_mut(f);
            }
            Expr::And(items) | Expr::Or(items) | Expr::Coalesce(items) => {
                for item in items {
                    item.for_each_subquery_mut(f);
                }
            }
            Expr::Function(call) => {
                for arg in &mut call.args {
                    arg.for_each_subquery_mut(f);
                }
                if let Some(filter) = call.filter.as_mut() {
                    filter.for_each_subquery_mut(f);
                }
                for o in &mut call.order_by {
                    o.expr.for_each_subquery_mut(f);
                }
            }
            Expr::Column(_) | Expr::Star(_) | Expr::Param(_) | Expr::Inline(_) => {}
        }
    }
}

impl BitAnd for Expr {
    type Output = Expr;

    fn bitand(self, rhs: Expr) -> Expr {
        self.and(rhs)
    }
}

impl BitOr for Expr {
    type Output = Expr;

    fn bitor(self, rhs: Expr) -> Expr {
        self.or(rhs)
    }
}

impl Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }
}
