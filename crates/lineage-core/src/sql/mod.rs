//! Expression AST, query descriptions and the Postgres SQL compiler.

pub mod alias;
pub mod compiler;
pub mod expr;
pub mod projection;
pub mod query;
pub mod value;

pub use alias::TableRegistry;
pub use compiler::{compile, compile_select, quote_ident, CompiledQuery};
pub use expr::{
    and_, col, eq, func, inline, not_, or_, param, qcol, ColumnRef, CompareOp, Direction,
    DistanceOp, Expr, FunctionCall, OrderBy,
};
pub use projection::expand_includes;
pub use query::{
    Cte, CteBody, DeleteQuery, Distinct, FromTarget, Include, InsertQuery, InsertSource, Join,
    JoinKind, SelectItem, SelectQuery, Statement, Table, UnionQuery, UpdateQuery,
};
pub use value::{SqlValue, ValueKind};
