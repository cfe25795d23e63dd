//! Seams to external collaborators: statement execution, embeddings and
//! non-SQL filter backends.

use async_trait::async_trait;

use crate::error::LineageResult;
use crate::sql::{CompiledQuery, Expr};

/// Runs compiled statements against a relational store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a row-returning statement. Each row is a JSON object keyed by
    /// output column name.
    async fn fetch(&self, query: &CompiledQuery) -> LineageResult<Vec<serde_json::Value>>;

    /// Run a statement for its side effect and return the affected row count.
    async fn execute(&self, query: &CompiledQuery) -> LineageResult<u64>;

    /// Run a statement expected to return at most one row.
    async fn fetch_optional(&self, query: &CompiledQuery) -> LineageResult<Option<serde_json::Value>> {
        Ok(self.fetch(query).await?.into_iter().next())
    }
}

/// Turns query text into a vector for similarity predicates.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> LineageResult<Vec<f32>>;

    /// Length of the vectors produced.
    fn dimension(&self) -> usize;
}

/// Compiles the expression AST for a backend other than SQL.
pub trait FilterTranslator {
    type Output;

    fn translate(&self, expr: &Expr) -> LineageResult<Self::Output>;
}
