//! lineage-vector-stores - Vector store backends for lineage.
//!
//! The expression AST built by the filter DSL compiles to SQL in
//! `lineage-core`. This crate compiles the same AST into the filter
//! language of a vector database.
//!
//! # Supported Backends
//!
//! - **Qdrant** (feature: `qdrant`) - payload filters and filtered search
//!
//! # Example
//!
//! ```ignore
//! use lineage_core::{FilterTranslator, sql::{col, param}};
//! use lineage_vector_stores::QdrantFilterTranslator;
//!
//! let expr = col("topic").eq(param("animals")).or(col("topic").eq(param("physics")));
//! let filter = QdrantFilterTranslator::new().translate(&expr)?;
//! ```

#[cfg(feature = "qdrant")]
mod qdrant;

// Re-export commonly used types
#[cfg(feature = "qdrant")]
pub use qdrant::{QdrantFilterTranslator, QdrantSearch, ScoredPoint};
