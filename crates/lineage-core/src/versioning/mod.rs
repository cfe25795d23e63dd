//! Git-like version history over relational rows.
//!
//! Writes happen inside turns that belong to branches. A branch can fork
//! from any turn of another branch and then sees its parent's history up to
//! that turn, plus its own. Reads are scoped to a branch by
//! [`rewrite_for_branch`], which expresses visibility as CTEs.

mod backend;
mod context;
mod graph;
mod memory;
mod model;
pub mod rewriter;
pub mod visibility;

pub use backend::{NewBranch, NewTurn, VersionBackend};
pub use context::ExecutionContext;
pub use graph::{BranchDiff, VersionGraph};
pub use memory::MemoryVersionBackend;
pub use model::{Branch, Turn, TurnStatus};
pub use rewriter::{filtered_name, rewrite_for_branch};
