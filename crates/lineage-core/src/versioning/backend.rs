//! Storage seam for branches and turns.

use async_trait::async_trait;

use super::model::{Branch, Turn, TurnStatus};
use crate::error::LineageResult;

/// Parameters of a new branch.
#[derive(Debug, Clone, Default)]
pub struct NewBranch {
    /// Explicit id. An existing branch with this id is returned unchanged.
    pub id: Option<i64>,
    pub name: Option<String>,
    /// Turn to fork from. `None` creates a root branch.
    pub from: Option<Turn>,
}

impl NewBranch {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: Some(name.into()),
            from: None,
        }
    }

    pub fn fork(from: Turn, name: Option<String>) -> Self {
        Self {
            id: None,
            name,
            from: Some(from),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }
}

/// Parameters of a new turn.
#[derive(Debug, Clone, Default)]
pub struct NewTurn {
    pub branch_id: i64,
    pub message: Option<String>,
    pub metadata: serde_json::Value,
    /// Fail with `VerTurnAlreadyStaged` when the branch has an open turn.
    pub exclusive: bool,
}

/// Persistence of the version graph.
///
/// Implementations must make `start_turn` atomic: the branch counter
/// increment and the turn insert happen together, so concurrent callers on
/// one branch receive distinct indices.
#[async_trait]
pub trait VersionBackend: Send + Sync {
    /// Create a branch. A fork copies the turn's position and starts its
    /// counter at the turn's index.
    ///
    /// With an explicit id the call is idempotent: when the id is taken the
    /// stored branch comes back, and later generated ids skip past it.
    async fn create_branch(&self, branch: NewBranch) -> LineageResult<Branch>;

    async fn get_branch(&self, branch_id: i64) -> LineageResult<Option<Branch>>;

    async fn list_branches(&self) -> LineageResult<Vec<Branch>>;

    /// Increment the branch counter and insert a staged turn at the new index.
    async fn start_turn(&self, turn: NewTurn) -> LineageResult<Turn>;

    async fn get_turn(&self, turn_id: i64) -> LineageResult<Option<Turn>>;

    /// Move a staged turn to `status`, stamping `ended_at`. A `message`
    /// replaces the stored one.
    async fn finish_turn(
        &self,
        turn_id: i64,
        status: TurnStatus,
        message: Option<String>,
    ) -> LineageResult<Turn>;

    /// The branch followed by its ancestors up to the root.
    async fn ancestry(&self, branch_id: i64) -> LineageResult<Vec<Branch>>;

    /// Every branch forked, directly or transitively, from `branch_id`.
    async fn descendants(&self, branch_id: i64) -> LineageResult<Vec<Branch>>;

    /// All turns of the given branches, in any order.
    async fn branch_turns(&self, branch_ids: &[i64]) -> LineageResult<Vec<Turn>>;

    /// Delete the branch's turns above `index` and reset its counter to
    /// `index`. Returns the deleted turns.
    async fn rewind_to(&self, branch_id: i64, index: i64) -> LineageResult<Vec<Turn>>;
}
