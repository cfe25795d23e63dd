use super::model::Turn;
use crate::config::VersioningConfig;
use crate::error::{LineageError, LineageResult};

/// Request-scoped branch and turn, passed explicitly to reads and writes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub branch_id: i64,
    pub turn: Option<Turn>,
}

impl ExecutionContext {
    pub fn new(branch_id: i64) -> Self {
        Self {
            branch_id,
            turn: None,
        }
    }

    /// Context on the configured default branch.
    pub fn from_config(config: &VersioningConfig) -> Self {
        Self::new(config.default_branch_id)
    }

    /// Switch to another branch, dropping the bound turn.
    pub fn checkout(&self, branch_id: i64) -> Self {
        Self::new(branch_id)
    }

    /// Bind a turn of the current branch.
    pub fn with_turn(&self, turn: Turn) -> LineageResult<Self> {
        if turn.branch_id != self.branch_id {
            return Err(LineageError::versioning(format!(
                "Turn {} belongs to branch {}, not {}",
                turn.id, turn.branch_id, self.branch_id
            )));
        }
        Ok(Self {
            branch_id: self.branch_id,
            turn: Some(turn),
        })
    }

    pub fn turn_id(&self) -> Option<i64> {
        self.turn.as_ref().map(|t| t.id)
    }

    /// The bound turn, required by writes to versioned tables.
    pub fn require_turn(&self) -> LineageResult<&Turn> {
        self.turn.as_ref().ok_or_else(|| {
            LineageError::versioning(format!(
                "No turn is bound on branch {}; start a turn before writing",
                self.branch_id
            ))
        })
    }
}
