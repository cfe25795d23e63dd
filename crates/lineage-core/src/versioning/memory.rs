//! In-memory version backend.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::backend::{NewBranch, NewTurn, VersionBackend};
use super::model::{Branch, Turn, TurnStatus};
use crate::error::{LineageError, LineageResult};

#[derive(Debug, Default)]
struct State {
    branches: BTreeMap<i64, Branch>,
    turns: BTreeMap<i64, Turn>,
    next_branch_id: i64,
    next_turn_id: i64,
}

/// Version graph kept in process memory.
///
/// All mutations take the write lock, which gives `start_turn` the same
/// per-branch serialization a row lock gives the Postgres backend.
#[derive(Debug, Default)]
pub struct MemoryVersionBackend {
    state: RwLock<State>,
}

impl MemoryVersionBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionBackend for MemoryVersionBackend {
    async fn create_branch(&self, new: NewBranch) -> LineageResult<Branch> {
        let mut state = self.state.write().await;

        if let Some(existing) = new.id.and_then(|id| state.branches.get(&id)) {
            return Ok(existing.clone());
        }

        let fork = match &new.from {
            Some(turn) => {
                let stored = state
                    .turns
                    .get(&turn.id)
                    .ok_or_else(|| LineageError::turn_not_found(turn.id))?;
                Some((stored.index, stored.id, stored.branch_id))
            }
            None => None,
        };

        let id = match new.id {
            Some(id) => {
                state.next_branch_id = state.next_branch_id.max(id);
                id
            }
            None => {
                state.next_branch_id += 1;
                state.next_branch_id
            }
        };
        let now = Utc::now();
        let branch = Branch {
            id,
            name: new.name,
            current_index: fork.map_or(0, |f| f.0),
            forked_from_index: fork.map(|f| f.0),
            forked_from_turn_id: fork.map(|f| f.1),
            forked_from_branch_id: fork.map(|f| f.2),
            created_at: now,
            updated_at: now,
        };
        state.branches.insert(branch.id, branch.clone());
        Ok(branch)
    }

    async fn get_branch(&self, branch_id: i64) -> LineageResult<Option<Branch>> {
        Ok(self.state.read().await.branches.get(&branch_id).cloned())
    }

    async fn list_branches(&self) -> LineageResult<Vec<Branch>> {
        Ok(self.state.read().await.branches.values().cloned().collect())
    }

    async fn start_turn(&self, new: NewTurn) -> LineageResult<Turn> {
        let mut state = self.state.write().await;

        if new.exclusive
            && state
                .turns
                .values()
                .any(|t| t.branch_id == new.branch_id && t.is_staged())
        {
            return Err(LineageError::turn_already_staged(new.branch_id));
        }

        let now = Utc::now();
        let branch = state
            .branches
            .get_mut(&new.branch_id)
            .ok_or_else(|| LineageError::branch_not_found(new.branch_id))?;
        branch.current_index += 1;
        branch.updated_at = now;
        let index = branch.current_index;

        state.next_turn_id += 1;
        let turn = Turn {
            id: state.next_turn_id,
            branch_id: new.branch_id,
            index,
            status: TurnStatus::Staged,
            created_at: now,
            ended_at: None,
            message: new.message,
            metadata: new.metadata,
        };
        state.turns.insert(turn.id, turn.clone());
        Ok(turn)
    }

    async fn get_turn(&self, turn_id: i64) -> LineageResult<Option<Turn>> {
        Ok(self.state.read().await.turns.get(&turn_id).cloned())
    }

    async fn finish_turn(
        &self,
        turn_id: i64,
        status: TurnStatus,
        message: Option<String>,
    ) -> LineageResult<Turn> {
        let mut state = self.state.write().await;
        let turn = state
            .turns
            .get_mut(&turn_id)
            .ok_or_else(|| LineageError::turn_not_found(turn_id))?;

        if !turn.status.can_transition_to(status) {
            return Err(LineageError::versioning(format!(
                "Turn {} is {}, cannot move to {}",
                turn_id, turn.status, status
            )));
        }
        turn.status = status;
        turn.ended_at = Some(Utc::now());
        if message.is_some() {
            turn.message = message;
        }
        Ok(turn.clone())
    }

    async fn ancestry(&self, branch_id: i64) -> LineageResult<Vec<Branch>> {
        let state = self.state.read().await;
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(branch_id);

        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(LineageError::Internal(format!(
                    "Branch ancestry of {} contains a cycle",
                    branch_id
                )));
            }
            let branch = state
                .branches
                .get(&id)
                .ok_or_else(|| LineageError::branch_not_found(id))?;
            next = branch.forked_from_branch_id;
            chain.push(branch.clone());
        }
        Ok(chain)
    }

    async fn descendants(&self, branch_id: i64) -> LineageResult<Vec<Branch>> {
        let state = self.state.read().await;
        if !state.branches.contains_key(&branch_id) {
            return Err(LineageError::branch_not_found(branch_id));
        }

        let mut found: HashSet<i64> = HashSet::from([branch_id]);
        let mut out = Vec::new();
        // Ids grow monotonically and a fork always points at an existing
        // branch, so one ordered pass reaches every descendant.
        for branch in state.branches.values() {
            if let Some(parent) = branch.forked_from_branch_id {
                if found.contains(&parent) && found.insert(branch.id) {
                    out.push(branch.clone());
                }
            }
        }
        Ok(out)
    }

    async fn branch_turns(&self, branch_ids: &[i64]) -> LineageResult<Vec<Turn>> {
        let state = self.state.read().await;
        Ok(state
            .turns
            .values()
            .filter(|t| branch_ids.contains(&t.branch_id))
            .cloned()
            .collect())
    }

    async fn rewind_to(&self, branch_id: i64, index: i64) -> LineageResult<Vec<Turn>> {
        let mut state = self.state.write().await;
        let branch = state
            .branches
            .get_mut(&branch_id)
            .ok_or_else(|| LineageError::branch_not_found(branch_id))?;
        branch.current_index = index;
        branch.updated_at = Utc::now();

        let doomed: Vec<i64> = state
            .turns
            .values()
            .filter(|t| t.branch_id == branch_id && t.index > index)
            .map(|t| t.id)
            .collect();
        Ok(doomed
            .into_iter()
            .filter_map(|id| state.turns.remove(&id))
            .collect())
    }
}
