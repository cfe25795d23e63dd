//! Branch and turn lifecycle on top of a [`VersionBackend`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use super::backend::{NewBranch, NewTurn, VersionBackend};
use super::context::ExecutionContext;
use super::model::{Branch, Turn, TurnStatus};
use super::visibility;
use crate::config::VersioningConfig;
use crate::error::{LineageError, LineageResult};

/// Committed turns visible from only one side of a comparison.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchDiff {
    pub only_a: Vec<Turn>,
    pub only_b: Vec<Turn>,
}

/// Fork/commit/revert state machine.
pub struct VersionGraph<B: VersionBackend> {
    backend: Arc<B>,
    config: VersioningConfig,
}

impl<B: VersionBackend> Clone for VersionGraph<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B: VersionBackend> VersionGraph<B> {
    pub fn new(backend: Arc<B>, config: VersioningConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &VersioningConfig {
        &self.config
    }

    /// Context bound to the default branch.
    pub fn default_context(&self) -> ExecutionContext {
        ExecutionContext::from_config(&self.config)
    }

    /// Fetch the default branch, creating it under the configured id when
    /// missing.
    pub async fn get_or_create_main(&self) -> LineageResult<Branch> {
        let id = self.config.default_branch_id;
        if let Some(branch) = self.backend.get_branch(id).await? {
            return Ok(branch);
        }
        let branch = self
            .backend
            .create_branch(NewBranch::root(self.config.main_branch_name.clone()).with_id(id))
            .await?;
        info!(branch_id = branch.id, name = %self.config.main_branch_name, "created main branch");
        Ok(branch)
    }

    pub async fn get_branch(&self, branch_id: i64) -> LineageResult<Branch> {
        self.backend
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| LineageError::branch_not_found(branch_id))
    }

    pub async fn get_turn(&self, turn_id: i64) -> LineageResult<Turn> {
        self.backend
            .get_turn(turn_id)
            .await?
            .ok_or_else(|| LineageError::turn_not_found(turn_id))
    }

    pub async fn list_branches(&self) -> LineageResult<Vec<Branch>> {
        self.backend.list_branches().await
    }

    /// Open a staged turn at the branch's next index.
    pub async fn start_turn(
        &self,
        branch_id: i64,
        message: Option<String>,
        metadata: serde_json::Value,
    ) -> LineageResult<Turn> {
        let turn = self
            .backend
            .start_turn(NewTurn {
                branch_id,
                message,
                metadata,
                exclusive: self.config.enforce_single_staged_turn,
            })
            .await?;
        info!(branch_id, turn_id = turn.id, index = turn.index, "turn started");
        Ok(turn)
    }

    pub async fn commit_turn(&self, turn_id: i64) -> LineageResult<Turn> {
        let turn = self
            .backend
            .finish_turn(turn_id, TurnStatus::Committed, None)
            .await?;
        info!(branch_id = turn.branch_id, turn_id, index = turn.index, "turn committed");
        Ok(turn)
    }

    /// Revert a staged turn. Its rows stay in place but drop out of every
    /// later read.
    pub async fn revert_turn(&self, turn_id: i64, message: Option<String>) -> LineageResult<Turn> {
        let turn = self
            .backend
            .finish_turn(turn_id, TurnStatus::Reverted, message)
            .await?;
        info!(branch_id = turn.branch_id, turn_id, index = turn.index, "turn reverted");
        Ok(turn)
    }

    /// Create a branch that sees `turn_id`'s branch up to and including it.
    ///
    /// Unnamed forks are called `branch-<parent>-<index>`.
    pub async fn fork_from(&self, turn_id: i64, name: Option<String>) -> LineageResult<Branch> {
        let turn = self.get_turn(turn_id).await?;
        let name = name.unwrap_or_else(|| format!("branch-{}-{}", turn.branch_id, turn.index));
        let parent = turn.branch_id;
        let index = turn.index;
        let branch = self
            .backend
            .create_branch(NewBranch::fork(turn, Some(name)))
            .await?;
        info!(branch_id = branch.id, parent, index, "branch forked");
        Ok(branch)
    }

    /// The branch followed by its ancestors, root last.
    pub async fn ancestry(&self, branch_id: i64) -> LineageResult<Vec<Branch>> {
        let chain = self.backend.ancestry(branch_id).await?;
        if chain.is_empty() {
            return Err(LineageError::branch_not_found(branch_id));
        }
        Ok(chain)
    }

    /// Ancestors of `branch_id`, oldest first, ending with the branch itself.
    pub async fn branch_lineage(&self, branch_id: i64) -> LineageResult<Vec<Branch>> {
        let mut chain = self.ancestry(branch_id).await?;
        chain.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(chain)
    }

    /// The branch and every branch forked from it, transitively.
    pub async fn branch_tree(&self, branch_id: i64) -> LineageResult<Vec<Branch>> {
        let mut tree = vec![self.get_branch(branch_id).await?];
        tree.extend(self.backend.descendants(branch_id).await?);
        Ok(tree)
    }

    /// Non-reverted turns `branch_id` can see, newest first.
    pub async fn visible_turns(&self, branch_id: i64) -> LineageResult<Vec<Turn>> {
        let ancestry = self.ancestry(branch_id).await?;
        let ids: Vec<i64> = ancestry.iter().map(|b| b.id).collect();
        let turns = self.backend.branch_turns(&ids).await?;
        Ok(visibility::visible_turns(&ancestry, &turns, false))
    }

    /// Turns under the branch's visibility ceilings, newest first, optionally
    /// restricted to one status.
    pub async fn history(
        &self,
        branch_id: i64,
        status: Option<TurnStatus>,
        limit: Option<usize>,
    ) -> LineageResult<Vec<Turn>> {
        let ancestry = self.ancestry(branch_id).await?;
        let ids: Vec<i64> = ancestry.iter().map(|b| b.id).collect();
        let turns = self.backend.branch_turns(&ids).await?;
        let mut out: Vec<Turn> = visibility::visible_turns(&ancestry, &turns, true)
            .into_iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect();
        if let Some(n) = limit {
            out.truncate(n);
        }
        Ok(out)
    }

    /// Most recent turn on the branch itself, in any status.
    pub async fn latest_turn(&self, branch_id: i64) -> LineageResult<Option<Turn>> {
        self.get_branch(branch_id).await?;
        let turns = self.backend.branch_turns(&[branch_id]).await?;
        Ok(turns.into_iter().max_by_key(|t| t.index))
    }

    /// Drop every turn after `turn_id` on `branch_id` and reset the branch
    /// counter to that turn, so the next turn reuses the freed index.
    ///
    /// Refused while a fork hangs off one of the dropped turns, since the
    /// fork's ceiling would otherwise expose the reused indices. Returns the
    /// deleted turns, oldest first.
    pub async fn rewind_to(&self, branch_id: i64, turn_id: i64) -> LineageResult<Vec<Turn>> {
        let turn = self.get_turn(turn_id).await?;
        if turn.branch_id != branch_id {
            return Err(LineageError::versioning(format!(
                "Turn {} belongs to branch {}, not {}",
                turn.id, turn.branch_id, branch_id
            )));
        }

        let blocked: Vec<i64> = self
            .backend
            .list_branches()
            .await?
            .into_iter()
            .filter(|b| {
                b.forked_from_branch_id == Some(branch_id)
                    && b.forked_from_index.map_or(false, |i| i > turn.index)
            })
            .map(|b| b.id)
            .collect();
        if !blocked.is_empty() {
            return Err(LineageError::versioning(format!(
                "Cannot rewind branch {} to index {}: branches {:?} fork from later turns",
                branch_id, turn.index, blocked
            )));
        }

        let mut removed = self.backend.rewind_to(branch_id, turn.index).await?;
        removed.sort_by_key(|t| t.index);
        info!(branch_id, index = turn.index, removed = removed.len(), "branch rewound");
        Ok(removed)
    }

    /// Committed turns each branch sees that the other does not.
    pub async fn diff_branches(&self, a: i64, b: i64) -> LineageResult<BranchDiff> {
        let committed = |turns: Vec<Turn>| -> Vec<Turn> {
            turns
                .into_iter()
                .filter(|t| t.status == TurnStatus::Committed)
                .collect()
        };
        let seen_a = committed(self.visible_turns(a).await?);
        let seen_b = committed(self.visible_turns(b).await?);
        let ids_a: HashSet<i64> = seen_a.iter().map(|t| t.id).collect();
        let ids_b: HashSet<i64> = seen_b.iter().map(|t| t.id).collect();

        Ok(BranchDiff {
            only_a: seen_a.into_iter().filter(|t| !ids_b.contains(&t.id)).collect(),
            only_b: seen_b.into_iter().filter(|t| !ids_a.contains(&t.id)).collect(),
        })
    }

    /// Replay committed turns visible only from `source` onto `target`, oldest
    /// first, as new committed turns.
    ///
    /// Only turn messages and metadata move. Rows written by the source turns
    /// stay on the source branch and no conflict resolution is attempted.
    pub async fn merge_branch(&self, source: i64, target: i64) -> LineageResult<Vec<Turn>> {
        let mut pending = self.diff_branches(source, target).await?.only_a;
        pending.sort_by_key(|t| (t.index, t.id));

        let mut merged = Vec::with_capacity(pending.len());
        for turn in pending {
            let mut metadata = match turn.metadata {
                serde_json::Value::Object(map) => map,
                serde_json::Value::Null => serde_json::Map::new(),
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("value".to_string(), other);
                    map
                }
            };
            metadata.insert(
                "merged_from".to_string(),
                serde_json::json!({ "branch_id": turn.branch_id, "turn_id": turn.id }),
            );
            let replay = self
                .start_turn(target, turn.message, serde_json::Value::Object(metadata))
                .await?;
            merged.push(self.commit_turn(replay.id).await?);
        }
        info!(source, target, turns = merged.len(), "branch merged");
        Ok(merged)
    }

    /// Run `f` inside a fresh turn on `ctx`'s branch.
    ///
    /// The turn is committed when `f` succeeds and reverted with the error
    /// text when it fails; the original error is returned either way.
    pub async fn run_in_turn<T, F, Fut>(
        &self,
        ctx: &ExecutionContext,
        message: Option<String>,
        f: F,
    ) -> LineageResult<(Turn, T)>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = LineageResult<T>>,
    {
        let turn = self
            .start_turn(ctx.branch_id, message, serde_json::Value::Null)
            .await?;
        let scoped = ctx.with_turn(turn.clone())?;

        match f(scoped).await {
            Ok(value) => {
                let committed = self.commit_turn(turn.id).await?;
                Ok((committed, value))
            }
            Err(err) => {
                if let Err(revert_err) = self.revert_turn(turn.id, Some(err.to_string())).await {
                    warn!(turn_id = turn.id, error = %revert_err, "failed to revert turn");
                }
                Err(err)
            }
        }
    }
}
