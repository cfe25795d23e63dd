//! In-process evaluation of branch visibility.
//!
//! These functions compute the same sets the versioned query rewriter
//! expresses in SQL, which lets the in-memory backend and tests reason
//! about visibility without a database.

use std::collections::{HashMap, HashSet};

use super::model::{Branch, Turn, TurnStatus};

/// Visibility ceiling of each branch in an ancestry chain.
///
/// `ancestry` starts at the target branch and walks towards the root. The
/// target sees up to its own `current_index`; every ancestor is capped at
/// the `forked_from_index` of the branch that forked from it.
pub fn ceilings(ancestry: &[Branch]) -> Vec<(i64, i64)> {
    let mut out = Vec::with_capacity(ancestry.len());
    let mut ceiling = match ancestry.first() {
        Some(target) => target.current_index,
        None => return out,
    };
    for branch in ancestry {
        out.push((branch.id, ceiling));
        ceiling = branch.forked_from_index.unwrap_or(0);
    }
    out
}

/// Turns of `ancestry` that fall under their branch's ceiling, newest first.
///
/// Reverted turns are dropped unless `include_reverted` is set.
pub fn visible_turns(ancestry: &[Branch], turns: &[Turn], include_reverted: bool) -> Vec<Turn> {
    let limits: HashMap<i64, i64> = ceilings(ancestry).into_iter().collect();
    let mut visible: Vec<Turn> = turns
        .iter()
        .filter(|t| {
            limits
                .get(&t.branch_id)
                .is_some_and(|ceiling| t.index <= *ceiling)
        })
        .filter(|t| include_reverted || t.status != TurnStatus::Reverted)
        .cloned()
        .collect();
    visible.sort_by(|a, b| b.index.cmp(&a.index).then(b.id.cmp(&a.id)));
    visible
}

/// Rows of a turn-versioned table whose `turn_id` is visible.
pub fn filter_turn_rows(rows: &[serde_json::Value], visible: &HashSet<i64>) -> Vec<serde_json::Value> {
    rows.iter()
        .filter(|row| {
            row.get("turn_id")
                .and_then(|v| v.as_i64())
                .is_some_and(|id| visible.contains(&id))
        })
        .cloned()
        .collect()
}

/// Reduce artifact rows to the newest visible version per `artifact_id`,
/// dropping artifacts whose newest visible version is a tombstone.
pub fn latest_artifacts(rows: &[serde_json::Value], visible: &HashSet<i64>) -> Vec<serde_json::Value> {
    let mut latest: HashMap<String, &serde_json::Value> = HashMap::new();
    for row in filter_turn_rows_ref(rows, visible) {
        let Some(artifact) = row.get("artifact_id").and_then(|v| v.as_str()) else {
            continue;
        };
        let version = row.get("version").and_then(|v| v.as_i64()).unwrap_or(0);
        let newer = latest
            .get(artifact)
            .map_or(true, |cur| version > cur.get("version").and_then(|v| v.as_i64()).unwrap_or(0));
        if newer {
            latest.insert(artifact.to_string(), row);
        }
    }
    let mut out: Vec<serde_json::Value> = latest
        .into_values()
        .filter(|row| row.get("deleted_at").map_or(true, |v| v.is_null()))
        .cloned()
        .collect();
    out.sort_by(|a, b| {
        let key = |r: &serde_json::Value| r.get("artifact_id").and_then(|v| v.as_str()).map(str::to_string);
        key(a).cmp(&key(b))
    });
    out
}

fn filter_turn_rows_ref<'a>(
    rows: &'a [serde_json::Value],
    visible: &'a HashSet<i64>,
) -> impl Iterator<Item = &'a serde_json::Value> {
    rows.iter().filter(move |row| {
        row.get("turn_id")
            .and_then(|v| v.as_i64())
            .is_some_and(|id| visible.contains(&id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn branch(id: i64, current: i64, parent: Option<(i64, i64)>) -> Branch {
        Branch {
            id,
            name: None,
            current_index: current,
            forked_from_index: parent.map(|p| p.1),
            forked_from_turn_id: None,
            forked_from_branch_id: parent.map(|p| p.0),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn turn(id: i64, branch_id: i64, index: i64, status: TurnStatus) -> Turn {
        Turn {
            id,
            branch_id,
            index,
            status,
            created_at: Utc::now(),
            ended_at: None,
            message: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_multi_level_ceilings() {
        // grandchild(3) forked from child(2) at 5, child forked from main(1) at 2
        let ancestry = vec![
            branch(3, 7, Some((2, 5))),
            branch(2, 6, Some((1, 2))),
            branch(1, 9, None),
        ];
        assert_eq!(ceilings(&ancestry), vec![(3, 7), (2, 5), (1, 2)]);
    }

    #[test]
    fn test_fork_hides_later_parent_turns() {
        let ancestry = vec![branch(2, 3, Some((1, 2))), branch(1, 3, None)];
        let turns = vec![
            turn(1, 1, 1, TurnStatus::Committed),
            turn(2, 1, 2, TurnStatus::Committed),
            turn(3, 1, 3, TurnStatus::Committed),
            turn(4, 2, 3, TurnStatus::Staged),
        ];
        let ids: Vec<i64> = visible_turns(&ancestry, &turns, false).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![4, 2, 1]);
    }

    #[test]
    fn test_reverted_turns_hidden() {
        let ancestry = vec![branch(1, 2, None)];
        let turns = vec![
            turn(1, 1, 1, TurnStatus::Committed),
            turn(2, 1, 2, TurnStatus::Reverted),
        ];
        assert_eq!(visible_turns(&ancestry, &turns, false).len(), 1);
        assert_eq!(visible_turns(&ancestry, &turns, true).len(), 2);
    }

    #[test]
    fn test_latest_artifacts_and_tombstones() {
        let rows = vec![
            json!({"id": 1, "artifact_id": "a", "version": 1, "turn_id": 1, "deleted_at": null}),
            json!({"id": 2, "artifact_id": "a", "version": 2, "turn_id": 2, "deleted_at": null}),
            json!({"id": 3, "artifact_id": "b", "version": 1, "turn_id": 1, "deleted_at": null}),
            json!({"id": 4, "artifact_id": "b", "version": 2, "turn_id": 3, "deleted_at": "2024-01-01T00:00:00Z"}),
        ];

        let early: HashSet<i64> = [1].into_iter().collect();
        let out = latest_artifacts(&rows, &early);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["id"], 1);

        let all: HashSet<i64> = [1, 2, 3].into_iter().collect();
        let out = latest_artifacts(&rows, &all);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], 2);
    }
}
