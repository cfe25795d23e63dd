//! Branch and turn records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Lifecycle state of a turn. `Committed` and `Reverted` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Staged,
    Committed,
    Reverted,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnStatus::Staged)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: TurnStatus) -> bool {
        matches!(
            (self, next),
            (TurnStatus::Staged, TurnStatus::Committed) | (TurnStatus::Staged, TurnStatus::Reverted)
        )
    }
}

/// A named line of turns, optionally forked from a turn of another branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: i64,
    pub name: Option<String>,
    pub current_index: i64,
    pub forked_from_index: Option<i64>,
    pub forked_from_turn_id: Option<i64>,
    pub forked_from_branch_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Branch {
    pub fn is_root(&self) -> bool {
        self.forked_from_branch_id.is_none()
    }
}

/// One unit of writes on a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: i64,
    pub branch_id: i64,
    pub index: i64,
    pub status: TurnStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Turn {
    pub fn is_staged(&self) -> bool {
        self.status == TurnStatus::Staged
    }
}
