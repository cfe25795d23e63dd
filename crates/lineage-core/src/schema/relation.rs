//! Relation descriptors.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How many target rows one parent row relates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToMany,
}

/// Intermediate entity of a many-to-many relation.
///
/// `keys[0]` references the parent, `keys[1]` references the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Junction {
    pub entity: String,
    pub keys: [String; 2],
}

/// A relation declared on a parent entity.
///
/// For one-to-one and one-to-many relations the correlation is
/// `target.foreign_key = parent.primary_key`. For many-to-many it is
/// `junction.keys[0] = parent.primary_key AND target.foreign_key = junction.keys[1]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    pub target: String,
    pub primary_key: String,
    pub foreign_key: String,
    pub cardinality: Cardinality,
    pub junction: Option<Junction>,
}

impl RelationDef {
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        primary_key: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            primary_key: primary_key.into(),
            foreign_key: foreign_key.into(),
            cardinality: Cardinality::OneToMany,
            junction: None,
        }
    }

    pub fn one_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        primary_key: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            cardinality: Cardinality::OneToOne,
            ..Self::one_to_many(name, target, primary_key, foreign_key)
        }
    }

    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        primary_key: impl Into<String>,
        foreign_key: impl Into<String>,
        junction: impl Into<String>,
        keys: [&str; 2],
    ) -> Self {
        Self {
            cardinality: Cardinality::ManyToMany,
            junction: Some(Junction {
                entity: junction.into(),
                keys: [keys[0].to_string(), keys[1].to_string()],
            }),
            ..Self::one_to_many(name, target, primary_key, foreign_key)
        }
    }

    pub fn is_one_to_one(&self) -> bool {
        self.cardinality == Cardinality::OneToOne
    }
}
