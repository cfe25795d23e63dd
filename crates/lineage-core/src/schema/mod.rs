//! Static entity descriptors.
//!
//! Each entity declares its table, fields, relations and versioning mode once
//! through [`EntitySchema::builder`]. Schemas are collected into a
//! [`SchemaRegistry`] that query building resolves against.

mod field;
mod registry;
mod relation;

pub use field::{FieldDef, FieldType, ForeignKey};
pub use registry::SchemaRegistry;
pub use relation::{Cardinality, Junction, RelationDef};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, LineageError, LineageResult};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex is valid"));

/// Validate a table, column or relation name.
pub fn validate_identifier(name: &str) -> LineageResult<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(LineageError::configuration(format!(
            "'{}' is not a valid identifier",
            name
        )))
    }
}

/// Versioning mode of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Versioning {
    /// Plain table, never filtered by branch.
    #[default]
    None,
    /// Rows carry `branch_id`/`turn_id` and mutate in place.
    Turn,
    /// Rows are append-only versions sharing an `artifact_id`.
    Artifact,
}

impl Versioning {
    pub fn is_versioned(&self) -> bool {
        !matches!(self, Versioning::None)
    }
}

/// Descriptor of one entity (one table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    pub primary_key: String,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<RelationDef>,
    pub versioning: Versioning,
}

impl EntitySchema {
    pub fn builder(name: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
            relations: Vec::new(),
            versioning: Versioning::None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn primary_key_field(&self) -> Option<&FieldDef> {
        self.field(&self.primary_key)
    }

    pub fn is_versioned(&self) -> bool {
        self.versioning.is_versioned()
    }

    pub fn is_artifact(&self) -> bool {
        self.versioning == Versioning::Artifact
    }

    /// Declared fields, without the columns added for versioning.
    pub fn user_fields(&self) -> impl Iterator<Item = &FieldDef> {
        let reserved: &[&str] = match self.versioning {
            Versioning::None => &[],
            Versioning::Turn => &["branch_id", "turn_id"],
            Versioning::Artifact => &["artifact_id", "version", "deleted_at", "branch_id", "turn_id"],
        };
        self.fields
            .iter()
            .filter(move |f| !reserved.contains(&f.name.as_str()))
    }
}

/// Builder for [`EntitySchema`].
pub struct EntitySchemaBuilder {
    name: String,
    fields: Vec<FieldDef>,
    relations: Vec<RelationDef>,
    versioning: Versioning,
}

impl EntitySchemaBuilder {
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn versioning(mut self, versioning: Versioning) -> Self {
        self.versioning = versioning;
        self
    }

    /// Validate the declaration and add versioning columns.
    pub fn build(mut self) -> LineageResult<EntitySchema> {
        validate_identifier(&self.name)?;

        match self.versioning {
            Versioning::None => {}
            Versioning::Turn => self.push_versioning_columns(),
            Versioning::Artifact => {
                self.fields.extend([
                    FieldDef::new("artifact_id", FieldType::Uuid).indexed(),
                    FieldDef::new("version", FieldType::Integer),
                    FieldDef::new("deleted_at", FieldType::Timestamp).optional(),
                ]);
                self.push_versioning_columns();
            }
        }

        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            validate_identifier(&field.name)?;
            if !seen.insert(field.name.as_str()) {
                return Err(LineageError::configuration_with_code(
                    format!("Field '{}' declared twice on '{}'", field.name, self.name),
                    ErrorCode::CfgDuplicate,
                ));
            }
        }

        let keys: Vec<&FieldDef> = self.fields.iter().filter(|f| f.primary_key).collect();
        let primary_key = match keys.as_slice() {
            [pk] => pk.name.clone(),
            [] => {
                return Err(LineageError::configuration_with_code(
                    format!("Entity '{}' has no primary key", self.name),
                    ErrorCode::CfgMissingPrimaryKey,
                ))
            }
            _ => {
                return Err(LineageError::configuration_with_code(
                    format!("Entity '{}' declares more than one primary key", self.name),
                    ErrorCode::CfgMissingPrimaryKey,
                ))
            }
        };

        let mut relation_names = std::collections::HashSet::new();
        for relation in &self.relations {
            validate_identifier(&relation.name)?;
            if seen.contains(relation.name.as_str()) || !relation_names.insert(relation.name.as_str()) {
                return Err(LineageError::configuration_with_code(
                    format!("Relation '{}' clashes on '{}'", relation.name, self.name),
                    ErrorCode::CfgDuplicate,
                ));
            }
            if relation.cardinality == Cardinality::ManyToMany && relation.junction.is_none() {
                return Err(LineageError::configuration(format!(
                    "Many-to-many relation '{}' needs a junction entity",
                    relation.name
                )));
            }
        }

        Ok(EntitySchema {
            name: self.name,
            primary_key,
            fields: self.fields,
            relations: self.relations,
            versioning: self.versioning,
        })
    }

    fn push_versioning_columns(&mut self) {
        self.fields.extend([
            FieldDef::new("branch_id", FieldType::BigInt)
                .references("branches", "id")
                .indexed(),
            FieldDef::new("turn_id", FieldType::BigInt)
                .references("turns", "id")
                .indexed(),
        ]);
    }
}

/// A typed record backed by an entity schema.
pub trait Entity: DeserializeOwned + Send + Sync + 'static {
    /// Table name, also the key in the schema registry.
    const TABLE: &'static str;

    /// Static descriptor of the entity.
    fn schema() -> LineageResult<EntitySchema>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post() -> EntitySchemaBuilder {
        EntitySchema::builder("posts")
            .field(FieldDef::new("id", FieldType::BigInt).primary_key())
            .field(FieldDef::new("title", FieldType::Text))
    }

    #[test]
    fn test_build_turn_versioned() {
        let schema = post().versioning(Versioning::Turn).build().unwrap();
        assert_eq!(schema.primary_key, "id");
        assert!(schema.field("branch_id").is_some());
        assert!(schema.field("turn_id").is_some());
        assert_eq!(schema.user_fields().count(), 2);
    }

    #[test]
    fn test_build_artifact() {
        let schema = post().versioning(Versioning::Artifact).build().unwrap();
        assert!(schema.is_artifact());
        assert!(schema.field("deleted_at").unwrap().optional);
        assert!(schema.field("version").is_some());
    }

    #[test]
    fn test_missing_primary_key() {
        let err = EntitySchema::builder("posts")
            .field(FieldDef::new("title", FieldType::Text))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CfgMissingPrimaryKey);
    }

    #[test]
    fn test_duplicate_field() {
        let err = post()
            .field(FieldDef::new("title", FieldType::Text))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CfgDuplicate);
    }

    #[test]
    fn test_versioning_column_clash() {
        let err = post()
            .field(FieldDef::new("turn_id", FieldType::BigInt))
            .versioning(Versioning::Turn)
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CfgDuplicate);
    }

    #[test]
    fn test_invalid_identifier() {
        assert!(validate_identifier("posts; DROP").is_err());
        assert!(validate_identifier("createdAt").is_ok());
        assert!(EntitySchema::builder("1posts").build().is_err());
    }

    #[test]
    fn test_many_to_many_without_junction() {
        let mut rel = RelationDef::one_to_many("tags", "tags", "id", "id");
        rel.cardinality = Cardinality::ManyToMany;
        assert!(post().relation(rel).build().is_err());
    }
}
