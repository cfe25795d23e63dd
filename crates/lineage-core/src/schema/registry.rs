use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{Cardinality, Entity, EntitySchema, RelationDef};
use crate::error::{ErrorCode, LineageError, LineageResult};

/// Process-wide collection of entity schemas.
///
/// Built once at startup and shared by reference (usually behind an `Arc`).
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    entities: HashMap<String, Arc<EntitySchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema. Names must be unique.
    pub fn register(&mut self, schema: EntitySchema) -> LineageResult<Arc<EntitySchema>> {
        if self.entities.contains_key(&schema.name) {
            return Err(LineageError::configuration_with_code(
                format!("Entity '{}' is already registered", schema.name),
                ErrorCode::CfgDuplicate,
            ));
        }
        debug!(entity = %schema.name, fields = schema.fields.len(), "registering entity");
        let schema = Arc::new(schema);
        self.entities.insert(schema.name.clone(), schema.clone());
        Ok(schema)
    }

    /// Register the schema of a typed entity.
    pub fn register_entity<E: Entity>(&mut self) -> LineageResult<Arc<EntitySchema>> {
        let schema = E::schema()?;
        if schema.name != E::TABLE {
            return Err(LineageError::configuration(format!(
                "Entity table '{}' does not match schema name '{}'",
                E::TABLE,
                schema.name
            )));
        }
        self.register(schema)
    }

    /// Look up an entity by table name.
    pub fn get(&self, name: &str) -> LineageResult<&Arc<EntitySchema>> {
        self.entities.get(name).ok_or_else(|| {
            LineageError::query_build(
                format!("No entity named '{}' is registered", name),
                ErrorCode::QryUnknownEntity,
            )
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.entities.values()
    }

    /// The relation `parent` declares towards `target`.
    pub fn relation_between(&self, parent: &str, target: &str) -> LineageResult<&RelationDef> {
        let schema = self.get(parent)?;
        schema
            .relations
            .iter()
            .find(|r| r.target == target)
            .ok_or_else(|| {
                LineageError::query_build(
                    format!("Entity '{}' declares no relation to '{}'", parent, target),
                    ErrorCode::QryNoRelation,
                )
            })
    }

    /// Check that every relation points at registered entities and columns.
    pub fn validate(&self) -> LineageResult<()> {
        for schema in self.entities.values() {
            for relation in &schema.relations {
                self.validate_relation(schema, relation)?;
            }
        }
        Ok(())
    }

    fn validate_relation(&self, parent: &EntitySchema, relation: &RelationDef) -> LineageResult<()> {
        let missing = |what: String| {
            LineageError::configuration(format!(
                "Relation '{}.{}': {}",
                parent.name, relation.name, what
            ))
        };

        let target = self
            .entities
            .get(&relation.target)
            .ok_or_else(|| missing(format!("unknown target entity '{}'", relation.target)))?;
        if parent.field(&relation.primary_key).is_none() {
            return Err(missing(format!("'{}' has no field '{}'", parent.name, relation.primary_key)));
        }
        if target.field(&relation.foreign_key).is_none() {
            return Err(missing(format!("'{}' has no field '{}'", target.name, relation.foreign_key)));
        }

        if relation.cardinality == Cardinality::ManyToMany {
            let junction = relation
                .junction
                .as_ref()
                .ok_or_else(|| missing("many-to-many relation without junction".to_string()))?;
            let junction_schema = self
                .entities
                .get(&junction.entity)
                .ok_or_else(|| missing(format!("unknown junction entity '{}'", junction.entity)))?;
            for key in &junction.keys {
                if junction_schema.field(key).is_none() {
                    return Err(missing(format!("junction '{}' has no field '{}'", junction.entity, key)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType};

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::builder("posts")
                    .field(FieldDef::new("id", FieldType::BigInt).primary_key())
                    .relation(RelationDef::one_to_many("comments", "comments", "id", "post_id"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                EntitySchema::builder("comments")
                    .field(FieldDef::new("id", FieldType::BigInt).primary_key())
                    .field(FieldDef::new("post_id", FieldType::BigInt))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_validate_ok() {
        assert!(registry().validate().is_ok());
    }

    #[test]
    fn test_unknown_entity() {
        let err = registry().get("likes").unwrap_err();
        assert_eq!(err.code(), ErrorCode::QryUnknownEntity);
    }

    #[test]
    fn test_relation_between() {
        let registry = registry();
        assert_eq!(registry.relation_between("posts", "comments").unwrap().name, "comments");
        let err = registry.relation_between("comments", "posts").unwrap_err();
        assert_eq!(err.code(), ErrorCode::QryNoRelation);
    }

    #[test]
    fn test_validate_missing_target() {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::builder("posts")
                    .field(FieldDef::new("id", FieldType::BigInt).primary_key())
                    .relation(RelationDef::one_to_many("likes", "likes", "id", "post_id"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = registry();
        let schema = registry.get("posts").unwrap().as_ref().clone();
        assert_eq!(registry.register(schema).unwrap_err().code(), ErrorCode::CfgDuplicate);
    }
}
