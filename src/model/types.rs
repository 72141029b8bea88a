//! Type registry
//!
//! Entity and relationship types known to a mesh base. The registry is a plain
//! value handed to each mesh base at construction; it can be built in code or
//! loaded from a TOML schema file:
//!
//! ```toml
//! [[entity_types]]
//! name = "Tag"
//! properties = [{ name = "label" }, { name = "weight", default = { Integer = 1 } }]
//!
//! [[relationship_types]]
//! name = "Tagged"
//! ```

use crate::error::MeshError;
use crate::model::value::PropertyValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const SOURCE_SUFFIX: &str = "-S";
const DESTINATION_SUFFIX: &str = "-D";

/// A property declared by an entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyType {
    pub name: String,
    #[serde(default)]
    pub default: Option<PropertyValue>,
}

/// A type that can be blessed onto a mesh object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertyType>,
}

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(PropertyType {
            name: name.into(),
            default: None,
        });
        self
    }

    pub fn with_default(mut self, name: impl Into<String>, default: PropertyValue) -> Self {
        self.properties.push(PropertyType {
            name: name.into(),
            default: Some(default),
        });
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyType> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// A relationship type; blessing a relationship gives the source the `-S` role
/// towards the destination and the destination the `-D` role back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipType {
    pub name: String,
}

impl RelationshipType {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn source_role(&self) -> String {
        format!("{}{}", self.name, SOURCE_SUFFIX)
    }

    pub fn destination_role(&self) -> String {
        format!("{}{}", self.name, DESTINATION_SUFFIX)
    }
}

#[derive(Debug, Default, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    entity_types: Vec<EntityType>,
    #[serde(default)]
    relationship_types: Vec<RelationshipType>,
}

/// Entity and relationship types known to a mesh base.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    entity_types: BTreeMap<String, EntityType>,
    relationship_types: BTreeMap<String, RelationshipType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity_type(&mut self, entity_type: EntityType) -> &mut Self {
        self.entity_types
            .insert(entity_type.name.clone(), entity_type);
        self
    }

    pub fn register_relationship_type(&mut self, relationship_type: RelationshipType) -> &mut Self {
        self.relationship_types
            .insert(relationship_type.name.clone(), relationship_type);
        self
    }

    pub fn entity_type(&self, name: &str) -> Option<&EntityType> {
        self.entity_types.get(name)
    }

    pub fn relationship_type(&self, name: &str) -> Option<&RelationshipType> {
        self.relationship_types.get(name)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.entity_types.values()
    }

    pub fn relationship_types(&self) -> impl Iterator<Item = &RelationshipType> {
        self.relationship_types.values()
    }

    pub(crate) fn require_entity_type(&self, name: &str) -> Result<&EntityType, MeshError> {
        self.entity_type(name)
            .ok_or_else(|| MeshError::UnknownType(name.to_string()))
    }

    pub(crate) fn require_relationship_type(
        &self,
        name: &str,
    ) -> Result<&RelationshipType, MeshError> {
        self.relationship_type(name)
            .ok_or_else(|| MeshError::UnknownType(name.to_string()))
    }

    /// Whether any of `types` declares `property`.
    pub fn declares_property<'a>(
        &self,
        types: impl IntoIterator<Item = &'a String>,
        property: &str,
    ) -> bool {
        types.into_iter().any(|name| {
            self.entity_type(name)
                .map(|t| t.property(property).is_some())
                .unwrap_or(false)
        })
    }

    /// The role on the other side of a relationship role.
    pub fn inverse_role(&self, role: &str) -> Option<String> {
        if let Some(name) = role.strip_suffix(SOURCE_SUFFIX) {
            self.relationship_type(name).map(|r| r.destination_role())
        } else if let Some(name) = role.strip_suffix(DESTINATION_SUFFIX) {
            self.relationship_type(name).map(|r| r.source_role())
        } else {
            None
        }
    }

    /// Parse a TOML schema document.
    pub fn from_toml_str(source: &str) -> Result<Self, MeshError> {
        let schema: SchemaFile = toml::from_str(source)
            .map_err(|e| MeshError::Config(format!("Invalid type schema: {}", e)))?;

        let mut registry = Self::new();
        for entity_type in schema.entity_types {
            registry.register_entity_type(entity_type);
        }
        for relationship_type in schema.relationship_types {
            registry.register_relationship_type(relationship_type);
        }
        Ok(registry)
    }

    /// Load a TOML schema file.
    pub fn load(path: &Path) -> Result<Self, MeshError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            MeshError::Config(format!("Failed to read schema {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }
}
