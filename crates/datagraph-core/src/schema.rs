//! Attribute and relationship metadata, supplied by a [`SchemaService`].

use crate::{DataGraphError, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipKind {
    #[serde(rename = "belongsTo")]
    BelongsTo,
    #[serde(rename = "hasMany")]
    HasMany,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDef {
    pub name: String,
    pub default_value: Option<Value>,
}

impl AttributeDef {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            default_value: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDef {
    pub name: String,
    pub kind: RelationshipKind,
    /// Declared related type. For polymorphic fields this may be an abstract
    /// type that no resource carries directly.
    pub type_name: String,
    pub inverse: Option<String>,
    pub is_async: bool,
    pub is_polymorphic: bool,
}

impl RelationshipDef {
    pub fn belongs_to<N: Into<String>, T: Into<String>>(name: N, type_name: T) -> Self {
        Self::new(name, RelationshipKind::BelongsTo, type_name)
    }

    pub fn has_many<N: Into<String>, T: Into<String>>(name: N, type_name: T) -> Self {
        Self::new(name, RelationshipKind::HasMany, type_name)
    }

    fn new<N: Into<String>, T: Into<String>>(name: N, kind: RelationshipKind, type_name: T) -> Self {
        Self {
            name: name.into(),
            kind,
            type_name: type_name.into(),
            inverse: None,
            is_async: false,
            is_polymorphic: false,
        }
    }

    pub fn inverse<I: Into<String>>(mut self, inverse: I) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn polymorphic(mut self) -> Self {
        self.is_polymorphic = true;
        self
    }

    pub fn is_many(&self) -> bool {
        self.kind == RelationshipKind::HasMany
    }
}

/// Read-only schema lookup. Answers must stay stable for the lifetime of a
/// type.
pub trait SchemaService: Send + Sync {
    fn has_type(&self, type_name: &str) -> bool;

    fn attributes_for(&self, type_name: &str) -> Result<Vec<AttributeDef>>;

    fn relationships_for(&self, type_name: &str) -> Result<Vec<RelationshipDef>>;

    /// Whether `concrete` may stand in for the declared (possibly abstract)
    /// type of a polymorphic relationship.
    fn is_polymorphic_compatible(&self, concrete: &str, declared: &str) -> bool;

    fn attribute(&self, type_name: &str, name: &str) -> Result<Option<AttributeDef>> {
        Ok(self
            .attributes_for(type_name)?
            .into_iter()
            .find(|attr| attr.name == name))
    }

    fn relationship(&self, type_name: &str, name: &str) -> Result<RelationshipDef> {
        self.relationships_for(type_name)?
            .into_iter()
            .find(|rel| rel.name == name)
            .ok_or_else(|| DataGraphError::unknown_field(type_name, name))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeSchema {
    name: String,
    attributes: Vec<AttributeDef>,
    relationships: Vec<RelationshipDef>,
}

impl TypeSchema {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attribute<N: Into<String>>(mut self, name: N) -> Self {
        self.attributes.push(AttributeDef::new(name));
        self
    }

    pub fn attribute_with_default<N: Into<String>>(mut self, name: N, default: Value) -> Self {
        self.attributes
            .push(AttributeDef::new(name).with_default(default));
        self
    }

    pub fn relationship(mut self, def: RelationshipDef) -> Self {
        self.relationships.push(def);
        self
    }
}

/// Schema held in memory, built in code or loaded from JSON.
#[derive(Debug, Clone, Default)]
pub struct InMemorySchema {
    types: FxHashMap<String, TypeSchema>,
    polymorphic: FxHashMap<String, FxHashSet<String>>,
}

impl InMemorySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, schema: TypeSchema) -> Self {
        self.types.insert(schema.name.clone(), schema);
        self
    }

    /// Declares `concrete` as usable wherever `declared` is expected.
    pub fn with_polymorphic<D: Into<String>, C: Into<String>>(mut self, declared: D, concrete: C) -> Self {
        self.polymorphic
            .entry(declared.into())
            .or_default()
            .insert(concrete.into());
        self
    }

    /// Checks that every related type is known and every inverse points back.
    pub fn validate(&self) -> Result<()> {
        for schema in self.types.values() {
            for rel in &schema.relationships {
                let abstract_ok = rel.is_polymorphic && self.polymorphic.contains_key(&rel.type_name);
                if !self.types.contains_key(&rel.type_name) && !abstract_ok {
                    return Err(DataGraphError::UnknownType(format!(
                        "{} (related type of {}.{})",
                        rel.type_name, schema.name, rel.name
                    )));
                }
                let Some(inverse) = rel.inverse.as_deref() else {
                    continue;
                };
                let targets: Vec<&str> = if self.types.contains_key(&rel.type_name) {
                    vec![rel.type_name.as_str()]
                } else {
                    self.polymorphic
                        .get(&rel.type_name)
                        .map(|set| set.iter().map(String::as_str).collect())
                        .unwrap_or_default()
                };
                for target in targets {
                    let mirror = self.relationship(target, inverse)?;
                    if mirror.inverse.as_deref() != Some(rel.name.as_str()) {
                        return Err(DataGraphError::InvalidRelationshipData {
                            type_name: schema.name.clone(),
                            field: rel.name.clone(),
                            reason: format!(
                                "inverse {}.{} does not point back (found {:?})",
                                target, inverse, mirror.inverse
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Loads a schema document:
    ///
    /// ```json
    /// {
    ///   "types": {
    ///     "user": {
    ///       "attributes": { "name": {}, "role": { "defaultValue": "member" } },
    ///       "relationships": {
    ///         "posts": { "kind": "hasMany", "type": "post", "inverse": "author", "async": true }
    ///       }
    ///     }
    ///   },
    ///   "polymorphic": { "commentable": ["post", "photo"] }
    /// }
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let document: SchemaDocument = serde_json::from_str(json)?;
        let mut schema = InMemorySchema::new();
        for (type_name, doc) in document.types {
            let mut ty = TypeSchema::new(type_name);
            for (name, attr) in doc.attributes {
                ty.attributes.push(AttributeDef {
                    name,
                    default_value: attr.default_value,
                });
            }
            for (name, rel) in doc.relationships {
                ty.relationships.push(RelationshipDef {
                    name,
                    kind: rel.kind,
                    type_name: rel.type_name,
                    inverse: rel.inverse,
                    is_async: rel.is_async,
                    is_polymorphic: rel.polymorphic,
                });
            }
            schema = schema.with_type(ty);
        }
        for (declared, concrete) in document.polymorphic {
            for c in concrete {
                schema = schema.with_polymorphic(declared.clone(), c);
            }
        }
        schema.validate()?;
        Ok(schema)
    }

    fn type_schema(&self, type_name: &str) -> Result<&TypeSchema> {
        self.types
            .get(type_name)
            .ok_or_else(|| DataGraphError::UnknownType(type_name.to_string()))
    }
}

impl SchemaService for InMemorySchema {
    fn has_type(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    fn attributes_for(&self, type_name: &str) -> Result<Vec<AttributeDef>> {
        Ok(self.type_schema(type_name)?.attributes.clone())
    }

    fn relationships_for(&self, type_name: &str) -> Result<Vec<RelationshipDef>> {
        Ok(self.type_schema(type_name)?.relationships.clone())
    }

    fn is_polymorphic_compatible(&self, concrete: &str, declared: &str) -> bool {
        concrete == declared
            || self
                .polymorphic
                .get(declared)
                .is_some_and(|set| set.contains(concrete))
    }

    fn attribute(&self, type_name: &str, name: &str) -> Result<Option<AttributeDef>> {
        Ok(self
            .type_schema(type_name)?
            .attributes
            .iter()
            .find(|attr| attr.name == name)
            .cloned())
    }

    fn relationship(&self, type_name: &str, name: &str) -> Result<RelationshipDef> {
        self.type_schema(type_name)?
            .relationships
            .iter()
            .find(|rel| rel.name == name)
            .cloned()
            .ok_or_else(|| DataGraphError::unknown_field(type_name, name))
    }
}

#[derive(Deserialize)]
struct SchemaDocument {
    types: BTreeMap<String, TypeDocument>,
    #[serde(default)]
    polymorphic: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize)]
struct TypeDocument {
    #[serde(default)]
    attributes: BTreeMap<String, AttributeDocument>,
    #[serde(default)]
    relationships: BTreeMap<String, RelationshipDocument>,
}

#[derive(Deserialize)]
struct AttributeDocument {
    #[serde(default, rename = "defaultValue")]
    default_value: Option<Value>,
}

#[derive(Deserialize)]
struct RelationshipDocument {
    kind: RelationshipKind,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    inverse: Option<String>,
    #[serde(default, rename = "async")]
    is_async: bool,
    #[serde(default)]
    polymorphic: bool,
}
