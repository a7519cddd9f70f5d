//! Entity schemas, links and the entity registry.
//!
//! An entity type is an ordered set of typed fields (with `period` and `id`
//! always present), the links it declares to other entity types, and the
//! fields the initial input does not supply. Link targets are resolved
//! through an explicitly passed [`EntityRegistry`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::value::FieldType;

/// A named, typed field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Element type.
    pub field_type: FieldType,
}

impl FieldDef {
    /// A field named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Direction of a link between entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Each individual points to one target through a field of its own.
    ManyToOne,
    /// Each individual is pointed to by many targets.
    OneToMany,
}

/// A relation to another entity type, joined on `link_field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Link name used in expressions.
    pub name: String,
    /// Link direction.
    pub kind: LinkKind,
    /// Field holding the join id (on this entity for many-to-one, on the
    /// target for one-to-many).
    pub link_field: String,
    /// Name of the target entity type.
    pub target: String,
}

impl Link {
    /// A link joined on `link_field` of this entity.
    #[must_use]
    pub fn many_to_one(
        name: impl Into<String>,
        link_field: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: LinkKind::ManyToOne,
            link_field: link_field.into(),
            target: target.into(),
        }
    }

    /// A link joined on `link_field` of the target entity.
    #[must_use]
    pub fn one_to_many(
        name: impl Into<String>,
        link_field: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: LinkKind::OneToMany,
            link_field: link_field.into(),
            target: target.into(),
        }
    }

    /// Field holding the join id.
    #[must_use]
    pub fn link_field(&self) -> &str {
        &self.link_field
    }

    /// Resolves the target entity type.
    pub fn target_entity<'r>(
        &self,
        registry: &'r EntityRegistry,
    ) -> Option<&'r Arc<EntitySchema>> {
        registry.get(&self.target)
    }
}

/// The schema of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    name: String,
    fields: Vec<FieldDef>,
    missing_fields: BTreeSet<String>,
    links: BTreeMap<String, Link>,
}

impl EntitySchema {
    /// Builds a schema, rejecting duplicate field names.
    ///
    /// `id` and `period` are inserted at the front when absent, `period`
    /// first.
    pub fn new(
        name: impl Into<String>,
        fields: Vec<FieldDef>,
        missing_fields: impl IntoIterator<Item = String>,
        links: impl IntoIterator<Item = Link>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();

        let mut seen = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                duplicates.insert(field.name.as_str());
            }
        }
        if !duplicates.is_empty() {
            return Err(SchemaError::DuplicateFields {
                entity: name,
                names: duplicates.into_iter().collect::<Vec<_>>().join(", "),
            });
        }

        let mut fields = fields;
        if !fields.iter().any(|f| f.name == "id") {
            fields.insert(0, FieldDef::new("id", FieldType::Int));
        }
        if !fields.iter().any(|f| f.name == "period") {
            fields.insert(0, FieldDef::new("period", FieldType::Int));
        }

        Ok(Self {
            name,
            fields,
            missing_fields: missing_fields.into_iter().collect(),
            links: links.into_iter().map(|l| (l.name.clone(), l)).collect(),
        })
    }

    /// Entity name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stored fields, `period` and `id` first.
    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Names of the stored fields.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// The stored field `name`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// True if `name` is a stored field.
    #[must_use]
    pub fn is_stored(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Fields that must be computed before first use.
    #[must_use]
    pub const fn missing_fields(&self) -> &BTreeSet<String> {
        &self.missing_fields
    }

    /// Declared links, by name.
    #[must_use]
    pub const fn links(&self) -> &BTreeMap<String, Link> {
        &self.links
    }

    /// The link `name`.
    #[must_use]
    pub fn link(&self, name: &str) -> Option<&Link> {
        self.links.get(name)
    }
}

/// Read-only name -> schema registry used to resolve link targets.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<String, Arc<EntitySchema>>,
}

impl EntityRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema under its own name, replacing any previous one.
    pub fn register(&mut self, schema: EntitySchema) -> Arc<EntitySchema> {
        let schema = Arc::new(schema);
        self.entities
            .insert(schema.name().to_string(), Arc::clone(&schema));
        schema
    }

    /// Registers an already shared schema.
    pub fn insert(&mut self, schema: Arc<EntitySchema>) {
        self.entities.insert(schema.name().to_string(), schema);
    }

    /// The schema of entity `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<EntitySchema>> {
        self.entities.get(name)
    }

    /// Registered schemas, by name.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.entities.values()
    }

    /// Checks that every declared link targets a registered entity.
    pub fn check_links(&self) -> Result<(), SchemaError> {
        for schema in self.entities.values() {
            for link in schema.links().values() {
                if link.target_entity(self).is_none() {
                    return Err(SchemaError::UnknownLinkTarget {
                        entity: schema.name().to_string(),
                        link: link.name.clone(),
                        target: link.target.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
