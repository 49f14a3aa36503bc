//! Schema definition and inverse resolution.
//!
//! Schemas declare the attributes and relationships of each model. Inverses
//! are resolved once when the schema is registered so relationship objects
//! never have to search for their other side at runtime.

use crate::{error::Result, Error, ModelName};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cardinality of a declared relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationshipKind {
    BelongsTo,
    HasMany,
}

impl RelationshipKind {
    pub fn is_many(self) -> bool {
        matches!(self, RelationshipKind::HasMany)
    }
}

impl std::fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelationshipKind::BelongsTo => write!(f, "belongsTo"),
            RelationshipKind::HasMany => write!(f, "hasMany"),
        }
    }
}

/// How the inverse of a relationship is declared.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InverseDecl {
    /// Find the single relationship on the related model pointing back
    #[default]
    Auto,
    /// Explicitly named inverse
    Named(String),
    /// Explicitly no inverse
    None,
}

/// Resolved inverse of a relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InverseKind {
    /// A relationship declared on the related model
    Declared(String),
    /// No declared inverse; the related record keeps a synthetic
    /// relationship keyed by the declaring model and field
    Synthetic { owner_type: ModelName, field: String },
}

/// Definition of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDef {
    /// Attribute name
    pub name: String,
    /// Value read when neither canonical nor local state has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl AttributeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }
}

/// Declaration of a relationship on a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDef {
    pub name: String,
    pub kind: RelationshipKind,
    /// Related model (the base model for polymorphic relationships)
    pub related: ModelName,
    pub is_async: bool,
    pub polymorphic: bool,
    pub inverse: InverseDecl,
}

impl RelationshipDef {
    /// A to-one relationship. Relationships are async unless marked otherwise.
    pub fn belongs_to(name: impl Into<String>, related: impl Into<ModelName>) -> Self {
        Self {
            name: name.into(),
            kind: RelationshipKind::BelongsTo,
            related: related.into(),
            is_async: true,
            polymorphic: false,
            inverse: InverseDecl::Auto,
        }
    }

    /// A to-many relationship.
    pub fn has_many(name: impl Into<String>, related: impl Into<ModelName>) -> Self {
        Self {
            kind: RelationshipKind::HasMany,
            ..Self::belongs_to(name, related)
        }
    }

    pub fn sync(mut self) -> Self {
        self.is_async = false;
        self
    }

    pub fn polymorphic(mut self) -> Self {
        self.polymorphic = true;
        self
    }

    pub fn inverse(mut self, name: impl Into<String>) -> Self {
        self.inverse = InverseDecl::Named(name.into());
        self
    }

    pub fn no_inverse(mut self) -> Self {
        self.inverse = InverseDecl::None;
        self
    }
}

/// Schema for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSchema {
    pub name: ModelName,
    /// Base model this one extends (inherits its fields, assignable to it)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<ModelName>,
    pub attributes: Vec<AttributeDef>,
    pub relationships: Vec<RelationshipDef>,
}

impl ModelSchema {
    pub fn new(name: impl Into<ModelName>) -> Self {
        Self {
            name: name.into(),
            base: None,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn extends(mut self, base: impl Into<ModelName>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(AttributeDef::new(name));
        self
    }

    pub fn attribute_with_default(
        mut self,
        name: impl Into<String>,
        default: serde_json::Value,
    ) -> Self {
        self.attributes.push(AttributeDef::with_default(name, default));
        self
    }

    pub fn relationship(mut self, def: RelationshipDef) -> Self {
        self.relationships.push(def);
        self
    }
}

/// A relationship as seen at runtime, with its inverse resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipMeta {
    pub name: String,
    pub kind: RelationshipKind,
    /// Model that declares the relationship (an ancestor for inherited ones)
    pub owner_type: ModelName,
    pub related_type: ModelName,
    pub is_async: bool,
    pub is_polymorphic: bool,
    pub inverse: InverseKind,
    /// Cardinality of the inverse side; synthetic inverses behave as sets
    pub inverse_is_many: bool,
    /// Synthesized to track the far side of a relationship without inverse
    pub implicit: bool,
}

impl RelationshipMeta {
    /// Meta for the synthetic relationship kept on records referenced by
    /// `owner_type.field`, which declares no inverse.
    pub fn implicit(owner_type: &str, field: &str) -> Self {
        Self {
            name: format!("{}:{}", owner_type, field),
            kind: RelationshipKind::HasMany,
            owner_type: String::new(),
            related_type: owner_type.to_string(),
            is_async: true,
            is_polymorphic: true,
            inverse: InverseKind::Declared(field.to_string()),
            inverse_is_many: false,
            implicit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
struct ResolvedModel {
    ancestors: Vec<ModelName>,
    attributes: IndexMap<String, AttributeDef>,
    relationships: IndexMap<String, RelationshipMeta>,
}

/// Schema for the entire cache.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Model schemas by name
    pub models: HashMap<ModelName, ModelSchema>,
    #[serde(skip)]
    resolved: HashMap<ModelName, ResolvedModel>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model to the schema. Registration must run again afterwards.
    pub fn add_model(&mut self, model: ModelSchema) -> &mut Self {
        self.models.insert(model.name.clone(), model);
        self.resolved.clear();
        self
    }

    /// Builder-style method to add a model.
    pub fn with_model(mut self, model: ModelSchema) -> Self {
        self.add_model(model);
        self
    }

    pub fn is_registered(&self) -> bool {
        !self.models.is_empty() && self.resolved.len() == self.models.len()
    }

    /// Resolve inheritance and inverses for every model.
    pub fn register(&mut self) -> Result<()> {
        let mut resolved: HashMap<ModelName, ResolvedModel> = HashMap::new();

        for name in self.models.keys() {
            let ancestors = self.ancestors_of(name)?;
            resolved.insert(
                name.clone(),
                ResolvedModel {
                    ancestors,
                    ..Default::default()
                },
            );
        }

        // Own declarations first, so inherited lookups below see them
        let mut own: HashMap<ModelName, Vec<RelationshipMeta>> = HashMap::new();
        for model in self.models.values() {
            let mut metas = Vec::with_capacity(model.relationships.len());
            for def in &model.relationships {
                if !self.models.contains_key(&def.related) {
                    return Err(Error::UnknownModel(def.related.clone()));
                }
                let (inverse, inverse_is_many) = self.resolve_inverse(&resolved, model, def)?;
                metas.push(RelationshipMeta {
                    name: def.name.clone(),
                    kind: def.kind,
                    owner_type: model.name.clone(),
                    related_type: def.related.clone(),
                    is_async: def.is_async,
                    is_polymorphic: def.polymorphic,
                    inverse,
                    inverse_is_many,
                    implicit: false,
                });
            }
            own.insert(model.name.clone(), metas);
        }

        for (name, entry) in resolved.iter_mut() {
            // Root-most ancestor first so subtypes can override
            let chain = entry
                .ancestors
                .iter()
                .rev()
                .chain(std::iter::once(name))
                .cloned()
                .collect::<Vec<_>>();
            for model_name in chain {
                if let Some(model) = self.models.get(&model_name) {
                    for attr in &model.attributes {
                        entry.attributes.insert(attr.name.clone(), attr.clone());
                    }
                }
                for meta in own.get(&model_name).into_iter().flatten() {
                    entry.relationships.insert(meta.name.clone(), meta.clone());
                }
            }
        }

        self.resolved = resolved;
        tracing::debug!(models = self.models.len(), "schema registered");
        Ok(())
    }

    fn ancestors_of(&self, name: &str) -> Result<Vec<ModelName>> {
        let mut ancestors = Vec::new();
        let mut current = self
            .models
            .get(name)
            .ok_or_else(|| Error::UnknownModel(name.to_string()))?;
        while let Some(base) = &current.base {
            if base == name || ancestors.contains(base) {
                return Err(Error::InvalidDocument(format!(
                    "model '{}' has a cyclic base chain",
                    name
                )));
            }
            ancestors.push(base.clone());
            current = self
                .models
                .get(base)
                .ok_or_else(|| Error::UnknownModel(base.clone()))?;
        }
        Ok(ancestors)
    }

    /// Relationship definitions visible on `model`, own and inherited.
    fn visible_defs<'a>(
        &'a self,
        resolved: &'a HashMap<ModelName, ResolvedModel>,
        model: &'a str,
    ) -> impl Iterator<Item = (&'a ModelName, &'a RelationshipDef)> + 'a {
        let ancestors = resolved
            .get(model)
            .map(|r| r.ancestors.as_slice())
            .unwrap_or(&[]);
        std::iter::once(model)
            .chain(ancestors.iter().map(String::as_str))
            .filter_map(move |name| self.models.get(name))
            .flat_map(|m| m.relationships.iter().map(move |d| (&m.name, d)))
    }

    fn assignable_in(
        resolved: &HashMap<ModelName, ResolvedModel>,
        base: &str,
        candidate: &str,
    ) -> bool {
        base == candidate
            || resolved
                .get(candidate)
                .is_some_and(|r| r.ancestors.iter().any(|a| a == base))
    }

    fn resolve_inverse(
        &self,
        resolved: &HashMap<ModelName, ResolvedModel>,
        model: &ModelSchema,
        def: &RelationshipDef,
    ) -> Result<(InverseKind, bool)> {
        let synthetic = || {
            (
                InverseKind::Synthetic {
                    owner_type: model.name.clone(),
                    field: def.name.clone(),
                },
                false,
            )
        };

        match &def.inverse {
            InverseDecl::None => Ok(synthetic()),
            InverseDecl::Named(inverse) => {
                let found = self
                    .visible_defs(resolved, &def.related)
                    .find(|(_, d)| &d.name == inverse);
                match found {
                    Some((_, d)) if Self::assignable_in(resolved, &d.related, &model.name) => {
                        Ok((InverseKind::Declared(d.name.clone()), d.kind.is_many()))
                    }
                    _ => Err(Error::InvalidInverse {
                        model: model.name.clone(),
                        relationship: def.name.clone(),
                        inverse: inverse.clone(),
                    }),
                }
            }
            InverseDecl::Auto => {
                let candidates: Vec<&RelationshipDef> = self
                    .visible_defs(resolved, &def.related)
                    .map(|(_, d)| d)
                    .filter(|d| Self::assignable_in(resolved, &d.related, &model.name))
                    .filter(|d| match &d.inverse {
                        InverseDecl::Auto => true,
                        InverseDecl::Named(n) => n == &def.name,
                        InverseDecl::None => false,
                    })
                    .collect();
                match candidates.as_slice() {
                    [] => Ok(synthetic()),
                    [only] => Ok((InverseKind::Declared(only.name.clone()), only.kind.is_many())),
                    many => Err(Error::AmbiguousInverse {
                        model: model.name.clone(),
                        relationship: def.name.clone(),
                        candidates: many.iter().map(|d| d.name.clone()).collect(),
                    }),
                }
            }
        }
    }

    /// Whether records of `candidate` may be used where `base` is expected.
    pub fn is_assignable(&self, base: &str, candidate: &str) -> bool {
        Self::assignable_in(&self.resolved, base, candidate)
    }

    pub fn has_model(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Check that a model is registered.
    pub fn require_model(&self, name: &str) -> Result<()> {
        if self.resolved.contains_key(name) {
            Ok(())
        } else {
            Err(Error::UnknownModel(name.to_string()))
        }
    }

    /// Get relationship meta by model and name.
    pub fn relationship(&self, model: &str, name: &str) -> Result<&RelationshipMeta> {
        self.resolved
            .get(model)
            .ok_or_else(|| Error::UnknownModel(model.to_string()))?
            .relationships
            .get(name)
            .ok_or_else(|| Error::UnknownRelationship {
                model: model.to_string(),
                name: name.to_string(),
            })
    }

    /// All relationships of a model in declaration order.
    pub fn relationships(&self, model: &str) -> impl Iterator<Item = &RelationshipMeta> {
        self.resolved
            .get(model)
            .into_iter()
            .flat_map(|r| r.relationships.values())
    }

    pub fn attribute(&self, model: &str, name: &str) -> Option<&AttributeDef> {
        self.resolved.get(model)?.attributes.get(name)
    }

    pub fn attributes(&self, model: &str) -> impl Iterator<Item = &AttributeDef> {
        self.resolved
            .get(model)
            .into_iter()
            .flat_map(|r| r.attributes.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blog_schema() -> Schema {
        let mut schema = Schema::new()
            .with_model(
                ModelSchema::new("post")
                    .attribute("title")
                    .relationship(RelationshipDef::has_many("comments", "comment"))
                    .relationship(RelationshipDef::belongs_to("author", "user").no_inverse()),
            )
            .with_model(
                ModelSchema::new("comment")
                    .attribute("body")
                    .relationship(RelationshipDef::belongs_to("post", "post")),
            )
            .with_model(ModelSchema::new("user").attribute_with_default("name", json!("anon")));
        schema.register().unwrap();
        schema
    }

    #[test]
    fn resolves_declared_inverse() {
        let schema = blog_schema();
        let comments = schema.relationship("post", "comments").unwrap();
        assert_eq!(comments.inverse, InverseKind::Declared("post".into()));
        assert!(!comments.inverse_is_many);

        let post = schema.relationship("comment", "post").unwrap();
        assert_eq!(post.inverse, InverseKind::Declared("comments".into()));
        assert!(post.inverse_is_many);
    }

    #[test]
    fn missing_inverse_is_synthetic() {
        let schema = blog_schema();
        let author = schema.relationship("post", "author").unwrap();
        assert_eq!(
            author.inverse,
            InverseKind::Synthetic {
                owner_type: "post".into(),
                field: "author".into()
            }
        );
    }

    #[test]
    fn ambiguous_inverse_rejected() {
        let mut schema = Schema::new()
            .with_model(
                ModelSchema::new("post")
                    .relationship(RelationshipDef::belongs_to("writer", "user"))
                    .relationship(RelationshipDef::belongs_to("editor", "user")),
            )
            .with_model(
                ModelSchema::new("user").relationship(RelationshipDef::has_many("posts", "post")),
            );

        let result = schema.register();
        assert!(matches!(result, Err(Error::AmbiguousInverse { .. })));
    }

    #[test]
    fn named_inverse_must_point_back() {
        let mut schema = Schema::new()
            .with_model(
                ModelSchema::new("post")
                    .relationship(RelationshipDef::belongs_to("writer", "user").inverse("friends")),
            )
            .with_model(
                ModelSchema::new("user").relationship(RelationshipDef::has_many("friends", "user")),
            );

        let result = schema.register();
        assert!(matches!(
            result,
            Err(Error::InvalidInverse { inverse, .. }) if inverse == "friends"
        ));
    }

    #[test]
    fn inheritance_and_assignability() {
        let mut schema = Schema::new()
            .with_model(
                ModelSchema::new("commentable")
                    .attribute("title")
                    .relationship(RelationshipDef::has_many("comments", "comment")),
            )
            .with_model(ModelSchema::new("post").extends("commentable").attribute("body"))
            .with_model(
                ModelSchema::new("comment").relationship(
                    RelationshipDef::belongs_to("commentable", "commentable").polymorphic(),
                ),
            );
        schema.register().unwrap();

        assert!(schema.is_assignable("commentable", "post"));
        assert!(!schema.is_assignable("post", "commentable"));
        assert!(schema.attribute("post", "title").is_some());

        let inherited = schema.relationship("post", "comments").unwrap();
        assert_eq!(inherited.owner_type, "commentable");
        assert_eq!(inherited.inverse, InverseKind::Declared("commentable".into()));
    }

    #[test]
    fn unknown_related_model() {
        let mut schema = Schema::new().with_model(
            ModelSchema::new("post").relationship(RelationshipDef::has_many("tags", "tag")),
        );
        assert!(matches!(schema.register(), Err(Error::UnknownModel(m)) if m == "tag"));
    }

    #[test]
    fn reflexive_relationship_is_its_own_inverse() {
        let mut schema = Schema::new().with_model(
            ModelSchema::new("user").relationship(RelationshipDef::has_many("friends", "user")),
        );
        schema.register().unwrap();
        let friends = schema.relationship("user", "friends").unwrap();
        assert_eq!(friends.inverse, InverseKind::Declared("friends".into()));
    }
}
