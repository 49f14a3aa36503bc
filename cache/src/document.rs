//! Normalized documents and their structural validation.
//!
//! Every document is validated in full before the store applies any of it,
//! so a malformed payload never leaves partial state behind.

use crate::identity::coerce_id;
use crate::record::Attributes;
use crate::{error::Result, Error, ModelName, Schema};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A (type, id) pair referencing a record without its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub model: ModelName,
    pub id: String,
}

impl ResourceIdentifier {
    pub fn new(model: impl Into<ModelName>, id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
        }
    }
}

/// Relationship linkage: `null`, one identifier, or a list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Linkage {
    Many(Vec<ResourceIdentifier>),
    One(ResourceIdentifier),
    Empty,
}

impl Linkage {
    pub fn identifiers(&self) -> Vec<&ResourceIdentifier> {
        match self {
            Linkage::Many(ids) => ids.iter().collect(),
            Linkage::One(id) => vec![id],
            Linkage::Empty => Vec::new(),
        }
    }
}

/// Links attached to a relationship payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<String>,
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

/// Raw payload for one relationship of one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelationshipPayload {
    /// `None` when the payload carried no `data` member at all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Linkage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl RelationshipPayload {
    pub fn with_data(data: Linkage) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn with_link(related: impl Into<String>) -> Self {
        Self {
            links: Some(Links {
                related: Some(related.into()),
                self_link: None,
            }),
            ..Default::default()
        }
    }

    pub fn related_link(&self) -> Option<&str> {
        self.links.as_ref()?.related.as_deref()
    }
}

/// A resource object with attributes and relationship payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub model: ModelName,
    pub id: String,
    #[serde(skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub relationships: IndexMap<String, RelationshipPayload>,
}

impl Resource {
    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier::new(self.model.clone(), self.id.clone())
    }
}

/// Primary data of a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Many(Vec<Resource>),
    One(Box<Resource>),
    Empty,
}

/// Source of an error object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

/// A server-reported error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
}

impl ErrorObject {
    /// Error pointing at one attribute.
    pub fn for_attribute(attribute: &str, detail: impl Into<String>) -> Self {
        Self {
            status: Some("422".into()),
            title: Some("Invalid Attribute".into()),
            detail: Some(detail.into()),
            source: Some(ErrorSource {
                pointer: Some(format!("/data/attributes/{}", attribute)),
                parameter: None,
            }),
        }
    }

    /// Attribute or relationship the error points at; `base` otherwise.
    pub fn field(&self) -> String {
        let pointer = self
            .source
            .as_ref()
            .and_then(|s| s.pointer.as_deref())
            .unwrap_or("");
        pointer
            .strip_prefix("/data/attributes/")
            .or_else(|| pointer.strip_prefix("/data/relationships/"))
            .filter(|f| !f.is_empty())
            .unwrap_or("base")
            .to_string()
    }

    pub fn message(&self) -> String {
        self.detail
            .clone()
            .or_else(|| self.title.clone())
            .unwrap_or_else(|| "is invalid".into())
    }
}

/// Per-attribute validation messages attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    by_field: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn from_error_objects(errors: &[ErrorObject]) -> Self {
        let mut out = Self::default();
        for error in errors {
            out.add(error.field(), error.message());
        }
        out
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.by_field
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn remove(&mut self, field: &str) {
        self.by_field.remove(field);
    }

    pub fn clear(&mut self) {
        self.by_field.clear();
    }

    pub fn get(&self, field: &str) -> &[String] {
        self.by_field.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_field.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_field.values().map(Vec::len).sum()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.by_field.keys().map(String::as_str)
    }
}

/// A validated, normalized document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Document {
    /// `None` when the document has no `data` member
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<PrimaryData>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<Resource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorObject>,
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidDocument(message.into())
}

impl Document {
    /// Validate a raw JSON value against the schema.
    pub fn from_value(value: &Value, schema: &Schema) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid("document must be an object"))?;

        let has_data = object.contains_key("data");
        let has_errors = object.contains_key("errors");
        let has_meta = object.contains_key("meta");

        if has_data && has_errors {
            return Err(invalid("'data' and 'errors' must not coexist"));
        }
        if !has_data && !has_errors && !has_meta {
            return Err(invalid(
                "document must contain at least one of 'data', 'errors' or 'meta'",
            ));
        }

        let data = match object.get("data") {
            None => None,
            Some(Value::Null) => Some(PrimaryData::Empty),
            Some(Value::Array(items)) => Some(PrimaryData::Many(
                items
                    .iter()
                    .map(|item| parse_resource(item, schema))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Some(item @ Value::Object(_)) => {
                Some(PrimaryData::One(Box::new(parse_resource(item, schema)?)))
            }
            Some(_) => return Err(invalid("'data' must be null, an object or an array")),
        };

        let included = match object.get("included") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| parse_resource(item, schema))
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(invalid("'included' must be an array")),
        };

        let errors = match object.get("errors") {
            None => Vec::new(),
            Some(errors @ Value::Array(_)) => serde_json::from_value(errors.clone())
                .map_err(|e| invalid(format!("malformed 'errors': {}", e)))?,
            Some(_) => return Err(invalid("'errors' must be an array")),
        };

        let meta = object.get("meta").cloned();
        if meta.as_ref().is_some_and(|m| !m.is_object()) {
            return Err(invalid("'meta' must be an object"));
        }

        Ok(Self {
            data,
            included,
            meta,
            links: object.get("links").cloned(),
            errors,
        })
    }

    /// Document with a single primary resource.
    pub fn single(resource: Resource) -> Self {
        Self {
            data: Some(PrimaryData::One(Box::new(resource))),
            ..Default::default()
        }
    }

    /// Primary resources in order.
    pub fn primary(&self) -> Vec<&Resource> {
        match &self.data {
            Some(PrimaryData::Many(items)) => items.iter().collect(),
            Some(PrimaryData::One(item)) => vec![item.as_ref()],
            _ => Vec::new(),
        }
    }

    /// Every resource in the document, primary and included.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.primary().into_iter().chain(self.included.iter())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn parse_identifier(value: &Value, schema: &Schema, context: &str) -> Result<ResourceIdentifier> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid(format!("{}: resource identifier must be an object", context)))?;
    let model = object
        .get("type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| invalid(format!("{}: resource identifier is missing 'type'", context)))?;
    schema.require_model(model)?;
    let id = object
        .get("id")
        .and_then(coerce_id)
        .ok_or_else(|| Error::MissingId {
            model: model.to_string(),
        })?;
    Ok(ResourceIdentifier::new(model, id))
}

fn parse_resource(value: &Value, schema: &Schema) -> Result<Resource> {
    let identifier = parse_identifier(value, schema, "resource")?;
    let object = value
        .as_object()
        .ok_or_else(|| invalid("resource must be an object"))?;

    let attributes = match object.get("attributes") {
        None | Some(Value::Null) => Attributes::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(invalid(format!(
                "attributes of {}:{} must be an object",
                identifier.model, identifier.id
            )))
        }
    };

    let mut relationships = IndexMap::new();
    match object.get("relationships") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (name, payload) in map {
                let meta = match schema.relationship(&identifier.model, name) {
                    Ok(meta) => meta,
                    Err(_) => {
                        tracing::warn!(
                            model = %identifier.model,
                            relationship = %name,
                            "ignoring payload for undeclared relationship"
                        );
                        continue;
                    }
                };
                let parsed = parse_relationship(payload, schema, &identifier.model, name, meta)?;
                relationships.insert(name.clone(), parsed);
            }
        }
        Some(_) => {
            return Err(invalid(format!(
                "relationships of {}:{} must be an object",
                identifier.model, identifier.id
            )))
        }
    }

    Ok(Resource {
        model: identifier.model,
        id: identifier.id,
        attributes,
        relationships,
    })
}

fn parse_relationship(
    value: &Value,
    schema: &Schema,
    model: &str,
    name: &str,
    meta: &crate::RelationshipMeta,
) -> Result<RelationshipPayload> {
    let object = value.as_object().ok_or_else(|| {
        invalid(format!("relationship '{}.{}' must be an object", model, name))
    })?;

    let kind_mismatch = |expected| Error::RelationshipKindMismatch {
        model: model.to_string(),
        relationship: name.to_string(),
        expected,
    };
    let context = format!("{}.{}", model, name);
    let check_type = |identifier: &ResourceIdentifier| {
        if schema.is_assignable(&meta.related_type, &identifier.model) {
            Ok(())
        } else {
            Err(Error::IncompatibleType {
                relationship: context.clone(),
                expected: meta.related_type.clone(),
                got: identifier.model.clone(),
            })
        }
    };

    let data = match (object.get("data"), meta.kind.is_many()) {
        (None, _) => None,
        (Some(Value::Array(items)), true) => {
            let mut identifiers = Vec::with_capacity(items.len());
            for item in items {
                let identifier = parse_identifier(item, schema, &context)?;
                check_type(&identifier)?;
                identifiers.push(identifier);
            }
            Some(Linkage::Many(identifiers))
        }
        (Some(_), true) => return Err(kind_mismatch("array")),
        (Some(Value::Null), false) => Some(Linkage::Empty),
        (Some(item @ Value::Object(_)), false) => {
            let identifier = parse_identifier(item, schema, &context)?;
            check_type(&identifier)?;
            Some(Linkage::One(identifier))
        }
        (Some(_), false) => return Err(kind_mismatch("object or null")),
    };

    let links = match object.get("links") {
        None | Some(Value::Null) => None,
        Some(Value::Object(links)) => {
            let link = |key: &str| match links.get(key) {
                Some(Value::String(href)) => Some(href.clone()),
                Some(Value::Object(obj)) => {
                    obj.get("href").and_then(Value::as_str).map(String::from)
                }
                _ => None,
            };
            Some(Links {
                related: link("related"),
                self_link: link("self"),
            })
        }
        Some(_) => return Err(invalid(format!("links of '{}' must be an object", context))),
    };

    Ok(RelationshipPayload {
        data,
        links,
        meta: object.get("meta").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ModelSchema, RelationshipDef};
    use serde_json::json;

    fn schema() -> Schema {
        let mut schema = Schema::new()
            .with_model(
                ModelSchema::new("post")
                    .attribute("title")
                    .relationship(RelationshipDef::has_many("comments", "comment")),
            )
            .with_model(
                ModelSchema::new("comment")
                    .relationship(RelationshipDef::belongs_to("post", "post")),
            );
        schema.register().unwrap();
        schema
    }

    #[test]
    fn parses_single_resource() {
        let doc = Document::from_value(
            &json!({
                "data": {
                    "type": "post", "id": 1,
                    "attributes": {"title": "A"},
                    "relationships": {
                        "comments": {
                            "data": [{"type": "comment", "id": "2"}],
                            "links": {"related": "/posts/1/comments"}
                        }
                    }
                },
                "included": [{"type": "comment", "id": "2"}]
            }),
            &schema(),
        )
        .unwrap();

        let primary = doc.primary();
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].id, "1");
        let comments = &primary[0].relationships["comments"];
        assert_eq!(
            comments.data,
            Some(Linkage::Many(vec![ResourceIdentifier::new("comment", "2")]))
        );
        assert_eq!(comments.related_link(), Some("/posts/1/comments"));
        assert_eq!(doc.resources().count(), 2);
    }

    #[test]
    fn data_and_errors_are_exclusive() {
        let result = Document::from_value(&json!({"data": null, "errors": []}), &schema());
        assert!(matches!(result, Err(Error::InvalidDocument(_))));

        let result = Document::from_value(&json!({"links": {}}), &schema());
        assert!(matches!(result, Err(Error::InvalidDocument(_))));

        let doc = Document::from_value(&json!({"meta": {"total": 3}}), &schema()).unwrap();
        assert!(doc.data.is_none());
    }

    #[test]
    fn missing_id_rejected() {
        let result = Document::from_value(&json!({"data": {"type": "post"}}), &schema());
        assert!(matches!(result, Err(Error::MissingId { model }) if model == "post"));
    }

    #[test]
    fn relationship_kind_mismatch() {
        let result = Document::from_value(
            &json!({"data": {"type": "comment", "id": "1", "relationships": {
                "post": {"data": []}
            }}}),
            &schema(),
        );
        assert!(matches!(
            result,
            Err(Error::RelationshipKindMismatch { expected, .. }) if expected == "object or null"
        ));

        let result = Document::from_value(
            &json!({"data": {"type": "post", "id": "1", "relationships": {
                "comments": {"data": null}
            }}}),
            &schema(),
        );
        assert!(matches!(result, Err(Error::RelationshipKindMismatch { .. })));
    }

    #[test]
    fn null_linkage_differs_from_absent() {
        let doc = Document::from_value(
            &json!({"data": {"type": "comment", "id": "1", "relationships": {
                "post": {"data": null}
            }}}),
            &schema(),
        )
        .unwrap();
        assert_eq!(doc.primary()[0].relationships["post"].data, Some(Linkage::Empty));

        let doc = Document::from_value(
            &json!({"data": {"type": "comment", "id": "1", "relationships": {
                "post": {"links": {"related": {"href": "/comments/1/post"}}}
            }}}),
            &schema(),
        )
        .unwrap();
        let payload = &doc.primary()[0].relationships["post"];
        assert_eq!(payload.data, None);
        assert_eq!(payload.related_link(), Some("/comments/1/post"));
    }

    #[test]
    fn unknown_type_rejected() {
        let result = Document::from_value(&json!({"data": {"type": "tag", "id": "1"}}), &schema());
        assert!(matches!(result, Err(Error::UnknownModel(m)) if m == "tag"));
    }

    #[test]
    fn error_objects_map_to_fields() {
        let errors = vec![
            ErrorObject::for_attribute("title", "can't be blank"),
            ErrorObject {
                detail: Some("is bad".into()),
                ..Default::default()
            },
        ];
        let validation = ValidationErrors::from_error_objects(&errors);
        assert_eq!(validation.get("title"), &["can't be blank".to_string()]);
        assert_eq!(validation.get("base"), &["is bad".to_string()]);
        assert_eq!(validation.len(), 2);
    }
}
