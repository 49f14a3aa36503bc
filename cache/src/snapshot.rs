//! Record snapshots handed to adapters.
//!
//! A snapshot is an immutable copy of a record taken when a request is
//! issued, so an adapter sees the record as it was at that moment even if the
//! application keeps editing it while the request is in flight.

use crate::document::ResourceIdentifier;
use crate::record::Attributes;
use crate::{error::Result, Error, Handle, ModelName};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A point-in-time copy of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Record the snapshot was taken from
    pub handle: Handle,
    pub model: ModelName,
    /// `None` for records the backend has not assigned an id yet
    pub id: Option<String>,
    /// Current attribute values, declared defaults filled in
    pub attributes: Attributes,
    /// Attributes changed since the last acknowledged save
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_attributes: Vec<String>,
    /// To-one relationships whose value is known
    #[serde(default)]
    pub belongs_to: IndexMap<String, Option<ResourceIdentifier>>,
    /// To-many relationships whose value is known
    #[serde(default)]
    pub has_many: IndexMap<String, Vec<ResourceIdentifier>>,
}

impl Snapshot {
    pub fn new(handle: Handle, model: impl Into<ModelName>, id: Option<String>) -> Self {
        Self {
            handle,
            model: model.into(),
            id,
            attributes: Attributes::new(),
            changed_attributes: Vec::new(),
            belongs_to: IndexMap::new(),
            has_many: IndexMap::new(),
        }
    }

    /// Get an attribute value.
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Identifier of a to-one relationship. `None` when the relationship is
    /// unknown, `Some(None)` when it is known to be empty.
    pub fn belongs_to(&self, name: &str) -> Option<Option<&ResourceIdentifier>> {
        self.belongs_to.get(name).map(Option::as_ref)
    }

    /// Identifiers of a to-many relationship, if known.
    pub fn has_many(&self, name: &str) -> Option<&[ResourceIdentifier]> {
        self.has_many.get(name).map(Vec::as_slice)
    }

    pub fn identifier(&self) -> Option<ResourceIdentifier> {
        self.id
            .as_ref()
            .map(|id| ResourceIdentifier::new(self.model.clone(), id.clone()))
    }

    /// Resource object for a request body.
    pub fn to_resource(&self) -> Value {
        let mut resource = Map::new();
        resource.insert("type".into(), Value::String(self.model.clone()));
        if let Some(id) = &self.id {
            resource.insert("id".into(), Value::String(id.clone()));
        }
        if !self.attributes.is_empty() {
            resource.insert("attributes".into(), Value::Object(self.attributes.clone()));
        }

        let mut relationships = Map::new();
        for (name, value) in &self.belongs_to {
            relationships.insert(name.clone(), json!({ "data": value }));
        }
        for (name, values) in &self.has_many {
            relationships.insert(name.clone(), json!({ "data": values }));
        }
        if !relationships.is_empty() {
            resource.insert("relationships".into(), Value::Object(relationships));
        }
        Value::Object(resource)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}
