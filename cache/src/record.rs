//! Internal model: the per-record state owned by the cache.

use crate::document::ValidationErrors;
use crate::relationship::{FieldKey, Relationship};
use crate::state::{StateFlags, StateId};
use crate::{Handle, ModelName};
use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Attribute buffer keyed by attribute name.
pub type Attributes = Map<String, Value>;

/// One record in the cache.
///
/// Reads resolve local edits first, then the in-flight snapshot, then the
/// last canonical (server-acknowledged) values.
#[derive(Debug)]
pub struct InternalModel {
    handle: Handle,
    model: ModelName,
    id: Option<String>,
    pub(crate) canonical: Attributes,
    pub(crate) local: Attributes,
    pub(crate) in_flight: Option<Attributes>,
    pub(crate) state: StateId,
    pub(crate) is_error: bool,
    pub(crate) is_reloading: bool,
    /// Unloaded by the application; kept only while still referenced
    pub(crate) unloaded: bool,
    pub(crate) errors: ValidationErrors,
    pub(crate) relationships: IndexMap<FieldKey, Relationship>,
}

impl InternalModel {
    pub(crate) fn new(handle: Handle, model: ModelName, id: Option<String>) -> Self {
        Self {
            handle,
            model,
            id,
            canonical: Attributes::new(),
            local: Attributes::new(),
            in_flight: None,
            state: StateId::Empty,
            is_error: false,
            is_reloading: false,
            unloaded: false,
            errors: ValidationErrors::default(),
            relationships: IndexMap::new(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub(crate) fn assign_id(&mut self, id: String) {
        self.id = Some(id);
    }

    pub fn state(&self) -> StateId {
        self.state
    }

    pub fn flags(&self) -> StateFlags {
        self.state.flags()
    }

    pub fn is_new(&self) -> bool {
        self.state.flags().is_new
    }

    pub fn is_empty(&self) -> bool {
        self.state.flags().is_empty
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn errors(&self) -> &ValidationErrors {
        &self.errors
    }

    /// Hidden records never appear in record arrays.
    pub fn is_hidden(&self) -> bool {
        self.unloaded
            || matches!(
                self.state,
                StateId::Empty | StateId::Loading | StateId::DeletedSaved
            )
    }

    /// Human-readable `type:id` label used in errors and logs.
    pub fn label(&self) -> String {
        match &self.id {
            Some(id) => format!("{}:{}", self.model, id),
            None => format!("{}:{}", self.model, self.handle),
        }
    }

    /// Current value of an attribute.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.local
            .get(name)
            .or_else(|| self.in_flight.as_ref().and_then(|f| f.get(name)))
            .or_else(|| self.canonical.get(name))
    }

    /// Value an attribute would have without uncommitted local edits.
    pub(crate) fn original_value(&self, name: &str) -> Option<&Value> {
        self.in_flight
            .as_ref()
            .and_then(|f| f.get(name))
            .or_else(|| self.canonical.get(name))
    }

    /// Merged view of all attribute buffers.
    pub fn attributes(&self) -> Attributes {
        let mut merged = self.canonical.clone();
        if let Some(in_flight) = &self.in_flight {
            merged.extend(in_flight.clone());
        }
        merged.extend(self.local.clone());
        merged
    }

    pub fn canonical_attributes(&self) -> &Attributes {
        &self.canonical
    }

    pub fn local_attributes(&self) -> &Attributes {
        &self.local
    }

    pub fn in_flight_attributes(&self) -> Option<&Attributes> {
        self.in_flight.as_ref()
    }

    pub fn has_changed_attributes(&self) -> bool {
        !self.local.is_empty() || self.in_flight.as_ref().is_some_and(|f| !f.is_empty())
    }

    /// Attributes whose current value differs from canonical, as
    /// `name -> (canonical, current)`.
    pub fn changed_attributes(&self) -> IndexMap<String, (Option<Value>, Value)> {
        let mut changes = IndexMap::new();
        let pending = self
            .in_flight
            .iter()
            .flat_map(|f| f.iter())
            .chain(self.local.iter());
        for (name, _) in pending {
            if let Some(current) = self.attribute(name) {
                changes.insert(
                    name.clone(),
                    (self.canonical.get(name).cloned(), current.clone()),
                );
            }
        }
        changes
    }

    /// Merge server data into canonical state, returning changed keys.
    pub(crate) fn setup_data(&mut self, attributes: &Attributes) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, value) in attributes {
            if self.canonical.get(name) != Some(value) {
                changed.push(name.clone());
                self.canonical.insert(name.clone(), value.clone());
            }
        }
        changed
    }

    /// Drop local edits that now match canonical state.
    pub(crate) fn update_changed_attributes(&mut self) {
        let canonical = &self.canonical;
        self.local
            .retain(|name, value| canonical.get(name) != Some(value));
    }

    /// Freeze local edits into the in-flight snapshot.
    pub(crate) fn freeze_in_flight(&mut self) {
        let local = std::mem::take(&mut self.local);
        match &mut self.in_flight {
            Some(in_flight) => in_flight.extend(local),
            None => self.in_flight = Some(local),
        }
    }

    /// Commit acknowledged: in-flight and server values become canonical.
    pub(crate) fn adopt_in_flight(&mut self, server: Option<&Attributes>) -> Vec<String> {
        let mut changed = Vec::new();
        if let Some(in_flight) = self.in_flight.take() {
            for (name, value) in in_flight {
                if self.canonical.get(&name) != Some(&value) {
                    changed.push(name.clone());
                }
                self.canonical.insert(name, value);
            }
        }
        if let Some(server) = server {
            for name in self.setup_data(server) {
                if !changed.contains(&name) {
                    changed.push(name);
                }
            }
        }
        self.update_changed_attributes();
        changed
    }

    /// Save rejected: in-flight values go back to local unless edited since.
    pub(crate) fn save_was_rejected(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            for (name, value) in in_flight {
                self.local.entry(name).or_insert(value);
            }
        }
    }

    /// Clear all data buffers, leaving identity and relationships intact.
    pub(crate) fn clear_data(&mut self) {
        self.canonical.clear();
        self.local.clear();
        self.in_flight = None;
        self.errors.clear();
        self.is_error = false;
    }

    pub fn relationship(&self, key: &FieldKey) -> Option<&Relationship> {
        self.relationships.get(key)
    }

    /// Handles reachable through any materialized relationship, local or
    /// canonical.
    pub(crate) fn linked_handles(&self) -> Vec<Handle> {
        let mut linked = Vec::new();
        for relationship in self.relationships.values() {
            for handle in relationship.members().iter().chain(relationship.canonical_members()) {
                if !linked.contains(handle) {
                    linked.push(*handle);
                }
            }
        }
        linked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model() -> InternalModel {
        let mut model = InternalModel::new(Handle(1), "post".into(), Some("1".into()));
        let data = json!({"title": "A", "body": "text"});
        model.setup_data(data.as_object().unwrap());
        model
    }

    #[test]
    fn local_overrides_canonical() {
        let mut model = model();
        model.local.insert("title".into(), json!("B"));
        assert_eq!(model.attribute("title"), Some(&json!("B")));
        assert_eq!(model.original_value("title"), Some(&json!("A")));
        assert_eq!(model.attributes()["body"], json!("text"));
    }

    #[test]
    fn in_flight_snapshot_round_trip() {
        let mut model = model();
        model.local.insert("title".into(), json!("B"));
        model.freeze_in_flight();
        assert!(model.local.is_empty());
        assert_eq!(model.attribute("title"), Some(&json!("B")));

        // edit made during save
        model.local.insert("body".into(), json!("edited"));

        let changed = model.adopt_in_flight(None);
        assert_eq!(changed, vec!["title".to_string()]);
        assert_eq!(model.canonical["title"], json!("B"));
        assert_eq!(model.local["body"], json!("edited"));
        assert!(model.in_flight.is_none());
    }

    #[test]
    fn rejected_save_restores_edits() {
        let mut model = model();
        model.local.insert("title".into(), json!("B"));
        model.freeze_in_flight();
        model.local.insert("title".into(), json!("C"));
        model.save_was_rejected();
        // the newer edit wins over the in-flight value
        assert_eq!(model.local["title"], json!("C"));
        assert!(model.in_flight.is_none());
    }

    #[test]
    fn update_changed_attributes_drops_matches() {
        let mut model = model();
        model.local.insert("title".into(), json!("B"));
        model.setup_data(json!({"title": "B"}).as_object().unwrap());
        model.update_changed_attributes();
        assert!(!model.has_changed_attributes());
    }

    #[test]
    fn changed_attributes_reports_pairs() {
        let mut model = model();
        model.local.insert("title".into(), json!("B"));
        let changes = model.changed_attributes();
        assert_eq!(changes["title"], (Some(json!("A")), json!("B")));
    }

    #[test]
    fn label_uses_handle_without_id() {
        let model = InternalModel::new(Handle(7), "post".into(), None);
        assert_eq!(model.label(), "post:#7");
        assert!(model.is_hidden());
    }
}
