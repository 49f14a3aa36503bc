//! Save pipeline and fetch bookkeeping.

use super::Store;
use crate::adapter::AdapterError;
use crate::document::{Document, ErrorObject, PrimaryData, Resource, ValidationErrors};
use crate::operation::{PendingSave, SaveOperation};
use crate::relationship::FieldKey;
use crate::snapshot::Snapshot;
use crate::state::{EventKind, StateId};
use crate::{error::Result, Error, Handle};

/// How a commit ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Acknowledged, with the normalized response if the adapter returned one
    Saved(Option<Document>),
    /// Rejected with per-field errors
    Invalid(Vec<ErrorObject>),
    /// Any other adapter failure
    Failed(AdapterError),
}

impl Store {
    /// Copy a record for an adapter call, materializing its declared
    /// relationships.
    pub fn snapshot(&mut self, handle: Handle) -> Result<Snapshot> {
        let record = self.identity.get(handle)?;
        let model = record.model_name().to_string();
        let names: Vec<String> = self
            .schema
            .relationships(&model)
            .map(|meta| meta.name.clone())
            .collect();
        for name in &names {
            self.ensure_relationship(handle, &FieldKey::declared(name.clone()))?;
        }

        let record = self.identity.get(handle)?;
        let mut snapshot = Snapshot::new(handle, model.clone(), record.id().map(String::from));
        snapshot.attributes = record.attributes();
        for def in self.schema.attributes(&model) {
            let Some(default) = &def.default else {
                continue;
            };
            if !snapshot.attributes.contains_key(&def.name) {
                snapshot.attributes.insert(def.name.clone(), default.clone());
            }
        }
        snapshot.changed_attributes = record.changed_attributes().into_keys().collect();

        for relationship in record.relationships.values() {
            let FieldKey::Declared(name) = relationship.key() else {
                continue;
            };
            if !relationship.has_data() {
                continue;
            }
            let identifiers: Vec<_> = relationship
                .values()
                .into_iter()
                .filter_map(|related| self.identity.get(related).ok())
                .filter_map(|related| {
                    related.id().map(|id| {
                        crate::document::ResourceIdentifier::new(related.model_name(), id)
                    })
                })
                .collect();
            if relationship.is_many() {
                snapshot.has_many.insert(name.clone(), identifiers);
            } else {
                snapshot
                    .belongs_to
                    .insert(name.clone(), identifiers.into_iter().next());
            }
        }
        Ok(snapshot)
    }

    /// Start a commit: snapshot the record, freeze local edits into the
    /// in-flight buffer and move to an in-flight state.
    pub fn will_commit(&mut self, handle: Handle) -> Result<Snapshot> {
        self.ensure_handles(handle, EventKind::WillCommit)?;
        let snapshot = self.snapshot(handle)?;
        self.identity.get_mut(handle)?.freeze_in_flight();
        self.send(handle, EventKind::WillCommit, None)?;
        Ok(snapshot)
    }

    /// Adapter call for a started commit, chosen from the record's current
    /// flags. `None` when there is nothing to persist.
    pub fn commit_operation(&self, handle: Handle) -> Result<Option<SaveOperation>> {
        let record = self.identity.get(handle)?;
        if record.state() == StateId::DeletedSaved {
            return Ok(None);
        }
        Ok(Some(SaveOperation::for_flags(&record.flags())))
    }

    /// [`will_commit`](Self::will_commit) paired with its operation.
    pub fn prepare_save(&mut self, handle: Handle) -> Result<Option<PendingSave>> {
        let snapshot = self.will_commit(handle)?;
        let pending = self
            .commit_operation(handle)?
            .map(|operation| PendingSave {
                operation,
                snapshot,
            });
        Ok(pending)
    }

    /// Apply the result of a commit.
    pub fn complete_save(&mut self, handle: Handle, outcome: SaveOutcome) -> Result<()> {
        match outcome {
            SaveOutcome::Saved(document) => self.did_save_record(handle, document.as_ref()),
            SaveOutcome::Invalid(errors) => self.record_was_invalid(handle, &errors),
            SaveOutcome::Failed(error) => self.record_was_error(handle, &error),
        }
    }

    /// The adapter acknowledged a commit. Server attributes and
    /// relationships in the response become canonical.
    pub fn did_save_record(&mut self, handle: Handle, document: Option<&Document>) -> Result<()> {
        let resource: Option<&Resource> = match document.and_then(|d| d.data.as_ref()) {
            Some(PrimaryData::One(resource)) => Some(resource.as_ref()),
            Some(PrimaryData::Many(_)) => {
                return Err(Error::InvalidDocument(
                    "a save response must contain a single resource".into(),
                ))
            }
            _ => None,
        };

        let record = self.identity.get(handle)?;
        if resource.is_none() && record.id().is_none() {
            return Err(Error::MissingId {
                model: record.model_name().to_string(),
            });
        }
        self.ensure_handles(handle, EventKind::DidCommit)?;

        if let Some(document) = document {
            self.push_included(document)?;
        }
        if let Some(resource) = resource {
            self.identity.set_id(handle, &resource.id)?;
            self.setup_relationships(resource)?;
        }

        let record = self.identity.get_mut(handle)?;
        let changed = record.adopt_in_flight(resource.map(|r| &r.attributes));
        record.is_error = false;
        tracing::debug!(record = %record.label(), changed = changed.len(), "commit acknowledged");
        self.send(handle, EventKind::DidCommit, None)?;
        self.run_loop.record_changed(handle);
        Ok(())
    }

    fn push_included(&mut self, document: &Document) -> Result<()> {
        for resource in &document.included {
            if let Some(existing) = self.identity.lookup(&resource.model, &resource.id) {
                self.ensure_handles(existing, EventKind::PushedData)?;
            }
        }
        for resource in &document.included {
            self.push_resource(resource)?;
        }
        for resource in &document.included {
            self.setup_relationships(resource)?;
        }
        Ok(())
    }

    /// The adapter rejected a commit with validation errors. Edits stay
    /// pending so the application can correct them.
    pub fn record_was_invalid(&mut self, handle: Handle, errors: &[ErrorObject]) -> Result<()> {
        self.ensure_handles(handle, EventKind::BecameInvalid)?;
        let record = self.identity.get_mut(handle)?;
        let reported = ValidationErrors::from_error_objects(errors);
        for field in reported.fields() {
            for message in reported.get(field) {
                record.errors.add(field, message.clone());
            }
        }
        tracing::debug!(
            record = %record.label(),
            errors = errors.len(),
            "commit rejected as invalid"
        );
        self.send(handle, EventKind::BecameInvalid, None)?;
        self.identity.get_mut(handle)?.save_was_rejected();
        self.run_loop.record_changed(handle);
        Ok(())
    }

    /// A commit failed for a reason other than validation. In-flight edits
    /// go back to local so nothing is lost.
    pub fn record_was_error(&mut self, handle: Handle, error: &AdapterError) -> Result<()> {
        self.ensure_handles(handle, EventKind::BecameError)?;
        let label = self.identity.get(handle)?.label();
        tracing::warn!(record = %label, error = %error, "commit failed");
        self.send(handle, EventKind::BecameError, None)?;
        let record = self.identity.get_mut(handle)?;
        record.is_error = true;
        record.save_was_rejected();
        self.run_loop.record_changed(handle);
        Ok(())
    }

    // ==================== Fetch bookkeeping ====================

    /// A first load is starting.
    pub(crate) fn start_loading(&mut self, handle: Handle) -> Result<()> {
        if self.identity.get(handle)?.state() == StateId::Empty {
            self.send(handle, EventKind::LoadingData, None)?;
        }
        Ok(())
    }

    /// A reload of a loaded record is starting.
    pub(crate) fn start_reloading(&mut self, handle: Handle) -> Result<()> {
        let record = self.identity.get_mut(handle)?;
        record.is_reloading = true;
        if record.state().handler(EventKind::ReloadRecord).is_some() {
            self.send(handle, EventKind::ReloadRecord, None)?;
        }
        self.run_loop.record_changed(handle);
        Ok(())
    }

    pub(crate) fn finish_reloading(&mut self, handle: Handle) {
        if let Ok(record) = self.identity.get_mut(handle) {
            if record.is_reloading {
                record.is_reloading = false;
                self.run_loop.record_changed(handle);
            }
        }
    }

    /// The adapter reported that a record does not exist.
    pub fn record_not_found(&mut self, handle: Handle) -> Result<()> {
        self.record_fetch_failed(handle, &AdapterError::NotFound)
    }

    /// A fetch for a record failed. A record that was loading for the first
    /// time goes back to empty and is unloaded.
    pub fn record_fetch_failed(&mut self, handle: Handle, error: &AdapterError) -> Result<()> {
        let state = self.identity.get(handle)?.state();
        if state == StateId::Loading {
            if !matches!(error, AdapterError::NotFound) {
                self.send(handle, EventKind::BecameError, None)?;
            }
            self.send(handle, EventKind::NotFound, None)?;
            self.unload_record(handle)?;
        } else {
            if matches!(error, AdapterError::NotFound)
                && state.handler(EventKind::NotFound).is_some()
            {
                self.send(handle, EventKind::NotFound, None)?;
            }
            self.finish_reloading(handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ModelSchema, RelationshipDef};
    use crate::state::Lifecycle;
    use crate::Schema;
    use serde_json::json;

    fn store() -> Store {
        let schema = Schema::new()
            .with_model(
                ModelSchema::new("post")
                    .attribute("title")
                    .attribute_with_default("status", json!("draft"))
                    .relationship(RelationshipDef::has_many("comments", "comment")),
            )
            .with_model(
                ModelSchema::new("comment")
                    .attribute("body")
                    .relationship(RelationshipDef::belongs_to("post", "post")),
            );
        Store::new(schema).unwrap()
    }

    fn document(store: &Store, value: serde_json::Value) -> Document {
        Document::from_value(&value, store.schema()).unwrap()
    }

    #[test]
    fn create_commit_assigns_id() {
        let mut store = store();
        let post = store.create_record("post", None, Default::default()).unwrap();
        store.set_attribute(post, "title", json!("Draft")).unwrap();

        let pending = store.prepare_save(post).unwrap().unwrap();
        assert_eq!(pending.operation, SaveOperation::CreateRecord);
        assert_eq!(pending.snapshot.attr("status"), Some(&json!("draft")));
        assert_eq!(store.record(post).unwrap().state(), StateId::CreatedInFlight);

        let response = document(
            &store,
            json!({"data": {"type": "post", "id": "10", "attributes": {"title": "Draft"}}}),
        );
        store.complete_save(post, SaveOutcome::Saved(Some(response))).unwrap();

        assert_eq!(store.record(post).unwrap().state(), StateId::LoadedSaved);
        assert_eq!(store.peek_record("post", "10"), Some(post));
        let report = store.flush();
        assert_eq!(
            report.events_for(post),
            vec![Lifecycle::Ready, Lifecycle::DidCreate, Lifecycle::DidCommit]
        );
    }

    #[test]
    fn create_without_any_id_fails() {
        let mut store = store();
        let post = store.create_record("post", None, Default::default()).unwrap();
        store.will_commit(post).unwrap();
        let err = store.did_save_record(post, None).unwrap_err();
        assert!(matches!(err, Error::MissingId { .. }));
    }

    #[test]
    fn edits_during_flight_survive_ack() {
        let mut store = store();
        let post = store
            .push(&json!({"data": {"type": "post", "id": "1", "attributes": {"title": "A"}}}))
            .unwrap()
            .single()
            .unwrap();
        store.set_attribute(post, "title", json!("B")).unwrap();
        store.will_commit(post).unwrap();
        store.set_attribute(post, "title", json!("C")).unwrap();

        store.did_save_record(post, None).unwrap();
        let record = store.record(post).unwrap();
        assert_eq!(record.canonical_attributes()["title"], json!("B"));
        assert_eq!(record.attribute("title"), Some(&json!("C")));
        assert_eq!(record.state(), StateId::UpdatedUncommitted);
    }

    #[test]
    fn invalid_save_keeps_edits_and_errors() {
        let mut store = store();
        let post = store
            .push(&json!({"data": {"type": "post", "id": "1", "attributes": {"title": "A"}}}))
            .unwrap()
            .single()
            .unwrap();
        store.flush();
        store.set_attribute(post, "title", json!("")).unwrap();
        store.will_commit(post).unwrap();
        store
            .record_was_invalid(post, &[ErrorObject::for_attribute("title", "can't be blank")])
            .unwrap();

        assert_eq!(store.record(post).unwrap().state(), StateId::UpdatedInvalid);
        assert_eq!(store.errors(post).unwrap().get("title"), &["can't be blank".to_string()]);
        assert_eq!(store.attribute(post, "title").unwrap(), Some(json!("")));

        // fixing the attribute clears its error and makes the record valid
        store.set_attribute(post, "title", json!("Fixed")).unwrap();
        assert!(store.errors(post).unwrap().is_empty());
        assert_eq!(store.record(post).unwrap().state(), StateId::UpdatedUncommitted);
        let report = store.flush();
        assert_eq!(report.events_for(post), vec![Lifecycle::BecameInvalid]);
    }

    #[test]
    fn transport_error_restores_in_flight_edits() {
        let mut store = store();
        let post = store
            .push(&json!({"data": {"type": "post", "id": "1", "attributes": {"title": "A"}}}))
            .unwrap()
            .single()
            .unwrap();
        store.set_attribute(post, "title", json!("B")).unwrap();
        store.will_commit(post).unwrap();
        store
            .record_was_error(post, &AdapterError::Transport("offline".into()))
            .unwrap();

        let flags = store.flags(post).unwrap();
        assert!(flags.is_error);
        assert_eq!(store.record(post).unwrap().state(), StateId::UpdatedUncommitted);
        assert_eq!(store.record(post).unwrap().local_attributes()["title"], json!("B"));
        assert!(store.record(post).unwrap().in_flight_attributes().is_none());
    }

    #[test]
    fn delete_commit() {
        let mut store = store();
        let post = store
            .push(&json!({"data": {"type": "post", "id": "1"}}))
            .unwrap()
            .single()
            .unwrap();
        store.flush();
        store.delete_record(post).unwrap();
        let pending = store.prepare_save(post).unwrap().unwrap();
        assert_eq!(pending.operation, SaveOperation::DeleteRecord);

        store.did_save_record(post, None).unwrap();
        assert_eq!(store.record(post).unwrap().state(), StateId::DeletedSaved);
        let report = store.flush();
        assert_eq!(
            report.events_for(post),
            vec![Lifecycle::DidDelete, Lifecycle::DidCommit]
        );
    }

    #[test]
    fn deleted_new_record_needs_no_request() {
        let mut store = store();
        let post = store.create_record("post", None, Default::default()).unwrap();
        store.delete_record(post).unwrap();
        assert!(store.prepare_save(post).unwrap().is_none());
    }

    #[test]
    fn snapshot_includes_known_relationships() {
        let mut store = store();
        let comment = store
            .push(&json!({"data": {"type": "comment", "id": "5", "relationships": {
                "post": {"data": {"type": "post", "id": "1"}}
            }}}))
            .unwrap()
            .single()
            .unwrap();
        let snapshot = store.snapshot(comment).unwrap();
        assert_eq!(
            snapshot.belongs_to("post"),
            Some(Some(&crate::document::ResourceIdentifier::new("post", "1")))
        );
    }

    #[test]
    fn failed_first_load_returns_to_empty() {
        let mut store = store();
        let post = store.resolve("post", "404").unwrap();
        store.start_loading(post).unwrap();
        assert!(store.flags(post).unwrap().state.is_loading);

        store.record_fetch_failed(post, &AdapterError::NotFound).unwrap();
        assert!(store.record(post).unwrap().is_empty());
        let report = store.flush();
        assert_eq!(report.destroyed, vec![post]);
        assert!(store.identity().lookup("post", "404").is_none());
    }
}
