//! Pushing server data into the store.

use super::Store;
use crate::document::{Document, PrimaryData, Resource};
use crate::relationship::FieldKey;
use crate::state::EventKind;
use crate::{error::Result, Error, Handle};
use serde_json::Value;

/// Records a push produced, shaped like the document's primary data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pushed {
    /// The document had no primary data, or `null`
    None,
    One(Handle),
    Many(Vec<Handle>),
}

impl Pushed {
    /// The handle of a single-resource push.
    pub fn single(&self) -> Option<Handle> {
        match self {
            Pushed::One(handle) => Some(*handle),
            _ => None,
        }
    }

    /// Every pushed handle in document order.
    pub fn handles(&self) -> Vec<Handle> {
        match self {
            Pushed::None => Vec::new(),
            Pushed::One(handle) => vec![*handle],
            Pushed::Many(handles) => handles.clone(),
        }
    }
}

impl Store {
    /// Validate and push a raw document.
    ///
    /// A document that fails validation, or would push data into a record
    /// that cannot accept it, touches no state.
    pub fn push(&mut self, value: &Value) -> Result<Pushed> {
        let document = Document::from_value(value, &self.schema)?;
        self.push_document(&document)
    }

    /// Push a payload whose primary data is optional, such as a response
    /// that only side-loads `included` resources.
    pub fn push_payload(&mut self, value: &Value) -> Result<()> {
        let mut value = value.clone();
        if let Some(object) = value.as_object_mut() {
            object.entry("data").or_insert(Value::Null);
        }
        let document = Document::from_value(&value, &self.schema)?;
        self.push_document(&document).map(|_| ())
    }

    /// Push an already validated document.
    pub fn push_document(&mut self, document: &Document) -> Result<Pushed> {
        if !document.errors.is_empty() {
            return Err(Error::InvalidDocument(
                "cannot push a document carrying errors".into(),
            ));
        }
        self.check_pushable(document)?;

        for resource in &document.included {
            self.push_resource(resource)?;
        }
        let pushed = match &document.data {
            None | Some(PrimaryData::Empty) => Pushed::None,
            Some(PrimaryData::One(resource)) => Pushed::One(self.push_resource(resource)?),
            Some(PrimaryData::Many(resources)) => Pushed::Many(
                resources
                    .iter()
                    .map(|resource| self.push_resource(resource))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };

        // relationships go last so every pushed record already exists
        for resource in document.resources() {
            self.setup_relationships(resource)?;
        }

        tracing::debug!(
            primary = pushed.handles().len(),
            included = document.included.len(),
            "document pushed"
        );
        Ok(pushed)
    }

    /// Every existing record the document touches must accept new data.
    fn check_pushable(&self, document: &Document) -> Result<()> {
        for resource in document.resources() {
            if let Some(handle) = self.identity.lookup(&resource.model, &resource.id) {
                self.ensure_handles(handle, EventKind::PushedData)?;
            }
        }
        Ok(())
    }

    pub(crate) fn push_resource(&mut self, resource: &Resource) -> Result<Handle> {
        let handle = self.identity.resolve(&resource.model, &resource.id);
        let record = self.identity.get_mut(handle)?;
        let reloaded = std::mem::replace(&mut record.unloaded, false);
        let changed = record.setup_data(&resource.attributes);
        if !changed.is_empty() {
            tracing::trace!(record = %record.label(), changed = ?changed, "attributes pushed");
        }
        self.send(handle, EventKind::PushedData, None)?;
        self.run_loop.record_changed(handle);

        // relationships that kept the canonical edge get the record back
        if reloaded {
            for (owner, key) in self.canonical_holders(handle) {
                self.flush_canonical_later(owner, &key);
            }
        }
        Ok(handle)
    }

    /// Queue relationship payloads and update relationships that already
    /// exist on either side.
    pub(crate) fn setup_relationships(&mut self, resource: &Resource) -> Result<()> {
        if resource.relationships.is_empty() {
            return Ok(());
        }
        let Some(handle) = self.identity.lookup(&resource.model, &resource.id) else {
            return Ok(());
        };

        let mut affected = Vec::new();
        for (name, payload) in &resource.relationships {
            let Ok(meta) = self.schema.relationship(&resource.model, name) else {
                continue;
            };
            let key = FieldKey::declared(name.clone());
            let inverse_key = FieldKey::inverse_of(meta);

            let materialized = self.has_relationship(handle, &key);
            let inverse_materialized = payload.data.as_ref().is_some_and(|data| {
                data.identifiers().into_iter().any(|identifier| {
                    self.identity
                        .lookup(&identifier.model, &identifier.id)
                        .is_some_and(|related| self.has_relationship(related, &inverse_key))
                })
            });
            let holders: Vec<Handle> = self
                .canonical_holders(handle)
                .into_iter()
                .filter(|(_, key)| *key == inverse_key)
                .map(|(owner, _)| owner)
                .collect();

            // Build from the previous payload so the push can withdraw the
            // edges it replaces from inverses that already exist.
            if !materialized && !holders.is_empty() {
                self.ensure_relationship(handle, &key)?;
                for &holder in &holders {
                    self.add_canonical(handle, &key, holder, None)?;
                }
            }
            if materialized || inverse_materialized || !holders.is_empty() {
                affected.push((key, payload));
            }
        }

        self.payloads
            .push(&self.schema, &resource.identifier(), &resource.relationships);

        for (key, payload) in affected {
            self.ensure_relationship(handle, &key)?;
            self.push_relationship_payload(handle, &key, payload, false)?;
        }
        Ok(())
    }
}
