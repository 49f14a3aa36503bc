//! References: handles to a record or relationship that can be inspected
//! without loading anything.
//!
//! A reference is a plain value. Its accessors take the store explicitly.

use crate::relationship::{FieldKey, Relationship};
use crate::schema::RelationshipKind;
use crate::store::Store;
use crate::{error::Result, Error, Handle, ModelName};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the value behind a reference would be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteType {
    /// Through the relationship's related link
    Link,
    /// By the id of the related record
    Id,
    /// By the ids of the related records
    Ids,
    /// By the record's own type and id
    Identity,
}

/// Reference to a record by type and id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordReference {
    handle: Handle,
    model: ModelName,
    id: String,
}

impl RecordReference {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_type(&self) -> RemoteType {
        RemoteType::Identity
    }

    /// The record, if it is loaded.
    pub fn value(&self, store: &Store) -> Option<Handle> {
        store.peek_record(&self.model, &self.id)
    }

    /// Push a document for this record.
    pub fn push(&self, store: &mut Store, document: &Value) -> Result<Handle> {
        store.push(document)?.single().ok_or_else(|| {
            Error::InvalidDocument("expected a single resource for a record reference".into())
        })
    }
}

/// Reference to a to-one relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BelongsToReference {
    owner: Handle,
    name: String,
}

impl BelongsToReference {
    pub fn owner(&self) -> Handle {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn relationship<'a>(&self, store: &'a mut Store) -> Result<&'a Relationship> {
        store.relationship(self.owner, &self.name)
    }

    pub fn remote_type(&self, store: &mut Store) -> Result<RemoteType> {
        Ok(match self.relationship(store)?.link() {
            Some(_) => RemoteType::Link,
            None => RemoteType::Id,
        })
    }

    /// Id of the related record, if known.
    pub fn id(&self, store: &mut Store) -> Result<Option<String>> {
        let related = self.relationship(store)?.values().first().copied();
        Ok(related
            .and_then(|h| store.record(h).ok())
            .and_then(|record| record.id().map(String::from)))
    }

    /// The related record, if it is loaded.
    pub fn value(&self, store: &mut Store) -> Result<Option<Handle>> {
        let related = self.relationship(store)?.values().first().copied();
        Ok(related.filter(|h| is_loaded(store, *h)))
    }

    pub fn link(&self, store: &mut Store) -> Result<Option<String>> {
        Ok(self.relationship(store)?.link().map(String::from))
    }

    pub fn meta(&self, store: &mut Store) -> Result<Option<Value>> {
        Ok(self.relationship(store)?.payload_meta().cloned())
    }

    /// Push a document for the related record and make it the canonical
    /// value of the relationship.
    pub fn push(&self, store: &mut Store, document: &Value) -> Result<Handle> {
        let related = store.push(document)?.single().ok_or_else(|| {
            Error::InvalidDocument("expected a single resource for a belongsTo reference".into())
        })?;
        store.set_canonical_value(self.owner, &FieldKey::declared(self.name.clone()), &[related])?;
        Ok(related)
    }
}

/// Reference to a to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasManyReference {
    owner: Handle,
    name: String,
}

impl HasManyReference {
    pub fn owner(&self) -> Handle {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn relationship<'a>(&self, store: &'a mut Store) -> Result<&'a Relationship> {
        store.relationship(self.owner, &self.name)
    }

    pub fn remote_type(&self, store: &mut Store) -> Result<RemoteType> {
        Ok(match self.relationship(store)?.link() {
            Some(_) => RemoteType::Link,
            None => RemoteType::Ids,
        })
    }

    /// Ids of the related records that have one.
    pub fn ids(&self, store: &mut Store) -> Result<Vec<String>> {
        let members = self.relationship(store)?.values();
        Ok(members
            .into_iter()
            .filter_map(|h| store.record(h).ok())
            .filter_map(|record| record.id().map(String::from))
            .collect())
    }

    /// The related records, once the relationship has data and every member
    /// is loaded.
    pub fn value(&self, store: &mut Store) -> Result<Option<Vec<Handle>>> {
        let relationship = self.relationship(store)?;
        if !relationship.has_data() {
            return Ok(None);
        }
        let members = relationship.values();
        if members.iter().all(|h| is_loaded(store, *h)) {
            Ok(Some(members))
        } else {
            Ok(None)
        }
    }

    pub fn link(&self, store: &mut Store) -> Result<Option<String>> {
        Ok(self.relationship(store)?.link().map(String::from))
    }

    pub fn meta(&self, store: &mut Store) -> Result<Option<Value>> {
        Ok(self.relationship(store)?.payload_meta().cloned())
    }

    /// Push a document of related records and make them the canonical
    /// members of the relationship.
    pub fn push(&self, store: &mut Store, document: &Value) -> Result<Vec<Handle>> {
        let related = store.push(document)?.handles();
        store.compute_changes(self.owner, &FieldKey::declared(self.name.clone()), &related)?;
        Ok(related)
    }
}

fn is_loaded(store: &Store, handle: Handle) -> bool {
    store
        .record(handle)
        .is_ok_and(|record| record.flags().is_loaded && !record.is_hidden())
}

impl Store {
    /// Reference to a record, creating an empty one if the id is unknown.
    pub fn record_reference(&mut self, model: &str, id: &str) -> Result<RecordReference> {
        let handle = self.resolve(model, id)?;
        let id = self
            .record(handle)?
            .id()
            .map(String::from)
            .unwrap_or_else(|| id.to_string());
        Ok(RecordReference {
            handle,
            model: model.to_string(),
            id,
        })
    }

    pub fn belongs_to_reference(&self, handle: Handle, name: &str) -> Result<BelongsToReference> {
        self.check_kind(handle, name, RelationshipKind::BelongsTo)?;
        Ok(BelongsToReference {
            owner: handle,
            name: name.to_string(),
        })
    }

    pub fn has_many_reference(&self, handle: Handle, name: &str) -> Result<HasManyReference> {
        self.check_kind(handle, name, RelationshipKind::HasMany)?;
        Ok(HasManyReference {
            owner: handle,
            name: name.to_string(),
        })
    }

    pub(crate) fn check_kind(
        &self,
        handle: Handle,
        name: &str,
        kind: RelationshipKind,
    ) -> Result<()> {
        let model = self.record(handle)?.model_name();
        let meta = self.schema().relationship(model, name)?;
        if meta.kind != kind {
            return Err(Error::WrongRelationshipKind {
                name: name.to_string(),
                expected: match kind {
                    RelationshipKind::BelongsTo => "belongsTo",
                    RelationshipKind::HasMany => "hasMany",
                },
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ModelSchema, RelationshipDef};
    use crate::Schema;
    use serde_json::json;

    fn store() -> Store {
        let schema = Schema::new()
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
            .with_model(ModelSchema::new("user").attribute("name"));
        Store::new(schema).unwrap()
    }

    #[test]
    fn record_reference_before_and_after_load() {
        let mut store = store();
        let reference = store.record_reference("post", "1").unwrap();
        assert_eq!(reference.remote_type(), RemoteType::Identity);
        assert_eq!(reference.value(&store), None);

        let pushed = reference
            .push(&mut store, &json!({"data": {"type": "post", "id": "1"}}))
            .unwrap();
        assert_eq!(pushed, reference.handle());
        assert_eq!(reference.value(&store), Some(pushed));
    }

    #[test]
    fn belongs_to_id_without_loading() {
        let mut store = store();
        let post = store
            .push(&json!({"data": {"type": "post", "id": "1", "relationships": {
                "author": {"data": {"type": "user", "id": "9"}}
            }}}))
            .unwrap()
            .single()
            .unwrap();

        let author = store.belongs_to_reference(post, "author").unwrap();
        assert_eq!(author.remote_type(&mut store).unwrap(), RemoteType::Id);
        assert_eq!(author.id(&mut store).unwrap(), Some("9".to_string()));
        assert_eq!(author.value(&mut store).unwrap(), None);

        let user = author
            .push(&mut store, &json!({"data": {"type": "user", "id": "9"}}))
            .unwrap();
        assert_eq!(author.value(&mut store).unwrap(), Some(user));
    }

    #[test]
    fn has_many_link_and_meta() {
        let mut store = store();
        let post = store
            .push(&json!({"data": {"type": "post", "id": "1", "relationships": {
                "comments": {"links": {"related": "/posts/1/comments"}, "meta": {"count": 2}}
            }}}))
            .unwrap()
            .single()
            .unwrap();

        let comments = store.has_many_reference(post, "comments").unwrap();
        assert_eq!(comments.remote_type(&mut store).unwrap(), RemoteType::Link);
        assert_eq!(comments.link(&mut store).unwrap().as_deref(), Some("/posts/1/comments"));
        assert_eq!(comments.meta(&mut store).unwrap(), Some(json!({"count": 2})));
        assert_eq!(comments.value(&mut store).unwrap(), None);
    }

    #[test]
    fn has_many_push_sets_canonical_members() {
        let mut store = store();
        let post = store
            .push(&json!({"data": {"type": "post", "id": "1"}}))
            .unwrap()
            .single()
            .unwrap();
        let comments = store.has_many_reference(post, "comments").unwrap();

        let pushed = comments
            .push(
                &mut store,
                &json!({"data": [{"type": "comment", "id": "1"}, {"type": "comment", "id": "2"}]}),
            )
            .unwrap();
        store.flush();

        assert_eq!(comments.ids(&mut store).unwrap(), vec!["1", "2"]);
        assert_eq!(comments.value(&mut store).unwrap(), Some(pushed));
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let mut store = store();
        let post = store.resolve("post", "1").unwrap();
        let err = store.belongs_to_reference(post, "comments").unwrap_err();
        assert!(matches!(err, Error::WrongRelationshipKind { .. }));
    }
}
