//! Relationship graph maintenance.
//!
//! Local edits are mirrored on the inverse side immediately. Canonical edits
//! only touch inverses that are already materialized (the payload cache
//! covers the rest) and schedule a canonical flush for the end of the tick.

use super::Store;
use crate::document::{Linkage, RelationshipPayload, ResourceIdentifier};
use crate::identity::IdentityMap;
use crate::relationship::{FieldKey, Relationship};
use crate::runloop::RelationshipChange;
use crate::schema::{RelationshipKind, RelationshipMeta};
use crate::{error::Result, Error, Handle};
use std::collections::HashSet;

fn relationship_in<'a>(
    identity: &'a mut IdentityMap,
    owner: Handle,
    key: &FieldKey,
) -> Result<&'a mut Relationship> {
    let record = identity.get_mut(owner)?;
    let model = record.model_name().to_string();
    record
        .relationships
        .get_mut(key)
        .ok_or_else(|| Error::UnknownRelationship {
            model,
            name: key.to_string(),
        })
}

impl Store {
    pub(crate) fn has_relationship(&self, owner: Handle, key: &FieldKey) -> bool {
        self.identity
            .get(owner)
            .is_ok_and(|record| record.relationships.contains_key(key))
    }

    fn relationship_ref(&self, owner: Handle, key: &FieldKey) -> Result<&Relationship> {
        let record = self.identity.get(owner)?;
        record
            .relationships
            .get(key)
            .ok_or_else(|| Error::UnknownRelationship {
                model: record.model_name().to_string(),
                name: key.to_string(),
            })
    }

    /// Materialize a relationship, seeding it from the payload cache.
    pub(crate) fn ensure_relationship(&mut self, owner: Handle, key: &FieldKey) -> Result<()> {
        let record = self.identity.get(owner)?;
        if record.relationships.contains_key(key) {
            return Ok(());
        }
        let meta = match key {
            FieldKey::Declared(name) => {
                self.schema.relationship(record.model_name(), name)?.clone()
            }
            FieldKey::Implicit { owner_type, field } => {
                RelationshipMeta::implicit(owner_type, field)
            }
        };
        let identifier = record
            .id()
            .map(|id| ResourceIdentifier::new(record.model_name(), id));

        self.identity
            .get_mut(owner)?
            .relationships
            .insert(key.clone(), Relationship::new(owner, key.clone(), meta));

        if let (FieldKey::Declared(name), Some(identifier)) = (key, identifier) {
            if let Some(payload) = self.payloads.get(&self.schema, &identifier, name) {
                self.push_relationship_payload(owner, key, &payload, true)?;
            }
        }
        Ok(())
    }

    fn resolve_linkage(&mut self, data: &Linkage) -> Vec<Handle> {
        data.identifiers()
            .into_iter()
            .map(|identifier| self.identity.resolve(&identifier.model, &identifier.id))
            .collect()
    }

    /// Apply a `{data, links, meta}` payload to a materialized relationship.
    pub(crate) fn push_relationship_payload(
        &mut self,
        owner: Handle,
        key: &FieldKey,
        payload: &RelationshipPayload,
        initial: bool,
    ) -> Result<()> {
        let relationship = relationship_in(&mut self.identity, owner, key)?;
        if let Some(meta) = &payload.meta {
            relationship.payload_meta = Some(meta.clone());
        }
        let is_many = relationship.meta().kind.is_many();

        let has_data = payload.data.is_some();
        if let Some(data) = &payload.data {
            let handles = self.resolve_linkage(data);
            match (initial, is_many) {
                (true, _) => self.set_initial_members(owner, key, &handles)?,
                (false, true) => self.compute_changes(owner, key, &handles)?,
                (false, false) => {
                    self.set_canonical_belongs_to(owner, key, handles.first().copied())?
                }
            }
        }

        let mut has_link = false;
        if let Some(link) = payload.related_link() {
            let label = self.identity.get(owner)?.label();
            let relationship = relationship_in(&mut self.identity, owner, key)?;
            if relationship.link() != Some(link) {
                has_link = true;
                if !relationship.meta().is_async && !relationship.has_data {
                    tracing::warn!(
                        record = %label,
                        relationship = %key,
                        "link pushed for a sync relationship without data; \
                         the payload is likely missing data"
                    );
                }
                relationship.link = Some(link.to_string());
            }
        }

        let relationship = relationship_in(&mut self.identity, owner, key)?;
        if has_data {
            relationship.has_data = true;
            relationship.has_loaded = true;
        } else if has_link {
            relationship.has_loaded = false;
        }
        Ok(())
    }

    fn set_initial_members(
        &mut self,
        owner: Handle,
        key: &FieldKey,
        handles: &[Handle],
    ) -> Result<()> {
        let relationship = relationship_in(&mut self.identity, owner, key)?;
        let inverse_key = relationship.inverse_key();
        let added = relationship.set_initial(handles);
        for related in added {
            self.note_holder(related, owner, key);
            if inverse_key.is_implicit() || self.has_relationship(related, &inverse_key) {
                self.add_canonical(related, &inverse_key, owner, None)?;
            }
        }
        Ok(())
    }

    fn set_canonical_belongs_to(
        &mut self,
        owner: Handle,
        key: &FieldKey,
        related: Option<Handle>,
    ) -> Result<()> {
        match related {
            Some(related) => self.add_canonical(owner, key, related, None)?,
            None => {
                let current = self
                    .relationship_ref(owner, key)?
                    .belongs_to()
                    .and_then(|state| state.canonical_state());
                if let Some(current) = current {
                    self.remove_canonical(owner, key, current)?;
                }
            }
        }
        self.flush_canonical_later(owner, key);
        Ok(())
    }

    /// Replace canonical to-many membership with server-provided order.
    pub(crate) fn compute_changes(
        &mut self,
        owner: Handle,
        key: &FieldKey,
        handles: &[Handle],
    ) -> Result<()> {
        self.ensure_relationship(owner, key)?;
        let keep: HashSet<Handle> = handles.iter().copied().collect();
        let stale: Vec<Handle> = self
            .relationship_ref(owner, key)?
            .canonical_members()
            .iter()
            .copied()
            .filter(|h| !keep.contains(h))
            .collect();
        for handle in stale {
            self.remove_canonical(owner, key, handle)?;
        }
        for (index, handle) in handles.iter().enumerate() {
            self.add_canonical(owner, key, *handle, Some(index))?;
        }
        if let Some(many) = relationship_in(&mut self.identity, owner, key)?.many_mut() {
            many.adopt_order(handles);
        }
        relationship_in(&mut self.identity, owner, key)?.has_data = true;
        self.flush_canonical_later(owner, key);
        Ok(())
    }

    /// Apply a fetched or pushed to-one value as canonical.
    pub(crate) fn set_canonical_value(
        &mut self,
        owner: Handle,
        key: &FieldKey,
        handles: &[Handle],
    ) -> Result<()> {
        self.ensure_relationship(owner, key)?;
        if self.relationship_ref(owner, key)?.is_many() {
            self.compute_changes(owner, key, handles)
        } else {
            self.set_canonical_belongs_to(owner, key, handles.first().copied())?;
            relationship_in(&mut self.identity, owner, key)?.has_data = true;
            Ok(())
        }
    }

    /// Records fetched through a related link become the canonical value.
    pub(crate) fn apply_link_result(
        &mut self,
        owner: Handle,
        key: &FieldKey,
        handles: &[Handle],
    ) -> Result<()> {
        self.set_canonical_value(owner, key, handles)?;
        relationship_in(&mut self.identity, owner, key)?.has_loaded = true;
        Ok(())
    }

    pub(crate) fn add_canonical(
        &mut self,
        owner: Handle,
        key: &FieldKey,
        related: Handle,
        index: Option<usize>,
    ) -> Result<()> {
        self.ensure_relationship(owner, key)?;
        let relationship = self.relationship_ref(owner, key)?;
        if !relationship.canonical_members().contains(&related) {
            let previous = relationship
                .belongs_to()
                .and_then(|state| state.canonical_state())
                .filter(|previous| *previous != related);
            let inverse_key = relationship.inverse_key();
            if let Some(previous) = previous {
                self.remove_canonical(owner, key, previous)?;
            }
            relationship_in(&mut self.identity, owner, key)?.insert_canonical(related, index);
            self.note_holder(related, owner, key);
            if inverse_key.is_implicit() || self.has_relationship(related, &inverse_key) {
                self.add_canonical(related, &inverse_key, owner, None)?;
            }
        }
        relationship_in(&mut self.identity, owner, key)?.has_data = true;
        self.flush_canonical_later(owner, key);
        Ok(())
    }

    pub(crate) fn remove_canonical(
        &mut self,
        owner: Handle,
        key: &FieldKey,
        related: Handle,
    ) -> Result<()> {
        if !self.has_relationship(owner, key) {
            return Ok(());
        }
        let relationship = relationship_in(&mut self.identity, owner, key)?;
        let inverse_key = relationship.inverse_key();
        if relationship.remove_canonical(related) && self.has_relationship(related, &inverse_key) {
            self.remove_canonical(related, &inverse_key, owner)?;
        }
        self.flush_canonical_later(owner, key);
        Ok(())
    }

    /// Add a member locally and mirror it on the inverse.
    pub(crate) fn add_local(
        &mut self,
        owner: Handle,
        key: &FieldKey,
        related: Handle,
        index: Option<usize>,
    ) -> Result<()> {
        self.ensure_relationship(owner, key)?;
        let relationship = self.relationship_ref(owner, key)?;
        if relationship.members().contains(&related) {
            relationship_in(&mut self.identity, owner, key)?.has_data = true;
            return Ok(());
        }

        if !key.is_implicit() {
            let meta = relationship.meta();
            let got = self.identity.get(related)?.model_name();
            if !self.schema.is_assignable(&meta.related_type, got) {
                let owner_type = self.identity.get(owner)?.model_name();
                return Err(Error::IncompatibleType {
                    relationship: format!("{}.{}", owner_type, meta.name),
                    expected: meta.related_type.clone(),
                    got: got.to_string(),
                });
            }
        }

        let previous = relationship
            .belongs_to()
            .and_then(|state| state.inverse_record());
        let inverse_key = relationship.inverse_key();
        if let Some(previous) = previous {
            self.remove_local(owner, key, previous)?;
        }

        let relationship = relationship_in(&mut self.identity, owner, key)?;
        relationship.insert_local(related, index);
        relationship.has_data = true;

        self.ensure_relationship(related, &inverse_key)?;
        self.add_local(related, &inverse_key, owner, None)?;
        self.run_loop.record_changed(owner);
        Ok(())
    }

    /// Remove a member locally and from the inverse's local side.
    pub(crate) fn remove_local(
        &mut self,
        owner: Handle,
        key: &FieldKey,
        related: Handle,
    ) -> Result<()> {
        if !self.has_relationship(owner, key) {
            return Ok(());
        }
        let relationship = relationship_in(&mut self.identity, owner, key)?;
        let inverse_key = relationship.inverse_key();
        if !relationship.remove_local(related) {
            return Ok(());
        }
        self.run_loop.record_changed(owner);

        if !self.identity.exists(related)
            || (inverse_key.is_implicit() && !self.has_relationship(related, &inverse_key))
        {
            return Ok(());
        }
        self.ensure_relationship(related, &inverse_key)?;
        relationship_in(&mut self.identity, related, &inverse_key)?.remove_local(owner);
        Ok(())
    }

    fn note_holder(&mut self, related: Handle, owner: Handle, key: &FieldKey) {
        self.holders
            .entry(related)
            .or_default()
            .insert((owner, key.clone()));
    }

    /// Materialized relationships that hold `handle` as a canonical member.
    pub(crate) fn canonical_holders(&self, handle: Handle) -> Vec<(Handle, FieldKey)> {
        let Some(holders) = self.holders.get(&handle) else {
            return Vec::new();
        };
        holders
            .iter()
            .filter(|(owner, key)| {
                self.relationship_ref(*owner, key)
                    .is_ok_and(|r| r.canonical_members().contains(&handle))
            })
            .cloned()
            .collect()
    }

    pub(crate) fn flush_canonical_later(&mut self, owner: Handle, key: &FieldKey) {
        if let Ok(relationship) = relationship_in(&mut self.identity, owner, key) {
            if !relationship.will_sync {
                relationship.will_sync = true;
                self.run_loop.schedule_canonical(owner, key.clone());
            }
        }
    }

    /// Canonical flush of one relationship, run during the tick.
    pub(super) fn flush_canonical(
        &mut self,
        owner: Handle,
        key: &FieldKey,
    ) -> Option<RelationshipChange> {
        let members: Vec<Handle> = self
            .relationship_ref(owner, key)
            .ok()?
            .members()
            .iter()
            .copied()
            .collect();
        let new_records: HashSet<Handle> = members
            .into_iter()
            .filter(|h| self.identity.get(*h).is_ok_and(|r| r.is_new()))
            .collect();

        let relationship = relationship_in(&mut self.identity, owner, key).ok()?;
        let outcome = relationship.flush_canonical(|h| new_records.contains(&h));
        if outcome.array_change.is_none() && !outcome.belongs_to_changed {
            return None;
        }
        self.run_loop.record_changed(owner);
        Some(RelationshipChange {
            owner,
            key: key.clone(),
            change: outcome.array_change,
        })
    }

    /// Detach a record from every relationship pointing at it. New records
    /// also forget their own relationships.
    pub(crate) fn remove_from_inverse_relationships(
        &mut self,
        handle: Handle,
        is_new: bool,
    ) -> Result<()> {
        let record = self.identity.get(handle)?;
        let edges: Vec<(FieldKey, FieldKey, Vec<Handle>)> = record
            .relationships
            .values()
            .map(|relationship| {
                let mut related: Vec<Handle> = relationship.members().iter().copied().collect();
                for handle in relationship.canonical_members() {
                    if !related.contains(handle) {
                        related.push(*handle);
                    }
                }
                (relationship.key().clone(), relationship.inverse_key(), related)
            })
            .collect();

        for (key, inverse_key, related) in edges {
            for other in related {
                if !self.identity.exists(other)
                    || (inverse_key.is_implicit() && !self.has_relationship(other, &inverse_key))
                {
                    continue;
                }
                self.ensure_relationship(other, &inverse_key)?;
                let inverse = relationship_in(&mut self.identity, other, &inverse_key)?;
                if inverse.remove_completely(handle) {
                    self.run_loop.record_changed(other);
                }
            }
            if is_new {
                relationship_in(&mut self.identity, handle, &key)?.clear();
            }
        }
        Ok(())
    }

    // ==================== Public edits ====================

    fn declared_key(&self, handle: Handle, name: &str, kind: RelationshipKind) -> Result<FieldKey> {
        let model = self.identity.get(handle)?.model_name();
        let meta = self.schema.relationship(model, name)?;
        if meta.kind != kind {
            return Err(Error::WrongRelationshipKind {
                name: name.to_string(),
                expected: match kind {
                    RelationshipKind::BelongsTo => "belongsTo",
                    RelationshipKind::HasMany => "hasMany",
                },
            });
        }
        Ok(FieldKey::declared(name))
    }

    /// Get a relationship, materializing it on first access.
    pub fn relationship(&mut self, handle: Handle, name: &str) -> Result<&Relationship> {
        let model = self.identity.get(handle)?.model_name().to_string();
        self.schema.relationship(&model, name)?;
        let key = FieldKey::declared(name);
        self.ensure_relationship(handle, &key)?;
        self.relationship_ref(handle, &key)
    }

    /// Set a to-one relationship locally; `None` clears it.
    pub fn set_belongs_to(
        &mut self,
        handle: Handle,
        name: &str,
        value: Option<Handle>,
    ) -> Result<()> {
        let key = self.declared_key(handle, name, RelationshipKind::BelongsTo)?;
        self.ensure_relationship(handle, &key)?;
        match value {
            Some(related) => self.add_local(handle, &key, related, None),
            None => {
                let current = self
                    .relationship_ref(handle, &key)?
                    .belongs_to()
                    .and_then(|state| state.inverse_record());
                relationship_in(&mut self.identity, handle, &key)?.has_data = true;
                match current {
                    Some(current) => self.remove_local(handle, &key, current),
                    None => Ok(()),
                }
            }
        }
    }

    pub fn belongs_to_value(&mut self, handle: Handle, name: &str) -> Result<Option<Handle>> {
        let key = self.declared_key(handle, name, RelationshipKind::BelongsTo)?;
        self.ensure_relationship(handle, &key)?;
        Ok(self.relationship_ref(handle, &key)?.values().first().copied())
    }

    /// Add a record to a to-many relationship, at `index` or the end.
    pub fn add_to_has_many(
        &mut self,
        handle: Handle,
        name: &str,
        related: Handle,
        index: Option<usize>,
    ) -> Result<()> {
        let key = self.declared_key(handle, name, RelationshipKind::HasMany)?;
        self.add_local(handle, &key, related, index)
    }

    pub fn remove_from_has_many(
        &mut self,
        handle: Handle,
        name: &str,
        related: Handle,
    ) -> Result<()> {
        let key = self.declared_key(handle, name, RelationshipKind::HasMany)?;
        self.remove_local(handle, &key, related)
    }

    /// Replace the local members of a to-many relationship.
    pub fn set_has_many(&mut self, handle: Handle, name: &str, related: &[Handle]) -> Result<()> {
        let key = self.declared_key(handle, name, RelationshipKind::HasMany)?;
        self.ensure_relationship(handle, &key)?;
        let stale: Vec<Handle> = self
            .relationship_ref(handle, &key)?
            .members()
            .iter()
            .copied()
            .filter(|h| !related.contains(h))
            .collect();
        for member in stale {
            self.remove_local(handle, &key, member)?;
        }
        for (index, member) in related.iter().enumerate() {
            self.add_local(handle, &key, *member, Some(index))?;
        }
        relationship_in(&mut self.identity, handle, &key)?.has_data = true;
        Ok(())
    }

    pub fn has_many_values(&mut self, handle: Handle, name: &str) -> Result<Vec<Handle>> {
        let key = self.declared_key(handle, name, RelationshipKind::HasMany)?;
        self.ensure_relationship(handle, &key)?;
        Ok(self.relationship_ref(handle, &key)?.values())
    }
}
