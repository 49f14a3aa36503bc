//! Raw relationship payloads waiting for their relationship to materialize.
//!
//! Both sides of a relationship share one entry, so pushing `post.comments`
//! also records the implied `comment.post` payload for every comment without
//! touching the comment records. Payloads are queued on push and only merged
//! into the entry when one side is read.

use crate::document::{Linkage, RelationshipPayload, ResourceIdentifier};
use crate::schema::{InverseKind, RelationshipMeta};
use crate::{ModelName, Schema};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Declaring model and relationship name; stable across subtypes.
type SideKey = (ModelName, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Lhs,
    Rhs,
}

#[derive(Debug)]
struct Pending {
    record: ResourceIdentifier,
    side: Side,
    payload: RelationshipPayload,
}

/// Payloads for both sides of one relationship.
#[derive(Debug)]
struct RelationshipPayloads {
    lhs: SideKey,
    rhs: Option<SideKey>,
    lhs_is_many: bool,
    rhs_is_many: bool,
    /// Both sides are the same relationship; only the lhs map is used
    reflexive: bool,
    lhs_payloads: HashMap<ResourceIdentifier, RelationshipPayload>,
    rhs_payloads: HashMap<ResourceIdentifier, RelationshipPayload>,
    pending: Vec<Pending>,
}

impl RelationshipPayloads {
    fn side_of(&self, key: &SideKey) -> Side {
        if *key == self.lhs {
            Side::Lhs
        } else {
            Side::Rhs
        }
    }

    fn opposite(&self, side: Side) -> Side {
        match (self.reflexive, side) {
            (true, _) => Side::Lhs,
            (false, Side::Lhs) => Side::Rhs,
            (false, Side::Rhs) => Side::Lhs,
        }
    }

    fn is_many(&self, side: Side) -> bool {
        match side {
            Side::Lhs => self.lhs_is_many,
            Side::Rhs => self.rhs_is_many,
        }
    }

    fn payloads(&mut self, side: Side) -> &mut HashMap<ResourceIdentifier, RelationshipPayload> {
        match (self.reflexive, side) {
            (true, _) | (false, Side::Lhs) => &mut self.lhs_payloads,
            (false, Side::Rhs) => &mut self.rhs_payloads,
        }
    }

    fn get(&mut self, side: Side, record: &ResourceIdentifier) -> Option<RelationshipPayload> {
        self.flush_pending();
        self.payloads(side).get(record).cloned()
    }

    fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        for Pending {
            record,
            side,
            payload,
        } in std::mem::take(&mut self.pending)
        {
            let previous = self.payloads(side).get(&record).cloned();
            let inverse = self.opposite(side);
            let has_inverse = self.rhs.is_some();

            // A payload without data keeps what is known; data (even null)
            // replaces it, so the previous data's inverses are withdrawn first.
            if payload.data.is_some() && has_inverse {
                if let Some(data) = previous.as_ref().and_then(|p| p.data.as_ref()) {
                    for target in data.identifiers() {
                        self.remove_from_inverse(inverse, target, &record);
                    }
                }
            }

            let merged = match previous {
                Some(previous) => RelationshipPayload {
                    data: payload.data.clone().or(previous.data),
                    links: payload.links.clone().or(previous.links),
                    meta: payload.meta.clone().or(previous.meta),
                },
                None => payload.clone(),
            };
            self.payloads(side).insert(record.clone(), merged);

            if has_inverse {
                if let Some(data) = &payload.data {
                    for target in data.identifiers() {
                        if self.reflexive && *target == record {
                            continue;
                        }
                        self.add_to_inverse(inverse, target, &record);
                    }
                }
            }
        }
    }

    fn add_to_inverse(
        &mut self,
        side: Side,
        target: &ResourceIdentifier,
        record: &ResourceIdentifier,
    ) {
        let is_many = self.is_many(side);
        let entry = self.payloads(side).entry(target.clone()).or_default();
        match (&mut entry.data, is_many) {
            (Some(Linkage::Many(ids)), true) => {
                if !ids.contains(record) {
                    ids.push(record.clone());
                }
            }
            (data, true) => *data = Some(Linkage::Many(vec![record.clone()])),
            (data, false) => *data = Some(Linkage::One(record.clone())),
        }
    }

    fn remove_from_inverse(
        &mut self,
        side: Side,
        target: &ResourceIdentifier,
        record: &ResourceIdentifier,
    ) {
        let Some(entry) = self.payloads(side).get_mut(target) else {
            return;
        };
        if matches!(&entry.data, Some(Linkage::One(id)) if id == record) {
            entry.data = Some(Linkage::Empty);
        } else if let Some(Linkage::Many(ids)) = &mut entry.data {
            ids.retain(|id| id != record);
        }
    }
}

/// Relationship payloads keyed by relationship, shared by both sides.
#[derive(Debug, Default)]
pub struct RelationshipPayloadCache {
    entries: Vec<RelationshipPayloads>,
    index: HashMap<SideKey, usize>,
}

fn side_key(meta: &RelationshipMeta) -> SideKey {
    (meta.owner_type.clone(), meta.name.clone())
}

impl RelationshipPayloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_for(&mut self, schema: &Schema, meta: &RelationshipMeta) -> usize {
        let lhs = side_key(meta);
        if let Some(&idx) = self.index.get(&lhs) {
            return idx;
        }

        let rhs = match &meta.inverse {
            InverseKind::Declared(name) => schema
                .relationship(&meta.related_type, name)
                .ok()
                .map(side_key),
            InverseKind::Synthetic { .. } => None,
        };
        let idx = self.entries.len();
        self.entries.push(RelationshipPayloads {
            reflexive: rhs.as_ref() == Some(&lhs),
            lhs: lhs.clone(),
            rhs: rhs.clone(),
            lhs_is_many: meta.kind.is_many(),
            rhs_is_many: meta.inverse_is_many,
            lhs_payloads: HashMap::new(),
            rhs_payloads: HashMap::new(),
            pending: Vec::new(),
        });
        self.index.insert(lhs, idx);
        if let Some(rhs) = rhs {
            self.index.entry(rhs).or_insert(idx);
        }
        idx
    }

    /// Queue every relationship payload of a pushed resource.
    pub fn push(
        &mut self,
        schema: &Schema,
        record: &ResourceIdentifier,
        relationships: &IndexMap<String, RelationshipPayload>,
    ) {
        for (name, payload) in relationships {
            let Ok(meta) = schema.relationship(&record.model, name) else {
                continue;
            };
            let idx = self.entry_for(schema, meta);
            let entry = &mut self.entries[idx];
            let side = entry.side_of(&side_key(meta));
            entry.pending.push(Pending {
                record: record.clone(),
                side,
                payload: payload.clone(),
            });
        }
    }

    /// Resolved payload for one side, merging queued pushes first.
    pub fn get(
        &mut self,
        schema: &Schema,
        record: &ResourceIdentifier,
        relationship: &str,
    ) -> Option<RelationshipPayload> {
        let meta = schema.relationship(&record.model, relationship).ok()?;
        let idx = *self.index.get(&side_key(meta))?;
        let entry = &mut self.entries[idx];
        let side = entry.side_of(&side_key(meta));
        entry.get(side, record)
    }

    /// Forget the payload of an unloaded record.
    pub fn unload(&mut self, schema: &Schema, record: &ResourceIdentifier, relationship: &str) {
        let Ok(meta) = schema.relationship(&record.model, relationship) else {
            return;
        };
        let Some(&idx) = self.index.get(&side_key(meta)) else {
            return;
        };
        let entry = &mut self.entries[idx];
        let side = entry.side_of(&side_key(meta));
        entry.flush_pending();
        entry.payloads(side).remove(record);
    }

    pub fn pending_len(&self) -> usize {
        self.entries.iter().map(|e| e.pending.len()).sum()
    }
}
