//! Per-record relationship state.
//!
//! A [`Relationship`] belongs to one record and one field. It tracks the
//! locally visible members and the canonical (server-acknowledged) members
//! separately. Methods here only touch this side; keeping the inverse side in
//! step is the store's job, since it needs access to the other record.

mod belongs_to;
mod many;
mod payload_cache;

pub use belongs_to::BelongsToState;
pub use many::ManyState;
pub use payload_cache::RelationshipPayloadCache;

use crate::reconcile::ArrayChange;
use crate::schema::{InverseKind, RelationshipKind, RelationshipMeta};
use crate::{Handle, ModelName};
use indexmap::IndexSet;
use serde_json::Value;

/// Key of a relationship within a record's relationship table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldKey {
    /// A relationship declared in the schema
    Declared(String),
    /// Synthetic inverse of `owner_type.field`, which declares no inverse.
    /// Never visible to the application.
    Implicit { owner_type: ModelName, field: String },
}

impl FieldKey {
    pub fn declared(name: impl Into<String>) -> Self {
        FieldKey::Declared(name.into())
    }

    /// Key of the relationship on the related record that mirrors `meta`.
    pub fn inverse_of(meta: &RelationshipMeta) -> Self {
        match &meta.inverse {
            InverseKind::Declared(name) => FieldKey::Declared(name.clone()),
            InverseKind::Synthetic { owner_type, field } => FieldKey::Implicit {
                owner_type: owner_type.clone(),
                field: field.clone(),
            },
        }
    }

    pub fn is_implicit(&self) -> bool {
        matches!(self, FieldKey::Implicit { .. })
    }
}

impl std::fmt::Display for FieldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKey::Declared(name) => f.write_str(name),
            FieldKey::Implicit { owner_type, field } => write!(f, "{}:{}", owner_type, field),
        }
    }
}

/// Kind-specific state.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationshipState {
    Many(ManyState),
    BelongsTo(BelongsToState),
    /// Synthetic inverse: plain member sets only
    Implicit,
}

/// One relationship of one record.
#[derive(Debug, Clone)]
pub struct Relationship {
    owner: Handle,
    key: FieldKey,
    meta: RelationshipMeta,
    members: IndexSet<Handle>,
    canonical_members: IndexSet<Handle>,
    pub(crate) has_data: bool,
    pub(crate) has_loaded: bool,
    pub(crate) link: Option<String>,
    pub(crate) payload_meta: Option<Value>,
    /// A canonical flush is scheduled for this relationship
    pub(crate) will_sync: bool,
    pub(crate) state: RelationshipState,
}

impl Relationship {
    pub fn new(owner: Handle, key: FieldKey, meta: RelationshipMeta) -> Self {
        let state = if key.is_implicit() {
            RelationshipState::Implicit
        } else {
            match meta.kind {
                RelationshipKind::HasMany => RelationshipState::Many(ManyState::default()),
                RelationshipKind::BelongsTo => {
                    RelationshipState::BelongsTo(BelongsToState::default())
                }
            }
        };
        Self {
            owner,
            key,
            meta,
            members: IndexSet::new(),
            canonical_members: IndexSet::new(),
            has_data: false,
            has_loaded: false,
            link: None,
            payload_meta: None,
            will_sync: false,
            state,
        }
    }

    pub fn owner(&self) -> Handle {
        self.owner
    }

    pub fn key(&self) -> &FieldKey {
        &self.key
    }

    pub fn meta(&self) -> &RelationshipMeta {
        &self.meta
    }

    pub fn inverse_key(&self) -> FieldKey {
        FieldKey::inverse_of(&self.meta)
    }

    pub fn is_many(&self) -> bool {
        !matches!(self.state, RelationshipState::BelongsTo(_))
    }

    pub fn members(&self) -> &IndexSet<Handle> {
        &self.members
    }

    pub fn canonical_members(&self) -> &IndexSet<Handle> {
        &self.canonical_members
    }

    pub fn has_data(&self) -> bool {
        self.has_data
    }

    pub fn has_loaded(&self) -> bool {
        self.has_loaded
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn payload_meta(&self) -> Option<&Value> {
        self.payload_meta.as_ref()
    }

    pub fn many(&self) -> Option<&ManyState> {
        match &self.state {
            RelationshipState::Many(many) => Some(many),
            _ => None,
        }
    }

    pub(crate) fn many_mut(&mut self) -> Option<&mut ManyState> {
        match &mut self.state {
            RelationshipState::Many(many) => Some(many),
            _ => None,
        }
    }

    pub fn belongs_to(&self) -> Option<&BelongsToState> {
        match &self.state {
            RelationshipState::BelongsTo(one) => Some(one),
            _ => None,
        }
    }

    /// Visible value in order: the many-array for to-many relationships, the
    /// current record for to-one, the member set for synthetic inverses.
    pub fn values(&self) -> Vec<Handle> {
        match &self.state {
            RelationshipState::Many(many) => many.current.clone(),
            RelationshipState::BelongsTo(one) => one.inverse_record.into_iter().collect(),
            RelationshipState::Implicit => self.members.iter().copied().collect(),
        }
    }

    /// Canonical value in server order.
    pub fn canonical_values(&self) -> Vec<Handle> {
        match &self.state {
            RelationshipState::Many(many) => many.canonical_state.clone(),
            RelationshipState::BelongsTo(one) => one.canonical_state.into_iter().collect(),
            RelationshipState::Implicit => self.canonical_members.iter().copied().collect(),
        }
    }

    /// Add to canonical membership. To-one callers must drop the previous
    /// canonical member first.
    pub(crate) fn insert_canonical(&mut self, handle: Handle, index: Option<usize>) -> bool {
        if !self.canonical_members.insert(handle) {
            return false;
        }
        match &mut self.state {
            RelationshipState::Many(many) => many.insert_canonical(handle, index),
            RelationshipState::BelongsTo(one) => one.canonical_state = Some(handle),
            RelationshipState::Implicit => {}
        }
        true
    }

    pub(crate) fn remove_canonical(&mut self, handle: Handle) -> bool {
        if !self.canonical_members.shift_remove(&handle) {
            return false;
        }
        match &mut self.state {
            RelationshipState::Many(many) => many.canonical_state.retain(|h| *h != handle),
            RelationshipState::BelongsTo(one) => {
                if one.canonical_state == Some(handle) {
                    one.canonical_state = None;
                }
            }
            RelationshipState::Implicit => {}
        }
        true
    }

    /// Add to local membership. To-one callers must drop the previous member
    /// first.
    pub(crate) fn insert_local(&mut self, handle: Handle, index: Option<usize>) -> bool {
        if !self.members.insert(handle) {
            return false;
        }
        match &mut self.state {
            RelationshipState::Many(many) => many.insert_current(handle, index),
            RelationshipState::BelongsTo(one) => one.inverse_record = Some(handle),
            RelationshipState::Implicit => {}
        }
        true
    }

    pub(crate) fn remove_local(&mut self, handle: Handle) -> bool {
        if !self.members.shift_remove(&handle) {
            return false;
        }
        match &mut self.state {
            RelationshipState::Many(many) => many.remove_current(handle),
            RelationshipState::BelongsTo(one) => {
                if one.inverse_record == Some(handle) {
                    one.inverse_record = None;
                }
            }
            RelationshipState::Implicit => {}
        }
        true
    }

    /// Seed state from the payload the relationship was materialized with.
    /// Returns the handles newly added to canonical membership.
    pub(crate) fn set_initial(&mut self, handles: &[Handle]) -> Vec<Handle> {
        let mut added = Vec::new();
        for &handle in handles {
            if self.canonical_members.insert(handle) {
                self.members.insert(handle);
                added.push(handle);
            }
        }
        match &mut self.state {
            RelationshipState::Many(many) => {
                many.canonical_state = self.canonical_members.iter().copied().collect();
                many.current = many.canonical_state.clone();
            }
            RelationshipState::BelongsTo(one) => {
                one.canonical_state = handles.first().copied();
                one.inverse_record = one.canonical_state;
            }
            RelationshipState::Implicit => {}
        }
        added
    }

    /// Reconcile local membership with canonical membership.
    ///
    /// Locally created records that the server does not know about yet are
    /// kept. Returns the change applied to the many-array, if any.
    pub(crate) fn flush_canonical<F>(&mut self, is_new: F) -> FlushOutcome
    where
        F: Fn(Handle) -> bool,
    {
        self.will_sync = false;
        let outcome = match &mut self.state {
            RelationshipState::Many(many) => FlushOutcome {
                array_change: many.flush(&is_new),
                belongs_to_changed: false,
            },
            RelationshipState::BelongsTo(one) => {
                if one.keeps_new_record(&is_new) {
                    return FlushOutcome::default();
                }
                FlushOutcome {
                    array_change: None,
                    belongs_to_changed: one.adopt_canonical(),
                }
            }
            RelationshipState::Implicit => FlushOutcome::default(),
        };

        let pending_new: Vec<Handle> = self
            .members
            .iter()
            .copied()
            .filter(|h| is_new(*h) && !self.canonical_members.contains(h))
            .collect();
        self.members = self.canonical_members.clone();
        self.members.extend(pending_new);
        outcome
    }

    /// Drop a record from both local and canonical membership.
    pub(crate) fn remove_completely(&mut self, handle: Handle) -> bool {
        let local = self.remove_local(handle);
        let canonical = self.remove_canonical(handle);
        local || canonical
    }

    /// Forget every member, local and canonical.
    pub(crate) fn clear(&mut self) -> Vec<Handle> {
        let mut all: Vec<Handle> = self.members.iter().copied().collect();
        for handle in &self.canonical_members {
            if !all.contains(handle) {
                all.push(*handle);
            }
        }
        self.members.clear();
        self.canonical_members.clear();
        match &mut self.state {
            RelationshipState::Many(many) => *many = ManyState::default(),
            RelationshipState::BelongsTo(one) => *one = BelongsToState::default(),
            RelationshipState::Implicit => {}
        }
        all
    }
}

/// What a canonical flush changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub array_change: Option<ArrayChange>,
    pub belongs_to_changed: bool,
}
