//! Record arrays: derived views kept in sync with the identity map.
//!
//! Records that change are queued once per tick. At flush time every array is
//! re-evaluated against the queued records and updated with a single splice,
//! so a tick that loads many records produces one change per array.

use crate::identity::IdentityMap;
use crate::reconcile::{reconcile, ArrayChange};
use crate::record::InternalModel;
use crate::runloop::ArrayChangeEvent;
use crate::{Handle, ModelName};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Stable identifier of a record array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArrayId(pub(crate) u64);

impl std::fmt::Display for ArrayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "array#{}", self.0)
    }
}

/// What populates a record array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArrayKind {
    /// Every visible record of a type
    Live,
    /// Visible records of a type matching a predicate
    Filtered,
    /// Records returned by an adapter for a query (or `find_all`)
    AdapterPopulated { query: Option<Value> },
}

/// Predicate of a filtered array.
pub struct RecordFilter(Box<dyn Fn(&InternalModel) -> bool>);

impl RecordFilter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&InternalModel) -> bool + 'static,
    {
        Self(Box::new(f))
    }

    fn matches(&self, record: &InternalModel) -> bool {
        (self.0)(record)
    }
}

impl std::fmt::Debug for RecordFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecordFilter")
    }
}

/// An ordered list of records of one type.
#[derive(Debug)]
pub struct RecordArray {
    id: ArrayId,
    model: ModelName,
    kind: ArrayKind,
    content: Vec<Handle>,
    filter: Option<RecordFilter>,
    meta: Option<Value>,
    links: Option<Value>,
    is_updating: bool,
    last_change: Option<ArrayChange>,
}

impl RecordArray {
    fn new(id: ArrayId, model: &str, kind: ArrayKind, filter: Option<RecordFilter>) -> Self {
        Self {
            id,
            model: model.to_string(),
            kind,
            content: Vec::new(),
            filter,
            meta: None,
            links: None,
            is_updating: false,
            last_change: None,
        }
    }

    pub fn id(&self) -> ArrayId {
        self.id
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn kind(&self) -> &ArrayKind {
        &self.kind
    }

    pub fn handles(&self) -> &[Handle] {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.content.contains(&handle)
    }

    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    pub fn links(&self) -> Option<&Value> {
        self.links.as_ref()
    }

    /// A fetch that will repopulate this array is in flight.
    pub fn is_updating(&self) -> bool {
        self.is_updating
    }

    pub fn last_change(&self) -> Option<ArrayChange> {
        self.last_change
    }

    /// Whether a record should be a member after it changed.
    fn accepts(&self, record: Option<&InternalModel>, is_member: bool) -> bool {
        let Some(record) = record else {
            return false;
        };
        match &self.kind {
            // never gains members outside of a load
            ArrayKind::AdapterPopulated { .. } => is_member && !record.unloaded,
            ArrayKind::Live | ArrayKind::Filtered => {
                record.model_name() == self.model
                    && !record.is_hidden()
                    && self.filter.as_ref().map_or(true, |f| f.matches(record))
            }
        }
    }

    fn apply(&mut self, target: &[Handle]) -> Option<ArrayChange> {
        let change = reconcile(&mut self.content, target)?;
        self.last_change = Some(change);
        Some(change)
    }
}

/// Owner of every record array.
#[derive(Debug, Default)]
pub struct RecordArrayManager {
    arrays: IndexMap<ArrayId, RecordArray>,
    live: HashMap<ModelName, ArrayId>,
    next_id: u64,
}

impl RecordArrayManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self, model: &str, kind: ArrayKind, filter: Option<RecordFilter>) -> ArrayId {
        self.next_id += 1;
        let id = ArrayId(self.next_id);
        self.arrays
            .insert(id, RecordArray::new(id, model, kind, filter));
        id
    }

    fn visible_records(&self, id: ArrayId, identity: &IdentityMap) -> Vec<Handle> {
        let Some(array) = self.arrays.get(&id) else {
            return Vec::new();
        };
        let mut handles = Vec::new();
        identity.for_each(&array.model, |record| {
            if array.accepts(Some(record), false) {
                handles.push(record.handle());
            }
        });
        handles
    }

    /// The live array of a type, created and populated on first use.
    pub fn live_array_for(&mut self, model: &str, identity: &IdentityMap) -> ArrayId {
        if let Some(&id) = self.live.get(model) {
            return id;
        }
        let id = self.allocate(model, ArrayKind::Live, None);
        self.live.insert(model.to_string(), id);
        let initial = self.visible_records(id, identity);
        if let Some(array) = self.arrays.get_mut(&id) {
            array.content = initial;
        }
        id
    }

    /// A filtered array, populated immediately.
    pub fn create_filtered(
        &mut self,
        model: &str,
        filter: RecordFilter,
        identity: &IdentityMap,
    ) -> ArrayId {
        let id = self.allocate(model, ArrayKind::Filtered, Some(filter));
        let initial = self.visible_records(id, identity);
        if let Some(array) = self.arrays.get_mut(&id) {
            array.content = initial;
        }
        id
    }

    /// An empty array to be populated by an adapter response.
    pub fn create_adapter_populated(&mut self, model: &str, query: Option<Value>) -> ArrayId {
        let id = self.allocate(model, ArrayKind::AdapterPopulated { query }, None);
        if let Some(array) = self.arrays.get_mut(&id) {
            array.is_updating = true;
        }
        id
    }

    /// Replace the content of an adapter-populated array.
    pub fn load(
        &mut self,
        id: ArrayId,
        handles: &[Handle],
        meta: Option<Value>,
        links: Option<Value>,
    ) -> Option<ArrayChange> {
        let array = self.arrays.get_mut(&id)?;
        array.meta = meta;
        array.links = links;
        array.is_updating = false;
        array.apply(handles)
    }

    pub fn set_updating(&mut self, id: ArrayId, updating: bool) {
        if let Some(array) = self.arrays.get_mut(&id) {
            array.is_updating = updating;
        }
    }

    pub fn get(&self, id: ArrayId) -> Option<&RecordArray> {
        self.arrays.get(&id)
    }

    /// Stop maintaining an array.
    pub fn remove(&mut self, id: ArrayId) -> Option<RecordArray> {
        let array = self.arrays.shift_remove(&id)?;
        if matches!(array.kind, ArrayKind::Live) {
            self.live.remove(&array.model);
        }
        Some(array)
    }

    /// Arrays currently containing a record.
    pub fn arrays_containing(&self, handle: Handle) -> Vec<ArrayId> {
        self.arrays
            .values()
            .filter(|a| a.contains(handle))
            .map(|a| a.id)
            .collect()
    }

    /// Re-evaluate membership of changed records, one splice per array.
    pub fn update(&mut self, changed: &[Handle], identity: &IdentityMap) -> Vec<ArrayChangeEvent> {
        if changed.is_empty() {
            return Vec::new();
        }
        let mut events = Vec::new();
        for array in self.arrays.values_mut() {
            let mut members: HashSet<Handle> = array.content.iter().copied().collect();
            let mut added = Vec::new();
            let mut removed = HashSet::new();
            for &handle in changed {
                let is_member = members.contains(&handle);
                let record = identity.get(handle).ok();
                if !is_member && record.is_some_and(|r| r.model_name() != array.model) {
                    continue;
                }
                match (array.accepts(record, is_member), is_member) {
                    (true, false) => {
                        members.insert(handle);
                        added.push(handle);
                    }
                    (false, true) => {
                        removed.insert(handle);
                    }
                    _ => {}
                }
            }
            if added.is_empty() && removed.is_empty() {
                continue;
            }

            let mut target: Vec<Handle> = array
                .content
                .iter()
                .copied()
                .filter(|h| !removed.contains(h))
                .collect();
            target.extend(added);
            if let Some(change) = array.apply(&target) {
                events.push(ArrayChangeEvent {
                    array: array.id,
                    change,
                });
            }
        }
        if !events.is_empty() {
            tracing::debug!(
                arrays = events.len(),
                records = changed.len(),
                "record arrays updated"
            );
        }
        events
    }
}
