//! Per-tick work queues.
//!
//! Work that must be batched per tick is queued here and drained by
//! [`Store::flush`](crate::Store::flush) in a fixed phase order:
//!
//! 1. relationship canonical flush, in scheduling order, until empty
//! 2. record-array reconciliation
//! 3. deferred lifecycle events
//! 4. orphan sweep

use crate::record_array::ArrayId;
use crate::reconcile::ArrayChange;
use crate::relationship::FieldKey;
use crate::state::Lifecycle;
use crate::Handle;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// A lifecycle notification for one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub handle: Handle,
    pub event: Lifecycle,
}

/// A change applied to a record array during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayChangeEvent {
    pub array: ArrayId,
    pub change: ArrayChange,
}

/// A relationship whose visible value changed during a canonical flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipChange {
    pub owner: Handle,
    pub key: FieldKey,
    /// Splice applied to a to-many value; `None` for to-one changes
    pub change: Option<ArrayChange>,
}

/// Everything a tick delivered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Canonical flushes that changed a visible relationship value
    pub relationships: Vec<RelationshipChange>,
    /// Record array changes, one batch per array
    pub arrays: Vec<ArrayChangeEvent>,
    /// Lifecycle events in the order they were triggered
    pub lifecycle: Vec<LifecycleEvent>,
    /// Records destroyed by the orphan sweep
    pub destroyed: Vec<Handle>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty()
            && self.arrays.is_empty()
            && self.lifecycle.is_empty()
            && self.destroyed.is_empty()
    }

    /// Lifecycle events delivered to one record.
    pub fn events_for(&self, handle: Handle) -> Vec<Lifecycle> {
        self.lifecycle
            .iter()
            .filter(|e| e.handle == handle)
            .map(|e| e.event)
            .collect()
    }

    pub(crate) fn merge(&mut self, other: TickReport) {
        self.relationships.extend(other.relationships);
        self.arrays.extend(other.arrays);
        self.lifecycle.extend(other.lifecycle);
        self.destroyed.extend(other.destroyed);
    }
}

/// Queues filled during a tick.
#[derive(Debug, Default)]
pub struct RunLoop {
    canonical: IndexSet<(Handle, FieldKey)>,
    records_changed: IndexSet<Handle>,
    lifecycle: Vec<LifecycleEvent>,
    orphan_checks: IndexSet<Handle>,
}

impl RunLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a canonical flush; repeated requests in one tick coalesce.
    pub fn schedule_canonical(&mut self, owner: Handle, key: FieldKey) -> bool {
        self.canonical.insert((owner, key))
    }

    pub fn take_canonical(&mut self) -> Option<(Handle, FieldKey)> {
        self.canonical.shift_remove_index(0)
    }

    /// Note that a record's array membership must be re-evaluated.
    pub fn record_changed(&mut self, handle: Handle) {
        self.records_changed.insert(handle);
    }

    pub fn take_records_changed(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.records_changed).into_iter().collect()
    }

    pub fn trigger(&mut self, handle: Handle, event: Lifecycle) {
        self.lifecycle.push(LifecycleEvent { handle, event });
    }

    pub fn take_lifecycle(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.lifecycle)
    }

    pub fn check_orphan(&mut self, handle: Handle) {
        self.orphan_checks.insert(handle);
    }

    pub fn take_orphan_checks(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.orphan_checks).into_iter().collect()
    }

    /// Drop queued work for a destroyed record.
    pub fn forget(&mut self, handle: Handle) {
        self.canonical.retain(|(owner, _)| *owner != handle);
        self.records_changed.shift_remove(&handle);
        self.orphan_checks.shift_remove(&handle);
    }

    pub fn is_idle(&self) -> bool {
        self.canonical.is_empty()
            && self.records_changed.is_empty()
            && self.lifecycle.is_empty()
            && self.orphan_checks.is_empty()
    }
}
