//! Store - the synchronous cache core.
//!
//! The Store owns the identity map, every record's state and relationships,
//! the relationship payload cache and the record arrays. All mutation happens
//! synchronously; work that must be batched is queued on the run loop and
//! applied by [`Store::flush`].

mod commit;
mod graph;
mod push;
mod unload;

pub use commit::SaveOutcome;
pub use push::Pushed;

use crate::config::CacheConfig;
use crate::document::ValidationErrors;
use crate::identity::{coerce_id_str, IdentityMap};
use crate::record::{Attributes, InternalModel};
use crate::record_array::{ArrayId, RecordArray, RecordArrayManager, RecordFilter};
use crate::relationship::{FieldKey, RelationshipPayloadCache};
use crate::runloop::{RunLoop, TickReport};
use crate::state::{EventKind, Hook, StateFlags, StateMachine, Step};
use crate::{error::Result, Error, Handle, Schema};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Flags of a record: the state flags plus per-record ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFlags {
    #[serde(flatten)]
    pub state: StateFlags,
    /// The last save failed with a non-validation error
    pub is_error: bool,
    /// A reload is in flight
    pub is_reloading: bool,
    pub has_dirty_attributes: bool,
}

/// Context of a `didSetProperty` event.
#[derive(Debug, Clone, Default)]
pub(crate) struct PropertyChange {
    pub name: String,
    pub value: Option<Value>,
    pub old: Option<Value>,
    pub original: Option<Value>,
}

/// The main store holding all cache state.
#[derive(Debug)]
pub struct Store {
    /// Registered schema
    schema: Schema,
    config: CacheConfig,
    /// Records by handle and by (type, id)
    identity: IdentityMap,
    machine: StateMachine,
    /// Relationship payloads not yet materialized
    payloads: RelationshipPayloadCache,
    /// Materialized relationships that were given each handle as a canonical
    /// member. May hold stale entries; readers check the relationship.
    holders: HashMap<Handle, IndexSet<(Handle, FieldKey)>>,
    arrays: RecordArrayManager,
    /// Work deferred to the end of the tick
    run_loop: RunLoop,
}

impl Store {
    /// Create a store with the default configuration. The schema is
    /// registered if it has not been already.
    pub fn new(schema: Schema) -> Result<Self> {
        Self::with_config(schema, CacheConfig::default())
    }

    pub fn with_config(mut schema: Schema, config: CacheConfig) -> Result<Self> {
        if !schema.is_registered() {
            schema.register()?;
        }
        Ok(Self {
            schema,
            config,
            identity: IdentityMap::new(),
            machine: StateMachine::new(),
            payloads: RelationshipPayloadCache::new(),
            holders: HashMap::new(),
            arrays: RecordArrayManager::new(),
            run_loop: RunLoop::new(),
        })
    }

    /// Get the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Get the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the identity map.
    pub fn identity(&self) -> &IdentityMap {
        &self.identity
    }

    /// Get a record.
    pub fn record(&self, handle: Handle) -> Result<&InternalModel> {
        self.identity.get(handle)
    }

    /// Handle for (type, id), creating an empty record on a miss.
    pub fn resolve(&mut self, model: &str, id: &str) -> Result<Handle> {
        self.schema.require_model(model)?;
        let id = coerce_id_str(id).ok_or_else(|| Error::MissingId {
            model: model.to_string(),
        })?;
        Ok(self.identity.resolve(model, &id))
    }

    // ==================== Events ====================

    /// Deliver an event to a record's current state.
    pub(crate) fn send(
        &mut self,
        handle: Handle,
        event: EventKind,
        context: Option<&PropertyChange>,
    ) -> Result<()> {
        let record = self.identity.get(handle)?;
        let state = record.state();
        let Some((_, steps)) = state.handler(event) else {
            return Err(Error::UnhandledEvent {
                event: event.name(),
                state: state.path(),
                record: record.label(),
            });
        };
        tracing::trace!(record = %record.label(), event = event.name(), state = %state, "event");
        for step in steps {
            self.run_step(handle, *step, context)?;
        }
        Ok(())
    }

    /// Fail unless the record's state handles an event. Used before
    /// mutating buffers so a rejected call leaves the record untouched.
    pub(crate) fn ensure_handles(&self, handle: Handle, event: EventKind) -> Result<()> {
        let record = self.identity.get(handle)?;
        let state = record.state();
        if state.handler(event).is_none() {
            return Err(Error::UnhandledEvent {
                event: event.name(),
                state: state.path(),
                record: record.label(),
            });
        }
        Ok(())
    }

    fn run_step(
        &mut self,
        handle: Handle,
        step: Step,
        context: Option<&PropertyChange>,
    ) -> Result<()> {
        match step {
            Step::Transition(path) => self.transition_to(handle, path)?,
            Step::Trigger(event) => self.run_loop.trigger(handle, event),
            Step::Send(event) => self.send(handle, event, context)?,
            Step::DirtyIfChanged | Step::TrackProperty => {
                if let Some(change) = context {
                    self.did_set_property(handle, change)?;
                }
            }
            Step::RolledBackIfClean => {
                if !self.identity.get(handle)?.has_changed_attributes() {
                    self.send(handle, EventKind::RolledBack, None)?;
                }
            }
            Step::SavedIfClean => {
                let record = self.identity.get_mut(handle)?;
                record.update_changed_attributes();
                if !record.has_changed_attributes() {
                    self.transition_to(handle, "loaded.saved")?;
                }
            }
            Step::RollbackAttributes => self.rollback_buffers(handle)?,
            Step::RemoveFromInverses => {
                let is_new = self.identity.get(handle)?.is_new();
                self.remove_from_inverse_relationships(handle, is_new)?;
            }
            Step::ClearErrors => self.identity.get_mut(handle)?.errors.clear(),
            Step::ClearAttributeError => {
                if let Some(change) = context {
                    self.identity.get_mut(handle)?.errors.remove(&change.name);
                }
            }
            Step::BecameValidIfNoErrors => {
                if self.identity.get(handle)?.errors.is_empty() {
                    self.send(handle, EventKind::BecameValid, None)?;
                }
            }
            Step::MarkError => self.identity.get_mut(handle)?.is_error = true,
            Step::ForbidUnload => {
                return Err(Error::UnloadInFlight {
                    record: self.identity.get(handle)?.label(),
                })
            }
        }
        Ok(())
    }

    fn did_set_property(&mut self, handle: Handle, change: &PropertyChange) -> Result<()> {
        if change.value == change.original {
            self.identity.get_mut(handle)?.local.remove(&change.name);
            self.send(handle, EventKind::PropertyWasReset, Some(change))?;
        } else if change.value != change.old {
            self.send(handle, EventKind::BecomeDirty, None)?;
        }
        self.run_loop.record_changed(handle);
        Ok(())
    }

    /// Move a record along a route, running exit, enter and setup hooks.
    pub(crate) fn transition_to(&mut self, handle: Handle, path: &'static str) -> Result<()> {
        let from = self.identity.get(handle)?.state();
        let route = self
            .machine
            .route(from, path)
            .ok_or(Error::InvalidTransition {
                from: from.path(),
                path,
            })?;

        for state in &route.exits {
            if let Some(hook) = state.exit_hook() {
                self.run_hook(handle, hook)?;
            }
        }
        self.identity.get_mut(handle)?.state = route.target;
        tracing::trace!(record = %handle, from = %from, to = %route.target, "transition");

        for state in &route.enters {
            if let Some(hook) = state.setup_hook() {
                self.run_hook(handle, hook)?;
            }
        }
        self.run_loop.record_changed(handle);
        Ok(())
    }

    fn run_hook(&mut self, handle: Handle, hook: Hook) -> Result<()> {
        match hook {
            Hook::FinishLoading => self.identity.get_mut(handle)?.is_reloading = false,
            Hook::DirtyIfChangedAttributes => {
                if self.identity.get(handle)?.has_changed_attributes() {
                    self.send(handle, EventKind::BecomeDirty, None)?;
                }
            }
            Hook::UpdateRecordArrays => self.run_loop.record_changed(handle),
            Hook::RemoveFromInverses => self.remove_from_inverse_relationships(handle, false)?,
        }
        Ok(())
    }

    // ==================== Attributes ====================

    /// Current value of an attribute, falling back to the declared default.
    pub fn attribute(&self, handle: Handle, name: &str) -> Result<Option<Value>> {
        let record = self.identity.get(handle)?;
        Ok(record.attribute(name).cloned().or_else(|| {
            self.schema
                .attribute(record.model_name(), name)
                .and_then(|def| def.default.clone())
        }))
    }

    /// Set an attribute locally.
    pub fn set_attribute(&mut self, handle: Handle, name: &str, value: Value) -> Result<()> {
        self.ensure_handles(handle, EventKind::DidSetProperty)?;
        let record = self.identity.get_mut(handle)?;
        let old = record.attribute(name).cloned();
        if old.as_ref() == Some(&value) {
            return Ok(());
        }
        let change = PropertyChange {
            name: name.to_string(),
            original: record.original_value(name).cloned(),
            old,
            value: Some(value.clone()),
        };
        record.local.insert(name.to_string(), value);
        self.send(handle, EventKind::DidSetProperty, Some(&change))
    }

    /// Attributes whose current value differs from canonical, as
    /// `name -> (canonical, current)`.
    pub fn changed_attributes(
        &self,
        handle: Handle,
    ) -> Result<IndexMap<String, (Option<Value>, Value)>> {
        Ok(self.identity.get(handle)?.changed_attributes())
    }

    /// Discard uncommitted attribute edits.
    ///
    /// Rolling back a record that was never saved moves it to
    /// `deleted.saved` and detaches it from the graph.
    pub fn rollback_attributes(&mut self, handle: Handle) -> Result<()> {
        let state = self.identity.get(handle)?.state();
        if state.handler(EventKind::Rollback).is_some() {
            self.send(handle, EventKind::Rollback, None)
        } else {
            self.rollback_buffers(handle)
        }
    }

    fn rollback_buffers(&mut self, handle: Handle) -> Result<()> {
        let record = self.identity.get_mut(handle)?;
        if record.is_error {
            record.in_flight = None;
            record.is_error = false;
        }
        if record.is_new() {
            self.remove_from_inverse_relationships(handle, true)?;
        }
        let record = self.identity.get_mut(handle)?;
        if record.flags().is_valid {
            record.in_flight = None;
        }
        record.local.clear();
        self.run_loop.record_changed(handle);
        self.send(handle, EventKind::RolledBack, None)
    }

    // ==================== Records ====================

    /// Create a new local record in `loaded.created.uncommitted`.
    pub fn create_record(
        &mut self,
        model: &str,
        id: Option<&str>,
        attributes: Attributes,
    ) -> Result<Handle> {
        self.schema.require_model(model)?;
        let id = id.and_then(coerce_id_str);
        let handle = self.identity.insert_new(model, id)?;
        self.send(handle, EventKind::LoadedData, None)?;
        for (name, value) in attributes {
            self.set_attribute(handle, &name, value)?;
        }
        tracing::debug!(model = %model, record = %handle, "record created");
        Ok(handle)
    }

    /// Mark a record deleted locally; `save` persists the deletion.
    pub fn delete_record(&mut self, handle: Handle) -> Result<()> {
        self.send(handle, EventKind::DeleteRecord, None)
    }

    /// A loaded record for (type, id), without fetching.
    pub fn peek_record(&self, model: &str, id: &str) -> Option<Handle> {
        let id = coerce_id_str(id)?;
        let handle = self.identity.lookup(model, &id)?;
        let record = self.identity.get(handle).ok()?;
        (record.flags().is_loaded && !record.unloaded).then_some(handle)
    }

    pub fn has_record_for_id(&self, model: &str, id: &str) -> bool {
        self.peek_record(model, id).is_some()
    }

    /// The live array of every visible record of a type.
    pub fn peek_all(&mut self, model: &str) -> Result<ArrayId> {
        self.schema.require_model(model)?;
        Ok(self.arrays.live_array_for(model, &self.identity))
    }

    /// A live array of the visible records of a type matching a predicate.
    pub fn filter(&mut self, model: &str, filter: RecordFilter) -> Result<ArrayId> {
        self.schema.require_model(model)?;
        Ok(self.arrays.create_filtered(model, filter, &self.identity))
    }

    /// Get a record array.
    pub fn array(&self, id: ArrayId) -> Option<&RecordArray> {
        self.arrays.get(id)
    }

    /// Stop maintaining a record array.
    pub fn remove_array(&mut self, id: ArrayId) -> Option<RecordArray> {
        self.arrays.remove(id)
    }

    pub(crate) fn arrays_mut(&mut self) -> &mut RecordArrayManager {
        &mut self.arrays
    }

    /// Metadata of the last `find_all` or `query` response for a type.
    pub fn metadata_for(&self, model: &str) -> Option<&Value> {
        self.identity.metadata_for(model)
    }

    pub(crate) fn set_metadata(&mut self, model: &str, meta: Value) {
        self.identity.set_metadata(model, meta);
    }

    pub fn flags(&self, handle: Handle) -> Result<RecordFlags> {
        let record = self.identity.get(handle)?;
        Ok(RecordFlags {
            state: record.flags(),
            is_error: record.is_error,
            is_reloading: record.is_reloading,
            has_dirty_attributes: record.has_changed_attributes(),
        })
    }

    pub fn errors(&self, handle: Handle) -> Result<&ValidationErrors> {
        Ok(&self.identity.get(handle)?.errors)
    }

    // ==================== Tick ====================

    /// Whether any deferred work is queued.
    pub fn has_pending_work(&self) -> bool {
        !self.run_loop.is_idle()
    }

    /// Run one tick: canonical relationship flush, record arrays, lifecycle
    /// events, then the orphan sweep.
    pub fn flush(&mut self) -> TickReport {
        let mut report = TickReport::default();

        while let Some((owner, key)) = self.run_loop.take_canonical() {
            if let Some(change) = self.flush_canonical(owner, &key) {
                report.relationships.push(change);
            }
        }

        let changed = self.run_loop.take_records_changed();
        report.arrays = self.arrays.update(&changed, &self.identity);

        report.lifecycle = self.run_loop.take_lifecycle();

        let candidates = self.run_loop.take_orphan_checks();
        if self.config.sweep_orphans {
            report.destroyed = self.sweep_orphans(&candidates);
        }

        if !report.is_empty() {
            tracing::debug!(
                relationships = report.relationships.len(),
                arrays = report.arrays.len(),
                lifecycle = report.lifecycle.len(),
                destroyed = report.destroyed.len(),
                "tick flushed"
            );
        }
        report
    }
}
