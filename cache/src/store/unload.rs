//! Unloading and the orphan sweep.
//!
//! An unloaded record keeps its identity while anything still references
//! it. At the end of a tick, every group of mutually linked records that are
//! all unloaded or empty is destroyed together.

use super::Store;
use crate::document::ResourceIdentifier;
use crate::relationship::FieldKey;
use crate::state::{EventKind, StateId};
use crate::{error::Result, Handle};
use std::collections::{HashMap, HashSet, VecDeque};

impl Store {
    /// Drop a record's data. Relationships pointing at it lose their local
    /// membership but keep canonical edges, so a reload restores them.
    pub fn unload_record(&mut self, handle: Handle) -> Result<()> {
        self.send(handle, EventKind::UnloadRecord, None)?;
        self.withdraw_from_inverses(handle)?;

        let record = self.identity.get_mut(handle)?;
        record.clear_data();
        record.state = StateId::Empty;
        record.is_reloading = false;
        record.unloaded = true;
        tracing::debug!(record = %record.label(), "record unloaded");

        self.run_loop.record_changed(handle);
        self.run_loop.check_orphan(handle);
        Ok(())
    }

    /// Unload every record of a type, or of every type when `model` is `None`.
    pub fn unload_all(&mut self, model: Option<&str>) -> Result<()> {
        let models: Vec<String> = match model {
            Some(model) => {
                self.schema.require_model(model)?;
                vec![model.to_string()]
            }
            None => self.identity.model_names().map(String::from).collect(),
        };
        for model in models {
            for handle in self.identity.handles_of(&model) {
                if !self.identity.get(handle)?.unloaded {
                    self.unload_record(handle)?;
                }
            }
        }
        Ok(())
    }

    /// Remove `handle` from every materialized relationship holding it.
    /// Async relationships only lose the local member.
    fn withdraw_from_inverses(&mut self, handle: Handle) -> Result<()> {
        let holders: Vec<(Handle, FieldKey)> = self
            .identity
            .iter()
            .filter(|record| record.handle() != handle)
            .flat_map(|record| {
                record
                    .relationships
                    .values()
                    .filter(|r| {
                        r.members().contains(&handle) || r.canonical_members().contains(&handle)
                    })
                    .map(move |r| (record.handle(), r.key().clone()))
            })
            .collect();

        for (other, key) in holders {
            let record = self.identity.get_mut(other)?;
            let Some(relationship) = record.relationships.get_mut(&key) else {
                continue;
            };
            let changed = if key.is_implicit() || !relationship.meta().is_async {
                relationship.remove_completely(handle)
            } else {
                relationship.remove_local(handle)
            };
            if changed {
                self.run_loop.record_changed(other);
            }
        }
        Ok(())
    }

    /// Destroy every fully unloaded component reachable from `candidates`.
    pub(super) fn sweep_orphans(&mut self, candidates: &[Handle]) -> Vec<Handle> {
        let mut destroyed = Vec::new();
        if candidates.is_empty() {
            return destroyed;
        }
        let referrers = self.referrers();
        for &start in candidates {
            if !self.identity.exists(start) {
                continue;
            }
            if let Some(component) = self.unloaded_component(start, &referrers) {
                for handle in component {
                    self.destroy_record(handle);
                    destroyed.push(handle);
                }
            }
        }
        destroyed
    }

    /// Reverse edges: which records hold each handle in a relationship.
    fn referrers(&self) -> HashMap<Handle, Vec<Handle>> {
        let mut referrers: HashMap<Handle, Vec<Handle>> = HashMap::new();
        for record in self.identity.iter() {
            for linked in record.linked_handles() {
                referrers.entry(linked).or_default().push(record.handle());
            }
        }
        referrers
    }

    /// Records linked to `start` in either direction, or `None` if any of
    /// them is still live.
    fn unloaded_component(
        &self,
        start: Handle,
        referrers: &HashMap<Handle, Vec<Handle>>,
    ) -> Option<Vec<Handle>> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut component = Vec::new();

        while let Some(handle) = queue.pop_front() {
            let Ok(record) = self.identity.get(handle) else {
                continue;
            };
            if !record.unloaded && !record.is_empty() {
                return None;
            }
            component.push(handle);
            let incoming = referrers.get(&handle).into_iter().flatten().copied();
            for linked in record.linked_handles().into_iter().chain(incoming) {
                if seen.insert(linked) {
                    queue.push_back(linked);
                }
            }
        }
        Some(component)
    }

    fn destroy_record(&mut self, handle: Handle) {
        let Some(record) = self.identity.remove(handle) else {
            return;
        };
        if let Some(id) = record.id() {
            let identifier = ResourceIdentifier::new(record.model_name(), id);
            for meta in self.schema.relationships(record.model_name()) {
                self.payloads.unload(&self.schema, &identifier, &meta.name);
            }
        }
        self.holders.remove(&handle);
        self.run_loop.forget(handle);
        tracing::debug!(record = %record.label(), "record destroyed");
    }
}
