//! Identity map: at most one internal model per (type, id).
//!
//! Records live in an arena addressed by [`Handle`]s. Handles are stable for
//! the lifetime of the record and are never reused, so relationship edges can
//! be stored as plain handle pairs.

use crate::record::InternalModel;
use crate::{error::Result, Error, ModelName};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable reference to a record in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub(crate) u64);

impl Handle {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coerce a JSON id into its canonical string form.
///
/// Numbers and strings with the same text are the same id. `null`, empty
/// strings and anything else mean "no id yet".
pub fn coerce_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => coerce_id_str(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalize a textual id; empty strings mean "no id yet".
pub fn coerce_id_str(id: &str) -> Option<String> {
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[derive(Debug, Default)]
struct TypeTable {
    by_id: HashMap<String, Handle>,
    /// Every handle of this type, with or without id, in creation order
    handles: IndexSet<Handle>,
    metadata: Option<serde_json::Value>,
}

/// Per-type tables mapping id to handle, plus the arena that owns the models.
#[derive(Debug, Default)]
pub struct IdentityMap {
    records: HashMap<Handle, InternalModel>,
    types: HashMap<ModelName, TypeTable>,
    next_handle: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self, model: &str, id: Option<String>) -> Handle {
        self.next_handle += 1;
        let handle = Handle(self.next_handle);
        let table = self.types.entry(model.to_string()).or_default();
        if let Some(id) = &id {
            table.by_id.insert(id.clone(), handle);
        }
        table.handles.insert(handle);
        self.records
            .insert(handle, InternalModel::new(handle, model.to_string(), id));
        handle
    }

    /// Return the handle for (type, id), creating an empty record if needed.
    pub fn resolve(&mut self, model: &str, id: &str) -> Handle {
        if let Some(handle) = self.lookup(model, id) {
            return handle;
        }
        tracing::trace!(model = %model, id = %id, "identity map miss, creating empty record");
        self.allocate(model, Some(id.to_string()))
    }

    /// Register a locally created record. An id that is already taken is a
    /// programmer error, distinct from a normal cache hit.
    pub fn insert_new(&mut self, model: &str, id: Option<String>) -> Result<Handle> {
        if let Some(id) = &id {
            if self.contains(model, id) {
                return Err(Error::DuplicateId {
                    model: model.to_string(),
                    id: id.clone(),
                });
            }
        }
        Ok(self.allocate(model, id))
    }

    /// Assign an id to a record, typically after the backend created it.
    pub fn set_id(&mut self, handle: Handle, id: &str) -> Result<()> {
        let record = self
            .records
            .get(&handle)
            .ok_or(Error::RecordDestroyed(handle))?;
        let model = record.model_name().to_string();

        match record.id() {
            Some(current) if current == id => return Ok(()),
            Some(current) => {
                return Err(Error::IdReassignment {
                    model,
                    current: current.to_string(),
                    requested: id.to_string(),
                })
            }
            None => {}
        }

        if let Some(existing) = self.lookup(&model, id) {
            if existing != handle {
                return Err(Error::IdConflict {
                    model,
                    id: id.to_string(),
                    handle,
                });
            }
        }

        self.types
            .entry(model)
            .or_default()
            .by_id
            .insert(id.to_string(), handle);
        if let Some(record) = self.records.get_mut(&handle) {
            record.assign_id(id.to_string());
        }
        Ok(())
    }

    pub fn lookup(&self, model: &str, id: &str) -> Option<Handle> {
        self.types.get(model)?.by_id.get(id).copied()
    }

    pub fn contains(&self, model: &str, id: &str) -> bool {
        self.lookup(model, id).is_some()
    }

    /// Remove a record from the arena and its type table.
    pub fn remove(&mut self, handle: Handle) -> Option<InternalModel> {
        let record = self.records.remove(&handle)?;
        if let Some(table) = self.types.get_mut(record.model_name()) {
            if let Some(id) = record.id() {
                table.by_id.remove(id);
            }
            table.handles.shift_remove(&handle);
        }
        Some(record)
    }

    pub fn get(&self, handle: Handle) -> Result<&InternalModel> {
        self.records
            .get(&handle)
            .ok_or(Error::RecordDestroyed(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut InternalModel> {
        self.records
            .get_mut(&handle)
            .ok_or(Error::RecordDestroyed(handle))
    }

    pub fn exists(&self, handle: Handle) -> bool {
        self.records.contains_key(&handle)
    }

    /// Handles of a type in creation order.
    pub fn handles_of(&self, model: &str) -> Vec<Handle> {
        self.types
            .get(model)
            .map(|t| t.handles.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Visit every record of a type in creation order.
    pub fn for_each<F>(&self, model: &str, mut f: F)
    where
        F: FnMut(&InternalModel),
    {
        if let Some(table) = self.types.get(model) {
            for handle in &table.handles {
                if let Some(record) = self.records.get(handle) {
                    f(record);
                }
            }
        }
    }

    /// Every record, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &InternalModel> {
        self.records.values()
    }

    /// Types with at least one record.
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.types
            .iter()
            .filter(|(_, table)| !table.handles.is_empty())
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Metadata from the last `find_all`/`query` response for a type.
    pub fn metadata_for(&self, model: &str) -> Option<&serde_json::Value> {
        self.types.get(model)?.metadata.as_ref()
    }

    pub fn set_metadata(&mut self, model: &str, meta: serde_json::Value) {
        self.types.entry(model.to_string()).or_default().metadata = Some(meta);
    }
}
