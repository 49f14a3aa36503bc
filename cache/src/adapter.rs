//! Adapter and serializer contracts.
//!
//! An [`Adapter`] talks to the backend and returns raw payloads; a
//! [`Serializer`] turns those payloads into validated [`Document`]s. Both are
//! supplied by the application. The cache only ever sees normalized documents.

use crate::document::{Document, ErrorObject};
use crate::record::Attributes;
use crate::schema::RelationshipMeta;
use crate::snapshot::Snapshot;
use crate::{error::Result, Schema};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure reported by an adapter.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdapterError {
    /// The backend has no such record
    #[error("record not found")]
    NotFound,

    /// The backend rejected a save with per-field errors
    #[error("record is invalid ({} errors)", .0.len())]
    Invalid(Vec<ErrorObject>),

    /// Anything else: network, server, or protocol failures
    #[error("transport error: {0}")]
    Transport(String),
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Kind of request a payload answers, passed to the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestType {
    FindRecord,
    FindMany,
    FindAll,
    Query,
    QueryRecord,
    FindHasMany,
    FindBelongsTo,
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
}

impl RequestType {
    /// Whether the primary data of the response is expected to be an array.
    pub fn expects_many(self) -> bool {
        matches!(
            self,
            RequestType::FindMany
                | RequestType::FindAll
                | RequestType::Query
                | RequestType::FindHasMany
        )
    }
}

/// Backend access for one application.
///
/// Every method returns a raw payload; the cache normalizes it with its
/// [`Serializer`]. Reload policy hooks and the find-many grouping strategy
/// have conventional defaults.
#[async_trait(?Send)]
pub trait Adapter {
    async fn find_record(&self, model: &str, id: &str, snapshot: &Snapshot) -> AdapterResult<Value>;

    /// Fetch several records of one type in one request. Only called with
    /// groups of two or more.
    async fn find_many(
        &self,
        model: &str,
        ids: &[String],
        snapshots: &[Snapshot],
    ) -> AdapterResult<Value> {
        let _ = (ids, snapshots);
        Err(AdapterError::Transport(format!(
            "adapter does not implement find_many for '{model}'"
        )))
    }

    async fn find_all(&self, model: &str) -> AdapterResult<Value>;

    async fn query(&self, model: &str, query: &Value) -> AdapterResult<Value>;

    async fn query_record(&self, model: &str, query: &Value) -> AdapterResult<Value>;

    /// Follow a to-many relationship's related link.
    async fn find_has_many(
        &self,
        snapshot: &Snapshot,
        link: &str,
        relationship: &RelationshipMeta,
    ) -> AdapterResult<Value>;

    /// Follow a to-one relationship's related link.
    async fn find_belongs_to(
        &self,
        snapshot: &Snapshot,
        link: &str,
        relationship: &RelationshipMeta,
    ) -> AdapterResult<Value>;

    /// Persist a new record. `None` acknowledges without a payload.
    async fn create_record(&self, model: &str, snapshot: &Snapshot) -> AdapterResult<Option<Value>>;

    async fn update_record(&self, model: &str, snapshot: &Snapshot) -> AdapterResult<Option<Value>>;

    async fn delete_record(&self, model: &str, snapshot: &Snapshot) -> AdapterResult<Option<Value>>;

    /// Partition coalesced single-record fetches into batches. Groups of one
    /// go through [`find_record`](Self::find_record), larger groups through
    /// [`find_many`](Self::find_many).
    fn group_records_for_find_many(&self, snapshots: Vec<Snapshot>) -> Vec<Vec<Snapshot>> {
        vec![snapshots]
    }

    /// Block `find_record` on a fresh fetch even though the record is loaded.
    fn should_reload_record(&self, snapshot: &Snapshot) -> bool {
        let _ = snapshot;
        false
    }

    /// Refresh a loaded record in the background after `find_record`.
    fn should_background_reload_record(&self, snapshot: &Snapshot) -> bool {
        let _ = snapshot;
        true
    }

    /// Block `find_all` on a fresh fetch. By default only when nothing of
    /// the type is loaded yet.
    fn should_reload_all(&self, model: &str, loaded: usize) -> bool {
        let _ = model;
        loaded == 0
    }

    fn should_background_reload_all(&self, model: &str, loaded: usize) -> bool {
        let _ = (model, loaded);
        true
    }

    /// Client-side id for a new record, if the adapter generates them.
    fn generate_id_for_record(&self, model: &str, attributes: &Attributes) -> Option<String> {
        let _ = (model, attributes);
        None
    }
}

/// Turns adapter payloads into documents.
pub trait Serializer {
    fn normalize_response(
        &self,
        schema: &Schema,
        model: &str,
        payload: &Value,
        id: Option<&str>,
        request: RequestType,
    ) -> Result<Document>;
}

/// Serializer for adapters that already return canonical documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSerializer;

impl Serializer for PassthroughSerializer {
    fn normalize_response(
        &self,
        schema: &Schema,
        _model: &str,
        payload: &Value,
        _id: Option<&str>,
        _request: RequestType,
    ) -> Result<Document> {
        Document::from_value(payload, schema)
    }
}
