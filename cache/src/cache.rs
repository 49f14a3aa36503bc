//! Cache - the async façade.
//!
//! [`Cache`] wraps a [`Store`] together with an [`Adapter`] and a
//! [`Serializer`]. Requests made in the same tick are queued and dispatched
//! together by [`Cache::settle`]: single-record fetches are coalesced into
//! batches, commits are sent as independent adapter calls, and results are
//! applied in completion order before the store's tick runs.
//!
//! Everything runs on one thread. The store is borrowed only between
//! awaits, never across one.

use crate::adapter::{
    Adapter, AdapterError, AdapterResult, PassthroughSerializer, RequestType, Serializer,
};
use crate::document::{Document, PrimaryData};
use crate::operation::SaveOperation;
use crate::record::Attributes;
use crate::record_array::{ArrayId, ArrayKind};
use crate::relationship::FieldKey;
use crate::runloop::TickReport;
use crate::schema::RelationshipKind;
use crate::snapshot::Snapshot;
use crate::store::{Pushed, SaveOutcome, Store};
use crate::{error::Result, Error, Handle, ModelName};
use futures::future::{join_all, LocalBoxFuture, Shared};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::oneshot;

/// Pending result of a record fetch, shared by every caller waiting on it.
pub type PendingFetch = Shared<LocalBoxFuture<'static, Result<Handle>>>;

struct FetchRequest {
    handle: Handle,
    resolver: oneshot::Sender<Result<Handle>>,
}

struct FetchBatch {
    model: ModelName,
    entries: Vec<(FetchRequest, Snapshot)>,
}

struct CommitRequest {
    handle: Handle,
    snapshot: Snapshot,
    resolver: oneshot::Sender<Result<()>>,
}

/// Work queued for the next settle.
#[derive(Default)]
struct Queues {
    fetches: Vec<FetchRequest>,
    /// Memoized fetches by record, until they resolve
    in_flight: HashMap<Handle, PendingFetch>,
    commits: Vec<CommitRequest>,
    /// Types with a background `find_all` pending
    background_all: IndexSet<ModelName>,
    /// Ticks run since the last `take_events`
    report: TickReport,
}

impl Queues {
    fn is_empty(&self) -> bool {
        self.fetches.is_empty() && self.commits.is_empty() && self.background_all.is_empty()
    }
}

fn request_type(operation: SaveOperation) -> RequestType {
    match operation {
        SaveOperation::CreateRecord => RequestType::CreateRecord,
        SaveOperation::UpdateRecord => RequestType::UpdateRecord,
        SaveOperation::DeleteRecord => RequestType::DeleteRecord,
    }
}

/// Async entry point: a store plus the collaborators that fill it.
pub struct Cache<A, S = PassthroughSerializer> {
    store: RefCell<Store>,
    adapter: A,
    serializer: S,
    queues: RefCell<Queues>,
}

impl<A: Adapter> Cache<A> {
    pub fn new(store: Store, adapter: A) -> Self {
        Self::with_serializer(store, adapter, PassthroughSerializer)
    }
}

impl<A: Adapter, S: Serializer> Cache<A, S> {
    pub fn with_serializer(store: Store, adapter: A, serializer: S) -> Self {
        Self {
            store: RefCell::new(store),
            adapter,
            serializer,
            queues: RefCell::new(Queues::default()),
        }
    }

    /// Read access to the store. Do not hold the guard across an await.
    pub fn store(&self) -> Ref<'_, Store> {
        self.store.borrow()
    }

    /// Run synchronous store operations.
    pub fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> T) -> T {
        f(&mut self.store.borrow_mut())
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Everything the ticks since the last call delivered.
    pub fn take_events(&self) -> TickReport {
        std::mem::take(&mut self.queues.borrow_mut().report)
    }

    /// Whether requests are waiting for the next settle.
    pub fn has_queued_work(&self) -> bool {
        !self.queues.borrow().is_empty()
    }

    fn tick(&self) -> TickReport {
        let report = self.store.borrow_mut().flush();
        self.queues.borrow_mut().report.merge(report.clone());
        report
    }

    fn normalize(
        &self,
        model: &str,
        payload: &Value,
        id: Option<&str>,
        request: RequestType,
    ) -> Result<Document> {
        let store = self.store.borrow();
        self.serializer
            .normalize_response(store.schema(), model, payload, id, request)
    }

    /// Let requests made in the same tick queue up, settle, then wait.
    async fn drive<F: Future>(&self, pending: F) -> F::Output {
        tokio::task::yield_now().await;
        if self.has_queued_work() {
            self.settle().await;
        }
        pending.await
    }

    // ==================== Records ====================

    /// Push a document into the store.
    pub fn push(&self, document: &Value) -> Result<Pushed> {
        self.store.borrow_mut().push(document)
    }

    /// Create a record locally, with an adapter-generated id if there is one.
    pub fn create_record(&self, model: &str, attributes: Attributes) -> Result<Handle> {
        let id = self.adapter.generate_id_for_record(model, &attributes);
        self.store
            .borrow_mut()
            .create_record(model, id.as_deref(), attributes)
    }

    /// Find a record by type and id.
    ///
    /// Loaded records resolve immediately unless the adapter asks for a
    /// blocking reload; a background reload is queued for the next settle.
    pub async fn find_record(&self, model: &str, id: &str) -> Result<Handle> {
        let (handle, snapshot) = {
            let mut store = self.store.borrow_mut();
            let handle = store.resolve(model, id)?;
            let record = store.record(handle)?;
            let needs_fetch = record.is_empty() || record.flags().is_loading;
            let is_new = record.is_new();
            if needs_fetch {
                (handle, None)
            } else if is_new {
                return Ok(handle);
            } else {
                (handle, Some(store.snapshot(handle)?))
            }
        };

        let Some(snapshot) = snapshot else {
            return self.fetch_record(handle).await;
        };
        if self.adapter.should_reload_record(&snapshot) {
            return self.fetch_record(handle).await;
        }
        if self.adapter.should_background_reload_record(&snapshot) {
            // resolved through the in-flight map; nobody waits on it here
            let _background = self.schedule_fetch(handle)?;
        }
        Ok(handle)
    }

    /// Fetch a record, joining a fetch already pending for it.
    pub async fn fetch_record(&self, handle: Handle) -> Result<Handle> {
        let pending = self.schedule_fetch(handle)?;
        self.drive(pending).await
    }

    /// Fetch a loaded record again.
    pub async fn reload(&self, handle: Handle) -> Result<Handle> {
        self.fetch_record(handle).await
    }

    /// Queue a fetch for the next settle and return its shared result.
    pub fn schedule_fetch(&self, handle: Handle) -> Result<PendingFetch> {
        if let Some(pending) = self.queues.borrow().in_flight.get(&handle) {
            return Ok(pending.clone());
        }
        {
            let mut store = self.store.borrow_mut();
            let record = store.record(handle)?;
            if record.id().is_none() {
                return Err(Error::MissingId {
                    model: record.model_name().to_string(),
                });
            }
            if record.is_empty() {
                store.start_loading(handle)?;
            } else {
                store.start_reloading(handle)?;
            }
        }

        let (resolver, receiver) = oneshot::channel();
        let pending = receiver
            .map(|result| result.unwrap_or(Err(Error::Cancelled)))
            .boxed_local()
            .shared();
        let mut queues = self.queues.borrow_mut();
        queues.fetches.push(FetchRequest { handle, resolver });
        queues.in_flight.insert(handle, pending.clone());
        Ok(pending)
    }

    /// Every record of a type.
    ///
    /// Blocks on the adapter only when the reload policy asks for it;
    /// otherwise the live array is returned and refreshed in the background.
    pub async fn find_all(&self, model: &str) -> Result<ArrayId> {
        let (array, loaded) = {
            let mut store = self.store.borrow_mut();
            let array = store.peek_all(model)?;
            (array, store.array(array).map_or(0, |a| a.len()))
        };
        if self.adapter.should_reload_all(model, loaded) {
            self.fetch_all(model).await?;
            self.tick();
        } else if self.adapter.should_background_reload_all(model, loaded) {
            self.store.borrow_mut().arrays_mut().set_updating(array, true);
            self.queues.borrow_mut().background_all.insert(model.to_string());
        }
        Ok(array)
    }

    async fn fetch_all(&self, model: &str) -> Result<()> {
        let array = {
            let mut store = self.store.borrow_mut();
            let array = store.peek_all(model)?;
            store.arrays_mut().set_updating(array, true);
            array
        };
        let result = self.adapter.find_all(model).await;
        let loaded = self.load_collection(model, result, RequestType::FindAll);
        self.store.borrow_mut().arrays_mut().set_updating(array, false);
        loaded.map(|_| ())
    }

    fn load_collection(
        &self,
        model: &str,
        result: AdapterResult<Value>,
        request: RequestType,
    ) -> Result<(Vec<Handle>, Document)> {
        let payload = result?;
        let document = self.normalize(model, &payload, None, request)?;
        let mut store = self.store.borrow_mut();
        let pushed = store.push_document(&document)?;
        if let Some(meta) = &document.meta {
            store.set_metadata(model, meta.clone());
        }
        Ok((pushed.handles(), document))
    }

    /// Run a query into a new adapter-populated array.
    pub async fn query(&self, model: &str, query: Value) -> Result<ArrayId> {
        let array = {
            let mut store = self.store.borrow_mut();
            store.schema().require_model(model)?;
            store
                .arrays_mut()
                .create_adapter_populated(model, Some(query.clone()))
        };
        self.run_query(array, model, &query).await?;
        Ok(array)
    }

    /// Run an array's query again, replacing its content.
    pub async fn update_query(&self, array: ArrayId) -> Result<()> {
        let (model, query) = {
            let store = self.store.borrow();
            match store.array(array).map(|a| (a.model_name().to_string(), a.kind().clone())) {
                Some((model, ArrayKind::AdapterPopulated { query: Some(query) })) => (model, query),
                _ => return Err(Error::UnknownArray(array)),
            }
        };
        self.run_query(array, &model, &query).await
    }

    async fn run_query(&self, array: ArrayId, model: &str, query: &Value) -> Result<()> {
        self.store.borrow_mut().arrays_mut().set_updating(array, true);
        let result = self.adapter.query(model, query).await;
        let loaded = self.load_collection(model, result, RequestType::Query);
        {
            let mut store = self.store.borrow_mut();
            match loaded {
                Ok((handles, document)) => {
                    store
                        .arrays_mut()
                        .load(array, &handles, document.meta, document.links);
                }
                Err(error) => {
                    store.arrays_mut().set_updating(array, false);
                    return Err(error);
                }
            }
        }
        self.tick();
        Ok(())
    }

    /// Run a query expected to return at most one record.
    pub async fn query_record(&self, model: &str, query: Value) -> Result<Option<Handle>> {
        self.store.borrow().schema().require_model(model)?;
        let payload = self.adapter.query_record(model, &query).await?;
        let document = self.normalize(model, &payload, None, RequestType::QueryRecord)?;
        if matches!(document.data, Some(PrimaryData::Many(_))) {
            return Err(Error::InvalidDocument(
                "query_record expects a single resource or null".into(),
            ));
        }
        let pushed = self.store.borrow_mut().push_document(&document)?;
        self.tick();
        Ok(pushed.single())
    }

    // ==================== Relationships ====================

    /// Load a to-one relationship, following its link or fetching the
    /// related record.
    pub async fn load_belongs_to(&self, handle: Handle, name: &str) -> Result<Option<Handle>> {
        let related = self
            .load_relationship(handle, name, RelationshipKind::BelongsTo, false)
            .await?;
        Ok(related.into_iter().next())
    }

    /// Load a to-many relationship, following its link or fetching the
    /// members that are not loaded.
    pub async fn load_has_many(&self, handle: Handle, name: &str) -> Result<Vec<Handle>> {
        self.load_relationship(handle, name, RelationshipKind::HasMany, false)
            .await
    }

    /// Fetch a to-many relationship again.
    pub async fn reload_has_many(&self, handle: Handle, name: &str) -> Result<Vec<Handle>> {
        self.load_relationship(handle, name, RelationshipKind::HasMany, true)
            .await
    }

    async fn load_relationship(
        &self,
        handle: Handle,
        name: &str,
        kind: RelationshipKind,
        reload: bool,
    ) -> Result<Vec<Handle>> {
        let (link, to_fetch, meta) = {
            let mut store = self.store.borrow_mut();
            store.check_kind(handle, name, kind)?;
            let relationship = store.relationship(handle, name)?;
            let link = relationship
                .link()
                .filter(|_| reload || !relationship.has_loaded())
                .map(String::from);
            let meta = relationship.meta().clone();
            let members = relationship.values();
            let to_fetch: Vec<Handle> = members
                .into_iter()
                .filter(|h| {
                    store.record(*h).is_ok_and(|record| {
                        record.id().is_some()
                            && if reload { !record.is_new() } else { record.is_empty() }
                    })
                })
                .collect();
            (link, to_fetch, meta)
        };

        if let Some(link) = link {
            let snapshot = self.store.borrow_mut().snapshot(handle)?;
            let (result, request) = match kind {
                RelationshipKind::HasMany => (
                    self.adapter.find_has_many(&snapshot, &link, &meta).await,
                    RequestType::FindHasMany,
                ),
                RelationshipKind::BelongsTo => (
                    self.adapter.find_belongs_to(&snapshot, &link, &meta).await,
                    RequestType::FindBelongsTo,
                ),
            };
            let document = self.normalize(&meta.related_type, &result?, None, request)?;
            {
                let mut store = self.store.borrow_mut();
                let pushed = store.push_document(&document)?.handles();
                store.apply_link_result(handle, &FieldKey::declared(name), &pushed)?;
            }
            self.tick();
        } else if !to_fetch.is_empty() {
            let pending = to_fetch
                .into_iter()
                .map(|h| self.schedule_fetch(h))
                .collect::<Result<Vec<_>>>()?;
            for result in self.drive(join_all(pending)).await {
                result?;
            }
        }

        Ok(self.store.borrow_mut().relationship(handle, name)?.values())
    }

    // ==================== Saving ====================

    /// Persist a record's pending changes.
    pub async fn save(&self, handle: Handle) -> Result<()> {
        let snapshot = self.store.borrow_mut().will_commit(handle)?;
        let (resolver, receiver) = oneshot::channel();
        self.queues.borrow_mut().commits.push(CommitRequest {
            handle,
            snapshot,
            resolver,
        });
        self.drive(receiver.map(|result| result.unwrap_or(Err(Error::Cancelled))))
            .await
    }

    /// Delete a record and persist the deletion.
    pub async fn destroy_record(&self, handle: Handle) -> Result<()> {
        self.store.borrow_mut().delete_record(handle)?;
        self.save(handle).await
    }

    // ==================== Settle ====================

    /// Dispatch everything queued, apply results as they complete, then run
    /// the store's tick.
    pub async fn settle(&self) -> TickReport {
        let (fetches, commits, background_all) = {
            let mut queues = self.queues.borrow_mut();
            (
                std::mem::take(&mut queues.fetches),
                std::mem::take(&mut queues.commits),
                std::mem::take(&mut queues.background_all),
            )
        };

        let mut work: FuturesUnordered<LocalBoxFuture<'_, ()>> = FuturesUnordered::new();
        for batch in self.batch_fetches(fetches) {
            work.push(self.run_fetch_batch(batch).boxed_local());
        }
        for commit in commits {
            work.push(self.run_commit(commit).boxed_local());
        }
        for model in background_all {
            work.push(
                async move {
                    if let Err(error) = self.fetch_all(&model).await {
                        tracing::warn!(
                            model = %model,
                            error = %error,
                            "background find_all failed"
                        );
                    }
                }
                .boxed_local(),
            );
        }

        if !work.is_empty() {
            tracing::debug!(requests = work.len(), "settling queued requests");
        }
        while work.next().await.is_some() {}
        self.tick()
    }

    /// Group queued fetches by type, then by the adapter's strategy.
    fn batch_fetches(&self, fetches: Vec<FetchRequest>) -> Vec<FetchBatch> {
        let mut by_model: IndexMap<ModelName, Vec<(FetchRequest, Snapshot)>> = IndexMap::new();
        let (coalesce, max_find_many) = {
            let mut store = self.store.borrow_mut();
            let config = store.config();
            let settings = (config.coalesce_find_requests, config.max_find_many);
            for request in fetches {
                match store.snapshot(request.handle) {
                    Ok(snapshot) => by_model
                        .entry(snapshot.model.clone())
                        .or_default()
                        .push((request, snapshot)),
                    Err(error) => {
                        self.queues.borrow_mut().in_flight.remove(&request.handle);
                        let _ = request.resolver.send(Err(error));
                    }
                }
            }
            settings
        };

        let mut batches = Vec::new();
        for (model, entries) in by_model {
            if !coalesce || entries.len() == 1 {
                batches.extend(entries.into_iter().map(|entry| FetchBatch {
                    model: model.clone(),
                    entries: vec![entry],
                }));
                continue;
            }

            let mut by_handle: IndexMap<Handle, (FetchRequest, Snapshot)> =
                entries.into_iter().map(|entry| (entry.0.handle, entry)).collect();
            let snapshots = by_handle.values().map(|(_, s)| s.clone()).collect();
            for group in self.adapter.group_records_for_find_many(snapshots) {
                let mut entries: Vec<_> = group
                    .iter()
                    .filter_map(|snapshot| by_handle.shift_remove(&snapshot.handle))
                    .collect();
                let size = max_find_many.unwrap_or(entries.len()).max(1);
                while !entries.is_empty() {
                    let rest = entries.split_off(size.min(entries.len()));
                    batches.push(FetchBatch {
                        model: model.clone(),
                        entries,
                    });
                    entries = rest;
                }
            }
            // anything the grouping left out is fetched on its own
            batches.extend(by_handle.into_values().map(|entry| FetchBatch {
                model: model.clone(),
                entries: vec![entry],
            }));
        }
        batches
    }

    async fn run_fetch_batch(&self, batch: FetchBatch) {
        let FetchBatch { model, entries } = batch;
        let (requests, snapshots): (Vec<FetchRequest>, Vec<Snapshot>) = entries.into_iter().unzip();

        if let [snapshot] = snapshots.as_slice() {
            let id = snapshot.id.clone().unwrap_or_default();
            let result = self.adapter.find_record(&model, &id, snapshot).await;
            self.apply_fetch(&model, Some(&id), RequestType::FindRecord, result, requests);
        } else {
            let ids: Vec<String> = snapshots.iter().filter_map(|s| s.id.clone()).collect();
            tracing::debug!(model = %model, ids = ?ids, "coalesced find_many");
            let result = self.adapter.find_many(&model, &ids, &snapshots).await;
            self.apply_fetch(&model, None, RequestType::FindMany, result, requests);
        }
    }

    /// Push a fetch response and resolve each waiting caller. Callers whose
    /// record is absent from the response are rejected on their own.
    fn apply_fetch(
        &self,
        model: &str,
        id: Option<&str>,
        request: RequestType,
        result: AdapterResult<Value>,
        requests: Vec<FetchRequest>,
    ) {
        let payload = match result {
            Ok(payload) => payload,
            Err(error) => {
                for pending in requests {
                    self.fail_fetch(pending, &error, Error::Adapter(error.clone()));
                }
                return;
            }
        };

        let pushed = self
            .normalize(model, &payload, id, request)
            .and_then(|document| self.store.borrow_mut().push_document(&document));
        let pushed = match pushed {
            Ok(pushed) => pushed.handles(),
            Err(error) => {
                let cause = AdapterError::Transport(error.to_string());
                for pending in requests {
                    self.fail_fetch(pending, &cause, error.clone());
                }
                return;
            }
        };

        for pending in requests {
            if pushed.contains(&pending.handle) {
                self.store.borrow_mut().finish_reloading(pending.handle);
                self.finish_fetch(pending, Ok(()));
                continue;
            }
            let (model, id) = {
                let store = self.store.borrow();
                match store.record(pending.handle) {
                    Ok(record) => (
                        record.model_name().to_string(),
                        record.id().unwrap_or_default().to_string(),
                    ),
                    Err(_) => (model.to_string(), String::new()),
                }
            };
            tracing::warn!(model = %model, id = %id, "record missing from adapter response");
            let error = Error::MissingFromResponse { model, id };
            self.fail_fetch(pending, &AdapterError::NotFound, error);
        }
    }

    fn fail_fetch(&self, pending: FetchRequest, cause: &AdapterError, error: Error) {
        if let Err(cleanup) = self
            .store
            .borrow_mut()
            .record_fetch_failed(pending.handle, cause)
        {
            tracing::warn!(
                record = %pending.handle,
                error = %cleanup,
                "could not reset record after failed fetch"
            );
        }
        self.finish_fetch(pending, Err(error));
    }

    fn finish_fetch(&self, pending: FetchRequest, result: Result<()>) {
        let handle = pending.handle;
        self.queues.borrow_mut().in_flight.remove(&handle);
        let _ = pending.resolver.send(result.map(|_| handle));
    }

    async fn run_commit(&self, commit: CommitRequest) {
        let CommitRequest {
            handle,
            snapshot,
            resolver,
        } = commit;

        let operation = self.store.borrow().commit_operation(handle);
        let operation = match operation {
            Ok(Some(operation)) => operation,
            Ok(None) => {
                let _ = resolver.send(Ok(()));
                return;
            }
            Err(error) => {
                let _ = resolver.send(Err(error));
                return;
            }
        };

        let model = snapshot.model.clone();
        tracing::debug!(record = %handle, operation = %operation, "dispatching commit");
        let result = match operation {
            SaveOperation::CreateRecord => self.adapter.create_record(&model, &snapshot).await,
            SaveOperation::UpdateRecord => self.adapter.update_record(&model, &snapshot).await,
            SaveOperation::DeleteRecord => self.adapter.delete_record(&model, &snapshot).await,
        };

        let outcome = match result {
            Ok(None) => Ok(SaveOutcome::Saved(None)),
            Ok(Some(payload)) => self
                .normalize(&model, &payload, snapshot.id.as_deref(), request_type(operation))
                .map(|document| SaveOutcome::Saved(Some(document))),
            Err(AdapterError::Invalid(errors)) => Ok(SaveOutcome::Invalid(errors)),
            Err(error) => Ok(SaveOutcome::Failed(error)),
        };

        let reply = match outcome {
            Ok(outcome) => {
                let reply = match &outcome {
                    SaveOutcome::Saved(_) => Ok(()),
                    SaveOutcome::Invalid(errors) => {
                        Err(Error::Adapter(AdapterError::Invalid(errors.clone())))
                    }
                    SaveOutcome::Failed(error) => Err(Error::Adapter(error.clone())),
                };
                self.store
                    .borrow_mut()
                    .complete_save(handle, outcome)
                    .and(reply)
            }
            Err(error) => {
                let cause = AdapterError::Transport(error.to_string());
                if let Err(cleanup) = self.store.borrow_mut().record_was_error(handle, &cause) {
                    tracing::warn!(
                        record = %handle,
                        error = %cleanup,
                        "could not reset record after failed commit"
                    );
                }
                Err(error)
            }
        };
        let _ = resolver.send(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ModelSchema;
    use crate::schema::RelationshipMeta;
    use crate::Schema;
    use async_trait::async_trait;

    /// Adapter whose backend is always empty.
    struct EmptyBackend;

    #[async_trait(?Send)]
    impl Adapter for EmptyBackend {
        async fn find_record(&self, _: &str, _: &str, _: &Snapshot) -> AdapterResult<Value> {
            Err(AdapterError::NotFound)
        }
        async fn find_all(&self, _: &str) -> AdapterResult<Value> {
            Ok(serde_json::json!({"data": []}))
        }
        async fn query(&self, _: &str, _: &Value) -> AdapterResult<Value> {
            Ok(serde_json::json!({"data": []}))
        }
        async fn query_record(&self, _: &str, _: &Value) -> AdapterResult<Value> {
            Ok(serde_json::json!({"data": null}))
        }
        async fn find_has_many(
            &self,
            _: &Snapshot,
            _: &str,
            _: &RelationshipMeta,
        ) -> AdapterResult<Value> {
            Ok(serde_json::json!({"data": []}))
        }
        async fn find_belongs_to(
            &self,
            _: &Snapshot,
            _: &str,
            _: &RelationshipMeta,
        ) -> AdapterResult<Value> {
            Ok(serde_json::json!({"data": null}))
        }
        async fn create_record(&self, _: &str, _: &Snapshot) -> AdapterResult<Option<Value>> {
            Err(AdapterError::Transport("read-only".into()))
        }
        async fn update_record(&self, _: &str, _: &Snapshot) -> AdapterResult<Option<Value>> {
            Err(AdapterError::Transport("read-only".into()))
        }
        async fn delete_record(&self, _: &str, _: &Snapshot) -> AdapterResult<Option<Value>> {
            Err(AdapterError::Transport("read-only".into()))
        }
    }

    fn cache() -> Cache<EmptyBackend> {
        let schema = Schema::new().with_model(ModelSchema::new("post").attribute("title"));
        Cache::new(Store::new(schema).unwrap(), EmptyBackend)
    }

    #[tokio::test]
    async fn settle_with_nothing_queued() {
        let cache = cache();
        assert!(!cache.has_queued_work());
        assert!(cache.settle().await.is_empty());
    }

    #[tokio::test]
    async fn not_found_cleans_up_the_record() {
        let cache = cache();
        let err = cache.find_record("post", "1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(cache.store().identity().lookup("post", "1").is_none());
    }

    #[tokio::test]
    async fn empty_find_all_and_query() {
        let cache = cache();
        let all = cache.find_all("post").await.unwrap();
        assert!(cache.store().array(all).unwrap().is_empty());

        let found = cache
            .query_record("post", serde_json::json!({"title": "A"}))
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn failed_save_surfaces_adapter_error() {
        let cache = cache();
        let post = cache.create_record("post", Attributes::new()).unwrap();
        let err = cache.save(post).await.unwrap_err();
        assert_eq!(err, Error::Adapter(AdapterError::Transport("read-only".into())));
        assert!(cache.store().flags(post).unwrap().is_error);
    }
}
