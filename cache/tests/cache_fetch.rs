//! Fetch coalescing, save pipeline and relationship loading through the
//! async cache, against an in-memory backend.

use async_trait::async_trait;
use carry_cache::{
    Adapter, AdapterError, AdapterResult, CacheConfig, Cache, Error, ErrorObject, ModelSchema,
    RelationshipDef, RelationshipMeta, Schema, Snapshot, StateId, Store,
};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    FindRecord(String),
    FindMany(Vec<String>),
    FindAll(String),
    Query(Value),
    FindHasMany(String),
    Create,
    Update(String),
    Delete(String),
}

/// In-memory backend that records every call it receives.
#[derive(Default)]
struct MockBackend {
    records: RefCell<HashMap<(String, String), Value>>,
    links: HashMap<String, Value>,
    calls: RefCell<Vec<Call>>,
    /// Ids the adapter groups together for find_many
    groups: Option<Vec<Vec<String>>>,
    /// Ids left out of find_many responses
    omitted: HashSet<String>,
    reject_saves: bool,
}

impl MockBackend {
    fn with_records(records: &[(&str, &str, Value)]) -> Self {
        let backend = Self::default();
        for (model, id, attributes) in records {
            backend.insert(model, id, attributes.clone());
        }
        backend
    }

    fn insert(&self, model: &str, id: &str, attributes: Value) {
        self.records.borrow_mut().insert(
            (model.to_string(), id.to_string()),
            json!({"type": model, "id": id, "attributes": attributes}),
        );
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.borrow().iter().filter(|call| matches(call)).count()
    }

    fn log(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

#[async_trait(?Send)]
impl Adapter for MockBackend {
    async fn find_record(&self, model: &str, id: &str, _: &Snapshot) -> AdapterResult<Value> {
        self.log(Call::FindRecord(id.to_string()));
        match self.records.borrow().get(&(model.to_string(), id.to_string())) {
            Some(resource) => Ok(json!({"data": resource})),
            None => Err(AdapterError::NotFound),
        }
    }

    async fn find_many(&self, model: &str, ids: &[String], _: &[Snapshot]) -> AdapterResult<Value> {
        self.log(Call::FindMany(ids.to_vec()));
        let records = self.records.borrow();
        let data: Vec<Value> = ids
            .iter()
            .filter(|id| !self.omitted.contains(*id))
            .filter_map(|id| records.get(&(model.to_string(), id.clone())).cloned())
            .collect();
        Ok(json!({"data": data}))
    }

    async fn find_all(&self, model: &str) -> AdapterResult<Value> {
        self.log(Call::FindAll(model.to_string()));
        let records = self.records.borrow();
        let mut data: Vec<(&String, &Value)> = records
            .iter()
            .filter(|((m, _), _)| m == model)
            .map(|((_, id), resource)| (id, resource))
            .collect();
        data.sort_by(|a, b| a.0.cmp(b.0));
        let total = data.len();
        let data: Vec<Value> = data.into_iter().map(|(_, r)| r.clone()).collect();
        Ok(json!({"data": data, "meta": {"total": total}}))
    }

    async fn query(&self, model: &str, query: &Value) -> AdapterResult<Value> {
        self.log(Call::Query(query.clone()));
        let filter = query.as_object().cloned().unwrap_or_default();
        let records = self.records.borrow();
        let mut data: Vec<Value> = records
            .iter()
            .filter(|((m, _), _)| m == model)
            .map(|(_, resource)| resource)
            .filter(|resource| {
                filter
                    .iter()
                    .all(|(key, value)| resource["attributes"].get(key) == Some(value))
            })
            .cloned()
            .collect();
        data.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        Ok(json!({"data": data}))
    }

    async fn query_record(&self, model: &str, query: &Value) -> AdapterResult<Value> {
        let many = self.query(model, query).await?;
        Ok(json!({"data": many["data"].get(0).cloned().unwrap_or(Value::Null)}))
    }

    async fn find_has_many(
        &self,
        _: &Snapshot,
        link: &str,
        _: &RelationshipMeta,
    ) -> AdapterResult<Value> {
        self.log(Call::FindHasMany(link.to_string()));
        self.links.get(link).cloned().ok_or(AdapterError::NotFound)
    }

    async fn find_belongs_to(
        &self,
        _: &Snapshot,
        link: &str,
        _: &RelationshipMeta,
    ) -> AdapterResult<Value> {
        self.links.get(link).cloned().ok_or(AdapterError::NotFound)
    }

    async fn create_record(
        &self,
        model: &str,
        snapshot: &Snapshot,
    ) -> AdapterResult<Option<Value>> {
        self.log(Call::Create);
        if self.reject_saves {
            return Err(AdapterError::Invalid(vec![ErrorObject::for_attribute(
                "title",
                "can't be blank",
            )]));
        }
        let id = (self.records.borrow().len() + 100).to_string();
        self.insert(model, &id, Value::Object(snapshot.attributes.clone()));
        Ok(Some(json!({"data": {"type": model, "id": id}})))
    }

    async fn update_record(
        &self,
        model: &str,
        snapshot: &Snapshot,
    ) -> AdapterResult<Option<Value>> {
        let id = snapshot.id.clone().unwrap_or_default();
        self.log(Call::Update(id.clone()));
        if self.reject_saves {
            return Err(AdapterError::Invalid(vec![ErrorObject::for_attribute(
                "title",
                "can't be blank",
            )]));
        }
        self.insert(model, &id, Value::Object(snapshot.attributes.clone()));
        Ok(None)
    }

    async fn delete_record(
        &self,
        model: &str,
        snapshot: &Snapshot,
    ) -> AdapterResult<Option<Value>> {
        let id = snapshot.id.clone().unwrap_or_default();
        self.log(Call::Delete(id.clone()));
        self.records.borrow_mut().remove(&(model.to_string(), id));
        Ok(None)
    }

    fn group_records_for_find_many(&self, snapshots: Vec<Snapshot>) -> Vec<Vec<Snapshot>> {
        let Some(groups) = &self.groups else {
            return vec![snapshots];
        };
        groups
            .iter()
            .map(|ids| {
                snapshots
                    .iter()
                    .filter(|s| s.id.as_ref().is_some_and(|id| ids.contains(id)))
                    .cloned()
                    .collect()
            })
            .collect()
    }
}

fn schema() -> Schema {
    Schema::new()
        .with_model(
            ModelSchema::new("post")
                .attribute("title")
                .relationship(RelationshipDef::has_many("comments", "comment")),
        )
        .with_model(
            ModelSchema::new("comment")
                .attribute("body")
                .relationship(RelationshipDef::belongs_to("post", "post")),
        )
}

fn posts(ids: &[&str]) -> MockBackend {
    let records: Vec<(&str, &str, Value)> = ids
        .iter()
        .map(|id| ("post", *id, json!({"title": format!("Post {}", id)})))
        .collect();
    MockBackend::with_records(&records)
}

fn cache(backend: MockBackend) -> Cache<MockBackend> {
    init_tracing();
    Cache::new(Store::new(schema()).unwrap(), backend)
}

fn cache_with(backend: MockBackend, config: CacheConfig) -> Cache<MockBackend> {
    init_tracing();
    Cache::new(Store::with_config(schema(), config).unwrap(), backend)
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test]
async fn coalescing_follows_adapter_groups() {
    let mut backend = posts(&["a", "b", "c"]);
    backend.groups = Some(vec![vec!["a".into()], vec!["b".into(), "c".into()]]);
    let cache = cache(backend);

    let (a, b, c) = tokio::join!(
        cache.find_record("post", "a"),
        cache.find_record("post", "b"),
        cache.find_record("post", "c"),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    let adapter = cache.adapter();
    assert_eq!(adapter.count(|call| matches!(call, Call::FindMany(_))), 1);
    assert!(adapter.calls().contains(&Call::FindMany(vec!["b".into(), "c".into()])));
    assert_eq!(adapter.calls().iter().filter(|c| **c == Call::FindRecord("a".into())).count(), 1);
    assert_eq!(adapter.calls().len(), 2);

    let store = cache.store();
    for handle in [a, b, c] {
        assert_eq!(store.record(handle).unwrap().state(), StateId::LoadedSaved);
    }
    assert_eq!(store.attribute(b, "title").unwrap(), Some(json!("Post b")));
}

#[tokio::test]
async fn missing_from_batch_rejects_only_that_request() {
    let mut backend = posts(&["1", "2"]);
    backend.omitted.insert("2".into());
    let cache = cache(backend);

    let (found, missing) = tokio::join!(
        cache.find_record("post", "1"),
        cache.find_record("post", "2"),
    );

    let found = found.unwrap();
    assert!(matches!(
        missing.unwrap_err(),
        Error::MissingFromResponse { ref id, .. } if id == "2"
    ));
    assert_eq!(cache.store().peek_record("post", "1"), Some(found));
    assert!(cache.store().identity().lookup("post", "2").is_none());
}

#[tokio::test]
async fn concurrent_requests_share_one_fetch() {
    let cache = cache(posts(&["1"]));

    let (first, second) = tokio::join!(
        cache.find_record("post", "1"),
        cache.find_record("post", "1"),
    );

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(cache.adapter().calls(), vec![Call::FindRecord("1".into())]);
}

#[tokio::test]
async fn max_find_many_splits_batches() {
    let config = CacheConfig {
        max_find_many: Some(2),
        ..CacheConfig::default()
    };
    let cache = cache_with(posts(&["1", "2", "3", "4", "5"]), config);

    let results = futures::future::join_all(
        ["1", "2", "3", "4", "5"]
            .into_iter()
            .map(|id| cache.find_record("post", id)),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));

    let adapter = cache.adapter();
    assert_eq!(adapter.count(|call| matches!(call, Call::FindMany(ids) if ids.len() == 2)), 2);
    assert_eq!(adapter.count(|call| matches!(call, Call::FindRecord(_))), 1);
}

#[tokio::test]
async fn coalescing_can_be_disabled() {
    let config = CacheConfig {
        coalesce_find_requests: false,
        ..CacheConfig::default()
    };
    let cache = cache_with(posts(&["1", "2", "3"]), config);

    let (a, b, c) = tokio::join!(
        cache.find_record("post", "1"),
        cache.find_record("post", "2"),
        cache.find_record("post", "3"),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    let adapter = cache.adapter();
    assert_eq!(adapter.count(|call| matches!(call, Call::FindRecord(_))), 3);
    assert_eq!(adapter.count(|call| matches!(call, Call::FindMany(_))), 0);
}

// ============================================================================
// Loading and Reloading
// ============================================================================

#[tokio::test]
async fn scheduled_fetch_moves_through_loading() {
    let cache = cache(posts(&["1"]));
    let handle = cache.with_store(|store| store.resolve("post", "1")).unwrap();

    let pending = cache.schedule_fetch(handle).unwrap();
    assert!(cache.store().flags(handle).unwrap().state.is_loading);
    assert!(cache.has_queued_work());

    cache.settle().await;
    assert_eq!(pending.await.unwrap(), handle);
    assert_eq!(cache.store().record(handle).unwrap().state(), StateId::LoadedSaved);
}

#[tokio::test]
async fn loaded_record_reloads_in_background() {
    let cache = cache(MockBackend::with_records(&[("post", "1", json!({"title": "B"}))]));
    cache
        .push(&json!({"data": {"type": "post", "id": "1", "attributes": {"title": "A"}}}))
        .unwrap();

    let post = cache.find_record("post", "1").await.unwrap();
    assert_eq!(cache.store().attribute(post, "title").unwrap(), Some(json!("A")));
    assert!(cache.store().flags(post).unwrap().is_reloading);
    assert!(cache.has_queued_work());

    cache.settle().await;
    assert_eq!(cache.store().attribute(post, "title").unwrap(), Some(json!("B")));
    assert!(!cache.store().flags(post).unwrap().is_reloading);
}

#[tokio::test]
async fn failed_reload_keeps_the_record() {
    let cache = cache(MockBackend::default());
    let post = cache
        .push(&json!({"data": {"type": "post", "id": "1", "attributes": {"title": "A"}}}))
        .unwrap()
        .single()
        .unwrap();

    let err = cache.reload(post).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(cache.store().peek_record("post", "1"), Some(post));
    assert!(!cache.store().flags(post).unwrap().is_reloading);
}

#[tokio::test]
async fn find_all_blocks_once_then_refreshes_in_background() {
    let cache = cache(posts(&["1", "2"]));

    let all = cache.find_all("post").await.unwrap();
    assert_eq!(cache.store().array(all).unwrap().len(), 2);
    assert_eq!(cache.store().metadata_for("post"), Some(&json!({"total": 2})));

    cache.adapter().insert("post", "3", json!({"title": "Post 3"}));
    let again = cache.find_all("post").await.unwrap();
    assert_eq!(again, all);
    assert_eq!(cache.store().array(all).unwrap().len(), 2);
    assert!(cache.store().array(all).unwrap().is_updating());

    cache.settle().await;
    assert_eq!(cache.store().array(all).unwrap().len(), 3);
    assert!(!cache.store().array(all).unwrap().is_updating());
    assert_eq!(cache.adapter().count(|call| matches!(call, Call::FindAll(_))), 2);
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn query_and_update_query() {
    let backend = MockBackend::with_records(&[
        ("post", "1", json!({"title": "A", "draft": true})),
        ("post", "2", json!({"title": "B", "draft": false})),
    ]);
    let cache = cache(backend);

    let drafts = cache.query("post", json!({"draft": true})).await.unwrap();
    assert_eq!(cache.store().array(drafts).unwrap().len(), 1);

    cache.adapter().insert("post", "3", json!({"title": "C", "draft": true}));
    cache.update_query(drafts).await.unwrap();
    assert_eq!(cache.store().array(drafts).unwrap().len(), 2);

    let single = cache.query_record("post", json!({"title": "B"})).await.unwrap();
    assert_eq!(single, cache.store().peek_record("post", "2"));
}

#[tokio::test]
async fn update_query_rejects_live_arrays() {
    let cache = cache(MockBackend::default());
    let live = cache.with_store(|store| store.peek_all("post")).unwrap();
    let err = cache.update_query(live).await.unwrap_err();
    assert!(matches!(err, Error::UnknownArray(_)));
}

// ============================================================================
// Saving
// ============================================================================

#[tokio::test]
async fn save_new_record_adopts_server_id() {
    let cache = cache(MockBackend::default());
    let post = cache
        .create_record("post", json!({"title": "Draft"}).as_object().cloned().unwrap())
        .unwrap();

    cache.save(post).await.unwrap();

    let store = cache.store();
    assert_eq!(store.record(post).unwrap().id(), Some("100"));
    assert_eq!(store.peek_record("post", "100"), Some(post));
    assert_eq!(store.record(post).unwrap().state(), StateId::LoadedSaved);
    assert_eq!(store.attribute(post, "title").unwrap(), Some(json!("Draft")));
    assert_eq!(cache.adapter().calls(), vec![Call::Create]);
}

#[tokio::test]
async fn update_sends_changed_snapshot() {
    let cache = cache(MockBackend::default());
    let post = cache
        .push(&json!({"data": {"type": "post", "id": "1", "attributes": {"title": "A"}}}))
        .unwrap()
        .single()
        .unwrap();

    cache
        .with_store(|store| store.set_attribute(post, "title", json!("B")))
        .unwrap();
    cache.save(post).await.unwrap();

    assert_eq!(cache.adapter().calls(), vec![Call::Update("1".into())]);
    assert!(!cache.store().flags(post).unwrap().state.is_dirty);
    let events = cache.take_events();
    assert!(events.events_for(post).contains(&carry_cache::Lifecycle::DidUpdate));
}

#[tokio::test]
async fn rejected_save_keeps_edits() {
    let backend = MockBackend {
        reject_saves: true,
        ..MockBackend::default()
    };
    let cache = cache(backend);
    let post = cache
        .push(&json!({"data": {"type": "post", "id": "1", "attributes": {"title": "A"}}}))
        .unwrap()
        .single()
        .unwrap();
    cache
        .with_store(|store| store.set_attribute(post, "title", json!("")))
        .unwrap();

    let err = cache.save(post).await.unwrap_err();
    assert!(matches!(err, Error::Adapter(AdapterError::Invalid(_))));

    let store = cache.store();
    assert_eq!(store.record(post).unwrap().state(), StateId::UpdatedInvalid);
    assert_eq!(store.attribute(post, "title").unwrap(), Some(json!("")));
    assert_eq!(store.errors(post).unwrap().get("title").len(), 1);
}

#[tokio::test]
async fn destroy_record_deletes_on_the_backend() {
    let cache = cache(posts(&["1"]));
    let post = cache.find_record("post", "1").await.unwrap();

    cache.destroy_record(post).await.unwrap();

    assert_eq!(cache.store().record(post).unwrap().state(), StateId::DeletedSaved);
    assert!(cache.adapter().calls().contains(&Call::Delete("1".into())));
}

// ============================================================================
// Relationships
// ============================================================================

#[tokio::test]
async fn has_many_loads_through_link_once() {
    let mut backend = MockBackend::default();
    backend.links.insert(
        "/posts/1/comments".into(),
        json!({"data": [
            {"type": "comment", "id": "1", "attributes": {"body": "first"}},
            {"type": "comment", "id": "2", "attributes": {"body": "second"}}
        ]}),
    );
    let cache = cache(backend);
    let post = cache
        .push(&json!({"data": {"type": "post", "id": "1", "relationships": {
            "comments": {"links": {"related": "/posts/1/comments"}}
        }}}))
        .unwrap()
        .single()
        .unwrap();

    let comments = cache.load_has_many(post, "comments").await.unwrap();
    assert_eq!(comments.len(), 2);
    assert_eq!(
        cache.with_store(|store| store.belongs_to_value(comments[0], "post")).unwrap(),
        Some(post)
    );

    let again = cache.load_has_many(post, "comments").await.unwrap();
    assert_eq!(again, comments);
    assert_eq!(cache.adapter().count(|call| matches!(call, Call::FindHasMany(_))), 1);

    cache.reload_has_many(post, "comments").await.unwrap();
    assert_eq!(cache.adapter().count(|call| matches!(call, Call::FindHasMany(_))), 2);
}

#[tokio::test]
async fn has_many_without_link_fetches_members() {
    let backend = MockBackend::with_records(&[
        ("comment", "1", json!({"body": "first"})),
        ("comment", "2", json!({"body": "second"})),
    ]);
    let cache = cache(backend);
    let post = cache
        .push(&json!({"data": {"type": "post", "id": "1", "relationships": {
            "comments": {"data": [{"type": "comment", "id": "1"}, {"type": "comment", "id": "2"}]}
        }}}))
        .unwrap()
        .single()
        .unwrap();

    let comments = cache.load_has_many(post, "comments").await.unwrap();
    assert_eq!(comments.len(), 2);
    assert_eq!(
        cache.adapter().calls(),
        vec![Call::FindMany(vec!["1".into(), "2".into()])]
    );
    assert_eq!(
        cache.store().attribute(comments[1], "body").unwrap(),
        Some(json!("second"))
    );
}

#[tokio::test]
async fn belongs_to_fetches_missing_parent() {
    let cache = cache(posts(&["1"]));
    let comment = cache
        .push(&json!({"data": {"type": "comment", "id": "1", "relationships": {
            "post": {"data": {"type": "post", "id": "1"}}
        }}}))
        .unwrap()
        .single()
        .unwrap();

    let post = cache.load_belongs_to(comment, "post").await.unwrap().unwrap();
    assert_eq!(cache.store().attribute(post, "title").unwrap(), Some(json!("Post 1")));
    assert_eq!(cache.adapter().calls(), vec![Call::FindRecord("1".into())]);
}

#[tokio::test]
async fn wrong_kind_is_rejected_before_any_request() {
    let cache = cache(MockBackend::default());
    let post = cache
        .push(&json!({"data": {"type": "post", "id": "1"}}))
        .unwrap()
        .single()
        .unwrap();

    let err = cache.load_belongs_to(post, "comments").await.unwrap_err();
    assert!(matches!(err, Error::WrongRelationshipKind { .. }));
    assert!(cache.adapter().calls().is_empty());
}
