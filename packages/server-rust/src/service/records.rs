//! Rule-gated record CRUD.
//!
//! Every operation resolves the collection, fetches its compiled rules and
//! asks the resolver before touching the store. Committed mutations are
//! published to the realtime dispatcher.
//!
//! Mutations of one collection run one at a time under that collection's
//! commit lock, held from the read of the current record until the event
//! is queued on the dispatch lane. Lane order is therefore commit order,
//! and an update always merges into the latest stored state.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use rulebase_core::{
    can_perform, parse, Collection, CollectionType, Evaluator, Expr, Record,
    RecordAction, RecordEvent, RequestContext, Rule, RuleOperation, ValidationResult, Value,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::ApiError;
use crate::realtime::Dispatcher;
use crate::rules::RuleCache;
use crate::storage::{generate_id, is_valid_id, CollectionStore, MemoryRecordStore, MAX_ID_LENGTH};

/// Fields clients may not set directly.
const SYSTEM_KEYS: [&str; 4] = ["id", "created", "updated", "collectionName"];

pub struct RecordService {
    collections: Arc<CollectionStore>,
    records: Arc<MemoryRecordStore>,
    rules: Arc<RuleCache>,
    dispatcher: Arc<Dispatcher>,
    commit_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RecordService {
    #[must_use]
    pub fn new(
        collections: Arc<CollectionStore>,
        records: Arc<MemoryRecordStore>,
        rules: Arc<RuleCache>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            collections,
            records,
            rules,
            dispatcher,
            commit_locks: DashMap::new(),
        }
    }

    /// Records of `collection` visible under its list rule, narrowed by an
    /// optional client `filter`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown collections, `Forbidden` when the list rule is
    /// admin-only, `BadRequest` for a malformed filter.
    pub async fn list(
        &self,
        request: &RequestContext,
        collection: &str,
        filter: Option<&str>,
    ) -> Result<Vec<Record>, ApiError> {
        let collection = self.collection(collection)?;
        let rules = self.rules.get(&collection)?;

        let mut conditions: Vec<Arc<Expr>> = Vec::new();
        if !request.auth.is_admin() {
            match &rules.list {
                Rule::Absent => return Err(ApiError::Forbidden),
                Rule::Expression(expr) if expr.is_always_true() => {}
                Rule::Expression(expr) => conditions.push(Arc::clone(expr)),
            }
        }
        if let Some(filter) = filter.filter(|f| !f.trim().is_empty()) {
            conditions.push(Arc::new(parse(filter)?));
        }

        let evaluator = self.evaluator(request);
        let mut visible = Vec::new();
        'records: for record in self.records.list(&collection.name) {
            for condition in &conditions {
                if !evaluator
                    .evaluate(condition, &collection, Some(&record))
                    .await?
                {
                    continue 'records;
                }
            }
            visible.push(record);
        }
        Ok(visible)
    }

    /// # Errors
    ///
    /// `NotFound` for unknown collections or records, `Forbidden` when the
    /// view rule denies.
    pub async fn view(
        &self,
        request: &RequestContext,
        collection: &str,
        id: &str,
    ) -> Result<Record, ApiError> {
        let collection = self.collection(collection)?;
        let record = self
            .records
            .get(&collection.name, id)
            .ok_or(ApiError::NotFound)?;
        self.authorize(request, &collection, RuleOperation::View, &record)
            .await?;
        Ok(record)
    }

    /// Validates `request.data`, checks the create rule against the
    /// proposed record, stores it and publishes a `create` event.
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid data or view collections, `Forbidden` when
    /// the create rule denies.
    pub async fn create(
        &self,
        request: &RequestContext,
        collection: &str,
    ) -> Result<Record, ApiError> {
        let collection = self.writable(collection)?;

        let id = match request.data.get("id") {
            None | Some(Value::Null) => generate_id(),
            Some(Value::String(id)) if id.is_empty() => generate_id(),
            Some(Value::String(id)) if is_valid_id(id) => id.clone(),
            Some(_) => return Err(invalid_id()),
        };
        let data = user_data(&request.data);
        check(&collection, &data, "Failed to create record.")?;

        let mut record = Record::new(&collection.name, id);
        record.data = data;
        let _commit = self.commit_lock(&collection.name).await;
        self.authorize(request, &collection, RuleOperation::Create, &record)
            .await?;

        self.records.insert(record.clone())?;
        debug!(collection = %collection.name, record = %record.id, "record created");
        self.publish(RecordAction::Create, record.clone()).await;
        Ok(record)
    }

    /// Merges `request.data` into an existing record after its update rule
    /// allows the change.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Forbidden`, or `BadRequest` for invalid merged data.
    pub async fn update(
        &self,
        request: &RequestContext,
        collection: &str,
        id: &str,
    ) -> Result<Record, ApiError> {
        let collection = self.writable(collection)?;
        let _commit = self.commit_lock(&collection.name).await;
        let existing = self
            .records
            .get(&collection.name, id)
            .ok_or(ApiError::NotFound)?;
        self.authorize(request, &collection, RuleOperation::Update, &existing)
            .await?;

        let mut merged = existing;
        merged.data.extend(user_data(&request.data));
        check(&collection, &merged.data, "Failed to update record.")?;

        let stored = self.records.update(merged)?;
        debug!(collection = %collection.name, record = %stored.id, "record updated");
        self.publish(RecordAction::Update, stored.clone()).await;
        Ok(stored)
    }

    /// Removes a record; subscribers receive its last state.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Forbidden`.
    pub async fn delete(
        &self,
        request: &RequestContext,
        collection: &str,
        id: &str,
    ) -> Result<(), ApiError> {
        let collection = self.writable(collection)?;
        let _commit = self.commit_lock(&collection.name).await;
        let existing = self
            .records
            .get(&collection.name, id)
            .ok_or(ApiError::NotFound)?;
        self.authorize(request, &collection, RuleOperation::Delete, &existing)
            .await?;

        let removed = self
            .records
            .delete(&collection.name, id)
            .ok_or(ApiError::NotFound)?;
        debug!(collection = %collection.name, record = %removed.id, "record deleted");
        self.publish(RecordAction::Delete, removed).await;
        Ok(())
    }

    async fn commit_lock(&self, collection: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.commit_locks
                .entry(collection.to_string())
                .or_default()
                .value(),
        );
        lock.lock_owned().await
    }

    fn collection(&self, name: &str) -> Result<Arc<Collection>, ApiError> {
        self.collections.get(name).ok_or(ApiError::NotFound)
    }

    fn writable(&self, name: &str) -> Result<Arc<Collection>, ApiError> {
        let collection = self.collection(name)?;
        if collection.kind == CollectionType::View {
            return Err(ApiError::bad_request("View collections are read-only."));
        }
        Ok(collection)
    }

    fn evaluator<'a>(&'a self, request: &'a RequestContext) -> Evaluator<'a> {
        Evaluator::new(self.collections.as_ref(), self.records.as_ref(), request)
    }

    async fn authorize(
        &self,
        request: &RequestContext,
        collection: &Arc<Collection>,
        operation: RuleOperation,
        record: &Record,
    ) -> Result<(), ApiError> {
        let rules = self.rules.get(collection)?;
        let evaluator = self.evaluator(request);
        let decision =
            can_perform(collection, &rules, operation, Some(record), &evaluator).await?;
        if decision.is_allowed() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    async fn publish(&self, action: RecordAction, record: Record) {
        self.dispatcher
            .publish(RecordEvent::new(action, record))
            .await;
    }
}

fn user_data(data: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    data.iter()
        .filter(|(key, _)| !SYSTEM_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn invalid_id() -> ApiError {
    let mut data = BTreeMap::new();
    data.insert(
        "id".to_string(),
        format!("Must be 1 to {MAX_ID_LENGTH} characters of A-Z, a-z, 0-9, _ or -."),
    );
    ApiError::BadRequest {
        message: "Failed to create record.".to_string(),
        data,
    }
}

fn check(
    collection: &Collection,
    data: &BTreeMap<String, Value>,
    message: &str,
) -> Result<(), ApiError> {
    match collection.validate_data(data) {
        ValidationResult::Valid => Ok(()),
        ValidationResult::Invalid { errors } => Err(ApiError::BadRequest {
            message: message.to_string(),
            data: errors,
        }),
    }
}

#[cfg(test)]
mod tests {
    use rulebase_core::{Admin, AuthContext, FieldDef, FieldType, RuleSet};

    use super::*;
    use crate::hooks::AppHooks;
    use crate::network::ConnectionConfig;
    use crate::realtime::{OutboundMessage, SubscriptionRegistry, Topic};

    struct Fixture {
        service: Arc<RecordService>,
        collections: Arc<CollectionStore>,
        records: Arc<MemoryRecordStore>,
        registry: Arc<SubscriptionRegistry>,
    }

    fn fixture(rules: RuleSet) -> Fixture {
        let hooks = AppHooks::new();
        let collections = Arc::new(CollectionStore::new(Arc::clone(&hooks)));
        collections
            .save(Collection::new("users", CollectionType::Auth))
            .unwrap();
        collections
            .save(
                Collection::new("posts", CollectionType::Base)
                    .with_field(FieldDef::new("title", FieldType::Text).required())
                    .with_field(FieldDef::new("published", FieldType::Bool))
                    .with_field(FieldDef::new(
                        "author",
                        FieldType::Relation {
                            collection: "users".to_string(),
                            max_select: None,
                        },
                    ))
                    .with_rules(rules),
            )
            .unwrap();
        collections
            .save(Collection::new("stats", CollectionType::View).with_rules(RuleSet::public()))
            .unwrap();

        let records = Arc::new(MemoryRecordStore::new());
        let rules = RuleCache::new(&hooks);
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&collections) as Arc<dyn rulebase_core::CollectionProvider>,
            Arc::clone(&records) as Arc<dyn rulebase_core::RecordProvider>,
            Arc::clone(&rules),
            16,
        ));
        Fixture {
            service: Arc::new(RecordService::new(
                Arc::clone(&collections),
                Arc::clone(&records),
                rules,
                dispatcher,
            )),
            collections,
            records,
            registry,
        }
    }

    fn as_user(id: &str) -> RequestContext {
        RequestContext::new(Arc::new(AuthContext::user(
            Record::new("users", id),
            BTreeMap::new(),
        )))
    }

    fn as_guest() -> RequestContext {
        RequestContext::new(Arc::new(AuthContext::guest()))
    }

    fn as_admin() -> RequestContext {
        RequestContext::new(Arc::new(AuthContext::admin(Admin {
            id: "a1".to_string(),
            email: "root@example.com".to_string(),
        })))
    }

    fn body(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn seed(records: &MemoryRecordStore) {
        records
            .insert(
                Record::new("posts", "p1")
                    .with_field("title", "mine")
                    .with_field("author", "alice")
                    .with_field("published", false),
            )
            .unwrap();
        records
            .insert(
                Record::new("posts", "p2")
                    .with_field("title", "theirs")
                    .with_field("author", "bob")
                    .with_field("published", true),
            )
            .unwrap();
    }

    fn owner_or_published() -> RuleSet {
        RuleSet {
            list_rule: Some("author = @request.auth.id || published = true".to_string()),
            view_rule: Some("author = @request.auth.id".to_string()),
            create_rule: Some("@request.auth.id != '' && author = @request.auth.id".to_string()),
            update_rule: Some("author = @request.auth.id".to_string()),
            delete_rule: None,
        }
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test]
    async fn list_filters_by_rule_and_query_filter() {
        let f = fixture(owner_or_published());
        seed(&f.records);

        let alice = f.service.list(&as_user("alice"), "posts", None).await.unwrap();
        assert_eq!(ids(&alice), vec!["p1", "p2"]);

        let guest = f.service.list(&as_guest(), "posts", None).await.unwrap();
        assert_eq!(ids(&guest), vec!["p2"]);

        let narrowed = f
            .service
            .list(&as_user("alice"), "posts", Some("title ~ 'MINE'"))
            .await
            .unwrap();
        assert_eq!(ids(&narrowed), vec!["p1"]);

        let bad = f
            .service
            .list(&as_user("alice"), "posts", Some("title = "))
            .await;
        assert!(matches!(bad, Err(ApiError::BadRequest { .. })));

        assert!(matches!(
            f.service.list(&as_user("alice"), "nope", None).await,
            Err(ApiError::NotFound)
        ));
    }

    #[tokio::test]
    async fn absent_list_rule_is_admin_only() {
        let f = fixture(RuleSet::default());
        seed(&f.records);
        assert!(matches!(
            f.service.list(&as_user("alice"), "posts", None).await,
            Err(ApiError::Forbidden)
        ));
        let all = f.service.list(&as_admin(), "posts", None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn view_applies_view_rule() {
        let f = fixture(owner_or_published());
        seed(&f.records);
        assert!(f.service.view(&as_user("alice"), "posts", "p1").await.is_ok());
        assert!(matches!(
            f.service.view(&as_user("alice"), "posts", "p2").await,
            Err(ApiError::Forbidden)
        ));
        assert!(matches!(
            f.service.view(&as_user("alice"), "posts", "zz").await,
            Err(ApiError::NotFound)
        ));
    }

    #[tokio::test]
    async fn create_checks_rule_against_proposed_record() {
        let f = fixture(owner_or_published());

        let own = as_user("alice").with_data(body(&[
            ("title", Value::from("hello")),
            ("author", Value::from("alice")),
        ]));
        let created = f.service.create(&own, "posts").await.unwrap();
        assert_eq!(created.id.len(), 15);
        assert!(f.records.get("posts", &created.id).is_some());

        let spoofed = as_user("alice").with_data(body(&[
            ("title", Value::from("hello")),
            ("author", Value::from("bob")),
        ]));
        assert!(matches!(
            f.service.create(&spoofed, "posts").await,
            Err(ApiError::Forbidden)
        ));

        let guest = as_guest().with_data(body(&[
            ("title", Value::from("hello")),
            ("author", Value::from("")),
        ]));
        assert!(matches!(
            f.service.create(&guest, "posts").await,
            Err(ApiError::Forbidden)
        ));
        assert_eq!(f.records.list("posts").len(), 1);
    }

    #[tokio::test]
    async fn create_validates_data_and_honours_client_id() {
        let f = fixture(RuleSet::public());

        let missing_title = as_guest().with_data(body(&[("published", Value::Bool(true))]));
        let Err(ApiError::BadRequest { data, .. }) =
            f.service.create(&missing_title, "posts").await
        else {
            panic!("expected validation failure");
        };
        assert!(data.contains_key("title"));

        let with_id = as_guest().with_data(body(&[
            ("id", Value::from("custom1")),
            ("title", Value::from("x")),
            ("created", Value::from("1999-01-01")),
        ]));
        let created = f.service.create(&with_id, "posts").await.unwrap();
        assert_eq!(created.id, "custom1");
        assert!(!created.data.contains_key("created"));

        assert!(matches!(
            f.service.create(&with_id, "posts").await,
            Err(ApiError::BadRequest { .. })
        ));
        assert!(matches!(
            f.service.create(&with_id, "stats").await,
            Err(ApiError::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn create_rejects_ids_outside_the_topic_alphabet() {
        let f = fixture(RuleSet::public());
        let long = "x".repeat(MAX_ID_LENGTH + 1);

        for id in [
            Value::from("a/b"),
            Value::from("has space"),
            Value::from(long.as_str()),
            Value::from(7_i64),
        ] {
            let request = as_guest().with_data(body(&[("id", id.clone()), ("title", Value::from("x"))]));
            let Err(ApiError::BadRequest { data, .. }) = f.service.create(&request, "posts").await
            else {
                panic!("{id:?} should be rejected");
            };
            assert!(data.contains_key("id"), "{id:?}");
        }
        assert!(f.records.list("posts").is_empty());
    }

    #[tokio::test]
    async fn update_evaluates_against_existing_record() {
        let f = fixture(owner_or_published());
        seed(&f.records);

        let edit = as_user("alice").with_data(body(&[("title", Value::from("edited"))]));
        let updated = f.service.update(&edit, "posts", "p1").await.unwrap();
        assert_eq!(updated.data["title"], Value::from("edited"));
        assert_eq!(updated.data["author"], Value::from("alice"));

        assert!(matches!(
            f.service.update(&edit, "posts", "p2").await,
            Err(ApiError::Forbidden)
        ));
        assert_eq!(f.records.get("posts", "p2").unwrap().data["title"], Value::from("theirs"));
    }

    #[tokio::test]
    async fn absent_delete_rule_allows_only_admins() {
        let f = fixture(owner_or_published());
        seed(&f.records);
        assert!(matches!(
            f.service.delete(&as_user("alice"), "posts", "p1").await,
            Err(ApiError::Forbidden)
        ));
        f.service.delete(&as_admin(), "posts", "p1").await.unwrap();
        assert!(f.records.get("posts", "p1").is_none());
        assert!(matches!(
            f.service.delete(&as_admin(), "posts", "p1").await,
            Err(ApiError::NotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_updates_publish_in_commit_order() {
        const WRITERS: usize = 16;

        let f = fixture(RuleSet::public());
        let mut board = Collection::new("board", CollectionType::Base)
            .with_field(FieldDef::new("title", FieldType::Text))
            .with_rules(RuleSet::public());
        for i in 0..WRITERS {
            board = board.with_field(FieldDef::new(format!("w{i}"), FieldType::Number));
        }
        f.collections.save(board).unwrap();
        f.records
            .insert(Record::new("board", "b1").with_field("title", "start"))
            .unwrap();
        let (handle, mut rx) = f.registry.register(
            Arc::new(AuthContext::guest()),
            &ConnectionConfig {
                outbound_channel_capacity: 1024,
                ..ConnectionConfig::default()
            },
        );
        f.registry.subscribe(handle.id, Topic::All);

        for round in 0..25_i64 {
            let writers: Vec<_> = (0..WRITERS)
                .map(|i| {
                    let service = Arc::clone(&f.service);
                    tokio::spawn(async move {
                        let slot = format!("w{i}");
                        let request = as_guest().with_data(body(&[
                            ("title", Value::from(format!("{round}|{i}"))),
                            (slot.as_str(), Value::from(round)),
                        ]));
                        service.update(&request, "board", "b1").await.unwrap();
                    })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap();
            }

            let mut last = None;
            for _ in 0..WRITERS {
                let message = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                let OutboundMessage::Text(text) = message else {
                    panic!("unexpected close");
                };
                last = Some(serde_json::from_str::<serde_json::Value>(&text).unwrap());
            }
            let last = last.unwrap();
            let stored = f.records.get("board", "b1").unwrap();
            assert_eq!(
                last["record"]["title"],
                serde_json::to_value(&stored.data["title"]).unwrap(),
                "round {round}"
            );
            for i in 0..WRITERS {
                assert_eq!(stored.data[&format!("w{i}")], Value::from(round), "round {round}");
            }
        }
    }
}
