//! Fans committed record events out to authorized subscribers.
//!
//! Each collection gets its own lane: a bounded queue drained by one task,
//! so events of a collection reach subscribers in commit order. Lanes of
//! different collections run independently.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use metrics::counter;
use rulebase_core::{
    can_perform, Collection, CollectionProvider, CompiledRules, EvalError, Evaluator,
    RecordEvent, RecordProvider, RequestContext, RuleOperation,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::registry::{Candidate, OutboundMessage, SendError, SubscriptionRegistry};
use crate::rules::RuleCache;

/// Per-event delivery tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Denied by the collection rules, or unsubscribed before the send.
    pub suppressed: usize,
    /// Dropped for backpressure or a closed socket.
    pub disconnected: usize,
    /// Rule evaluation failed; the subscriber was skipped.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Suppressed,
    Disconnected,
    Failed,
}

/// Shared state the lane tasks run against.
struct Fanout {
    registry: Arc<SubscriptionRegistry>,
    collections: Arc<dyn CollectionProvider>,
    records: Arc<dyn RecordProvider>,
    rules: Arc<RuleCache>,
}

/// Routes record events through per-collection lanes.
pub struct Dispatcher {
    fanout: Arc<Fanout>,
    lanes: DashMap<String, mpsc::Sender<RecordEvent>>,
    lane_capacity: usize,
    shutdown: CancellationToken,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        collections: Arc<dyn CollectionProvider>,
        records: Arc<dyn RecordProvider>,
        rules: Arc<RuleCache>,
        lane_capacity: usize,
    ) -> Self {
        Self {
            fanout: Arc::new(Fanout {
                registry,
                collections,
                records,
                rules,
            }),
            lanes: DashMap::new(),
            lane_capacity: lane_capacity.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Queues `event` on its collection's lane, starting the lane if needed.
    ///
    /// Waits while the lane is full. Must be called from within a tokio
    /// runtime.
    pub async fn publish(&self, event: RecordEvent) {
        let lane = self
            .lanes
            .entry(event.collection.clone())
            .or_insert_with(|| self.spawn_lane(&event.collection))
            .clone();

        if let Err(err) = lane.send(event).await {
            warn!(collection = %err.0.collection, "dispatch lane closed, event dropped");
            self.lanes.remove(&err.0.collection);
        }
    }

    /// Delivers one event right away, bypassing the lanes.
    pub async fn dispatch(&self, event: &RecordEvent) -> DispatchReport {
        self.fanout.dispatch(event).await
    }

    /// Stops the lane of a deleted collection after it drains.
    pub fn close_lane(&self, collection: &str) {
        if self.lanes.remove(collection).is_some() {
            debug!(collection = %collection, "dispatch lane closed");
        }
    }

    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Cancels every lane task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.lanes.clear();
    }

    fn spawn_lane(&self, collection: &str) -> mpsc::Sender<RecordEvent> {
        let (tx, mut rx) = mpsc::channel::<RecordEvent>(self.lane_capacity);
        let fanout = Arc::clone(&self.fanout);
        let cancel = self.shutdown.child_token();
        debug!(collection = %collection, "dispatch lane started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            fanout.dispatch(&event).await;
                        }
                        None => break,
                    },
                }
            }
        });
        tx
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Fanout {
    async fn dispatch(&self, event: &RecordEvent) -> DispatchReport {
        let mut report = DispatchReport::default();

        let candidates = self.registry.connections_for(&event.collection);
        if candidates.is_empty() {
            return report;
        }

        let collection = match self.collections.find_collection(&event.collection).await {
            Ok(Some(collection)) => collection,
            Ok(None) => {
                debug!(collection = %event.collection, "event for unknown collection dropped");
                return report;
            }
            Err(err) => {
                warn!(collection = %event.collection, error = %err, "collection lookup failed");
                report.failed = candidates.len();
                return report;
            }
        };
        let rules = match self.rules.get(&collection) {
            Ok(rules) => rules,
            Err(err) => {
                warn!(collection = %collection.name, error = %err, "stored rule does not compile");
                report.failed = candidates.len();
                return report;
            }
        };
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(collection = %collection.name, error = %err, "event serialization failed");
                report.failed = candidates.len();
                return report;
            }
        };

        let outcomes = join_all(
            candidates
                .into_iter()
                .map(|candidate| self.deliver(&collection, &rules, event, &payload, candidate)),
        )
        .await;

        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Suppressed => report.suppressed += 1,
                Outcome::Disconnected => report.disconnected += 1,
                Outcome::Failed => report.failed += 1,
            }
        }
        report
    }

    /// Returns `None` when the candidate does not care about this record.
    async fn deliver(
        &self,
        collection: &Arc<Collection>,
        rules: &CompiledRules,
        event: &RecordEvent,
        payload: &str,
        candidate: Candidate,
    ) -> Option<Outcome> {
        let via_record = candidate.record_ids.contains(&event.record.id);
        if !candidate.via_collection && !via_record {
            return None;
        }

        let id = candidate.handle.id;
        let allowed = match self
            .is_allowed(collection, rules, event, &candidate, via_record)
            .await
        {
            Ok(allowed) => allowed,
            Err(err) => {
                warn!(connection = %id, collection = %collection.name, error = %err, "rule evaluation failed, subscriber skipped");
                return Some(Outcome::Failed);
            }
        };
        if !allowed {
            counter!("rulebase_realtime_suppressed_total").increment(1);
            return Some(Outcome::Suppressed);
        }

        let msg = OutboundMessage::Text(payload.to_owned());
        match self
            .registry
            .send_if_subscribed(id, &event.collection, &event.record.id, msg)
        {
            Ok(true) => {
                counter!("rulebase_realtime_delivered_total").increment(1);
                Some(Outcome::Delivered)
            }
            Ok(false) => Some(Outcome::Suppressed),
            Err(SendError::Full) => {
                warn!(connection = %id, "outbound queue full, disconnecting subscriber");
                counter!("rulebase_realtime_backpressure_disconnects_total").increment(1);
                self.registry.disconnect(id);
                Some(Outcome::Disconnected)
            }
            Err(SendError::Disconnected) => {
                debug!(connection = %id, "subscriber socket already closed");
                self.registry.disconnect(id);
                Some(Outcome::Disconnected)
            }
        }
    }

    /// Collection-wide topics are gated by the list rule, record topics by
    /// the view rule; either one allowing is enough.
    async fn is_allowed(
        &self,
        collection: &Arc<Collection>,
        rules: &CompiledRules,
        event: &RecordEvent,
        candidate: &Candidate,
        via_record: bool,
    ) -> Result<bool, EvalError> {
        let request = RequestContext::new(Arc::clone(&candidate.auth));
        let evaluator = Evaluator::new(self.collections.as_ref(), self.records.as_ref(), &request);
        let record = Some(&event.record);

        if candidate.via_collection
            && can_perform(collection, rules, RuleOperation::List, record, &evaluator)
                .await?
                .is_allowed()
        {
            return Ok(true);
        }
        if via_record
            && can_perform(collection, rules, RuleOperation::View, record, &evaluator)
                .await?
                .is_allowed()
        {
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rulebase_core::{
        Admin, AuthContext, CollectionType, FieldDef, FieldType, Record, RecordAction, RuleSet,
    };

    use super::*;
    use crate::hooks::AppHooks;
    use crate::network::ConnectionConfig;
    use crate::realtime::registry::Topic;
    use crate::storage::{CollectionStore, MemoryRecordStore};

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        collections: Arc<CollectionStore>,
        records: Arc<MemoryRecordStore>,
        dispatcher: Dispatcher,
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
                    .with_field(FieldDef::new("title", FieldType::Text))
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

        let records = Arc::new(MemoryRecordStore::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&collections) as Arc<dyn CollectionProvider>,
            Arc::clone(&records) as Arc<dyn RecordProvider>,
            RuleCache::new(&hooks),
            16,
        );
        Fixture {
            registry,
            collections,
            records,
            dispatcher,
        }
    }

    fn user(id: &str) -> Arc<AuthContext> {
        Arc::new(AuthContext::user(Record::new("users", id), Default::default()))
    }

    fn post(id: &str, author: &str) -> Record {
        Record::new("posts", id)
            .with_field("title", "hello")
            .with_field("author", author)
    }

    fn topic(s: &str) -> Topic {
        s.parse().unwrap()
    }

    fn owner_rules() -> RuleSet {
        RuleSet {
            list_rule: Some("author = @request.auth.id".to_string()),
            view_rule: Some("author = @request.auth.id".to_string()),
            ..RuleSet::default()
        }
    }

    #[tokio::test]
    async fn only_authorized_subscribers_receive() {
        let f = fixture(owner_rules());
        let config = ConnectionConfig::default();
        let (alice, mut alice_rx) = f.registry.register(user("alice"), &config);
        let (bob, mut bob_rx) = f.registry.register(user("bob"), &config);
        f.registry.subscribe(alice.id, topic("posts"));
        f.registry.subscribe(bob.id, topic("posts"));

        let event = RecordEvent::new(RecordAction::Create, post("p1", "alice"));
        let report = f.dispatcher.dispatch(&event).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.suppressed, 1);
        let OutboundMessage::Text(body) = alice_rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["action"], "create");
        assert_eq!(json["collection"], "posts");
        assert_eq!(json["record"]["id"], "p1");
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn record_topic_uses_view_rule() {
        let f = fixture(RuleSet {
            view_rule: Some(String::new()),
            ..RuleSet::default()
        });
        let config = ConnectionConfig::default();
        let (by_record, mut rec_rx) = f.registry.register(user("bob"), &config);
        let (by_collection, mut coll_rx) = f.registry.register(user("bob"), &config);
        f.registry.subscribe(by_record.id, topic("posts/p1"));
        f.registry.subscribe(by_collection.id, topic("posts"));

        let report = f
            .dispatcher
            .dispatch(&RecordEvent::new(RecordAction::Update, post("p1", "alice")))
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.suppressed, 1);
        assert!(rec_rx.try_recv().is_ok());
        assert!(coll_rx.try_recv().is_err());

        let other = f
            .dispatcher
            .dispatch(&RecordEvent::new(RecordAction::Update, post("p2", "alice")))
            .await;
        assert_eq!(other, DispatchReport {
            suppressed: 1,
            ..DispatchReport::default()
        });
    }

    #[tokio::test]
    async fn admins_bypass_absent_rules() {
        let f = fixture(RuleSet::default());
        let config = ConnectionConfig::default();
        let admin = Arc::new(AuthContext::admin(Admin {
            id: "a1".to_string(),
            email: "root@example.com".to_string(),
        }));
        let (root, mut root_rx) = f.registry.register(admin, &config);
        let (guest, mut guest_rx) = f
            .registry
            .register(Arc::new(AuthContext::guest()), &config);
        f.registry.subscribe(root.id, Topic::All);
        f.registry.subscribe(guest.id, Topic::All);

        f.dispatcher
            .dispatch(&RecordEvent::new(RecordAction::Delete, post("p1", "")))
            .await;
        assert!(root_rx.try_recv().is_ok());
        assert!(guest_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_disconnects_only_that_subscriber() {
        let f = fixture(RuleSet::public());
        let tiny = ConnectionConfig {
            outbound_channel_capacity: 1,
            ..ConnectionConfig::default()
        };
        let (slow, _slow_rx) = f.registry.register(user("slow"), &tiny);
        let (fast, mut fast_rx) = f.registry.register(user("fast"), &ConnectionConfig::default());
        f.registry.subscribe(slow.id, topic("posts"));
        f.registry.subscribe(fast.id, topic("posts"));

        let first = f
            .dispatcher
            .dispatch(&RecordEvent::new(RecordAction::Create, post("p1", "x")))
            .await;
        assert_eq!(first.delivered, 2);

        let second = f
            .dispatcher
            .dispatch(&RecordEvent::new(RecordAction::Create, post("p2", "x")))
            .await;
        assert_eq!(second.delivered, 1);
        assert_eq!(second.disconnected, 1);
        assert!(slow.cancel.is_cancelled());
        assert!(f.registry.get(slow.id).is_none());
        assert_eq!(f.registry.count(), 1);
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn relation_rules_consult_the_record_store() {
        let f = fixture(RuleSet {
            list_rule: Some("author.verified = true".to_string()),
            ..RuleSet::default()
        });
        f.records
            .insert(Record::new("users", "alice").with_field("verified", true))
            .unwrap();
        let (conn, mut rx) = f
            .registry
            .register(Arc::new(AuthContext::guest()), &ConnectionConfig::default());
        f.registry.subscribe(conn.id, topic("posts"));

        let verified = f
            .dispatcher
            .dispatch(&RecordEvent::new(RecordAction::Create, post("p1", "alice")))
            .await;
        let unknown = f
            .dispatcher
            .dispatch(&RecordEvent::new(RecordAction::Create, post("p2", "ghost")))
            .await;
        assert_eq!(verified.delivered, 1);
        assert_eq!(unknown.suppressed, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn two_hop_relation_rule_gates_comment_events() {
        let f = fixture(RuleSet::public());
        f.collections
            .save(
                Collection::new("posts", CollectionType::Base)
                    .with_field(FieldDef::new("title", FieldType::Text))
                    .with_field(FieldDef::new(
                        "owner",
                        FieldType::Relation {
                            collection: "users".to_string(),
                            max_select: None,
                        },
                    ))
                    .with_rules(RuleSet::public()),
            )
            .unwrap();
        f.collections
            .save(
                Collection::new("comments", CollectionType::Base)
                    .with_field(FieldDef::new("body", FieldType::Text))
                    .with_field(
                        FieldDef::new(
                            "post",
                            FieldType::Relation {
                                collection: "posts".to_string(),
                                max_select: None,
                            },
                        )
                        .required(),
                    )
                    .with_rules(RuleSet {
                        list_rule: Some("post.owner = @request.auth.id".to_string()),
                        ..RuleSet::default()
                    }),
            )
            .unwrap();
        f.records
            .insert(Record::new("posts", "p1").with_field("owner", "alice"))
            .unwrap();

        let config = ConnectionConfig::default();
        let (owner, mut owner_rx) = f.registry.register(user("alice"), &config);
        let (other, mut other_rx) = f.registry.register(user("bob"), &config);
        f.registry.subscribe(owner.id, topic("comments"));
        f.registry.subscribe(other.id, topic("comments"));

        let comment = Record::new("comments", "c1")
            .with_field("body", "nice")
            .with_field("post", "p1");
        let report = f
            .dispatcher
            .dispatch(&RecordEvent::new(RecordAction::Create, comment))
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.suppressed, 1);

        let OutboundMessage::Text(body) = owner_rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["action"], "create");
        assert_eq!(json["record"]["id"], "c1");
        assert!(other_rx.try_recv().is_err());

        let orphan = Record::new("comments", "c2").with_field("post", "missing");
        let report = f
            .dispatcher
            .dispatch(&RecordEvent::new(RecordAction::Create, orphan))
            .await;
        assert_eq!(report.suppressed, 2);
        assert_eq!(f.registry.count(), 2);
    }

    #[tokio::test]
    async fn lanes_preserve_commit_order() {
        let f = fixture(RuleSet::public());
        let (conn, mut rx) = f
            .registry
            .register(Arc::new(AuthContext::guest()), &ConnectionConfig::default());
        f.registry.subscribe(conn.id, topic("posts"));

        for i in 0..20 {
            f.dispatcher
                .publish(RecordEvent::new(RecordAction::Create, post(&format!("p{i}"), "x")))
                .await;
        }
        assert_eq!(f.dispatcher.lane_count(), 1);

        for i in 0..20 {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let OutboundMessage::Text(body) = msg else {
                panic!("expected text frame");
            };
            let json: serde_json::Value = serde_json::from_str(&body).unwrap();
            assert_eq!(json["record"]["id"], format!("p{i}"));
        }

        f.dispatcher.close_lane("posts");
        assert_eq!(f.dispatcher.lane_count(), 0);
    }
}
