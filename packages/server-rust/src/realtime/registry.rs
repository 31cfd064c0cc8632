//! Live realtime connections and the topics each one subscribes to.
//!
//! Every connection gets a bounded mpsc channel drained by its `WebSocket`
//! write loop. Subscription changes and sends for the same connection are
//! serialized on its map entry, so a send never races past an unsubscribe
//! or disconnect that completed first.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use rulebase_core::AuthContext;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::network::ConnectionConfig;

/// Registry-assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message queued for a connection's write loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// A JSON text frame.
    Text(String),
    /// A close frame with an optional reason.
    Close(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The outbound queue is at capacity.
    #[error("outbound queue full")]
    Full,
    /// The write loop is gone.
    #[error("connection closed")]
    Disconnected,
}

/// A subscription target.
///
/// Parsed from `*`, `<collection>` or `<collection>/<recordId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Every collection.
    All,
    Collection(String),
    Record { collection: String, id: String },
}

impl Topic {
    /// Whether an event for `collection`/`record_id` falls under this topic.
    #[must_use]
    pub fn matches(&self, collection: &str, record_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Collection(name) => name == collection,
            Self::Record {
                collection: name,
                id,
            } => name == collection && id == record_id,
        }
    }

    /// Whether the topic is gated by the collection's list rule rather
    /// than its view rule.
    #[must_use]
    pub fn is_collection_wide(&self) -> bool {
        !matches!(self, Self::Record { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid topic {0:?}")]
pub struct TopicError(pub String);

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(Self::All);
        }
        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        match s.split_once('/') {
            None if valid(s) => Ok(Self::Collection(s.to_string())),
            Some((collection, id)) if valid(collection) && valid(id) => Ok(Self::Record {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
            _ => Err(TopicError(s.to_string())),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Collection(name) => f.write_str(name),
            Self::Record { collection, id } => write!(f, "{collection}/{id}"),
        }
    }
}

/// Sending side of one connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Public id announced to the client on connect.
    pub client_id: String,
    tx: mpsc::Sender<OutboundMessage>,
    pub connected_at: Instant,
    /// Cancelled when the connection is disconnected from the registry.
    pub cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Enqueues `msg` without waiting.
    ///
    /// # Errors
    ///
    /// [`SendError::Full`] when the queue is at capacity,
    /// [`SendError::Disconnected`] when the write loop has exited.
    pub fn try_send(&self, msg: OutboundMessage) -> Result<(), SendError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed() && !self.cancel.is_cancelled()
    }
}

struct Subscriber {
    handle: Arc<ConnectionHandle>,
    topics: BTreeSet<Topic>,
    auth: Arc<AuthContext>,
}

/// A connection with at least one topic touching a collection.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub handle: Arc<ConnectionHandle>,
    /// Identity at the time the candidate set was taken.
    pub auth: Arc<AuthContext>,
    /// Subscribed to `*` or the whole collection.
    pub via_collection: bool,
    /// Record ids of the collection subscribed individually.
    pub record_ids: BTreeSet<String>,
}

/// Topics added and removed by [`SubscriptionRegistry::replace`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicDiff {
    pub added: Vec<Topic>,
    pub removed: Vec<Topic>,
}

/// Thread-safe registry of realtime connections and their subscriptions.
pub struct SubscriptionRegistry {
    subscribers: DashMap<ConnectionId, Subscriber>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Connection ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection with no topics.
    ///
    /// The receiver belongs to the connection's write loop.
    pub fn register(
        &self,
        auth: Arc<AuthContext>,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);

        let handle = Arc::new(ConnectionHandle {
            id,
            client_id: Uuid::new_v4().to_string(),
            tx,
            connected_at: Instant::now(),
            cancel: CancellationToken::new(),
        });

        self.subscribers.insert(
            id,
            Subscriber {
                handle: Arc::clone(&handle),
                topics: BTreeSet::new(),
                auth,
            },
        );
        (handle, rx)
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.subscribers.get(&id).map(|s| Arc::clone(&s.handle))
    }

    /// Adds `topic`; returns `true` if it was not already present.
    pub fn subscribe(&self, id: ConnectionId, topic: Topic) -> bool {
        self.subscribers
            .get_mut(&id)
            .is_some_and(|mut s| s.topics.insert(topic))
    }

    /// Removes `topic`; [`Topic::All`] clears every topic.
    ///
    /// Returns the number of topics removed.
    pub fn unsubscribe(&self, id: ConnectionId, topic: &Topic) -> usize {
        let Some(mut subscriber) = self.subscribers.get_mut(&id) else {
            return 0;
        };
        if *topic == Topic::All {
            let removed = subscriber.topics.len();
            subscriber.topics.clear();
            removed
        } else {
            usize::from(subscriber.topics.remove(topic))
        }
    }

    /// Replaces the whole topic set in one step.
    ///
    /// Returns `None` for unknown connections.
    pub fn replace(&self, id: ConnectionId, topics: BTreeSet<Topic>) -> Option<TopicDiff> {
        let mut subscriber = self.subscribers.get_mut(&id)?;
        let diff = TopicDiff {
            added: topics.difference(&subscriber.topics).cloned().collect(),
            removed: subscriber.topics.difference(&topics).cloned().collect(),
        };
        subscriber.topics = topics;
        Some(diff)
    }

    #[must_use]
    pub fn topics_for(&self, id: ConnectionId) -> Vec<Topic> {
        self.subscribers
            .get(&id)
            .map(|s| s.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Connections with any topic touching `collection`.
    #[must_use]
    pub fn connections_for(&self, collection: &str) -> Vec<Candidate> {
        self.subscribers
            .iter()
            .filter_map(|entry| {
                let subscriber = entry.value();
                let mut via_collection = false;
                let mut record_ids = BTreeSet::new();
                for topic in &subscriber.topics {
                    match topic {
                        Topic::All => via_collection = true,
                        Topic::Collection(name) if name == collection => via_collection = true,
                        Topic::Record {
                            collection: name,
                            id,
                        } if name == collection => {
                            record_ids.insert(id.clone());
                        }
                        _ => {}
                    }
                }
                (via_collection || !record_ids.is_empty()).then(|| Candidate {
                    handle: Arc::clone(&subscriber.handle),
                    auth: Arc::clone(&subscriber.auth),
                    via_collection,
                    record_ids,
                })
            })
            .collect()
    }

    /// Whether the connection still has a topic matching the event.
    #[must_use]
    pub fn is_subscribed(&self, id: ConnectionId, collection: &str, record_id: &str) -> bool {
        self.subscribers.get(&id).is_some_and(|s| {
            s.topics
                .iter()
                .any(|topic| topic.matches(collection, record_id))
        })
    }

    /// Sends `msg` only if the connection still subscribes to the event.
    ///
    /// The check and the enqueue happen under the connection's entry lock.
    /// Returns `Ok(false)` when the subscription is gone.
    ///
    /// # Errors
    ///
    /// Propagates [`SendError`] from the connection's queue.
    pub fn send_if_subscribed(
        &self,
        id: ConnectionId,
        collection: &str,
        record_id: &str,
        msg: OutboundMessage,
    ) -> Result<bool, SendError> {
        let Some(subscriber) = self.subscribers.get(&id) else {
            return Ok(false);
        };
        if !subscriber
            .topics
            .iter()
            .any(|topic| topic.matches(collection, record_id))
        {
            return Ok(false);
        }
        subscriber.handle.try_send(msg).map(|()| true)
    }

    /// Swaps the identity used for future rule checks.
    pub fn set_auth(&self, id: ConnectionId, auth: Arc<AuthContext>) -> bool {
        let Some(mut subscriber) = self.subscribers.get_mut(&id) else {
            return false;
        };
        subscriber.auth = auth;
        true
    }

    #[must_use]
    pub fn auth_for(&self, id: ConnectionId) -> Option<Arc<AuthContext>> {
        self.subscribers.get(&id).map(|s| Arc::clone(&s.auth))
    }

    /// Purges the connection and cancels its token.
    ///
    /// Later sends through the registry are no-ops.
    pub fn disconnect(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let (_, subscriber) = self.subscribers.remove(&id)?;
        subscriber.handle.cancel.cancel();
        Some(subscriber.handle)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    /// Queues a close frame on every connection, then disconnects it.
    /// The writer flushes queued frames before it notices cancellation.
    ///
    /// Returns the number of connections closed.
    pub fn close_all(&self, reason: &str) -> usize {
        let ids: Vec<ConnectionId> = self.subscribers.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some(handle) = self.get(id) {
                // Full or closed queues are dropped with the connection anyway.
                let _ = handle.try_send(OutboundMessage::Close(Some(reason.to_string())));
            }
            if self.disconnect(id).is_some() {
                closed += 1;
            }
        }
        closed
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
