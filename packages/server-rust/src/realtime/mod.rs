//! Realtime subscriptions: who listens to which topics, and delivery of
//! committed record events to the subscribers allowed to see them.

pub mod dispatcher;
pub mod messages;
pub mod registry;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use messages::{ConnectMessage, ErrorMessage, SubscribedMessage, SubscriptionsMessage};
pub use registry::{
    Candidate, ConnectionHandle, ConnectionId, OutboundMessage, SendError, SubscriptionRegistry,
    Topic, TopicDiff, TopicError,
};
