//! JSON frames exchanged over the realtime socket.

use serde::{Deserialize, Serialize};

/// Sent once right after the upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectMessage {
    pub client_id: String,
}

/// Client request replacing its topic set.
///
/// `authorization`, when present, re-resolves the connection identity
/// before the new topics take effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionsMessage {
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
}

/// Acknowledges a [`SubscriptionsMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribedMessage {
    pub subscriptions: Vec<String>,
}

/// Rejected control frame. The connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
}
