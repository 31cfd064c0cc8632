use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Value;

/// A single record of a collection.
///
/// System fields are typed; user fields live in `data`, keyed by the
/// collection's field names. On the wire all of them are flattened into one
/// JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub collection_name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(flatten)]
    pub data: BTreeMap<String, Value>,
}

impl Record {
    /// Creates an empty record stamped with the current time.
    #[must_use]
    pub fn new(collection_name: impl Into<String>, id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            collection_name: collection_name.into(),
            created: now,
            updated: now,
            data: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(name.into(), value.into());
        self
    }

    /// Reads any field by name, system fields included.
    ///
    /// Dates are rendered as RFC 3339 strings; the schema decides how the
    /// evaluator interprets them.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "collectionName" => Some(Value::String(self.collection_name.clone())),
            "created" => Some(Value::String(format_datetime(&self.created))),
            "updated" => Some(Value::String(format_datetime(&self.updated))),
            _ => self.data.get(name).cloned(),
        }
    }

    /// Ids stored in a relation field; single ids and id arrays both work.
    #[must_use]
    pub fn relation_ids(&self, name: &str) -> Vec<String> {
        self.data.get(name).map(relation_ids).unwrap_or_default()
    }
}

/// Non-empty ids held by a relation value.
#[must_use]
pub fn relation_ids(value: &Value) -> Vec<String> {
    match value {
        Value::String(id) if !id.is_empty() => vec![id.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Mutation kind carried by a [`RecordEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    Create,
    Update,
    Delete,
}

impl RecordAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One committed mutation, as pushed to realtime subscribers.
///
/// For deletes `record` is the last known state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEvent {
    pub action: RecordAction,
    pub collection: String,
    pub record: Record,
}

impl RecordEvent {
    #[must_use]
    pub fn new(action: RecordAction, record: Record) -> Self {
        Self {
            action,
            collection: record.collection_name.clone(),
            record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_fields_are_readable() {
        let r = Record::new("posts", "p1").with_field("title", "hello");
        assert_eq!(r.field("id"), Some(Value::from("p1")));
        assert_eq!(r.field("collectionName"), Some(Value::from("posts")));
        assert_eq!(r.field("title"), Some(Value::from("hello")));
        assert!(matches!(r.field("created"), Some(Value::String(_))));
        assert_eq!(r.field("missing"), None);
    }

    #[test]
    fn relation_ids_accept_single_and_many() {
        let r = Record::new("posts", "p1")
            .with_field("author", "u1")
            .with_field("tags", vec!["t1", "", "t2"])
            .with_field("editor", "");
        assert_eq!(r.relation_ids("author"), vec!["u1"]);
        assert_eq!(r.relation_ids("tags"), vec!["t1", "t2"]);
        assert!(r.relation_ids("editor").is_empty());
        assert!(r.relation_ids("missing").is_empty());
    }

    #[test]
    fn event_serializes_flat_record() {
        let r = Record::new("posts", "p1").with_field("title", "hello");
        let event = RecordEvent::new(RecordAction::Update, r);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "update");
        assert_eq!(json["collection"], "posts");
        assert_eq!(json["record"]["id"], "p1");
        assert_eq!(json["record"]["collectionName"], "posts");
        assert_eq!(json["record"]["title"], "hello");
    }
}
