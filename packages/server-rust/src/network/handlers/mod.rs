//! HTTP and `WebSocket` handlers plus the state they share.

pub mod collections;
pub mod health;
pub mod realtime;
pub mod records;

pub use collections::{
    delete_collection_handler, list_collections_handler, save_collection_handler,
    view_collection_handler,
};
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use realtime::realtime_handler;
pub use records::{
    create_record_handler, delete_record_handler, list_records_handler, update_record_handler,
    view_record_handler,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, Method};
use rulebase_core::{AuthContext, RequestContext, Value};

use super::{NetworkConfig, ShutdownController};
use crate::app::App;

/// State passed to every handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub app: Arc<App>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Used for uptime reporting.
    pub start_time: Instant,
}

/// Builds the rule-visible request context from the parts of an HTTP request.
fn request_context(
    method: &Method,
    headers: &HeaderMap,
    query: BTreeMap<String, String>,
    data: BTreeMap<String, Value>,
    auth: Arc<AuthContext>,
) -> RequestContext {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned())));
    RequestContext::new(auth)
        .with_method(method.as_str())
        .with_query(query.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
        .with_headers(headers)
        .with_data(data)
}
