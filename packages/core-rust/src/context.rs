use std::collections::BTreeMap;
use std::sync::Arc;

use crate::auth::AuthContext;
use crate::types::Value;

/// Per-request context consulted by `@request.*` identifiers.
///
/// Built once per REST request (or once per realtime connection) and never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Upper-case HTTP method.
    pub method: String,
    /// Query string parameters.
    pub query: BTreeMap<String, Value>,
    /// Submitted body fields (create/update).
    pub data: BTreeMap<String, Value>,
    /// Header values keyed by normalized name (lowercase, `-` replaced by `_`).
    pub headers: BTreeMap<String, Value>,
    /// Resolved caller identity.
    pub auth: Arc<AuthContext>,
}

impl RequestContext {
    /// A `GET` context with no parameters, as used by realtime dispatch.
    #[must_use]
    pub fn new(auth: Arc<AuthContext>) -> Self {
        Self {
            method: "GET".to_string(),
            query: BTreeMap::new(),
            data: BTreeMap::new(),
            headers: BTreeMap::new(),
            auth,
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into().to_ascii_uppercase();
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: BTreeMap<String, Value>) -> Self {
        self.query = query;
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: BTreeMap<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Stores headers under their normalized names.
    #[must_use]
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.headers = headers
            .into_iter()
            .map(|(k, v)| (normalize_header(k.as_ref()), v.into()))
            .collect();
        self
    }
}

fn normalize_header(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}
