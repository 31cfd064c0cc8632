//! Resolves a raw `Authorization` value into an [`AuthContext`].

use std::sync::Arc;

use rulebase_core::{AuthContext, CollectionProvider, RecordProvider, Value};
use tracing::{debug, warn};

use super::verifier::{CredentialVerifier, TokenClaims, TokenType};
use crate::storage::AdminStore;

const SCHEMES: [&str; 3] = ["Bearer ", "Admin ", "User "];

/// Builds the caller identity for REST requests and realtime connections.
///
/// Resolution never fails: anything that cannot be verified or looked up
/// degrades to a guest context.
pub struct AuthPropagator {
    verifier: Arc<dyn CredentialVerifier>,
    collections: Arc<dyn CollectionProvider>,
    records: Arc<dyn RecordProvider>,
    admins: Arc<AdminStore>,
}

impl AuthPropagator {
    #[must_use]
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        collections: Arc<dyn CollectionProvider>,
        records: Arc<dyn RecordProvider>,
        admins: Arc<AdminStore>,
    ) -> Self {
        Self {
            verifier,
            collections,
            records,
            admins,
        }
    }

    /// Resolves `raw`, the value of an `Authorization` header or realtime
    /// `authorization` field.
    pub async fn resolve(&self, raw: Option<&str>) -> AuthContext {
        let Some(token) = raw.and_then(extract_token) else {
            return AuthContext::guest();
        };

        let claims = match self.verifier.verify(token) {
            Ok(claims) => claims,
            Err(err) => {
                debug!(error = %err, "credential rejected, continuing as guest");
                return AuthContext::guest();
            }
        };

        match claims.token_type {
            TokenType::Admin => self.resolve_admin(claims),
            TokenType::AuthRecord => self.resolve_record(claims).await,
        }
    }

    fn resolve_admin(&self, claims: TokenClaims) -> AuthContext {
        match self.admins.find(&claims.id) {
            Some(admin) => AuthContext::admin(admin).with_claims(claims.extra),
            None => {
                debug!(admin = %claims.id, "token subject is not an admin");
                AuthContext::guest()
            }
        }
    }

    async fn resolve_record(&self, claims: TokenClaims) -> AuthContext {
        let Some(collection_name) = claims.collection_id.as_deref() else {
            debug!(record = %claims.id, "auth record token without collection");
            return AuthContext::guest();
        };

        let collection = match self.collections.find_collection(collection_name).await {
            Ok(Some(collection)) if collection.is_auth() => collection,
            Ok(_) => {
                debug!(collection = %collection_name, "token collection is not an auth collection");
                return AuthContext::guest();
            }
            Err(err) => {
                warn!(collection = %collection_name, error = %err, "auth collection lookup failed");
                return AuthContext::guest();
            }
        };

        let record = match self.records.find_record(&collection.name, &claims.id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(record = %claims.id, collection = %collection.name, "token subject not found");
                return AuthContext::guest();
            }
            Err(err) => {
                warn!(record = %claims.id, error = %err, "auth record lookup failed");
                return AuthContext::guest();
            }
        };

        let mut extra = claims.extra;
        let verified = record
            .field("verified")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        extra.insert("verified".to_string(), Value::Bool(verified));
        AuthContext::user(record, extra)
    }
}

/// Strips a known scheme prefix; a bare token is accepted as is.
fn extract_token(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    let token = SCHEMES
        .iter()
        .find_map(|scheme| {
            raw.get(..scheme.len())
                .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
                .map(|_| &raw[scheme.len()..])
        })
        .unwrap_or(raw)
        .trim();
    (!token.is_empty()).then_some(token)
}
