//! Resolved caller identity for one request or one live connection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::Record;
use crate::types::Value;

/// Coarse identity class used by the rule resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthKind {
    Guest,
    User,
    Admin,
}

/// An administrative identity. Admins bypass every collection rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admin {
    pub id: String,
    pub email: String,
}

/// Who the caller is.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    Guest,
    /// Authenticated through a record of an `auth` collection.
    User(Record),
    Admin(Admin),
}

/// Request- or connection-scoped identity plus the claims of its credential.
///
/// Immutable after construction; shared as `Arc<AuthContext>`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    identity: Identity,
    claims: BTreeMap<String, Value>,
}

impl AuthContext {
    #[must_use]
    pub fn guest() -> Self {
        Self {
            identity: Identity::Guest,
            claims: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn user(record: Record, claims: BTreeMap<String, Value>) -> Self {
        Self {
            identity: Identity::User(record),
            claims,
        }
    }

    #[must_use]
    pub fn admin(admin: Admin) -> Self {
        Self {
            identity: Identity::Admin(admin),
            claims: BTreeMap::new(),
        }
    }

    /// Replaces the credential claims.
    #[must_use]
    pub fn with_claims(mut self, claims: BTreeMap<String, Value>) -> Self {
        self.claims = claims;
        self
    }

    #[must_use]
    pub fn kind(&self) -> AuthKind {
        match self.identity {
            Identity::Guest => AuthKind::Guest,
            Identity::User(_) => AuthKind::User,
            Identity::Admin(_) => AuthKind::Admin,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.kind() == AuthKind::Admin
    }

    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.kind() == AuthKind::Guest
    }

    /// The authenticating record for `user` identities.
    #[must_use]
    pub fn record(&self) -> Option<&Record> {
        match &self.identity {
            Identity::User(record) => Some(record),
            _ => None,
        }
    }

    /// Id of the admin or auth record; `None` for guests.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match &self.identity {
            Identity::Guest => None,
            Identity::User(record) => Some(&record.id),
            Identity::Admin(admin) => Some(&admin.id),
        }
    }

    /// Collection of the authenticating record.
    #[must_use]
    pub fn collection_name(&self) -> Option<&str> {
        self.record().map(|r| r.collection_name.as_str())
    }

    #[must_use]
    pub fn claims(&self) -> &BTreeMap<String, Value> {
        &self.claims
    }

    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }
}

impl Default for AuthContext {
    fn default() -> Self {
        Self::guest()
    }
}
