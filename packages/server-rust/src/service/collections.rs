//! Admin-only schema management.

use std::sync::Arc;

use rulebase_core::{AuthContext, Collection};

use crate::error::ApiError;
use crate::storage::CollectionStore;

pub struct CollectionService {
    collections: Arc<CollectionStore>,
}

impl CollectionService {
    #[must_use]
    pub fn new(collections: Arc<CollectionStore>) -> Self {
        Self { collections }
    }

    /// # Errors
    ///
    /// `Unauthorized` for guests, `Forbidden` for non-admins.
    pub fn list(&self, auth: &AuthContext) -> Result<Vec<Arc<Collection>>, ApiError> {
        require_admin(auth)?;
        Ok(self.collections.list())
    }

    /// # Errors
    ///
    /// `Unauthorized`, `Forbidden` or `NotFound`.
    pub fn view(&self, auth: &AuthContext, name: &str) -> Result<Arc<Collection>, ApiError> {
        require_admin(auth)?;
        self.collections.get(name).ok_or(ApiError::NotFound)
    }

    /// Creates or replaces a collection definition.
    ///
    /// # Errors
    ///
    /// `BadRequest` when the definition or one of its rules is invalid.
    pub fn save(
        &self,
        auth: &AuthContext,
        collection: Collection,
    ) -> Result<Arc<Collection>, ApiError> {
        require_admin(auth)?;
        Ok(self.collections.save(collection)?)
    }

    /// Removes a collection; its records are dropped through the hook bus.
    ///
    /// # Errors
    ///
    /// `Unauthorized`, `Forbidden` or `NotFound`.
    pub fn delete(&self, auth: &AuthContext, name: &str) -> Result<(), ApiError> {
        require_admin(auth)?;
        self.collections
            .delete(name)
            .map(|_| ())
            .ok_or(ApiError::NotFound)
    }
}

fn require_admin(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.is_admin() {
        Ok(())
    } else if auth.is_guest() {
        Err(ApiError::Unauthorized)
    } else {
        Err(ApiError::Forbidden)
    }
}
