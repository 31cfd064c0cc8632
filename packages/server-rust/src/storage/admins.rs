//! Admin accounts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use rulebase_core::Admin;
use tracing::info;

use super::generate_id;
use crate::hooks::{AdminChange, AppHooks};

/// Admin accounts keyed by id.
///
/// The total admin count is cached and refreshed from the
/// `admin_changed` hook, so hot paths read it without scanning.
pub struct AdminStore {
    admins: DashMap<String, Admin>,
    total: AtomicUsize,
    hooks: Arc<AppHooks>,
}

impl AdminStore {
    /// Creates the store and registers its cache refresh on `hooks`.
    #[must_use]
    pub fn new(hooks: Arc<AppHooks>) -> Arc<Self> {
        let store = Arc::new(Self {
            admins: DashMap::new(),
            total: AtomicUsize::new(0),
            hooks: Arc::clone(&hooks),
        });

        let weak: Weak<Self> = Arc::downgrade(&store);
        hooks.admin_changed.add(move |_| {
            if let Some(store) = weak.upgrade() {
                store.refresh_total();
            }
        });
        store
    }

    /// Creates an admin with a fresh id.
    pub fn create(&self, email: impl Into<String>) -> Admin {
        let admin = Admin {
            id: generate_id(),
            email: email.into(),
        };
        self.admins.insert(admin.id.clone(), admin.clone());
        info!(admin = %admin.id, "admin created");
        self.hooks
            .admin_changed
            .trigger(&AdminChange::Created(admin.clone()));
        admin
    }

    pub fn delete(&self, id: &str) -> Option<Admin> {
        let (_, admin) = self.admins.remove(id)?;
        info!(admin = %admin.id, "admin deleted");
        self.hooks
            .admin_changed
            .trigger(&AdminChange::Deleted(admin.clone()));
        Some(admin)
    }

    #[must_use]
    pub fn find(&self, id: &str) -> Option<Admin> {
        self.admins.get(id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn find_by_email(&self, email: &str) -> Option<Admin> {
        self.admins
            .iter()
            .find(|entry| entry.value().email.eq_ignore_ascii_case(email))
            .map(|entry| entry.value().clone())
    }

    /// Cached number of admins.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    fn refresh_total(&self) {
        self.total.store(self.admins.len(), Ordering::Relaxed);
    }
}
