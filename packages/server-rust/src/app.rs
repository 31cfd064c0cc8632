//! Application wiring: stores, caches, auth, realtime and services built
//! once and shared by every handler.

use std::sync::{Arc, Weak};

use rulebase_core::{Admin, Collection, CollectionProvider, Record, RecordProvider};
use tracing::info;

use crate::auth::{AuthPropagator, CredentialVerifier, JwtVerifier, TokenType, VerifyError};
use crate::config::ServerConfig;
use crate::hooks::{AppHooks, CollectionChange};
use crate::realtime::{Dispatcher, SubscriptionRegistry};
use crate::rules::RuleCache;
use crate::service::{CollectionService, RecordService};
use crate::storage::{AdminStore, CollectionStore, MemoryRecordStore};

/// Every long-lived component of a running server.
pub struct App {
    pub config: ServerConfig,
    pub hooks: Arc<AppHooks>,
    pub collections: Arc<CollectionStore>,
    pub records: Arc<MemoryRecordStore>,
    pub admins: Arc<AdminStore>,
    pub rules: Arc<RuleCache>,
    pub registry: Arc<SubscriptionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub verifier: Arc<JwtVerifier>,
    pub auth: Arc<AuthPropagator>,
    pub record_service: RecordService,
    pub collection_service: CollectionService,
}

impl App {
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let hooks = AppHooks::new();
        let collections = Arc::new(CollectionStore::new(Arc::clone(&hooks)));
        let records = Arc::new(MemoryRecordStore::new());
        let admins = AdminStore::new(Arc::clone(&hooks));
        let rules = RuleCache::new(&hooks);
        let registry = Arc::new(SubscriptionRegistry::new());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&collections) as Arc<dyn CollectionProvider>,
            Arc::clone(&records) as Arc<dyn RecordProvider>,
            Arc::clone(&rules),
            config.realtime.lane_capacity,
        ));

        let verifier = Arc::new(JwtVerifier::new(&config.auth));
        let auth = Arc::new(AuthPropagator::new(
            Arc::clone(&verifier) as Arc<dyn CredentialVerifier>,
            Arc::clone(&collections) as Arc<dyn CollectionProvider>,
            Arc::clone(&records) as Arc<dyn RecordProvider>,
            Arc::clone(&admins),
        ));

        register_cleanup(&hooks, &records, &dispatcher);

        Arc::new(Self {
            record_service: RecordService::new(
                Arc::clone(&collections),
                Arc::clone(&records),
                Arc::clone(&rules),
                Arc::clone(&dispatcher),
            ),
            collection_service: CollectionService::new(Arc::clone(&collections)),
            config,
            hooks,
            collections,
            records,
            admins,
            rules,
            registry,
            dispatcher,
            verifier,
            auth,
        })
    }

    /// Saves collection definitions in order, so relation targets must
    /// come before the collections pointing at them.
    ///
    /// # Errors
    ///
    /// Fails on the first invalid definition.
    pub fn load_collections(&self, collections: Vec<Collection>) -> anyhow::Result<()> {
        for collection in collections {
            let name = collection.name.clone();
            self.collections
                .save(collection)
                .map_err(|e| anyhow::anyhow!("collection {name:?}: {e}"))?;
        }
        Ok(())
    }

    /// Creates the first admin when none exists yet.
    ///
    /// Returns the new admin, or `None` when admins are already present.
    pub fn bootstrap_admin(&self, email: &str) -> Option<Admin> {
        if self.admins.total() > 0 {
            return None;
        }
        let admin = self.admins.create(email);
        info!(admin = %admin.id, email = %admin.email, "bootstrap admin created");
        Some(admin)
    }

    /// # Errors
    ///
    /// Returns [`VerifyError::Signing`] if the token cannot be signed.
    pub fn admin_token(&self, admin: &Admin) -> Result<String, VerifyError> {
        self.verifier
            .issue(&self.verifier.claims_for(TokenType::Admin, admin.id.clone(), None))
    }

    /// # Errors
    ///
    /// Returns [`VerifyError::Signing`] if the token cannot be signed.
    pub fn record_token(&self, record: &Record) -> Result<String, VerifyError> {
        self.verifier.issue(&self.verifier.claims_for(
            TokenType::AuthRecord,
            record.id.clone(),
            Some(record.collection_name.clone()),
        ))
    }

    /// Closes realtime clients and stops the dispatch lanes. Returns the
    /// number of clients closed.
    pub fn shutdown(&self) -> usize {
        let closed = self.registry.close_all("server shutting down");
        self.dispatcher.shutdown();
        closed
    }
}

/// Drops records and the dispatch lane of deleted collections.
fn register_cleanup(
    hooks: &AppHooks,
    records: &Arc<MemoryRecordStore>,
    dispatcher: &Arc<Dispatcher>,
) {
    let records = Arc::clone(records);
    let dispatcher: Weak<Dispatcher> = Arc::downgrade(dispatcher);
    hooks.collection_changed.add(move |change| {
        if let CollectionChange::Deleted(name) = change {
            let dropped = records.drop_collection(name);
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.close_lane(name);
            }
            info!(collection = %name, records = dropped, "collection records dropped");
        }
    });
}
