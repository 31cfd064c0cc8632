//! Compiled rule cache shared by the REST handlers and the realtime dispatcher.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use rulebase_core::{Collection, CompiledRules, RuleError};
use tracing::debug;

use crate::hooks::AppHooks;

/// Parsed rules per collection name.
///
/// Each entry remembers the definition it was compiled from and is only
/// served for that same definition, so a caller holding an older snapshot
/// never seeds the cache for callers holding the current one. Entries are
/// also dropped whenever the collection is saved or deleted.
#[derive(Default)]
pub struct RuleCache {
    compiled: DashMap<String, Compiled>,
}

struct Compiled {
    source: Arc<Collection>,
    rules: Arc<CompiledRules>,
}

impl RuleCache {
    /// Creates the cache and registers its invalidation on `hooks`.
    #[must_use]
    pub fn new(hooks: &AppHooks) -> Arc<Self> {
        let cache = Arc::new(Self::default());
        let weak: Weak<Self> = Arc::downgrade(&cache);
        hooks.collection_changed.add(move |change| {
            if let Some(cache) = weak.upgrade() {
                cache.invalidate(change.name());
            }
        });
        cache
    }

    /// Returns the compiled rules of `collection`, compiling when the
    /// entry is missing or was built from a different definition.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`] if a stored rule no longer parses.
    pub fn get(&self, collection: &Arc<Collection>) -> Result<Arc<CompiledRules>, RuleError> {
        if let Some(entry) = self.compiled.get(&collection.name) {
            if Arc::ptr_eq(&entry.source, collection) {
                return Ok(Arc::clone(&entry.rules));
            }
        }
        let rules = Arc::new(CompiledRules::compile(collection)?);
        self.compiled.insert(
            collection.name.clone(),
            Compiled {
                source: Arc::clone(collection),
                rules: Arc::clone(&rules),
            },
        );
        Ok(rules)
    }

    pub fn invalidate(&self, collection: &str) {
        if self.compiled.remove(collection).is_some() {
            debug!(collection = %collection, "compiled rules invalidated");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rulebase_core::{CollectionType, Rule, RuleSet};

    use super::*;
    use crate::storage::CollectionStore;

    #[test]
    fn compiles_once_and_reuses() {
        let hooks = AppHooks::new();
        let cache = RuleCache::new(&hooks);
        let posts = Arc::new(
            Collection::new("posts", CollectionType::Base).with_rules(RuleSet::public()),
        );

        let first = cache.get(&posts).unwrap();
        let second = cache.get(&posts).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn schema_change_invalidates_entry() {
        let hooks = AppHooks::new();
        let cache = RuleCache::new(&hooks);
        let store = CollectionStore::new(Arc::clone(&hooks));

        let open = store
            .save(Collection::new("posts", CollectionType::Base).with_rules(RuleSet::public()))
            .unwrap();
        let before = cache.get(&open).unwrap();
        assert!(matches!(before.list, Rule::Expression(_)));

        let closed = store
            .save(Collection::new("posts", CollectionType::Base))
            .unwrap();
        assert!(cache.is_empty());
        let after = cache.get(&closed).unwrap();
        assert_eq!(after.list, Rule::Absent);

        store.delete("posts");
        assert!(cache.is_empty());
    }

    #[test]
    fn old_snapshot_never_serves_current_definition() {
        let hooks = AppHooks::new();
        let cache = RuleCache::new(&hooks);
        let store = CollectionStore::new(Arc::clone(&hooks));

        let open = store
            .save(Collection::new("posts", CollectionType::Base).with_rules(RuleSet::public()))
            .unwrap();
        let closed = store
            .save(Collection::new("posts", CollectionType::Base))
            .unwrap();

        // A request that fetched the collection before the save compiles late.
        let stale = cache.get(&open).unwrap();
        assert!(matches!(stale.list, Rule::Expression(_)));

        let current = store.get("posts").unwrap();
        assert!(Arc::ptr_eq(&current, &closed));
        assert_eq!(cache.get(&current).unwrap().list, Rule::Absent);
        assert_eq!(cache.get(&current).unwrap().list, Rule::Absent);
        assert_eq!(cache.len(), 1);
    }
}
