//! Schema store: collection definitions keyed by name.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rulebase_core::{Collection, CollectionProvider, CompiledRules, SchemaError};
use tracing::info;

use crate::hooks::{AppHooks, CollectionChange};

/// Concurrent map of collection definitions.
///
/// Every successful save or delete fires
/// [`AppHooks::collection_changed`] before returning.
pub struct CollectionStore {
    collections: DashMap<String, Arc<Collection>>,
    hooks: Arc<AppHooks>,
}

impl CollectionStore {
    #[must_use]
    pub fn new(hooks: Arc<AppHooks>) -> Self {
        Self {
            collections: DashMap::new(),
            hooks,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.get(name).map(|r| Arc::clone(r.value()))
    }

    /// All collections, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Collection>> {
        let mut all: Vec<_> = self
            .collections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Validates and stores a collection definition, replacing any previous
    /// definition with the same name.
    ///
    /// Nothing is stored when validation fails.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] for structural problems, unparseable rules or
    /// relation fields pointing at unknown collections.
    pub fn save(&self, collection: Collection) -> Result<Arc<Collection>, SchemaError> {
        collection.validate_definition()?;
        CompiledRules::compile(&collection)?;

        for field in &collection.fields {
            if let Some(target) = field.field_type.relation_target() {
                if target != collection.name && !self.collections.contains_key(target) {
                    return Err(SchemaError::UnknownRelationTarget {
                        field: field.name.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }

        let collection = Arc::new(collection);
        self.collections
            .insert(collection.name.clone(), Arc::clone(&collection));
        info!(collection = %collection.name, fields = collection.fields.len(), "collection saved");

        self.hooks
            .collection_changed
            .trigger(&CollectionChange::Saved(Arc::clone(&collection)));
        Ok(collection)
    }

    /// Removes a collection definition; returns it if it existed.
    pub fn delete(&self, name: &str) -> Option<Arc<Collection>> {
        let (_, removed) = self.collections.remove(name)?;
        info!(collection = %name, "collection deleted");
        self.hooks
            .collection_changed
            .trigger(&CollectionChange::Deleted(name.to_string()));
        Some(removed)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.collections.len()
    }
}

#[async_trait]
impl CollectionProvider for CollectionStore {
    async fn find_collection(&self, name: &str) -> anyhow::Result<Option<Arc<Collection>>> {
        Ok(self.get(name))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rulebase_core::{CollectionType, FieldDef, FieldType, RuleError, RuleName, RuleSet};

    use super::*;

    fn store() -> (CollectionStore, Arc<AppHooks>) {
        let hooks = AppHooks::new();
        (CollectionStore::new(Arc::clone(&hooks)), hooks)
    }

    fn relation(name: &str, target: &str) -> FieldDef {
        FieldDef::new(
            name,
            FieldType::Relation {
                collection: target.to_string(),
                max_select: None,
            },
        )
    }

    #[test]
    fn malformed_rule_is_rejected_and_not_persisted() {
        let (store, _) = store();
        let posts = Collection::new("posts", CollectionType::Base).with_rules(RuleSet {
            list_rule: Some("a && ".to_string()),
            ..RuleSet::default()
        });

        let err = store.save(posts).unwrap_err();
        let SchemaError::Rule(RuleError { rule, source }) = err else {
            panic!("expected rule error, got {err:?}");
        };
        assert_eq!(rule, RuleName::List);
        assert_eq!(source.position, 5);
        assert!(store.get("posts").is_none());
    }

    #[test]
    fn relation_target_must_exist() {
        let (store, _) = store();
        let comments =
            Collection::new("comments", CollectionType::Base).with_field(relation("post", "posts"));
        assert!(matches!(
            store.save(comments.clone()),
            Err(SchemaError::UnknownRelationTarget { .. })
        ));

        store
            .save(Collection::new("posts", CollectionType::Base))
            .unwrap();
        assert!(store.save(comments).is_ok());

        let tree =
            Collection::new("nodes", CollectionType::Base).with_field(relation("parent", "nodes"));
        assert!(store.save(tree).is_ok());
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn save_and_delete_fire_hooks() {
        let (store, hooks) = store();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        hooks.collection_changed.add(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        store
            .save(Collection::new("posts", CollectionType::Base))
            .unwrap();
        assert!(store.delete("posts").is_some());
        assert!(store.delete("posts").is_none());
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn provider_reads_saved_definition() {
        let (store, _) = store();
        store
            .save(Collection::new("users", CollectionType::Auth))
            .unwrap();
        let found = store.find_collection("users").await.unwrap().unwrap();
        assert!(found.is_auth());
        assert!(store.find_collection("nope").await.unwrap().is_none());
        assert_eq!(store.list().len(), 1);
    }
}
