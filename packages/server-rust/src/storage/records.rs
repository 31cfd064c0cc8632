//! Record store backed by [`DashMap`], one ordered map per collection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rulebase_core::{Record, RecordProvider};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("record {collection}/{id} already exists")]
    Duplicate { collection: String, id: String },
    #[error("record {collection}/{id} not found")]
    NotFound { collection: String, id: String },
}

/// In-memory record storage.
///
/// Records within a collection are kept in id order so listings are
/// deterministic.
#[derive(Default)]
pub struct MemoryRecordStore {
    collections: DashMap<String, BTreeMap<String, Record>>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<Record> {
        self.collections.get(collection)?.get(id).cloned()
    }

    #[must_use]
    pub fn list(&self, collection: &str) -> Vec<Record> {
        self.collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Duplicate`] when the id is taken.
    pub fn insert(&self, record: Record) -> Result<(), StorageError> {
        let mut records = self
            .collections
            .entry(record.collection_name.clone())
            .or_default();
        if records.contains_key(&record.id) {
            return Err(StorageError::Duplicate {
                collection: record.collection_name,
                id: record.id,
            });
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Replaces an existing record, stamping `updated`; returns the stored copy.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when there is nothing to replace.
    pub fn update(&self, mut record: Record) -> Result<Record, StorageError> {
        let not_found = || StorageError::NotFound {
            collection: record.collection_name.clone(),
            id: record.id.clone(),
        };
        let mut records = self
            .collections
            .get_mut(&record.collection_name)
            .ok_or_else(not_found)?;
        let slot = records.get_mut(&record.id).ok_or_else(not_found)?;
        record.created = slot.created;
        record.updated = Utc::now();
        *slot = record.clone();
        Ok(record)
    }

    /// Removes a record, returning its last state.
    pub fn delete(&self, collection: &str, id: &str) -> Option<Record> {
        self.collections.get_mut(collection)?.remove(id)
    }

    /// Drops every record of a collection.
    pub fn drop_collection(&self, collection: &str) -> usize {
        self.collections
            .remove(collection)
            .map_or(0, |(_, records)| records.len())
    }
}

#[async_trait]
impl RecordProvider for MemoryRecordStore {
    async fn find_record(&self, collection: &str, id: &str) -> anyhow::Result<Option<Record>> {
        Ok(self.get(collection, id))
    }

    async fn find_records(&self, collection: &str, ids: &[String]) -> anyhow::Result<Vec<Record>> {
        let Some(records) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn find_all(&self, collection: &str) -> anyhow::Result<Vec<Record>> {
        Ok(self.list(collection))
    }
}
