//! In-memory providers for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::record::Record;
use crate::schema::Collection;
use crate::traits::{CollectionProvider, RecordProvider};

#[derive(Default)]
pub struct MemoryProvider {
    collections: Mutex<HashMap<String, Arc<Collection>>>,
    records: Mutex<HashMap<String, Vec<Record>>>,
    failing: AtomicBool,
}

impl MemoryProvider {
    pub fn add_collection(&self, collection: Collection) {
        self.collections
            .lock()
            .unwrap()
            .insert(collection.name.clone(), Arc::new(collection));
    }

    pub fn add_record(&self, record: Record) {
        self.records
            .lock()
            .unwrap()
            .entry(record.collection_name.clone())
            .or_default()
            .push(record);
    }

    pub fn collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.lock().unwrap().get(name).cloned()
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<Record> {
        self.records
            .lock()
            .unwrap()
            .get(collection)?
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Makes every record lookup fail from now on.
    pub fn fail_lookups(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("record store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl CollectionProvider for MemoryProvider {
    async fn find_collection(&self, name: &str) -> anyhow::Result<Option<Arc<Collection>>> {
        Ok(self.collection(name))
    }
}

#[async_trait]
impl RecordProvider for MemoryProvider {
    async fn find_record(&self, collection: &str, id: &str) -> anyhow::Result<Option<Record>> {
        self.check()?;
        Ok(self.record(collection, id))
    }

    async fn find_records(&self, collection: &str, ids: &[String]) -> anyhow::Result<Vec<Record>> {
        self.check()?;
        Ok(ids
            .iter()
            .filter_map(|id| self.record(collection, id))
            .collect())
    }

    async fn find_all(&self, collection: &str) -> anyhow::Result<Vec<Record>> {
        self.check()?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }
}
