use std::sync::Arc;

use async_trait::async_trait;

use crate::record::Record;
use crate::schema::Collection;

/// Read access to collection definitions (the schema store).
#[async_trait]
pub trait CollectionProvider: Send + Sync {
    /// Retrieve a collection definition by name.
    async fn find_collection(&self, name: &str) -> anyhow::Result<Option<Arc<Collection>>>;
}

/// Read access to persisted records (the record store).
///
/// Used by the evaluator to dereference relation fields and `@collection.*`
/// identifiers. Implementations must not fail for unknown ids; missing
/// records are simply absent from the result.
#[async_trait]
pub trait RecordProvider: Send + Sync {
    /// Load a single record by collection and id.
    async fn find_record(&self, collection: &str, id: &str) -> anyhow::Result<Option<Record>>;

    /// Load every existing record among `ids`, in the order of `ids`.
    async fn find_records(&self, collection: &str, ids: &[String]) -> anyhow::Result<Vec<Record>>;

    /// Load all records of a collection.
    async fn find_all(&self, collection: &str) -> anyhow::Result<Vec<Record>>;
}
