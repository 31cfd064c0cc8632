//! Request-level services behind the HTTP handlers.
//!
//! - [`RecordService`]: rule-gated record CRUD that publishes realtime events
//! - [`CollectionService`]: admin-only schema management

pub mod collections;
pub mod records;

pub use collections::CollectionService;
pub use records::RecordService;
