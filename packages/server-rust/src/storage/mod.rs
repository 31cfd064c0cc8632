//! In-memory stores for the `Rulebase` server.
//!
//! - [`CollectionStore`]: collection definitions (the schema store)
//! - [`MemoryRecordStore`]: records, grouped per collection
//! - [`AdminStore`]: admin accounts with a cached total
//!
//! The schema and record stores implement the core provider traits so the
//! rule evaluator can read through them.

pub mod admins;
pub mod collections;
pub mod records;

pub use admins::AdminStore;
pub use collections::CollectionStore;
pub use records::{MemoryRecordStore, StorageError};

use rand::Rng;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LENGTH: usize = 15;
/// Longest id a client may choose for a new record.
pub const MAX_ID_LENGTH: usize = 64;

/// Generates a random 15 character lowercase alphanumeric id.
#[must_use]
pub fn generate_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LENGTH)
        .map(|_| char::from(ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())]))
        .collect()
}

/// Client-chosen ids use the same alphabet as realtime topics, so every
/// record stays addressable as `collection/id`.
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LENGTH
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
