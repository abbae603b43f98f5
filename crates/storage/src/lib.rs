pub mod error;
pub mod file;
pub mod memory;
pub mod sqlite;

use snafu::ensure;

pub use error::{StorageError, StorageResult};
pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use error::EmptyKeySnafu;

/// Durable string key-value contract used by the chat core.
///
/// Deleting a key that is not present succeeds.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn delete(&self, key: &str) -> StorageResult<()>;
}

pub(crate) fn validate_key(key: &str, stage: &'static str) -> StorageResult<()> {
    ensure!(!key.trim().is_empty(), EmptyKeySnafu { stage });
    Ok(())
}
