use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::error::{InvariantViolationSnafu, StorageResult};
use super::{KeyValueStore, validate_key};

/// Process-local store; contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, HashMap<String, String>>> {
        match self.entries.lock() {
            Ok(entries) => Ok(entries),
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "memory store lock is poisoned".to_string(),
            }
            .fail(),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        validate_key(key, "memory-get")?;
        Ok(self.entries("memory-get")?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        validate_key(key, "memory-set")?;
        self.entries("memory-set")?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key, "memory-delete")?;
        self.entries("memory-delete")?.remove(key);
        Ok(())
    }
}
