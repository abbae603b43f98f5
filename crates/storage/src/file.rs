use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use snafu::ResultExt;

use super::error::{
    CreateDirectorySnafu, DecodeFileSnafu, EncodeFileSnafu, InvariantViolationSnafu,
    ReadFileSnafu, RenameFileSnafu, StorageResult, WriteFileSnafu,
};
use super::{KeyValueStore, validate_key};

/// Key-value store kept as one JSON object on disk.
///
/// Every write rewrites the whole object through a temporary file followed by a rename,
/// so a crash leaves either the old or the new content behind.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> StorageResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let raw = std::fs::read_to_string(&self.path).context(ReadFileSnafu {
            stage: "json-store-read",
            path: display_path(&self.path),
        })?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&raw).context(DecodeFileSnafu {
            stage: "json-store-decode",
            path: display_path(&self.path),
        })
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirectorySnafu {
                stage: "json-store-create-directory",
                path: display_path(parent),
            })?;
        }

        let content = serde_json::to_string_pretty(entries).context(EncodeFileSnafu {
            stage: "json-store-encode",
            path: display_path(&self.path),
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "json-store-write-temporary",
            path: display_path(&temp_path),
        })?;

        std::fs::rename(&temp_path, &self.path).context(RenameFileSnafu {
            stage: "json-store-rename-temporary",
            from: display_path(&temp_path),
            to: display_path(&self.path),
        })?;

        tracing::debug!(path = %self.path.display(), entries = entries.len(), "wrote json key-value store");
        Ok(())
    }

    fn modify<F>(&self, stage: &'static str, apply: F) -> StorageResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool,
    {
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return InvariantViolationSnafu {
                    stage,
                    details: "json store write lock is poisoned".to_string(),
                }
                .fail();
            }
        };

        let mut entries = self.read_entries()?;
        if apply(&mut entries) {
            self.write_entries(&entries)?;
        }
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        validate_key(key, "json-store-get")?;
        Ok(self.read_entries()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        validate_key(key, "json-store-set")?;
        self.modify("json-store-set", |entries| {
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        })
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key, "json-store-delete")?;
        self.modify("json-store-delete", |entries| entries.remove(key).is_some())
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
