//! Durable key-value state shared by every part of the supervisor.
//!
//! The whole document is a single JSON object kept in memory and rewritten to
//! disk (temp file + rename) after every mutation. A missing or malformed file
//! loads as an empty document; a failed write is returned to the caller.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// A persistence fault. Unlike a corrupt document, this is never recovered locally.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// JSON-object backed store with whole-file rewrite on every mutation.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl Store {
    /// Loads the document at `path`, treating a missing or unreadable file as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = load_document(&path);
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Returns the value at `key`, storing `default` first if the key is absent.
    pub fn get_or_default(&self, key: &str, default: Value) -> Result<Value, StoreError> {
        let mut stored = default.clone();
        self.mutate(|data| match data.get(key) {
            Some(existing) => {
                stored = existing.clone();
                false
            }
            None => {
                data.insert(key.to_string(), default);
                true
            }
        })?;
        Ok(stored)
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.mutate(|data| {
            data.insert(key.to_string(), value);
            true
        })
    }

    /// Sets `subkey` inside the map at `key`, creating the map when needed.
    ///
    /// A non-object value already stored under `key` is replaced by a fresh map.
    pub fn add_dict(&self, key: &str, subkey: &str, subvalue: Value) -> Result<(), StoreError> {
        self.mutate(|data| {
            let entry = data
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(map) = entry {
                map.insert(subkey.to_string(), subvalue);
            }
            true
        })
    }

    /// Removes `subkey` from the map at `key`. Absent key or subkey is a no-op.
    pub fn remove_dict(&self, key: &str, subkey: &str) -> Result<(), StoreError> {
        self.mutate(|data| match data.get_mut(key) {
            Some(Value::Object(map)) => map.remove(subkey).is_some(),
            _ => false,
        })
    }

    /// Applies `change` to a copy of the document and commits it only once the
    /// copy is on disk. `change` returns false when it left the copy untouched.
    fn mutate<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Map<String, Value>) -> bool,
    {
        let mut data = self.lock();
        let mut next = data.clone();
        if !change(&mut next) {
            return Ok(());
        }
        self.persist(&next)?;
        *data = next;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        // A panic mid-mutation still leaves a well-formed map behind.
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Called with the lock held so read-modify-persist is one critical section.
    fn persist(&self, data: &Map<String, Value>) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(data)?;
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;
        debug!(path = %self.path.display(), keys = data.len(), "state persisted");
        Ok(())
    }
}

fn load_document(path: &Path) -> Map<String, Value> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Map::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "state file unreadable, starting empty");
            return Map::new();
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(path = %path.display(), "state file is not a JSON object, starting empty");
            Map::new()
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "state file is corrupt, starting empty");
            Map::new()
        }
    }
}
