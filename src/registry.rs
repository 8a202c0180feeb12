//! Tracks which project currently owns which live instance.
//!
//! Handles live in the persisted document under one reserved top-level key so
//! they survive supervisor restarts and can be reconciled on the next run.

use std::sync::Arc;

use serde_json::Value;

use crate::store::{Store, StoreError};

/// Reserved key for process-mode handles (decimal PIDs).
pub const PROCESSES_KEY: &str = "PROCESSES";
/// Reserved key for container-mode handles (container ids).
pub const CONTAINERS_KEY: &str = "CONTAINERS";

#[derive(Debug, Clone)]
pub struct HandleRegistry {
    store: Arc<Store>,
    key: &'static str,
}

impl HandleRegistry {
    pub fn new(store: Arc<Store>, key: &'static str) -> Self {
        Self { store, key }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn track(&self, project: &str, handle: &str) -> Result<(), StoreError> {
        self.store
            .add_dict(self.key, project, Value::String(handle.to_string()))
    }

    pub fn lookup(&self, project: &str) -> Option<String> {
        let table = self.store.get(self.key)?;
        match table.get(project)? {
            Value::String(handle) => Some(handle.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn untrack(&self, project: &str) -> Result<(), StoreError> {
        self.store.remove_dict(self.key, project)
    }

    /// Snapshot of every tracked `(project, handle)` pair, sorted by project.
    pub fn tracked(&self) -> Vec<(String, String)> {
        let Some(Value::Object(table)) = self.store.get(self.key) else {
            return Vec::new();
        };
        let mut entries: Vec<(String, String)> = table
            .into_iter()
            .filter_map(|(project, handle)| match handle {
                Value::String(handle) => Some((project, handle)),
                Value::Null => None,
                other => Some((project, other.to_string())),
            })
            .collect();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, HandleRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("data.json")));
        (dir, HandleRegistry::new(store, PROCESSES_KEY))
    }

    #[test]
    fn track_lookup_untrack() {
        let (_dir, registry) = registry();
        assert_eq!(registry.lookup("api"), None);
        registry.track("api", "4242").unwrap();
        assert_eq!(registry.lookup("api").as_deref(), Some("4242"));
        registry.untrack("api").unwrap();
        assert_eq!(registry.lookup("api"), None);
        registry.untrack("api").unwrap();
    }

    #[test]
    fn handles_are_independent_of_override_entries() {
        let (_dir, registry) = registry();
        registry.store.set("api", serde_json::json!({ "A": "1" })).unwrap();
        registry.track("api", "17").unwrap();
        registry.untrack("api").unwrap();
        assert_eq!(registry.store.get("api"), Some(serde_json::json!({ "A": "1" })));
    }

    #[test]
    fn tracked_is_sorted() {
        let (_dir, registry) = registry();
        registry.track("web", "2").unwrap();
        registry.track("api", "1").unwrap();
        assert_eq!(
            registry.tracked(),
            vec![
                ("api".to_string(), "1".to_string()),
                ("web".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn numeric_handles_from_older_documents_are_read() {
        let (_dir, registry) = registry();
        registry
            .store
            .set(PROCESSES_KEY, serde_json::json!({ "api": 4242 }))
            .unwrap();
        assert_eq!(registry.lookup("api").as_deref(), Some("4242"));
    }
}
