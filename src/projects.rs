//! Project discovery under the base directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::store::{Store, StoreError};

/// Top-level key pinning the base directory between runs.
pub const PROJECTS_DIR_KEY: &str = "projects_dir";

/// Resolves the base directory: an explicit override is stored, otherwise the
/// first run pins `fallback` and later runs reuse it.
pub fn pin_base_dir(
    store: &Store,
    explicit: Option<&Path>,
    fallback: &Path,
) -> Result<PathBuf, StoreError> {
    if let Some(dir) = explicit {
        store.set(PROJECTS_DIR_KEY, Value::String(dir.display().to_string()))?;
        return Ok(dir.to_path_buf());
    }
    let pinned = store.get_or_default(
        PROJECTS_DIR_KEY,
        Value::String(fallback.display().to_string()),
    )?;
    Ok(pinned
        .as_str()
        .map(PathBuf::from)
        .unwrap_or_else(|| fallback.to_path_buf()))
}

/// Names of the non-hidden subdirectories of `base`, sorted.
pub fn discover(base: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(base)
        .with_context(|| format!("failed to list projects in {}", base.display()))?;
    let mut projects = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", base.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        projects.push(name);
    }
    projects.sort();
    Ok(projects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_lists_sorted_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("web")).unwrap();
        std::fs::create_dir(dir.path().join("api")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("data.json"), "{}").unwrap();
        assert_eq!(discover(dir.path()).unwrap(), vec!["api", "web"]);
    }

    #[test]
    fn discover_missing_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn base_dir_is_pinned_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data.json"));
        let first = pin_base_dir(&store, None, Path::new("/first")).unwrap();
        let second = pin_base_dir(&store, None, Path::new("/second")).unwrap();
        assert_eq!(first, PathBuf::from("/first"));
        assert_eq!(second, PathBuf::from("/first"));

        let explicit = pin_base_dir(&store, Some(Path::new("/explicit")), Path::new("/x")).unwrap();
        assert_eq!(explicit, PathBuf::from("/explicit"));
        assert_eq!(
            pin_base_dir(&store, None, Path::new("/third")).unwrap(),
            PathBuf::from("/explicit")
        );
    }
}
