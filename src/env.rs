//! Effective environment resolution and the `key=value` variable format.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::projects::PROJECTS_DIR_KEY;
use crate::registry::{CONTAINERS_KEY, PROCESSES_KEY};
use crate::store::{Store, StoreError};

/// Top-level key holding the variables shared by every project.
pub const DEFAULT_ENV_KEY: &str = "default_env_vars";
/// Variable naming the port a project listens on.
pub const PORT_KEY: &str = "server.port";
pub const DEFAULT_PORT: &str = "8080";

/// Variables used to launch one instance. Ordered so generated commands are stable.
pub type EnvVars = BTreeMap<String, String>;

/// Top-level keys that belong to the supervisor, never to a project.
pub const RESERVED_KEYS: [&str; 4] = [DEFAULT_ENV_KEY, PROJECTS_DIR_KEY, PROCESSES_KEY, CONTAINERS_KEY];

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("`{0}` is a reserved name and cannot be used as a project")]
    ReservedName(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Project overrides share the top level with the supervisor's own entries.
pub fn is_reserved(project: &str) -> bool {
    RESERVED_KEYS.contains(&project)
}

pub fn check_project(project: &str) -> Result<(), EnvError> {
    if is_reserved(project) {
        return Err(EnvError::ReservedName(project.to_string()));
    }
    Ok(())
}

/// Merges the global defaults with `project`'s overrides; overrides win.
///
/// The project's override entry is created (empty) on first use.
pub fn resolve(store: &Store, project: &str) -> Result<EnvVars, EnvError> {
    check_project(project)?;
    let defaults = store.get(DEFAULT_ENV_KEY).map(to_vars).unwrap_or_default();
    let overrides = to_vars(store.get_or_default(project, Value::Object(Map::new()))?);
    let mut merged = defaults;
    merged.extend(overrides);
    Ok(merged)
}

pub fn defaults(store: &Store) -> EnvVars {
    store.get(DEFAULT_ENV_KEY).map(to_vars).unwrap_or_default()
}

pub fn overrides(store: &Store, project: &str) -> Result<EnvVars, EnvError> {
    check_project(project)?;
    Ok(store.get(project).map(to_vars).unwrap_or_default())
}

pub fn set_defaults(store: &Store, vars: &EnvVars) -> Result<(), StoreError> {
    store.set(DEFAULT_ENV_KEY, to_value(vars))
}

pub fn set_overrides(store: &Store, project: &str, vars: &EnvVars) -> Result<(), EnvError> {
    check_project(project)?;
    store.set(project, to_value(vars))?;
    Ok(())
}

/// The published port for an effective environment.
pub fn service_port(vars: &EnvVars) -> &str {
    vars.get(PORT_KEY)
        .map(String::as_str)
        .filter(|port| !port.trim().is_empty())
        .unwrap_or(DEFAULT_PORT)
}

/// Parses `key=value` lines. Lines without `=` or without a key are skipped;
/// only the first `=` splits.
pub fn parse_lines(text: &str) -> EnvVars {
    text.lines()
        .map(str::trim)
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

pub fn format_lines(vars: &EnvVars) -> String {
    vars.iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect()
}

// Stored values are normally strings; anything else is kept in its JSON form.
fn to_vars(value: Value) -> EnvVars {
    let Value::Object(map) = value else {
        return EnvVars::new();
    };
    map.into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect()
}

fn to_value(vars: &EnvVars) -> Value {
    Value::Object(
        vars.iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> EnvVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn override_wins_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data.json"));
        set_defaults(&store, &vars(&[("A", "1"), ("B", "2")])).unwrap();
        set_overrides(&store, "api", &vars(&[("B", "3"), ("C", "4")])).unwrap();

        let resolved = resolve(&store, "api").unwrap();
        assert_eq!(resolved, vars(&[("A", "1"), ("B", "3"), ("C", "4")]));
    }

    #[test]
    fn resolve_seeds_empty_override_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data.json"));
        let resolved = resolve(&store, "web").unwrap();
        assert!(resolved.is_empty());
        assert_eq!(store.get("web"), Some(json!({})));
    }

    #[test]
    fn resolve_reads_latest_edit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data.json"));
        set_overrides(&store, "api", &vars(&[(PORT_KEY, "9000")])).unwrap();
        assert_eq!(resolve(&store, "api").unwrap()[PORT_KEY], "9000");
        set_overrides(&store, "api", &vars(&[(PORT_KEY, "9001")])).unwrap();
        assert_eq!(resolve(&store, "api").unwrap()[PORT_KEY], "9001");
    }

    #[test]
    fn non_string_values_are_stringified() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data.json"));
        store
            .set(DEFAULT_ENV_KEY, json!({ "server.port": 9090, "debug": true }))
            .unwrap();
        let resolved = resolve(&store, "api").unwrap();
        assert_eq!(resolved[PORT_KEY], "9090");
        assert_eq!(resolved["debug"], "true");
    }

    #[test]
    fn parse_lines_keeps_equals_in_value() {
        let parsed = parse_lines("spring.datasource.url=jdbc:h2:mem:x;MODE=PG\n\njunk\n A=1 \n");
        assert_eq!(
            parsed,
            vars(&[("spring.datasource.url", "jdbc:h2:mem:x;MODE=PG"), ("A", "1")])
        );
    }

    #[test]
    fn parse_lines_skips_empty_keys() {
        assert_eq!(parse_lines("=value\n  =x\nA=1"), vars(&[("A", "1")]));
    }

    #[test]
    fn reserved_names_are_not_projects() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data.json"));
        store.add_dict(PROCESSES_KEY, "api", json!("4242")).unwrap();

        for name in RESERVED_KEYS {
            assert!(matches!(resolve(&store, name), Err(EnvError::ReservedName(_))));
            assert!(matches!(overrides(&store, name), Err(EnvError::ReservedName(_))));
            assert!(matches!(
                set_overrides(&store, name, &EnvVars::new()),
                Err(EnvError::ReservedName(_))
            ));
        }
        assert_eq!(store.get(PROCESSES_KEY), Some(json!({ "api": "4242" })));
        assert_eq!(store.get(DEFAULT_ENV_KEY), None);
    }

    #[test]
    fn format_lines_is_parseable() {
        let original = vars(&[("server.port", "9090"), ("X", "a=b")]);
        assert_eq!(format_lines(&original), "X=a=b\nserver.port=9090\n");
        assert_eq!(parse_lines(&format_lines(&original)), original);
    }

    #[test]
    fn service_port_defaults_to_8080() {
        assert_eq!(service_port(&EnvVars::new()), "8080");
        assert_eq!(service_port(&vars(&[(PORT_KEY, "9090")])), "9090");
        assert_eq!(service_port(&vars(&[(PORT_KEY, " ")])), "8080");
    }
}
