//! Configuration management for projrack.
//!
//! This module defines the structure of the `projrack.toml` configuration file
//! and the resolved settings the supervisor runs with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::registry::{CONTAINERS_KEY, PROCESSES_KEY};

pub const DEFAULT_STATE_FILE: &str = "data.json";
pub const DEFAULT_BUILD_CMD: &str = "mvn clean package -DskipTests";
pub const DEFAULT_RUN_CMD: &str = "java -jar target/app.jar";
pub const DEFAULT_JAVA_OPTS: &str = "-Xms256m -Xmx512m -Djava.awt.headless=false";

/// How a project's instance is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Native OS process started from the run command.
    #[default]
    Process,
    /// Container started through the engine CLI.
    Container,
}

impl LaunchMode {
    /// Reserved top-level key for this mode's runtime handles.
    pub fn registry_key(self) -> &'static str {
        match self {
            LaunchMode::Process => PROCESSES_KEY,
            LaunchMode::Container => CONTAINERS_KEY,
        }
    }
}

/// Top-level configuration structure corresponding to `projrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Path of the persisted state document.
    pub state_file: Option<String>,
    /// Base directory holding one subdirectory per project.
    pub projects_dir: Option<String>,
    /// Launch mechanism ("process" or "container").
    pub mode: Option<LaunchMode>,
    /// Build step run in the project directory before every start.
    pub build_cmd: Option<String>,
    /// Run step for process mode.
    pub run_cmd: Option<String>,
    /// Prefix for the per-variable arguments appended to the run step.
    pub arg_prefix: Option<String>,
    /// Liveness poll period in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Time to wait after SIGTERM before force-killing (ms).
    pub shutdown_grace_ms: Option<u64>,
    /// Upper bound for the build step; unbounded when unset.
    pub build_timeout_secs: Option<u64>,
    /// Whether to strip ANSI codes from console output.
    pub strip_ansi: Option<bool>,
    /// Container-mode settings.
    pub container: Option<ContainerConfig>,
}

/// Settings for the `[container]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfig {
    /// Base image written into the generated Dockerfile.
    pub base_image: Option<String>,
    /// Build artifact copied into the image.
    pub artifact: Option<String>,
    /// JVM options for the image's CMD.
    pub java_opts: Option<String>,
    /// Network passed to `docker run`.
    pub network: Option<String>,
    /// Engine CLI binary.
    pub docker: Option<String>,
}

/// Fully resolved container settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    pub base_image: String,
    pub artifact: String,
    pub java_opts: String,
    pub network: Option<String>,
    pub docker: String,
}

impl From<ContainerConfig> for ContainerSettings {
    fn from(config: ContainerConfig) -> Self {
        Self {
            base_image: config
                .base_image
                .unwrap_or_else(|| "openjdk:11-jre-slim".to_string()),
            artifact: config.artifact.unwrap_or_else(|| "target/*.jar".to_string()),
            java_opts: config
                .java_opts
                .unwrap_or_else(|| DEFAULT_JAVA_OPTS.to_string()),
            network: config.network.filter(|n| !n.trim().is_empty()),
            docker: config.docker.unwrap_or_else(|| "docker".to_string()),
        }
    }
}

/// Settings after merging the config file with defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub state_file: PathBuf,
    pub projects_dir: Option<PathBuf>,
    pub mode: LaunchMode,
    pub build_cmd: String,
    pub run_cmd: String,
    pub arg_prefix: String,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub build_timeout: Option<Duration>,
    pub strip_ansi: bool,
    pub container: ContainerSettings,
}

impl Settings {
    pub fn from_config(config: Config) -> Self {
        Self {
            state_file: PathBuf::from(
                config
                    .state_file
                    .unwrap_or_else(|| DEFAULT_STATE_FILE.to_string()),
            ),
            projects_dir: config.projects_dir.map(PathBuf::from),
            mode: config.mode.unwrap_or_default(),
            build_cmd: config
                .build_cmd
                .unwrap_or_else(|| DEFAULT_BUILD_CMD.to_string()),
            run_cmd: config.run_cmd.unwrap_or_else(|| DEFAULT_RUN_CMD.to_string()),
            arg_prefix: config.arg_prefix.unwrap_or_else(|| "--".to_string()),
            poll_interval: Duration::from_millis(
                config.poll_interval_ms.unwrap_or(500).clamp(100, 60_000),
            ),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms.unwrap_or(5000)),
            build_timeout: config
                .build_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            strip_ansi: config.strip_ansi.unwrap_or(false),
            container: config.container.unwrap_or_default().into(),
        }
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// `projrack.toml` in the current directory, if present.
pub fn default_config_path() -> Option<PathBuf> {
    let path = Path::new("projrack.toml");
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
state_file = "state/projrack.json"
projects_dir = "/srv/services"
mode = "container"
build_cmd = "gradle build"
run_cmd = "java -jar build/libs/app.jar"
arg_prefix = "-D"
poll_interval_ms = 1000
shutdown_grace_ms = 250
build_timeout_secs = 600
strip_ansi = true

[container]
base_image = "eclipse-temurin:17-jre"
artifact = "build/libs/*.jar"
java_opts = "-Xmx1g"
network = "docker_network"
docker = "podman"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.mode, Some(LaunchMode::Container));
        assert_eq!(config.poll_interval_ms, Some(1000));

        let settings = Settings::from_config(config);
        assert_eq!(settings.state_file, PathBuf::from("state/projrack.json"));
        assert_eq!(settings.projects_dir, Some(PathBuf::from("/srv/services")));
        assert_eq!(settings.build_cmd, "gradle build");
        assert_eq!(settings.arg_prefix, "-D");
        assert_eq!(settings.shutdown_grace, Duration::from_millis(250));
        assert_eq!(settings.build_timeout, Some(Duration::from_secs(600)));
        assert!(settings.strip_ansi);
        assert_eq!(settings.container.network.as_deref(), Some("docker_network"));
        assert_eq!(settings.container.docker, "podman");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        let settings = Settings::from_config(config);
        assert_eq!(settings.state_file, PathBuf::from(DEFAULT_STATE_FILE));
        assert_eq!(settings.mode, LaunchMode::Process);
        assert_eq!(settings.build_cmd, DEFAULT_BUILD_CMD);
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.build_timeout, None);
        assert_eq!(settings.container.base_image, "openjdk:11-jre-slim");
        assert_eq!(settings.container.java_opts, DEFAULT_JAVA_OPTS);
        assert_eq!(settings.container.network, None);
    }

    #[test]
    fn poll_interval_is_clamped() {
        let config: Config = toml::from_str("poll_interval_ms = 1").unwrap();
        assert_eq!(
            Settings::from_config(config).poll_interval,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn registry_key_depends_on_mode() {
        assert_eq!(LaunchMode::Process.registry_key(), "PROCESSES");
        assert_eq!(LaunchMode::Container.registry_key(), "CONTAINERS");
    }
}
