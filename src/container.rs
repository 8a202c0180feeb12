//! Container mode: projects run as containers through the engine CLI.
//!
//! Building a project means running its build command, writing a Dockerfile
//! that bakes in the effective environment, and building an image tagged
//! `<project>:latest`. The handle is the container id printed by `docker run`.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ContainerSettings;
use crate::env::{self, EnvVars};
use crate::launcher::{run_command, run_step, LaunchError, LaunchRequest, Launched, Launcher, Liveness};
use crate::logstream::OutputStream;
use crate::output::StreamKind;

/// Lines of history replayed when re-attaching to a container from an earlier run.
const REATTACH_TAIL: &str = "50";

pub struct ContainerLauncher {
    build_cmd: String,
    build_timeout: Option<Duration>,
    settings: ContainerSettings,
}

impl ContainerLauncher {
    pub fn new(
        build_cmd: impl Into<String>,
        build_timeout: Option<Duration>,
        settings: ContainerSettings,
    ) -> Self {
        Self {
            build_cmd: build_cmd.into(),
            build_timeout,
            settings,
        }
    }

    fn docker(&self) -> Command {
        let mut command = Command::new(&self.settings.docker);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    /// Runs a short engine command and returns its stdout.
    async fn engine(&self, args: &[String]) -> Result<String, EngineFailure> {
        let output = self
            .docker()
            .args(args)
            .output()
            .await
            .map_err(|err| EngineFailure::Unavailable(format!("{}: {}", self.settings.docker, err)))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(EngineFailure::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn follow_logs(&self, handle: &str, tail: Option<&str>) -> Option<OutputStream> {
        let mut command = self.docker();
        command.arg("logs").arg("--follow");
        if let Some(tail) = tail {
            command.arg("--tail").arg(tail);
        }
        command
            .arg(handle)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(handle, error = %err, "failed to follow container logs");
                return None;
            }
        };
        let mut output = OutputStream::new();
        if let Some(stdout) = child.stdout.take() {
            output = output.with_reader(StreamKind::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            output = output.with_reader(StreamKind::Stderr, stderr);
        }
        Some(output.with_guard(child))
    }
}

#[derive(Debug)]
enum EngineFailure {
    /// The engine binary could not be run at all.
    Unavailable(String),
    /// The engine ran and refused the request.
    Rejected(String),
}

impl Launcher for ContainerLauncher {
    async fn build(&self, req: &LaunchRequest) -> Result<(), LaunchError> {
        run_step("build", &self.build_cmd, &req.dir, &req.sink, self.build_timeout).await?;

        let dockerfile = req.dir.join("Dockerfile");
        let content = render_dockerfile(&req.env, &self.settings);
        tokio::fs::write(&dockerfile, content).await.map_err(|err| {
            LaunchError::Build(format!("failed to write {}: {}", dockerfile.display(), err))
        })?;

        let tag = image_tag(&req.project);
        let mut command = self.docker();
        command
            .arg("build")
            .arg("--rm")
            .arg("-t")
            .arg(&tag)
            .arg(&req.dir)
            .current_dir(&req.dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let display = format!("{} build -t {} {}", self.settings.docker, tag, req.dir.display());
        run_command("image", command, &display, &req.sink, self.build_timeout).await
    }

    async fn launch(&self, req: &LaunchRequest) -> Result<Launched, LaunchError> {
        let args = run_args(&req.project, &req.env, &self.settings);
        let handle = match self.engine(&args).await {
            Ok(id) if !id.is_empty() => id,
            Ok(_) => return Err(LaunchError::Spawn("engine returned no container id".to_string())),
            Err(EngineFailure::Unavailable(msg)) => return Err(LaunchError::Engine(msg)),
            Err(EngineFailure::Rejected(msg)) => return Err(LaunchError::Spawn(msg)),
        };
        info!(project = %req.project, container = %handle, "container started");
        let output = self.follow_logs(&handle, None).unwrap_or_default();
        Ok(Launched { handle, output })
    }

    async fn terminate(&self, handle: &str) -> Result<(), LaunchError> {
        match self.engine(&["stop".to_string(), handle.to_string()]).await {
            Ok(_) => Ok(()),
            Err(EngineFailure::Rejected(msg)) if is_not_found(&msg) => {
                Err(LaunchError::StaleHandle(handle.to_string()))
            }
            Err(EngineFailure::Rejected(msg)) => Err(LaunchError::Terminate(msg)),
            Err(EngineFailure::Unavailable(msg)) => Err(LaunchError::Engine(msg)),
        }
    }

    async fn status(&self, handle: &str) -> Liveness {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}} {{.State.ExitCode}}".to_string(),
            handle.to_string(),
        ];
        match self.engine(&args).await {
            Ok(out) => parse_inspect(&out),
            Err(EngineFailure::Rejected(msg)) if is_not_found(&msg) => Liveness::Gone,
            Err(err) => {
                // An unreachable engine says nothing about the container.
                warn!(handle, error = ?err, "container inspect failed");
                Liveness::Alive
            }
        }
    }

    async fn reattach(&self, handle: &str) -> Option<OutputStream> {
        self.follow_logs(handle, Some(REATTACH_TAIL))
    }
}

/// Image tag for a project; engines require lowercase repository names.
pub fn image_tag(project: &str) -> String {
    format!("{}:latest", project.to_lowercase())
}

/// Arguments for `docker run` for one project.
pub fn run_args(project: &str, env: &EnvVars, settings: &ContainerSettings) -> Vec<String> {
    let port = env::service_port(env);
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        project.to_string(),
    ];
    if let Some(network) = &settings.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    args.push("--publish".to_string());
    args.push(format!("{}:{}", port, port));
    for (key, value) in env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(image_tag(project));
    args
}

pub fn render_dockerfile(env: &EnvVars, settings: &ContainerSettings) -> String {
    let mut out = String::new();
    out.push_str(&format!("FROM {}\n", settings.base_image));
    out.push_str("WORKDIR /app\n");
    out.push_str(&format!("COPY {} app.jar\n", settings.artifact));
    for (key, value) in env {
        out.push_str(&format!("ENV {}=\"{}\"\n", key, escape_env_value(value)));
    }
    out.push_str(&format!("EXPOSE {}\n", env::service_port(env)));

    let mut cmd = vec!["java".to_string()];
    cmd.extend(settings.java_opts.split_whitespace().map(str::to_string));
    cmd.extend(["-jar".to_string(), "app.jar".to_string()]);
    let cmd = cmd
        .iter()
        .map(|part| format!("\"{}\"", escape_env_value(part)))
        .collect::<Vec<_>>()
        .join(", ");
    out.push_str(&format!("CMD [{}]\n", cmd));
    out
}

fn escape_env_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn parse_inspect(out: &str) -> Liveness {
    let mut parts = out.split_whitespace();
    let state = parts.next().unwrap_or("");
    let code = parts.next().and_then(|code| code.parse::<i32>().ok());
    match state {
        "exited" | "dead" => Liveness::Exited { code },
        "" => Liveness::Gone,
        _ => Liveness::Alive,
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}
