//! The launch-mechanism seam shared by process and container mode.
//!
//! A [`Launcher`] knows how to build, launch, probe and terminate one kind of
//! instance. The supervisor owns the lifecycle; launchers only perform the
//! external calls and translate their failures into [`LaunchError`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::env::EnvVars;
use crate::logstream::{self, OutputStream};
use crate::output::{LogSink, SharedSink, StreamKind};

/// Failures of one project's lifecycle. Reported to its sink, never fatal.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("build failed: {0}")]
    Build(String),
    #[error("build timed out after {}s", .0.as_secs())]
    BuildTimeout(Duration),
    #[error("launch failed: {0}")]
    Spawn(String),
    #[error("instance {0} is no longer running")]
    StaleHandle(String),
    #[error("failed to stop instance: {0}")]
    Terminate(String),
    #[error("container engine error: {0}")]
    Engine(String),
}

/// Everything a launcher needs to build and start one project.
pub struct LaunchRequest {
    pub project: String,
    pub dir: PathBuf,
    pub env: EnvVars,
    pub sink: SharedSink,
}

/// A freshly launched instance.
pub struct Launched {
    pub handle: String,
    pub output: OutputStream,
}

/// What a liveness probe observed for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The instance finished; the code is known only when the launcher reaped it.
    Exited { code: Option<i32> },
    /// No instance with this handle exists.
    Gone,
}

pub trait Launcher: Send + Sync + 'static {
    /// Runs the build step. Output goes to `req.sink` while it runs.
    fn build(&self, req: &LaunchRequest) -> impl Future<Output = Result<(), LaunchError>> + Send;

    fn launch(&self, req: &LaunchRequest)
        -> impl Future<Output = Result<Launched, LaunchError>> + Send;

    /// Stops the instance. `StaleHandle` means there was nothing left to stop.
    fn terminate(&self, handle: &str) -> impl Future<Output = Result<(), LaunchError>> + Send;

    fn status(&self, handle: &str) -> impl Future<Output = Liveness> + Send;

    /// Re-opens the output of an instance launched by an earlier run, if possible.
    fn reattach(&self, handle: &str) -> impl Future<Output = Option<OutputStream>> + Send;
}

/// Prepends a fixed tag to every line, e.g. `[build] `.
struct Prefixed {
    inner: SharedSink,
    prefix: &'static str,
}

impl LogSink for Prefixed {
    fn append(&self, stream: StreamKind, text: &str) {
        self.inner.append(stream, &format!("{}{}", self.prefix, text));
    }
}

/// Runs an external step to completion in `dir`, streaming its output to `sink`.
///
/// Non-zero exit becomes [`LaunchError::Build`]; with a `timeout` the step is
/// killed once it elapses.
pub async fn run_step(
    label: &'static str,
    command_line: &str,
    dir: &Path,
    sink: &SharedSink,
    timeout: Option<Duration>,
) -> Result<(), LaunchError> {
    let mut command = command_from_line(command_line).map_err(LaunchError::Build)?;
    command
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    run_command(label, command, command_line, sink, timeout).await
}

/// Like [`run_step`] for an already assembled command.
pub async fn run_command(
    label: &'static str,
    mut command: Command,
    display: &str,
    sink: &SharedSink,
    timeout: Option<Duration>,
) -> Result<(), LaunchError> {
    sink.notice(&format!("{}: {}", label, display));
    let mut child = command
        .spawn()
        .map_err(|err| LaunchError::Build(format!("failed to run `{}`: {}", display, err)))?;

    let prefix = match label {
        "build" => "[build] ",
        "image" => "[image] ",
        _ => "",
    };
    let tagged: SharedSink = std::sync::Arc::new(Prefixed {
        inner: sink.clone(),
        prefix,
    });
    let mut output = OutputStream::new();
    if let Some(stdout) = child.stdout.take() {
        output = output.with_reader(StreamKind::Stdout, stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        output = output.with_reader(StreamKind::Stderr, stderr);
    }
    let attachment = logstream::attach(label, output, tagged);

    let status = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                let _ = child.kill().await;
                attachment.detach();
                return Err(LaunchError::BuildTimeout(limit));
            }
        },
        None => child.wait().await,
    };
    let status = status.map_err(|err| LaunchError::Build(err.to_string()))?;

    // Let the readers drain what the step printed last; a grandchild holding
    // the pipe open must not stall the start.
    if !attachment.drain(Duration::from_secs(2)).await {
        debug!(label, "output readers still open after step exit");
    }

    if status.success() {
        Ok(())
    } else {
        let code = status
            .code()
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(LaunchError::Build(format!(
            "`{}` exited with {}",
            display, code
        )))
    }
}

/// Splits a configured command line into a [`Command`].
pub fn command_from_line(command_line: &str) -> Result<Command, String> {
    let mut parts = shell_words::split(command_line)
        .map_err(|err| format!("invalid command `{}`: {}", command_line, err))?;
    if parts.is_empty() {
        return Err("empty command".to_string());
    }
    let program = parts.remove(0);
    let mut command = Command::new(program);
    command.args(parts);
    Ok(command)
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::output::MemorySink;

    #[tokio::test]
    async fn run_step_streams_output_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        let shared: SharedSink = sink.clone();
        run_step("build", "sh -c 'echo compiling; echo warn >&2'", dir.path(), &shared, None)
            .await
            .unwrap();
        assert!(sink.contains("[build] compiling"));
        assert!(sink.contains("[build] warn"));
    }

    #[tokio::test]
    async fn run_step_reports_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let shared: SharedSink = Arc::new(MemorySink::default());
        let err = run_step("build", "sh -c 'exit 3'", dir.path(), &shared, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Build(ref msg) if msg.contains("exited with 3")));
    }

    #[tokio::test]
    async fn run_step_honors_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let shared: SharedSink = Arc::new(MemorySink::default());
        let err = run_step(
            "build",
            "sleep 5",
            dir.path(),
            &shared,
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LaunchError::BuildTimeout(_)));
    }

    #[tokio::test]
    async fn missing_program_is_a_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let shared: SharedSink = Arc::new(MemorySink::default());
        let err = run_step("build", "definitely-not-a-real-binary-xyz", dir.path(), &shared, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Build(_)));
    }

    #[test]
    fn command_from_line_rejects_empty() {
        assert!(command_from_line("   ").is_err());
        assert!(command_from_line("mvn 'unterminated").is_err());
    }
}
