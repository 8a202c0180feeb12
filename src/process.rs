//! Process mode: projects run as native OS processes.
//!
//! The handle of a running project is its PID in decimal. Each instance is
//! started in its own process group so termination reaches everything it
//! spawned. Children launched by this supervisor are kept so their exit codes
//! can be reaped; PIDs inherited from an earlier run are probed with signal 0.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::launcher::{
    command_from_line, run_step, LaunchError, LaunchRequest, Launched, Launcher, Liveness,
};
use crate::logstream::OutputStream;
use crate::output::StreamKind;

/// Builds with one command and runs with another, passing the environment as
/// both process variables and `<prefix>key=value` arguments.
pub struct ProcessLauncher {
    build_cmd: String,
    run_cmd: String,
    arg_prefix: String,
    build_timeout: Option<Duration>,
    shutdown_grace: Duration,
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessLauncher {
    pub fn new(
        build_cmd: impl Into<String>,
        run_cmd: impl Into<String>,
        arg_prefix: impl Into<String>,
        build_timeout: Option<Duration>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            build_cmd: build_cmd.into(),
            run_cmd: run_cmd.into(),
            arg_prefix: arg_prefix.into(),
            build_timeout,
            shutdown_grace,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn take_child(&self, pid: u32) -> Option<Child> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid)
    }

    /// Polls an instance that is not our child until it disappears or `grace` elapses.
    async fn wait_for_pid_exit(&self, pid: u32, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !pid_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        !pid_alive(pid)
    }
}

impl Launcher for ProcessLauncher {
    async fn build(&self, req: &LaunchRequest) -> Result<(), LaunchError> {
        run_step("build", &self.build_cmd, &req.dir, &req.sink, self.build_timeout).await
    }

    async fn launch(&self, req: &LaunchRequest) -> Result<Launched, LaunchError> {
        let mut command = command_from_line(&self.run_cmd).map_err(LaunchError::Spawn)?;
        command.args(env_args(&self.arg_prefix, req));
        command
            .current_dir(&req.dir)
            .envs(&req.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|err| LaunchError::Spawn(format!("failed to spawn `{}`: {}", self.run_cmd, err)))?;
        let Some(pid) = child.id() else {
            return Err(LaunchError::Spawn("process exited before it got a pid".to_string()));
        };

        let mut output = OutputStream::new();
        if let Some(stdout) = child.stdout.take() {
            output = output.with_reader(StreamKind::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            output = output.with_reader(StreamKind::Stderr, stderr);
        }
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, child);
        info!(project = %req.project, pid, "process spawned");

        Ok(Launched {
            handle: pid.to_string(),
            output,
        })
    }

    async fn terminate(&self, handle: &str) -> Result<(), LaunchError> {
        let pid = parse_pid(handle)?;
        match self.take_child(pid) {
            Some(mut child) => {
                if let Ok(Some(_)) = child.try_wait() {
                    return Err(LaunchError::StaleHandle(handle.to_string()));
                }
                send_signal(pid, Signal::Term);
                match wait_for_exit(&mut child, self.shutdown_grace).await {
                    Ok(Some(status)) => {
                        debug!(pid, code = ?status.code(), "process exited after SIGTERM");
                        return Ok(());
                    }
                    Ok(None) => {}
                    Err(err) => warn!(pid, error = %err, "waiting for process failed"),
                }
                send_signal(pid, Signal::Kill);
                let _ = child.kill().await;
                child
                    .wait()
                    .await
                    .map(|_| ())
                    .map_err(|err| LaunchError::Terminate(err.to_string()))
            }
            None => {
                if !pid_alive(pid) {
                    return Err(LaunchError::StaleHandle(handle.to_string()));
                }
                send_signal(pid, Signal::Term);
                if self.wait_for_pid_exit(pid, self.shutdown_grace).await {
                    return Ok(());
                }
                send_signal(pid, Signal::Kill);
                if self.wait_for_pid_exit(pid, Duration::from_secs(1)).await {
                    Ok(())
                } else {
                    Err(LaunchError::Terminate(format!(
                        "process {} survived SIGKILL",
                        pid
                    )))
                }
            }
        }
    }

    async fn status(&self, handle: &str) -> Liveness {
        let Ok(pid) = parse_pid(handle) else {
            return Liveness::Gone;
        };
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(child) = children.get_mut(&pid) {
            return match child.try_wait() {
                Ok(None) => Liveness::Alive,
                Ok(Some(status)) => {
                    children.remove(&pid);
                    Liveness::Exited {
                        code: status.code(),
                    }
                }
                Err(err) => {
                    warn!(pid, error = %err, "failed to poll process");
                    children.remove(&pid);
                    Liveness::Exited { code: None }
                }
            };
        }
        drop(children);
        if pid_alive(pid) {
            Liveness::Alive
        } else {
            Liveness::Gone
        }
    }

    async fn reattach(&self, _handle: &str) -> Option<OutputStream> {
        // The pipes of a process started by an earlier run are gone.
        None
    }
}

fn env_args(prefix: &str, req: &LaunchRequest) -> Vec<String> {
    req.env
        .iter()
        .map(|(key, value)| format!("{}{}={}", prefix, key, value))
        .collect()
}

fn parse_pid(handle: &str) -> Result<u32, LaunchError> {
    handle
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0 && i32::try_from(*pid).is_ok())
        .ok_or_else(|| LaunchError::StaleHandle(handle.to_string()))
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    unsafe {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) {}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

async fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}
