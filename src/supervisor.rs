//! Project lifecycle: start, stop, restart, liveness reconciliation.
//!
//! Per project the supervisor moves between Stopped (no tracked handle) and
//! Running (handle tracked). Starting and Stopping only exist while an
//! operation is in flight; operations on the same project are serialized by a
//! per-project lock, so the last one to run decides the final registry entry.
//!
//! Lifecycle failures are rendered into the project's sink. Only a persistence
//! fault is returned as an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::env::{self, EnvError};
use crate::launcher::{LaunchError, LaunchRequest, Launcher, Liveness};
use crate::logstream::{self, Attachment};
use crate::output::SharedSink;
use crate::registry::HandleRegistry;
use crate::store::{Store, StoreError};

/// How long a stopped instance's readers get to deliver its last lines.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// What a call to [`Supervisor::start`] ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { handle: String },
    /// The project name collides with one of the supervisor's own keys.
    Rejected { error: String },
    BuildFailed { error: String },
    LaunchFailed { error: String },
}

/// What a call to [`Supervisor::stop`] ended up doing. The handle is untracked in every case but `NothingTracked`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NothingTracked,
    Stopped { handle: String },
    /// The handle no longer denoted a live instance.
    Stale { handle: String },
    Failed { handle: String, error: String },
}

/// Result of probing one tracked handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub project: String,
    pub handle: String,
    pub alive: bool,
}

/// In-memory companions of a tracked handle started or adopted by this run.
struct Runtime {
    handle: String,
    watcher: JoinHandle<()>,
    output: Option<Attachment>,
}

pub struct Supervisor<L: Launcher> {
    inner: Arc<Inner<L>>,
}

impl<L: Launcher> Clone for Supervisor<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<L> {
    store: Arc<Store>,
    registry: HandleRegistry,
    launcher: L,
    projects_dir: PathBuf,
    poll_interval: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    runtimes: Mutex<HashMap<String, Runtime>>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(
        store: Arc<Store>,
        registry_key: &'static str,
        launcher: L,
        projects_dir: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        let registry = HandleRegistry::new(Arc::clone(&store), registry_key);
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                launcher,
                projects_dir: projects_dir.into(),
                poll_interval,
                locks: Mutex::new(HashMap::new()),
                runtimes: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.inner.registry
    }

    pub fn projects_dir(&self) -> &Path {
        &self.inner.projects_dir
    }

    /// Builds and launches `project`, stopping a tracked instance first.
    pub async fn start(&self, project: &str, sink: SharedSink) -> Result<StartOutcome, StoreError> {
        let lock = self.project_lock(project);
        let _guard = lock.lock().await;
        self.start_locked(project, sink).await
    }

    /// Stops the tracked instance of `project`, if any, and untracks it.
    pub async fn stop(&self, project: &str, sink: SharedSink) -> Result<StopOutcome, StoreError> {
        let lock = self.project_lock(project);
        let _guard = lock.lock().await;
        self.stop_locked(project, &sink).await
    }

    /// `stop` followed by `start`, as one operation on the project.
    pub async fn restart(&self, project: &str, sink: SharedSink) -> Result<StartOutcome, StoreError> {
        let lock = self.project_lock(project);
        let _guard = lock.lock().await;
        if let Err(err) = env::check_project(project) {
            return Ok(reject(project, &sink, err));
        }
        self.stop_locked(project, &sink).await?;
        self.start_locked(project, sink).await
    }

    /// Stops every tracked project. One project failing does not stop the rest;
    /// the first persistence fault is returned after all were attempted.
    pub async fn stop_all<F>(&self, sink_for: F) -> Result<Vec<(String, StopOutcome)>, StoreError>
    where
        F: Fn(&str) -> SharedSink,
    {
        let mut outcomes = Vec::new();
        let mut first_fault = None;
        for (project, _) in self.inner.registry.tracked() {
            match self.stop(&project, sink_for(&project)).await {
                Ok(outcome) => outcomes.push((project, outcome)),
                Err(err) => {
                    error!(project = %project, error = %err, "failed to persist stop");
                    first_fault.get_or_insert(err);
                }
            }
        }
        match first_fault {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    /// Probes every tracked handle and untracks the stale ones.
    pub async fn prune(&self) -> Result<Vec<Probe>, StoreError> {
        let mut probes = Vec::new();
        for (project, handle) in self.inner.registry.tracked() {
            let lock = self.project_lock(&project);
            let _guard = lock.lock().await;
            if self.inner.registry.lookup(&project).as_deref() != Some(handle.as_str()) {
                continue;
            }
            let alive = self.inner.launcher.status(&handle).await == Liveness::Alive;
            if !alive {
                info!(project = %project, handle = %handle, "removing stale handle");
                self.inner.registry.untrack(&project)?;
            }
            probes.push(Probe {
                project,
                handle,
                alive,
            });
        }
        Ok(probes)
    }

    /// Prunes stale handles, then resumes watching the live ones left by an earlier run.
    pub async fn adopt<F>(&self, sink_for: F) -> Result<Vec<Probe>, StoreError>
    where
        F: Fn(&str) -> SharedSink,
    {
        let probes = self.prune().await?;
        for probe in &probes {
            let sink = sink_for(&probe.project);
            if !probe.alive {
                sink.notice(&format!(
                    "removed stale handle {} for {}",
                    probe.handle, probe.project
                ));
                continue;
            }
            if self.runtime_handle(&probe.project).as_deref() == Some(probe.handle.as_str()) {
                continue;
            }
            let output = self
                .inner
                .launcher
                .reattach(&probe.handle)
                .await
                .map(|output| logstream::attach(&probe.project, output, sink.clone()));
            sink.notice(&format!("{} is running ({})", probe.project, probe.handle));
            self.watch(&probe.project, &probe.handle, output, sink);
        }
        Ok(probes)
    }

    async fn start_locked(&self, project: &str, sink: SharedSink) -> Result<StartOutcome, StoreError> {
        let inner = &self.inner;
        let env = match env::resolve(&inner.store, project) {
            Ok(env) => env,
            Err(EnvError::Store(err)) => return Err(err),
            Err(err) => return Ok(reject(project, &sink, err)),
        };

        if inner.registry.lookup(project).is_some() {
            sink.notice(&format!("{} is already tracked, stopping it first", project));
            self.stop_locked(project, &sink).await?;
        }

        let req = LaunchRequest {
            project: project.to_string(),
            dir: inner.projects_dir.join(project),
            env,
            sink: sink.clone(),
        };

        sink.notice(&format!("building {}", project));
        if let Err(err) = inner.launcher.build(&req).await {
            warn!(project, error = %err, "build failed");
            sink.notice(&err.to_string());
            return Ok(StartOutcome::BuildFailed {
                error: err.to_string(),
            });
        }
        sink.notice(&format!("{} built successfully", project));

        let launched = match inner.launcher.launch(&req).await {
            Ok(launched) => launched,
            Err(err) => {
                warn!(project, error = %err, "launch failed");
                sink.notice(&err.to_string());
                return Ok(StartOutcome::LaunchFailed {
                    error: err.to_string(),
                });
            }
        };

        let handle = launched.handle;
        if let Err(err) = inner.registry.track(project, &handle) {
            // An instance nobody tracks could never be stopped again.
            let _ = inner.launcher.terminate(&handle).await;
            return Err(err);
        }
        info!(project, handle = %handle, "project started");
        sink.notice(&format!("{} started ({})", project, handle));

        let output = logstream::attach(project, launched.output, sink.clone());
        self.watch(project, &handle, Some(output), sink);
        Ok(StartOutcome::Started { handle })
    }

    async fn stop_locked(&self, project: &str, sink: &SharedSink) -> Result<StopOutcome, StoreError> {
        let inner = &self.inner;
        let Some(handle) = inner.registry.lookup(project) else {
            sink.notice(&format!("{} is not running (nothing tracked)", project));
            return Ok(StopOutcome::NothingTracked);
        };

        let runtime = self.runtimes().remove(project);
        if let Some(runtime) = &runtime {
            runtime.watcher.abort();
        }

        let outcome = match inner.launcher.terminate(&handle).await {
            Ok(()) => StopOutcome::Stopped { handle },
            Err(LaunchError::StaleHandle(_)) => StopOutcome::Stale { handle },
            Err(err) => {
                warn!(project, handle = %handle, error = %err, "termination failed");
                StopOutcome::Failed {
                    handle,
                    error: err.to_string(),
                }
            }
        };

        if let Some(output) = runtime.and_then(|runtime| runtime.output) {
            match &outcome {
                StopOutcome::Failed { .. } => output.detach(),
                _ => {
                    if !output.drain(OUTPUT_DRAIN).await {
                        debug!(project, "output still open after stop");
                    }
                }
            }
        }
        match &outcome {
            StopOutcome::Stopped { .. } => sink.notice(&format!("{} stopped", project)),
            StopOutcome::Stale { handle } => {
                sink.notice(&format!("{} was not running ({} not found)", project, handle))
            }
            StopOutcome::Failed { error, .. } => sink.notice(error),
            StopOutcome::NothingTracked => {}
        }
        inner.registry.untrack(project)?;
        info!(project, ?outcome, "project stopped");
        Ok(outcome)
    }

    /// Starts the periodic liveness check for `handle`, replacing any previous one.
    fn watch(&self, project: &str, handle: &str, output: Option<Attachment>, sink: SharedSink) {
        let supervisor = self.clone();
        let task_project = project.to_string();
        let task_handle = handle.to_string();
        let watcher = tokio::spawn(async move {
            supervisor
                .poll_liveness(&task_project, &task_handle, sink)
                .await;
        });
        let previous = self.runtimes().insert(
            project.to_string(),
            Runtime {
                handle: handle.to_string(),
                watcher,
                output,
            },
        );
        if let Some(previous) = previous {
            previous.watcher.abort();
            if let Some(output) = previous.output {
                output.detach();
            }
        }
    }

    async fn poll_liveness(&self, project: &str, handle: &str, sink: SharedSink) {
        let inner = &self.inner;
        let mut ticker = tokio::time::interval(inner.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if inner.registry.lookup(project).as_deref() != Some(handle) {
                return;
            }
            let liveness = inner.launcher.status(handle).await;
            if liveness == Liveness::Alive {
                continue;
            }

            let lock = self.project_lock(project);
            let _guard = lock.lock().await;
            if inner.registry.lookup(project).as_deref() != Some(handle) {
                return;
            }
            let message = match liveness {
                Liveness::Exited { code: Some(code) } => {
                    format!("{} stopped (exit code {})", project, code)
                }
                _ => format!("{} stopped", project),
            };
            info!(project, handle, ?liveness, "instance exited");
            sink.notice(&message);
            if let Err(err) = inner.registry.untrack(project) {
                error!(project, error = %err, "failed to untrack exited instance");
                sink.notice(&format!("failed to record exit: {}", err));
            }
            let mut runtimes = self.runtimes();
            if runtimes.get(project).map(|rt| rt.handle.as_str()) == Some(handle) {
                // The readers end on their own once the instance's output closes.
                runtimes.remove(project);
            }
            return;
        }
    }

    fn project_lock(&self, project: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(project.to_string()).or_default())
    }

    fn runtimes(&self) -> MutexGuard<'_, HashMap<String, Runtime>> {
        self.inner
            .runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn runtime_handle(&self, project: &str) -> Option<String> {
        self.runtimes().get(project).map(|rt| rt.handle.clone())
    }
}

fn reject(project: &str, sink: &SharedSink, err: EnvError) -> StartOutcome {
    warn!(project, error = %err, "start rejected");
    sink.notice(&err.to_string());
    StartOutcome::Rejected {
        error: err.to_string(),
    }
}
