//! Projrack: builds, launches and supervises a directory of services.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration and the persisted state, then either runs a
//! one-shot command or the interactive supervision loop.

mod config;
mod container;
mod env;
mod events;
mod launcher;
mod logstream;
mod output;
mod process;
mod projects;
mod registry;
mod store;
mod supervisor;

use std::collections::HashMap;
use std::io::{BufRead, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{LaunchMode, Settings};
use crate::container::ContainerLauncher;
use crate::events::{Command, Event, HELP};
use crate::launcher::Launcher;
use crate::output::{format_tool_message, ConsoleSink, SharedSink};
use crate::process::ProcessLauncher;
use crate::store::Store;
use crate::supervisor::{StopOutcome, Supervisor};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "projrack",
    version,
    about = "Build, launch and supervise a directory of services",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to projrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any projrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Path of the persisted state document.
    #[arg(long, global = true)]
    state: Option<PathBuf>,
    /// Base directory holding one subdirectory per project.
    #[arg(long, global = true)]
    projects_dir: Option<PathBuf>,
    /// Launch mechanism.
    #[arg(long, value_enum, global = true)]
    mode: Option<LaunchMode>,
    /// Strip ANSI codes from project output.
    #[arg(long, global = true)]
    strip_ansi: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the projects under the base directory.
    List,
    /// Probe every tracked handle and drop the stale ones.
    Status,
    /// Start projects, then keep supervising them.
    Start {
        #[arg(required = true)]
        projects: Vec<String>,
    },
    /// Interactive supervisor; resumes instances left by an earlier run.
    Up { projects: Vec<String> },
    /// Stop one project.
    Stop { project: String },
    /// Restart one project, then keep supervising it.
    Restart { project: String },
    /// Stop every tracked project.
    StopAll,
    /// Inspect or edit environment variables.
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },
}

#[derive(Debug, Subcommand)]
enum EnvAction {
    /// Print the default variables, or a project's overrides.
    Show { project: Option<String> },
    /// Replace the default variables (KEY=VALUE args, or lines on stdin).
    SetDefault { vars: Vec<String> },
    /// Replace a project's overrides (KEY=VALUE args, or lines on stdin).
    Set { project: String, vars: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    let store = Arc::new(Store::open(&settings.state_file));
    debug!(path = %store.path().display(), "state loaded");

    if let Commands::Env { action } = &cli.command {
        return run_env(action, &store);
    }

    let cwd = std::env::current_dir().context("failed to resolve the current directory")?;
    let projects_dir = projects::pin_base_dir(&store, settings.projects_dir.as_deref(), &cwd)?;
    let consoles = Arc::new(Consoles::new(settings.strip_ansi));

    match settings.mode {
        LaunchMode::Process => {
            let launcher = ProcessLauncher::new(
                settings.build_cmd.clone(),
                settings.run_cmd.clone(),
                settings.arg_prefix.clone(),
                settings.build_timeout,
                settings.shutdown_grace,
            );
            let supervisor = Supervisor::new(
                store,
                settings.mode.registry_key(),
                launcher,
                projects_dir,
                settings.poll_interval,
            );
            run(cli.command, supervisor, consoles).await
        }
        LaunchMode::Container => {
            let launcher = ContainerLauncher::new(
                settings.build_cmd.clone(),
                settings.build_timeout,
                settings.container.clone(),
            );
            let supervisor = Supervisor::new(
                store,
                settings.mode.registry_key(),
                launcher,
                projects_dir,
                settings.poll_interval,
            );
            run(cli.command, supervisor, consoles).await
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("projrack=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut config = config::Config::default();
    if !cli.no_config {
        let config_path = cli.config.clone().or_else(config::default_config_path);
        if let Some(path) = config_path {
            config = config::load_config(&path)?;
        }
    }
    let mut settings = Settings::from_config(config);
    if let Some(state) = &cli.state {
        settings.state_file = state.clone();
    }
    if let Some(dir) = &cli.projects_dir {
        settings.projects_dir = Some(dir.clone());
    }
    if let Some(mode) = cli.mode {
        settings.mode = mode;
    }
    settings.strip_ansi |= cli.strip_ansi;
    Ok(settings)
}

async fn run<L: Launcher>(
    command: Commands,
    supervisor: Supervisor<L>,
    consoles: Arc<Consoles>,
) -> Result<()> {
    match command {
        Commands::List => print_projects(&supervisor),
        Commands::Status => {
            let probes = supervisor.prune().await?;
            if probes.is_empty() {
                println!("no tracked {}", supervisor.registry().key().to_lowercase());
            }
            for probe in probes {
                let state = if probe.alive { "running" } else { "stale (removed)" };
                println!("{:<24} {:<16} {}", probe.project, probe.handle, state);
            }
            Ok(())
        }
        Commands::Stop { project } => {
            let outcome = supervisor.stop(&project, consoles.sink(&project)).await?;
            match outcome {
                StopOutcome::Failed { error, .. } => bail!("failed to stop {}: {}", project, error),
                _ => Ok(()),
            }
        }
        Commands::StopAll => {
            let outcomes = supervisor.stop_all(|project| consoles.sink(project)).await?;
            if outcomes.is_empty() {
                println!("{}", format_tool_message("nothing tracked"));
            }
            Ok(())
        }
        Commands::Start { projects } | Commands::Up { projects } => {
            let initial = projects.into_iter().map(Command::Start).collect();
            supervise(supervisor, consoles, initial).await
        }
        Commands::Restart { project } => {
            supervise(supervisor, consoles, vec![Command::Restart(project)]).await
        }
        Commands::Env { .. } => Err(anyhow!("env commands do not need a supervisor")),
    }
}

/// Interactive loop: runs the initial commands, then reacts to stdin and
/// signals until asked to quit, and finally stops everything still tracked.
async fn supervise<L: Launcher>(
    supervisor: Supervisor<L>,
    consoles: Arc<Consoles>,
    initial: Vec<Command>,
) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel(64);
    spawn_signal_listener(event_tx.clone());
    spawn_stdin_listener(event_tx.clone());

    supervisor.adopt(|project| consoles.sink(project)).await?;

    let mut operations = JoinSet::new();
    for command in initial {
        dispatch(command, &supervisor, &consoles, &event_tx, &mut operations);
    }
    println!("{}", format_tool_message(HELP));

    let mut fault = None;
    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Command(Command::Quit) => break,
            Event::Command(command) => {
                dispatch(command, &supervisor, &consoles, &event_tx, &mut operations);
            }
            Event::InputClosed => debug!("stdin closed, supervising until signalled"),
            Event::Shutdown { signal } => {
                info!(signal, "shutting down");
                break;
            }
            Event::Fault(message) => {
                fault = Some(message);
                break;
            }
        }
        // Reap finished operations so the set does not grow without bound.
        while operations.try_join_next().is_some() {}
    }

    if !operations.is_empty() {
        info!(pending = operations.len(), "waiting for in-flight operations");
        while operations.join_next().await.is_some() {}
    }
    supervisor.stop_all(|project| consoles.sink(project)).await?;
    match fault {
        Some(message) => Err(anyhow!(message)),
        None => Ok(()),
    }
}

/// Runs one operator command. Lifecycle commands run as tasks so a long build
/// does not block the loop; a persistence fault is reported back as an event.
fn dispatch<L: Launcher>(
    command: Command,
    supervisor: &Supervisor<L>,
    consoles: &Arc<Consoles>,
    event_tx: &mpsc::Sender<Event>,
    operations: &mut JoinSet<()>,
) {
    let (project, verb) = match &command {
        Command::Start(project) => (project.clone(), "start"),
        Command::Stop(project) => (project.clone(), "stop"),
        Command::Restart(project) => (project.clone(), "restart"),
        Command::Status => {
            print_tracked(supervisor);
            return;
        }
        Command::List => {
            if let Err(err) = print_projects(supervisor) {
                println!("{}", format_tool_message(&format!("{:#}", err)));
            }
            return;
        }
        Command::Help => {
            println!("{}", format_tool_message(HELP));
            return;
        }
        Command::Quit => return,
    };

    let supervisor = supervisor.clone();
    let sink = consoles.sink(&project);
    let tx = event_tx.clone();
    operations.spawn(async move {
        let result = match command {
            Command::Start(_) => supervisor.start(&project, sink).await.map(|_| ()),
            Command::Restart(_) => supervisor.restart(&project, sink).await.map(|_| ()),
            _ => supervisor.stop(&project, sink).await.map(|_| ()),
        };
        if let Err(err) = result {
            error!(project = %project, verb, error = %err, "persistence fault");
            let _ = tx.send(Event::Fault(format!("{} {}: {}", verb, project, err))).await;
        }
    });
}

fn print_projects<L: Launcher>(supervisor: &Supervisor<L>) -> Result<()> {
    let registry = supervisor.registry();
    for project in projects::discover(supervisor.projects_dir())? {
        match registry.lookup(&project) {
            Some(handle) => println!("{:<24} running ({})", project, handle),
            None => println!("{}", project),
        }
    }
    Ok(())
}

fn print_tracked<L: Launcher>(supervisor: &Supervisor<L>) {
    let tracked = supervisor.registry().tracked();
    if tracked.is_empty() {
        println!("{}", format_tool_message("nothing tracked"));
    }
    for (project, handle) in tracked {
        println!("{:<24} {}", project, handle);
    }
}

fn run_env(action: &EnvAction, store: &Store) -> Result<()> {
    match action {
        EnvAction::Show { project: None } => {
            print!("{}", env::format_lines(&env::defaults(store)));
        }
        EnvAction::Show {
            project: Some(project),
        } => {
            print!("{}", env::format_lines(&env::overrides(store, project)?));
        }
        EnvAction::SetDefault { vars } => {
            let vars = read_vars(vars)?;
            env::set_defaults(store, &vars)?;
            info!(count = vars.len(), "default variables replaced");
        }
        EnvAction::Set { project, vars } => {
            let vars = read_vars(vars)?;
            env::set_overrides(store, project, &vars)?;
            info!(project = %project, count = vars.len(), "project variables replaced");
        }
    }
    Ok(())
}

/// `KEY=VALUE` arguments, or stdin when none were given.
fn read_vars(args: &[String]) -> Result<env::EnvVars> {
    if !args.is_empty() {
        return Ok(env::parse_lines(&args.join("\n")));
    }
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("failed to read variables from stdin")?;
    Ok(env::parse_lines(&text))
}

/// One console sink per project, colored in the order projects first appear.
struct Consoles {
    strip_ansi: bool,
    sinks: Mutex<HashMap<String, SharedSink>>,
}

impl Consoles {
    fn new(strip_ansi: bool) -> Self {
        Self {
            strip_ansi,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    fn sink(&self, project: &str) -> SharedSink {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        let index = sinks.len();
        let strip_ansi = self.strip_ansi;
        Arc::clone(
            sinks
                .entry(project.to_string())
                .or_insert_with(|| Arc::new(ConsoleSink::new(project, index, strip_ansi))),
        )
    }
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(Event::Shutdown { signal: "SIGINT" }).await;
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(Event::Shutdown { signal: "SIGTERM" }).await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(Event::Shutdown { signal: "SIGINT" }).await;
        }
    });
}

fn spawn_stdin_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match Command::parse(&line) {
                Ok(Some(command)) => {
                    if tx.blocking_send(Event::Command(command)).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => println!("{}", format_tool_message(&err.to_string())),
            }
        }
        let _ = tx.blocking_send(Event::InputClosed);
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_with_global_flags() {
        let cli = Cli::try_parse_from([
            "projrack",
            "start",
            "api",
            "web",
            "--mode",
            "container",
            "--state",
            "/tmp/state.json",
        ])
        .unwrap();
        assert_eq!(cli.mode, Some(LaunchMode::Container));
        assert_eq!(cli.state, Some(PathBuf::from("/tmp/state.json")));
        match cli.command {
            Commands::Start { projects } => assert_eq!(projects, vec!["api", "web"]),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn start_requires_a_project() {
        assert!(Cli::try_parse_from(["projrack", "start"]).is_err());
    }

    #[test]
    fn parses_env_set() {
        let cli = Cli::try_parse_from(["projrack", "env", "set", "api", "server.port=9090"]).unwrap();
        match cli.command {
            Commands::Env {
                action: EnvAction::Set { project, vars },
            } => {
                assert_eq!(project, "api");
                assert_eq!(vars, vec!["server.port=9090"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::try_parse_from([
            "projrack",
            "--no-config",
            "--strip-ansi",
            "--projects-dir",
            "/srv",
            "list",
        ])
        .unwrap();
        let settings = load_settings(&cli).unwrap();
        assert!(settings.strip_ansi);
        assert_eq!(settings.projects_dir, Some(PathBuf::from("/srv")));
        assert_eq!(settings.mode, LaunchMode::Process);
    }

    #[test]
    fn consoles_reuse_sinks_per_project() {
        let consoles = Consoles::new(false);
        let first = consoles.sink("api");
        let again = consoles.sink("api");
        consoles.sink("web");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(consoles.sinks.lock().unwrap().len(), 2);
    }
}
