//! Event definitions for the supervisor's interactive loop.
//!
//! Operator commands typed on stdin and OS signals are funneled into one
//! channel so the loop reacts to them in arrival order.

use anyhow::{anyhow, bail, Result};

/// Represents an event in the supervisor's main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A command typed by the operator.
    Command(Command),
    /// Standard input reached end of file.
    InputClosed,
    /// The supervisor was asked to exit (Ctrl-C, SIGTERM).
    Shutdown { signal: &'static str },
    /// A background operation hit a persistence fault; the loop must stop.
    Fault(String),
}

/// Operator commands accepted on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(String),
    Stop(String),
    Restart(String),
    Status,
    List,
    Help,
    Quit,
}

impl Command {
    /// Parses one input line such as `restart api`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let target = words.next().map(str::to_string);
        if words.next().is_some() {
            bail!("too many arguments: {}", line.trim());
        }
        let need = |target: Option<String>| {
            target.ok_or_else(|| anyhow!("`{}` needs a project name", verb))
        };
        let command = match verb.to_lowercase().as_str() {
            "start" => Command::Start(need(target)?),
            "stop" => Command::Stop(need(target)?),
            "restart" => Command::Restart(need(target)?),
            "status" | "ps" => Command::Status,
            "list" | "ls" => Command::List,
            "help" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            other => bail!("unknown command: {}", other),
        };
        Ok(Some(command))
    }
}

pub const HELP: &str = "commands: start <project>, stop <project>, restart <project>, status, list, quit";
