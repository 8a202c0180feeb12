//! Log sinks: where project output and supervisor notices end up.
//!
//! A sink is invoked from whatever task produced the line, so every
//! implementation must be safe to call concurrently and often.

use std::io::Write;
use std::sync::Arc;
#[cfg(test)]
use std::sync::Mutex;

use strip_ansi_escapes::strip;

/// Indicates the source of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
    /// A message from the supervisor itself (build results, exits, failures).
    Notice,
}

/// Append-only consumer of text lines for one project.
pub trait LogSink: Send + Sync {
    fn append(&self, stream: StreamKind, text: &str);

    fn notice(&self, text: &str) {
        self.append(StreamKind::Notice, text);
    }
}

pub type SharedSink = Arc<dyn LogSink>;

const PALETTE: [&str; 6] = ["cyan", "green", "yellow", "magenta", "blue", "red"];

/// Prints `[project] line` to stdout, with a colored prefix.
pub struct ConsoleSink {
    prefix: String,
    strip_ansi: bool,
}

impl ConsoleSink {
    pub fn new(project: &str, index: usize, strip_ansi: bool) -> Self {
        let color = PALETTE[index % PALETTE.len()];
        Self {
            prefix: apply_color(&format!("[{project}]"), Some(color)),
            strip_ansi,
        }
    }
}

impl LogSink for ConsoleSink {
    fn append(&self, stream: StreamKind, text: &str) {
        let text = sanitize_text(text.trim_end_matches(['\r', '\n']), self.strip_ansi);
        let line = match stream {
            StreamKind::Notice => format!("{} {}", self.prefix, format_tool_message(&text)),
            StreamKind::Stdout | StreamKind::Stderr => format!("{} {}", self.prefix, text),
        };
        // One locked write per line keeps lines from different tasks intact.
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

/// Keeps every line in memory; used to observe sinks in tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(StreamKind, String)>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn lines(&self) -> Vec<(StreamKind, String)> {
        self.lines.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.lines().into_iter().map(|(_, text)| text).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.texts().iter().any(|text| text.contains(needle))
    }
}

#[cfg(test)]
impl LogSink for MemorySink {
    fn append(&self, stream: StreamKind, text: &str) {
        self.lines.lock().unwrap().push((stream, text.to_string()));
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

pub fn format_tool_message(text: &str) -> String {
    format!("[projrack] {}", text)
}

fn apply_color(prefix: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        _ => "0",
    };
    if code == "0" {
        prefix.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_only_when_asked() {
        let colored = "\u{1b}[32mINFO\u{1b}[0m started";
        assert_eq!(sanitize_text(colored, false), colored);
        assert_eq!(sanitize_text(colored, true), "INFO started");
    }

    #[test]
    fn apply_color_wraps_known_colors() {
        assert_eq!(apply_color("[api]", Some("red")), "\u{1b}[31m[api]\u{1b}[0m");
        assert_eq!(apply_color("[api]", Some("plaid")), "[api]");
    }

    #[test]
    fn memory_sink_keeps_order() {
        let sink = MemorySink::default();
        sink.append(StreamKind::Stdout, "one");
        sink.notice("two");
        sink.append(StreamKind::Stderr, "three");
        assert_eq!(sink.texts(), vec!["one", "two", "three"]);
        assert_eq!(sink.lines()[1].0, StreamKind::Notice);
    }
}
