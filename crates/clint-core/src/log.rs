//! Diagnostic sinks
//!
//! The tracker composes diagnostic text and hands it, one line at a time,
//! to a [`DiagnosticSink`]. Sinks own their output; the tracker never opens
//! or closes streams itself.
//!
//! | Sink | Destination |
//! |------|-------------|
//! | [`TracingSink`] | `tracing` events under target `clint` |
//! | [`WriterSink`] | any `io::Write` (stdout, stderr, a log file) |
//! | [`MemorySink`] | an in-memory list, for tests and embedding |

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Append-only line sink.
pub trait DiagnosticSink: Send + Sync {
    /// Append one diagnostic line (no trailing newline).
    fn log_line(&self, line: &str);
}

/// Forwards diagnostics to `tracing`.
///
/// `ERROR:` lines become error events, `WARNING:` lines warnings and the
/// rest info events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn log_line(&self, line: &str) {
        if line.starts_with("ERROR:") {
            tracing::error!(target: "clint", "{}", line);
        } else if line.starts_with("WARNING:") {
            tracing::warn!(target: "clint", "{}", line);
        } else {
            tracing::info!(target: "clint", "{}", line);
        }
    }
}

/// Writes each line to an `io::Write`, flushing after every line so
/// diagnostics survive an abort.
pub struct WriterSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl WriterSink<File> {
    /// Create (truncate) a log file, starting with a `Process <pid>, <exe>` line.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut file = File::create(path)?;
        writeln!(file, "{}", process_header())?;
        Ok(Self::new(file))
    }
}

impl WriterSink<io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl WriterSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> DiagnosticSink for WriterSink<W> {
    fn log_line(&self, line: &str) {
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Diagnostics are best-effort, a failing sink must not fail the host call
        let _ = writeln!(out, "{}", line).and_then(|_| out.flush());
    }
}

/// Collects lines in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every line logged so far.
    pub fn lines(&self) -> Vec<String> {
        self.guard().clone()
    }

    /// Whether any line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.guard().iter().any(|l| l.contains(needle))
    }

    /// Number of lines containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.guard().iter().filter(|l| l.contains(needle)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DiagnosticSink for MemorySink {
    fn log_line(&self, line: &str) {
        self.guard().push(line.to_string());
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Arc<S> {
    fn log_line(&self, line: &str) {
        (**self).log_line(line)
    }
}

/// Where a `LOG_FILE` setting sends diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkTarget {
    Stdout,
    Stderr,
    /// `tracing` events under target `clint`
    Tracing,
    File(PathBuf),
}

impl SinkTarget {
    /// `stdout`, `-` and `1` select stdout, `stderr` and `2` select stderr,
    /// `tracing` selects [`TracingSink`], anything else is a file path.
    /// No setting writes to stderr, so violations reach a stream even when
    /// the host installs no subscriber.
    pub fn parse(setting: Option<&str>) -> Self {
        match setting {
            None | Some("stderr" | "2") => SinkTarget::Stderr,
            Some("stdout" | "-" | "1") => SinkTarget::Stdout,
            Some("tracing") => SinkTarget::Tracing,
            Some(path) => SinkTarget::File(PathBuf::from(path)),
        }
    }

    /// Open the sink.
    pub fn open(self) -> io::Result<Arc<dyn DiagnosticSink>> {
        Ok(match self {
            SinkTarget::Stdout => Arc::new(WriterSink::stdout()),
            SinkTarget::Stderr => Arc::new(WriterSink::stderr()),
            SinkTarget::Tracing => Arc::new(TracingSink),
            SinkTarget::File(path) => Arc::new(WriterSink::create(path)?),
        })
    }
}

/// Open the sink for a `LOG_FILE` setting.
pub fn sink_for(setting: Option<&str>) -> io::Result<Arc<dyn DiagnosticSink>> {
    SinkTarget::parse(setting).open()
}

fn process_header() -> String {
    let exe = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| String::from("<unknown>"));
    format!("Process {}, {}", std::process::id(), exe)
}
