//! Diagnostics: source locations, error values, and the output sink.
//!
//! Error values separate failures by kind (parse, lookup, semantic, phase,
//! resource, child, cycle, internal) so callers can route recovery without
//! string matching. User-visible rendering is `file:line:column: error:
//! message` followed by `info:` notes; internal-consistency violations use
//! the `internal:` prefix instead.

use std::{fmt, io, sync::atomic::{AtomicUsize, Ordering}};

use parking_lot::Mutex;
use strum::{Display, IntoStaticStr};

/// Result type alias for operations that can produce a build error.
pub type Result<T> = std::result::Result<T, Error>;

/// A position in a buildfile (1-based line and column).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self { file: file.into(), line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// What failed, not where: the routing axis for error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Buildfile syntax, attribute misuse, invalid name.
    Parse,
    /// Undefined target, unknown target type, unknown module.
    Lookup,
    /// Type conflict, cyclic include, incompatible synthesized dependency.
    Semantic,
    /// Operation attempted in the wrong context phase.
    Phase,
    /// Filesystem IO or process spawn failure.
    Resource,
    /// External process exited non-zero.
    Child,
    /// Target depends on itself directly or transitively.
    Cycle,
    /// Internal consistency violation; always a bug.
    Internal,
}

/// A build error with an optional source location and `info:` notes.
#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub location: Option<Location>,
    pub message: String,
    pub notes: Vec<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, location: None, message: message.into(), notes: Vec::new() }
    }

    pub fn parse(loc: Location, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message).at(loc)
    }

    pub fn lookup(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Lookup, message)
    }

    pub fn semantic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Semantic, message)
    }

    pub fn phase(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Phase, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn child(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Child, message)
    }

    pub fn cycle(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cycle, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    #[must_use]
    pub fn at(mut self, loc: Location) -> Self {
        self.location = Some(loc);
        self
    }

    /// Attach an `info:` note shown after the error line.
    #[must_use]
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = &self.location {
            write!(f, "{loc}: ")?;
        }
        let prefix = if self.kind == ErrorKind::Internal { "internal" } else { "error" };
        write!(f, "{prefix}: {}", self.message)?;
        for n in &self.notes {
            write!(f, "\n  info: {n}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::resource(error.to_string())
    }
}

/// Where a diagnostics line goes. Swappable so tests can capture output.
pub trait Writer: Send {
    fn write_line(&mut self, line: &str);
}

/// Writes diagnostics to stderr (the default).
pub struct StderrWriter;

impl Writer for StderrWriter {
    fn write_line(&mut self, line: &str) {
        eprintln!("{line}");
    }
}

/// Writes `print` output to stdout (the default).
pub struct StdoutWriter;

impl Writer for StdoutWriter {
    fn write_line(&mut self, line: &str) {
        println!("{line}");
    }
}

/// Collects lines into a shared buffer for assertions in tests.
#[derive(Clone, Default)]
pub struct Capture {
    buf: std::sync::Arc<Mutex<String>>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the collected text, leaving the buffer empty.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.buf.lock())
    }
}

impl Writer for Capture {
    fn write_line(&mut self, line: &str) {
        let mut b = self.buf.lock();
        b.push_str(line);
        b.push('\n');
    }
}

/// The diagnostics sink: verbosity-gated progress text plus error and
/// warning accounting. Shared across worker threads.
pub struct Diagnostics {
    verbosity: u8,
    no_line: bool,
    no_column: bool,
    stderr: Mutex<Box<dyn Writer>>,
    stdout: Mutex<Box<dyn Writer>>,
    errors: AtomicUsize,
}

impl Diagnostics {
    pub fn new(verbosity: u8) -> Self {
        Self {
            verbosity,
            no_line: false,
            no_column: false,
            stderr: Mutex::new(Box::new(StderrWriter)),
            stdout: Mutex::new(Box::new(StdoutWriter)),
            errors: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_writers(mut self, stderr: Box<dyn Writer>, stdout: Box<dyn Writer>) -> Self {
        self.stderr = Mutex::new(stderr);
        self.stdout = Mutex::new(stdout);
        self
    }

    #[must_use]
    pub fn without_location_details(mut self, no_line: bool, no_column: bool) -> Self {
        self.no_line = no_line;
        self.no_column = no_column;
        self
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    /// True if progress text at this verbosity level should be shown.
    pub fn at(&self, level: u8) -> bool {
        self.verbosity >= level
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    /// Report an error, applying the line/column suppression options.
    pub fn error(&self, e: &Error) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut line = String::new();
        if let Some(loc) = &e.location {
            line.push_str(&loc.file);
            if !self.no_line {
                line.push_str(&format!(":{}", loc.line));
                if !self.no_column {
                    line.push_str(&format!(":{}", loc.column));
                }
            }
            line.push_str(": ");
        }
        let prefix = if e.kind == ErrorKind::Internal { "internal" } else { "error" };
        line.push_str(prefix);
        line.push_str(": ");
        line.push_str(&e.message);
        let mut w = self.stderr.lock();
        w.write_line(&line);
        for n in &e.notes {
            w.write_line(&format!("  info: {n}"));
        }
    }

    pub fn warn(&self, loc: Option<&Location>, message: &str) {
        let line = match loc {
            Some(l) => format!("{l}: warning: {message}"),
            None => format!("warning: {message}"),
        };
        self.stderr.lock().write_line(&line);
    }

    /// An `info:` line on its own (summaries like `no target to update`).
    pub fn info(&self, message: &str) {
        self.stderr.lock().write_line(&format!("info: {message}"));
    }

    /// Progress text shown at the given verbosity level and above
    /// (`c++ hello.cxx`-style lines at 1, full command lines at 2).
    pub fn progress(&self, level: u8, message: &str) {
        if self.at(level) {
            self.stderr.lock().write_line(message);
        }
    }

    /// Output of the `print` directive; goes to stdout.
    pub fn print(&self, message: &str) {
        self.stdout.lock().write_line(message);
    }
}
