//! Compiler diagnostics and the sinks that receive them.
//!
//! The frontend never prints anything itself. Every message it produces is
//! turned into a [`Diagnostic`] and handed to the [`DiagnosticSink`] the
//! frontend was created with. [`LogSink`] forwards to the `log` facade,
//! [`CollectingSink`] keeps them for inspection and [`Tee`] fans out.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::span::{FileId, SourceFiles, Span};

/// `log` target used for every forwarded diagnostic.
pub const DIAGNOSTIC_TARGET: &str = "hostjit::diagnostics";

/// Error count after which compilation stops with a fatal diagnostic.
const ERROR_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Suppressed by configuration; still reported at debug level.
    Ignored,
    Note,
    Remark,
    Warning,
    Error,
    /// Stops the compile immediately.
    Fatal,
}

impl Severity {
    pub fn name(self) -> &'static str {
        match self {
            Severity::Ignored => "ignored",
            Severity::Note => "note",
            Severity::Remark => "remark",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Severity::Error | Severity::Fatal)
    }

    pub fn log_level(self) -> log::Level {
        match self {
            Severity::Ignored => log::Level::Debug,
            Severity::Note | Severity::Remark => log::Level::Info,
            Severity::Warning => log::Level::Warn,
            Severity::Error | Severity::Fatal => log::Level::Error,
        }
    }

    /// Tag placed in front of the message for severities that share a log
    /// level with another one.
    fn tag(self) -> Option<&'static str> {
        match self {
            Severity::Ignored => Some("[ignored] "),
            Severity::Note => Some("[note] "),
            Severity::Remark => Some("[remark] "),
            Severity::Fatal => Some("fatal: "),
            Severity::Warning | Severity::Error => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub location: Option<SourceLocation>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(location) = &self.location {
            write!(f, "{location}: ")?;
        }
        f.write_str(&self.message)
    }
}

/// Receiver for diagnostics. Must not influence compilation.
pub trait DiagnosticSink: Send + Sync {
    fn handle(&self, diagnostic: &Diagnostic);
}

impl<T: DiagnosticSink + ?Sized> DiagnosticSink for Arc<T> {
    fn handle(&self, diagnostic: &Diagnostic) {
        (**self).handle(diagnostic)
    }
}

/// Forwards diagnostics to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn handle(&self, diagnostic: &Diagnostic) {
        let tag = diagnostic.severity.tag().unwrap_or("");
        log::log!(
            target: DIAGNOSTIC_TARGET,
            diagnostic.severity.log_level(),
            "{tag}{diagnostic}"
        );
    }
}

/// Keeps every diagnostic it receives.
#[derive(Debug, Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .lock()
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.lock().iter().any(|d| d.severity.is_error())
    }

    /// `N errors, M warnings`, counting fatal diagnostics as errors.
    pub fn summary(&self) -> String {
        fn plural(count: usize, noun: &str) -> String {
            if count == 1 {
                format!("1 {noun}")
            } else {
                format!("{count} {noun}s")
            }
        }
        let errors = self.count(Severity::Error) + self.count(Severity::Fatal);
        let warnings = self.count(Severity::Warning);
        format!("{}, {}", plural(errors, "error"), plural(warnings, "warning"))
    }

    /// Whether any diagnostic of `severity` mentions `needle`.
    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.diagnostics
            .lock()
            .iter()
            .any(|d| d.severity == severity && d.message.contains(needle))
    }
}

impl DiagnosticSink for CollectingSink {
    fn handle(&self, diagnostic: &Diagnostic) {
        self.diagnostics.lock().push(diagnostic.clone());
    }
}

/// Fan-out to several sinks, in order.
#[derive(Default, Clone)]
pub struct Tee {
    sinks: Vec<Arc<dyn DiagnosticSink>>,
}

impl Tee {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl DiagnosticSink for Tee {
    fn handle(&self, diagnostic: &Diagnostic) {
        for sink in &self.sinks {
            sink.handle(diagnostic);
        }
    }
}

// ── Per-compile reporting ─────────────────────────────────────────

/// Raised once a fatal diagnostic has been emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalError;

/// Turns spans into locations, counts errors and forwards to the sink.
pub struct DiagnosticEngine<'s> {
    sink: &'s dyn DiagnosticSink,
    files: SourceFiles,
    errors: usize,
    warnings: usize,
    fatal: bool,
}

impl<'s> DiagnosticEngine<'s> {
    pub fn new(sink: &'s dyn DiagnosticSink) -> Self {
        Self::with_files(sink, SourceFiles::new())
    }

    pub fn with_files(sink: &'s dyn DiagnosticSink, files: SourceFiles) -> Self {
        Self {
            sink,
            files,
            errors: 0,
            warnings: 0,
            fatal: false,
        }
    }

    pub fn add_file(&mut self, name: &str) -> FileId {
        self.files.add(name)
    }

    pub fn files(&self) -> &SourceFiles {
        &self.files
    }

    pub fn into_files(self) -> SourceFiles {
        self.files
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    /// An error or fatal diagnostic was reported.
    pub fn has_failed(&self) -> bool {
        self.errors > 0 || self.fatal
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn report(&mut self, severity: Severity, span: Option<Span>, message: impl Into<String>) {
        if self.fatal {
            return;
        }
        let location = span.map(|span| SourceLocation {
            file: self.files.name(span.file).to_string(),
            line: span.start.line,
            column: span.start.column,
        });
        self.sink.handle(&Diagnostic {
            severity,
            location,
            message: message.into(),
        });
        match severity {
            Severity::Warning => self.warnings += 1,
            Severity::Error => {
                self.errors += 1;
                if self.errors >= ERROR_LIMIT {
                    self.report(
                        Severity::Fatal,
                        None,
                        "too many errors emitted, stopping now",
                    );
                }
            }
            Severity::Fatal => self.fatal = true,
            _ => {}
        }
    }

    pub fn error(&mut self, span: Span, message: impl Into<String>) {
        self.report(Severity::Error, Some(span), message)
    }

    pub fn warning(&mut self, span: Span, message: impl Into<String>) {
        self.report(Severity::Warning, Some(span), message)
    }

    pub fn note(&mut self, span: Span, message: impl Into<String>) {
        self.report(Severity::Note, Some(span), message)
    }

    pub fn remark(&mut self, span: Option<Span>, message: impl Into<String>) {
        self.report(Severity::Remark, span, message)
    }

    pub fn ignored(&mut self, span: Span, message: impl Into<String>) {
        self.report(Severity::Ignored, Some(span), message)
    }

    pub fn fatal(&mut self, span: Option<Span>, message: impl Into<String>) -> FatalError {
        self.report(Severity::Fatal, span, message);
        FatalError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Pos;

    #[test]
    fn severities_map_to_log_levels() {
        assert_eq!(Severity::Ignored.log_level(), log::Level::Debug);
        assert_eq!(Severity::Note.log_level(), log::Level::Info);
        assert_eq!(Severity::Remark.log_level(), log::Level::Info);
        assert_eq!(Severity::Warning.log_level(), log::Level::Warn);
        assert_eq!(Severity::Error.log_level(), log::Level::Error);
        assert_eq!(Severity::Fatal.log_level(), log::Level::Error);
    }

    #[test]
    fn location_prefixes_message() {
        let sink = CollectingSink::new();
        let mut engine = DiagnosticEngine::new(&sink);
        let file = engine.add_file("mod.cpp");
        let span = Span::point(file, Pos::new(10, 3, 7));
        engine.error(span, "use of undeclared identifier 'x'");
        engine.remark(None, "no location");

        let diags = sink.take();
        assert_eq!(diags.len(), 2);
        assert_eq!(
            diags[0].to_string(),
            "mod.cpp:3:7: use of undeclared identifier 'x'"
        );
        assert_eq!(diags[1].to_string(), "no location");
        assert!(engine.has_failed());
    }

    #[test]
    fn summary_counts_errors_and_warnings() {
        let collecting = Arc::new(CollectingSink::new());
        let tee = Tee::new().with(Arc::new(LogSink)).with(collecting.clone());
        assert_eq!(collecting.summary(), "0 errors, 0 warnings");

        let mut engine = DiagnosticEngine::new(&tee);
        let file = engine.add_file("mod.cpp");
        engine.warning(Span::point(file, Pos::origin()), "unused");
        engine.error(Span::point(file, Pos::origin()), "bad");
        engine.note(Span::point(file, Pos::origin()), "here");
        assert_eq!(collecting.summary(), "1 error, 1 warning");

        engine.report(Severity::Fatal, None, "stop");
        assert_eq!(collecting.summary(), "2 errors, 1 warning");
    }

    #[test]
    fn error_limit_turns_fatal() {
        let sink = CollectingSink::new();
        let mut engine = DiagnosticEngine::new(&sink);
        let file = engine.add_file("mod.cpp");
        for _ in 0..30 {
            engine.error(Span::point(file, Pos::origin()), "bad");
        }
        assert!(engine.is_fatal());
        assert_eq!(sink.count(Severity::Error), ERROR_LIMIT);
        assert_eq!(sink.count(Severity::Fatal), 1);
    }

    #[test]
    fn tee_reaches_every_sink() {
        let a = Arc::new(CollectingSink::new());
        let b = Arc::new(CollectingSink::new());
        let tee = Tee::new().with(a.clone()).with(b.clone());
        tee.handle(&Diagnostic {
            severity: Severity::Warning,
            location: None,
            message: "w".into(),
        });
        assert_eq!(a.count(Severity::Warning), 1);
        assert_eq!(b.count(Severity::Warning), 1);
    }
}
