//! Structured diagnostics for Limit
//!
//! Every error, warning, or hint the compiler and runtime report is a
//! [`Diagnostic`]: a stable code, the pipeline stage that produced it, a
//! position, a primary message, and optional hint / suggestion /
//! caused-by context. Consumers key off the code, not the message text.
//!
//! Codes are partitioned by stage:
//!
//! | Range | Stage |
//! |---|---|
//! | E001–E099 | scanning |
//! | E100–E199 | parsing |
//! | E200–E249 | semantic |
//! | E250–E269 | memory |
//! | E270–E289 | visibility |
//! | E400–E499 | runtime |
//! | E500–E599 | LIR generation |

use crate::source::{FileId, SourceMap, Span};
use serde::Serialize;

/// Pipeline stage a diagnostic originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Scanning,
    Parsing,
    Semantic,
    Memory,
    Visibility,
    LirGen,
    Runtime,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Scanning => "scanning",
            Stage::Parsing => "parsing",
            Stage::Semantic => "semantic",
            Stage::Memory => "memory",
            Stage::Visibility => "visibility",
            Stage::LirGen => "lir",
            Stage::Runtime => "runtime",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// Pointer at the construct that caused a downstream failure, e.g. the
/// opening brace of an unclosed block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CausedBy {
    pub span: Span,
    pub note: String,
}

/// One reported problem, carrying everything §6's stable format requires
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    /// Stable numeric code, rendered as `E` + three digits
    pub code: u16,
    pub stage: Stage,
    pub severity: Severity,
    pub file: Option<FileId>,
    pub span: Option<Span>,
    pub message: String,
    pub hint: Option<String>,
    pub suggestion: Option<String>,
    pub caused_by: Option<CausedBy>,
}

impl Diagnostic {
    pub fn error(code: u16, stage: Stage, message: impl Into<String>) -> Self {
        Diagnostic {
            code,
            stage,
            severity: Severity::Error,
            file: None,
            span: None,
            message: message.into(),
            hint: None,
            suggestion: None,
            caused_by: None,
        }
    }

    pub fn warning(code: u16, stage: Stage, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::error(code, stage, message)
        }
    }

    pub fn at(mut self, file: FileId, span: Span) -> Self {
        self.file = Some(file);
        self.span = Some(span);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn caused_by(mut self, span: Span, note: impl Into<String>) -> Self {
        self.caused_by = Some(CausedBy {
            span,
            note: note.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Render for terminal output. Includes a source snippet when the
    /// diagnostic has a position and the map knows the file.
    pub fn render(&self, sources: &SourceMap) -> String {
        let mut out = String::new();
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        out.push_str(&format!("{}[E{:03}]", sev, self.code));
        if let (Some(file), Some(span)) = (self.file, self.span) {
            let f = sources.file(file);
            let pos = f.position(span.start);
            out.push_str(&format!(
                " {}:{}:{}",
                f.name.display(),
                pos.line + 1,
                pos.column + 1
            ));
        }
        out.push_str(&format!(": {} ({})", self.message, self.stage));
        if let (Some(file), Some(span)) = (self.file, self.span) {
            out.push('\n');
            out.push_str(&sources.snippet(file, span));
        }
        if let Some(ref caused_by) = self.caused_by
            && let Some(file) = self.file
        {
            let f = sources.file(file);
            let pos = f.position(caused_by.span.start);
            out.push_str(&format!(
                "\ncaused by: {} at {}:{}:{}",
                caused_by.note,
                f.name.display(),
                pos.line + 1,
                pos.column + 1
            ));
        }
        if let Some(ref hint) = self.hint {
            out.push_str(&format!("\nhint: {}", hint));
        }
        if let Some(ref suggestion) = self.suggestion {
            out.push_str(&format!("\nsuggestion: {}", suggestion));
        }
        out
    }
}

/// Default per-pass fatal threshold: keep reporting non-fatal
/// diagnostics, stop collecting at this many.
pub const DEFAULT_ERROR_LIMIT: usize = 100;

/// Collects diagnostics for a compilation, in insertion order.
///
/// Passes walk their input in source order, so insertion order is source
/// order per pass. `push` returns `false` once the error limit is
/// reached; the owning pass should stop.
#[derive(Debug)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
    error_limit: usize,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_ERROR_LIMIT)
    }

    pub fn with_limit(error_limit: usize) -> Self {
        DiagnosticSink {
            diagnostics: Vec::new(),
            error_limit,
        }
    }

    /// Record a diagnostic. Returns `false` if the error limit has been
    /// reached and the current pass should abort.
    pub fn push(&mut self, diagnostic: Diagnostic) -> bool {
        self.diagnostics.push(diagnostic);
        self.error_count() < self.error_limit
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.is_error())
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}

impl Default for DiagnosticSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_position_and_hint() {
        let mut sources = SourceMap::new();
        let file = sources.add_file("main.lm", "var x: int = \"oops\";\n");

        let diag = Diagnostic::error(203, Stage::Semantic, "type mismatch: expected int, got str")
            .at(file, Span::new(13, 19))
            .with_hint("the declared type and the initializer disagree");

        let rendered = diag.render(&sources);
        assert!(rendered.contains("error[E203]"));
        assert!(rendered.contains("main.lm:1:14"));
        assert!(rendered.contains("type mismatch"));
        assert!(rendered.contains("hint:"));
    }

    #[test]
    fn test_render_caused_by() {
        let mut sources = SourceMap::new();
        let file = sources.add_file("main.lm", "fn f() {\n  var x = 1;\n");

        let diag = Diagnostic::error(101, Stage::Parsing, "unexpected end of file")
            .at(file, Span::new(21, 21))
            .caused_by(Span::new(7, 8), "unclosed block starts here");

        let rendered = diag.render(&sources);
        assert!(rendered.contains("caused by: unclosed block starts here at main.lm:1:8"));
    }

    #[test]
    fn test_sink_error_limit() {
        let mut sink = DiagnosticSink::with_limit(2);
        assert!(sink.push(Diagnostic::error(100, Stage::Parsing, "one")));
        // Second error reaches the limit
        assert!(!sink.push(Diagnostic::error(100, Stage::Parsing, "two")));
        assert_eq!(sink.error_count(), 2);
    }

    #[test]
    fn test_sink_warnings_do_not_count_toward_limit() {
        let mut sink = DiagnosticSink::with_limit(1);
        assert!(sink.push(Diagnostic::warning(260, Stage::Memory, "unused linear value")));
        assert!(!sink.has_errors());
        assert_eq!(sink.error_count(), 0);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut sink = DiagnosticSink::new();
        sink.push(Diagnostic::error(1, Stage::Scanning, "a"));
        sink.push(Diagnostic::error(2, Stage::Scanning, "b"));
        let taken = sink.take();
        assert_eq!(taken[0].message, "a");
        assert_eq!(taken[1].message, "b");
        assert!(sink.is_empty());
    }
}
