//! Source map for Limit
//!
//! Tracks every loaded source file and converts byte offsets into
//! line/column positions on demand. All spans in the compiler are byte
//! ranges into a specific file; nothing downstream re-scans source text
//! to find positions.

use serde::Serialize;
use std::path::PathBuf;

/// Handle to a file registered in a [`SourceMap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FileId(pub u32);

/// Half-open byte range `[start, end)` into one source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end, "Span: start ({}) must be <= end ({})", start, end);
        Span { start, end }
    }

    /// Smallest span covering both `self` and `other`
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Line/column position, 0-indexed (rendered 1-indexed for users)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

/// A single registered source file with its line-start index
#[derive(Debug)]
pub struct SourceFile {
    pub id: FileId,
    pub name: PathBuf,
    pub text: String,
    /// Byte offset of the start of each line. line_starts[0] == 0.
    line_starts: Vec<u32>,
}

impl SourceFile {
    fn new(id: FileId, name: PathBuf, text: String) -> Self {
        let mut line_starts = vec![0u32];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        SourceFile {
            id,
            name,
            text,
            line_starts,
        }
    }

    /// Convert a byte offset into a 0-indexed line/column
    pub fn position(&self, offset: u32) -> Position {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        Position {
            line,
            column: (offset - self.line_starts[line]) as usize,
        }
    }

    /// Text of a 0-indexed line, without the trailing newline
    pub fn line_text(&self, line: usize) -> &str {
        let start = self.line_starts[line] as usize;
        let end = self
            .line_starts
            .get(line + 1)
            .map(|s| *s as usize)
            .unwrap_or(self.text.len());
        self.text[start..end].trim_end_matches('\n')
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    pub fn slice(&self, span: Span) -> &str {
        &self.text[span.start as usize..span.end as usize]
    }
}

/// Owns all source files loaded for a compilation
#[derive(Debug, Default)]
pub struct SourceMap {
    files: Vec<SourceFile>,
}

impl SourceMap {
    pub fn new() -> Self {
        SourceMap { files: Vec::new() }
    }

    pub fn add_file(&mut self, name: impl Into<PathBuf>, text: impl Into<String>) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(SourceFile::new(id, name.into(), text.into()));
        id
    }

    pub fn file(&self, id: FileId) -> &SourceFile {
        &self.files[id.0 as usize]
    }

    pub fn files(&self) -> impl Iterator<Item = &SourceFile> {
        self.files.iter()
    }

    /// Find a file by its registered path, if any
    pub fn find(&self, name: &std::path::Path) -> Option<FileId> {
        self.files.iter().find(|f| f.name == name).map(|f| f.id)
    }

    /// Render a context snippet for a span: the source line with a caret
    /// run underneath the offending range.
    pub fn snippet(&self, file: FileId, span: Span) -> String {
        let file = self.file(file);
        let pos = file.position(span.start);
        let line = file.line_text(pos.line);
        let width = (span.len() as usize).max(1).min(line.len().saturating_sub(pos.column).max(1));
        format!(
            "{:>5} | {}\n      | {}{}",
            pos.line + 1,
            line,
            " ".repeat(pos.column),
            "^".repeat(width)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_lookup() {
        let mut map = SourceMap::new();
        let id = map.add_file("a.lm", "var x = 1;\nvar y = 2;\n");
        let file = map.file(id);

        assert_eq!(file.position(0), Position { line: 0, column: 0 });
        assert_eq!(file.position(4), Position { line: 0, column: 4 });
        // Offset 11 is the 'v' of the second line
        assert_eq!(file.position(11), Position { line: 1, column: 0 });
        assert_eq!(file.position(15), Position { line: 1, column: 4 });
    }

    #[test]
    fn test_position_at_line_start_boundary() {
        let mut map = SourceMap::new();
        let id = map.add_file("a.lm", "ab\ncd");
        let file = map.file(id);

        // Offset 3 is exactly a line start
        assert_eq!(file.position(3), Position { line: 1, column: 0 });
    }

    #[test]
    fn test_line_text() {
        let mut map = SourceMap::new();
        let id = map.add_file("a.lm", "first\nsecond\n");
        let file = map.file(id);

        assert_eq!(file.line_text(0), "first");
        assert_eq!(file.line_text(1), "second");
    }

    #[test]
    fn test_span_join() {
        let a = Span::new(3, 7);
        let b = Span::new(10, 12);
        assert_eq!(a.to(b), Span::new(3, 12));
        assert_eq!(b.to(a), Span::new(3, 12));
    }

    #[test]
    fn test_snippet_caret() {
        let mut map = SourceMap::new();
        let id = map.add_file("a.lm", "var x = nope;\n");
        let snippet = map.snippet(id, Span::new(8, 12));
        assert!(snippet.contains("var x = nope;"));
        assert!(snippet.contains("^^^^"));
    }
}
