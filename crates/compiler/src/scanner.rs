//! Scanner for Limit
//!
//! Produces the ordered token stream for a single source file. Two
//! modes:
//!
//! - `Legacy`: trivia (whitespace, newlines, comments) is discarded.
//! - `Cst`: every trivia byte is attached to a significant token, so the
//!   token stream reproduces the source byte-for-byte.
//!
//! Trivia attachment: a trivia token attaches as *trailing* to the
//! preceding significant token if no newline intervenes, otherwise as
//! *leading* to the following significant token. End-of-file trivia
//! attaches as trailing to the last significant token.
//!
//! String literals lex as `StringStart (StringText | InterpStart
//! expr-tokens InterpEnd)* StringEnd`; the scanner does not re-enter the
//! main grammar until the interpolation's closing brace.

use crate::codes;
use crate::token::{Token, TokenKind, Trivia, TriviaKind, TriviaPiece};
use limit_core::diagnostics::{Diagnostic, DiagnosticSink, Stage};
use limit_core::source::{FileId, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Legacy,
    Cst,
}

/// Lexical context the scanner is currently inside
enum Ctx {
    /// Inside a string literal, scanning text segments
    Str,
    /// Inside a `{expr}` interpolation hole; counts nested braces so the
    /// matching `}` closes the hole rather than a dict literal
    Interp { depth: u32 },
}

pub struct Scanner<'src> {
    source: &'src str,
    file: FileId,
    mode: ScanMode,
    pos: usize,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
    /// Leading trivia collected for the next significant token
    pending: Vec<Trivia>,
    ctx: Vec<Ctx>,
}

/// Scan a whole file. Diagnostics go to the sink; the token stream is
/// always produced (with synthetic `Error` tokens at recovery points in
/// cst mode).
pub fn scan(
    source: &str,
    file: FileId,
    mode: ScanMode,
    sink: &mut DiagnosticSink,
) -> Vec<Token> {
    Scanner::new(source, file, mode).run(sink)
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str, file: FileId, mode: ScanMode) -> Self {
        Scanner {
            source,
            file,
            mode,
            pos: 0,
            line: 0,
            column: 0,
            tokens: Vec::new(),
            pending: Vec::new(),
            ctx: Vec::new(),
        }
    }

    fn run(mut self, sink: &mut DiagnosticSink) -> Vec<Token> {
        loop {
            if matches!(self.ctx.last(), Some(Ctx::Str)) {
                self.scan_string_piece(sink);
                continue;
            }

            self.scan_trivia(sink);
            if self.at_end() {
                break;
            }
            self.scan_significant(sink);
        }

        // End-of-file trivia attaches as trailing to the last
        // significant token; an empty file hangs it on the Eof token.
        let eof_leading = if self.mode == ScanMode::Cst {
            match self.tokens.last_mut() {
                Some(last) => {
                    last.trailing.append(&mut self.pending);
                    Vec::new()
                }
                None => std::mem::take(&mut self.pending),
            }
        } else {
            Vec::new()
        };
        let offset = self.pos as u32;
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            lexeme: String::new(),
            span: Span::new(offset, offset),
            line: self.line,
            column: self.column,
            leading: eof_leading,
            trailing: Vec::new(),
        });
        self.tokens
    }

    // ----- low-level cursor -----

    fn at_end(&self) -> bool {
        self.pos >= self.source.len()
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek2(&self) -> Option<char> {
        let mut chars = self.source[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn peek3(&self) -> Option<char> {
        let mut chars = self.source[self.pos..].chars();
        chars.next();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    // ----- trivia -----

    fn scan_trivia(&mut self, sink: &mut DiagnosticSink) {
        loop {
            let start = self.pos;
            let (line, column) = (self.line, self.column);
            let kind = match self.peek() {
                Some('\n') => {
                    self.advance();
                    TriviaKind::Newline
                }
                Some(c) if c.is_whitespace() => {
                    while let Some(c) = self.peek() {
                        if c.is_whitespace() && c != '\n' {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                    TriviaKind::Whitespace
                }
                Some('/') if self.peek2() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                    TriviaKind::LineComment
                }
                Some('/') if self.peek2() == Some('*') => {
                    self.advance();
                    self.advance();
                    let mut closed = false;
                    while let Some(c) = self.advance() {
                        if c == '*' && self.peek() == Some('/') {
                            self.advance();
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        sink.push(
                            Diagnostic::error(
                                codes::UNTERMINATED_BLOCK_COMMENT,
                                Stage::Scanning,
                                "unterminated block comment",
                            )
                            .at(self.file, Span::new(start as u32, self.pos as u32))
                            .caused_by(
                                Span::new(start as u32, start as u32 + 2),
                                "comment opened here",
                            ),
                        );
                    }
                    TriviaKind::BlockComment
                }
                _ => break,
            };
            self.push_trivia(kind, start, line, column);
        }
    }

    fn push_trivia(&mut self, kind: TriviaKind, start: usize, line: usize, column: usize) {
        if self.mode == ScanMode::Legacy {
            return;
        }
        let trivia = Trivia {
            kind,
            piece: TriviaPiece::Text(self.source[start..self.pos].to_string()),
            span: Span::new(start as u32, self.pos as u32),
            line,
            column,
        };
        // No newline yet since the last significant token: attach as
        // trailing to it. A newline and everything after it lead the
        // next token.
        if kind != TriviaKind::Newline && self.pending.is_empty() {
            if let Some(last) = self.tokens.last_mut() {
                last.trailing.push(trivia);
                return;
            }
        }
        self.pending.push(trivia);
    }

    // ----- significant tokens -----

    fn emit(&mut self, kind: TokenKind, start: usize, line: usize, column: usize) {
        let lexeme = self.source[start..self.pos].to_string();
        self.tokens.push(Token {
            kind,
            lexeme,
            span: Span::new(start as u32, self.pos as u32),
            line,
            column,
            leading: std::mem::take(&mut self.pending),
            trailing: Vec::new(),
        });
    }

    fn scan_significant(&mut self, sink: &mut DiagnosticSink) {
        let start = self.pos;
        let (line, column) = (self.line, self.column);
        let c = match self.peek() {
            Some(c) => c,
            None => return,
        };

        if c.is_ascii_digit() {
            self.scan_number(sink);
            return;
        }
        if c.is_alphabetic() || c == '_' {
            while let Some(c) = self.peek() {
                if c.is_alphanumeric() || c == '_' {
                    self.advance();
                } else {
                    break;
                }
            }
            let text = &self.source[start..self.pos];
            let kind = TokenKind::keyword(text).unwrap_or(TokenKind::Identifier);
            self.emit(kind, start, line, column);
            return;
        }
        if c == '"' {
            self.advance();
            self.emit(TokenKind::StringStart, start, line, column);
            self.ctx.push(Ctx::Str);
            return;
        }

        self.advance();
        let kind = match c {
            '+' => {
                if self.eat('=') {
                    TokenKind::PlusEq
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if self.eat('=') {
                    TokenKind::MinusEq
                } else if self.eat('>') {
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if self.eat('*') {
                    TokenKind::StarStar
                } else {
                    TokenKind::Star
                }
            }
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '=' => {
                if self.eat('=') {
                    TokenKind::EqEq
                } else if self.eat('>') {
                    TokenKind::FatArrow
                } else {
                    TokenKind::Eq
                }
            }
            '!' => {
                if self.eat('=') {
                    TokenKind::BangEq
                } else {
                    self.recover_unknown(start, line, column, sink);
                    return;
                }
            }
            '<' => {
                if self.eat('=') {
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.eat('=') {
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '?' => TokenKind::Question,
            '|' => TokenKind::Pipe,
            '{' => {
                if let Some(Ctx::Interp { depth }) = self.ctx.last_mut() {
                    *depth += 1;
                }
                TokenKind::LBrace
            }
            '}' => match self.ctx.last_mut() {
                Some(Ctx::Interp { depth }) if *depth == 0 => {
                    self.ctx.pop();
                    TokenKind::InterpEnd
                }
                Some(Ctx::Interp { depth }) => {
                    *depth -= 1;
                    TokenKind::RBrace
                }
                _ => TokenKind::RBrace,
            },
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            ':' => {
                if self.eat(':') {
                    TokenKind::ColonColon
                } else {
                    TokenKind::Colon
                }
            }
            '.' => {
                if self.eat('.') {
                    TokenKind::DotDot
                } else {
                    TokenKind::Dot
                }
            }
            _ => {
                self.recover_unknown(start, line, column, sink);
                return;
            }
        };
        self.emit(kind, start, line, column);
    }

    /// Unknown character: report, swallow bytes up to the next
    /// whitespace, and (cst mode) keep them on a synthetic error token.
    fn recover_unknown(
        &mut self,
        start: usize,
        line: usize,
        column: usize,
        sink: &mut DiagnosticSink,
    ) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                break;
            }
            self.advance();
        }
        sink.push(
            Diagnostic::error(codes::INVALID_CHAR, Stage::Scanning, format!(
                "unknown character sequence '{}'",
                &self.source[start..self.pos]
            ))
            .at(self.file, Span::new(start as u32, self.pos as u32)),
        );
        if self.mode == ScanMode::Cst {
            self.emit(TokenKind::Error, start, line, column);
        } else {
            self.pending.clear();
        }
    }

    fn scan_number(&mut self, sink: &mut DiagnosticSink) {
        let start = self.pos;
        let (line, column) = (self.line, self.column);
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }

        let mut is_float = false;
        // A '.' starts a fraction only when followed by a digit; `1..5`
        // is a range, `xs.len` style member access never begins with a
        // digit receiver.
        if self.peek() == Some('.')
            && self.peek2() != Some('.')
            && matches!(self.peek2(), Some(c) if c.is_ascii_digit())
        {
            is_float = true;
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e') | Some('E'))
            && (matches!(self.peek2(), Some(c) if c.is_ascii_digit())
                || (matches!(self.peek2(), Some('+') | Some('-'))
                    && matches!(self.peek3(), Some(c) if c.is_ascii_digit())))
        {
            is_float = true;
            self.advance();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.advance();
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }

        let text = &self.source[start..self.pos];
        let kind = if is_float {
            match text.parse::<f64>() {
                Ok(value) => TokenKind::Float(value),
                Err(_) => {
                    sink.push(
                        Diagnostic::error(
                            codes::INVALID_NUMBER,
                            Stage::Scanning,
                            format!("invalid float literal '{}'", text),
                        )
                        .at(self.file, Span::new(start as u32, self.pos as u32)),
                    );
                    TokenKind::Error
                }
            }
        } else {
            match text.parse::<i64>() {
                Ok(value) => TokenKind::Int(value),
                Err(_) => {
                    sink.push(
                        Diagnostic::error(
                            codes::INVALID_NUMBER,
                            Stage::Scanning,
                            format!("integer literal '{}' is out of range", text),
                        )
                        .at(self.file, Span::new(start as u32, self.pos as u32))
                        .with_hint("the widest integer type is 64 bits"),
                    );
                    TokenKind::Error
                }
            }
        };
        self.emit(kind, start, line, column);
    }

    /// Scan one piece of a string literal: a text segment, the start of
    /// an interpolation hole, or the closing quote.
    fn scan_string_piece(&mut self, sink: &mut DiagnosticSink) {
        let start = self.pos;
        let (line, column) = (self.line, self.column);
        let mut cooked = String::new();

        loop {
            match self.peek() {
                None | Some('\n') => {
                    if self.pos > start {
                        self.emit(TokenKind::StringText(cooked), start, line, column);
                    }
                    let at = self.pos as u32;
                    sink.push(
                        Diagnostic::error(
                            codes::UNTERMINATED_STRING,
                            Stage::Scanning,
                            "unterminated string literal",
                        )
                        .at(self.file, Span::new(at, at))
                        .with_suggestion("add a closing '\"'"),
                    );
                    if self.mode == ScanMode::Cst {
                        let (l, c) = (self.line, self.column);
                        self.emit(TokenKind::Error, self.pos, l, c);
                    }
                    self.ctx.pop();
                    return;
                }
                Some('"') => {
                    if self.pos > start {
                        self.emit(TokenKind::StringText(cooked), start, line, column);
                    }
                    let qstart = self.pos;
                    let (l, c) = (self.line, self.column);
                    self.advance();
                    self.emit(TokenKind::StringEnd, qstart, l, c);
                    self.ctx.pop();
                    return;
                }
                Some('{') => {
                    if self.pos > start {
                        self.emit(TokenKind::StringText(cooked), start, line, column);
                    }
                    let bstart = self.pos;
                    let (l, c) = (self.line, self.column);
                    self.advance();
                    self.emit(TokenKind::InterpStart, bstart, l, c);
                    self.ctx.push(Ctx::Interp { depth: 0 });
                    return;
                }
                Some('\\') => {
                    let esc_start = self.pos;
                    self.advance();
                    match self.advance() {
                        Some('n') => cooked.push('\n'),
                        Some('t') => cooked.push('\t'),
                        Some('\\') => cooked.push('\\'),
                        Some('"') => cooked.push('"'),
                        Some('{') => cooked.push('{'),
                        other => {
                            sink.push(
                                Diagnostic::error(
                                    codes::INVALID_ESCAPE,
                                    Stage::Scanning,
                                    format!(
                                        "invalid escape sequence '\\{}'",
                                        other.map(String::from).unwrap_or_default()
                                    ),
                                )
                                .at(
                                    self.file,
                                    Span::new(esc_start as u32, self.pos as u32),
                                )
                                .with_hint("valid escapes are \\n, \\t, \\\\, \\\", and \\{"),
                            );
                            if let Some(c) = other {
                                cooked.push(c);
                            }
                        }
                    }
                }
                Some(_) => {
                    cooked.push(self.advance().unwrap());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use limit_core::diagnostics::DiagnosticSink;

    fn scan_cst(source: &str) -> (Vec<Token>, DiagnosticSink) {
        let mut sink = DiagnosticSink::new();
        let tokens = scan(source, FileId(0), ScanMode::Cst, &mut sink);
        (tokens, sink)
    }

    fn kinds(tokens: &[Token]) -> Vec<&TokenKind> {
        tokens.iter().map(|t| &t.kind).collect()
    }

    /// Reassemble source from tokens and trivia; the scanner is total
    /// over the input bytes
    fn reconstruct(tokens: &[Token]) -> String {
        let mut out = String::new();
        for token in tokens {
            for t in &token.leading {
                if let TriviaPiece::Text(text) = &t.piece {
                    out.push_str(text);
                }
            }
            out.push_str(&token.lexeme);
            for t in &token.trailing {
                if let TriviaPiece::Text(text) = &t.piece {
                    out.push_str(text);
                }
            }
        }
        out
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let (tokens, sink) = scan_cst("var foo = nil;");
        assert!(sink.is_empty());
        assert_eq!(
            kinds(&tokens),
            vec![
                &TokenKind::KwVar,
                &TokenKind::Identifier,
                &TokenKind::Eq,
                &TokenKind::KwNil,
                &TokenKind::Semicolon,
                &TokenKind::Eof,
            ]
        );
        assert_eq!(tokens[1].lexeme, "foo");
    }

    #[test]
    fn test_numbers() {
        let (tokens, sink) = scan_cst("1 2.5 3e2 4.5e-1 1..5");
        assert!(sink.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::Int(1));
        assert_eq!(tokens[1].kind, TokenKind::Float(2.5));
        assert_eq!(tokens[2].kind, TokenKind::Float(300.0));
        assert_eq!(tokens[3].kind, TokenKind::Float(0.45));
        // Range does not lex as a float
        assert_eq!(tokens[4].kind, TokenKind::Int(1));
        assert_eq!(tokens[5].kind, TokenKind::DotDot);
        assert_eq!(tokens[6].kind, TokenKind::Int(5));
    }

    #[test]
    fn test_operators() {
        let (tokens, sink) = scan_cst("+ += - -= -> ** == != <= >= :: .. => ?");
        assert!(sink.is_empty());
        let expected = [
            TokenKind::Plus,
            TokenKind::PlusEq,
            TokenKind::Minus,
            TokenKind::MinusEq,
            TokenKind::Arrow,
            TokenKind::StarStar,
            TokenKind::EqEq,
            TokenKind::BangEq,
            TokenKind::Le,
            TokenKind::Ge,
            TokenKind::ColonColon,
            TokenKind::DotDot,
            TokenKind::FatArrow,
            TokenKind::Question,
        ];
        for (token, expected) in tokens.iter().zip(expected.iter()) {
            assert_eq!(&token.kind, expected);
        }
    }

    #[test]
    fn test_string_interpolation_segments() {
        let (tokens, sink) = scan_cst("\"Hello, {name}!\"");
        assert!(sink.is_empty());
        assert_eq!(
            kinds(&tokens),
            vec![
                &TokenKind::StringStart,
                &TokenKind::StringText("Hello, ".to_string()),
                &TokenKind::InterpStart,
                &TokenKind::Identifier,
                &TokenKind::InterpEnd,
                &TokenKind::StringText("!".to_string()),
                &TokenKind::StringEnd,
                &TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_nested_braces_in_interpolation() {
        // A dict literal inside an interpolation hole must not close it
        let (tokens, sink) = scan_cst("\"x = {f({1: 2})}\"");
        assert!(sink.is_empty());
        let interp_ends = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::InterpEnd)
            .count();
        assert_eq!(interp_ends, 1);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn test_string_escapes() {
        let (tokens, sink) = scan_cst(r#""a\n\t\\\"\{b""#);
        assert!(sink.is_empty());
        assert_eq!(
            tokens[1].kind,
            TokenKind::StringText("a\n\t\\\"{b".to_string())
        );
    }

    #[test]
    fn test_invalid_escape_reported() {
        let (_, sink) = scan_cst(r#""a\qb""#);
        assert_eq!(sink.error_count(), 1);
        assert!(sink.iter().next().unwrap().message.contains("escape"));
    }

    #[test]
    fn test_unterminated_string() {
        let (_, sink) = scan_cst("\"oops\nvar x = 1;");
        assert!(sink.iter().any(|d| d.code == codes::UNTERMINATED_STRING));
    }

    #[test]
    fn test_unterminated_block_comment() {
        let (_, sink) = scan_cst("/* never closed");
        assert!(sink
            .iter()
            .any(|d| d.code == codes::UNTERMINATED_BLOCK_COMMENT));
    }

    #[test]
    fn test_unknown_character_recovery() {
        let (tokens, sink) = scan_cst("var @@@ x");
        assert!(sink.iter().any(|d| d.code == codes::INVALID_CHAR));
        // Recovery produced a synthetic error token and kept going
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Error));
        assert!(tokens.iter().any(|t| t.is_identifier("x")));
    }

    #[test]
    fn test_trailing_trivia_attachment() {
        let (tokens, _) = scan_cst("var x; // same line\nvar y;");
        // The comment has no newline before it: trailing on ';'
        let semi = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Semicolon)
            .unwrap();
        assert!(semi
            .trailing
            .iter()
            .any(|t| t.kind == TriviaKind::LineComment));
        // The newline leads the next 'var'
        let second_var = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::KwVar)
            .nth(1)
            .unwrap();
        assert!(second_var
            .leading
            .iter()
            .any(|t| t.kind == TriviaKind::Newline));
    }

    #[test]
    fn test_leading_trivia_after_newline() {
        let (tokens, _) = scan_cst("var x;\n// doc for y\nvar y;");
        let second_var = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::KwVar)
            .nth(1)
            .unwrap();
        assert!(second_var
            .leading
            .iter()
            .any(|t| t.kind == TriviaKind::LineComment));
    }

    #[test]
    fn test_roundtrip_mixed_source() {
        let source = "// header\nvar x: int = 1;  /* mid */ var s = \"a{x}b\";\n\n  // tail\n";
        let (tokens, sink) = scan_cst(source);
        assert!(sink.is_empty());
        assert_eq!(reconstruct(&tokens), source);
    }

    #[test]
    fn test_roundtrip_with_scan_errors() {
        let source = "var @@@ x = 1;\n";
        let (tokens, _) = scan_cst(source);
        assert_eq!(reconstruct(&tokens), source);
    }

    #[test]
    fn test_legacy_mode_discards_trivia() {
        let mut sink = DiagnosticSink::new();
        let tokens = scan("var x; // c\n", FileId(0), ScanMode::Legacy, &mut sink);
        assert!(tokens.iter().all(|t| t.leading.is_empty() && t.trailing.is_empty()));
    }

    #[test]
    fn test_tokens_contiguous_and_nonoverlapping() {
        let source = "fn f(a: int): int { return a + 1; }\n";
        let (tokens, _) = scan_cst(source);
        let mut cursor = 0u32;
        for token in &tokens {
            for t in &token.leading {
                assert_eq!(t.span.start, cursor);
                cursor = t.span.end;
            }
            assert_eq!(token.span.start, cursor);
            cursor = token.span.end;
            for t in &token.trailing {
                assert_eq!(t.span.start, cursor);
                cursor = t.span.end;
            }
        }
        assert_eq!(cursor as usize, source.len());
    }
}
