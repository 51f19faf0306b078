//! Tokens and trivia for Limit
//!
//! Significant tokens carry their raw lexeme, byte span, line/column,
//! and (in cst mode) ordered leading/trailing trivia. Trivia never
//! nests. Concatenating, for every significant token in order, its
//! leading trivia, lexeme, and trailing trivia reproduces the source
//! byte-for-byte.

use crate::trivia::TriviaHandle;
use limit_core::source::Span;
use serde::Serialize;

/// Syntactically insignificant source bytes, preserved for lossless
/// round-tripping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TriviaKind {
    Whitespace,
    Newline,
    LineComment,
    BlockComment,
    /// Bytes skipped during scanner error recovery
    Error,
}

/// Trivia text, either owned (fresh from the scanner) or interned into
/// the trivia pool by the optimizer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TriviaPiece {
    Text(String),
    Interned(TriviaHandle),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trivia {
    pub kind: TriviaKind,
    pub piece: TriviaPiece,
    pub span: Span,
    pub line: usize,
    pub column: usize,
}

/// Token kinds. Literal kinds carry the cooked value; the raw source
/// slice is always in `Token::lexeme`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TokenKind {
    // Literals
    Int(i64),
    Float(f64),
    Identifier,

    // String interpolation. A string lexes as
    // StringStart (StringText | InterpStart expr-tokens InterpEnd)* StringEnd.
    StringStart,
    /// Cooked text with escapes resolved
    StringText(String),
    InterpStart,
    InterpEnd,
    StringEnd,

    // Keywords
    KwVar,
    KwFn,
    KwClass,
    KwIf,
    KwElse,
    KwWhile,
    KwFor,
    KwIter,
    KwIn,
    KwMatch,
    KwWhere,
    KwReturn,
    KwBreak,
    KwContinue,
    KwLoop,
    KwImport,
    KwAs,
    KwShow,
    KwHide,
    KwType,
    KwEnum,
    KwTrue,
    KwFalse,
    KwNil,
    KwAnd,
    KwOr,
    KwNot,
    KwSelf,
    KwSuper,
    KwPub,
    KwProtected,
    KwParallel,
    KwConcurrent,
    KwTask,
    KwAwait,
    KwAtomic,

    // Operators and punctuation
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    StarStar,
    EqEq,
    BangEq,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    PlusEq,
    MinusEq,
    Question,
    Pipe,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Colon,
    ColonColon,
    Dot,
    DotDot,
    Arrow,
    FatArrow,

    /// Synthetic token emitted at scanner recovery points (cst mode)
    Error,
    Eof,
}

impl TokenKind {
    pub fn keyword(text: &str) -> Option<TokenKind> {
        let kind = match text {
            "var" => TokenKind::KwVar,
            "fn" => TokenKind::KwFn,
            "class" => TokenKind::KwClass,
            "if" => TokenKind::KwIf,
            "else" => TokenKind::KwElse,
            "while" => TokenKind::KwWhile,
            "for" => TokenKind::KwFor,
            "iter" => TokenKind::KwIter,
            "in" => TokenKind::KwIn,
            "match" => TokenKind::KwMatch,
            "where" => TokenKind::KwWhere,
            "return" => TokenKind::KwReturn,
            "break" => TokenKind::KwBreak,
            "continue" => TokenKind::KwContinue,
            "loop" => TokenKind::KwLoop,
            "import" => TokenKind::KwImport,
            "as" => TokenKind::KwAs,
            "show" => TokenKind::KwShow,
            "hide" => TokenKind::KwHide,
            "type" => TokenKind::KwType,
            "enum" => TokenKind::KwEnum,
            "true" => TokenKind::KwTrue,
            "false" => TokenKind::KwFalse,
            "nil" => TokenKind::KwNil,
            "and" => TokenKind::KwAnd,
            "or" => TokenKind::KwOr,
            "not" => TokenKind::KwNot,
            "self" => TokenKind::KwSelf,
            "super" => TokenKind::KwSuper,
            "pub" => TokenKind::KwPub,
            "protected" => TokenKind::KwProtected,
            "parallel" => TokenKind::KwParallel,
            "concurrent" => TokenKind::KwConcurrent,
            "task" => TokenKind::KwTask,
            "await" => TokenKind::KwAwait,
            "atomic" => TokenKind::KwAtomic,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw source slice, exactly as written
    pub lexeme: String,
    pub span: Span,
    /// 0-indexed line/column of the first lexeme byte
    pub line: usize,
    pub column: usize,
    pub leading: Vec<Trivia>,
    pub trailing: Vec<Trivia>,
}

impl Token {
    pub fn is(&self, kind: &TokenKind) -> bool {
        &self.kind == kind
    }

    pub fn is_identifier(&self, text: &str) -> bool {
        self.kind == TokenKind::Identifier && self.lexeme == text
    }
}
