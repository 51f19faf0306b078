//! Trivia intern pool
//!
//! Deduplicates trivia text across a compilation: the same run of
//! spaces, the same newline, or a repeated comment is stored once and
//! referenced by handle. Interning is lossless; the pool hands back the
//! exact original text, so source reconstruction is unaffected.
//!
//! On mixed real-world sources the overwhelming majority of trivia is
//! single spaces and single newlines, so deduplication removes well
//! over half of the stored trivia bytes. `savings_ratio` measures it.

use crate::token::{Token, Trivia, TriviaKind, TriviaPiece};
use serde::Serialize;
use std::collections::HashMap;

/// Stable handle into a [`TriviaPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TriviaHandle(pub u32);

#[derive(Debug, Default)]
pub struct TriviaPool {
    by_key: HashMap<(TriviaKind, String), TriviaHandle>,
    entries: Vec<String>,
    /// Total trivia bytes interned, counting duplicates
    raw_bytes: usize,
}

impl TriviaPool {
    pub fn new() -> Self {
        TriviaPool::default()
    }

    pub fn intern(&mut self, kind: TriviaKind, text: &str) -> TriviaHandle {
        self.raw_bytes += text.len();
        if let Some(handle) = self.by_key.get(&(kind, text.to_string())) {
            return *handle;
        }
        let handle = TriviaHandle(self.entries.len() as u32);
        self.entries.push(text.to_string());
        self.by_key.insert((kind, text.to_string()), handle);
        handle
    }

    pub fn text(&self, handle: TriviaHandle) -> &str {
        &self.entries[handle.0 as usize]
    }

    /// Bytes actually stored after deduplication
    pub fn stored_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.len()).sum()
    }

    /// Fraction of trivia bytes saved by interning (0.0 when nothing
    /// was interned yet)
    pub fn savings_ratio(&self) -> f64 {
        if self.raw_bytes == 0 {
            return 0.0;
        }
        1.0 - self.stored_bytes() as f64 / self.raw_bytes as f64
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Rewrite every trivia piece on `tokens` to an interned handle.
///
/// Idempotent: already-interned pieces are left alone.
pub fn optimize_trivia(tokens: &mut [Token], pool: &mut TriviaPool) {
    for token in tokens {
        for trivia in token.leading.iter_mut().chain(token.trailing.iter_mut()) {
            intern_piece(trivia, pool);
        }
    }
}

fn intern_piece(trivia: &mut Trivia, pool: &mut TriviaPool) {
    if let TriviaPiece::Text(text) = &trivia.piece {
        let handle = pool.intern(trivia.kind, text);
        trivia.piece = TriviaPiece::Interned(handle);
    }
}

/// Original text of one trivia, whichever representation it is in
pub fn trivia_text<'a>(trivia: &'a Trivia, pool: &'a TriviaPool) -> &'a str {
    match &trivia.piece {
        TriviaPiece::Text(text) => text,
        TriviaPiece::Interned(handle) => pool.text(*handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedup() {
        let mut pool = TriviaPool::new();
        let a = pool.intern(TriviaKind::Whitespace, " ");
        let b = pool.intern(TriviaKind::Whitespace, " ");
        let c = pool.intern(TriviaKind::Whitespace, "  ");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.entry_count(), 2);
    }

    #[test]
    fn test_same_text_different_kind_distinct() {
        let mut pool = TriviaPool::new();
        let ws = pool.intern(TriviaKind::Whitespace, "\t");
        let err = pool.intern(TriviaKind::Error, "\t");
        assert_ne!(ws, err);
    }

    #[test]
    fn test_text_roundtrip() {
        let mut pool = TriviaPool::new();
        let h = pool.intern(TriviaKind::LineComment, "// a comment");
        assert_eq!(pool.text(h), "// a comment");
    }

    #[test]
    fn test_savings_on_repeated_trivia() {
        let mut pool = TriviaPool::new();
        for _ in 0..10 {
            pool.intern(TriviaKind::Whitespace, "    ");
        }
        // 40 raw bytes stored as 4
        assert!(pool.savings_ratio() >= 0.5);
    }
}
