//! Lossless-frontend properties, exercised through the full pipeline

use limitc::scanner::{self, ScanMode};
use limitc::token::TriviaPiece;
use limitc::trivia::{TriviaPool, optimize_trivia};
use limitc::{Compilation, CompilerOptions, SyntaxMode};
use limit_core::diagnostics::DiagnosticSink;
use limit_core::source::FileId;

const MIXED_SOURCE: &str = r#"// front-matter comment
fn to_int(s: str): int? {
    if (s == "10") { return ok(10); }   // fast path
    return err();
}

/* block
   comment */
fn plus_two(s: str): int? {
    var n: int = to_int(s)?;
    return ok(n + 2);
}

match plus_two("10") { Ok(v) => print("got {v}"), Err => print("none") }
"#;

fn cst_options() -> CompilerOptions {
    CompilerOptions {
        mode: SyntaxMode::Cst,
        ..CompilerOptions::default()
    }
}

#[test]
fn cst_roundtrip_through_pipeline() {
    let mut compilation = Compilation::new(cst_options());
    let output = compilation.compile_source("main", MIXED_SOURCE);
    assert!(
        !compilation.sink.has_errors(),
        "{:?}",
        compilation.sink.iter().collect::<Vec<_>>()
    );
    let cst = output.cst.expect("cst mode builds a CST");
    assert_eq!(cst.reconstruct(&compilation.trivia), MIXED_SOURCE);
}

#[test]
fn cst_roundtrip_survives_parse_errors() {
    let broken = "var = ;\nvar y: int = 2;\n// trailing\n";
    let mut compilation = Compilation::new(cst_options());
    let output = compilation.compile_source("main", broken);
    assert!(compilation.sink.has_errors());
    let cst = output.cst.expect("cst survives recovery");
    assert!(cst.error_count() > 0);
    assert_eq!(cst.reconstruct(&compilation.trivia), broken);
}

#[test]
fn trivia_interning_halves_storage_on_mixed_source() {
    let mut sink = DiagnosticSink::new();
    let mut tokens = scanner::scan(MIXED_SOURCE, FileId(0), ScanMode::Cst, &mut sink);
    let mut pool = TriviaPool::new();
    optimize_trivia(&mut tokens, &mut pool);

    assert!(
        pool.savings_ratio() >= 0.5,
        "expected >= 50% savings, got {:.2}",
        pool.savings_ratio()
    );
    // Every trivia piece is interned after optimization
    for token in &tokens {
        for trivia in token.leading.iter().chain(token.trailing.iter()) {
            assert!(matches!(trivia.piece, TriviaPiece::Interned(_)));
        }
    }
}

#[test]
fn scanner_totality_over_bytes() {
    let mut sink = DiagnosticSink::new();
    let tokens = scanner::scan(MIXED_SOURCE, FileId(0), ScanMode::Cst, &mut sink);
    let mut cursor = 0u32;
    for token in &tokens {
        for trivia in &token.leading {
            assert_eq!(trivia.span.start, cursor);
            cursor = trivia.span.end;
        }
        assert_eq!(token.span.start, cursor);
        cursor = token.span.end;
        for trivia in &token.trailing {
            assert_eq!(trivia.span.start, cursor);
            cursor = trivia.span.end;
        }
    }
    assert_eq!(cursor as usize, MIXED_SOURCE.len());
}

#[test]
fn mode_parity_through_pipeline() {
    let mut sink1 = DiagnosticSink::new();
    let tokens1 = scanner::scan(MIXED_SOURCE, FileId(0), ScanMode::Legacy, &mut sink1);
    let legacy = limitc::parser::parse(tokens1, FileId(0), "main", ScanMode::Legacy, &mut sink1);

    let mut sink2 = DiagnosticSink::new();
    let tokens2 = scanner::scan(MIXED_SOURCE, FileId(0), ScanMode::Cst, &mut sink2);
    let cst = limitc::parser::parse(tokens2, FileId(0), "main", ScanMode::Cst, &mut sink2);

    assert!(!sink1.has_errors());
    assert!(!sink2.has_errors());
    assert_eq!(legacy.module, cst.module);
}

#[test]
fn compile_file_roundtrip_with_imports() {
    use std::fs;
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("util.lm"),
        "pub fn double(n: int): int { return n * 2; }\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("main.lm"),
        "import util;\nprint(util.double(21));\n",
    )
    .unwrap();

    let mut compilation = Compilation::new(cst_options());
    let output = compilation
        .compile_file(&dir.path().join("main.lm"))
        .unwrap();
    assert!(
        !compilation.sink.has_errors(),
        "{:?}",
        compilation.sink.iter().collect::<Vec<_>>()
    );
    assert!(output.lir.is_some());
    // The entry file's CST still reconstructs its own source exactly
    let entry_text = fs::read_to_string(dir.path().join("main.lm")).unwrap();
    let cst = output.cst.expect("entry CST present");
    assert_eq!(cst.reconstruct(&compilation.trivia), entry_text);
}
