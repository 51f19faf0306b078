//! Limit Compiler Library
//!
//! Compiles `.lm` sources through the full pipeline:
//!
//! ```text
//! scan -> trivia optimize -> parse (AST + optional CST)
//!      -> resolve imports -> type check -> memory check
//!      -> visibility check -> LIR generation
//! ```
//!
//! All process-wide state (source map, type table, module registry,
//! trivia pool, diagnostics) lives in a [`Compilation`] value threaded
//! through the passes; there are no ambient singletons. A failing pass
//! stops the passes behind it, with one deliberate exception:
//! visibility errors block execution but not LIR generation.

pub mod ast;
pub mod codes;
pub mod cst;
pub mod lirgen;
pub mod memory;
pub mod modules;
pub mod options;
pub mod parser;
pub mod resolver;
pub mod scanner;
pub mod token;
pub mod trivia;
pub mod typecheck;
pub mod types;
pub mod visibility;

pub use cst::Cst;
pub use options::{CompilerOptions, SyntaxMode};
pub use scanner::ScanMode;

use ast::Module;
use limit_core::diagnostics::DiagnosticSink;
use limit_core::lir::LirModule;
use limit_core::source::SourceMap;
use memory::MemoryChecker;
use modules::ModuleRegistry;
use resolver::ModuleLoader;
use std::path::Path;
use tracing::debug;
use trivia::TriviaPool;
use typecheck::TypeChecker;
use types::TypeTable;
use visibility::VisibilityChecker;

/// Everything a compilation owns, threaded explicitly through the passes
pub struct Compilation {
    pub sources: SourceMap,
    pub sink: DiagnosticSink,
    pub types: TypeTable,
    pub modules: ModuleRegistry,
    pub trivia: TriviaPool,
    pub options: CompilerOptions,
}

/// What a compilation produces. `lir` is present unless a pass before
/// LIR generation failed; `executable` says whether the driver may run
/// it (visibility errors clear it while leaving `lir` intact).
pub struct CompileOutput {
    pub lir: Option<LirModule>,
    pub cst: Option<Cst>,
    pub executable: bool,
}

impl Compilation {
    pub fn new(options: CompilerOptions) -> Self {
        Compilation {
            sources: SourceMap::new(),
            sink: DiagnosticSink::with_limit(options.error_limit),
            types: TypeTable::new(),
            modules: ModuleRegistry::new(),
            trivia: TriviaPool::new(),
            options,
        }
    }

    /// Compile a file and everything it imports
    pub fn compile_file(&mut self, path: &Path) -> Result<CompileOutput, String> {
        let loader = ModuleLoader::new(
            &mut self.sources,
            &mut self.sink,
            &mut self.trivia,
            &self.options,
        );
        let loaded = loader.load(path)?;
        Ok(self.run_passes(loaded.modules, loaded.cst))
    }

    /// Compile in-memory source as a single module (REPL, tests).
    /// Imports are not resolved here; use `compile_file` for
    /// multi-module programs.
    pub fn compile_source(&mut self, name: &str, text: &str) -> CompileOutput {
        let file = self.sources.add_file(format!("<{}>", name), text);
        let source = self.sources.file(file).text.clone();
        let mode = self.scan_mode();
        let mut tokens = scanner::scan(&source, file, mode, &mut self.sink);
        if mode == ScanMode::Cst {
            trivia::optimize_trivia(&mut tokens, &mut self.trivia);
        }
        let parsed = parser::parse(tokens, file, name, mode, &mut self.sink);
        self.run_passes(vec![parsed.module], parsed.cst)
    }

    /// Token stream for a file, for the `-tokens` surface
    pub fn scan_file(&mut self, path: &Path) -> Result<Vec<token::Token>, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let file = self.sources.add_file(path, text);
        let source = self.sources.file(file).text.clone();
        let mode = self.scan_mode();
        let mut tokens = scanner::scan(&source, file, mode, &mut self.sink);
        if mode == ScanMode::Cst {
            trivia::optimize_trivia(&mut tokens, &mut self.trivia);
        }
        Ok(tokens)
    }

    fn scan_mode(&self) -> ScanMode {
        match self.options.mode {
            SyntaxMode::Cst => ScanMode::Cst,
            SyntaxMode::Legacy => ScanMode::Legacy,
        }
    }

    fn run_passes(&mut self, parsed: Vec<Module>, cst: Option<Cst>) -> CompileOutput {
        // Scanner or parser errors: nothing downstream is meaningful
        if self.sink.has_errors() {
            debug!("frontend reported errors; semantic passes skipped");
            return CompileOutput {
                lir: None,
                cst,
                executable: false,
            };
        }

        // The AST-level optimizer (constant folding, dead code) plugs
        // in here: typed AST in, typed AST out, NodeIds preserved. The
        // core runs the identity transform.
        let modules = parsed;

        debug!(modules = modules.len(), "type checking");
        let mut checker = TypeChecker::new(
            &mut self.types,
            &mut self.modules,
            &mut self.sink,
            &self.options,
        );
        for module in &modules {
            checker.declare_module(module);
        }
        for module in &modules {
            checker.check_module(module);
        }
        let check_results = checker.into_results();
        if self.sink.has_errors() {
            debug!("semantic errors block LIR generation");
            return CompileOutput {
                lir: None,
                cst,
                executable: false,
            };
        }

        debug!("memory checking");
        let mut memory = MemoryChecker::new(
            &self.types,
            &check_results,
            &mut self.sink,
            &self.options,
        );
        for module in &modules {
            memory.check_module(module);
        }
        let memory_results = memory.into_results();
        if self.sink.has_errors() {
            debug!("memory errors block LIR generation");
            return CompileOutput {
                lir: None,
                cst,
                executable: false,
            };
        }

        debug!("visibility checking");
        let mut vis = VisibilityChecker::new(&self.types, &self.modules, &mut self.sink);
        vis.check(&check_results);
        // Visibility errors block execution, not LIR generation
        let executable = !self.sink.has_errors();

        debug!("lowering to LIR");
        let lir = lirgen::generate(
            &modules,
            &self.types,
            &self.modules,
            &check_results,
            &memory_results,
        );
        CompileOutput {
            lir: Some(lir),
            cst,
            executable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> (Compilation, CompileOutput) {
        let mut compilation = Compilation::new(CompilerOptions::default());
        let output = compilation.compile_source("main", source);
        (compilation, output)
    }

    #[test]
    fn test_pipeline_produces_lir() {
        let (compilation, output) = compile(
            r#"
fn add(a: int, b: int): int { return a + b; }
print(add(1, 2));
"#,
        );
        assert!(!compilation.sink.has_errors());
        let lir = output.lir.expect("LIR should be generated");
        assert!(output.executable);
        assert!(lir.function("main::add").is_some());
        assert!(lir.function("main").is_some());
        assert!(lir.validate().is_ok(), "{:?}", lir.validate());
    }

    #[test]
    fn test_semantic_errors_block_lir() {
        let (compilation, output) = compile("var x: int = \"nope\";");
        assert!(compilation.sink.has_errors());
        assert!(output.lir.is_none());
        assert!(!output.executable);
    }

    #[test]
    fn test_parse_errors_block_semantics() {
        let (compilation, output) = compile("var = ;");
        assert!(compilation.sink.has_errors());
        assert!(output.lir.is_none());
    }

    #[test]
    fn test_generated_lir_validates() {
        let sources = [
            "iter (x in 1..5) { print(\"{x}\"); }",
            r#"
fn to_int(s: str): int? {
    if (s == "10") { return ok(10); }
    return err();
}
fn plus_two(s: str): int? {
    var n: int = to_int(s)?;
    return ok(n + 2);
}
match plus_two("10") { Ok(v) => print("got {v}"), Err => print("none") }
"#,
            r#"
class A { fn name(): str { return "A"; } }
class B : A { fn name(): str { return "B"; } }
var items: [A] = [A(), B()];
iter (x in items) { print(x.name()); }
"#,
            r#"
var total: int = 0;
for (var i: int = 0; i < 10; i = i + 1) {
    if (i % 2 == 0) { continue; }
    total = total + i;
}
print(total);
"#,
        ];
        for source in sources {
            let (compilation, output) = compile(source);
            assert!(
                !compilation.sink.has_errors(),
                "errors for {:?}: {:?}",
                source,
                compilation.sink.iter().collect::<Vec<_>>()
            );
            let lir = output.lir.expect("LIR should be generated");
            assert!(lir.validate().is_ok(), "invalid LIR: {:?}", lir.validate());
        }
    }

    #[test]
    fn test_disassembly_stable() {
        let (_, output) = compile("fn f(): int { return 41 + 1; }");
        let lir = output.lir.unwrap();
        let text = limit_core::disassemble(&lir);
        assert_eq!(text, limit_core::disassemble(&lir));
        assert!(text.contains("fn main::f() -> I64"));
        assert!(text.contains("Add"));
    }
}
