//! Module loader for Limit
//!
//! Resolves `import a.b.c;` statements to files: dots become path
//! separators, `.lm` is appended, and the result is searched relative
//! to the importing file's directory and then the configured module
//! paths. Files load once and are cached by canonical path; circular
//! imports are detected with an in-progress chain and reported.

use crate::ast::{ItemKind, Module};
use crate::codes;
use crate::options::{CompilerOptions, SyntaxMode};
use crate::parser;
use crate::scanner::{self, ScanMode};
use crate::trivia::{TriviaPool, optimize_trivia};
use limit_core::diagnostics::{Diagnostic, DiagnosticSink, Stage};
use limit_core::source::SourceMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct LoadResult {
    /// All loaded modules, dependencies before dependents; the entry
    /// module is last
    pub modules: Vec<Module>,
    /// The entry file's CST, in cst mode
    pub cst: Option<crate::cst::Cst>,
}

pub struct ModuleLoader<'a> {
    sources: &'a mut SourceMap,
    sink: &'a mut DiagnosticSink,
    trivia: &'a mut TriviaPool,
    options: &'a CompilerOptions,
    /// canonical path -> module name, for double-include prevention
    loaded: HashMap<PathBuf, String>,
    /// Chain of files currently being loaded, for cycle reporting
    in_progress: Vec<PathBuf>,
    modules: Vec<Module>,
}

impl<'a> ModuleLoader<'a> {
    pub fn new(
        sources: &'a mut SourceMap,
        sink: &'a mut DiagnosticSink,
        trivia: &'a mut TriviaPool,
        options: &'a CompilerOptions,
    ) -> Self {
        ModuleLoader {
            sources,
            sink,
            trivia,
            options,
            loaded: HashMap::new(),
            in_progress: Vec::new(),
            modules: Vec::new(),
        }
    }

    /// Load the entry file and, transitively, everything it imports
    pub fn load(mut self, entry: &Path) -> Result<LoadResult, String> {
        let canonical = entry
            .canonicalize()
            .map_err(|e| format!("failed to read {}: {}", entry.display(), e))?;
        let cst = self.load_file(&canonical, true)?;
        Ok(LoadResult {
            modules: self.modules,
            cst,
        })
    }

    fn load_file(
        &mut self,
        path: &Path,
        is_entry: bool,
    ) -> Result<Option<crate::cst::Cst>, String> {
        if self.loaded.contains_key(path) {
            return Ok(None);
        }
        if self.in_progress.contains(&path.to_path_buf()) {
            let chain = self
                .in_progress
                .iter()
                .map(|p| module_name(p))
                .collect::<Vec<_>>()
                .join(" -> ");
            self.sink.push(
                Diagnostic::error(
                    codes::CIRCULAR_IMPORT,
                    Stage::Semantic,
                    format!(
                        "circular import: {} -> {}",
                        chain,
                        module_name(path)
                    ),
                )
                .with_hint("break the cycle by moving the shared declarations to a third module"),
            );
            return Ok(None);
        }
        self.in_progress.push(path.to_path_buf());

        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let name = module_name(path);
        let file = self.sources.add_file(path, text);
        let source = self.sources.file(file).text.clone();

        let mode = match self.options.mode {
            SyntaxMode::Cst => ScanMode::Cst,
            SyntaxMode::Legacy => ScanMode::Legacy,
        };
        let mut tokens = scanner::scan(&source, file, mode, self.sink);
        if mode == ScanMode::Cst {
            optimize_trivia(&mut tokens, self.trivia);
        }
        let parsed = parser::parse(tokens, file, &name, mode, self.sink);

        // Imports load depth-first so dependencies land before dependents
        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        for item in &parsed.module.items {
            if let ItemKind::Import(import) = &item.kind {
                match self.resolve_import(&import.path, &dir) {
                    Some(target) => {
                        self.load_file(&target, false)?;
                    }
                    None => {
                        self.sink.push(
                            Diagnostic::error(
                                codes::MODULE_NOT_FOUND,
                                Stage::Semantic,
                                format!("module '{}' not found", import.path.join(".")),
                            )
                            .at(file, item.span)
                            .with_hint(
                                "imports resolve relative to the importing file, then the module path",
                            ),
                        );
                    }
                }
            }
        }

        self.in_progress.pop();
        self.loaded.insert(path.to_path_buf(), name);
        self.modules.push(parsed.module);
        Ok(if is_entry { parsed.cst } else { None })
    }

    /// `a.b.c` -> `a/b/c.lm`, searched in the importing directory and
    /// then each configured module path
    fn resolve_import(&self, segments: &[String], importing_dir: &Path) -> Option<PathBuf> {
        let mut relative = PathBuf::new();
        for segment in segments {
            relative.push(segment);
        }
        relative.set_extension("lm");

        let candidate = importing_dir.join(&relative);
        if candidate.is_file() {
            return candidate.canonicalize().ok();
        }
        for module_path in &self.options.module_paths {
            let candidate = module_path.join(&relative);
            if candidate.is_file() {
                return candidate.canonicalize().ok();
            }
        }
        None
    }
}

fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn load_from(dir: &Path, entry: &str) -> (Result<LoadResult, String>, DiagnosticSink) {
        let mut sources = SourceMap::new();
        let mut sink = DiagnosticSink::new();
        let mut trivia = TriviaPool::new();
        let options = CompilerOptions::default();
        let loader = ModuleLoader::new(&mut sources, &mut sink, &mut trivia, &options);
        let result = loader.load(&dir.join(entry));
        (result, sink)
    }

    #[test]
    fn test_single_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.lm"), "var x: int = 1;\n").unwrap();
        let (result, sink) = load_from(dir.path(), "main.lm");
        let result = result.unwrap();
        assert!(!sink.has_errors());
        assert_eq!(result.modules.len(), 1);
        assert_eq!(result.modules[0].name, "main");
    }

    #[test]
    fn test_import_resolves_relative() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("util.lm"), "pub fn helper(): int { return 7; }\n").unwrap();
        fs::write(dir.path().join("main.lm"), "import util;\nprint(util.helper());\n").unwrap();
        let (result, sink) = load_from(dir.path(), "main.lm");
        let result = result.unwrap();
        assert!(!sink.has_errors(), "{:?}", sink.iter().collect::<Vec<_>>());
        // Dependency first, entry last
        assert_eq!(result.modules[0].name, "util");
        assert_eq!(result.modules[1].name, "main");
    }

    #[test]
    fn test_dotted_import_path() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c.lm"), "pub var v: int = 1;\n").unwrap();
        fs::write(dir.path().join("main.lm"), "import a.b.c;\nprint(c.v);\n").unwrap();
        let (result, sink) = load_from(dir.path(), "main.lm");
        assert!(!sink.has_errors(), "{:?}", sink.iter().collect::<Vec<_>>());
        assert_eq!(result.unwrap().modules[0].name, "c");
    }

    #[test]
    fn test_missing_module_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.lm"), "import nowhere;\n").unwrap();
        let (_, sink) = load_from(dir.path(), "main.lm");
        assert!(sink.iter().any(|d| d.code == codes::MODULE_NOT_FOUND));
    }

    #[test]
    fn test_circular_import_detected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.lm"), "import b;\n").unwrap();
        fs::write(dir.path().join("b.lm"), "import a;\n").unwrap();
        let (_, sink) = load_from(dir.path(), "a.lm");
        assert!(sink.iter().any(|d| d.code == codes::CIRCULAR_IMPORT));
    }

    #[test]
    fn test_diamond_loads_once() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("shared.lm"), "pub var v: int = 1;\n").unwrap();
        fs::write(dir.path().join("a.lm"), "import shared;\n").unwrap();
        fs::write(dir.path().join("b.lm"), "import shared;\n").unwrap();
        fs::write(dir.path().join("main.lm"), "import a;\nimport b;\n").unwrap();
        let (result, sink) = load_from(dir.path(), "main.lm");
        assert!(!sink.has_errors());
        let names: Vec<_> = result
            .unwrap()
            .modules
            .iter()
            .map(|m| m.name.clone())
            .collect();
        assert_eq!(
            names.iter().filter(|n| n.as_str() == "shared").count(),
            1
        );
    }

    #[test]
    fn test_module_path_fallback() {
        let dir = tempdir().unwrap();
        let lib_dir = dir.path().join("lib");
        fs::create_dir_all(&lib_dir).unwrap();
        fs::write(lib_dir.join("extra.lm"), "pub var v: int = 9;\n").unwrap();
        fs::write(dir.path().join("main.lm"), "import extra;\n").unwrap();

        let mut sources = SourceMap::new();
        let mut sink = DiagnosticSink::new();
        let mut trivia = TriviaPool::new();
        let options = CompilerOptions {
            module_paths: vec![lib_dir],
            ..CompilerOptions::default()
        };
        let loader = ModuleLoader::new(&mut sources, &mut sink, &mut trivia, &options);
        let result = loader.load(&dir.path().join("main.lm")).unwrap();
        assert!(!sink.has_errors());
        assert_eq!(result.modules[0].name, "extra");
    }
}
