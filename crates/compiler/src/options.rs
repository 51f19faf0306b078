//! Compiler options
//!
//! Options come from CLI flags and, when present, a `limit.toml` next
//! to the compiled file. CLI flags win over the file.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyntaxMode {
    /// Trivia discarded, AST only
    #[default]
    Legacy,
    /// Trivia preserved, CST built alongside the AST
    Cst,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerOptions {
    /// Elevate style warnings (unconsumed linear values, skipped init)
    /// to errors
    pub strict: bool,
    pub mode: SyntaxMode,
    /// Per-pass fatal diagnostic threshold
    pub error_limit: usize,
    /// Extra directories searched for imported modules, after the
    /// importing file's directory
    pub module_paths: Vec<PathBuf>,
    /// Verbose diagnostics at runtime (the `-debug` flag)
    pub debug: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            strict: false,
            mode: SyntaxMode::Legacy,
            error_limit: limit_core::diagnostics::DEFAULT_ERROR_LIMIT,
            module_paths: Vec::new(),
            debug: false,
        }
    }
}

impl CompilerOptions {
    /// Load `limit.toml` from the given directory, if there is one
    pub fn load(dir: &Path) -> Result<CompilerOptions, String> {
        let path = dir.join("limit.toml");
        if !path.exists() {
            return Ok(CompilerOptions::default());
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        toml::from_str(&text).map_err(|e| format!("invalid {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let options = CompilerOptions::default();
        assert!(!options.strict);
        assert_eq!(options.mode, SyntaxMode::Legacy);
        assert_eq!(options.error_limit, 100);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let options = CompilerOptions::load(dir.path()).unwrap();
        assert!(!options.strict);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("limit.toml"),
            "strict = true\nmode = \"cst\"\nerror_limit = 25\n",
        )
        .unwrap();
        let options = CompilerOptions::load(dir.path()).unwrap();
        assert!(options.strict);
        assert_eq!(options.mode, SyntaxMode::Cst);
        assert_eq!(options.error_limit, 25);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("limit.toml"), "nonsense = 1\n").unwrap();
        assert!(CompilerOptions::load(dir.path()).is_err());
    }
}
