//! Interactive REPL
//!
//! Each line compiles as a one-file module and runs immediately.
//! Diagnostics print without ending the session. History persists for
//! the session only.

use limit_runtime::{NullRuntime, Vm};
use limitc::{Compilation, CompilerOptions};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

pub fn run() -> anyhow::Result<()> {
    println!("Limit {} — :quit to exit", env!("CARGO_PKG_VERSION"));
    let mut editor = DefaultEditor::new()?;
    let mut counter = 0u32;

    loop {
        match editor.readline("limit> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == ":quit" || line == ":q" {
                    break;
                }
                editor.add_history_entry(line)?;
                counter += 1;
                evaluate(line, counter);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}

fn evaluate(line: &str, counter: u32) {
    // Bare expressions print their value; statements run as written
    let source = if needs_print_wrapper(line) {
        format!("print({});", line.trim_end_matches(';'))
    } else {
        line.to_string()
    };

    let mut compilation = Compilation::new(CompilerOptions::default());
    let output = compilation.compile_source(&format!("repl{}", counter), &source);
    if compilation.sink.has_errors() {
        for diagnostic in compilation.sink.iter() {
            eprintln!("{}", diagnostic.render(&compilation.sources));
        }
        return;
    }
    let Some(lir) = output.lir else {
        return;
    };
    let runtime = NullRuntime::new();
    let mut vm = Vm::new(&lir, &runtime);
    if let Err(fault) = vm.run("main", vec![]) {
        eprintln!("runtime error[E{:03}]: {}", fault.code(), fault);
    }
}

/// A line that is a single expression (no statement keyword, no
/// declaration) gets wrapped in print(...)
fn needs_print_wrapper(line: &str) -> bool {
    let first_word = line
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .next()
        .unwrap_or("");
    !matches!(
        first_word,
        "var" | "fn" | "class" | "if" | "while" | "for" | "iter" | "loop" | "match" | "return"
            | "break" | "continue" | "import" | "type" | "enum" | "print" | "parallel"
            | "concurrent" | "task"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_lines_get_wrapped() {
        assert!(needs_print_wrapper("1 + 2"));
        assert!(needs_print_wrapper("to_int(\"10\")"));
        assert!(!needs_print_wrapper("var x: int = 1;"));
        assert!(!needs_print_wrapper("print(\"hi\");"));
        assert!(!needs_print_wrapper("match x { _ => print(\"y\") }"));
    }
}
