//! Limit CLI
//!
//! Driver surface:
//!
//! ```text
//! limit <file>            compile and execute
//! limit -ast <file>       print the AST
//! limit -cst <file>       print the CST
//! limit -tokens <file>    print tokens (with trivia in cst mode)
//! limit -bytecode <file>  print the LIR disassembly
//! limit -repl             interactive REPL
//! limit -debug <file>     execute with diagnostic output enabled
//! ```
//!
//! Exit codes: 0 success, 1 compile error, 2 runtime error, 3 I/O or
//! driver error.

mod repl;

use anyhow::Context;
use clap::Parser as ClapParser;
use limit_runtime::{NullRuntime, Vm};
use limitc::{Compilation, CompilerOptions, SyntaxMode};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const EXIT_COMPILE_ERROR: u8 = 1;
const EXIT_RUNTIME_ERROR: u8 = 2;
const EXIT_DRIVER_ERROR: u8 = 3;

#[derive(ClapParser)]
#[command(name = "limit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Limit language compiler and runtime", long_about = None)]
struct Cli {
    /// Source file to compile and execute
    file: Option<PathBuf>,

    /// Print the AST instead of executing
    #[arg(long = "ast")]
    ast: bool,

    /// Print the CST (lossless syntax tree) instead of executing
    #[arg(long = "cst")]
    cst: bool,

    /// Print the token stream (with trivia in cst mode)
    #[arg(long = "tokens")]
    tokens: bool,

    /// Print the LIR disassembly instead of executing
    #[arg(long = "bytecode")]
    bytecode: bool,

    /// Start the interactive REPL
    #[arg(long = "repl")]
    repl: bool,

    /// Execute with diagnostic output enabled
    #[arg(long = "debug")]
    debug: bool,

    /// Elevate style warnings to errors
    #[arg(long = "strict")]
    strict: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("LIMIT_LOG"))
        .with_writer(std::io::stderr)
        .init();

    // The documented surface spells modes with a single dash
    // (`limit -ast file.lm`); normalize them for the parser
    let args = std::env::args().map(|arg| match arg.as_str() {
        "-ast" | "-cst" | "-tokens" | "-bytecode" | "-repl" | "-debug" | "-strict" => {
            format!("-{}", arg)
        }
        _ => arg,
    });
    let cli = Cli::parse_from(args);

    if cli.repl {
        return match repl::run() {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("error: {:#}", error);
                ExitCode::from(EXIT_DRIVER_ERROR)
            }
        };
    }

    let Some(file) = cli.file.as_deref() else {
        eprintln!("error: no input file (try 'limit --help')");
        return ExitCode::from(EXIT_DRIVER_ERROR);
    };

    match run_file(&cli, file) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {:#}", error);
            ExitCode::from(EXIT_DRIVER_ERROR)
        }
    }
}

fn run_file(cli: &Cli, file: &Path) -> anyhow::Result<ExitCode> {
    let dir = file.parent().unwrap_or(Path::new("."));
    let mut options = CompilerOptions::load(dir).map_err(anyhow::Error::msg)?;
    options.strict |= cli.strict;
    options.debug |= cli.debug;
    // The lossless surfaces need the trivia-preserving pipeline
    if cli.cst || cli.tokens {
        options.mode = SyntaxMode::Cst;
    }

    let mut compilation = Compilation::new(options);

    if cli.tokens {
        let tokens = compilation
            .scan_file(file)
            .map_err(anyhow::Error::msg)
            .context("scanning failed")?;
        report(&compilation);
        let json = serde_json::to_string_pretty(&tokens)?;
        println!("{}", json);
        return Ok(exit_for(&compilation));
    }

    if cli.ast {
        let parsed = parse_only(&mut compilation, file)?;
        report(&compilation);
        if let Some(module) = parsed {
            println!("{:#?}", module);
        }
        return Ok(exit_for(&compilation));
    }

    let output = compilation
        .compile_file(file)
        .map_err(anyhow::Error::msg)?;
    report(&compilation);

    if cli.cst {
        match &output.cst {
            Some(cst) => println!("{}", cst.dump()),
            None => eprintln!("no CST was produced"),
        }
        return Ok(exit_for(&compilation));
    }

    let Some(lir) = output.lir else {
        return Ok(ExitCode::from(EXIT_COMPILE_ERROR));
    };

    if cli.bytecode {
        print!("{}", limit_core::disassemble(&lir));
        return Ok(exit_for(&compilation));
    }

    if !output.executable {
        return Ok(ExitCode::from(EXIT_COMPILE_ERROR));
    }

    let runtime = NullRuntime::new();
    let mut vm = Vm::new(&lir, &runtime);
    vm.set_debug(cli.debug);
    match vm.run("main", vec![]) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(fault) => {
            eprintln!("runtime error[E{:03}]: {}", fault.code(), fault);
            Ok(ExitCode::from(EXIT_RUNTIME_ERROR))
        }
    }
}

/// Scan and parse a single file without running semantics (`-ast`)
fn parse_only(
    compilation: &mut Compilation,
    file: &Path,
) -> anyhow::Result<Option<limitc::ast::Module>> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let name = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string());
    let id = compilation.sources.add_file(file, text.clone());
    let mode = match compilation.options.mode {
        SyntaxMode::Cst => limitc::ScanMode::Cst,
        SyntaxMode::Legacy => limitc::ScanMode::Legacy,
    };
    let tokens = limitc::scanner::scan(&text, id, mode, &mut compilation.sink);
    let parsed = limitc::parser::parse(tokens, id, &name, mode, &mut compilation.sink);
    Ok(Some(parsed.module))
}

fn report(compilation: &Compilation) {
    for diagnostic in compilation.sink.iter() {
        eprintln!("{}", diagnostic.render(&compilation.sources));
    }
}

fn exit_for(compilation: &Compilation) -> ExitCode {
    if compilation.sink.has_errors() {
        ExitCode::from(EXIT_COMPILE_ERROR)
    } else {
        ExitCode::SUCCESS
    }
}
