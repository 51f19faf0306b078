//! Limit Core
//!
//! Shared foundation for the Limit compiler and runtime:
//!
//! - [`source`]: source map with byte-offset positions and context snippets
//! - [`diagnostics`]: structured, coded diagnostics and the collecting sink
//! - [`lir`]: the register-based low-level IR (typed registers, basic
//!   blocks, CFG) shared between the LIR generator and the VM
//! - [`disasm`]: deterministic textual form of LIR for debugging and tests

pub mod diagnostics;
pub mod disasm;
pub mod lir;
pub mod source;

pub use diagnostics::{Diagnostic, DiagnosticSink, Severity, Stage};
pub use disasm::disassemble;
pub use lir::{AbiType, Block, ConstValue, Inst, LirFunction, LirModule, Op, Reg};
pub use source::{FileId, SourceFile, SourceMap, Span};
