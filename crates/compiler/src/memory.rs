//! Memory checker for Limit
//!
//! Region-and-ownership inference. Each lexical scope is a region;
//! every binding of compound type is `linear` (exactly one owner, tied
//! to its region) and everything else is a `ref` or a plain copy.
//! Moving a linear binding (returning it, seeding another linear slot,
//! wrapping it in `ok`/`err`) invalidates the source; later reads are
//! use-after-move, later moves are double-move.
//!
//! The checker's output is a release plan: for every block, the linear
//! locals to destroy at its exit in reverse declaration order, and for
//! every `?` / `? else` edge, the linear locals live in the enclosing
//! function at that point. The LIR generator turns the plan into
//! explicit cleanup instructions, which is what makes destruction
//! deterministic (and error propagation leak-free) at runtime.

use crate::ast::*;
use crate::codes;
use crate::options::CompilerOptions;
use crate::typecheck::TypeCheckResults;
use crate::types::{TypeKind, TypeTable};
use limit_core::diagnostics::{Diagnostic, DiagnosticSink, Severity, Stage};
use limit_core::source::{FileId, Span};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Linear,
    Ref,
}

#[derive(Debug, Default)]
pub struct MemoryResults {
    /// Classification of each `var` statement's binding
    pub ownership: HashMap<NodeId, Ownership>,
    /// Per block id: linear locals to release at scope exit, reverse
    /// declaration order
    pub releases: HashMap<NodeId, Vec<String>>,
    /// Per `?` expression id: linear locals live in the enclosing
    /// function at that point, innermost region first, released on the
    /// propagation edge
    pub error_releases: HashMap<NodeId, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BindingState {
    Live,
    Moved(Span),
}

#[derive(Debug)]
struct Binding {
    name: String,
    ownership: Ownership,
    state: BindingState,
    declared_at: Span,
    used: bool,
}

#[derive(Debug)]
struct Region {
    block: NodeId,
    bindings: Vec<Binding>,
}

pub struct MemoryChecker<'a> {
    types: &'a TypeTable,
    check: &'a TypeCheckResults,
    sink: &'a mut DiagnosticSink,
    options: &'a CompilerOptions,
    results: MemoryResults,
    regions: Vec<Region>,
    file: FileId,
    /// > 0 inside `parallel` / `concurrent` / `task` blocks, where
    /// captures of outer linear bindings are restricted
    task_depth: usize,
    /// Region index where each enclosing task block starts; bindings in
    /// lower regions are captures
    task_bases: Vec<usize>,
    /// Region index where the current function's frame starts
    frame_base: usize,
}

impl<'a> MemoryChecker<'a> {
    pub fn new(
        types: &'a TypeTable,
        check: &'a TypeCheckResults,
        sink: &'a mut DiagnosticSink,
        options: &'a CompilerOptions,
    ) -> Self {
        MemoryChecker {
            types,
            check,
            sink,
            options,
            results: MemoryResults::default(),
            regions: Vec::new(),
            file: FileId(0),
            task_depth: 0,
            task_bases: Vec::new(),
            frame_base: 0,
        }
    }

    pub fn into_results(self) -> MemoryResults {
        self.results
    }

    pub fn check_module(&mut self, module: &Module) {
        self.file = module.file;
        for item in &module.items {
            match &item.kind {
                ItemKind::Fn(decl) => self.check_function(decl),
                ItemKind::Class(decl) => {
                    for member in &decl.members {
                        match &member.kind {
                            ClassMemberKind::Method(method) | ClassMemberKind::Init(method) => {
                                self.check_function(method)
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        // Top-level script statements form one frame and one region
        self.enter_region(NodeId(u32::MAX));
        for item in &module.items {
            match &item.kind {
                ItemKind::Var(decl) => self.check_var(decl, item.id, item.span),
                ItemKind::Stmt(stmt) => self.check_stmt(stmt),
                _ => {}
            }
        }
        self.exit_region();
    }

    fn check_function(&mut self, decl: &FnDecl) {
        let saved_base = self.frame_base;
        self.frame_base = self.regions.len();
        // Parameters are refs by default for compound types: the frame
        // region owns nothing it did not create
        self.enter_region(decl.body.id);
        for param in &decl.params {
            self.regions
                .last_mut()
                .expect("function region was just entered")
                .bindings
                .push(Binding {
                    name: param.name.clone(),
                    ownership: Ownership::Ref,
                    state: BindingState::Live,
                    declared_at: param.span,
                    used: true,
                });
        }
        for stmt in &decl.body.stmts {
            self.check_stmt(stmt);
        }
        self.exit_region();
        self.frame_base = saved_base;
    }

    // ----- regions -----

    fn enter_region(&mut self, block: NodeId) {
        self.regions.push(Region {
            block,
            bindings: Vec::new(),
        });
    }

    fn exit_region(&mut self) {
        let region = self.regions.pop().expect("region underflow");
        let mut releases = Vec::new();
        // Reverse declaration order
        for binding in region.bindings.iter().rev() {
            if binding.ownership == Ownership::Linear && binding.state == BindingState::Live {
                releases.push(binding.name.clone());
                if !binding.used {
                    let diag = Diagnostic::warning(
                        codes::LINEAR_NOT_CONSUMED,
                        Stage::Memory,
                        format!(
                            "linear value '{}' is never used before its region ends",
                            binding.name
                        ),
                    )
                    .at(self.file, binding.declared_at)
                    .with_hint("use it, move it out, or drop the binding");
                    let diag = if self.options.strict {
                        Diagnostic {
                            severity: Severity::Error,
                            ..diag
                        }
                    } else {
                        diag
                    };
                    self.sink.push(diag);
                }
            }
        }
        if region.block != NodeId(u32::MAX) {
            self.results.releases.insert(region.block, releases);
        }
    }

    fn check_block(&mut self, block: &Block) {
        self.enter_region(block.id);
        for stmt in &block.stmts {
            self.check_stmt(stmt);
        }
        self.exit_region();
    }

    // ----- bindings -----

    fn declare(&mut self, name: &str, ownership: Ownership, span: Span, node: NodeId) {
        self.results.ownership.insert(node, ownership);
        self.regions
            .last_mut()
            .expect("declare outside any region")
            .bindings
            .push(Binding {
                name: name.to_string(),
                ownership,
                state: BindingState::Live,
                declared_at: span,
                used: false,
            });
    }

    fn find_binding(&mut self, name: &str) -> Option<(usize, &mut Binding)> {
        for (index, region) in self.regions.iter_mut().enumerate().rev() {
            if let Some(binding) = region
                .bindings
                .iter_mut()
                .rev()
                .find(|b| b.name == name)
            {
                return Some((index, binding));
            }
        }
        None
    }

    /// Classification for a declared type: values of compound type own
    /// heap storage and are linear; scalars copy
    fn is_compound(&self, node: NodeId) -> bool {
        let Some(ty) = self.check.type_of(node) else {
            return false;
        };
        matches!(
            self.types.kind(self.types.resolve_alias(ty)),
            TypeKind::Str
                | TypeKind::List(_)
                | TypeKind::Dict(_, _)
                | TypeKind::Tuple(_)
                | TypeKind::Structural(_)
                | TypeKind::Class(_)
                | TypeKind::Interface(_)
                | TypeKind::SelfType(_)
                | TypeKind::Union(_)
                | TypeKind::Optional { .. }
                | TypeKind::Function { .. }
        )
    }

    // ----- statements -----

    fn check_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Var(decl) => self.check_var(decl, stmt.id, stmt.span),
            StmtKind::Fn(decl) => self.check_function(decl),
            StmtKind::Expr(expr) => self.check_expr(expr, false),
            StmtKind::Block(block) => self.check_block(block),
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.check_expr(cond, false);
                self.check_block(then_block);
                if let Some(else_block) = else_block {
                    self.check_stmt(else_block);
                }
            }
            StmtKind::While { cond, body } => {
                self.check_expr(cond, false);
                self.check_block(body);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.enter_region(stmt.id);
                if let Some(init) = init {
                    self.check_stmt(init);
                }
                if let Some(cond) = cond {
                    self.check_expr(cond, false);
                }
                if let Some(step) = step {
                    self.check_expr(step, false);
                }
                self.check_block(body);
                self.exit_region();
            }
            StmtKind::Iter {
                binding,
                iterable,
                body,
            } => {
                self.check_expr(iterable, false);
                self.enter_region(stmt.id);
                // Loop bindings borrow the elements; they never own them
                self.declare(binding, Ownership::Ref, stmt.span, stmt.id);
                self.mark_used(binding);
                self.check_block(body);
                self.exit_region();
            }
            StmtKind::Loop { body } => self.check_block(body),
            StmtKind::Return(value) => {
                if let Some(expr) = value {
                    // Returning transfers ownership to the caller
                    self.check_expr(expr, true);
                }
            }
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Parallel(block) | StmtKind::Concurrent(block) | StmtKind::Task(block) => {
                self.task_depth += 1;
                self.task_bases.push(self.regions.len());
                self.check_block(block);
                self.task_bases.pop();
                self.task_depth -= 1;
            }
        }
    }

    fn check_var(&mut self, decl: &VarDecl, node: NodeId, span: Span) {
        let compound = decl
            .init
            .as_ref()
            .is_some_and(|init| self.is_compound(init.id));
        if let Some(init) = &decl.init {
            // Seeding a linear slot from a linear source is a move
            self.check_expr(init, compound);
        }
        let ownership = if compound {
            Ownership::Linear
        } else {
            Ownership::Ref
        };
        self.declare(&decl.name, ownership, span, node);
    }

    // ----- expressions -----

    /// Walk an expression. `consuming` means the value's ownership
    /// leaves the current region (return, seeding a linear binding,
    /// being wrapped into an ok/err payload).
    fn check_expr(&mut self, expr: &Expr, consuming: bool) {
        match &expr.kind {
            ExprKind::Name(name) => self.check_name_use(name, expr.span, consuming),
            ExprKind::Nil
            | ExprKind::Bool(_)
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_) => {}
            ExprKind::Interp(parts) => {
                for part in parts {
                    if let InterpPart::Expr(inner) = part {
                        // Read-only position, like a print argument
                        self.check_expr(inner, false);
                    }
                }
            }
            ExprKind::SelfRef => {}
            ExprKind::SuperCall { args, .. } => {
                for arg in args {
                    self.check_expr(arg, false);
                }
            }
            ExprKind::Member { obj, .. } => self.check_expr(obj, false),
            ExprKind::Index { obj, index } => {
                self.check_expr(obj, false);
                self.check_expr(index, false);
            }
            ExprKind::Call { callee, args } => {
                self.check_expr(callee, false);
                // Parameters are refs by default: arguments are lent,
                // not moved
                for arg in args {
                    self.check_expr(arg, false);
                }
            }
            ExprKind::Unary { operand, .. } => self.check_expr(operand, false),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.check_expr(lhs, false);
                self.check_expr(rhs, false);
            }
            ExprKind::Assign { target, value, .. } => {
                let target_linear = matches!(&target.kind, ExprKind::Name(_))
                    && self.is_compound(value.id);
                self.check_expr(value, target_linear);
                // Reassignment revives the binding with a fresh value
                if let ExprKind::Name(name) = &target.kind
                    && let Some((_, binding)) = self.find_binding(name)
                {
                    binding.state = BindingState::Live;
                    binding.used = true;
                } else {
                    self.check_expr(target, false);
                }
            }
            ExprKind::Ok(payload) | ExprKind::Err(payload) => {
                if let Some(inner) = payload {
                    // The payload's ownership moves into the optional
                    self.check_expr(inner, true);
                }
            }
            ExprKind::Propagate(inner) => {
                self.check_expr(inner, false);
                self.record_error_edge(expr.id);
            }
            ExprKind::Recover {
                expr: inner,
                binding,
                handler,
            } => {
                // Recovery keeps the enclosing region's values alive;
                // only the failing callee's regions unwind
                self.check_expr(inner, false);
                self.enter_region(handler.id);
                if let Some(name) = binding {
                    self.declare(name, Ownership::Ref, expr.span, expr.id);
                    self.mark_used(name);
                }
                for stmt in &handler.stmts {
                    self.check_stmt(stmt);
                }
                self.exit_region();
            }
            ExprKind::Range { lo, hi } => {
                self.check_expr(lo, false);
                self.check_expr(hi, false);
            }
            ExprKind::List(elements) => {
                for element in elements {
                    // Elements move into the list
                    self.check_expr(element, true);
                }
            }
            ExprKind::Dict(entries) => {
                for (key, value) in entries {
                    self.check_expr(key, true);
                    self.check_expr(value, true);
                }
            }
            ExprKind::Match(match_expr) => {
                self.check_expr(&match_expr.scrutinee, false);
                for arm in &match_expr.arms {
                    self.enter_region(arm.id);
                    for binding in pattern_bindings(&arm.pattern.kind) {
                        self.declare(binding, Ownership::Ref, arm.span, arm.id);
                        self.mark_used(binding);
                    }
                    if let Some(guard) = &arm.guard {
                        self.check_expr(guard, false);
                    }
                    match &arm.body {
                        ArmBody::Expr(expr) => self.check_expr(expr, false),
                        ArmBody::Block(block) => {
                            for stmt in &block.stmts {
                                self.check_stmt(stmt);
                            }
                        }
                    }
                    self.exit_region();
                }
            }
            ExprKind::Await(inner) => self.check_expr(inner, false),
        }
    }

    fn check_name_use(&mut self, name: &str, span: Span, consuming: bool) {
        let file = self.file;
        let task_base = self.task_bases.last().copied();
        let Some((region_index, binding)) = self.find_binding(name) else {
            // Module binding or builtin; not region-tracked
            return;
        };
        binding.used = true;

        // Tasks may capture an outer linear binding only as a
        // borrowing ref; consuming it from inside the block would be
        // both a capture and a move
        let captured_from_outside = task_base.is_some_and(|base| region_index < base);
        match binding.state {
            BindingState::Moved(moved_at) => {
                let diag = if consuming {
                    Diagnostic::error(
                        codes::DOUBLE_MOVE,
                        Stage::Memory,
                        format!("'{}' is moved a second time", name),
                    )
                } else {
                    Diagnostic::error(
                        codes::USE_AFTER_MOVE,
                        Stage::Memory,
                        format!("'{}' is used after being moved", name),
                    )
                };
                self.sink.push(
                    diag.at(file, span)
                        .caused_by(moved_at, "ownership left the binding here"),
                );
            }
            BindingState::Live => {
                if consuming && binding.ownership == Ownership::Linear {
                    if captured_from_outside {
                        self.sink.push(
                            Diagnostic::error(
                                codes::CAPTURE_CONFLICT,
                                Stage::Memory,
                                format!(
                                    "task captures '{}' by reference and cannot also consume it",
                                    name
                                ),
                            )
                            .at(file, span)
                            .with_hint(
                                "move the value into the task before the block, or only read it",
                            ),
                        );
                    } else {
                        binding.state = BindingState::Moved(span);
                    }
                }
            }
        }
    }

    fn mark_used(&mut self, name: &str) {
        if let Some((_, binding)) = self.find_binding(name) {
            binding.used = true;
        }
    }

    /// Record the linear locals live in the current frame, for the
    /// cleanup sequence on an error-propagation edge
    fn record_error_edge(&mut self, node: NodeId) {
        let mut live = Vec::new();
        for region in self.regions[self.frame_base..].iter().rev() {
            for binding in region.bindings.iter().rev() {
                if binding.ownership == Ownership::Linear
                    && binding.state == BindingState::Live
                {
                    live.push(binding.name.clone());
                }
            }
        }
        self.results.error_releases.insert(node, live);
    }
}

fn pattern_bindings(pattern: &PatternKind) -> Vec<&str> {
    match pattern {
        PatternKind::Binding(name) => vec![name.as_str()],
        PatternKind::Variant { bindings, .. } => {
            bindings.iter().map(|b| b.as_str()).collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleRegistry;
    use crate::parser;
    use crate::scanner::{self, ScanMode};
    use crate::typecheck::TypeChecker;
    use crate::types::TypeTable;

    fn run(source: &str) -> (DiagnosticSink, MemoryResults) {
        run_with(source, CompilerOptions::default())
    }

    fn run_with(source: &str, options: CompilerOptions) -> (DiagnosticSink, MemoryResults) {
        let mut sink = DiagnosticSink::new();
        let tokens = scanner::scan(source, FileId(0), ScanMode::Legacy, &mut sink);
        let parsed = parser::parse(tokens, FileId(0), "main", ScanMode::Legacy, &mut sink);
        assert!(!sink.has_errors(), "parse errors: {:?}", sink.iter().collect::<Vec<_>>());

        let mut types = TypeTable::new();
        let mut modules = ModuleRegistry::new();
        let mut checker = TypeChecker::new(&mut types, &mut modules, &mut sink, &options);
        checker.declare_module(&parsed.module);
        checker.check_module(&parsed.module);
        let check_results = checker.into_results();
        assert!(
            !sink.has_errors(),
            "type errors: {:?}",
            sink.iter().collect::<Vec<_>>()
        );

        let mut memory = MemoryChecker::new(&types, &check_results, &mut sink, &options);
        memory.check_module(&parsed.module);
        let results = memory.into_results();
        (sink, results)
    }

    fn assert_memory_error(source: &str, code: u16) {
        let (sink, _) = run(source);
        assert!(
            sink.iter().any(|d| d.code == code),
            "expected E{:03}, got: {:?}",
            code,
            sink.iter().collect::<Vec<_>>()
        );
    }

    fn assert_memory_clean(source: &str) {
        let (sink, _) = run(source);
        assert!(
            !sink.iter().any(|d| d.stage == Stage::Memory && d.is_error()),
            "unexpected memory errors: {:?}",
            sink.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_use_after_move() {
        assert_memory_error(
            r#"
fn consume(): str {
    var a: str = "hello";
    var b: str = a;
    return a;
}
"#,
            codes::USE_AFTER_MOVE,
        );
    }

    #[test]
    fn test_double_move() {
        assert_memory_error(
            r#"
fn consume(): str {
    var a: str = "hello";
    var b: str = a;
    var c: str = a;
    return b;
}
"#,
            codes::DOUBLE_MOVE,
        );
    }

    #[test]
    fn test_move_then_reassign_revives() {
        assert_memory_clean(
            r#"
fn f(): str {
    var a: str = "one";
    var b: str = a;
    a = "two";
    return a;
}
"#,
        );
    }

    #[test]
    fn test_primitives_copy_freely() {
        assert_memory_clean(
            r#"
fn f(): int {
    var a: int = 1;
    var b: int = a;
    return a + b;
}
"#,
        );
    }

    #[test]
    fn test_call_arguments_are_borrowed() {
        assert_memory_clean(
            r#"
fn show(s: str) { print(s); }
fn f(): str {
    var a: str = "hello";
    show(a);
    show(a);
    return a;
}
"#,
        );
    }

    #[test]
    fn test_linear_not_consumed_warns() {
        let (sink, _) = run(
            r#"
fn f() {
    var unused: str = "never read";
}
"#,
        );
        assert!(sink
            .iter()
            .any(|d| d.code == codes::LINEAR_NOT_CONSUMED && !d.is_error()));
    }

    #[test]
    fn test_linear_not_consumed_strict_errors() {
        let options = CompilerOptions {
            strict: true,
            ..CompilerOptions::default()
        };
        let (sink, _) = run_with(
            r#"
fn f() {
    var unused: str = "never read";
}
"#,
            options,
        );
        assert!(sink
            .iter()
            .any(|d| d.code == codes::LINEAR_NOT_CONSUMED && d.is_error()));
    }

    #[test]
    fn test_release_plan_reverse_declaration_order() {
        let (_, results) = run(
            r#"
fn f() {
    var a: str = "first";
    var b: str = "second";
    print(a);
    print(b);
}
"#,
        );
        let plan: Vec<&Vec<String>> = results
            .releases
            .values()
            .filter(|names| names.len() == 2)
            .collect();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0], &vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_moved_values_not_in_release_plan() {
        let (_, results) = run(
            r#"
fn f(): str {
    var a: str = "kept";
    return a;
}
"#,
        );
        for names in results.releases.values() {
            assert!(!names.contains(&"a".to_string()));
        }
    }

    #[test]
    fn test_error_edge_records_live_linears() {
        let (_, results) = run(
            r#"
fn parse(s: str): int? { return ok(1); }
fn f(s: str): int? {
    var held: str = "resource";
    var n: int = parse(s)?;
    print(held);
    return ok(n);
}
"#,
        );
        let edges: Vec<&Vec<String>> = results.error_releases.values().collect();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0], &vec!["held".to_string()]);
    }

    #[test]
    fn test_task_capture_cannot_consume() {
        assert_memory_error(
            r#"
fn f() {
    var shared: str = "outer";
    task {
        var grabbed: str = shared;
        print(grabbed);
    }
    print(shared);
}
"#,
            codes::CAPTURE_CONFLICT,
        );
    }

    #[test]
    fn test_task_capture_read_only_is_fine() {
        assert_memory_clean(
            r#"
fn f() {
    var shared: str = "outer";
    task {
        print(shared);
    }
    print(shared);
}
"#,
        );
    }

    #[test]
    fn test_iter_binding_is_ref() {
        let (_, results) = run(
            r#"
var items: [str] = ["a", "b"];
iter (x in items) { print(x); }
"#,
        );
        assert!(results
            .ownership
            .values()
            .any(|o| *o == Ownership::Ref));
    }
}
