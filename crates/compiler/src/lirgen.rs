//! LIR generator for Limit
//!
//! Lowers type-checked modules into register LIR. Each source function
//! (top-level, method, init, nested closure) becomes one `LirFunction`
//! with a dense virtual register numbering, parameters first. Top-level
//! script statements across all modules collect, in dependency order,
//! into the entry function `main`.
//!
//! Conventions:
//!
//! - Symbols are module-qualified: `m::f`, `m::Class::method`. The
//!   entry function is plain `main`.
//! - A conditional block ends with the JumpIfFalse/Jump pair, so block
//!   layout order never matters.
//! - A value of type `T?E` travels in one Ptr register; `IsError` and
//!   `UnwrapValue`/`UnwrapError` materialize the tag and payload
//!   registers at each use site.
//! - Module-level variables live in the VM's global table, reached
//!   through the `global.get` / `global.set` builtins.
//! - The memory checker's release plans become `ReleaseLocal` runs at
//!   region exits and on every early-return and `?` edge, bracketed by
//!   `RegionEnter` / `RegionExit`.

use crate::ast::*;
use crate::memory::MemoryResults;
use crate::modules::ModuleRegistry;
use crate::typecheck::{CallRef, MemberRef, NameRef, TypeCheckResults};
use crate::types::{ClassId, MemberKind, TypeId, TypeKind, TypeTable};
use limit_core::lir::{
    AbiType, Block as LirBlock, ClassLayout, ConstValue, Inst, LirFunction, LirModule, Op, Reg,
};
use std::collections::HashMap;

/// Field default expressions per class, pulled from the AST and
/// evaluated at each construction site
struct ClassMeta<'a> {
    defaults: Vec<(usize, &'a Expr)>,
}

pub struct LirGenerator<'a> {
    types: &'a TypeTable,
    registry: &'a ModuleRegistry,
    check: &'a TypeCheckResults,
    memory: &'a MemoryResults,
    layouts: Vec<ClassLayout>,
    meta: HashMap<ClassId, ClassMeta<'a>>,
    functions: Vec<LirFunction>,
}

pub fn generate(
    modules: &[Module],
    types: &TypeTable,
    registry: &ModuleRegistry,
    check: &TypeCheckResults,
    memory: &MemoryResults,
) -> LirModule {
    let mut generator = LirGenerator {
        types,
        registry,
        check,
        memory,
        layouts: Vec::new(),
        meta: HashMap::new(),
        functions: Vec::new(),
    };
    generator.build_layouts();
    generator.collect_class_meta(modules);
    generator.lower_modules(modules);
    LirModule {
        functions: generator.functions,
        classes: generator.layouts,
    }
}

impl<'a> LirGenerator<'a> {
    // ----- class layouts -----

    fn build_layouts(&mut self) {
        for index in 0..self.types.class_count() {
            let id = ClassId(index as u32);
            let layout = ClassLayout {
                name: self.types.class(id).name.clone(),
                parent: self.types.class(id).superclass.map(|p| p.0),
                field_names: self.flatten_fields(id),
                vtable: self.build_vtable(id),
            };
            self.layouts.push(layout);
        }
    }

    /// Field slots in declaration order, inherited first
    fn flatten_fields(&self, class: ClassId) -> Vec<String> {
        let info = self.types.class(class);
        let mut fields = match info.superclass {
            Some(parent) => self.flatten_fields(parent),
            None => Vec::new(),
        };
        for member in &info.members {
            if member.kind == MemberKind::Field {
                fields.push(member.name.clone());
            }
        }
        fields
    }

    /// Method table with overrides applied; keys stay in first-seen
    /// order so dispatch ids are stable down the hierarchy
    fn build_vtable(&self, class: ClassId) -> Vec<(String, String)> {
        let info = self.types.class(class);
        let mut vtable = match info.superclass {
            Some(parent) => self.build_vtable(parent),
            None => Vec::new(),
        };
        for member in &info.members {
            if member.kind != MemberKind::Method || member.is_abstract {
                continue;
            }
            let symbol = method_symbol(&info.module, &info.name, &member.name);
            match vtable.iter_mut().find(|(name, _)| name == &member.name) {
                Some(entry) => entry.1 = symbol,
                None => vtable.push((member.name.clone(), symbol)),
            }
        }
        vtable
    }

    fn collect_class_meta(&mut self, modules: &'a [Module]) {
        for module in modules {
            for item in &module.items {
                let ItemKind::Class(decl) = &item.kind else {
                    continue;
                };
                let Some(class_id) = self.types.lookup_class(&module.name, &decl.name) else {
                    continue;
                };
                let layout = &self.layouts[class_id.0 as usize];
                let mut defaults = Vec::new();
                for member in &decl.members {
                    if let ClassMemberKind::Field(field) = &member.kind
                        && let (Some(expr), Some(index)) =
                            (&field.init, layout.field_index(&field.name))
                    {
                        defaults.push((index, expr));
                    }
                }
                self.meta.insert(class_id, ClassMeta { defaults });
            }
        }
    }

    // ----- function emission -----

    fn lower_modules(&mut self, modules: &'a [Module]) {
        for module in modules {
            for item in &module.items {
                match &item.kind {
                    ItemKind::Fn(decl) => {
                        let symbol = fn_symbol(&module.name, &decl.name);
                        let function = self.lower_function(symbol, decl, None, &[], &module.name);
                        self.functions.push(function);
                    }
                    ItemKind::Class(decl) => self.lower_class(module, decl),
                    _ => {}
                }
            }
        }
        // The entry function: every module's script statements, in
        // dependency order
        let script = self.lower_script(modules);
        self.functions.push(script);
    }

    fn lower_class(&mut self, module: &'a Module, decl: &'a ClassDecl) {
        let Some(class_id) = self.types.lookup_class(&module.name, &decl.name) else {
            return;
        };
        for member in &decl.members {
            match &member.kind {
                ClassMemberKind::Method(method) | ClassMemberKind::Init(method) => {
                    let symbol = method_symbol(&module.name, &decl.name, &method.name);
                    let function =
                        self.lower_function(symbol, method, Some(class_id), &[], &module.name);
                    self.functions.push(function);
                }
                _ => {}
            }
        }
    }

    fn lower_script(&mut self, modules: &'a [Module]) -> LirFunction {
        let mut lowerer = FnLowerer::new(self, "main".to_string(), AbiType::Void, false);
        lowerer.push_scope();
        lowerer.emit(Inst::new(Op::RegionEnter, AbiType::Void));
        for module in modules {
            lowerer.module = module.name.clone();
            for item in &module.items {
                match &item.kind {
                    ItemKind::Var(decl) => {
                        let value = match &decl.init {
                            Some(init) => lowerer.lower_expr(init),
                            None => Some(lowerer.load_const(ConstValue::Null, AbiType::Ptr)),
                        };
                        if let Some(value) = value {
                            lowerer.emit(
                                Inst::new(Op::CallBuiltin, AbiType::Void)
                                    .callee("global.set")
                                    .args(vec![value])
                                    .konst(ConstValue::Str(global_symbol(
                                        &module.name,
                                        &decl.name,
                                    ))),
                            );
                        }
                    }
                    ItemKind::Stmt(stmt) => lowerer.lower_stmt(stmt),
                    _ => {}
                }
            }
        }
        if !lowerer.terminated() {
            lowerer.emit(Inst::new(Op::RegionExit, AbiType::Void));
            lowerer.emit(Inst::new(Op::Ret, AbiType::Void));
        }
        lowerer.finish()
    }

    fn lower_function(
        &mut self,
        symbol: String,
        decl: &'a FnDecl,
        class: Option<ClassId>,
        captures: &[String],
        module: &str,
    ) -> LirFunction {
        // Parameter ABI types come from the declared signature
        let fn_ty = self.signature_of(decl, class, module);
        let (param_types, result_abi) = match fn_ty.map(|ty| self.types.kind(ty).clone()) {
            Some(TypeKind::Function {
                params,
                result,
                error,
            }) => {
                let result_abi = if error.is_some() {
                    AbiType::Ptr
                } else {
                    self.abi_of_type(result)
                };
                (
                    params.iter().map(|(ty, _)| self.abi_of_type(*ty)).collect(),
                    result_abi,
                )
            }
            _ => (
                decl.params.iter().map(|_| AbiType::Ptr).collect::<Vec<_>>(),
                AbiType::Ptr,
            ),
        };

        let mut lowerer = FnLowerer::new(self, symbol, result_abi, class.is_some());
        lowerer.module = module.to_string();
        lowerer.push_scope();
        if class.is_some() {
            let self_reg = lowerer.fresh(AbiType::Ptr);
            lowerer.params.push((self_reg, AbiType::Ptr));
            lowerer.bind("self", self_reg);
        }
        for capture in captures {
            let reg = lowerer.fresh(AbiType::Ptr);
            lowerer.params.push((reg, AbiType::Ptr));
            lowerer.bind(capture, reg);
        }
        for (param, abi) in decl.params.iter().zip(param_types.into_iter()) {
            let reg = lowerer.fresh(abi);
            lowerer.params.push((reg, abi));
            lowerer.bind(&param.name, reg);
        }

        lowerer.emit(Inst::new(Op::RegionEnter, AbiType::Void));
        lowerer.region_blocks.push(decl.body.id);
        for stmt in &decl.body.stmts {
            lowerer.lower_stmt(stmt);
        }
        lowerer.region_blocks.pop();
        if !lowerer.terminated() {
            lowerer.emit_releases(decl.body.id, None);
            lowerer.emit(Inst::new(Op::RegionExit, AbiType::Void));
            if result_abi == AbiType::Void {
                lowerer.emit(Inst::new(Op::Ret, AbiType::Void));
            } else {
                // Unreachable when the checker verified returns; keeps
                // the CFG well formed regardless
                let fallback = lowerer.load_const(ConstValue::Null, result_abi);
                lowerer.emit(Inst::new(Op::Return, result_abi).src1(fallback));
            }
        }
        lowerer.finish()
    }

    fn signature_of(
        &self,
        decl: &FnDecl,
        class: Option<ClassId>,
        module: &str,
    ) -> Option<TypeId> {
        match class {
            Some(class_id) => self
                .types
                .find_member(class_id, &decl.name)
                .map(|(member, _)| member.ty),
            None => self
                .registry
                .binding(module, &decl.name)
                .map(|binding| binding.ty),
        }
    }

    fn abi_of_type(&self, ty: TypeId) -> AbiType {
        match self.types.kind(self.types.resolve_alias(ty)) {
            TypeKind::I32 | TypeKind::U32 => AbiType::I32,
            TypeKind::I64 | TypeKind::U64 | TypeKind::Enum(_) => AbiType::I64,
            TypeKind::F32 | TypeKind::F64 => AbiType::F64,
            TypeKind::Bool => AbiType::Bool,
            TypeKind::Void => AbiType::Void,
            _ => AbiType::Ptr,
        }
    }
}

fn fn_symbol(module: &str, name: &str) -> String {
    format!("{}::{}", module, name)
}

fn method_symbol(module: &str, class: &str, method: &str) -> String {
    format!("{}::{}::{}", module, class, method)
}

fn global_symbol(module: &str, name: &str) -> String {
    format!("{}::{}", module, name)
}

// =========================================================================
// Per-function lowering
// =========================================================================

struct BlockBuilder {
    label: String,
    insts: Vec<Inst>,
    successors: Vec<u32>,
}

struct LoopCtx {
    continue_to: u32,
    break_to: u32,
}

struct RecoverCtx {
    join_reg: Option<Reg>,
    join_block: u32,
    /// Handler block's region, released on the yield path
    handler_region: NodeId,
}

struct FnLowerer<'g, 'a> {
    generator: &'g mut LirGenerator<'a>,
    name: String,
    /// Module the lowered code lives in, for symbol lookups
    module: String,
    params: Vec<(Reg, AbiType)>,
    result_abi: AbiType,
    is_method: bool,
    reg_types: Vec<AbiType>,
    blocks: Vec<BlockBuilder>,
    current: u32,
    scopes: Vec<Vec<(String, Reg)>>,
    loops: Vec<LoopCtx>,
    recovers: Vec<RecoverCtx>,
    /// Block node-ids of the regions currently open, outermost first
    region_blocks: Vec<NodeId>,
    closure_counter: u32,
}

impl<'g, 'a> FnLowerer<'g, 'a> {
    fn new(
        generator: &'g mut LirGenerator<'a>,
        name: String,
        result_abi: AbiType,
        is_method: bool,
    ) -> Self {
        FnLowerer {
            generator,
            name,
            module: String::new(),
            params: Vec::new(),
            result_abi,
            is_method,
            reg_types: Vec::new(),
            blocks: vec![BlockBuilder {
                label: "entry".to_string(),
                insts: Vec::new(),
                successors: Vec::new(),
            }],
            current: 0,
            scopes: Vec::new(),
            loops: Vec::new(),
            recovers: Vec::new(),
            region_blocks: Vec::new(),
            closure_counter: 0,
        }
    }

    // ----- infrastructure -----

    fn fresh(&mut self, abi: AbiType) -> Reg {
        let reg = Reg(self.reg_types.len() as u16);
        self.reg_types.push(abi);
        reg
    }

    fn emit(&mut self, inst: Inst) {
        self.blocks[self.current as usize].insts.push(inst);
    }

    fn new_block(&mut self, label: &str) -> u32 {
        let id = self.blocks.len() as u32;
        self.blocks.push(BlockBuilder {
            label: format!("{}{}", label, id),
            insts: Vec::new(),
            successors: Vec::new(),
        });
        id
    }

    fn switch(&mut self, block: u32) {
        self.current = block;
    }

    fn terminated(&self) -> bool {
        self.blocks[self.current as usize]
            .insts
            .last()
            .is_some_and(|inst| inst.op.is_terminator())
    }

    /// End the current block with the JumpIfFalse/Jump pair
    fn branch(&mut self, cond: Reg, then_block: u32, else_block: u32) {
        self.emit(
            Inst::new(Op::JumpIfFalse, AbiType::Void)
                .src1(cond)
                .imm(else_block as i64),
        );
        self.emit(Inst::new(Op::Jump, AbiType::Void).imm(then_block as i64));
        self.blocks[self.current as usize].successors = vec![else_block, then_block];
    }

    fn jump(&mut self, target: u32) {
        self.emit(Inst::new(Op::Jump, AbiType::Void).imm(target as i64));
        self.blocks[self.current as usize].successors = vec![target];
    }

    fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn bind(&mut self, name: &str, reg: Reg) {
        self.scopes
            .last_mut()
            .expect("bind outside any scope")
            .push((name.to_string(), reg));
    }

    fn lookup(&self, name: &str) -> Option<Reg> {
        for scope in self.scopes.iter().rev() {
            if let Some((_, reg)) = scope.iter().rev().find(|(n, _)| n == name) {
                return Some(*reg);
            }
        }
        None
    }

    fn load_const(&mut self, value: ConstValue, abi: AbiType) -> Reg {
        let dst = self.fresh(abi);
        self.emit(Inst::new(Op::LoadConst, abi).dst(dst).konst(value));
        dst
    }

    fn abi(&self, node: NodeId) -> AbiType {
        self.generator
            .check
            .type_of(node)
            .map(|ty| self.generator.abi_of_type(ty))
            .unwrap_or(AbiType::Ptr)
    }

    /// ReleaseLocal run for one region's plan; `keep` names a binding
    /// whose ownership just moved out (it is being returned)
    fn emit_releases(&mut self, block: NodeId, keep: Option<&str>) {
        let Some(names) = self.generator.memory.releases.get(&block) else {
            return;
        };
        for name in names.clone() {
            if keep == Some(name.as_str()) {
                continue;
            }
            if let Some(reg) = self.lookup(&name) {
                self.emit(Inst::new(Op::ReleaseLocal, AbiType::Void).src1(reg));
            }
        }
    }

    fn finish(self) -> LirFunction {
        let result_abi = self.result_abi;
        let mut reg_types = self.reg_types;
        let mut insts = Vec::new();
        let mut blocks = Vec::new();
        for (index, mut builder) in self.blocks.into_iter().enumerate() {
            // Every block needs a terminator, even unreachable joins;
            // non-void functions return a null constant there so the
            // CFG validator's fall-off-the-end rule holds
            if !builder
                .insts
                .last()
                .is_some_and(|inst| inst.op.is_terminator())
            {
                if result_abi == AbiType::Void {
                    builder.insts.push(Inst::new(Op::Ret, AbiType::Void));
                } else {
                    let reg = Reg(reg_types.len() as u16);
                    reg_types.push(result_abi);
                    builder.insts.push(
                        Inst::new(Op::LoadConst, result_abi)
                            .dst(reg)
                            .konst(ConstValue::Null),
                    );
                    builder
                        .insts
                        .push(Inst::new(Op::Return, result_abi).src1(reg));
                }
            }
            let start = insts.len();
            let is_exit = builder.insts.last().is_some_and(|inst| {
                matches!(inst.op, Op::Return | Op::Ret | Op::PropagateError)
            });
            insts.extend(builder.insts);
            blocks.push(LirBlock {
                id: index as u32,
                label: builder.label,
                range: (start, insts.len()),
                is_entry: index == 0,
                is_exit,
                successors: builder.successors,
            });
        }
        LirFunction {
            name: self.name,
            params: self.params,
            result: result_abi,
            reg_types,
            insts,
            blocks,
        }
    }

    // ----- statements -----

    fn lower_stmt(&mut self, stmt: &'a Stmt) {
        if self.terminated() {
            // Unreachable code after return/break; skip quietly, the
            // checker already had its say
            return;
        }
        match &stmt.kind {
            StmtKind::Var(decl) => {
                let abi = self
                    .generator
                    .check
                    .binding_types
                    .get(&stmt.id)
                    .map(|ty| self.generator.abi_of_type(*ty))
                    .unwrap_or(AbiType::Ptr);
                let value = match &decl.init {
                    Some(init) => self.lower_expr_expect(init),
                    None => self.load_const(ConstValue::Null, abi),
                };
                let dst = self.fresh(abi);
                self.emit(Inst::new(Op::Mov, abi).dst(dst).src1(value));
                self.bind(&decl.name, dst);
            }
            StmtKind::Fn(decl) => self.lower_nested_fn(decl),
            StmtKind::Expr(expr) => {
                self.lower_expr(expr);
            }
            StmtKind::Block(block) => self.lower_block(block),
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let cond_reg = self.lower_expr_expect(cond);
                let then_id = self.new_block("then");
                let join_id = self.new_block("join");
                let else_id = match else_block {
                    Some(_) => self.new_block("else"),
                    None => join_id,
                };
                self.branch(cond_reg, then_id, else_id);

                self.switch(then_id);
                self.lower_block(then_block);
                if !self.terminated() {
                    self.jump(join_id);
                }
                if let Some(else_stmt) = else_block {
                    self.switch(else_id);
                    self.lower_stmt(else_stmt);
                    if !self.terminated() {
                        self.jump(join_id);
                    }
                }
                self.switch(join_id);
            }
            StmtKind::While { cond, body } => {
                let header = self.new_block("while_header");
                let body_id = self.new_block("while_body");
                let exit = self.new_block("while_exit");
                self.jump(header);

                self.switch(header);
                let cond_reg = self.lower_expr_expect(cond);
                self.branch(cond_reg, body_id, exit);

                self.loops.push(LoopCtx {
                    continue_to: header,
                    break_to: exit,
                });
                self.switch(body_id);
                self.lower_block(body);
                if !self.terminated() {
                    self.jump(header);
                }
                self.loops.pop();
                self.switch(exit);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.push_scope();
                if let Some(init) = init {
                    self.lower_stmt(init);
                }
                let header = self.new_block("for_header");
                let body_id = self.new_block("for_body");
                let step_id = self.new_block("for_step");
                let exit = self.new_block("for_exit");
                self.jump(header);

                self.switch(header);
                match cond {
                    Some(cond) => {
                        let cond_reg = self.lower_expr_expect(cond);
                        self.branch(cond_reg, body_id, exit);
                    }
                    None => self.jump(body_id),
                }

                self.loops.push(LoopCtx {
                    continue_to: step_id,
                    break_to: exit,
                });
                self.switch(body_id);
                self.lower_block(body);
                if !self.terminated() {
                    self.jump(step_id);
                }
                self.loops.pop();

                self.switch(step_id);
                if let Some(step) = step {
                    self.lower_expr(step);
                }
                self.jump(header);

                self.switch(exit);
                self.pop_scope();
            }
            StmtKind::Iter {
                binding,
                iterable,
                body,
            } => {
                let source = self.lower_expr_expect(iterable);
                let len = self.fresh(AbiType::I64);
                self.emit(
                    Inst::new(Op::CallBuiltin, AbiType::I64)
                        .dst(len)
                        .callee("len")
                        .args(vec![source]),
                );
                let index = self.load_const(ConstValue::Int(0), AbiType::I64);

                let header = self.new_block("iter_header");
                let body_id = self.new_block("iter_body");
                let step_id = self.new_block("iter_step");
                let exit = self.new_block("iter_exit");
                self.jump(header);

                self.switch(header);
                let in_range = self.fresh(AbiType::Bool);
                self.emit(
                    Inst::new(Op::CmpLt, AbiType::Bool)
                        .dst(in_range)
                        .src1(index)
                        .src2(len),
                );
                self.branch(in_range, body_id, exit);

                self.loops.push(LoopCtx {
                    continue_to: step_id,
                    break_to: exit,
                });
                self.switch(body_id);
                self.push_scope();
                let element_abi = element_abi(self.generator, iterable.id);
                let element = self.fresh(element_abi);
                self.emit(
                    Inst::new(Op::CallBuiltin, element_abi)
                        .dst(element)
                        .callee("iter.get")
                        .args(vec![source, index]),
                );
                self.bind(binding, element);
                self.lower_block(body);
                self.pop_scope();
                if !self.terminated() {
                    self.jump(step_id);
                }
                self.loops.pop();

                self.switch(step_id);
                let one = self.load_const(ConstValue::Int(1), AbiType::I64);
                self.emit(
                    Inst::new(Op::Add, AbiType::I64)
                        .dst(index)
                        .src1(index)
                        .src2(one),
                );
                self.jump(header);

                self.switch(exit);
            }
            StmtKind::Loop { body } => {
                let header = self.new_block("loop_header");
                let exit = self.new_block("loop_exit");
                self.jump(header);

                self.loops.push(LoopCtx {
                    continue_to: header,
                    break_to: exit,
                });
                self.switch(header);
                self.lower_block(body);
                if !self.terminated() {
                    self.jump(header);
                }
                self.loops.pop();
                self.switch(exit);
            }
            StmtKind::Return(value) => self.lower_return(value.as_ref()),
            StmtKind::Break => {
                if let Some(ctx) = self.loops.last() {
                    let target = ctx.break_to;
                    self.exit_innermost_region();
                    self.jump(target);
                }
            }
            StmtKind::Continue => {
                if let Some(ctx) = self.loops.last() {
                    let target = ctx.continue_to;
                    self.exit_innermost_region();
                    self.jump(target);
                }
            }
            StmtKind::Parallel(block) | StmtKind::Concurrent(block) | StmtKind::Task(block) => {
                // The core runs tasks inline; the hooks bracket the
                // block so an external scheduler can take over
                let context = self.fresh(AbiType::Ptr);
                self.emit(Inst::new(Op::TaskContextAlloc, AbiType::Ptr).dst(context));
                self.emit(Inst::new(Op::TaskContextInit, AbiType::Void).src1(context));
                self.lower_block(block);
                self.emit(Inst::new(Op::SchedulerRun, AbiType::Void).src1(context));
            }
        }
    }

    /// Cleanup for the innermost open region, on break/continue edges
    fn exit_innermost_region(&mut self) {
        if let Some(block) = self.region_blocks.last().copied() {
            self.emit_releases(block, None);
            self.emit(Inst::new(Op::RegionExit, AbiType::Void));
        }
    }

    fn lower_block(&mut self, block: &'a Block) {
        self.push_scope();
        self.region_blocks.push(block.id);
        self.emit(Inst::new(Op::RegionEnter, AbiType::Void));
        for stmt in &block.stmts {
            self.lower_stmt(stmt);
        }
        if !self.terminated() {
            self.emit_releases(block.id, None);
            self.emit(Inst::new(Op::RegionExit, AbiType::Void));
        }
        self.region_blocks.pop();
        self.pop_scope();
    }

    fn lower_return(&mut self, value: Option<&'a Expr>) {
        // `return` inside a `? else` handler yields the fallback value
        if let Some(ctx) = self.recovers.last() {
            let join_reg = ctx.join_reg;
            let join_block = ctx.join_block;
            let handler_region = ctx.handler_region;
            if let Some(expr) = value {
                let result = self.lower_expr_expect(expr);
                if let Some(join_reg) = join_reg {
                    let abi = self.reg_types[join_reg.0 as usize];
                    self.emit(Inst::new(Op::Mov, abi).dst(join_reg).src1(result));
                }
            }
            self.emit_releases(handler_region, None);
            self.emit(Inst::new(Op::RegionExit, AbiType::Void));
            self.jump(join_block);
            return;
        }

        let result = value.map(|expr| self.lower_expr_expect(expr));
        // Region cleanup on the early-return edge, innermost first
        let kept = value.and_then(|expr| match &expr.kind {
            ExprKind::Name(name) => Some(name.clone()),
            _ => None,
        });
        for block in self.region_blocks.clone().iter().rev() {
            self.emit_releases(*block, kept.as_deref());
            self.emit(Inst::new(Op::RegionExit, AbiType::Void));
        }
        match result {
            Some(reg) => {
                let abi = self.reg_types[reg.0 as usize];
                self.emit(Inst::new(Op::Return, abi).src1(reg));
            }
            None => self.emit(Inst::new(Op::Ret, AbiType::Void)),
        }
    }

    fn lower_nested_fn(&mut self, decl: &'a FnDecl) {
        // Lift to a top-level function taking the captured values as
        // leading parameters; the closure value pairs the symbol with
        // the captured registers
        let captures = free_variables(decl, self);
        self.closure_counter += 1;
        let symbol = format!("{}::{}#{}", self.name, decl.name, self.closure_counter);
        let module = self.module.clone();
        let lifted = self
            .generator
            .lower_function(symbol.clone(), decl, None, &captures, &module);
        self.generator.functions.push(lifted);

        let capture_regs: Vec<Reg> = captures
            .iter()
            .filter_map(|name| self.lookup(name))
            .collect();
        let closure = self.fresh(AbiType::Ptr);
        self.emit(
            Inst::new(Op::MakeClosure, AbiType::Ptr)
                .dst(closure)
                .callee(symbol)
                .args(capture_regs),
        );
        self.bind(&decl.name, closure);
    }

    // ----- expressions -----

    fn lower_expr_expect(&mut self, expr: &'a Expr) -> Reg {
        self.lower_expr(expr)
            .unwrap_or_else(|| self.load_const(ConstValue::Null, AbiType::Ptr))
    }

    /// Returns None for void-valued expressions
    fn lower_expr(&mut self, expr: &'a Expr) -> Option<Reg> {
        match &expr.kind {
            ExprKind::Nil => Some(self.load_const(ConstValue::Null, AbiType::Ptr)),
            ExprKind::Bool(value) => {
                Some(self.load_const(ConstValue::Bool(*value), AbiType::Bool))
            }
            ExprKind::Int(value) => Some(self.load_const(ConstValue::Int(*value), AbiType::I64)),
            ExprKind::Float(value) => {
                Some(self.load_const(ConstValue::Float(*value), AbiType::F64))
            }
            ExprKind::Str(value) => {
                Some(self.load_const(ConstValue::Str(value.clone()), AbiType::Ptr))
            }
            ExprKind::Interp(parts) => Some(self.lower_interp(parts)),
            ExprKind::Name(name) => self.lower_name(expr, name),
            ExprKind::SelfRef => self.lookup("self"),
            ExprKind::SuperCall { args, .. } => self.lower_super_call(expr, args),
            ExprKind::Member { obj, .. } => self.lower_member(expr, obj),
            ExprKind::Index { obj, index } => {
                let obj_reg = self.lower_expr(obj)?;
                let index_reg = self.lower_expr(index)?;
                let abi = self.abi(expr.id);
                let dst = self.fresh(abi);
                self.emit(
                    Inst::new(Op::CallBuiltin, abi)
                        .dst(dst)
                        .callee("index.get")
                        .args(vec![obj_reg, index_reg]),
                );
                Some(dst)
            }
            ExprKind::Call { callee, args } => self.lower_call(expr, callee, args),
            ExprKind::Unary { op, operand } => {
                let operand_reg = self.lower_expr(operand)?;
                let abi = self.abi(expr.id);
                let dst = self.fresh(abi);
                let op = match op {
                    UnaryOp::Neg => Op::Neg,
                    UnaryOp::Not => Op::Not,
                };
                self.emit(Inst::new(op, abi).dst(dst).src1(operand_reg));
                Some(dst)
            }
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(expr, *op, lhs, rhs),
            ExprKind::Assign { op, target, value } => {
                self.lower_assign(*op, target, value);
                None
            }
            ExprKind::Ok(payload) => {
                let payload_reg = match payload {
                    Some(inner) => self.lower_expr_expect(inner),
                    None => self.load_const(ConstValue::Null, AbiType::Ptr),
                };
                let dst = self.fresh(AbiType::Ptr);
                self.emit(
                    Inst::new(Op::ConstructOk, AbiType::Ptr)
                        .dst(dst)
                        .src1(payload_reg),
                );
                Some(dst)
            }
            ExprKind::Err(payload) => {
                let payload_reg = match payload {
                    Some(inner) => self.lower_expr_expect(inner),
                    None => self.load_const(ConstValue::Null, AbiType::Ptr),
                };
                let dst = self.fresh(AbiType::Ptr);
                self.emit(
                    Inst::new(Op::ConstructErr, AbiType::Ptr)
                        .dst(dst)
                        .src1(payload_reg),
                );
                Some(dst)
            }
            ExprKind::Propagate(inner) => Some(self.lower_propagate(expr, inner)),
            ExprKind::Recover {
                expr: inner,
                binding,
                handler,
            } => Some(self.lower_recover(expr, inner, binding.as_deref(), handler)),
            ExprKind::Range { lo, hi } => {
                let lo_reg = self.lower_expr(lo)?;
                let hi_reg = self.lower_expr(hi)?;
                let dst = self.fresh(AbiType::Ptr);
                self.emit(
                    Inst::new(Op::CallBuiltin, AbiType::Ptr)
                        .dst(dst)
                        .callee("range.new")
                        .args(vec![lo_reg, hi_reg]),
                );
                Some(dst)
            }
            ExprKind::List(elements) => {
                let element_regs: Vec<Reg> = elements
                    .iter()
                    .map(|element| self.lower_expr_expect(element))
                    .collect();
                let dst = self.fresh(AbiType::Ptr);
                self.emit(
                    Inst::new(Op::CallBuiltin, AbiType::Ptr)
                        .dst(dst)
                        .callee("list.new")
                        .args(element_regs),
                );
                Some(dst)
            }
            ExprKind::Dict(entries) => {
                let mut regs = Vec::new();
                for (key, value) in entries {
                    regs.push(self.lower_expr_expect(key));
                    regs.push(self.lower_expr_expect(value));
                }
                let dst = self.fresh(AbiType::Ptr);
                self.emit(
                    Inst::new(Op::CallBuiltin, AbiType::Ptr)
                        .dst(dst)
                        .callee("dict.new")
                        .args(regs),
                );
                Some(dst)
            }
            ExprKind::Match(match_expr) => {
                self.lower_match(match_expr);
                None
            }
            ExprKind::Await(inner) => self.lower_expr(inner),
        }
    }

    fn lower_name(&mut self, expr: &Expr, name: &str) -> Option<Reg> {
        match self.generator.check.name_refs.get(&expr.id).cloned() {
            Some(NameRef::Local) | None => self.lookup(name).or_else(|| {
                // Script locals bound in an enclosing lowering scope
                Some(self.load_const(ConstValue::Null, AbiType::Ptr))
            }),
            Some(NameRef::ModuleVar { module, name }) => {
                let abi = self.abi(expr.id);
                let dst = self.fresh(abi);
                self.emit(
                    Inst::new(Op::CallBuiltin, abi)
                        .dst(dst)
                        .callee("global.get")
                        .konst(ConstValue::Str(global_symbol(&module, &name))),
                );
                Some(dst)
            }
            Some(NameRef::ModuleFn { module, name }) => {
                let dst = self.fresh(AbiType::Ptr);
                self.emit(
                    Inst::new(Op::MakeClosure, AbiType::Ptr)
                        .dst(dst)
                        .callee(fn_symbol(&module, &name)),
                );
                Some(dst)
            }
            Some(NameRef::EnumVariant { index, .. }) => {
                Some(self.load_const(ConstValue::Int(index as i64), AbiType::I64))
            }
            Some(NameRef::Class(_)) | Some(NameRef::Module(_)) | Some(NameRef::Builtin(_)) => {
                // Only meaningful in call/member position
                Some(self.load_const(ConstValue::Null, AbiType::Ptr))
            }
        }
    }

    fn lower_member(&mut self, expr: &Expr, obj: &'a Expr) -> Option<Reg> {
        match self.generator.check.member_refs.get(&expr.id).cloned() {
            Some(MemberRef::Field { class, name }) => {
                let obj_reg = self.lower_expr(obj)?;
                let index = self.generator.layouts[class.0 as usize]
                    .field_index(&name)
                    .unwrap_or(0);
                let abi = self.abi(expr.id);
                let dst = self.fresh(abi);
                self.emit(
                    Inst::new(Op::GetField, abi)
                        .dst(dst)
                        .src1(obj_reg)
                        .imm(index as i64),
                );
                Some(dst)
            }
            Some(MemberRef::ModuleVar { module, name }) => {
                let abi = self.abi(expr.id);
                let dst = self.fresh(abi);
                self.emit(
                    Inst::new(Op::CallBuiltin, abi)
                        .dst(dst)
                        .callee("global.get")
                        .konst(ConstValue::Str(global_symbol(&module, &name))),
                );
                Some(dst)
            }
            Some(MemberRef::ModuleFn { module, name }) => {
                let dst = self.fresh(AbiType::Ptr);
                self.emit(
                    Inst::new(Op::MakeClosure, AbiType::Ptr)
                        .dst(dst)
                        .callee(fn_symbol(&module, &name)),
                );
                Some(dst)
            }
            Some(MemberRef::Method { .. }) | None => {
                // Bare method references surface as closures over the
                // receiver when they are called; standalone they are
                // not materialized
                self.lower_expr(obj)
            }
        }
    }

    fn lower_interp(&mut self, parts: &'a [InterpPart]) -> Reg {
        // Escaped braces in the text would collide with the template's
        // hole marker; fall back to a concat chain in that case
        let template_safe = parts.iter().all(|part| match part {
            InterpPart::Text(text) => !text.contains("{}"),
            InterpPart::Expr(_) => true,
        });
        if !template_safe {
            return self.lower_interp_concat(parts);
        }

        let mut template = String::new();
        let mut args = Vec::new();
        for part in parts {
            match part {
                InterpPart::Text(text) => template.push_str(text),
                InterpPart::Expr(inner) => {
                    template.push_str("{}");
                    let reg = self.lower_expr_expect(inner);
                    args.push(reg);
                }
            }
        }
        let dst = self.fresh(AbiType::Ptr);
        self.emit(
            Inst::new(Op::StrFormat, AbiType::Ptr)
                .dst(dst)
                .konst(ConstValue::Str(template))
                .args(args),
        );
        dst
    }

    fn lower_interp_concat(&mut self, parts: &'a [InterpPart]) -> Reg {
        let mut acc = self.load_const(ConstValue::Str(String::new()), AbiType::Ptr);
        for part in parts {
            let piece = match part {
                InterpPart::Text(text) => {
                    self.load_const(ConstValue::Str(text.clone()), AbiType::Ptr)
                }
                InterpPart::Expr(inner) => {
                    let value = self.lower_expr_expect(inner);
                    let text = self.fresh(AbiType::Ptr);
                    self.emit(Inst::new(Op::ToString, AbiType::Ptr).dst(text).src1(value));
                    text
                }
            };
            let joined = self.fresh(AbiType::Ptr);
            self.emit(
                Inst::new(Op::StrConcat, AbiType::Ptr)
                    .dst(joined)
                    .src1(acc)
                    .src2(piece),
            );
            acc = joined;
        }
        acc
    }

    fn lower_call(&mut self, expr: &'a Expr, callee: &'a Expr, args: &'a [Expr]) -> Option<Reg> {
        let call_ref = self.generator.check.call_refs.get(&expr.id).cloned();
        match call_ref {
            Some(CallRef::Builtin(name)) if name == "print" => {
                for arg in args {
                    let reg = self.lower_expr_expect(arg);
                    let abi = self.abi(arg.id);
                    self.emit(Inst::new(Op::Print, abi).src1(reg).imm(1));
                }
                None
            }
            Some(CallRef::Builtin(name)) if name == "str" => {
                let arg = args.first()?;
                let reg = self.lower_expr_expect(arg);
                let dst = self.fresh(AbiType::Ptr);
                self.emit(Inst::new(Op::ToString, AbiType::Ptr).dst(dst).src1(reg));
                Some(dst)
            }
            Some(CallRef::Builtin(name)) => {
                let arg_regs: Vec<Reg> = args
                    .iter()
                    .map(|arg| self.lower_expr_expect(arg))
                    .collect();
                let abi = self.abi(expr.id);
                let dst = self.fresh(abi);
                self.emit(
                    Inst::new(Op::CallBuiltin, abi)
                        .dst(dst)
                        .callee(name)
                        .args(arg_regs),
                );
                Some(dst)
            }
            Some(CallRef::Static { module, name }) => {
                let arg_regs: Vec<Reg> = args
                    .iter()
                    .map(|arg| self.lower_expr_expect(arg))
                    .collect();
                self.emit_call(fn_symbol(&module, &name), arg_regs, expr.id)
            }
            Some(CallRef::Method {
                class,
                name,
                direct,
            }) => {
                let receiver = match &callee.kind {
                    ExprKind::Member { obj, .. } => self.lower_expr_expect(obj),
                    _ => self.lookup("self")?,
                };
                let mut arg_regs = vec![receiver];
                for arg in args {
                    arg_regs.push(self.lower_expr_expect(arg));
                }
                if direct {
                    let info = self.generator.types.class(class);
                    let symbol = method_symbol(&info.module, &info.name, &name);
                    self.emit_call(symbol, arg_regs, expr.id)
                } else {
                    let abi = self.abi(expr.id);
                    let dst = (abi != AbiType::Void).then(|| self.fresh(abi));
                    let mut inst = Inst::new(Op::CallMethod, abi)
                        .src1(receiver)
                        .callee(name)
                        .args(arg_regs);
                    if let Some(dst) = dst {
                        inst = inst.dst(dst);
                    }
                    self.emit(inst);
                    dst
                }
            }
            // SuperCall has its own ExprKind; Call never carries it
            Some(CallRef::Super { .. }) => None,
            Some(CallRef::Ctor { class, init }) => {
                Some(self.lower_ctor(class, init, args))
            }
            Some(CallRef::Indirect) | None => {
                let callee_reg = self.lower_expr_expect(callee);
                let mut arg_regs = vec![callee_reg];
                for arg in args {
                    arg_regs.push(self.lower_expr_expect(arg));
                }
                let abi = self.abi(expr.id);
                let dst = (abi != AbiType::Void).then(|| self.fresh(abi));
                let mut inst = Inst::new(Op::CallBuiltin, abi).callee("call").args(arg_regs);
                if let Some(dst) = dst {
                    inst = inst.dst(dst);
                }
                self.emit(inst);
                dst
            }
        }
    }

    fn emit_call(&mut self, symbol: String, args: Vec<Reg>, node: NodeId) -> Option<Reg> {
        let abi = self.abi(node);
        let dst = (abi != AbiType::Void).then(|| self.fresh(abi));
        let mut inst = Inst::new(Op::Call, abi).callee(symbol).args(args);
        if let Some(dst) = dst {
            inst = inst.dst(dst);
        }
        self.emit(inst);
        dst
    }

    fn lower_ctor(&mut self, class: ClassId, runs_init: bool, args: &'a [Expr]) -> Reg {
        let dst = self.fresh(AbiType::Ptr);
        self.emit(
            Inst::new(Op::NewObject, AbiType::Ptr)
                .dst(dst)
                .imm(class.0 as i64),
        );
        // Field defaults evaluate at the construction site, in
        // declaration order
        let defaults: Vec<(usize, &Expr)> = self
            .generator
            .meta
            .get(&class)
            .map(|meta| meta.defaults.clone())
            .unwrap_or_default();
        for (index, default) in defaults {
            let value = self.lower_expr_expect(default);
            let abi = self.abi(default.id);
            self.emit(
                Inst::new(Op::SetField, abi)
                    .src1(dst)
                    .src2(value)
                    .imm(index as i64),
            );
        }
        if runs_init {
            let info = self.generator.types.class(class);
            let symbol = method_symbol(&info.module, &info.name, "init");
            let mut arg_regs = vec![dst];
            for arg in args {
                arg_regs.push(self.lower_expr_expect(arg));
            }
            self.emit(Inst::new(Op::Call, AbiType::Void).callee(symbol).args(arg_regs));
        }
        dst
    }

    fn lower_super_call(&mut self, expr: &'a Expr, args: &'a [Expr]) -> Option<Reg> {
        let Some(CallRef::Super { class, name }) = self.generator.check.call_refs.get(&expr.id).cloned()
        else {
            return None;
        };
        let receiver = self.lookup("self")?;
        let info = self.generator.types.class(class);
        let symbol = method_symbol(&info.module, &info.name, &name);
        let mut arg_regs = vec![receiver];
        for arg in args {
            arg_regs.push(self.lower_expr_expect(arg));
        }
        self.emit_call(symbol, arg_regs, expr.id)
    }

    fn lower_binary(
        &mut self,
        expr: &'a Expr,
        op: BinaryOp,
        lhs: &'a Expr,
        rhs: &'a Expr,
    ) -> Option<Reg> {
        // Short-circuit forms build their own control flow
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            return Some(self.lower_logical(op, lhs, rhs));
        }

        let lhs_reg = self.lower_expr(lhs)?;
        let rhs_reg = self.lower_expr(rhs)?;
        let abi = self.abi(expr.id);

        // String concatenation rides the Add operator
        if op == BinaryOp::Add && self.is_str(lhs.id) && self.is_str(rhs.id) {
            let dst = self.fresh(AbiType::Ptr);
            self.emit(
                Inst::new(Op::StrConcat, AbiType::Ptr)
                    .dst(dst)
                    .src1(lhs_reg)
                    .src2(rhs_reg),
            );
            return Some(dst);
        }
        if op == BinaryOp::Pow {
            let dst = self.fresh(abi);
            self.emit(
                Inst::new(Op::CallBuiltin, abi)
                    .dst(dst)
                    .callee("math.pow")
                    .args(vec![lhs_reg, rhs_reg]),
            );
            return Some(dst);
        }

        let lir_op = match op {
            BinaryOp::Add => Op::Add,
            BinaryOp::Sub => Op::Sub,
            BinaryOp::Mul => Op::Mul,
            BinaryOp::Div => Op::Div,
            BinaryOp::Mod => Op::Mod,
            BinaryOp::Eq => Op::CmpEq,
            BinaryOp::Ne => Op::CmpNe,
            BinaryOp::Lt => Op::CmpLt,
            BinaryOp::Le => Op::CmpLe,
            BinaryOp::Gt => Op::CmpGt,
            BinaryOp::Ge => Op::CmpGe,
            BinaryOp::Pow | BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        };
        let dst = self.fresh(abi);
        self.emit(Inst::new(lir_op, abi).dst(dst).src1(lhs_reg).src2(rhs_reg));
        Some(dst)
    }

    fn lower_logical(&mut self, op: BinaryOp, lhs: &'a Expr, rhs: &'a Expr) -> Reg {
        let dst = self.fresh(AbiType::Bool);
        let lhs_reg = self.lower_expr_expect(lhs);
        self.emit(Inst::new(Op::Mov, AbiType::Bool).dst(dst).src1(lhs_reg));

        let rhs_block = self.new_block("logic_rhs");
        let join = self.new_block("logic_join");
        match op {
            // and: evaluate rhs only when lhs was true
            BinaryOp::And => self.branch(dst, rhs_block, join),
            // or: evaluate rhs only when lhs was false
            BinaryOp::Or => self.branch(dst, join, rhs_block),
            _ => unreachable!("lower_logical is only for and/or"),
        }

        self.switch(rhs_block);
        let rhs_reg = self.lower_expr_expect(rhs);
        self.emit(Inst::new(Op::Mov, AbiType::Bool).dst(dst).src1(rhs_reg));
        self.jump(join);

        self.switch(join);
        dst
    }

    fn lower_assign(&mut self, op: AssignOp, target: &'a Expr, value: &'a Expr) {
        let value_reg = match op {
            AssignOp::Assign => self.lower_expr_expect(value),
            AssignOp::AddAssign | AssignOp::SubAssign => {
                let current = self.lower_expr_expect(target);
                let rhs = self.lower_expr_expect(value);
                let abi = self.abi(target.id);
                if op == AssignOp::AddAssign && self.is_str(target.id) {
                    let dst = self.fresh(AbiType::Ptr);
                    self.emit(
                        Inst::new(Op::StrConcat, AbiType::Ptr)
                            .dst(dst)
                            .src1(current)
                            .src2(rhs),
                    );
                    dst
                } else {
                    let dst = self.fresh(abi);
                    let lir_op = if op == AssignOp::AddAssign {
                        Op::Add
                    } else {
                        Op::Sub
                    };
                    self.emit(Inst::new(lir_op, abi).dst(dst).src1(current).src2(rhs));
                    dst
                }
            }
        };

        match &target.kind {
            ExprKind::Name(name) => match self.generator.check.name_refs.get(&target.id).cloned() {
                Some(NameRef::ModuleVar { module, name }) => {
                    self.emit(
                        Inst::new(Op::CallBuiltin, AbiType::Void)
                            .callee("global.set")
                            .args(vec![value_reg])
                            .konst(ConstValue::Str(global_symbol(&module, &name))),
                    );
                }
                _ => {
                    if let Some(reg) = self.lookup(name) {
                        let abi = self.reg_types[reg.0 as usize];
                        self.emit(Inst::new(Op::Mov, abi).dst(reg).src1(value_reg));
                    }
                }
            },
            ExprKind::Member { obj, .. } => {
                if let Some(MemberRef::Field { class, name }) =
                    self.generator.check.member_refs.get(&target.id).cloned()
                {
                    let obj_reg = self.lower_expr_expect(obj);
                    let index = self.generator.layouts[class.0 as usize]
                        .field_index(&name)
                        .unwrap_or(0);
                    let abi = self.abi(target.id);
                    self.emit(
                        Inst::new(Op::SetField, abi)
                            .src1(obj_reg)
                            .src2(value_reg)
                            .imm(index as i64),
                    );
                }
            }
            ExprKind::Index { obj, index } => {
                let obj_reg = self.lower_expr_expect(obj);
                let index_reg = self.lower_expr_expect(index);
                self.emit(
                    Inst::new(Op::CallBuiltin, AbiType::Void)
                        .callee("index.set")
                        .args(vec![obj_reg, index_reg, value_reg]),
                );
            }
            _ => {}
        }
    }

    /// `e?`: IsError, skip over the propagation on success, release
    /// live linears and PropagateError on failure
    fn lower_propagate(&mut self, expr: &'a Expr, inner: &'a Expr) -> Reg {
        let value = self.lower_expr_expect(inner);
        let tag = self.fresh(AbiType::Bool);
        self.emit(Inst::new(Op::IsError, AbiType::Bool).dst(tag).src1(value));

        let err_block = self.new_block("propagate");
        let ok_block = self.new_block("ok");
        self.branch(tag, err_block, ok_block);

        self.switch(err_block);
        if let Some(names) = self.generator.memory.error_releases.get(&expr.id).cloned() {
            for name in names {
                if let Some(reg) = self.lookup(&name) {
                    self.emit(Inst::new(Op::ReleaseLocal, AbiType::Void).src1(reg));
                }
            }
        }
        self.emit(Inst::new(Op::PropagateError, AbiType::Void).src1(value));

        self.switch(ok_block);
        let abi = self.abi(expr.id);
        let dst = self.fresh(abi);
        self.emit(Inst::new(Op::UnwrapValue, abi).dst(dst).src1(value));
        dst
    }

    /// `e ? else err { ... }`: on failure bind the error and run the
    /// handler; its `return` yields the fallback value at the join
    fn lower_recover(
        &mut self,
        expr: &'a Expr,
        inner: &'a Expr,
        binding: Option<&str>,
        handler: &'a Block,
    ) -> Reg {
        let value = self.lower_expr_expect(inner);
        let tag = self.fresh(AbiType::Bool);
        self.emit(Inst::new(Op::IsError, AbiType::Bool).dst(tag).src1(value));

        let abi = self.abi(expr.id);
        let join_reg = self.fresh(abi);
        let handler_block = self.new_block("recover");
        let ok_block = self.new_block("ok");
        let join_block = self.new_block("join");
        self.branch(tag, handler_block, ok_block);

        self.switch(handler_block);
        self.push_scope();
        self.emit(Inst::new(Op::RegionEnter, AbiType::Void));
        if let Some(name) = binding {
            let err_reg = self.fresh(AbiType::Ptr);
            self.emit(
                Inst::new(Op::UnwrapError, AbiType::Ptr)
                    .dst(err_reg)
                    .src1(value),
            );
            self.bind(name, err_reg);
        }
        self.recovers.push(RecoverCtx {
            join_reg: Some(join_reg),
            join_block,
            handler_region: handler.id,
        });
        for stmt in &handler.stmts {
            self.lower_stmt(stmt);
        }
        self.recovers.pop();
        if !self.terminated() {
            self.emit_releases(handler.id, None);
            self.emit(Inst::new(Op::RegionExit, AbiType::Void));
            self.jump(join_block);
        }
        self.pop_scope();

        self.switch(ok_block);
        let unwrapped = self.fresh(abi);
        self.emit(Inst::new(Op::UnwrapValue, abi).dst(unwrapped).src1(value));
        self.emit(Inst::new(Op::Mov, abi).dst(join_reg).src1(unwrapped));
        self.jump(join_block);

        self.switch(join_block);
        join_reg
    }

    /// Linear sequence of tests, tie-break in source order; guards
    /// fall through to the next arm
    fn lower_match(&mut self, match_expr: &'a MatchExpr) {
        let scrutinee = self.lower_expr_expect(&match_expr.scrutinee);
        let join = self.new_block("match_join");

        for arm in &match_expr.arms {
            let body_block = self.new_block("arm");
            let next_block = self.new_block("arm_test");

            // Pattern test in the current block
            let matched = self.lower_pattern_test(&arm.pattern, scrutinee);
            self.branch(matched, body_block, next_block);

            self.switch(body_block);
            self.push_scope();
            self.bind_pattern(&arm.pattern, scrutinee);
            if let Some(guard) = &arm.guard {
                let guard_reg = self.lower_expr_expect(guard);
                let guard_body = self.new_block("arm_guarded");
                self.branch(guard_reg, guard_body, next_block);
                self.switch(guard_body);
            }
            match &arm.body {
                ArmBody::Expr(expr) => {
                    self.lower_expr(expr);
                }
                ArmBody::Block(block) => self.lower_block(block),
            }
            if !self.terminated() {
                self.jump(join);
            }
            self.pop_scope();

            self.switch(next_block);
        }
        // No arm matched: fall to the join (the checker proved this
        // unreachable for exhaustive matches)
        if !self.terminated() {
            self.jump(join);
        }
        self.switch(join);
    }

    fn lower_pattern_test(&mut self, pattern: &'a Pattern, scrutinee: Reg) -> Reg {
        match &pattern.kind {
            PatternKind::Wildcard | PatternKind::Binding(_) => {
                self.load_const(ConstValue::Bool(true), AbiType::Bool)
            }
            PatternKind::Variant { name, .. } if name == "Ok" => {
                let dst = self.fresh(AbiType::Bool);
                self.emit(
                    Inst::new(Op::IsSuccess, AbiType::Bool)
                        .dst(dst)
                        .src1(scrutinee),
                );
                dst
            }
            PatternKind::Variant { name, .. } if name == "Err" => {
                let dst = self.fresh(AbiType::Bool);
                self.emit(
                    Inst::new(Op::IsError, AbiType::Bool)
                        .dst(dst)
                        .src1(scrutinee),
                );
                dst
            }
            PatternKind::Variant { name, .. } => {
                // Enum variant: tag comparison. Class variant: dynamic
                // instance test.
                if let Some(enum_id) = self.generator.types.enum_of_variant(name) {
                    let index = self
                        .generator
                        .types
                        .enum_info(enum_id)
                        .variants
                        .iter()
                        .position(|v| v == name)
                        .unwrap_or(0);
                    let tag = self.load_const(ConstValue::Int(index as i64), AbiType::I64);
                    let dst = self.fresh(AbiType::Bool);
                    self.emit(
                        Inst::new(Op::CmpEq, AbiType::Bool)
                            .dst(dst)
                            .src1(scrutinee)
                            .src2(tag),
                    );
                    dst
                } else if let Some(class_id) = self.generator.types.find_class_named(name) {
                    let dst = self.fresh(AbiType::Bool);
                    self.emit(
                        Inst::new(Op::CallBuiltin, AbiType::Bool)
                            .dst(dst)
                            .callee("instance.of")
                            .args(vec![scrutinee])
                            .imm(class_id.0 as i64),
                    );
                    dst
                } else {
                    self.load_const(ConstValue::Bool(false), AbiType::Bool)
                }
            }
            PatternKind::Int(value) => {
                let konst = self.load_const(ConstValue::Int(*value), AbiType::I64);
                let dst = self.fresh(AbiType::Bool);
                self.emit(
                    Inst::new(Op::CmpEq, AbiType::Bool)
                        .dst(dst)
                        .src1(scrutinee)
                        .src2(konst),
                );
                dst
            }
            PatternKind::Str(value) => {
                let konst = self.load_const(ConstValue::Str(value.clone()), AbiType::Ptr);
                let dst = self.fresh(AbiType::Bool);
                self.emit(
                    Inst::new(Op::CmpEq, AbiType::Bool)
                        .dst(dst)
                        .src1(scrutinee)
                        .src2(konst),
                );
                dst
            }
            PatternKind::Bool(value) => {
                let konst = self.load_const(ConstValue::Bool(*value), AbiType::Bool);
                let dst = self.fresh(AbiType::Bool);
                self.emit(
                    Inst::new(Op::CmpEq, AbiType::Bool)
                        .dst(dst)
                        .src1(scrutinee)
                        .src2(konst),
                );
                dst
            }
        }
    }

    fn bind_pattern(&mut self, pattern: &'a Pattern, scrutinee: Reg) {
        match &pattern.kind {
            PatternKind::Binding(name) => self.bind(name, scrutinee),
            PatternKind::Variant { name, bindings } => {
                if let Some(binding) = bindings.first() {
                    let op = if name == "Err" {
                        Op::UnwrapError
                    } else {
                        Op::UnwrapValue
                    };
                    let dst = self.fresh(AbiType::Ptr);
                    self.emit(Inst::new(op, AbiType::Ptr).dst(dst).src1(scrutinee));
                    self.bind(binding, dst);
                }
            }
            _ => {}
        }
    }

    fn is_str(&self, node: NodeId) -> bool {
        self.generator
            .check
            .type_of(node)
            .map(|ty| {
                matches!(
                    self.generator.types.kind(self.generator.types.resolve_alias(ty)),
                    TypeKind::Str
                )
            })
            .unwrap_or(false)
    }
}

fn element_abi(generator: &LirGenerator, iterable: NodeId) -> AbiType {
    let Some(ty) = generator.check.type_of(iterable) else {
        return AbiType::Ptr;
    };
    match generator.types.kind(generator.types.resolve_alias(ty)) {
        TypeKind::List(element) | TypeKind::Range(element) => generator.abi_of_type(*element),
        TypeKind::Str => AbiType::Ptr,
        _ => AbiType::Ptr,
    }
}

/// Names used in a nested function that resolve to the enclosing
/// function's locals: the closure's captured environment
fn free_variables(decl: &FnDecl, lowerer: &FnLowerer) -> Vec<String> {
    let mut declared: Vec<String> = decl.params.iter().map(|p| p.name.clone()).collect();
    let mut used = Vec::new();
    collect_block(&decl.body, &mut declared, &mut used);
    used.retain(|name| lowerer.lookup(name).is_some());
    used.dedup();
    used
}

fn collect_block(block: &Block, declared: &mut Vec<String>, used: &mut Vec<String>) {
    let base = declared.len();
    for stmt in &block.stmts {
        collect_stmt(stmt, declared, used);
    }
    declared.truncate(base);
}

fn collect_stmt(stmt: &Stmt, declared: &mut Vec<String>, used: &mut Vec<String>) {
    match &stmt.kind {
        StmtKind::Var(decl) => {
            if let Some(init) = &decl.init {
                collect_expr(init, declared, used);
            }
            declared.push(decl.name.clone());
        }
        StmtKind::Fn(decl) => {
            declared.push(decl.name.clone());
            let mut inner_declared = declared.clone();
            inner_declared.extend(decl.params.iter().map(|p| p.name.clone()));
            collect_block(&decl.body, &mut inner_declared, used);
        }
        StmtKind::Expr(expr) => collect_expr(expr, declared, used),
        StmtKind::Block(block) => collect_block(block, declared, used),
        StmtKind::If {
            cond,
            then_block,
            else_block,
        } => {
            collect_expr(cond, declared, used);
            collect_block(then_block, declared, used);
            if let Some(else_block) = else_block {
                collect_stmt(else_block, declared, used);
            }
        }
        StmtKind::While { cond, body } => {
            collect_expr(cond, declared, used);
            collect_block(body, declared, used);
        }
        StmtKind::For {
            init,
            cond,
            step,
            body,
        } => {
            let base = declared.len();
            if let Some(init) = init {
                collect_stmt(init, declared, used);
            }
            if let Some(cond) = cond {
                collect_expr(cond, declared, used);
            }
            if let Some(step) = step {
                collect_expr(step, declared, used);
            }
            collect_block(body, declared, used);
            declared.truncate(base);
        }
        StmtKind::Iter {
            binding,
            iterable,
            body,
        } => {
            collect_expr(iterable, declared, used);
            declared.push(binding.clone());
            collect_block(body, declared, used);
            declared.pop();
        }
        StmtKind::Loop { body } => collect_block(body, declared, used),
        StmtKind::Return(value) => {
            if let Some(expr) = value {
                collect_expr(expr, declared, used);
            }
        }
        StmtKind::Break | StmtKind::Continue => {}
        StmtKind::Parallel(block) | StmtKind::Concurrent(block) | StmtKind::Task(block) => {
            collect_block(block, declared, used)
        }
    }
}

fn collect_expr(expr: &Expr, declared: &mut Vec<String>, used: &mut Vec<String>) {
    match &expr.kind {
        ExprKind::Name(name) => {
            if !declared.iter().any(|d| d == name) && !used.iter().any(|u| u == name) {
                used.push(name.clone());
            }
        }
        ExprKind::Interp(parts) => {
            for part in parts {
                if let InterpPart::Expr(inner) = part {
                    collect_expr(inner, declared, used);
                }
            }
        }
        ExprKind::Member { obj, .. } => collect_expr(obj, declared, used),
        ExprKind::Index { obj, index } => {
            collect_expr(obj, declared, used);
            collect_expr(index, declared, used);
        }
        ExprKind::Call { callee, args } => {
            collect_expr(callee, declared, used);
            for arg in args {
                collect_expr(arg, declared, used);
            }
        }
        ExprKind::SuperCall { args, .. } => {
            for arg in args {
                collect_expr(arg, declared, used);
            }
        }
        ExprKind::Unary { operand, .. } => collect_expr(operand, declared, used),
        ExprKind::Binary { lhs, rhs, .. } => {
            collect_expr(lhs, declared, used);
            collect_expr(rhs, declared, used);
        }
        ExprKind::Assign { target, value, .. } => {
            collect_expr(target, declared, used);
            collect_expr(value, declared, used);
        }
        ExprKind::Ok(payload) | ExprKind::Err(payload) => {
            if let Some(inner) = payload {
                collect_expr(inner, declared, used);
            }
        }
        ExprKind::Propagate(inner) | ExprKind::Await(inner) => {
            collect_expr(inner, declared, used)
        }
        ExprKind::Recover {
            expr: inner,
            binding,
            handler,
        } => {
            collect_expr(inner, declared, used);
            let base = declared.len();
            if let Some(name) = binding {
                declared.push(name.clone());
            }
            collect_block(handler, declared, used);
            declared.truncate(base);
        }
        ExprKind::Range { lo, hi } => {
            collect_expr(lo, declared, used);
            collect_expr(hi, declared, used);
        }
        ExprKind::List(elements) => {
            for element in elements {
                collect_expr(element, declared, used);
            }
        }
        ExprKind::Dict(entries) => {
            for (key, value) in entries {
                collect_expr(key, declared, used);
                collect_expr(value, declared, used);
            }
        }
        ExprKind::Match(match_expr) => {
            collect_expr(&match_expr.scrutinee, declared, used);
            for arm in &match_expr.arms {
                let base = declared.len();
                match &arm.pattern.kind {
                    PatternKind::Binding(name) => declared.push(name.clone()),
                    PatternKind::Variant { bindings, .. } => {
                        declared.extend(bindings.iter().cloned())
                    }
                    _ => {}
                }
                if let Some(guard) = &arm.guard {
                    collect_expr(guard, declared, used);
                }
                match &arm.body {
                    ArmBody::Expr(expr) => collect_expr(expr, declared, used),
                    ArmBody::Block(block) => collect_block(block, declared, used),
                }
                declared.truncate(base);
            }
        }
        _ => {}
    }
}
