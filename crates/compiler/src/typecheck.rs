//! Type checker for Limit
//!
//! Two passes over each module: the declaration pass collects top-level
//! types, function signatures, and class/interface shapes (so forward
//! references and mutual recursion work), then the body pass checks
//! every declaration's body.
//!
//! Every expression gets a type, stored in [`TypeCheckResults`] keyed
//! by `NodeId`, together with the resolved meaning of names, member
//! accesses, and calls. The LIR generator and the visibility checker
//! consume those side tables; the AST itself is never mutated.

use crate::ast::*;
use crate::codes;
use crate::modules::{BindingKind, ModuleBinding, ModuleRegistry};
use crate::options::CompilerOptions;
use crate::types::{
    ClassId, ClassMember, EnumId, ErrorSet, MemberKind, TypeId, TypeKind, TypeTable,
};
use limit_core::diagnostics::{Diagnostic, DiagnosticSink, Stage};
use limit_core::source::{FileId, Span};
use std::collections::HashMap;

/// Resolved meaning of a `Name` expression
#[derive(Debug, Clone, PartialEq)]
pub enum NameRef {
    Local,
    ModuleVar { module: String, name: String },
    ModuleFn { module: String, name: String },
    Class(ClassId),
    EnumVariant { enum_id: EnumId, index: u32 },
    Module(String),
    Builtin(String),
}

/// Resolved meaning of a `Member` expression
#[derive(Debug, Clone, PartialEq)]
pub enum MemberRef {
    Field { class: ClassId, name: String },
    Method { class: ClassId, name: String },
    ModuleVar { module: String, name: String },
    ModuleFn { module: String, name: String },
}

/// Resolved meaning of a `Call` expression
#[derive(Debug, Clone, PartialEq)]
pub enum CallRef {
    /// Top-level function, by declaring module
    Static { module: String, name: String },
    /// Method dispatch; `direct` when the method cannot be overridden
    Method {
        class: ClassId,
        name: String,
        direct: bool,
    },
    /// Class instantiation; `init` says whether init runs with the args
    Ctor { class: ClassId, init: bool },
    Builtin(String),
    /// Through a function-typed value (closure)
    Indirect,
    /// `super.m(...)`: statically bound to the ancestor's method
    Super { class: ClassId, name: String },
}

/// A class-member access site, recorded for the visibility checker
#[derive(Debug, Clone)]
pub struct ClassAccess {
    pub class: ClassId,
    pub member: String,
    pub from_module: String,
    pub from_class: Option<ClassId>,
    pub file: FileId,
    pub span: Span,
}

/// A module-member access site, recorded for the visibility checker
#[derive(Debug, Clone)]
pub struct ModuleAccess {
    pub module: String,
    pub name: String,
    pub from_module: String,
    pub file: FileId,
    pub span: Span,
}

#[derive(Debug, Default)]
pub struct TypeCheckResults {
    pub expr_types: HashMap<NodeId, TypeId>,
    /// Declared (or inferred) type of each `var` statement's binding
    pub binding_types: HashMap<NodeId, TypeId>,
    pub name_refs: HashMap<NodeId, NameRef>,
    pub member_refs: HashMap<NodeId, MemberRef>,
    pub call_refs: HashMap<NodeId, CallRef>,
    pub class_accesses: Vec<ClassAccess>,
    pub module_accesses: Vec<ModuleAccess>,
}

impl TypeCheckResults {
    pub fn type_of(&self, id: NodeId) -> Option<TypeId> {
        self.expr_types.get(&id).copied()
    }
}

/// What an enclosing `return` means right now
struct ReturnCtx {
    /// Full expected type of the returned value (Optional when the
    /// function is fallible; the success type inside a `? else` handler)
    expected: TypeId,
    /// Error set of the enclosing function, None when not fallible or
    /// when inside a handler
    error: Option<ErrorSet>,
}

struct Scope {
    bindings: HashMap<String, TypeId>,
}

pub struct TypeChecker<'a> {
    types: &'a mut TypeTable,
    modules: &'a mut ModuleRegistry,
    sink: &'a mut DiagnosticSink,
    options: &'a CompilerOptions,
    results: TypeCheckResults,
    scopes: Vec<Scope>,
    returns: Vec<ReturnCtx>,
    module: String,
    file: FileId,
    class: Option<ClassId>,
    /// Set inside a method body that overrides a parent method
    method_overrides: Option<String>,
}

impl<'a> TypeChecker<'a> {
    pub fn new(
        types: &'a mut TypeTable,
        modules: &'a mut ModuleRegistry,
        sink: &'a mut DiagnosticSink,
        options: &'a CompilerOptions,
    ) -> Self {
        TypeChecker {
            types,
            modules,
            sink,
            options,
            results: TypeCheckResults::default(),
            scopes: Vec::new(),
            returns: Vec::new(),
            module: String::new(),
            file: FileId(0),
            class: None,
            method_overrides: None,
        }
    }

    pub fn into_results(self) -> TypeCheckResults {
        self.results
    }

    // =====================================================================
    // Pass 1: declarations
    // =====================================================================

    /// Collect every module's top-level shapes. Call once per module,
    /// for all modules, before any `check_module`.
    pub fn declare_module(&mut self, module: &Module) {
        self.module = module.name.clone();
        self.file = module.file;
        self.modules.declare(&module.name, module.file);

        // Imports first so later resolution sees them
        for item in &module.items {
            if let ItemKind::Import(import) = &item.kind {
                let target = import.path.join(".");
                let entry = crate::modules::ImportedModule {
                    target: import.path.last().cloned().unwrap_or(target),
                    alias: import.alias.clone(),
                    filter: import.filter.clone(),
                };
                self.modules
                    .get_mut(&module.name)
                    .expect("module was just declared")
                    .imports
                    .push(entry);
            }
        }

        // Class ids before member types, so members can reference any class
        for item in &module.items {
            if let ItemKind::Class(decl) = &item.kind {
                self.types.declare_class(&module.name, &decl.name);
            }
        }
        for item in &module.items {
            match &item.kind {
                ItemKind::Enum(decl) => {
                    let enum_id =
                        self.types
                            .declare_enum(&module.name, &decl.name, decl.variants.clone());
                    let ty = self.types.intern(TypeKind::Enum(enum_id));
                    self.bind_module(&decl.name, item.vis, BindingKind::Enum(enum_id), ty);
                }
                ItemKind::TypeAlias(decl) => {
                    // `type X = A | B | C` where every arm is an unknown
                    // capitalized name declares an enum-like type
                    if let Some(variants) = self.alias_as_enum(&decl.target) {
                        let enum_id =
                            self.types.declare_enum(&module.name, &decl.name, variants);
                        let ty = self.types.intern(TypeKind::Enum(enum_id));
                        self.bind_module(&decl.name, item.vis, BindingKind::Enum(enum_id), ty);
                    } else {
                        let target = self.resolve_type(&decl.target);
                        let ty = self.types.intern(TypeKind::Alias {
                            name: decl.name.clone(),
                            target,
                        });
                        self.bind_module(&decl.name, item.vis, BindingKind::TypeAlias, ty);
                    }
                }
                _ => {}
            }
        }
        for item in &module.items {
            match &item.kind {
                ItemKind::Class(decl) => self.declare_class(decl, item.vis),
                ItemKind::Fn(decl) => {
                    let ty = self.function_type(&decl.params, decl.return_ty.as_ref(), None);
                    self.bind_module(&decl.name, item.vis, BindingKind::Fn, ty);
                }
                ItemKind::Var(decl) => {
                    let ty = match &decl.ty {
                        Some(annotation) => self.resolve_type(annotation),
                        None => self.types.any(),
                    };
                    self.bind_module(&decl.name, item.vis, BindingKind::Var, ty);
                }
                _ => {}
            }
        }
    }

    fn bind_module(&mut self, name: &str, vis: Visibility, kind: BindingKind, ty: TypeId) {
        let info = self
            .modules
            .get_mut(&self.module)
            .expect("current module is declared");
        if info.bindings.contains_key(name) {
            let module = self.module.clone();
            self.sink.push(Diagnostic::error(
                codes::DUPLICATE_DEFINITION,
                Stage::Semantic,
                format!("'{}' is defined more than once in module '{}'", name, module),
            ));
            return;
        }
        info.bindings
            .insert(name.to_string(), ModuleBinding { vis, kind, ty });
    }

    /// A union alias whose arms are all unknown capitalized names
    /// introduces those names as enum variants
    fn alias_as_enum(&self, target: &TypeExpr) -> Option<Vec<String>> {
        let arms = match &target.kind {
            TypeExprKind::Union(parts) => parts.iter().collect::<Vec<_>>(),
            _ => return None,
        };
        let mut variants = Vec::new();
        for arm in arms {
            match &arm.kind {
                TypeExprKind::Name(name)
                    if name.chars().next().is_some_and(|c| c.is_uppercase())
                        && !self.known_type_name(name) =>
                {
                    variants.push(name.clone());
                }
                _ => return None,
            }
        }
        Some(variants)
    }

    fn known_type_name(&self, name: &str) -> bool {
        self.types.lookup_class(&self.module, name).is_some()
            || self.types.find_class_named(name).is_some()
            || self.types.find_enum_named(name).is_some()
            || self.modules.binding(&self.module, name).is_some()
    }

    fn declare_class(&mut self, decl: &ClassDecl, vis: Visibility) {
        let class_id = self
            .types
            .lookup_class(&self.module, &decl.name)
            .expect("class id was pre-declared");
        let class_ty = self.types.intern(TypeKind::Class(class_id));
        self.bind_module(&decl.name, vis, BindingKind::Class(class_id), class_ty);

        // Resolve the header: first class name is the superclass,
        // interface names attach as interfaces
        for super_name in &decl.supers {
            if let Some(super_id) = self.lookup_class_in_scope(super_name) {
                if self.types.class(class_id).superclass.is_some() {
                    self.sink.push(Diagnostic::error(
                        codes::DUPLICATE_DEFINITION,
                        Stage::Semantic,
                        format!("class '{}' can have only one superclass", decl.name),
                    ));
                } else if self.types.is_subclass(super_id, class_id) {
                    self.sink.push(Diagnostic::error(
                        codes::DUPLICATE_DEFINITION,
                        Stage::Semantic,
                        format!("inheritance cycle through class '{}'", decl.name),
                    ));
                } else {
                    self.types.class_mut(class_id).superclass = Some(super_id);
                }
            } else {
                self.sink.push(
                    Diagnostic::error(
                        codes::UNDEFINED_NAME,
                        Stage::Semantic,
                        format!("undefined superclass or interface '{}'", super_name),
                    )
                    .with_hint("declare the class before subclassing it"),
                );
            }
        }

        // Member shapes
        self.class = Some(class_id);
        let mut members = Vec::new();
        let mut has_abstract = false;
        for member in &decl.members {
            let (name, kind, ty, is_abstract, has_default) = match &member.kind {
                ClassMemberKind::Field(field) => {
                    let ty = match &field.ty {
                        Some(annotation) => self.resolve_type(annotation),
                        None => self.types.any(),
                    };
                    (
                        field.name.clone(),
                        MemberKind::Field,
                        ty,
                        false,
                        field.init.is_some(),
                    )
                }
                ClassMemberKind::Method(method) => {
                    let ty =
                        self.function_type(&method.params, method.return_ty.as_ref(), Some(class_id));
                    (method.name.clone(), MemberKind::Method, ty, false, false)
                }
                ClassMemberKind::AbstractMethod {
                    name,
                    params,
                    return_ty,
                } => {
                    has_abstract = true;
                    let ty = self.function_type(params, return_ty.as_ref(), Some(class_id));
                    (name.clone(), MemberKind::Method, ty, true, false)
                }
                ClassMemberKind::Init(init) => {
                    let ty = self.function_type(&init.params, init.return_ty.as_ref(), Some(class_id));
                    (init.name.clone(), MemberKind::Init, ty, false, false)
                }
            };
            let overrides = self
                .types
                .class(class_id)
                .superclass
                .is_some_and(|parent| self.types.find_member(parent, &name).is_some());
            members.push(ClassMember {
                name,
                kind,
                ty,
                vis: member.vis,
                is_abstract,
                overrides,
                declaring: class_id,
                has_default,
            });
        }
        let info = self.types.class_mut(class_id);
        info.members = members;
        info.is_abstract = has_abstract;
        self.class = None;
    }

    fn lookup_class_in_scope(&self, name: &str) -> Option<ClassId> {
        self.types
            .lookup_class(&self.module, name)
            .or_else(|| self.types.find_class_named(name))
    }

    // =====================================================================
    // Pass 2: bodies
    // =====================================================================

    pub fn check_module(&mut self, module: &Module) {
        self.module = module.name.clone();
        self.file = module.file;

        for item in &module.items {
            match &item.kind {
                ItemKind::Fn(decl) => self.check_function(decl, None),
                ItemKind::Class(decl) => self.check_class(decl),
                ItemKind::Var(decl) => {
                    self.push_scope();
                    self.check_var_decl(decl, item.id, item.span);
                    self.pop_scope();
                }
                ItemKind::Stmt(_) | ItemKind::Import(_) | ItemKind::TypeAlias(_)
                | ItemKind::Enum(_) => {}
            }
        }

        // Top-level script statements share one scope, in source order
        self.push_scope();
        let void = self.types.void();
        self.returns.push(ReturnCtx {
            expected: void,
            error: None,
        });
        for item in &module.items {
            if let ItemKind::Stmt(stmt) = &item.kind {
                self.check_stmt(stmt);
            }
        }
        self.returns.pop();
        self.pop_scope();
    }

    fn check_class(&mut self, decl: &ClassDecl) {
        let class_id = match self.types.lookup_class(&self.module, &decl.name) {
            Some(id) => id,
            None => return,
        };

        // Interfaces listed in the header must be fully implemented
        let interfaces = self.types.class(class_id).interfaces.clone();
        for interface in interfaces {
            if !self.types.implements(class_id, interface) {
                let name = self.types.interface(interface).name.clone();
                self.sink.push(Diagnostic::error(
                    codes::INTERFACE_NOT_IMPLEMENTED,
                    Stage::Semantic,
                    format!(
                        "class '{}' does not fully implement interface '{}'",
                        decl.name, name
                    ),
                ));
            }
        }

        self.class = Some(class_id);
        for member in &decl.members {
            match &member.kind {
                ClassMemberKind::Field(field) => {
                    if let Some(init) = &field.init {
                        self.push_scope();
                        let actual = self.check_expr(init);
                        self.pop_scope();
                        let declared = self
                            .types
                            .find_member(class_id, &field.name)
                            .map(|(m, _)| m.ty);
                        if let Some(declared) = declared
                            && !self.types.is_assignable(actual, declared)
                        {
                            self.type_mismatch(declared, actual, init.span);
                        }
                    }
                }
                ClassMemberKind::Method(method) | ClassMemberKind::Init(method) => {
                    let overrides = self
                        .types
                        .find_member(class_id, &method.name)
                        .map(|(m, _)| m.overrides)
                        .unwrap_or(false);
                    self.method_overrides = overrides.then(|| method.name.clone());
                    self.check_function(method, Some(class_id));
                    self.method_overrides = None;
                }
                ClassMemberKind::AbstractMethod { .. } => {}
            }
        }
        self.class = None;
    }

    fn check_function(&mut self, decl: &FnDecl, class: Option<ClassId>) {
        self.push_scope();
        if let Some(class_id) = class {
            let self_ty = self.types.intern(TypeKind::Class(class_id));
            self.bind_local("self", self_ty);
        }
        for param in &decl.params {
            let ty = self.resolve_type(&param.ty);
            if let Some(default) = &param.default {
                let actual = self.check_expr(default);
                if !self.types.is_assignable(actual, ty) {
                    self.type_mismatch(ty, actual, default.span);
                }
            }
            self.bind_local(&param.name, ty);
        }

        let (result, error) = self.split_return_type(decl.return_ty.as_ref(), class);
        let expected = self.full_return_type(result, &error);
        self.returns.push(ReturnCtx {
            expected,
            error: error.clone(),
        });
        self.check_block(&decl.body);
        self.returns.pop();

        // Every terminating path must produce a value
        let void = self.types.void();
        let needs_value = self.types.resolve_alias(result) != void || error.is_some();
        if needs_value && !block_always_returns(&decl.body) {
            self.sink.push(
                Diagnostic::error(
                    codes::MISSING_RETURN,
                    Stage::Semantic,
                    format!(
                        "function '{}' does not return a value on every path",
                        decl.name
                    ),
                )
                .at(self.file, decl.body.span)
                .with_hint("add a return statement to the fall-through path"),
            );
        }
        self.pop_scope();
    }

    /// Split a declared return annotation into (success type, error set)
    fn split_return_type(
        &mut self,
        annotation: Option<&TypeExpr>,
        class: Option<ClassId>,
    ) -> (TypeId, Option<ErrorSet>) {
        let previous_class = self.class;
        if class.is_some() {
            self.class = class;
        }
        let out = match annotation {
            None => (self.types.void(), None),
            Some(ty) => match &ty.kind {
                TypeExprKind::Optional { inner, err } => {
                    let success = self.resolve_type(inner);
                    let error = match err {
                        None => ErrorSet::Absent,
                        Some(err) => {
                            let err_ty = self.resolve_type(err);
                            self.error_set_of(err_ty)
                        }
                    };
                    (success, Some(error))
                }
                _ => (self.resolve_type(ty), None),
            },
        };
        self.class = previous_class;
        out
    }

    fn error_set_of(&mut self, err_ty: TypeId) -> ErrorSet {
        match self.types.kind(self.types.resolve_alias(err_ty)).clone() {
            TypeKind::Union(variants) => ErrorSet::from_types(variants),
            _ => ErrorSet::from_types(vec![err_ty]),
        }
    }

    fn full_return_type(&mut self, result: TypeId, error: &Option<ErrorSet>) -> TypeId {
        match error {
            None => result,
            Some(error) => self.types.intern(TypeKind::Optional {
                success: result,
                error: error.clone(),
            }),
        }
    }

    fn function_type(
        &mut self,
        params: &[Param],
        return_ty: Option<&TypeExpr>,
        class: Option<ClassId>,
    ) -> TypeId {
        let previous_class = self.class;
        if class.is_some() {
            self.class = class;
        }
        let param_types: Vec<(TypeId, bool)> = params
            .iter()
            .map(|p| (self.resolve_type(&p.ty), p.default.is_some()))
            .collect();
        let (result, error) = self.split_return_type(return_ty, class);
        self.class = previous_class;
        self.types.intern(TypeKind::Function {
            params: param_types,
            result,
            error,
        })
    }

    // ----- statements -----

    fn check_block(&mut self, block: &Block) {
        self.push_scope();
        for stmt in &block.stmts {
            self.check_stmt(stmt);
        }
        self.pop_scope();
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Var(decl) => self.check_var_decl(decl, stmt.id, stmt.span),
            StmtKind::Fn(decl) => {
                let ty = self.function_type(&decl.params, decl.return_ty.as_ref(), None);
                self.results.binding_types.insert(stmt.id, ty);
                self.bind_local(&decl.name, ty);
                self.check_function(decl, None);
            }
            StmtKind::Expr(expr) => {
                self.check_expr(expr);
            }
            StmtKind::Block(block) => self.check_block(block),
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.check_condition(cond);
                self.check_block(then_block);
                if let Some(else_block) = else_block {
                    self.check_stmt(else_block);
                }
            }
            StmtKind::While { cond, body } => {
                self.check_condition(cond);
                self.check_block(body);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.push_scope();
                if let Some(init) = init {
                    self.check_stmt(init);
                }
                if let Some(cond) = cond {
                    self.check_condition(cond);
                }
                if let Some(step) = step {
                    self.check_expr(step);
                }
                self.check_block(body);
                self.pop_scope();
            }
            StmtKind::Iter {
                binding,
                iterable,
                body,
            } => {
                let iterable_ty = self.check_expr(iterable);
                let element = self.element_type(iterable_ty, iterable.span);
                self.push_scope();
                self.bind_local(binding, element);
                self.check_block(body);
                self.pop_scope();
            }
            StmtKind::Loop { body } => self.check_block(body),
            StmtKind::Return(value) => self.check_return(value.as_ref(), stmt.span),
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Parallel(block) | StmtKind::Concurrent(block) | StmtKind::Task(block) => {
                self.check_block(block)
            }
        }
    }

    fn check_var_decl(&mut self, decl: &VarDecl, node: NodeId, span: Span) {
        let declared = decl.ty.as_ref().map(|ty| self.resolve_type(ty));
        let actual = decl.init.as_ref().map(|init| self.check_expr(init));
        let ty = match (declared, actual) {
            (Some(declared), Some(actual)) => {
                if !self.types.is_assignable(actual, declared) {
                    let at = decl.init.as_ref().map(|e| e.span).unwrap_or(span);
                    self.type_mismatch(declared, actual, at);
                }
                declared
            }
            (Some(declared), None) => declared,
            (None, Some(actual)) => actual,
            (None, None) => self.types.any(),
        };
        self.results.binding_types.insert(node, ty);
        self.bind_local(&decl.name, ty);
    }

    fn check_condition(&mut self, cond: &Expr) {
        let ty = self.check_expr(cond);
        let bool_ty = self.types.bool();
        if !self.types.is_assignable(ty, bool_ty) {
            self.type_mismatch(bool_ty, ty, cond.span);
        }
    }

    fn check_return(&mut self, value: Option<&Expr>, span: Span) {
        let expected = match self.returns.last() {
            Some(ctx) => ctx.expected,
            None => self.types.void(),
        };
        match value {
            Some(expr) => {
                let actual = self.check_expr(expr);
                if !self.types.is_assignable(actual, expected) {
                    self.type_mismatch(expected, actual, expr.span);
                }
            }
            None => {
                let void = self.types.void();
                if self.types.resolve_alias(expected) != void {
                    self.sink.push(
                        Diagnostic::error(
                            codes::TYPE_MISMATCH,
                            Stage::Semantic,
                            format!(
                                "expected a value of type {}, found bare 'return'",
                                self.types.display(expected)
                            ),
                        )
                        .at(self.file, span),
                    );
                }
            }
        }
    }

    fn element_type(&mut self, iterable: TypeId, span: Span) -> TypeId {
        match self.types.kind(self.types.resolve_alias(iterable)).clone() {
            TypeKind::List(element) => element,
            TypeKind::Range(element) => element,
            TypeKind::Dict(key, _) => key,
            TypeKind::Str => self.types.str(),
            TypeKind::Any | TypeKind::Unresolved(_) => self.types.any(),
            _ => {
                self.sink.push(
                    Diagnostic::error(
                        codes::TYPE_MISMATCH,
                        Stage::Semantic,
                        format!("type {} is not iterable", self.types.display(iterable)),
                    )
                    .at(self.file, span),
                );
                self.types.any()
            }
        }
    }

    // ----- expressions -----

    pub fn check_expr(&mut self, expr: &Expr) -> TypeId {
        let ty = self.check_expr_kind(expr);
        self.results.expr_types.insert(expr.id, ty);
        ty
    }

    fn check_expr_kind(&mut self, expr: &Expr) -> TypeId {
        match &expr.kind {
            ExprKind::Nil => self.types.nil(),
            ExprKind::Bool(_) => self.types.bool(),
            ExprKind::Int(_) => self.types.int(),
            ExprKind::Float(_) => self.types.float(),
            ExprKind::Str(_) => self.types.str(),
            ExprKind::Interp(parts) => {
                for part in parts {
                    if let InterpPart::Expr(inner) = part {
                        self.check_expr(inner);
                    }
                }
                self.types.str()
            }
            ExprKind::Name(name) => self.check_name(expr, name),
            ExprKind::SelfRef => match self.class {
                Some(class_id) => self.types.intern(TypeKind::Class(class_id)),
                None => {
                    self.sink.push(
                        Diagnostic::error(
                            codes::INVALID_SELF_TYPE,
                            Stage::Semantic,
                            "'self' is only valid inside a class body",
                        )
                        .at(self.file, expr.span),
                    );
                    self.types.any()
                }
            },
            ExprKind::SuperCall { method, args } => self.check_super_call(expr, method, args),
            ExprKind::Member { obj, name } => self.check_member(expr, obj, name),
            ExprKind::Index { obj, index } => {
                let obj_ty = self.check_expr(obj);
                let index_ty = self.check_expr(index);
                let int = self.types.int();
                match self.types.kind(self.types.resolve_alias(obj_ty)).clone() {
                    TypeKind::List(element) => {
                        if !self.types.is_assignable(index_ty, int) {
                            self.type_mismatch(int, index_ty, index.span);
                        }
                        element
                    }
                    TypeKind::Dict(key, value) => {
                        if !self.types.is_assignable(index_ty, key) {
                            self.type_mismatch(key, index_ty, index.span);
                        }
                        value
                    }
                    TypeKind::Str => {
                        if !self.types.is_assignable(index_ty, int) {
                            self.type_mismatch(int, index_ty, index.span);
                        }
                        self.types.str()
                    }
                    TypeKind::Any | TypeKind::Unresolved(_) => self.types.any(),
                    _ => {
                        self.sink.push(
                            Diagnostic::error(
                                codes::TYPE_MISMATCH,
                                Stage::Semantic,
                                format!(
                                    "type {} cannot be indexed",
                                    self.types.display(obj_ty)
                                ),
                            )
                            .at(self.file, obj.span),
                        );
                        self.types.any()
                    }
                }
            }
            ExprKind::Call { callee, args } => self.check_call(expr, callee, args),
            ExprKind::Unary { op, operand } => {
                let operand_ty = self.check_expr(operand);
                match op {
                    UnaryOp::Neg => {
                        let int = self.types.int();
                        let float = self.types.float();
                        if self.types.is_assignable(operand_ty, int)
                            || self.types.is_assignable(operand_ty, float)
                        {
                            operand_ty
                        } else {
                            self.type_mismatch(int, operand_ty, operand.span);
                            self.types.any()
                        }
                    }
                    UnaryOp::Not => {
                        let bool_ty = self.types.bool();
                        if !self.types.is_assignable(operand_ty, bool_ty) {
                            self.type_mismatch(bool_ty, operand_ty, operand.span);
                        }
                        bool_ty
                    }
                }
            }
            ExprKind::Binary { op, lhs, rhs } => self.check_binary(*op, lhs, rhs),
            ExprKind::Assign { op, target, value } => {
                let target_ty = self.check_expr(target);
                let value_ty = self.check_expr(value);
                if *op != AssignOp::Assign {
                    // += / -= need numeric (or str for +=) operands
                    let int = self.types.int();
                    let float = self.types.float();
                    let str_ = self.types.str();
                    let numeric = self.types.is_assignable(target_ty, int)
                        || self.types.is_assignable(target_ty, float)
                        || (*op == AssignOp::AddAssign
                            && self.types.is_assignable(target_ty, str_));
                    if !numeric {
                        self.type_mismatch(int, target_ty, target.span);
                    }
                }
                if !self.types.is_assignable(value_ty, target_ty) {
                    self.type_mismatch(target_ty, value_ty, value.span);
                }
                self.types.void()
            }
            ExprKind::Ok(payload) => {
                let success = match payload {
                    Some(inner) => self.check_expr(inner),
                    None => self.types.void(),
                };
                self.types.intern(TypeKind::Optional {
                    success,
                    error: ErrorSet::Absent,
                })
            }
            ExprKind::Err(payload) => self.check_err_ctor(payload.as_deref()),
            ExprKind::Propagate(inner) => self.check_propagate(expr, inner),
            ExprKind::Recover {
                expr: inner,
                binding,
                handler,
            } => self.check_recover(inner, binding.as_deref(), handler),
            ExprKind::Range { lo, hi } => {
                let int = self.types.int();
                let lo_ty = self.check_expr(lo);
                let hi_ty = self.check_expr(hi);
                if !self.types.is_assignable(lo_ty, int) {
                    self.type_mismatch(int, lo_ty, lo.span);
                }
                if !self.types.is_assignable(hi_ty, int) {
                    self.type_mismatch(int, hi_ty, hi.span);
                }
                self.types.intern(TypeKind::Range(int))
            }
            ExprKind::List(elements) => {
                let mut element_ty: Option<TypeId> = None;
                let mut needs_union = false;
                let mut element_types = Vec::new();
                for element in elements {
                    let ty = self.check_expr(element);
                    element_types.push(ty);
                    match element_ty {
                        None => element_ty = Some(ty),
                        Some(current) => {
                            if !self.types.is_assignable(ty, current) {
                                needs_union = true;
                            }
                        }
                    }
                }
                let element = match element_ty {
                    None => self.types.any(),
                    Some(first) if !needs_union => first,
                    Some(_) => self.types.union_of(element_types),
                };
                self.types.intern(TypeKind::List(element))
            }
            ExprKind::Dict(entries) => {
                let mut key_ty: Option<TypeId> = None;
                let mut value_ty: Option<TypeId> = None;
                for (key, value) in entries {
                    let k = self.check_expr(key);
                    let v = self.check_expr(value);
                    key_ty.get_or_insert(k);
                    value_ty.get_or_insert(v);
                }
                let key = key_ty.unwrap_or_else(|| self.types.any());
                let value = value_ty.unwrap_or_else(|| self.types.any());
                self.types.intern(TypeKind::Dict(key, value))
            }
            ExprKind::Match(match_expr) => self.check_match(match_expr),
            ExprKind::Await(inner) => self.check_expr(inner),
        }
    }

    fn check_name(&mut self, expr: &Expr, name: &str) -> TypeId {
        // Locals shadow module bindings shadow enum variants
        for scope in self.scopes.iter().rev() {
            if let Some(ty) = scope.bindings.get(name) {
                self.results.name_refs.insert(expr.id, NameRef::Local);
                return *ty;
            }
        }
        if let Some(binding) = self.modules.binding(&self.module, name).cloned() {
            let name_ref = match binding.kind {
                BindingKind::Var => NameRef::ModuleVar {
                    module: self.module.clone(),
                    name: name.to_string(),
                },
                BindingKind::Fn => NameRef::ModuleFn {
                    module: self.module.clone(),
                    name: name.to_string(),
                },
                BindingKind::Class(class_id) => NameRef::Class(class_id),
                BindingKind::Enum(_) | BindingKind::TypeAlias => {
                    self.sink.push(
                        Diagnostic::error(
                            codes::UNDEFINED_NAME,
                            Stage::Semantic,
                            format!("'{}' is a type, not a value", name),
                        )
                        .at(self.file, expr.span),
                    );
                    self.results
                        .name_refs
                        .insert(expr.id, NameRef::Builtin(name.to_string()));
                    return self.types.any();
                }
            };
            self.results.name_refs.insert(expr.id, name_ref);
            return binding.ty;
        }
        if let Some(enum_id) = self.types.enum_of_variant(name) {
            let index = self
                .types
                .enum_info(enum_id)
                .variants
                .iter()
                .position(|v| v == name)
                .unwrap() as u32;
            self.results
                .name_refs
                .insert(expr.id, NameRef::EnumVariant { enum_id, index });
            return self.types.intern(TypeKind::Enum(enum_id));
        }
        // Imported modules referenced by name (or alias)
        if let Some(info) = self.modules.get(&self.module)
            && let Some(import) = info.imported_module(name)
        {
            let target = import.target.clone();
            self.results
                .name_refs
                .insert(expr.id, NameRef::Module(target.clone()));
            return self.types.any();
        }
        // Names pulled in with `show`
        if let Some((module, binding)) = self.show_imported(name) {
            let name_ref = match binding.kind {
                BindingKind::Fn => NameRef::ModuleFn {
                    module: module.clone(),
                    name: name.to_string(),
                },
                _ => NameRef::ModuleVar {
                    module: module.clone(),
                    name: name.to_string(),
                },
            };
            self.results.module_accesses.push(ModuleAccess {
                module,
                name: name.to_string(),
                from_module: self.module.clone(),
                file: self.file,
                span: expr.span,
            });
            self.results.name_refs.insert(expr.id, name_ref);
            return binding.ty;
        }
        if let Some(builtin) = builtin_type(name, self.types) {
            self.results
                .name_refs
                .insert(expr.id, NameRef::Builtin(name.to_string()));
            return builtin;
        }
        self.sink.push(
            Diagnostic::error(
                codes::UNDEFINED_NAME,
                Stage::Semantic,
                format!("undefined name '{}'", name),
            )
            .at(self.file, expr.span)
            .with_hint("check the spelling, or import the module that defines it"),
        );
        self.types.any()
    }

    fn show_imported(&self, name: &str) -> Option<(String, ModuleBinding)> {
        let info = self.modules.get(&self.module)?;
        for import in &info.imports {
            if let Some(ImportFilter::Show(names)) = &import.filter
                && names.iter().any(|n| n == name)
                && let Some(binding) = self.modules.binding(&import.target, name)
            {
                return Some((import.target.clone(), binding.clone()));
            }
        }
        None
    }

    fn check_member(&mut self, expr: &Expr, obj: &Expr, name: &str) -> TypeId {
        // Module member access: `m1.secret`
        if let ExprKind::Name(module_name) = &obj.kind
            && !self.is_local_or_binding(module_name)
            && let Some(info) = self.modules.get(&self.module)
            && let Some(import) = info.imported_module(module_name)
        {
            let target = import.target.clone();
            let allowed = info.import_allows(import, name);
            self.results
                .name_refs
                .insert(obj.id, NameRef::Module(target.clone()));
            self.results.expr_types.insert(obj.id, self.types.any());
            if !allowed {
                self.sink.push(
                    Diagnostic::error(
                        codes::UNDEFINED_NAME,
                        Stage::Semantic,
                        format!("'{}' is hidden by this import of '{}'", name, target),
                    )
                    .at(self.file, expr.span),
                );
                return self.types.any();
            }
            match self.modules.binding(&target, name).cloned() {
                Some(binding) => {
                    self.results.module_accesses.push(ModuleAccess {
                        module: target.clone(),
                        name: name.to_string(),
                        from_module: self.module.clone(),
                        file: self.file,
                        span: expr.span,
                    });
                    match binding.kind {
                        // A qualified class name instantiates like a
                        // bare one: `m1.K()`
                        BindingKind::Class(class_id) => {
                            self.results
                                .name_refs
                                .insert(expr.id, NameRef::Class(class_id));
                        }
                        BindingKind::Fn => {
                            self.results.member_refs.insert(
                                expr.id,
                                MemberRef::ModuleFn {
                                    module: target,
                                    name: name.to_string(),
                                },
                            );
                        }
                        _ => {
                            self.results.member_refs.insert(
                                expr.id,
                                MemberRef::ModuleVar {
                                    module: target,
                                    name: name.to_string(),
                                },
                            );
                        }
                    }
                    return binding.ty;
                }
                None => {
                    self.sink.push(
                        Diagnostic::error(
                            codes::UNDEFINED_NAME,
                            Stage::Semantic,
                            format!("module '{}' has no member '{}'", target, name),
                        )
                        .at(self.file, expr.span),
                    );
                    return self.types.any();
                }
            }
        }

        let obj_ty = self.check_expr(obj);
        let resolved = self.types.resolve_alias(obj_ty);
        match self.types.kind(resolved).clone() {
            TypeKind::Class(class_id) | TypeKind::SelfType(class_id) => {
                match self.types.find_member(class_id, name) {
                    Some((member, _)) => {
                        let member = member.clone();
                        self.results.class_accesses.push(ClassAccess {
                            class: class_id,
                            member: name.to_string(),
                            from_module: self.module.clone(),
                            from_class: self.class,
                            file: self.file,
                            span: expr.span,
                        });
                        let member_ref = match member.kind {
                            MemberKind::Field => MemberRef::Field {
                                class: class_id,
                                name: name.to_string(),
                            },
                            _ => MemberRef::Method {
                                class: class_id,
                                name: name.to_string(),
                            },
                        };
                        self.results.member_refs.insert(expr.id, member_ref);
                        member.ty
                    }
                    None => {
                        let class_name = self.types.class(class_id).name.clone();
                        self.sink.push(
                            Diagnostic::error(
                                codes::BAD_FIELD,
                                Stage::Semantic,
                                format!("class '{}' has no member '{}'", class_name, name),
                            )
                            .at(self.file, expr.span),
                        );
                        self.types.any()
                    }
                }
            }
            TypeKind::Structural(fields) => fields
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, ty)| *ty)
                .unwrap_or_else(|| {
                    self.sink.push(
                        Diagnostic::error(
                            codes::BAD_FIELD,
                            Stage::Semantic,
                            format!("record has no field '{}'", name),
                        )
                        .at(self.file, expr.span),
                    );
                    self.types.any()
                }),
            TypeKind::Any | TypeKind::Unresolved(_) => self.types.any(),
            _ => {
                self.sink.push(
                    Diagnostic::error(
                        codes::BAD_FIELD,
                        Stage::Semantic,
                        format!(
                            "type {} has no members",
                            self.types.display(obj_ty)
                        ),
                    )
                    .at(self.file, obj.span),
                );
                self.types.any()
            }
        }
    }

    fn is_local_or_binding(&self, name: &str) -> bool {
        self.scopes
            .iter()
            .rev()
            .any(|scope| scope.bindings.contains_key(name))
            || self
                .modules
                .binding(&self.module, name)
                .is_some()
    }

    fn check_call(&mut self, expr: &Expr, callee: &Expr, args: &[Expr]) -> TypeId {
        // print and friends
        if let ExprKind::Name(name) = &callee.kind
            && !self.is_local_or_binding(name)
            && is_builtin_fn(name)
        {
            self.results
                .name_refs
                .insert(callee.id, NameRef::Builtin(name.clone()));
            self.results.expr_types.insert(callee.id, self.types.any());
            self.results
                .call_refs
                .insert(expr.id, CallRef::Builtin(name.clone()));
            for arg in args {
                self.check_expr(arg);
            }
            return match name.as_str() {
                "print" => self.types.void(),
                "len" => self.types.int(),
                "str" => self.types.str(),
                _ => self.types.any(),
            };
        }

        let callee_ty = self.check_expr(callee);

        // Class instantiation: `A(...)`
        if let Some(NameRef::Class(class_id)) = self.results.name_refs.get(&callee.id).cloned() {
            return self.check_instantiation(expr, class_id, args);
        }

        let arg_types: Vec<(TypeId, Span)> = args
            .iter()
            .map(|arg| (self.check_expr(arg), arg.span))
            .collect();

        let resolved = self.types.resolve_alias(callee_ty);
        match self.types.kind(resolved).clone() {
            TypeKind::Function {
                params,
                result,
                error,
            } => {
                self.check_args("function", &params, &arg_types, expr.span);
                // Record how to reach the target
                let call_ref = match (&callee.kind, self.results.member_refs.get(&callee.id)) {
                    (_, Some(MemberRef::Method { class, name })) => {
                        let direct = self.method_is_direct(*class, name);
                        CallRef::Method {
                            class: *class,
                            name: name.clone(),
                            direct,
                        }
                    }
                    (_, Some(MemberRef::ModuleFn { module, name })) => CallRef::Static {
                        module: module.clone(),
                        name: name.clone(),
                    },
                    (ExprKind::Name(_), None) => {
                        match self.results.name_refs.get(&callee.id) {
                            Some(NameRef::ModuleFn { module, name }) => CallRef::Static {
                                module: module.clone(),
                                name: name.clone(),
                            },
                            _ => CallRef::Indirect,
                        }
                    }
                    _ => CallRef::Indirect,
                };
                self.results.call_refs.insert(expr.id, call_ref);

                let result = self.resolve_self_result(result, callee);
                self.full_return_type(result, &error)
            }
            TypeKind::Any | TypeKind::Unresolved(_) => {
                self.results.call_refs.insert(expr.id, CallRef::Indirect);
                self.types.any()
            }
            _ => {
                self.sink.push(
                    Diagnostic::error(
                        codes::TYPE_MISMATCH,
                        Stage::Semantic,
                        format!(
                            "type {} is not callable",
                            self.types.display(callee_ty)
                        ),
                    )
                    .at(self.file, callee.span),
                );
                self.types.any()
            }
        }
    }

    /// A self-typed result resolves to the receiver's static class,
    /// which is how fluent setters stay type-preserving
    fn resolve_self_result(&mut self, result: TypeId, callee: &Expr) -> TypeId {
        if !matches!(self.types.kind(result), TypeKind::SelfType(_)) {
            return result;
        }
        if let ExprKind::Member { obj, .. } = &callee.kind
            && let Some(receiver) = self.results.type_of(obj.id)
        {
            let resolved = self.types.resolve_alias(receiver);
            if matches!(self.types.kind(resolved), TypeKind::Class(_)) {
                return resolved;
            }
        }
        result
    }

    /// A call is direct (no vtable) only when the receiver class is
    /// final, so no subclass can override the target
    fn method_is_direct(&self, class: ClassId, _name: &str) -> bool {
        self.types.class(class).is_final
    }

    fn check_instantiation(&mut self, expr: &Expr, class_id: ClassId, args: &[Expr]) -> TypeId {
        let info = self.types.class(class_id).clone();
        if info.is_abstract {
            self.sink.push(
                Diagnostic::error(
                    codes::ABSTRACT_INSTANTIATION,
                    Stage::Semantic,
                    format!("cannot instantiate abstract class '{}'", info.name),
                )
                .at(self.file, expr.span)
                .with_hint("subclass it and implement the abstract methods"),
            );
        }

        let init = self.types.find_member(class_id, "init").map(|(m, _)| m.clone());
        let arg_types: Vec<(TypeId, Span)> = args
            .iter()
            .map(|arg| (self.check_expr(arg), arg.span))
            .collect();

        let mut runs_init = false;
        match &init {
            Some(member) => {
                if let TypeKind::Function { params, .. } = self.types.kind(member.ty).clone() {
                    let required = params.iter().filter(|(_, d)| !d).count();
                    if args.is_empty() && required > 0 {
                        let diag = Diagnostic::warning(
                            codes::INIT_NOT_CALLED,
                            Stage::Semantic,
                            format!(
                                "class '{}' declares an init with parameters, but none were passed",
                                info.name
                            ),
                        )
                        .at(self.file, expr.span)
                        .with_hint("fields keep their defaults until init runs");
                        if self.options.strict {
                            let mut diag = diag;
                            diag.severity = limit_core::diagnostics::Severity::Error;
                            self.sink.push(diag);
                        } else {
                            self.sink.push(diag);
                        }
                    } else {
                        runs_init = true;
                        self.check_args("init", &params, &arg_types, expr.span);
                    }
                }
            }
            None => {
                if !args.is_empty() {
                    self.sink.push(
                        Diagnostic::error(
                            codes::ARITY_MISMATCH,
                            Stage::Semantic,
                            format!(
                                "class '{}' has no init; construction takes no arguments",
                                info.name
                            ),
                        )
                        .at(self.file, expr.span),
                    );
                }
            }
        }

        self.results
            .call_refs
            .insert(expr.id, CallRef::Ctor { class: class_id, init: runs_init });
        self.types.intern(TypeKind::Class(class_id))
    }

    fn check_args(
        &mut self,
        what: &str,
        params: &[(TypeId, bool)],
        args: &[(TypeId, Span)],
        call_span: Span,
    ) {
        let required = params.iter().filter(|(_, has_default)| !has_default).count();
        if args.len() < required || args.len() > params.len() {
            self.sink.push(
                Diagnostic::error(
                    codes::ARITY_MISMATCH,
                    Stage::Semantic,
                    format!(
                        "{} expects {} argument{}, found {}",
                        what,
                        if required == params.len() {
                            required.to_string()
                        } else {
                            format!("{} to {}", required, params.len())
                        },
                        if params.len() == 1 { "" } else { "s" },
                        args.len()
                    ),
                )
                .at(self.file, call_span),
            );
            return;
        }
        for ((param_ty, _), (arg_ty, arg_span)) in params.iter().zip(args.iter()) {
            if !self.types.is_assignable(*arg_ty, *param_ty) {
                self.type_mismatch(*param_ty, *arg_ty, *arg_span);
            }
        }
    }

    fn check_super_call(&mut self, expr: &Expr, method: &str, args: &[Expr]) -> TypeId {
        let class_id = match self.class {
            Some(id) => id,
            None => {
                self.sink.push(
                    Diagnostic::error(
                        codes::INVALID_SUPER,
                        Stage::Semantic,
                        "'super' is only valid inside a class method",
                    )
                    .at(self.file, expr.span),
                );
                return self.types.any();
            }
        };
        let parent = match self.types.class(class_id).superclass {
            Some(parent) => parent,
            None => {
                let name = self.types.class(class_id).name.clone();
                self.sink.push(
                    Diagnostic::error(
                        codes::INVALID_SUPER,
                        Stage::Semantic,
                        format!("class '{}' has no superclass", name),
                    )
                    .at(self.file, expr.span),
                );
                return self.types.any();
            }
        };
        // Only an overriding method may call up
        if self.method_overrides.as_deref() != Some(method) {
            self.sink.push(
                Diagnostic::error(
                    codes::INVALID_SUPER,
                    Stage::Semantic,
                    format!(
                        "super.{}() is only valid inside a method overriding '{}'",
                        method, method
                    ),
                )
                .at(self.file, expr.span),
            );
        }
        match self.types.find_member(parent, method) {
            Some((member, declaring)) => {
                let member_ty = member.ty;
                let arg_types: Vec<(TypeId, Span)> = args
                    .iter()
                    .map(|arg| (self.check_expr(arg), arg.span))
                    .collect();
                if let TypeKind::Function { params, result, error } =
                    self.types.kind(member_ty).clone()
                {
                    self.check_args("method", &params, &arg_types, expr.span);
                    self.results.call_refs.insert(
                        expr.id,
                        CallRef::Super {
                            class: declaring,
                            name: method.to_string(),
                        },
                    );
                    self.results.class_accesses.push(ClassAccess {
                        class: parent,
                        member: method.to_string(),
                        from_module: self.module.clone(),
                        from_class: self.class,
                        file: self.file,
                        span: expr.span,
                    });
                    self.full_return_type(result, &error)
                } else {
                    self.types.any()
                }
            }
            None => {
                let parent_name = self.types.class(parent).name.clone();
                self.sink.push(
                    Diagnostic::error(
                        codes::INVALID_SUPER,
                        Stage::Semantic,
                        format!("class '{}' has no method '{}'", parent_name, method),
                    )
                    .at(self.file, expr.span),
                );
                self.types.any()
            }
        }
    }

    fn check_err_ctor(&mut self, payload: Option<&Expr>) -> TypeId {
        let error = match payload {
            Some(inner) => {
                let ty = self.check_expr(inner);
                ErrorSet::from_types(vec![ty])
            }
            None => match self.returns.last().and_then(|ctx| ctx.error.clone()) {
                Some(set) => set,
                None => ErrorSet::Absent,
            },
        };
        // The success side takes the enclosing function's success type
        // when known, so `return err()` fits the declared signature
        let success = match self.returns.last() {
            Some(ctx) => {
                match self.types.kind(ctx.expected) {
                    TypeKind::Optional { success, .. } => *success,
                    _ => self.types.any(),
                }
            }
            None => self.types.any(),
        };
        self.types.intern(TypeKind::Optional { success, error })
    }

    fn check_propagate(&mut self, expr: &Expr, inner: &Expr) -> TypeId {
        let inner_ty = self.check_expr(inner);
        let resolved = self.types.resolve_alias(inner_ty);
        let (success, error) = match self.types.kind(resolved).clone() {
            TypeKind::Optional { success, error } => (success, error),
            TypeKind::Any | TypeKind::Unresolved(_) => return self.types.any(),
            _ => {
                self.sink.push(
                    Diagnostic::error(
                        codes::INVALID_PROPAGATION,
                        Stage::Semantic,
                        format!(
                            "'?' needs a fallible value, found {}",
                            self.types.display(inner_ty)
                        ),
                    )
                    .at(self.file, expr.span),
                );
                return self.types.any();
            }
        };
        match self.returns.last().and_then(|ctx| ctx.error.clone()) {
            Some(fn_error) => {
                if !self.types.error_subset(&error, &fn_error) {
                    self.sink.push(
                        Diagnostic::error(
                            codes::INVALID_PROPAGATION,
                            Stage::Semantic,
                            "the propagated error set is not covered by the function's error set"
                                .to_string(),
                        )
                        .at(self.file, expr.span)
                        .with_hint("widen the function's '?E' annotation"),
                    );
                }
            }
            None => {
                self.sink.push(
                    Diagnostic::error(
                        codes::INVALID_PROPAGATION,
                        Stage::Semantic,
                        "'?' is only valid inside a fallible function",
                    )
                    .at(self.file, expr.span)
                    .with_suggestion("declare the function's return type as 'T?'"),
                );
            }
        }
        success
    }

    fn check_recover(&mut self, inner: &Expr, binding: Option<&str>, handler: &Block) -> TypeId {
        let inner_ty = self.check_expr(inner);
        let resolved = self.types.resolve_alias(inner_ty);
        let success = match self.types.kind(resolved).clone() {
            TypeKind::Optional { success, error } => {
                self.push_scope();
                if let Some(name) = binding {
                    let err_ty = match &error {
                        ErrorSet::Absent => self.types.nil(),
                        ErrorSet::Types(types) if types.len() == 1 => types[0],
                        ErrorSet::Types(types) => self.types.union_of(types.clone()),
                    };
                    self.bind_local(name, err_ty);
                }
                // `return` inside the handler yields the fallback value
                self.returns.push(ReturnCtx {
                    expected: success,
                    error: None,
                });
                for stmt in &handler.stmts {
                    self.check_stmt(stmt);
                }
                self.returns.pop();
                self.pop_scope();
                if !block_always_returns(handler) {
                    self.sink.push(
                        Diagnostic::error(
                            codes::MISSING_RETURN,
                            Stage::Semantic,
                            "the '? else' handler must produce a fallback value with 'return'",
                        )
                        .at(self.file, handler.span),
                    );
                }
                success
            }
            TypeKind::Any | TypeKind::Unresolved(_) => self.types.any(),
            _ => {
                self.sink.push(
                    Diagnostic::error(
                        codes::INVALID_PROPAGATION,
                        Stage::Semantic,
                        format!(
                            "'? else' needs a fallible value, found {}",
                            self.types.display(inner_ty)
                        ),
                    )
                    .at(self.file, inner.span),
                );
                self.types.any()
            }
        };
        success
    }

    fn check_match(&mut self, match_expr: &MatchExpr) -> TypeId {
        let scrutinee_ty = self.check_expr(&match_expr.scrutinee);

        let mut seen_total = false;
        for arm in &match_expr.arms {
            if seen_total {
                self.sink.push(
                    Diagnostic::error(
                        codes::UNREACHABLE_PATTERN,
                        Stage::Semantic,
                        "pattern is unreachable: an earlier pattern already matches everything",
                    )
                    .at(self.file, arm.span),
                );
            }
            self.push_scope();
            match &arm.pattern.kind {
                PatternKind::Binding(name) => {
                    self.bind_local(name, scrutinee_ty);
                }
                PatternKind::Variant { name, bindings } => {
                    let narrowed = self.types.narrow(scrutinee_ty, &arm.pattern.kind);
                    if let Some(binding) = bindings.first() {
                        let bound_ty = match name.as_str() {
                            "Err" => {
                                let resolved = self.types.resolve_alias(scrutinee_ty);
                                match self.types.kind(resolved).clone() {
                                    TypeKind::Optional { error, .. } => match error {
                                        ErrorSet::Absent => self.types.nil(),
                                        ErrorSet::Types(types) if types.len() == 1 => types[0],
                                        ErrorSet::Types(types) => self.types.union_of(types),
                                    },
                                    _ => narrowed,
                                }
                            }
                            _ => narrowed,
                        };
                        self.bind_local(binding, bound_ty);
                    }
                }
                _ => {}
            }
            if let Some(guard) = &arm.guard {
                self.check_condition(guard);
            }
            match &arm.body {
                ArmBody::Expr(expr) => {
                    self.check_expr(expr);
                }
                ArmBody::Block(block) => self.check_block(block),
            }
            self.pop_scope();

            if arm.guard.is_none()
                && matches!(
                    arm.pattern.kind,
                    PatternKind::Wildcard | PatternKind::Binding(_)
                )
            {
                seen_total = true;
            }
        }

        // Exhaustiveness: guarded patterns never count as total
        let unguarded: Vec<&PatternKind> = match_expr
            .arms
            .iter()
            .filter(|arm| arm.guard.is_none())
            .map(|arm| &arm.pattern.kind)
            .collect();
        match self.types.uncovered_variants(scrutinee_ty, &unguarded) {
            Some(uncovered) if uncovered.is_empty() => {}
            Some(uncovered) => {
                self.sink.push(
                    Diagnostic::error(
                        codes::NON_EXHAUSTIVE_MATCH,
                        Stage::Semantic,
                        format!("non-exhaustive match: missing {}", uncovered.join(", ")),
                    )
                    .at(self.file, match_expr.scrutinee.span)
                    .with_suggestion(format!(
                        "add an arm for {} or a '_' wildcard",
                        uncovered.join(", ")
                    )),
                );
            }
            None if !seen_total => {
                self.sink.push(
                    Diagnostic::error(
                        codes::NON_EXHAUSTIVE_MATCH,
                        Stage::Semantic,
                        format!(
                            "match over {} needs a '_' wildcard arm",
                            self.types.display(scrutinee_ty)
                        ),
                    )
                    .at(self.file, match_expr.scrutinee.span),
                );
            }
            None => {}
        }

        self.types.void()
    }

    fn check_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> TypeId {
        let lhs_ty = self.check_expr(lhs);
        let rhs_ty = self.check_expr(rhs);
        let int = self.types.int();
        let float = self.types.float();
        let str_ = self.types.str();
        let bool_ty = self.types.bool();

        match op {
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Mod
            | BinaryOp::Pow => {
                if op == BinaryOp::Add
                    && self.types.is_assignable(lhs_ty, str_)
                    && self.types.is_assignable(rhs_ty, str_)
                {
                    return str_;
                }
                let both_int = self.types.is_assignable(lhs_ty, int)
                    && self.types.is_assignable(rhs_ty, int);
                let both_float = self.types.is_assignable(lhs_ty, float)
                    && self.types.is_assignable(rhs_ty, float);
                if both_int {
                    int
                } else if both_float {
                    float
                } else {
                    self.sink.push(
                        Diagnostic::error(
                            codes::TYPE_MISMATCH,
                            Stage::Semantic,
                            format!(
                                "operands of '{:?}' must both be int or both be float, found {} and {}",
                                op,
                                self.types.display(lhs_ty),
                                self.types.display(rhs_ty)
                            ),
                        )
                        .at(self.file, lhs.span.to(rhs.span))
                        .with_hint("int does not widen to float implicitly"),
                    );
                    self.types.any()
                }
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                if !self.types.is_assignable(lhs_ty, rhs_ty)
                    && !self.types.is_assignable(rhs_ty, lhs_ty)
                {
                    self.sink.push(
                        Diagnostic::error(
                            codes::TYPE_MISMATCH,
                            Stage::Semantic,
                            format!(
                                "cannot compare {} with {}",
                                self.types.display(lhs_ty),
                                self.types.display(rhs_ty)
                            ),
                        )
                        .at(self.file, lhs.span.to(rhs.span)),
                    );
                }
                bool_ty
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let comparable = (self.types.is_assignable(lhs_ty, int)
                    && self.types.is_assignable(rhs_ty, int))
                    || (self.types.is_assignable(lhs_ty, float)
                        && self.types.is_assignable(rhs_ty, float))
                    || (self.types.is_assignable(lhs_ty, str_)
                        && self.types.is_assignable(rhs_ty, str_));
                if !comparable {
                    self.sink.push(
                        Diagnostic::error(
                            codes::TYPE_MISMATCH,
                            Stage::Semantic,
                            format!(
                                "cannot order {} against {}",
                                self.types.display(lhs_ty),
                                self.types.display(rhs_ty)
                            ),
                        )
                        .at(self.file, lhs.span.to(rhs.span)),
                    );
                }
                bool_ty
            }
            BinaryOp::And | BinaryOp::Or => {
                if !self.types.is_assignable(lhs_ty, bool_ty) {
                    self.type_mismatch(bool_ty, lhs_ty, lhs.span);
                }
                if !self.types.is_assignable(rhs_ty, bool_ty) {
                    self.type_mismatch(bool_ty, rhs_ty, rhs.span);
                }
                bool_ty
            }
        }
    }

    // ----- type resolution -----

    pub fn resolve_type(&mut self, ty: &TypeExpr) -> TypeId {
        match &ty.kind {
            TypeExprKind::Name(name) => self.resolve_type_name(name, ty.span),
            TypeExprKind::Qualified { module, name } => {
                match self.modules.binding(module, name).cloned() {
                    Some(binding) => binding.ty,
                    None => {
                        self.sink.push(
                            Diagnostic::error(
                                codes::UNDEFINED_NAME,
                                Stage::Semantic,
                                format!("module '{}' has no type '{}'", module, name),
                            )
                            .at(self.file, ty.span),
                        );
                        self.types.any()
                    }
                }
            }
            TypeExprKind::SelfType => match self.class {
                Some(class_id) => self.types.intern(TypeKind::SelfType(class_id)),
                None => {
                    self.sink.push(
                        Diagnostic::error(
                            codes::INVALID_SELF_TYPE,
                            Stage::Semantic,
                            "'Self' is only valid inside a class body",
                        )
                        .at(self.file, ty.span),
                    );
                    self.types.any()
                }
            },
            TypeExprKind::Optional { inner, err } => {
                let success = self.resolve_type(inner);
                let error = match err {
                    None => ErrorSet::Absent,
                    Some(err) => {
                        let err_ty = self.resolve_type(err);
                        self.error_set_of(err_ty)
                    }
                };
                self.types.intern(TypeKind::Optional { success, error })
            }
            TypeExprKind::Union(parts) => {
                let variants: Vec<TypeId> =
                    parts.iter().map(|p| self.resolve_type(p)).collect();
                self.types.union_of(variants)
            }
            TypeExprKind::List(element) => {
                let element = self.resolve_type(element);
                self.types.intern(TypeKind::List(element))
            }
            TypeExprKind::Dict { key, value } => {
                let key = self.resolve_type(key);
                let value = self.resolve_type(value);
                self.types.intern(TypeKind::Dict(key, value))
            }
            TypeExprKind::Range(element) => {
                let element = self.resolve_type(element);
                self.types.intern(TypeKind::Range(element))
            }
            TypeExprKind::Tuple(parts) => {
                let parts: Vec<TypeId> = parts.iter().map(|p| self.resolve_type(p)).collect();
                self.types.intern(TypeKind::Tuple(parts))
            }
            TypeExprKind::Fn { params, result } => {
                let params: Vec<(TypeId, bool)> = params
                    .iter()
                    .map(|p| (self.resolve_type(p), false))
                    .collect();
                let (result, error) = match &result.kind {
                    TypeExprKind::Optional { inner, err } => {
                        let success = self.resolve_type(inner);
                        let error = match err {
                            None => ErrorSet::Absent,
                            Some(err) => {
                                let err_ty = self.resolve_type(err);
                                self.error_set_of(err_ty)
                            }
                        };
                        (success, Some(error))
                    }
                    _ => (self.resolve_type(result), None),
                };
                self.types.intern(TypeKind::Function {
                    params,
                    result,
                    error,
                })
            }
            // TODO: generic instantiation is unchecked until the
            // monomorphization-vs-erasure question is settled
            TypeExprKind::Generic { name, args } => {
                for arg in args {
                    self.resolve_type(arg);
                }
                self.types.intern(TypeKind::Unresolved(name.clone()))
            }
        }
    }

    fn resolve_type_name(&mut self, name: &str, span: Span) -> TypeId {
        match name {
            "int" => return self.types.int(),
            "i32" => return self.types.intern(TypeKind::I32),
            "i64" => return self.types.intern(TypeKind::I64),
            "uint" => return self.types.intern(TypeKind::U64),
            "u32" => return self.types.intern(TypeKind::U32),
            "u64" => return self.types.intern(TypeKind::U64),
            "float" => return self.types.float(),
            "f32" => return self.types.intern(TypeKind::F32),
            "f64" => return self.types.intern(TypeKind::F64),
            "bool" => return self.types.bool(),
            "str" => return self.types.str(),
            "nil" => return self.types.nil(),
            "void" => return self.types.void(),
            "any" => return self.types.any(),
            _ => {}
        }
        if let Some(binding) = self.modules.binding(&self.module, name) {
            match binding.kind {
                BindingKind::Class(_) | BindingKind::Enum(_) | BindingKind::TypeAlias => {
                    return binding.ty;
                }
                _ => {}
            }
        }
        if let Some(class_id) = self.types.find_class_named(name) {
            return self.types.intern(TypeKind::Class(class_id));
        }
        if let Some(enum_id) = self.types.find_enum_named(name) {
            return self.types.intern(TypeKind::Enum(enum_id));
        }
        self.sink.push(
            Diagnostic::error(
                codes::UNDEFINED_NAME,
                Stage::Semantic,
                format!("undefined type '{}'", name),
            )
            .at(self.file, span),
        );
        self.types.any()
    }

    // ----- scope helpers -----

    fn push_scope(&mut self) {
        self.scopes.push(Scope {
            bindings: HashMap::new(),
        });
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn bind_local(&mut self, name: &str, ty: TypeId) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.bindings.insert(name.to_string(), ty);
        }
    }

    fn type_mismatch(&mut self, expected: TypeId, actual: TypeId, span: Span) {
        let message = format!(
            "type mismatch: expected {}, got {}",
            self.types.display(expected),
            self.types.display(actual)
        );
        self.sink.push(
            Diagnostic::error(codes::TYPE_MISMATCH, Stage::Semantic, message)
                .at(self.file, span),
        );
    }
}

/// Does every terminating path of the block end in a return?
pub fn block_always_returns(block: &Block) -> bool {
    block.stmts.iter().any(stmt_always_returns)
}

fn stmt_always_returns(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Return(_) => true,
        StmtKind::Block(block) => block_always_returns(block),
        StmtKind::If {
            then_block,
            else_block,
            ..
        } => {
            block_always_returns(then_block)
                && else_block
                    .as_ref()
                    .is_some_and(|e| stmt_always_returns(e))
        }
        // An infinite loop without a break never falls through
        StmtKind::Loop { body } => !block_contains_break(body),
        StmtKind::Expr(expr) => {
            if let ExprKind::Match(m) = &expr.kind {
                !m.arms.is_empty()
                    && m.arms.iter().all(|arm| match &arm.body {
                        ArmBody::Block(block) => block_always_returns(block),
                        ArmBody::Expr(_) => false,
                    })
                    && m.arms.iter().any(|arm| {
                        arm.guard.is_none()
                            && matches!(
                                arm.pattern.kind,
                                PatternKind::Wildcard | PatternKind::Binding(_)
                            )
                    })
            } else {
                false
            }
        }
        _ => false,
    }
}

fn block_contains_break(block: &Block) -> bool {
    block.stmts.iter().any(|stmt| match &stmt.kind {
        StmtKind::Break => true,
        StmtKind::Block(b) => block_contains_break(b),
        StmtKind::If {
            then_block,
            else_block,
            ..
        } => {
            block_contains_break(then_block)
                || else_block.as_ref().is_some_and(|e| {
                    matches!(&e.kind, StmtKind::Block(b) if block_contains_break(b))
                })
        }
        _ => false,
    })
}

fn is_builtin_fn(name: &str) -> bool {
    matches!(name, "print" | "len" | "str")
}

fn builtin_type(name: &str, types: &mut TypeTable) -> Option<TypeId> {
    if is_builtin_fn(name) {
        return Some(types.any());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CompilerOptions;
    use crate::parser;
    use crate::scanner::{self, ScanMode};

    fn check(source: &str) -> (DiagnosticSink, TypeCheckResults) {
        check_with(source, CompilerOptions::default())
    }

    fn check_with(source: &str, options: CompilerOptions) -> (DiagnosticSink, TypeCheckResults) {
        let mut sink = DiagnosticSink::new();
        let tokens = scanner::scan(source, FileId(0), ScanMode::Legacy, &mut sink);
        let result = parser::parse(tokens, FileId(0), "main", ScanMode::Legacy, &mut sink);
        assert!(!sink.has_errors(), "parse errors: {:?}", sink.iter().collect::<Vec<_>>());

        let mut types = TypeTable::new();
        let mut modules = ModuleRegistry::new();
        let mut checker = TypeChecker::new(&mut types, &mut modules, &mut sink, &options);
        checker.declare_module(&result.module);
        checker.check_module(&result.module);
        let results = checker.into_results();
        (sink, results)
    }

    fn assert_clean(source: &str) {
        let (sink, _) = check(source);
        assert!(
            !sink.has_errors(),
            "unexpected errors: {:?}",
            sink.iter().collect::<Vec<_>>()
        );
    }

    fn assert_error(source: &str, code: u16) {
        let (sink, _) = check(source);
        assert!(
            sink.iter().any(|d| d.code == code && d.is_error()),
            "expected E{:03}, got: {:?}",
            code,
            sink.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_var_decl_matches_annotation() {
        assert_clean("var x: int = 1;");
        assert_error("var x: int = \"oops\";", codes::TYPE_MISMATCH);
    }

    #[test]
    fn test_undefined_name() {
        assert_error("print(missing);", codes::UNDEFINED_NAME);
    }

    #[test]
    fn test_function_call_arity() {
        assert_error(
            "fn f(a: int): int { return a; } f(1, 2);",
            codes::ARITY_MISMATCH,
        );
        assert_clean("fn f(a: int, b: int = 2): int { return a + b; } f(1);");
    }

    #[test]
    fn test_no_implicit_int_to_float() {
        assert_error("var x: float = 1 + 2.5;", codes::TYPE_MISMATCH);
    }

    #[test]
    fn test_optional_propagation_ok() {
        assert_clean(
            r#"
fn to_int(s: str): int? {
    if (s == "10") { return ok(10); }
    return err();
}
fn plus_two(s: str): int? {
    var n: int = to_int(s)?;
    return ok(n + 2);
}
"#,
        );
    }

    #[test]
    fn test_propagation_from_non_fallible_rejected() {
        assert_error(
            r#"
fn to_int(s: str): int? { return ok(10); }
fn bad(s: str): int {
    var n: int = to_int(s)?;
    return n;
}
"#,
            codes::INVALID_PROPAGATION,
        );
    }

    #[test]
    fn test_propagation_on_plain_value_rejected() {
        assert_error(
            "fn f(): int? { var x: int = 1; var y: int = x?; return ok(y); }",
            codes::INVALID_PROPAGATION,
        );
    }

    #[test]
    fn test_recover_handler_yields_value() {
        assert_clean(
            r#"
fn div(a: int, b: int): int? {
    if (b == 0) { return err(); }
    return ok(a / b);
}
var v: int = div(10, 0) ? else e { print("caught"); return 0; };
print(v);
"#,
        );
    }

    #[test]
    fn test_recover_handler_requires_return() {
        assert_error(
            r#"
fn div(a: int, b: int): int? { return ok(a / b); }
var v: int = div(10, 0) ? else e { print("caught"); };
"#,
            codes::MISSING_RETURN,
        );
    }

    #[test]
    fn test_missing_return_detected() {
        assert_error(
            "fn f(a: int): int { if (a > 0) { return 1; } }",
            codes::MISSING_RETURN,
        );
        assert_clean("fn f(a: int): int { if (a > 0) { return 1; } else { return 2; } }");
    }

    #[test]
    fn test_match_exhaustiveness_enum() {
        assert_error(
            r#"
type Color = Red | Green | Blue;
var c: Color = Red;
match c { Red => print("r"), Green => print("g") }
"#,
            codes::NON_EXHAUSTIVE_MATCH,
        );
        assert_clean(
            r#"
type Color = Red | Green | Blue;
var c: Color = Red;
match c { Red => print("r"), Green => print("g"), Blue => print("b") }
"#,
        );
    }

    #[test]
    fn test_match_guards_do_not_count() {
        assert_error(
            r#"
type Color = Red | Green;
var c: Color = Red;
match c { Red => print("r"), Green where true => print("g") }
"#,
            codes::NON_EXHAUSTIVE_MATCH,
        );
    }

    #[test]
    fn test_match_wildcard_total() {
        assert_clean(
            r#"
var x: int = 3;
match x { 0 => print("zero"), _ => print("other") }
"#,
        );
    }

    #[test]
    fn test_unreachable_after_wildcard() {
        assert_error(
            r#"
var x: int = 3;
match x { _ => print("all"), 0 => print("zero") }
"#,
            codes::UNREACHABLE_PATTERN,
        );
    }

    #[test]
    fn test_optional_match() {
        assert_clean(
            r#"
fn f(): int? { return ok(1); }
match f() { Ok(v) => print("got {v}"), Err => print("none") }
"#,
        );
        assert_error(
            r#"
fn f(): int? { return ok(1); }
match f() { Ok(v) => print("got {v}") }
"#,
            codes::NON_EXHAUSTIVE_MATCH,
        );
    }

    #[test]
    fn test_class_inheritance_and_dispatch_types() {
        assert_clean(
            r#"
class A { fn name(): str { return "A"; } }
class B : A { fn name(): str { return "B"; } }
var items: [A] = [A(), B()];
iter (x in items) { print(x.name()); }
"#,
        );
    }

    #[test]
    fn test_abstract_instantiation_rejected() {
        assert_error(
            r#"
class Shape { fn area(): float; }
var s: Shape = Shape();
"#,
            codes::ABSTRACT_INSTANTIATION,
        );
    }

    #[test]
    fn test_super_requires_override() {
        assert_clean(
            r#"
class A { fn name(): str { return "A"; } }
class B : A { fn name(): str { return super.name() + "!"; } }
"#,
        );
        assert_error(
            r#"
class A { fn name(): str { return "A"; } }
class B : A { fn other(): str { return super.name(); } }
"#,
            codes::INVALID_SUPER,
        );
    }

    #[test]
    fn test_self_type_fluent_setter() {
        assert_clean(
            r#"
class Builder {
    var count: int = 0;
    fn bump(): Self { return self; }
}
class Sub : Builder { }
var b: Builder = Builder().bump();
"#,
        );
    }

    #[test]
    fn test_init_warning_without_args() {
        let (sink, _) = check(
            r#"
class P { var x: int = 0; fn init(x: int) { self.x = x; } }
var p: P = P();
"#,
        );
        assert!(sink.iter().any(|d| d.code == codes::INIT_NOT_CALLED && !d.is_error()));
    }

    #[test]
    fn test_init_warning_becomes_error_in_strict() {
        let options = CompilerOptions {
            strict: true,
            ..CompilerOptions::default()
        };
        let (sink, _) = check_with(
            r#"
class P { var x: int = 0; fn init(x: int) { self.x = x; } }
var p: P = P();
"#,
            options,
        );
        assert!(sink.iter().any(|d| d.code == codes::INIT_NOT_CALLED && d.is_error()));
    }

    #[test]
    fn test_bad_field() {
        assert_error(
            r#"
class A { var x: int = 0; }
var a: A = A();
print(a.missing);
"#,
            codes::BAD_FIELD,
        );
    }

    #[test]
    fn test_nil_needs_explicit_union() {
        assert_clean("var x: int | nil = nil;");
        assert_error("var x: int = nil;", codes::TYPE_MISMATCH);
    }

    #[test]
    fn test_iteration_over_range_and_list() {
        assert_clean("iter (x in 1..5) { print(\"{x}\"); }");
        assert_clean("var xs: [int] = [1, 2, 3]; iter (x in xs) { print(\"{x}\"); }");
        assert_error("iter (x in 5) { print(\"{x}\"); }", codes::TYPE_MISMATCH);
    }

    #[test]
    fn test_interpolation_types() {
        assert_clean("var name: str = \"World\"; print(\"Hello, {name}!\");");
    }

    #[test]
    fn test_expr_types_recorded() {
        let (_, results) = check("var x: int = 1 + 2;");
        // Every checked expression carries a type
        assert!(!results.expr_types.is_empty());
    }
}
