//! Abstract syntax tree for Limit
//!
//! Byte-range-tagged, trivia-free, and identical between legacy and
//! cst parse modes. Every expression, statement, and item carries a
//! `NodeId`; the semantic passes publish their results (inferred types,
//! ownership classifications, release plans) in side tables keyed by
//! those ids, so the tree itself stays immutable after parsing.

use limit_core::source::{FileId, Span};

/// Stable id for one AST node within a compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// One source file
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Module name: the file stem
    pub name: String,
    pub file: FileId,
    /// Declarations and top-level statements, in source order.
    /// Top-level statements form the module's script body.
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Private,
    Protected,
    Public,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: NodeId,
    pub span: Span,
    pub vis: Visibility,
    pub kind: ItemKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    Var(VarDecl),
    Fn(FnDecl),
    Class(ClassDecl),
    TypeAlias(TypeAliasDecl),
    Enum(EnumDecl),
    Import(ImportDecl),
    /// Top-level script statement
    Stmt(Stmt),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    pub ty: Option<TypeExpr>,
    pub init: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub return_ty: Option<TypeExpr>,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub span: Span,
    pub name: String,
    pub ty: TypeExpr,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    /// Names after the ':'; resolution decides which is the superclass
    /// and which are interfaces
    pub supers: Vec<String>,
    pub members: Vec<ClassMemberDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassMemberDecl {
    pub id: NodeId,
    pub span: Span,
    pub vis: Visibility,
    pub kind: ClassMemberKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassMemberKind {
    Field(VarDecl),
    Method(FnDecl),
    /// Method signature with no body; makes the class abstract
    AbstractMethod {
        name: String,
        params: Vec<Param>,
        return_ty: Option<TypeExpr>,
    },
    /// Constructor: a method named `init`
    Init(FnDecl),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeAliasDecl {
    pub name: String,
    pub target: TypeExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDecl {
    pub name: String,
    pub variants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    pub path: Vec<String>,
    pub alias: Option<String>,
    pub filter: Option<ImportFilter>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportFilter {
    Show(Vec<String>),
    Hide(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: NodeId,
    pub span: Span,
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub id: NodeId,
    pub span: Span,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Var(VarDecl),
    /// Nested function; captures make it a closure
    Fn(FnDecl),
    Expr(Expr),
    Block(Block),
    If {
        cond: Expr,
        then_block: Block,
        /// `else` block or a chained `else if` statement
        else_block: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Block,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Block,
    },
    Iter {
        binding: String,
        iterable: Expr,
        body: Block,
    },
    /// Infinite loop; only `break` terminates
    Loop {
        body: Block,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Parallel(Block),
    Concurrent(Block),
    Task(Block),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub id: NodeId,
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// String with interpolation holes
    Interp(Vec<InterpPart>),
    Name(String),
    SelfRef,
    /// `super.method(args)`: valid only inside an overriding method
    SuperCall {
        method: String,
        args: Vec<Expr>,
    },
    Member {
        obj: Box<Expr>,
        name: String,
    },
    Index {
        obj: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Assign {
        op: AssignOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    /// `ok(expr)` / `ok()` success constructor
    Ok(Option<Box<Expr>>),
    /// `err(expr)` / `err()` failure constructor
    Err(Option<Box<Expr>>),
    /// `expr?`: propagate failure to the caller
    Propagate(Box<Expr>),
    /// `expr ? else binding { handler }`: recover with a fallback value
    Recover {
        expr: Box<Expr>,
        binding: Option<String>,
        handler: Block,
    },
    Range {
        lo: Box<Expr>,
        hi: Box<Expr>,
    },
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Match(Box<MatchExpr>),
    Await(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterpPart {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    AddAssign,
    SubAssign,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchExpr {
    pub scrutinee: Expr,
    pub arms: Vec<MatchArm>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub id: NodeId,
    pub span: Span,
    pub pattern: Pattern,
    /// `where` guard; guarded patterns never count as total
    pub guard: Option<Expr>,
    pub body: ArmBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArmBody {
    Expr(Expr),
    Block(Block),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub span: Span,
    pub kind: PatternKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatternKind {
    /// `_`
    Wildcard,
    /// Lowercase name: binds the scrutinee
    Binding(String),
    /// `Ok(v)`, `Err`, `Red`, ... with optional field bindings
    Variant {
        name: String,
        bindings: Vec<String>,
    },
    Int(i64),
    Str(String),
    Bool(bool),
}

/// Syntax-level type annotation, resolved by the type checker
#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpr {
    pub span: Span,
    pub kind: TypeExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeExprKind {
    Name(String),
    /// `module::Name`
    Qualified {
        module: String,
        name: String,
    },
    /// `Self` inside a class body
    SelfType,
    /// `T?` (err: None) or `T?E`
    Optional {
        inner: Box<TypeExpr>,
        err: Option<Box<TypeExpr>>,
    },
    Union(Vec<TypeExpr>),
    List(Box<TypeExpr>),
    Dict {
        key: Box<TypeExpr>,
        value: Box<TypeExpr>,
    },
    Range(Box<TypeExpr>),
    Tuple(Vec<TypeExpr>),
    Fn {
        params: Vec<TypeExpr>,
        result: Box<TypeExpr>,
    },
    /// `Name[T, ...]`: parsed for forward compatibility, unchecked
    Generic {
        name: String,
        args: Vec<TypeExpr>,
    },
}

impl Module {
    /// Find a top-level function declaration by name
    pub fn find_fn(&self, name: &str) -> Option<&FnDecl> {
        self.items.iter().find_map(|item| match &item.kind {
            ItemKind::Fn(decl) if decl.name == name => Some(decl),
            _ => None,
        })
    }

    /// True if the module has top-level script statements
    pub fn has_script(&self) -> bool {
        self.items.iter().any(|item| {
            matches!(
                item.kind,
                ItemKind::Stmt(_) | ItemKind::Var(VarDecl { init: Some(_), .. })
            )
        })
    }
}

impl FnDecl {
    /// Constructor-by-convention: a method named `init`
    pub fn is_init(&self) -> bool {
        self.name == "init"
    }
}
