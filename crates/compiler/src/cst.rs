//! Concrete syntax tree for Limit
//!
//! The CST preserves every token and its trivia: each source byte
//! belongs to exactly one leaf, and an in-order walk of the leaves
//! reproduces the token stream (and, with trivia, the source text).
//! Nodes live in an index arena, so the tree is acyclic by
//! construction and cheap to build in lockstep with the AST.

use crate::token::Token;
use crate::trivia::{TriviaPool, trivia_text};
use limit_core::source::Span;
use serde::Serialize;

/// Grammar rule tag carried by CST nonterminals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyntaxKind {
    SourceFile,
    // Declarations
    VarDecl,
    FnDecl,
    ParamList,
    Param,
    ClassDecl,
    ClassMember,
    TypeAliasDecl,
    EnumDecl,
    ImportDecl,
    // Statements
    Block,
    IfStmt,
    WhileStmt,
    ForStmt,
    IterStmt,
    LoopStmt,
    ReturnStmt,
    BreakStmt,
    ContinueStmt,
    ExprStmt,
    ParallelStmt,
    ConcurrentStmt,
    TaskStmt,
    // Expressions
    NameExpr,
    LiteralExpr,
    StringExpr,
    ListExpr,
    DictExpr,
    GroupExpr,
    UnaryExpr,
    BinaryExpr,
    RangeExpr,
    AssignExpr,
    CallExpr,
    IndexExpr,
    MemberExpr,
    SuperExpr,
    PropagateExpr,
    RecoverExpr,
    AwaitExpr,
    OkExpr,
    ErrExpr,
    MatchExpr,
    MatchArm,
    Pattern,
    // Types
    TypeExpr,
    /// Recovery point: tokens skipped while resynchronizing
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CstNodeId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CstNode {
    /// Index into the CST's token vector
    Leaf { token: u32 },
    Node {
        kind: SyntaxKind,
        span: Span,
        children: Vec<CstNodeId>,
    },
}

#[derive(Debug)]
pub struct Cst {
    pub tokens: Vec<Token>,
    pub nodes: Vec<CstNode>,
    pub root: CstNodeId,
}

impl Cst {
    pub fn node(&self, id: CstNodeId) -> &CstNode {
        &self.nodes[id.0 as usize]
    }

    /// All leaves in source order
    pub fn leaves(&self) -> Vec<u32> {
        let mut out = Vec::new();
        self.collect_leaves(self.root, &mut out);
        out
    }

    fn collect_leaves(&self, id: CstNodeId, out: &mut Vec<u32>) {
        match self.node(id) {
            CstNode::Leaf { token } => out.push(*token),
            CstNode::Node { children, .. } => {
                for child in children {
                    self.collect_leaves(*child, out);
                }
            }
        }
    }

    /// Reassemble the original source text: for every leaf in order,
    /// leading trivia, lexeme, trailing trivia.
    pub fn reconstruct(&self, pool: &TriviaPool) -> String {
        let mut out = String::new();
        for index in self.leaves() {
            let token = &self.tokens[index as usize];
            for trivia in &token.leading {
                out.push_str(trivia_text(trivia, pool));
            }
            out.push_str(&token.lexeme);
            for trivia in &token.trailing {
                out.push_str(trivia_text(trivia, pool));
            }
        }
        out
    }

    /// Count error nodes (recovery points)
    pub fn error_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, CstNode::Node { kind: SyntaxKind::Error, .. }))
            .count()
    }

    /// Render an indented outline, used by `-cst` output
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_node(self.root, 0, &mut out);
        out
    }

    fn dump_node(&self, id: CstNodeId, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        match self.node(id) {
            CstNode::Leaf { token } => {
                let t = &self.tokens[*token as usize];
                out.push_str(&format!("{}{:?} {:?}\n", pad, t.kind, t.lexeme));
            }
            CstNode::Node { kind, span, children } => {
                out.push_str(&format!(
                    "{}{:?} [{}, {})\n",
                    pad, kind, span.start, span.end
                ));
                for child in children {
                    self.dump_node(*child, depth + 1, out);
                }
            }
        }
    }
}

/// Builds a CST in lockstep with the parser.
///
/// The parser opens a nonterminal when it commits to a grammar rule,
/// records every consumed token as a leaf, and closes the rule when
/// done. `checkpoint`/`wrap` retrofit a parent around already-emitted
/// children, which is how left-recursive expression shapes (binary
/// operators, postfix chains) get their nodes.
#[derive(Debug, Default)]
pub struct CstBuilder {
    nodes: Vec<CstNode>,
    /// Stack of open nonterminals: (kind, children so far)
    stack: Vec<(SyntaxKind, Vec<CstNodeId>)>,
}

/// Position in the current open node, for later wrapping
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint(usize);

impl CstBuilder {
    pub fn new() -> Self {
        CstBuilder {
            nodes: Vec::new(),
            stack: vec![(SyntaxKind::SourceFile, Vec::new())],
        }
    }

    pub fn open(&mut self, kind: SyntaxKind) {
        self.stack.push((kind, Vec::new()));
    }

    pub fn token(&mut self, index: u32) {
        let id = CstNodeId(self.nodes.len() as u32);
        self.nodes.push(CstNode::Leaf { token: index });
        self.current().push(id);
    }

    pub fn close(&mut self, tokens: &[Token]) {
        let (kind, children) = self.stack.pop().expect("close without open");
        let id = self.finish_node(kind, children, tokens);
        self.current().push(id);
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.stack.last().expect("no open node").1.len())
    }

    /// Wrap every child emitted since `checkpoint` into a new `kind` node
    pub fn wrap(&mut self, checkpoint: Checkpoint, kind: SyntaxKind, tokens: &[Token]) {
        let children = self.current().split_off(checkpoint.0);
        let id = self.finish_node(kind, children, tokens);
        self.current().push(id);
    }

    pub fn finish(mut self, tokens: Vec<Token>) -> Cst {
        assert_eq!(self.stack.len(), 1, "unbalanced open/close");
        let (kind, children) = self.stack.pop().unwrap();
        let id = self.finish_node(kind, children, &tokens);
        Cst {
            tokens,
            nodes: self.nodes,
            root: id,
        }
    }

    fn current(&mut self) -> &mut Vec<CstNodeId> {
        &mut self.stack.last_mut().expect("no open node").1
    }

    fn finish_node(
        &mut self,
        kind: SyntaxKind,
        children: Vec<CstNodeId>,
        tokens: &[Token],
    ) -> CstNodeId {
        let span = self.span_of(&children, tokens);
        let id = CstNodeId(self.nodes.len() as u32);
        self.nodes.push(CstNode::Node {
            kind,
            span,
            children,
        });
        id
    }

    /// Parent span is the union of the children's spans
    fn span_of(&self, children: &[CstNodeId], tokens: &[Token]) -> Span {
        let mut span: Option<Span> = None;
        for child in children {
            let child_span = match &self.nodes[child.0 as usize] {
                CstNode::Leaf { token } => tokens[*token as usize].span,
                CstNode::Node { span, .. } => *span,
            };
            span = Some(match span {
                Some(s) => s.to(child_span),
                None => child_span,
            });
        }
        span.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{ScanMode, scan};
    use limit_core::diagnostics::DiagnosticSink;
    use limit_core::source::FileId;

    fn tokens_of(source: &str) -> Vec<Token> {
        let mut sink = DiagnosticSink::new();
        scan(source, FileId(0), ScanMode::Cst, &mut sink)
    }

    #[test]
    fn test_builder_leaf_order() {
        let tokens = tokens_of("var x;");
        let mut builder = CstBuilder::new();
        builder.open(SyntaxKind::VarDecl);
        builder.token(0);
        builder.token(1);
        builder.token(2);
        builder.close(&tokens);
        builder.token(3); // Eof
        let cst = builder.finish(tokens);

        assert_eq!(cst.leaves(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_reconstruct_from_leaves() {
        let source = "var  x ; // tail\n";
        let tokens = tokens_of(source);
        let count = tokens.len() as u32;
        let mut builder = CstBuilder::new();
        for index in 0..count {
            builder.token(index);
        }
        let cst = builder.finish(tokens);
        let pool = TriviaPool::new();
        assert_eq!(cst.reconstruct(&pool), source);
    }

    #[test]
    fn test_wrap_retrofits_parent() {
        let tokens = tokens_of("1 + 2");
        let mut builder = CstBuilder::new();
        let checkpoint = builder.checkpoint();
        builder.token(0);
        builder.token(1);
        builder.token(2);
        builder.wrap(checkpoint, SyntaxKind::BinaryExpr, &tokens);
        builder.token(3); // Eof
        let cst = builder.finish(tokens);

        match cst.node(cst.root) {
            CstNode::Node { children, .. } => {
                assert_eq!(children.len(), 2);
                match cst.node(children[0]) {
                    CstNode::Node { kind, span, children } => {
                        assert_eq!(*kind, SyntaxKind::BinaryExpr);
                        assert_eq!(children.len(), 3);
                        assert_eq!((span.start, span.end), (0, 5));
                    }
                    CstNode::Leaf { .. } => panic!("expected wrapped node"),
                }
            }
            CstNode::Leaf { .. } => panic!("expected root node"),
        }
    }
}
