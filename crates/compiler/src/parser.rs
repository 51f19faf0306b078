//! Parser for Limit
//!
//! Recursive descent with a precedence ladder for expressions
//! (lowest to highest): assignment, `? else` recovery, `or`, `and`,
//! `not`, equality, comparison, range, additive, multiplicative, power,
//! unary, postfix (call, index, member, `?`), primary.
//!
//! Dual output: the AST is always built; in cst mode a [`CstBuilder`]
//! runs in lockstep, so every consumed token becomes a CST leaf and
//! every committed grammar rule a nonterminal. The AST is identical in
//! both modes (cross-mode parity is a tested property).
//!
//! On an unexpected token the parser reports, skips to the next
//! synchronization point (statement boundary or matching closer), and
//! resumes; skipped tokens land in a CST error node.

use crate::ast::*;
use crate::codes;
use crate::cst::{Checkpoint, Cst, CstBuilder, SyntaxKind};
use crate::scanner::ScanMode;
use crate::token::{Token, TokenKind};
use limit_core::diagnostics::{Diagnostic, DiagnosticSink, Stage};
use limit_core::source::{FileId, Span};

pub struct ParseResult {
    pub module: Module,
    pub cst: Option<Cst>,
}

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    file: FileId,
    builder: Option<CstBuilder>,
    next_id: u32,
    sink: &'a mut DiagnosticSink,
}

/// Parse one file's token stream into a module (and a CST in cst mode)
pub fn parse(
    tokens: Vec<Token>,
    file: FileId,
    module_name: &str,
    mode: ScanMode,
    sink: &mut DiagnosticSink,
) -> ParseResult {
    let builder = match mode {
        ScanMode::Cst => Some(CstBuilder::new()),
        ScanMode::Legacy => None,
    };
    let mut parser = Parser {
        tokens,
        pos: 0,
        file,
        builder,
        next_id: 0,
        sink,
    };
    let module = parser.parse_module(module_name);
    let cst = parser.finish_cst();
    ParseResult { module, cst }
}

impl<'a> Parser<'a> {
    // ----- cursor and CST plumbing -----

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn nth(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)]
    }

    fn at(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    /// Consume the current token, recording it as a CST leaf
    fn bump(&mut self) -> usize {
        let index = self.pos;
        if let Some(builder) = &mut self.builder {
            builder.token(index as u32);
        }
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        index
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> bool {
        if self.eat(kind) {
            return true;
        }
        let token = self.peek().clone();
        self.sink.push(
            Diagnostic::error(
                codes::UNEXPECTED_TOKEN,
                Stage::Parsing,
                format!("expected {}, found '{}'", what, describe(&token)),
            )
            .at(self.file, token.span),
        );
        false
    }

    fn expect_closer(&mut self, kind: &TokenKind, what: &str, opened_at: Span) -> bool {
        if self.eat(kind) {
            return true;
        }
        let token = self.peek().clone();
        self.sink.push(
            Diagnostic::error(
                codes::MISSING_DELIMITER,
                Stage::Parsing,
                format!("expected {}, found '{}'", what, describe(&token)),
            )
            .at(self.file, token.span)
            .caused_by(opened_at, "unclosed construct starts here"),
        );
        false
    }

    fn id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn cur_span(&self) -> Span {
        self.peek().span
    }

    fn prev_end(&self) -> u32 {
        if self.pos == 0 {
            0
        } else {
            self.tokens[self.pos - 1].span.end
        }
    }

    fn span_from(&self, start: u32) -> Span {
        Span::new(start, self.prev_end().max(start))
    }

    fn open(&mut self, kind: SyntaxKind) {
        if let Some(builder) = &mut self.builder {
            builder.open(kind);
        }
    }

    fn close(&mut self) {
        if let Some(builder) = &mut self.builder {
            builder.close(&self.tokens);
        }
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        self.builder.as_ref().map(|b| b.checkpoint())
    }

    fn wrap(&mut self, checkpoint: Option<Checkpoint>, kind: SyntaxKind) {
        if let (Some(builder), Some(checkpoint)) = (&mut self.builder, checkpoint) {
            builder.wrap(checkpoint, kind, &self.tokens);
        }
    }

    fn finish_cst(&mut self) -> Option<Cst> {
        let builder = self.builder.take()?;
        Some(builder.finish(std::mem::take(&mut self.tokens)))
    }

    /// Skip tokens until a statement boundary or matching closer.
    /// Skipped tokens become a CST error node.
    fn synchronize(&mut self) {
        self.open(SyntaxKind::Error);
        while !self.at_eof() {
            if self.at(&TokenKind::Semicolon) {
                self.bump();
                break;
            }
            if self.at(&TokenKind::RBrace) || starts_statement(&self.peek().kind) {
                break;
            }
            self.bump();
        }
        self.close();
    }

    // ----- module and items -----

    fn parse_module(&mut self, name: &str) -> Module {
        let file = self.file;
        let mut items = Vec::new();
        while !self.at_eof() {
            let before = self.pos;
            if let Some(item) = self.parse_item() {
                items.push(item);
            }
            if self.pos == before {
                // Didn't move: drop the offending token to guarantee progress
                self.bump();
            }
        }
        // The Eof leaf carries any remaining trivia
        if self.builder.is_some() {
            self.bump();
        }
        Module {
            name: name.to_string(),
            file,
            items,
        }
    }

    fn parse_item(&mut self) -> Option<Item> {
        let start = self.cur_span().start;
        let vis = self.parse_visibility();

        let kind = match &self.peek().kind {
            TokenKind::KwVar => {
                self.open(SyntaxKind::VarDecl);
                let decl = self.parse_var_decl();
                self.close();
                ItemKind::Var(decl)
            }
            TokenKind::KwFn => {
                self.open(SyntaxKind::FnDecl);
                let decl = self.parse_fn_decl(false);
                self.close();
                match decl {
                    Some((decl, _)) => ItemKind::Fn(decl),
                    None => return None,
                }
            }
            TokenKind::KwClass => {
                self.open(SyntaxKind::ClassDecl);
                let decl = self.parse_class_decl();
                self.close();
                ItemKind::Class(decl?)
            }
            TokenKind::KwType => {
                self.open(SyntaxKind::TypeAliasDecl);
                let decl = self.parse_type_alias();
                self.close();
                ItemKind::TypeAlias(decl?)
            }
            TokenKind::KwEnum => {
                self.open(SyntaxKind::EnumDecl);
                let decl = self.parse_enum_decl();
                self.close();
                ItemKind::Enum(decl?)
            }
            TokenKind::KwImport => {
                self.open(SyntaxKind::ImportDecl);
                let decl = self.parse_import_decl();
                self.close();
                ItemKind::Import(decl?)
            }
            _ => {
                if vis != Visibility::Private {
                    let span = self.cur_span();
                    self.sink.push(
                        Diagnostic::error(
                            codes::UNEXPECTED_TOKEN,
                            Stage::Parsing,
                            "visibility modifiers apply only to declarations",
                        )
                        .at(self.file, span),
                    );
                }
                let stmt = self.parse_stmt()?;
                ItemKind::Stmt(stmt)
            }
        };

        Some(Item {
            id: self.id(),
            span: self.span_from(start),
            vis,
            kind,
        })
    }

    fn parse_visibility(&mut self) -> Visibility {
        if self.eat(&TokenKind::KwPub) {
            Visibility::Public
        } else if self.eat(&TokenKind::KwProtected) {
            Visibility::Protected
        } else {
            Visibility::Private
        }
    }

    /// `var name (: type)? (= expr)? ;` — assumes `var` is current
    fn parse_var_decl(&mut self) -> VarDecl {
        self.bump(); // var
        let name = self.expect_identifier("a variable name");
        let ty = if self.eat(&TokenKind::Colon) {
            Some(self.parse_type())
        } else {
            None
        };
        let init = if self.eat(&TokenKind::Eq) {
            Some(self.parse_expr())
        } else {
            None
        };
        if !self.expect(&TokenKind::Semicolon, "';' after variable declaration") {
            self.synchronize();
        }
        VarDecl { name, ty, init }
    }

    /// `fn name(params) (: type)? body`. With `allow_signature` a `;`
    /// body yields the signature-only (abstract) form used in class
    /// bodies. Returns the declaration and whether a body was present.
    fn parse_fn_decl(&mut self, allow_signature: bool) -> Option<(FnDecl, bool)> {
        self.bump(); // fn
        let name = self.expect_identifier("a function name");
        let params = self.parse_params();
        let return_ty = if self.eat(&TokenKind::Colon) {
            Some(self.parse_type())
        } else {
            None
        };
        if self.at(&TokenKind::Semicolon) {
            if !allow_signature {
                let span = self.cur_span();
                self.sink.push(
                    Diagnostic::error(
                        codes::UNEXPECTED_TOKEN,
                        Stage::Parsing,
                        format!("function '{}' needs a body", name),
                    )
                    .at(self.file, span)
                    .with_hint("only class methods may be declared without a body"),
                );
            }
            self.bump();
            let body = Block {
                id: self.id(),
                span: self.cur_span(),
                stmts: Vec::new(),
            };
            return Some((
                FnDecl {
                    name,
                    params,
                    return_ty,
                    body,
                },
                false,
            ));
        }
        let body = self.parse_block()?;
        Some((
            FnDecl {
                name,
                params,
                return_ty,
                body,
            },
            true,
        ))
    }

    fn parse_params(&mut self) -> Vec<Param> {
        self.open(SyntaxKind::ParamList);
        let mut params = Vec::new();
        let open_span = self.cur_span();
        if !self.expect(&TokenKind::LParen, "'(' before parameters") {
            self.close();
            return params;
        }
        while !self.at(&TokenKind::RParen) && !self.at_eof() {
            self.open(SyntaxKind::Param);
            let start = self.cur_span().start;
            let name = self.expect_identifier("a parameter name");
            self.expect(&TokenKind::Colon, "':' before the parameter type");
            let ty = self.parse_type();
            let default = if self.eat(&TokenKind::Eq) {
                Some(self.parse_expr())
            } else {
                None
            };
            params.push(Param {
                span: self.span_from(start),
                name,
                ty,
                default,
            });
            self.close();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect_closer(&TokenKind::RParen, "')' after parameters", open_span);
        self.close();
        params
    }

    fn parse_class_decl(&mut self) -> Option<ClassDecl> {
        self.bump(); // class
        let name = self.expect_identifier("a class name");
        let mut supers = Vec::new();
        if self.eat(&TokenKind::Colon) {
            loop {
                supers.push(self.expect_identifier("a superclass or interface name"));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        let open_span = self.cur_span();
        if !self.expect(&TokenKind::LBrace, "'{' after the class header") {
            self.synchronize();
            return None;
        }

        let mut members = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.at_eof() {
            self.open(SyntaxKind::ClassMember);
            let start = self.cur_span().start;
            let vis = self.parse_visibility();
            let kind = match &self.peek().kind {
                TokenKind::KwVar => Some(ClassMemberKind::Field(self.parse_var_decl())),
                TokenKind::KwFn => match self.parse_fn_decl(true) {
                    Some((decl, true)) if decl.is_init() => Some(ClassMemberKind::Init(decl)),
                    Some((decl, true)) => Some(ClassMemberKind::Method(decl)),
                    Some((decl, false)) => Some(ClassMemberKind::AbstractMethod {
                        name: decl.name,
                        params: decl.params,
                        return_ty: decl.return_ty,
                    }),
                    None => None,
                },
                _ => {
                    let span = self.cur_span();
                    self.sink.push(
                        Diagnostic::error(
                            codes::UNEXPECTED_TOKEN,
                            Stage::Parsing,
                            "expected a field or method declaration in class body",
                        )
                        .at(self.file, span),
                    );
                    self.synchronize();
                    None
                }
            };
            if let Some(kind) = kind {
                members.push(ClassMemberDecl {
                    id: self.id(),
                    span: self.span_from(start),
                    vis,
                    kind,
                });
            }
            self.close();
        }
        self.expect_closer(&TokenKind::RBrace, "'}' after the class body", open_span);

        Some(ClassDecl {
            name,
            supers,
            members,
        })
    }

    fn parse_type_alias(&mut self) -> Option<TypeAliasDecl> {
        self.bump(); // type
        let name = self.expect_identifier("a type name");
        if !self.expect(&TokenKind::Eq, "'=' in type alias") {
            self.synchronize();
            return None;
        }
        let target = self.parse_type();
        if !self.expect(&TokenKind::Semicolon, "';' after type alias") {
            self.synchronize();
        }
        Some(TypeAliasDecl { name, target })
    }

    fn parse_enum_decl(&mut self) -> Option<EnumDecl> {
        self.bump(); // enum
        let name = self.expect_identifier("an enum name");
        let open_span = self.cur_span();
        if !self.expect(&TokenKind::LBrace, "'{' after the enum name") {
            self.synchronize();
            return None;
        }
        let mut variants = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.at_eof() {
            variants.push(self.expect_identifier("a variant name"));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect_closer(&TokenKind::RBrace, "'}' after enum variants", open_span);
        Some(EnumDecl { name, variants })
    }

    fn parse_import_decl(&mut self) -> Option<ImportDecl> {
        self.bump(); // import
        let mut path = vec![self.expect_identifier("a module path")];
        while self.eat(&TokenKind::Dot) {
            path.push(self.expect_identifier("a module path segment"));
        }
        let alias = if self.eat(&TokenKind::KwAs) {
            Some(self.expect_identifier("an alias name"))
        } else {
            None
        };
        let filter = if self.eat(&TokenKind::KwShow) {
            Some(ImportFilter::Show(self.parse_name_list()))
        } else if self.eat(&TokenKind::KwHide) {
            Some(ImportFilter::Hide(self.parse_name_list()))
        } else {
            None
        };
        if !self.expect(&TokenKind::Semicolon, "';' after import") {
            self.synchronize();
        }
        Some(ImportDecl {
            path,
            alias,
            filter,
        })
    }

    fn parse_name_list(&mut self) -> Vec<String> {
        let mut names = vec![self.expect_identifier("a name")];
        while self.eat(&TokenKind::Comma) {
            names.push(self.expect_identifier("a name"));
        }
        names
    }

    // ----- statements -----

    fn parse_block(&mut self) -> Option<Block> {
        self.open(SyntaxKind::Block);
        let open_span = self.cur_span();
        let start = open_span.start;
        if !self.expect(&TokenKind::LBrace, "'{'") {
            self.close();
            return None;
        }
        let mut stmts = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.at_eof() {
            let before = self.pos;
            if let Some(stmt) = self.parse_stmt() {
                stmts.push(stmt);
            }
            if self.pos == before {
                self.bump();
            }
        }
        self.expect_closer(&TokenKind::RBrace, "'}' to close the block", open_span);
        self.close();
        Some(Block {
            id: self.id(),
            span: self.span_from(start),
            stmts,
        })
    }

    fn parse_stmt(&mut self) -> Option<Stmt> {
        let start = self.cur_span().start;
        let kind = match &self.peek().kind {
            TokenKind::KwVar => {
                self.open(SyntaxKind::VarDecl);
                let decl = self.parse_var_decl();
                self.close();
                StmtKind::Var(decl)
            }
            TokenKind::KwFn => {
                self.open(SyntaxKind::FnDecl);
                let decl = self.parse_fn_decl(false);
                self.close();
                StmtKind::Fn(decl?.0)
            }
            TokenKind::KwIf => self.parse_if_stmt()?,
            TokenKind::KwWhile => {
                self.open(SyntaxKind::WhileStmt);
                self.bump();
                self.expect(&TokenKind::LParen, "'(' after 'while'");
                let cond = self.parse_expr();
                self.expect(&TokenKind::RParen, "')' after the loop condition");
                let body = self.parse_block();
                self.close();
                StmtKind::While { cond, body: body? }
            }
            TokenKind::KwFor => self.parse_for_stmt()?,
            TokenKind::KwIter => {
                self.open(SyntaxKind::IterStmt);
                self.bump();
                self.expect(&TokenKind::LParen, "'(' after 'iter'");
                let binding = self.expect_identifier("a loop binding");
                self.expect(&TokenKind::KwIn, "'in' in iter statement");
                let iterable = self.parse_expr();
                self.expect(&TokenKind::RParen, "')' after the iterated expression");
                let body = self.parse_block();
                self.close();
                StmtKind::Iter {
                    binding,
                    iterable,
                    body: body?,
                }
            }
            TokenKind::KwLoop => {
                self.open(SyntaxKind::LoopStmt);
                self.bump();
                let body = self.parse_block();
                self.close();
                StmtKind::Loop { body: body? }
            }
            TokenKind::KwReturn => {
                self.open(SyntaxKind::ReturnStmt);
                self.bump();
                let value = if self.at(&TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr())
                };
                if !self.expect(&TokenKind::Semicolon, "';' after return") {
                    self.synchronize();
                }
                self.close();
                StmtKind::Return(value)
            }
            TokenKind::KwBreak => {
                self.open(SyntaxKind::BreakStmt);
                self.bump();
                self.expect(&TokenKind::Semicolon, "';' after break");
                self.close();
                StmtKind::Break
            }
            TokenKind::KwContinue => {
                self.open(SyntaxKind::ContinueStmt);
                self.bump();
                self.expect(&TokenKind::Semicolon, "';' after continue");
                self.close();
                StmtKind::Continue
            }
            TokenKind::KwParallel => {
                self.open(SyntaxKind::ParallelStmt);
                self.bump();
                let body = self.parse_block();
                self.close();
                StmtKind::Parallel(body?)
            }
            TokenKind::KwConcurrent => {
                self.open(SyntaxKind::ConcurrentStmt);
                self.bump();
                let body = self.parse_block();
                self.close();
                StmtKind::Concurrent(body?)
            }
            TokenKind::KwTask => {
                self.open(SyntaxKind::TaskStmt);
                self.bump();
                let body = self.parse_block();
                self.close();
                StmtKind::Task(body?)
            }
            TokenKind::LBrace => StmtKind::Block(self.parse_block()?),
            _ => {
                self.open(SyntaxKind::ExprStmt);
                let expr = self.parse_expr();
                // match-as-statement reads naturally without ';'
                let needs_semi = !matches!(expr.kind, ExprKind::Match(_));
                if needs_semi && !self.expect(&TokenKind::Semicolon, "';' after expression") {
                    self.synchronize();
                } else if !needs_semi {
                    self.eat(&TokenKind::Semicolon);
                }
                self.close();
                StmtKind::Expr(expr)
            }
        };
        Some(Stmt {
            id: self.id(),
            span: self.span_from(start),
            kind,
        })
    }

    fn parse_if_stmt(&mut self) -> Option<StmtKind> {
        self.open(SyntaxKind::IfStmt);
        self.bump(); // if
        self.expect(&TokenKind::LParen, "'(' after 'if'");
        let cond = self.parse_expr();
        self.expect(&TokenKind::RParen, "')' after the condition");
        let then_block = self.parse_block();
        let else_block = if self.eat(&TokenKind::KwElse) {
            if self.at(&TokenKind::KwIf) {
                let start = self.cur_span().start;
                let kind = self.parse_if_stmt();
                kind.map(|kind| {
                    Box::new(Stmt {
                        id: self.id(),
                        span: self.span_from(start),
                        kind,
                    })
                })
            } else {
                let start = self.cur_span().start;
                self.parse_block().map(|block| {
                    Box::new(Stmt {
                        id: self.id(),
                        span: self.span_from(start),
                        kind: StmtKind::Block(block),
                    })
                })
            }
        } else {
            None
        };
        self.close();
        Some(StmtKind::If {
            cond,
            then_block: then_block?,
            else_block,
        })
    }

    fn parse_for_stmt(&mut self) -> Option<StmtKind> {
        self.open(SyntaxKind::ForStmt);
        self.bump(); // for
        self.expect(&TokenKind::LParen, "'(' after 'for'");

        let init = if self.eat(&TokenKind::Semicolon) {
            None
        } else if self.at(&TokenKind::KwVar) {
            let start = self.cur_span().start;
            self.open(SyntaxKind::VarDecl);
            let decl = self.parse_var_decl();
            self.close();
            Some(Box::new(Stmt {
                id: self.id(),
                span: self.span_from(start),
                kind: StmtKind::Var(decl),
            }))
        } else {
            let start = self.cur_span().start;
            let expr = self.parse_expr();
            self.expect(&TokenKind::Semicolon, "';' after the for-initializer");
            Some(Box::new(Stmt {
                id: self.id(),
                span: self.span_from(start),
                kind: StmtKind::Expr(expr),
            }))
        };

        let cond = if self.at(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expr())
        };
        self.expect(&TokenKind::Semicolon, "';' after the for-condition");

        let step = if self.at(&TokenKind::RParen) {
            None
        } else {
            Some(self.parse_expr())
        };
        self.expect(&TokenKind::RParen, "')' after the for-step");

        let body = self.parse_block();
        self.close();
        Some(StmtKind::For {
            init,
            cond,
            step,
            body: body?,
        })
    }

    // ----- expressions -----

    pub fn parse_expr(&mut self) -> Expr {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let lhs = self.parse_recover();
        let op = match &self.peek().kind {
            TokenKind::Eq => AssignOp::Assign,
            TokenKind::PlusEq => AssignOp::AddAssign,
            TokenKind::MinusEq => AssignOp::SubAssign,
            _ => return lhs,
        };
        self.bump();
        let value = self.parse_assign();
        if !matches!(
            lhs.kind,
            ExprKind::Name(_) | ExprKind::Member { .. } | ExprKind::Index { .. }
        ) {
            self.sink.push(
                Diagnostic::error(
                    codes::INVALID_EXPRESSION,
                    Stage::Parsing,
                    "invalid assignment target",
                )
                .at(self.file, lhs.span)
                .with_hint("only names, members, and index expressions can be assigned to"),
            );
        }
        let span = lhs.span.to(value.span);
        self.wrap(checkpoint, SyntaxKind::AssignExpr);
        Expr {
            id: self.id(),
            span,
            kind: ExprKind::Assign {
                op,
                target: Box::new(lhs),
                value: Box::new(value),
            },
        }
    }

    fn parse_recover(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let mut expr = self.parse_or();
        while self.at(&TokenKind::Question) && self.nth(1).kind == TokenKind::KwElse {
            self.bump(); // ?
            self.bump(); // else
            let binding = if self.at(&TokenKind::Identifier) {
                Some(self.expect_identifier("an error binding"))
            } else {
                None
            };
            let handler = match self.parse_block() {
                Some(block) => block,
                None => break,
            };
            let span = expr.span.to(handler.span);
            self.wrap(checkpoint, SyntaxKind::RecoverExpr);
            expr = Expr {
                id: self.id(),
                span,
                kind: ExprKind::Recover {
                    expr: Box::new(expr),
                    binding,
                    handler,
                },
            };
        }
        expr
    }

    fn parse_or(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let mut lhs = self.parse_and();
        while self.at(&TokenKind::KwOr) {
            self.bump();
            let rhs = self.parse_and();
            lhs = self.make_binary(checkpoint, BinaryOp::Or, lhs, rhs);
        }
        lhs
    }

    fn parse_and(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let mut lhs = self.parse_not();
        while self.at(&TokenKind::KwAnd) {
            self.bump();
            let rhs = self.parse_not();
            lhs = self.make_binary(checkpoint, BinaryOp::And, lhs, rhs);
        }
        lhs
    }

    fn parse_not(&mut self) -> Expr {
        if self.at(&TokenKind::KwNot) {
            let checkpoint = self.checkpoint();
            let start = self.cur_span().start;
            self.bump();
            let operand = self.parse_not();
            let span = self.span_from(start);
            self.wrap(checkpoint, SyntaxKind::UnaryExpr);
            return Expr {
                id: self.id(),
                span,
                kind: ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
            };
        }
        self.parse_equality()
    }

    fn parse_equality(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let mut lhs = self.parse_comparison();
        loop {
            let op = match &self.peek().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::BangEq => BinaryOp::Ne,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_comparison();
            lhs = self.make_binary(checkpoint, op, lhs, rhs);
        }
        lhs
    }

    fn parse_comparison(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let mut lhs = self.parse_range();
        loop {
            let op = match &self.peek().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_range();
            lhs = self.make_binary(checkpoint, op, lhs, rhs);
        }
        lhs
    }

    fn parse_range(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let lo = self.parse_additive();
        if self.at(&TokenKind::DotDot) {
            self.bump();
            let hi = self.parse_additive();
            let span = lo.span.to(hi.span);
            self.wrap(checkpoint, SyntaxKind::RangeExpr);
            return Expr {
                id: self.id(),
                span,
                kind: ExprKind::Range {
                    lo: Box::new(lo),
                    hi: Box::new(hi),
                },
            };
        }
        lo
    }

    fn parse_additive(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let mut lhs = self.parse_multiplicative();
        loop {
            let op = match &self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative();
            lhs = self.make_binary(checkpoint, op, lhs, rhs);
        }
        lhs
    }

    fn parse_multiplicative(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let mut lhs = self.parse_power();
        loop {
            let op = match &self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_power();
            lhs = self.make_binary(checkpoint, op, lhs, rhs);
        }
        lhs
    }

    fn parse_power(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let lhs = self.parse_unary();
        if self.at(&TokenKind::StarStar) {
            self.bump();
            // Right-associative
            let rhs = self.parse_power();
            return self.make_binary(checkpoint, BinaryOp::Pow, lhs, rhs);
        }
        lhs
    }

    fn parse_unary(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let start = self.cur_span().start;
        if self.at(&TokenKind::Minus) {
            self.bump();
            let operand = self.parse_unary();
            let span = self.span_from(start);
            self.wrap(checkpoint, SyntaxKind::UnaryExpr);
            return Expr {
                id: self.id(),
                span,
                kind: ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
            };
        }
        if self.at(&TokenKind::KwAwait) {
            self.bump();
            let operand = self.parse_unary();
            let span = self.span_from(start);
            self.wrap(checkpoint, SyntaxKind::AwaitExpr);
            return Expr {
                id: self.id(),
                span,
                kind: ExprKind::Await(Box::new(operand)),
            };
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let mut expr = self.parse_primary();
        loop {
            match &self.peek().kind {
                TokenKind::LParen => {
                    let args = self.parse_args();
                    let span = self.span_from(expr.span.start);
                    self.wrap(checkpoint, SyntaxKind::CallExpr);
                    expr = Expr {
                        id: self.id(),
                        span,
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                    };
                }
                TokenKind::LBracket => {
                    let open_span = self.cur_span();
                    self.bump();
                    let index = self.parse_expr();
                    self.expect_closer(&TokenKind::RBracket, "']' after index", open_span);
                    let span = self.span_from(expr.span.start);
                    self.wrap(checkpoint, SyntaxKind::IndexExpr);
                    expr = Expr {
                        id: self.id(),
                        span,
                        kind: ExprKind::Index {
                            obj: Box::new(expr),
                            index: Box::new(index),
                        },
                    };
                }
                TokenKind::Dot => {
                    self.bump();
                    let name = self.expect_identifier("a member name");
                    let span = self.span_from(expr.span.start);
                    self.wrap(checkpoint, SyntaxKind::MemberExpr);
                    expr = Expr {
                        id: self.id(),
                        span,
                        kind: ExprKind::Member {
                            obj: Box::new(expr),
                            name,
                        },
                    };
                }
                TokenKind::Question if self.nth(1).kind != TokenKind::KwElse => {
                    self.bump();
                    let span = self.span_from(expr.span.start);
                    self.wrap(checkpoint, SyntaxKind::PropagateExpr);
                    expr = Expr {
                        id: self.id(),
                        span,
                        kind: ExprKind::Propagate(Box::new(expr)),
                    };
                }
                _ => break,
            }
        }
        expr
    }

    fn parse_args(&mut self) -> Vec<Expr> {
        let open_span = self.cur_span();
        self.bump(); // (
        let mut args = Vec::new();
        while !self.at(&TokenKind::RParen) && !self.at_eof() {
            args.push(self.parse_expr());
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect_closer(&TokenKind::RParen, "')' after arguments", open_span);
        args
    }

    fn parse_primary(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let start = self.cur_span().start;
        let token = self.peek().clone();

        let kind = match &token.kind {
            TokenKind::Int(value) => {
                let value = *value;
                self.bump();
                self.wrap(checkpoint, SyntaxKind::LiteralExpr);
                ExprKind::Int(value)
            }
            TokenKind::Float(value) => {
                let value = *value;
                self.bump();
                self.wrap(checkpoint, SyntaxKind::LiteralExpr);
                ExprKind::Float(value)
            }
            TokenKind::KwTrue => {
                self.bump();
                self.wrap(checkpoint, SyntaxKind::LiteralExpr);
                ExprKind::Bool(true)
            }
            TokenKind::KwFalse => {
                self.bump();
                self.wrap(checkpoint, SyntaxKind::LiteralExpr);
                ExprKind::Bool(false)
            }
            TokenKind::KwNil => {
                self.bump();
                self.wrap(checkpoint, SyntaxKind::LiteralExpr);
                ExprKind::Nil
            }
            TokenKind::StringStart => return self.parse_string(),
            TokenKind::Identifier => {
                // `ok(...)` / `err(...)` are the optional/error constructors
                if (token.lexeme == "ok" || token.lexeme == "err")
                    && self.nth(1).kind == TokenKind::LParen
                {
                    let is_ok = token.lexeme == "ok";
                    self.bump(); // ok / err
                    let args = self.parse_args();
                    let span = self.span_from(start);
                    if args.len() > 1 {
                        self.sink.push(
                            Diagnostic::error(
                                codes::INVALID_EXPRESSION,
                                Stage::Parsing,
                                format!(
                                    "'{}' takes at most one argument",
                                    if is_ok { "ok" } else { "err" }
                                ),
                            )
                            .at(self.file, span),
                        );
                    }
                    let payload = args.into_iter().next().map(Box::new);
                    self.wrap(
                        checkpoint,
                        if is_ok {
                            SyntaxKind::OkExpr
                        } else {
                            SyntaxKind::ErrExpr
                        },
                    );
                    return Expr {
                        id: self.id(),
                        span,
                        kind: if is_ok {
                            ExprKind::Ok(payload)
                        } else {
                            ExprKind::Err(payload)
                        },
                    };
                }
                self.bump();
                self.wrap(checkpoint, SyntaxKind::NameExpr);
                ExprKind::Name(token.lexeme.clone())
            }
            TokenKind::KwSelf => {
                self.bump();
                self.wrap(checkpoint, SyntaxKind::NameExpr);
                ExprKind::SelfRef
            }
            TokenKind::KwSuper => {
                self.bump();
                self.expect(&TokenKind::Dot, "'.' after 'super'");
                let method = self.expect_identifier("a method name");
                let args = if self.at(&TokenKind::LParen) {
                    self.parse_args()
                } else {
                    self.sink.push(
                        Diagnostic::error(
                            codes::UNEXPECTED_TOKEN,
                            Stage::Parsing,
                            "'super' is only valid as a method call: super.method(...)",
                        )
                        .at(self.file, token.span),
                    );
                    Vec::new()
                };
                self.wrap(checkpoint, SyntaxKind::SuperExpr);
                ExprKind::SuperCall { method, args }
            }
            TokenKind::LParen => {
                let open_span = self.cur_span();
                self.bump();
                let inner = self.parse_expr();
                self.expect_closer(&TokenKind::RParen, "')' to close the group", open_span);
                self.wrap(checkpoint, SyntaxKind::GroupExpr);
                return inner;
            }
            TokenKind::LBracket => {
                let open_span = self.cur_span();
                self.bump();
                let mut elements = Vec::new();
                while !self.at(&TokenKind::RBracket) && !self.at_eof() {
                    elements.push(self.parse_expr());
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect_closer(&TokenKind::RBracket, "']' to close the list", open_span);
                self.wrap(checkpoint, SyntaxKind::ListExpr);
                ExprKind::List(elements)
            }
            TokenKind::LBrace => {
                let open_span = self.cur_span();
                self.bump();
                let mut entries = Vec::new();
                while !self.at(&TokenKind::RBrace) && !self.at_eof() {
                    let key = self.parse_expr();
                    self.expect(&TokenKind::Colon, "':' between dict key and value");
                    let value = self.parse_expr();
                    entries.push((key, value));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect_closer(&TokenKind::RBrace, "'}' to close the dict", open_span);
                self.wrap(checkpoint, SyntaxKind::DictExpr);
                ExprKind::Dict(entries)
            }
            TokenKind::KwMatch => return self.parse_match(),
            _ => {
                self.sink.push(
                    Diagnostic::error(
                        codes::INVALID_EXPRESSION,
                        Stage::Parsing,
                        format!("expected an expression, found '{}'", describe(&token)),
                    )
                    .at(self.file, token.span),
                );
                // Swallow the offending token so the caller makes progress
                if !self.at_eof() && !starts_statement(&token.kind) && token.kind != TokenKind::RBrace
                {
                    self.open(SyntaxKind::Error);
                    self.bump();
                    self.close();
                }
                ExprKind::Nil
            }
        };
        Expr {
            id: self.id(),
            span: self.span_from(start),
            kind,
        }
    }

    /// Parse a full string literal: plain text collapses to `Str`,
    /// anything with holes becomes `Interp`.
    fn parse_string(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let open_span = self.cur_span();
        let start = open_span.start;
        self.bump(); // StringStart
        let mut parts: Vec<InterpPart> = Vec::new();
        let mut has_interp = false;
        loop {
            match &self.peek().kind {
                TokenKind::StringText(value) => {
                    let value = value.clone();
                    self.bump();
                    parts.push(InterpPart::Text(value));
                }
                TokenKind::InterpStart => {
                    has_interp = true;
                    self.bump();
                    let expr = self.parse_expr();
                    self.expect_closer(
                        &TokenKind::InterpEnd,
                        "'}' to close the interpolation",
                        open_span,
                    );
                    parts.push(InterpPart::Expr(expr));
                }
                TokenKind::StringEnd => {
                    self.bump();
                    break;
                }
                _ => {
                    // Unterminated string; the scanner already reported it
                    if self.at(&TokenKind::Error) {
                        self.bump();
                    }
                    break;
                }
            }
        }
        self.wrap(checkpoint, SyntaxKind::StringExpr);
        let span = self.span_from(start);
        let kind = if has_interp {
            ExprKind::Interp(parts)
        } else {
            let text = parts
                .into_iter()
                .map(|part| match part {
                    InterpPart::Text(text) => text,
                    InterpPart::Expr(_) => unreachable!("no holes in a plain string"),
                })
                .collect::<String>();
            ExprKind::Str(text)
        };
        Expr {
            id: self.id(),
            span,
            kind,
        }
    }

    fn parse_match(&mut self) -> Expr {
        let checkpoint = self.checkpoint();
        let start = self.cur_span().start;
        self.bump(); // match
        let scrutinee = self.parse_expr();
        let open_span = self.cur_span();
        self.expect(&TokenKind::LBrace, "'{' after the match scrutinee");
        let mut arms = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.at_eof() {
            self.open(SyntaxKind::MatchArm);
            let arm_start = self.cur_span().start;
            let pattern = self.parse_pattern();
            let guard = if self.eat(&TokenKind::KwWhere) {
                Some(self.parse_expr())
            } else {
                None
            };
            self.expect(&TokenKind::FatArrow, "'=>' after the pattern");
            let body = if self.at(&TokenKind::LBrace) {
                match self.parse_block() {
                    Some(block) => ArmBody::Block(block),
                    None => {
                        self.close();
                        break;
                    }
                }
            } else {
                ArmBody::Expr(self.parse_expr())
            };
            arms.push(MatchArm {
                id: self.id(),
                span: self.span_from(arm_start),
                pattern,
                guard,
                body,
            });
            self.close();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect_closer(&TokenKind::RBrace, "'}' to close the match", open_span);
        self.wrap(checkpoint, SyntaxKind::MatchExpr);
        Expr {
            id: self.id(),
            span: self.span_from(start),
            kind: ExprKind::Match(Box::new(MatchExpr { scrutinee, arms })),
        }
    }

    fn parse_pattern(&mut self) -> Pattern {
        self.open(SyntaxKind::Pattern);
        let start = self.cur_span().start;
        let token = self.peek().clone();
        let kind = match &token.kind {
            TokenKind::Int(value) => {
                let value = *value;
                self.bump();
                PatternKind::Int(value)
            }
            TokenKind::KwTrue => {
                self.bump();
                PatternKind::Bool(true)
            }
            TokenKind::KwFalse => {
                self.bump();
                PatternKind::Bool(false)
            }
            TokenKind::StringStart => {
                let expr = self.parse_string();
                match expr.kind {
                    ExprKind::Str(text) => PatternKind::Str(text),
                    _ => {
                        self.sink.push(
                            Diagnostic::error(
                                codes::INVALID_EXPRESSION,
                                Stage::Parsing,
                                "string patterns cannot contain interpolation",
                            )
                            .at(self.file, expr.span),
                        );
                        PatternKind::Wildcard
                    }
                }
            }
            TokenKind::Identifier if token.lexeme == "_" => {
                self.bump();
                PatternKind::Wildcard
            }
            TokenKind::Identifier => {
                let name = token.lexeme.clone();
                self.bump();
                let starts_upper = name.chars().next().is_some_and(|c| c.is_uppercase());
                if starts_upper {
                    let mut bindings = Vec::new();
                    if self.at(&TokenKind::LParen) {
                        let open_span = self.cur_span();
                        self.bump();
                        while !self.at(&TokenKind::RParen) && !self.at_eof() {
                            bindings.push(self.expect_identifier("a binding name"));
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                        self.expect_closer(
                            &TokenKind::RParen,
                            "')' after pattern bindings",
                            open_span,
                        );
                    }
                    PatternKind::Variant { name, bindings }
                } else {
                    PatternKind::Binding(name)
                }
            }
            _ => {
                self.sink.push(
                    Diagnostic::error(
                        codes::UNEXPECTED_TOKEN,
                        Stage::Parsing,
                        format!("expected a pattern, found '{}'", describe(&token)),
                    )
                    .at(self.file, token.span),
                );
                self.bump();
                PatternKind::Wildcard
            }
        };
        self.close();
        Pattern {
            span: self.span_from(start),
            kind,
        }
    }

    // ----- types -----

    pub fn parse_type(&mut self) -> TypeExpr {
        let checkpoint = self.checkpoint();
        let start = self.cur_span().start;
        let first = self.parse_type_postfix();
        let ty = if self.at(&TokenKind::Pipe) {
            let mut parts = vec![first];
            while self.eat(&TokenKind::Pipe) {
                parts.push(self.parse_type_postfix());
            }
            TypeExpr {
                span: self.span_from(start),
                kind: TypeExprKind::Union(parts),
            }
        } else {
            first
        };
        self.wrap(checkpoint, SyntaxKind::TypeExpr);
        ty
    }

    fn parse_type_postfix(&mut self) -> TypeExpr {
        let start = self.cur_span().start;
        let mut ty = self.parse_type_primary();
        loop {
            if self.at(&TokenKind::Question) && self.nth(1).kind != TokenKind::KwElse {
                self.bump();
                // `T?E`: an error type follows directly when the next
                // token can start one. `{` never does: it opens a body.
                let err = if self.type_starts_here() {
                    Some(Box::new(self.parse_type_postfix()))
                } else {
                    None
                };
                ty = TypeExpr {
                    span: self.span_from(start),
                    kind: TypeExprKind::Optional {
                        inner: Box::new(ty),
                        err,
                    },
                };
                continue;
            }
            if self.at(&TokenKind::DotDot) {
                self.bump();
                // `T..T`: the element type is given by the bounds
                let _hi = self.parse_type_primary();
                ty = TypeExpr {
                    span: self.span_from(start),
                    kind: TypeExprKind::Range(Box::new(ty)),
                };
                continue;
            }
            break;
        }
        ty
    }

    fn type_starts_here(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Identifier
                | TokenKind::KwNil
                | TokenKind::KwFn
                | TokenKind::LBracket
                | TokenKind::LParen
        )
    }

    fn parse_type_primary(&mut self) -> TypeExpr {
        let start = self.cur_span().start;
        let token = self.peek().clone();
        let kind = match &token.kind {
            TokenKind::Identifier if token.lexeme == "Self" => {
                self.bump();
                TypeExprKind::SelfType
            }
            TokenKind::Identifier => {
                let name = token.lexeme.clone();
                self.bump();
                if self.eat(&TokenKind::ColonColon) {
                    let member = self.expect_identifier("a type name");
                    TypeExprKind::Qualified {
                        module: name,
                        name: member,
                    }
                } else if self.at(&TokenKind::LBracket) {
                    // `Name[T, ...]`: generics parse but stay unchecked
                    let open_span = self.cur_span();
                    self.bump();
                    let mut args = Vec::new();
                    while !self.at(&TokenKind::RBracket) && !self.at_eof() {
                        args.push(self.parse_type());
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect_closer(
                        &TokenKind::RBracket,
                        "']' after type arguments",
                        open_span,
                    );
                    TypeExprKind::Generic { name, args }
                } else {
                    TypeExprKind::Name(name)
                }
            }
            TokenKind::KwNil => {
                self.bump();
                TypeExprKind::Name("nil".to_string())
            }
            TokenKind::KwFn => {
                self.bump();
                let open_span = self.cur_span();
                self.expect(&TokenKind::LParen, "'(' after 'fn' in a function type");
                let mut params = Vec::new();
                while !self.at(&TokenKind::RParen) && !self.at_eof() {
                    params.push(self.parse_type());
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect_closer(&TokenKind::RParen, "')' after parameter types", open_span);
                self.expect(&TokenKind::Colon, "':' before the result type");
                let result = Box::new(self.parse_type());
                TypeExprKind::Fn { params, result }
            }
            TokenKind::LBracket => {
                let open_span = self.cur_span();
                self.bump();
                let element = self.parse_type();
                self.expect_closer(&TokenKind::RBracket, "']' in list type", open_span);
                TypeExprKind::List(Box::new(element))
            }
            TokenKind::LBrace => {
                let open_span = self.cur_span();
                self.bump();
                let key = self.parse_type();
                self.expect(&TokenKind::Colon, "':' between dict key and value types");
                let value = self.parse_type();
                self.expect_closer(&TokenKind::RBrace, "'}' in dict type", open_span);
                TypeExprKind::Dict {
                    key: Box::new(key),
                    value: Box::new(value),
                }
            }
            TokenKind::LParen => {
                let open_span = self.cur_span();
                self.bump();
                let mut parts = Vec::new();
                while !self.at(&TokenKind::RParen) && !self.at_eof() {
                    parts.push(self.parse_type());
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect_closer(&TokenKind::RParen, "')' in tuple type", open_span);
                if parts.len() == 1 {
                    // Parenthesized grouping, not a 1-tuple
                    return parts.into_iter().next().unwrap();
                }
                TypeExprKind::Tuple(parts)
            }
            _ => {
                self.sink.push(
                    Diagnostic::error(
                        codes::MALFORMED_TYPE,
                        Stage::Parsing,
                        format!("expected a type, found '{}'", describe(&token)),
                    )
                    .at(self.file, token.span),
                );
                if !self.at_eof() && !starts_statement(&token.kind) {
                    self.bump();
                }
                TypeExprKind::Name("any".to_string())
            }
        };
        TypeExpr {
            span: self.span_from(start),
            kind,
        }
    }

    // ----- small helpers -----

    fn make_binary(
        &mut self,
        checkpoint: Option<Checkpoint>,
        op: BinaryOp,
        lhs: Expr,
        rhs: Expr,
    ) -> Expr {
        let span = lhs.span.to(rhs.span);
        self.wrap(checkpoint, SyntaxKind::BinaryExpr);
        Expr {
            id: self.id(),
            span,
            kind: ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        }
    }

    fn expect_identifier(&mut self, what: &str) -> String {
        if self.at(&TokenKind::Identifier) {
            let name = self.peek().lexeme.clone();
            self.bump();
            return name;
        }
        let token = self.peek().clone();
        self.sink.push(
            Diagnostic::error(
                codes::UNEXPECTED_TOKEN,
                Stage::Parsing,
                format!("expected {}, found '{}'", what, describe(&token)),
            )
            .at(self.file, token.span),
        );
        String::new()
    }
}

fn starts_statement(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::KwVar
            | TokenKind::KwFn
            | TokenKind::KwClass
            | TokenKind::KwIf
            | TokenKind::KwWhile
            | TokenKind::KwFor
            | TokenKind::KwIter
            | TokenKind::KwLoop
            | TokenKind::KwMatch
            | TokenKind::KwReturn
            | TokenKind::KwBreak
            | TokenKind::KwContinue
            | TokenKind::KwImport
            | TokenKind::KwType
            | TokenKind::KwEnum
            | TokenKind::KwParallel
            | TokenKind::KwConcurrent
            | TokenKind::KwTask
    )
}

fn describe(token: &Token) -> String {
    match &token.kind {
        TokenKind::Eof => "end of file".to_string(),
        TokenKind::StringStart | TokenKind::StringEnd => "\"".to_string(),
        TokenKind::StringText(_) => "string text".to_string(),
        _ if token.lexeme.is_empty() => format!("{:?}", token.kind),
        _ => token.lexeme.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{ScanMode, scan};
    use limit_core::diagnostics::DiagnosticSink;

    fn parse_mode(source: &str, mode: ScanMode) -> (ParseResult, DiagnosticSink) {
        let mut sink = DiagnosticSink::new();
        let tokens = scan(source, FileId(0), mode, &mut sink);
        let result = parse(tokens, FileId(0), "main", mode, &mut sink);
        (result, sink)
    }

    fn parse_ok(source: &str) -> Module {
        let (result, sink) = parse_mode(source, ScanMode::Legacy);
        assert!(
            !sink.has_errors(),
            "unexpected errors: {:?}",
            sink.iter().collect::<Vec<_>>()
        );
        result.module
    }

    #[test]
    fn test_var_decl_with_type_and_init() {
        let module = parse_ok("var name: str = \"World\";");
        assert_eq!(module.items.len(), 1);
        match &module.items[0].kind {
            ItemKind::Var(decl) => {
                assert_eq!(decl.name, "name");
                assert!(matches!(
                    decl.ty.as_ref().unwrap().kind,
                    TypeExprKind::Name(ref n) if n == "str"
                ));
                assert!(matches!(
                    decl.init.as_ref().unwrap().kind,
                    ExprKind::Str(ref s) if s == "World"
                ));
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_fn_decl_with_optional_return() {
        let module = parse_ok("fn to_int(s: str): int? { return err(); }");
        let decl = module.find_fn("to_int").unwrap();
        assert_eq!(decl.params.len(), 1);
        match &decl.return_ty.as_ref().unwrap().kind {
            TypeExprKind::Optional { inner, err } => {
                assert!(matches!(inner.kind, TypeExprKind::Name(ref n) if n == "int"));
                assert!(err.is_none());
            }
            other => panic!("expected optional type, got {:?}", other),
        }
    }

    #[test]
    fn test_error_union_type() {
        let module = parse_ok("fn f(): int?ParseError { return ok(1); }");
        let decl = module.find_fn("f").unwrap();
        match &decl.return_ty.as_ref().unwrap().kind {
            TypeExprKind::Optional { err, .. } => {
                assert!(matches!(
                    err.as_ref().unwrap().kind,
                    TypeExprKind::Name(ref n) if n == "ParseError"
                ));
            }
            other => panic!("expected optional type, got {:?}", other),
        }
    }

    #[test]
    fn test_union_type_annotation() {
        let module = parse_ok("var x: int | str | nil = nil;");
        match &module.items[0].kind {
            ItemKind::Var(decl) => match &decl.ty.as_ref().unwrap().kind {
                TypeExprKind::Union(parts) => assert_eq!(parts.len(), 3),
                other => panic!("expected union, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_precedence_arithmetic() {
        let module = parse_ok("var x: int = 1 + 2 * 3;");
        match &module.items[0].kind {
            ItemKind::Var(decl) => match &decl.init.as_ref().unwrap().kind {
                ExprKind::Binary { op, rhs, .. } => {
                    assert_eq!(*op, BinaryOp::Add);
                    assert!(matches!(
                        rhs.kind,
                        ExprKind::Binary { op: BinaryOp::Mul, .. }
                    ));
                }
                other => panic!("expected binary, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_power_right_associative() {
        let module = parse_ok("var x: int = 2 ** 3 ** 2;");
        match &module.items[0].kind {
            ItemKind::Var(decl) => match &decl.init.as_ref().unwrap().kind {
                ExprKind::Binary { op, rhs, .. } => {
                    assert_eq!(*op, BinaryOp::Pow);
                    assert!(matches!(
                        rhs.kind,
                        ExprKind::Binary { op: BinaryOp::Pow, .. }
                    ));
                }
                other => panic!("expected power, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_propagate_postfix() {
        let module = parse_ok("fn f(s: str): int? { var n: int = to_int(s)?; return ok(n); }");
        let decl = module.find_fn("f").unwrap();
        match &decl.body.stmts[0].kind {
            StmtKind::Var(var) => {
                assert!(matches!(
                    var.init.as_ref().unwrap().kind,
                    ExprKind::Propagate(_)
                ));
            }
            other => panic!("expected var stmt, got {:?}", other),
        }
    }

    #[test]
    fn test_recover_with_binding() {
        let module = parse_ok("var v: int = div(10, 0) ? else e { return 0; };");
        match &module.items[0].kind {
            ItemKind::Var(decl) => match &decl.init.as_ref().unwrap().kind {
                ExprKind::Recover { binding, .. } => {
                    assert_eq!(binding.as_deref(), Some("e"));
                }
                other => panic!("expected recover, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_interpolated_string() {
        let module = parse_ok("print(\"Hello, {name}!\");");
        match &module.items[0].kind {
            ItemKind::Stmt(stmt) => match &stmt.kind {
                StmtKind::Expr(expr) => match &expr.kind {
                    ExprKind::Call { args, .. } => match &args[0].kind {
                        ExprKind::Interp(parts) => {
                            assert_eq!(parts.len(), 3);
                            assert!(matches!(parts[0], InterpPart::Text(ref t) if t == "Hello, "));
                            assert!(matches!(parts[1], InterpPart::Expr(_)));
                            assert!(matches!(parts[2], InterpPart::Text(ref t) if t == "!"));
                        }
                        other => panic!("expected interp, got {:?}", other),
                    },
                    other => panic!("expected call, got {:?}", other),
                },
                other => panic!("expected expr stmt, got {:?}", other),
            },
            other => panic!("expected stmt item, got {:?}", other),
        }
    }

    #[test]
    fn test_match_statement() {
        let module = parse_ok(
            "match plus_two(\"10\") { Ok(v) => print(\"got {v}\"), Err => print(\"none\") }",
        );
        match &module.items[0].kind {
            ItemKind::Stmt(stmt) => match &stmt.kind {
                StmtKind::Expr(expr) => match &expr.kind {
                    ExprKind::Match(m) => {
                        assert_eq!(m.arms.len(), 2);
                        assert!(matches!(
                            m.arms[0].pattern.kind,
                            PatternKind::Variant { ref name, ref bindings }
                                if name == "Ok" && bindings == &["v".to_string()]
                        ));
                        assert!(matches!(
                            m.arms[1].pattern.kind,
                            PatternKind::Variant { ref name, ref bindings }
                                if name == "Err" && bindings.is_empty()
                        ));
                    }
                    other => panic!("expected match, got {:?}", other),
                },
                other => panic!("expected expr stmt, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_match_guard() {
        let module = parse_ok("match x { n where n > 0 => print(\"pos\"), _ => print(\"other\") }");
        match &module.items[0].kind {
            ItemKind::Stmt(stmt) => match &stmt.kind {
                StmtKind::Expr(expr) => match &expr.kind {
                    ExprKind::Match(m) => {
                        assert!(m.arms[0].guard.is_some());
                        assert!(matches!(m.arms[1].pattern.kind, PatternKind::Wildcard));
                    }
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_class_with_inheritance_and_visibility() {
        let module = parse_ok(
            "class K : Base { pub fn hi(): str { return \"hi\"; } var count: int = 0; }",
        );
        match &module.items[0].kind {
            ItemKind::Class(decl) => {
                assert_eq!(decl.name, "K");
                assert_eq!(decl.supers, vec!["Base".to_string()]);
                assert_eq!(decl.members.len(), 2);
                assert_eq!(decl.members[0].vis, Visibility::Public);
                assert!(matches!(decl.members[0].kind, ClassMemberKind::Method(_)));
                assert_eq!(decl.members[1].vis, Visibility::Private);
                assert!(matches!(decl.members[1].kind, ClassMemberKind::Field(_)));
            }
            other => panic!("expected class, got {:?}", other),
        }
    }

    #[test]
    fn test_abstract_method() {
        let module = parse_ok("class Shape { fn area(): float; }");
        match &module.items[0].kind {
            ItemKind::Class(decl) => {
                assert!(matches!(
                    decl.members[0].kind,
                    ClassMemberKind::AbstractMethod { .. }
                ));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_import_with_show() {
        let module = parse_ok("import a.b.c as util show helper, thing;");
        match &module.items[0].kind {
            ItemKind::Import(decl) => {
                assert_eq!(decl.path, vec!["a", "b", "c"]);
                assert_eq!(decl.alias.as_deref(), Some("util"));
                assert!(matches!(
                    decl.filter,
                    Some(ImportFilter::Show(ref names)) if names.len() == 2
                ));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_iter_statement() {
        let module = parse_ok("iter (x in items) { print(x.name()); }");
        match &module.items[0].kind {
            ItemKind::Stmt(stmt) => {
                assert!(matches!(stmt.kind, StmtKind::Iter { ref binding, .. } if binding == "x"));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_error_recovery_continues() {
        let (result, sink) = parse_mode("var = ;\nvar y: int = 2;", ScanMode::Legacy);
        assert!(sink.has_errors());
        // The second declaration still parses
        assert!(result.module.items.iter().any(|item| matches!(
            &item.kind,
            ItemKind::Var(decl) if decl.name == "y"
        )));
    }

    #[test]
    fn test_mode_parity() {
        let source = r#"
// example program
fn div(a: int, b: int): int? {
    if (b == 0) { return err(); }
    return ok(a / b);
}
var v: int = div(10, 0) ? else e { print("caught"); return 0; };
print(v);
match v { 0 => print("zero"), _ => print("other") }
iter (x in 1..5) { print("{x}"); }
"#;
        let (legacy, sink1) = parse_mode(source, ScanMode::Legacy);
        let (cst, sink2) = parse_mode(source, ScanMode::Cst);
        assert!(!sink1.has_errors());
        assert!(!sink2.has_errors());
        assert_eq!(legacy.module, cst.module);
        assert!(cst.cst.is_some());
    }

    #[test]
    fn test_cst_roundtrip() {
        let source = "  // leading\nfn f(a: int): int { return a + 1; }  /* tail */\n";
        let (result, sink) = parse_mode(source, ScanMode::Cst);
        assert!(!sink.has_errors());
        let pool = crate::trivia::TriviaPool::new();
        assert_eq!(result.cst.unwrap().reconstruct(&pool), source);
    }

    #[test]
    fn test_cst_roundtrip_with_parse_error() {
        let source = "var = ;\nvar y: int = 2;\n";
        let (result, _) = parse_mode(source, ScanMode::Cst);
        let pool = crate::trivia::TriviaPool::new();
        let cst = result.cst.unwrap();
        assert_eq!(cst.reconstruct(&pool), source);
    }
}
