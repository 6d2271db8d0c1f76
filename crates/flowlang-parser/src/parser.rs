//! Recursive-descent parser: token stream to AST.
//!
//! Declarations are line-oriented; newlines and commas both separate
//! elements inside record/list literals and branch/match bodies, while
//! newlines inside parentheses are ignored. Operator precedence, loosest to
//! tightest: `when`, `??`, `or`, `and`, `not`, comparisons, `+`, postfix
//! (field access, projection, call), primary.
//!
//! The parser reports the first syntactic error with its span and produces
//! no partial AST.

use crate::ast::{
    Annotation, CallArg, CallOption, CmpOp, Decl, Expr, ExprKind, InputDecl, InterpPart, Literal,
    MatchArm, Pipeline, TypeExpr, TypeExprKind,
};
use crate::error::ParseError;
use crate::span::Span;
use crate::token::{lex, RawPart, Tok, Token};

/// Parses a complete pipeline source.
pub fn parse(source: &str) -> Result<Pipeline, ParseError> {
    let tokens = lex(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.len(),
    };
    parser.parse_pipeline()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    // -------------------------------------------------------------------
    // Token helpers
    // -------------------------------------------------------------------

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + ahead).map(|t| &t.tok)
    }

    fn cur_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|t| t.span)
            .unwrap_or(Span::new(self.end, self.end))
    }

    fn prev_span(&self) -> Span {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|t| t.span)
            .unwrap_or(Span::new(self.end, self.end))
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<Span, ParseError> {
        if self.peek() == Some(&tok) {
            let span = self.cur_span();
            self.pos += 1;
            Ok(span)
        } else {
            Err(self.unexpected(&format!("expected {}", tok.describe())))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), ParseError> {
        match self.peek() {
            Some(Tok::Ident(name)) => {
                let name = name.clone();
                let span = self.cur_span();
                self.pos += 1;
                Ok((name, span))
            }
            _ => Err(self.unexpected("expected an identifier")),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let found = self
            .peek()
            .map_or("end of input".to_string(), Tok::describe);
        ParseError::new(self.cur_span(), format!("{expected}, found {found}"))
    }

    fn skip_newlines(&mut self) {
        while self.eat(&Tok::Newline) {}
    }

    /// Consumes a newline (or end of input) terminating a declaration.
    fn expect_line_end(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some(Tok::Newline) => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.unexpected("expected end of line")),
        }
    }

    /// A comma or newline separating elements inside braces/brackets.
    fn eat_separator(&mut self) -> bool {
        let mut any = false;
        while matches!(self.peek(), Some(Tok::Comma | Tok::Newline)) {
            self.pos += 1;
            any = true;
        }
        any
    }

    // -------------------------------------------------------------------
    // Declarations
    // -------------------------------------------------------------------

    fn parse_pipeline(&mut self) -> Result<Pipeline, ParseError> {
        let mut decls = Vec::new();
        let mut annotations: Vec<Annotation> = Vec::new();
        self.skip_newlines();
        while let Some(tok) = self.peek() {
            match tok {
                Tok::At => {
                    annotations.push(self.parse_annotation()?);
                }
                Tok::KwIn => {
                    let input = self.parse_input(std::mem::take(&mut annotations))?;
                    decls.push(Decl::Input(input));
                }
                _ => {
                    if let Some(annotation) = annotations.first() {
                        return Err(ParseError::new(
                            annotation.span,
                            "annotations must immediately precede an 'in' declaration",
                        ));
                    }
                    let decl = match tok {
                        Tok::KwOut => self.parse_output()?,
                        Tok::KwType => self.parse_typedef()?,
                        Tok::KwUse => self.parse_use()?,
                        Tok::Ident(_) => self.parse_assignment()?,
                        _ => return Err(self.unexpected("expected a declaration")),
                    };
                    decls.push(decl);
                }
            }
            self.skip_newlines();
        }
        if let Some(annotation) = annotations.first() {
            return Err(ParseError::new(
                annotation.span,
                "annotations must immediately precede an 'in' declaration",
            ));
        }
        Ok(Pipeline { decls })
    }

    fn parse_annotation(&mut self) -> Result<Annotation, ParseError> {
        let start = self.expect(Tok::At)?;
        let (name, _) = self.expect_ident()?;
        self.expect(Tok::LParen)?;
        let value = self.parse_expr()?;
        let close = self.expect(Tok::RParen)?;
        self.expect_line_end()?;
        self.skip_newlines();
        Ok(Annotation {
            name,
            value,
            span: start.merge(close),
        })
    }

    fn parse_input(&mut self, annotations: Vec<Annotation>) -> Result<InputDecl, ParseError> {
        let start = self.expect(Tok::KwIn)?;
        let (name, _) = self.expect_ident()?;
        self.expect(Tok::Colon)?;
        let ty = self.parse_type_expr()?;
        let span = start.merge(ty.span);
        self.expect_line_end()?;
        Ok(InputDecl {
            name,
            ty,
            annotations,
            span,
        })
    }

    fn parse_output(&mut self) -> Result<Decl, ParseError> {
        let start = self.expect(Tok::KwOut)?;
        let (name, name_span) = self.expect_ident()?;
        self.expect_line_end()?;
        Ok(Decl::Output {
            name,
            span: start.merge(name_span),
        })
    }

    fn parse_typedef(&mut self) -> Result<Decl, ParseError> {
        let start = self.expect(Tok::KwType)?;
        let (name, _) = self.expect_ident()?;
        self.expect(Tok::Assign)?;
        let ty = self.parse_type_expr()?;
        let span = start.merge(ty.span);
        self.expect_line_end()?;
        Ok(Decl::TypeDef { name, ty, span })
    }

    fn parse_use(&mut self) -> Result<Decl, ParseError> {
        let start = self.expect(Tok::KwUse)?;
        let (first, mut last_span) = self.expect_ident()?;
        let mut path = vec![first];
        while self.eat(&Tok::Dot) {
            let (segment, span) = self.expect_ident()?;
            path.push(segment);
            last_span = span;
        }
        let alias = if self.eat(&Tok::KwAs) {
            let (alias, span) = self.expect_ident()?;
            last_span = span;
            Some(alias)
        } else {
            None
        };
        self.expect_line_end()?;
        Ok(Decl::Use {
            path,
            alias,
            span: start.merge(last_span),
        })
    }

    fn parse_assignment(&mut self) -> Result<Decl, ParseError> {
        let (name, start) = self.expect_ident()?;
        self.expect(Tok::Assign)?;
        let expr = self.parse_expr()?;
        let span = start.merge(expr.span);
        self.expect_line_end()?;
        Ok(Decl::Assign { name, expr, span })
    }

    // -------------------------------------------------------------------
    // Types
    // -------------------------------------------------------------------

    fn parse_type_expr(&mut self) -> Result<TypeExpr, ParseError> {
        let first = self.parse_type_postfix()?;
        if self.peek() != Some(&Tok::Pipe) {
            return Ok(first);
        }
        let mut span = first.span;
        let mut members = vec![first];
        while self.eat(&Tok::Pipe) {
            let member = self.parse_type_postfix()?;
            span = span.merge(member.span);
            members.push(member);
        }
        Ok(TypeExpr {
            kind: TypeExprKind::Union(members),
            span,
        })
    }

    fn parse_type_postfix(&mut self) -> Result<TypeExpr, ParseError> {
        let mut ty = self.parse_type_primary()?;
        while self.peek() == Some(&Tok::Question) {
            let q = self.cur_span();
            self.pos += 1;
            let span = ty.span.merge(q);
            ty = TypeExpr {
                kind: TypeExprKind::Optional(Box::new(ty)),
                span,
            };
        }
        Ok(ty)
    }

    fn parse_type_primary(&mut self) -> Result<TypeExpr, ParseError> {
        match self.peek() {
            Some(Tok::Ident(name)) if name == "Map" => {
                let start = self.cur_span();
                self.pos += 1;
                self.expect(Tok::Lt)?;
                let key = self.parse_type_expr()?;
                self.expect(Tok::Comma)?;
                let value = self.parse_type_expr()?;
                let close = self.expect(Tok::Gt)?;
                Ok(TypeExpr {
                    kind: TypeExprKind::Map(Box::new(key), Box::new(value)),
                    span: start.merge(close),
                })
            }
            Some(Tok::Ident(_)) => {
                let (name, span) = self.expect_ident()?;
                Ok(TypeExpr {
                    kind: TypeExprKind::Named(name),
                    span,
                })
            }
            Some(Tok::LBracket) => {
                let start = self.cur_span();
                self.pos += 1;
                let element = self.parse_type_expr()?;
                let close = self.expect(Tok::RBracket)?;
                Ok(TypeExpr {
                    kind: TypeExprKind::List(Box::new(element)),
                    span: start.merge(close),
                })
            }
            Some(Tok::LParen) => {
                let start = self.cur_span();
                self.pos += 1;
                let mut inner = self.parse_type_expr()?;
                let close = self.expect(Tok::RParen)?;
                inner.span = start.merge(close);
                Ok(inner)
            }
            Some(Tok::LBrace) => {
                let start = self.cur_span();
                self.pos += 1;
                let mut fields = Vec::new();
                self.eat_separator();
                while self.peek() != Some(&Tok::RBrace) {
                    let (name, _) = self.expect_ident()?;
                    self.expect(Tok::Colon)?;
                    let ty = self.parse_type_expr()?;
                    fields.push((name, ty));
                    if !self.eat_separator() {
                        break;
                    }
                }
                let close = self.expect(Tok::RBrace)?;
                Ok(TypeExpr {
                    kind: TypeExprKind::Record(fields),
                    span: start.merge(close),
                })
            }
            _ => Err(self.unexpected("expected a type")),
        }
    }

    // -------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_when()
    }

    fn parse_when(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_coalesce()?;
        while self.eat(&Tok::KwWhen) {
            let cond = self.parse_coalesce()?;
            let span = expr.span.merge(cond.span);
            expr = Expr::new(
                ExprKind::When {
                    expr: Box::new(expr),
                    cond: Box::new(cond),
                },
                span,
            );
        }
        Ok(expr)
    }

    fn parse_coalesce(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_or()?;
        if self.eat(&Tok::QuestionQuestion) {
            let right = self.parse_coalesce()?;
            let span = left.span.merge(right.span);
            return Ok(Expr::new(
                ExprKind::Coalesce {
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            ));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Tok::KwOr) {
            let right = self.parse_and()?;
            let span = left.span.merge(right.span);
            left = Expr::new(
                ExprKind::Or {
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.eat(&Tok::KwAnd) {
            let right = self.parse_not()?;
            let span = left.span.merge(right.span);
            left = Expr::new(
                ExprKind::And {
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Tok::KwNot) {
            let start = self.cur_span();
            self.pos += 1;
            let operand = self.parse_not()?;
            let span = start.merge(operand.span);
            return Ok(Expr::new(ExprKind::Not(Box::new(operand)), span));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_merge()?;
        let op = match self.peek() {
            Some(Tok::EqEq) => Some(CmpOp::Eq),
            Some(Tok::NotEq) => Some(CmpOp::Ne),
            Some(Tok::Lt) => Some(CmpOp::Lt),
            Some(Tok::Gt) => Some(CmpOp::Gt),
            Some(Tok::Le) => Some(CmpOp::Le),
            Some(Tok::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        let Some(op) = op else { return Ok(left) };
        self.pos += 1;
        let right = self.parse_merge()?;
        let span = left.span.merge(right.span);
        Ok(Expr::new(
            ExprKind::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        ))
    }

    fn parse_merge(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_postfix()?;
        while self.eat(&Tok::Plus) {
            let right = self.parse_postfix()?;
            let span = left.span.merge(right.span);
            left = Expr::new(
                ExprKind::Merge {
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.pos += 1;
                    let (field, field_span) = self.expect_ident()?;
                    let span = expr.span.merge(field_span);
                    expr = Expr::new(
                        ExprKind::FieldAccess {
                            base: Box::new(expr),
                            field,
                        },
                        span,
                    );
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    let mut fields = Vec::new();
                    loop {
                        let (field, _) = self.expect_ident()?;
                        fields.push(field);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                    let close = self.expect(Tok::RBracket)?;
                    let span = expr.span.merge(close);
                    expr = Expr::new(
                        ExprKind::Project {
                            base: Box::new(expr),
                            fields,
                        },
                        span,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Tok::Int(_)) => {
                let span = self.cur_span();
                let Some(Token { tok: Tok::Int(value), .. }) = self.bump() else {
                    unreachable!()
                };
                // `count/duration` is a rate literal.
                if self.peek() == Some(&Tok::Slash) {
                    if let Some(Tok::Duration(per)) = self.peek_at(1) {
                        let per = *per;
                        self.pos += 2;
                        let full = span.merge(self.prev_span());
                        if value < 0 {
                            return Err(ParseError::new(full, "rate count must be non-negative"));
                        }
                        return Ok(Expr::new(
                            ExprKind::Literal(Literal::Rate {
                                count: value as u32,
                                per,
                            }),
                            full,
                        ));
                    }
                }
                Ok(Expr::new(ExprKind::Literal(Literal::Int(value)), span))
            }
            Some(Tok::Float(_)) => {
                let span = self.cur_span();
                let Some(Token { tok: Tok::Float(value), .. }) = self.bump() else {
                    unreachable!()
                };
                Ok(Expr::new(ExprKind::Literal(Literal::Float(value)), span))
            }
            Some(Tok::Duration(_)) => {
                let span = self.cur_span();
                let Some(Token { tok: Tok::Duration(value), .. }) = self.bump() else {
                    unreachable!()
                };
                Ok(Expr::new(ExprKind::Literal(Literal::Duration(value)), span))
            }
            Some(Tok::KwTrue) => {
                let span = self.cur_span();
                self.pos += 1;
                Ok(Expr::new(ExprKind::Literal(Literal::Bool(true)), span))
            }
            Some(Tok::KwFalse) => {
                let span = self.cur_span();
                self.pos += 1;
                Ok(Expr::new(ExprKind::Literal(Literal::Bool(false)), span))
            }
            Some(Tok::Str(_)) => self.parse_string(),
            Some(Tok::KwIf) => self.parse_if(),
            Some(Tok::KwBranch) => self.parse_branch(),
            Some(Tok::KwMatch) => self.parse_match(),
            Some(Tok::LBracket) => self.parse_list_literal(),
            Some(Tok::LBrace) => self.parse_record_literal(),
            Some(Tok::LParen) => {
                if self.lambda_ahead() {
                    self.parse_lambda()
                } else {
                    self.pos += 1;
                    self.skip_newlines();
                    let inner = self.parse_expr()?;
                    self.skip_newlines();
                    self.expect(Tok::RParen)?;
                    Ok(inner)
                }
            }
            Some(Tok::Ident(_)) => self.parse_path_or_call(),
            _ => Err(self.unexpected("expected an expression")),
        }
    }

    fn parse_string(&mut self) -> Result<Expr, ParseError> {
        let span = self.cur_span();
        let Some(Token { tok: Tok::Str(raw_parts), .. }) = self.bump() else {
            unreachable!()
        };
        if let [RawPart::Lit(text)] = raw_parts.as_slice() {
            return Ok(Expr::new(
                ExprKind::Literal(Literal::Str(text.clone())),
                span,
            ));
        }
        let mut parts = Vec::with_capacity(raw_parts.len());
        for part in raw_parts {
            match part {
                RawPart::Lit(text) => parts.push(InterpPart::Lit(text)),
                RawPart::Expr { text, offset } => {
                    let expr = parse_fragment(&text, offset)?;
                    parts.push(InterpPart::Expr(Box::new(expr)));
                }
            }
        }
        Ok(Expr::new(ExprKind::StringInterp(parts), span))
    }

    fn parse_if(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect(Tok::KwIf)?;
        let cond = self.parse_expr()?;
        self.expect(Tok::KwThen)?;
        let then_expr = self.parse_expr()?;
        self.expect(Tok::KwElse)?;
        let else_expr = self.parse_expr()?;
        let span = start.merge(else_expr.span);
        Ok(Expr::new(
            ExprKind::If {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            span,
        ))
    }

    fn parse_branch(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect(Tok::KwBranch)?;
        self.expect(Tok::LBrace)?;
        self.eat_separator();
        let mut arms = Vec::new();
        let mut otherwise = None;
        while self.peek() != Some(&Tok::RBrace) {
            if self.eat(&Tok::KwOtherwise) {
                self.expect(Tok::Arrow)?;
                let body = self.parse_expr()?;
                otherwise = Some(Box::new(body));
                self.eat_separator();
                break;
            }
            let cond = self.parse_expr()?;
            self.expect(Tok::Arrow)?;
            let body = self.parse_expr()?;
            arms.push((cond, body));
            if !self.eat_separator() {
                break;
            }
        }
        let close = self.expect(Tok::RBrace)?;
        let span = start.merge(close);
        let Some(otherwise) = otherwise else {
            return Err(ParseError::new(span, "branch requires an 'otherwise' arm"));
        };
        Ok(Expr::new(ExprKind::Branch { arms, otherwise }, span))
    }

    fn parse_match(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect(Tok::KwMatch)?;
        let scrutinee = self.parse_expr()?;
        self.expect(Tok::LBrace)?;
        self.eat_separator();
        let mut arms = Vec::new();
        while self.peek() != Some(&Tok::RBrace) {
            let (binding, arm_start) = self.expect_ident()?;
            self.expect(Tok::Colon)?;
            let ty = self.parse_type_expr()?;
            self.expect(Tok::Arrow)?;
            let body = self.parse_expr()?;
            let arm_span = arm_start.merge(body.span);
            arms.push(MatchArm {
                binding,
                ty,
                body,
                span: arm_span,
            });
            if !self.eat_separator() {
                break;
            }
        }
        let close = self.expect(Tok::RBrace)?;
        let span = start.merge(close);
        if arms.is_empty() {
            return Err(ParseError::new(span, "match requires at least one arm"));
        }
        Ok(Expr::new(
            ExprKind::Match {
                scrutinee: Box::new(scrutinee),
                arms,
            },
            span,
        ))
    }

    fn parse_list_literal(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect(Tok::LBracket)?;
        self.eat_separator();
        let mut items = Vec::new();
        while self.peek() != Some(&Tok::RBracket) {
            items.push(self.parse_expr()?);
            if !self.eat_separator() {
                break;
            }
        }
        let close = self.expect(Tok::RBracket)?;
        Ok(Expr::new(ExprKind::ListLit(items), start.merge(close)))
    }

    fn parse_record_literal(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect(Tok::LBrace)?;
        self.eat_separator();
        let mut fields = Vec::new();
        while self.peek() != Some(&Tok::RBrace) {
            let (name, _) = self.expect_ident()?;
            self.expect(Tok::Colon)?;
            let value = self.parse_expr()?;
            fields.push((name, value));
            if !self.eat_separator() {
                break;
            }
        }
        let close = self.expect(Tok::RBrace)?;
        Ok(Expr::new(ExprKind::RecordLit(fields), start.merge(close)))
    }

    /// Lookahead for `(params) =>` distinguishing a lambda from a
    /// parenthesized expression.
    fn lambda_ahead(&self) -> bool {
        let mut i = 1; // past '('
        if self.peek_at(i) == Some(&Tok::RParen) {
            return self.peek_at(i + 1) == Some(&Tok::FatArrow);
        }
        loop {
            match self.peek_at(i) {
                Some(Tok::Ident(_)) => i += 1,
                _ => return false,
            }
            if self.peek_at(i) == Some(&Tok::Colon) {
                // Skip a type annotation conservatively: scan to ',' or ')'
                // at depth zero.
                i += 1;
                let mut depth = 0usize;
                loop {
                    match self.peek_at(i) {
                        Some(Tok::LBrace | Tok::LBracket | Tok::LParen) => depth += 1,
                        Some(Tok::RBrace | Tok::RBracket) if depth > 0 => depth -= 1,
                        Some(Tok::RParen) => {
                            if depth == 0 {
                                break;
                            }
                            depth -= 1;
                        }
                        Some(Tok::Comma) if depth == 0 => break,
                        Some(_) => {}
                        None => return false,
                    }
                    i += 1;
                }
            }
            match self.peek_at(i) {
                Some(Tok::Comma) => i += 1,
                Some(Tok::RParen) => return self.peek_at(i + 1) == Some(&Tok::FatArrow),
                _ => return false,
            }
        }
    }

    fn parse_lambda(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect(Tok::LParen)?;
        let mut params = Vec::new();
        while self.peek() != Some(&Tok::RParen) {
            let (name, _) = self.expect_ident()?;
            let ty = if self.eat(&Tok::Colon) {
                Some(self.parse_type_expr()?)
            } else {
                None
            };
            params.push((name, ty));
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RParen)?;
        self.expect(Tok::FatArrow)?;
        let body = self.parse_expr()?;
        let span = start.merge(body.span);
        Ok(Expr::new(
            ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
            span,
        ))
    }

    /// Qualified name, optionally a call with arguments and a `with` clause.
    fn parse_path_or_call(&mut self) -> Result<Expr, ParseError> {
        let (first, start) = self.expect_ident()?;
        let mut path = vec![first];
        let mut end = start;
        // Greedily take `.ident` segments while a call may follow; plain
        // segments become field accesses if no '(' arrives.
        while self.peek() == Some(&Tok::Dot) {
            let Some(Tok::Ident(_)) = self.peek_at(1) else {
                break;
            };
            self.pos += 1;
            let (segment, span) = self.expect_ident()?;
            path.push(segment);
            end = span;
        }

        if self.peek() == Some(&Tok::LParen) {
            self.pos += 1;
            self.skip_newlines();
            let mut args = Vec::new();
            while self.peek() != Some(&Tok::RParen) {
                let arg_start = self.cur_span();
                let name = match (self.peek(), self.peek_at(1)) {
                    (Some(Tok::Ident(name)), Some(Tok::Colon)) => {
                        let name = name.clone();
                        self.pos += 2;
                        Some(name)
                    }
                    _ => None,
                };
                let value = self.parse_expr()?;
                let span = arg_start.merge(value.span);
                args.push(CallArg { name, value, span });
                self.skip_newlines();
                if !self.eat(&Tok::Comma) {
                    break;
                }
                self.skip_newlines();
            }
            let close = self.expect(Tok::RParen)?;
            let mut span = start.merge(close);

            let mut options = Vec::new();
            if self.eat(&Tok::KwWith) {
                loop {
                    let (key, key_span) = self.expect_ident()?;
                    self.expect(Tok::Colon)?;
                    let value = self.parse_expr()?;
                    let option_span = key_span.merge(value.span);
                    span = span.merge(option_span);
                    options.push(CallOption {
                        key,
                        value,
                        span: option_span,
                    });
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
            }
            return Ok(Expr::new(
                ExprKind::Call {
                    path,
                    args,
                    options,
                },
                span,
            ));
        }

        // Not a call: first segment is a variable, the rest field accesses.
        let mut segments = path.into_iter();
        let mut expr = Expr::new(ExprKind::Var(segments.next().unwrap()), start);
        for field in segments {
            let span = expr.span.merge(end);
            expr = Expr::new(
                ExprKind::FieldAccess {
                    base: Box::new(expr),
                    field,
                },
                span,
            );
        }
        Ok(expr)
    }
}

/// Parses an expression fragment carved out of a string interpolation;
/// `offset` re-anchors spans into the original source.
fn parse_fragment(text: &str, offset: usize) -> Result<Expr, ParseError> {
    let tokens = lex(text)?
        .into_iter()
        .map(|t| Token {
            tok: t.tok,
            span: t.span.offset(offset),
        })
        .collect();
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: offset + text.len(),
    };
    let expr = parser.parse_expr()?;
    if parser.peek().is_some() {
        return Err(parser.unexpected("expected end of interpolation"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn parse_one_expr(source: &str) -> Expr {
        let pipeline = parse(&format!("x = {source}")).unwrap();
        match pipeline.decls.into_iter().next().unwrap() {
            Decl::Assign { expr, .. } => expr,
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn parses_minimal_pipeline() {
        let pipeline = parse("in text: String\nresult = Uppercase(text)\nout result\n").unwrap();
        assert_eq!(pipeline.decls.len(), 3);
        assert!(matches!(&pipeline.decls[0], Decl::Input(i) if i.name == "text"));
        assert!(matches!(
            &pipeline.decls[1],
            Decl::Assign { name, .. } if name == "result"
        ));
        assert!(matches!(&pipeline.decls[2], Decl::Output { name, .. } if name == "result"));
    }

    #[test]
    fn call_arguments_positional_and_named() {
        let expr = parse_one_expr("Concat(a, right: b)");
        let ExprKind::Call { path, args, options } = expr.kind else {
            panic!("expected call");
        };
        assert_eq!(path, vec!["Concat"]);
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].name, None);
        assert_eq!(args[1].name.as_deref(), Some("right"));
        assert!(options.is_empty());
    }

    #[test]
    fn qualified_call_and_field_access_disambiguate() {
        let call = parse_one_expr("text.Upper(x)");
        assert!(matches!(
            call.kind,
            ExprKind::Call { ref path, .. } if path == &vec!["text".to_string(), "Upper".to_string()]
        ));

        let access = parse_one_expr("record.field");
        assert!(matches!(access.kind, ExprKind::FieldAccess { ref field, .. } if field == "field"));
    }

    #[test]
    fn with_clause_options() {
        let expr =
            parse_one_expr("Flaky(x) with retry: 3, delay: 1ms, backoff: exponential, fallback: \"d\"");
        let ExprKind::Call { options, .. } = expr.kind else {
            panic!("expected call");
        };
        let keys: Vec<&str> = options.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["retry", "delay", "backoff", "fallback"]);
        assert!(matches!(
            options[1].value.kind,
            ExprKind::Literal(Literal::Duration(d)) if d == Duration::from_millis(1)
        ));
        assert!(matches!(
            options[2].value.kind,
            ExprKind::Var(ref v) if v == "exponential"
        ));
    }

    #[test]
    fn rate_literal_in_options() {
        let expr = parse_one_expr("Fetch(u) with throttle: 10/1s");
        let ExprKind::Call { options, .. } = expr.kind else {
            panic!("expected call");
        };
        assert!(matches!(
            options[0].value.kind,
            ExprKind::Literal(Literal::Rate { count: 10, per }) if per == Duration::from_secs(1)
        ));
    }

    #[test]
    fn precedence_when_is_loosest() {
        let expr = parse_one_expr("Heavy(s) when length(s) > 3");
        let ExprKind::When { cond, .. } = expr.kind else {
            panic!("expected when, got {expr:?}");
        };
        assert!(matches!(cond.kind, ExprKind::Compare { op: CmpOp::Gt, .. }));
    }

    #[test]
    fn precedence_coalesce_over_or() {
        let expr = parse_one_expr("a ?? b or c");
        // `??` binds looser than `or`: a ?? (b or c)
        let ExprKind::Coalesce { right, .. } = expr.kind else {
            panic!("expected coalesce at the top");
        };
        assert!(matches!(right.kind, ExprKind::Or { .. }));
    }

    #[test]
    fn precedence_merge_over_compare() {
        let expr = parse_one_expr("a + b == c");
        let ExprKind::Compare { left, .. } = expr.kind else {
            panic!("expected compare at the top");
        };
        assert!(matches!(left.kind, ExprKind::Merge { .. }));
    }

    #[test]
    fn if_then_else() {
        let expr = parse_one_expr("if flag then 1 else 2");
        assert!(matches!(expr.kind, ExprKind::If { .. }));
    }

    #[test]
    fn branch_requires_otherwise() {
        assert!(parse("x = branch { a -> 1, otherwise -> 2 }\n").is_ok());
        let err = parse("x = branch { a -> 1 }\n").unwrap_err();
        assert!(err.message.contains("otherwise"));
    }

    #[test]
    fn branch_arms_split_on_newlines() {
        let source = "x = branch {\n  a -> 1\n  b -> 2\n  otherwise -> 3\n}\n";
        let expr = parse(source).unwrap();
        let Decl::Assign { expr, .. } = &expr.decls[0] else {
            panic!()
        };
        let ExprKind::Branch { arms, .. } = &expr.kind else {
            panic!("expected branch");
        };
        assert_eq!(arms.len(), 2);
    }

    #[test]
    fn match_arms_bind_and_annotate() {
        let source = "x = match u {\n  s: String -> s\n  n: Int -> \"n\"\n}\n";
        let pipeline = parse(source).unwrap();
        let Decl::Assign { expr, .. } = &pipeline.decls[0] else {
            panic!()
        };
        let ExprKind::Match { arms, .. } = &expr.kind else {
            panic!("expected match");
        };
        assert_eq!(arms.len(), 2);
        assert_eq!(arms[0].binding, "s");
        assert!(matches!(arms[0].ty.kind, TypeExprKind::Named(ref n) if n == "String"));
    }

    #[test]
    fn list_and_record_literals() {
        let list = parse_one_expr("[1, 2, 3]");
        assert!(matches!(list.kind, ExprKind::ListLit(ref items) if items.len() == 3));

        let record = parse_one_expr("{a: 1, b: \"x\"}");
        assert!(matches!(record.kind, ExprKind::RecordLit(ref fields) if fields.len() == 2));
    }

    #[test]
    fn multiline_literals_use_newline_separators() {
        let source = "x = {\n  a: 1\n  b: 2\n}\n";
        let pipeline = parse(source).unwrap();
        let Decl::Assign { expr, .. } = &pipeline.decls[0] else {
            panic!()
        };
        assert!(matches!(expr.kind, ExprKind::RecordLit(ref fields) if fields.len() == 2));
    }

    #[test]
    fn projection_postfix() {
        let expr = parse_one_expr("user[name, email]");
        let ExprKind::Project { fields, .. } = expr.kind else {
            panic!("expected projection");
        };
        assert_eq!(fields, vec!["name", "email"]);
    }

    #[test]
    fn lambda_forms() {
        let plain = parse_one_expr("(x) => x.score");
        assert!(matches!(plain.kind, ExprKind::Lambda { ref params, .. } if params.len() == 1));

        let annotated = parse_one_expr("(x: Int) => x");
        let ExprKind::Lambda { params, .. } = annotated.kind else {
            panic!("expected lambda");
        };
        assert!(params[0].1.is_some());

        // Parenthesized expression is not a lambda.
        let grouped = parse_one_expr("(x)");
        assert!(matches!(grouped.kind, ExprKind::Var(ref v) if v == "x"));
    }

    #[test]
    fn string_interpolation() {
        let expr = parse_one_expr(r#""hello ${name}!""#);
        let ExprKind::StringInterp(parts) = expr.kind else {
            panic!("expected interpolation");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(
            &parts[1],
            InterpPart::Expr(e) if matches!(e.kind, ExprKind::Var(ref v) if v == "name")
        ));
    }

    #[test]
    fn interpolation_spans_point_into_source() {
        let source = "x = \"ab ${foo} cd\"\n";
        let pipeline = parse(source).unwrap();
        let Decl::Assign { expr, .. } = &pipeline.decls[0] else {
            panic!()
        };
        let ExprKind::StringInterp(parts) = &expr.kind else {
            panic!()
        };
        let InterpPart::Expr(inner) = &parts[1] else {
            panic!()
        };
        assert_eq!(&source[inner.span.start..inner.span.end], "foo");
    }

    #[test]
    fn annotations_attach_to_next_input() {
        let source = "@example(\"hello\")\n@doc(\"the text\")\nin text: String\n";
        let pipeline = parse(source).unwrap();
        let Decl::Input(input) = &pipeline.decls[0] else {
            panic!("expected input");
        };
        assert_eq!(input.annotations.len(), 2);
        assert_eq!(input.annotations[0].name, "example");
    }

    #[test]
    fn dangling_annotation_is_an_error() {
        assert!(parse("@example(1)\nout x\n").is_err());
        assert!(parse("@example(1)\n").is_err());
    }

    #[test]
    fn type_expressions() {
        let source =
            "type T = {name: String, tags: [String], extra: Int?, id: Int | String, m: Map<String, Int>}\n";
        let pipeline = parse(source).unwrap();
        let Decl::TypeDef { ty, .. } = &pipeline.decls[0] else {
            panic!("expected typedef");
        };
        let TypeExprKind::Record(fields) = &ty.kind else {
            panic!("expected record type");
        };
        assert_eq!(fields.len(), 5);
        assert!(matches!(fields[1].1.kind, TypeExprKind::List(_)));
        assert!(matches!(fields[2].1.kind, TypeExprKind::Optional(_)));
        assert!(matches!(fields[3].1.kind, TypeExprKind::Union(_)));
        assert!(matches!(fields[4].1.kind, TypeExprKind::Map(_, _)));
    }

    #[test]
    fn parenthesized_union_under_optional() {
        let pipeline = parse("in v: (Int | String)?\nout v\n").unwrap();
        let Decl::Input(input) = &pipeline.decls[0] else {
            panic!("expected input");
        };
        let TypeExprKind::Optional(inner) = &input.ty.kind else {
            panic!("expected optional");
        };
        assert!(matches!(inner.kind, TypeExprKind::Union(_)));
    }

    #[test]
    fn use_declaration_with_alias() {
        let pipeline = parse("use text.ops as ops\n").unwrap();
        assert!(matches!(
            &pipeline.decls[0],
            Decl::Use { path, alias, .. }
                if path == &vec!["text".to_string(), "ops".to_string()]
                    && alias.as_deref() == Some("ops")
        ));
    }

    #[test]
    fn two_declarations_on_one_line_fail() {
        let err = parse("out a out b\n").unwrap_err();
        assert!(err.message.contains("end of line"));
    }

    #[test]
    fn syntax_error_reports_span() {
        let source = "in text String\n";
        let err = parse(source).unwrap_err();
        assert_eq!(&source[err.span.start..err.span.end], "String");
        let rendered = err.render(source);
        assert!(rendered.contains("line 1"));
        assert!(rendered.contains('^'));
    }
}
