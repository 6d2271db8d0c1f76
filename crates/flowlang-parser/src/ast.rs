//! AST for pipeline source.
//!
//! Every node carries a [`Span`] back into the source text for diagnostics.
//! The AST is purely syntactic: names are unresolved, types are
//! [`TypeExpr`]s, and module calls are paths; the checker resolves all of
//! it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::span::Span;

/// A parsed pipeline: the ordered declaration list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub decls: Vec<Decl>,
}

/// Top-level declarations, one per logical line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decl {
    Input(InputDecl),
    TypeDef {
        name: String,
        ty: TypeExpr,
        span: Span,
    },
    Use {
        path: Vec<String>,
        alias: Option<String>,
        span: Span,
    },
    Assign {
        name: String,
        expr: Expr,
        span: Span,
    },
    Output {
        name: String,
        span: Span,
    },
}

impl Decl {
    pub fn span(&self) -> Span {
        match self {
            Decl::Input(input) => input.span,
            Decl::TypeDef { span, .. }
            | Decl::Use { span, .. }
            | Decl::Assign { span, .. }
            | Decl::Output { span, .. } => *span,
        }
    }
}

/// `in name: Type` with any preceding `@name(expr)` annotation lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDecl {
    pub name: String,
    pub ty: TypeExpr,
    pub annotations: Vec<Annotation>,
    pub span: Span,
}

/// One `@name(expr)` annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

/// A syntactic type expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeExpr {
    pub kind: TypeExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeExprKind {
    /// Primitive or user-defined type name.
    Named(String),
    /// `[T]`
    List(Box<TypeExpr>),
    /// `Map<K, V>`
    Map(Box<TypeExpr>, Box<TypeExpr>),
    /// `T?`
    Optional(Box<TypeExpr>),
    /// `A | B`
    Union(Vec<TypeExpr>),
    /// `{a: T, b: U}`
    Record(Vec<(String, TypeExpr)>),
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Ge => ">=",
        }
    }
}

/// Literal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Duration(Duration),
    Rate { count: u32, per: Duration },
}

/// A segment of an interpolated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InterpPart {
    Lit(String),
    Expr(Box<Expr>),
}

/// A call argument, positional or named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallArg {
    pub name: Option<String>,
    pub value: Expr,
    pub span: Span,
}

/// One `key: value` pair from a `with` options clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOption {
    pub key: String,
    pub value: Expr,
    pub span: Span,
}

/// One `binding: Type -> body` arm of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    pub binding: String,
    pub ty: TypeExpr,
    pub body: Expr,
    pub span: Span,
}

/// An expression with its source span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Expr {
        Expr { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Var(String),
    Literal(Literal),
    StringInterp(Vec<InterpPart>),
    ListLit(Vec<Expr>),
    RecordLit(Vec<(String, Expr)>),
    /// Module or builtin call: `Ns.Name(args) with options`.
    Call {
        path: Vec<String>,
        args: Vec<CallArg>,
        options: Vec<CallOption>,
    },
    FieldAccess {
        base: Box<Expr>,
        field: String,
    },
    /// `base[f1, f2, ...]`
    Project {
        base: Box<Expr>,
        fields: Vec<String>,
    },
    /// `left + right`
    Merge {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Branch {
        arms: Vec<(Expr, Expr)>,
        otherwise: Box<Expr>,
    },
    Match {
        scrutinee: Box<Expr>,
        arms: Vec<MatchArm>,
    },
    /// `expr when cond`
    When {
        expr: Box<Expr>,
        cond: Box<Expr>,
    },
    /// `left ?? right`
    Coalesce {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Lambda {
        params: Vec<(String, Option<TypeExpr>)>,
        body: Box<Expr>,
    },
}
