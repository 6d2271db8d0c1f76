//! The typed AST: the checker's output, consumed by the IR lowering.
//!
//! Every expression carries its [`DataType`] and span; module calls are
//! resolved to a concrete [`ModuleSignature`] with arguments matched to
//! parameter names, and call options are parsed into [`TypedOptions`].

use std::time::Duration;

use flowlang_core::dag::{Backoff, OnError, Priority, Rate};
use flowlang_core::module::ModuleSignature;
use flowlang_core::transform::CompareOp;
use flowlang_core::types::DataType;
use flowlang_core::value::Value;
use flowlang_parser::span::Span;

/// A fully checked pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedPipeline {
    pub inputs: Vec<TypedInput>,
    pub assignments: Vec<TypedAssign>,
    /// Output name → the binding it exposes.
    pub outputs: Vec<TypedOutput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedInput {
    pub name: String,
    pub ty: DataType,
    /// Optional-typed inputs may be omitted at run time.
    pub required: bool,
    pub annotations: Vec<TypedAnnotation>,
    pub span: Span,
}

/// An input annotation; only literal values survive to serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedAnnotation {
    pub name: String,
    pub literal: Option<Value>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedAssign {
    pub name: String,
    pub expr: TypedExpr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedOutput {
    pub name: String,
    pub span: Span,
}

/// Higher-order and scalar builtins with fixed signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Length,
    Map,
    Filter,
    All,
    Any,
}

impl Builtin {
    pub fn by_name(name: &str) -> Option<Builtin> {
        Some(match name {
            "length" => Builtin::Length,
            "map" => Builtin::Map,
            "filter" => Builtin::Filter,
            "all" => Builtin::All,
            "any" => Builtin::Any,
            _ => return None,
        })
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::Length => 1,
            Builtin::Map | Builtin::Filter | Builtin::All | Builtin::Any => 2,
        }
    }
}

/// How a merge applies, decided by operand types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeShape {
    RecordRecord,
    /// Left operand is a list of records; broadcast.
    ListLeft,
    /// Right operand is a list of records; broadcast.
    ListRight,
}

/// Resolved `with` clause options.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TypedOptions {
    pub retry: Option<u32>,
    pub delay: Option<Duration>,
    pub backoff: Option<Backoff>,
    pub timeout: Option<Duration>,
    pub fallback: Option<Box<TypedExpr>>,
    pub cache: Option<Duration>,
    pub cache_backend: Option<String>,
    pub throttle: Option<Rate>,
    pub concurrency: Option<u32>,
    pub on_error: OnError,
    pub lazy: bool,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedMatchArm {
    pub binding: String,
    pub pattern: DataType,
    pub body: TypedExpr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedInterpPart {
    Lit(String),
    Expr(TypedExpr),
}

/// An expression annotated with its type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    pub ty: DataType,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedExprKind {
    Var(String),
    Literal(Value),
    StringInterp(Vec<TypedInterpPart>),
    ListLit(Vec<TypedExpr>),
    RecordLit(Vec<(String, TypedExpr)>),
    ModuleCall {
        /// Fully resolved registry name.
        module: String,
        signature: ModuleSignature,
        /// Arguments in signature parameter order: `(param, expr)`.
        args: Vec<(String, TypedExpr)>,
        options: TypedOptions,
    },
    BuiltinCall {
        builtin: Builtin,
        args: Vec<TypedExpr>,
    },
    FieldAccess {
        base: Box<TypedExpr>,
        field: String,
        /// Set when the base is a list of records and access broadcasts.
        broadcast: bool,
    },
    Project {
        base: Box<TypedExpr>,
        fields: Vec<String>,
        broadcast: bool,
    },
    Merge {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
        shape: MergeShape,
    },
    If {
        cond: Box<TypedExpr>,
        then_expr: Box<TypedExpr>,
        else_expr: Box<TypedExpr>,
    },
    Branch {
        arms: Vec<(TypedExpr, TypedExpr)>,
        otherwise: Box<TypedExpr>,
    },
    Match {
        scrutinee: Box<TypedExpr>,
        arms: Vec<TypedMatchArm>,
    },
    When {
        expr: Box<TypedExpr>,
        cond: Box<TypedExpr>,
    },
    Coalesce {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    And {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Or {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Not(Box<TypedExpr>),
    Compare {
        op: CompareOp,
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Lambda {
        params: Vec<(String, DataType)>,
        body: Box<TypedExpr>,
    },
    /// Placeholder produced when a subexpression failed to check; carries
    /// type `Nothing` so siblings can still be checked.
    Poison,
}
