pub mod ast;
pub mod error;
pub mod parser;
pub mod pretty;
pub mod span;
pub mod token;

// Re-export commonly used types
pub use ast::{
    Annotation, CallArg, CallOption, CmpOp, Decl, Expr, ExprKind, InputDecl, InterpPart, Literal,
    MatchArm, Pipeline, TypeExpr, TypeExprKind,
};
pub use error::ParseError;
pub use parser::parse;
pub use pretty::{print_expr, print_pipeline, print_type};
pub use span::{line_col, render_snippet, Span};
