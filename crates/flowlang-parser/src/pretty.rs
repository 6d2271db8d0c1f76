//! Canonical pretty-printer for the AST.
//!
//! Prints one declaration per line with minimal parentheses: a
//! subexpression is parenthesized only when its precedence is looser than
//! its context requires. Re-parsing the printed form yields the same AST
//! modulo spans, comments, and whitespace.

use std::fmt::Write as _;
use std::time::Duration;

use crate::ast::{
    Decl, Expr, ExprKind, InterpPart, Literal, Pipeline, TypeExpr, TypeExprKind,
};

/// Renders a whole pipeline.
pub fn print_pipeline(pipeline: &Pipeline) -> String {
    let mut out = String::new();
    for decl in &pipeline.decls {
        match decl {
            Decl::Input(input) => {
                for annotation in &input.annotations {
                    let _ = writeln!(
                        out,
                        "@{}({})",
                        annotation.name,
                        print_expr(&annotation.value)
                    );
                }
                let _ = writeln!(out, "in {}: {}", input.name, print_type(&input.ty));
            }
            Decl::TypeDef { name, ty, .. } => {
                let _ = writeln!(out, "type {name} = {}", print_type(ty));
            }
            Decl::Use { path, alias, .. } => {
                let _ = match alias {
                    Some(alias) => writeln!(out, "use {} as {alias}", path.join(".")),
                    None => writeln!(out, "use {}", path.join(".")),
                };
            }
            Decl::Assign { name, expr, .. } => {
                let _ = writeln!(out, "{name} = {}", print_expr(expr));
            }
            Decl::Output { name, .. } => {
                let _ = writeln!(out, "out {name}");
            }
        }
    }
    out
}

/// Renders one expression.
pub fn print_expr(expr: &Expr) -> String {
    let mut out = String::new();
    write_expr(&mut out, expr, 0);
    out
}

/// Renders one type expression.
pub fn print_type(ty: &TypeExpr) -> String {
    match &ty.kind {
        TypeExprKind::Named(name) => name.clone(),
        TypeExprKind::List(element) => format!("[{}]", print_type(element)),
        TypeExprKind::Map(key, value) => {
            format!("Map<{}, {}>", print_type(key), print_type(value))
        }
        TypeExprKind::Optional(inner) => match inner.kind {
            TypeExprKind::Union(_) => format!("({})?", print_type(inner)),
            _ => format!("{}?", print_type(inner)),
        },
        TypeExprKind::Union(members) => members
            .iter()
            .map(print_type)
            .collect::<Vec<_>>()
            .join(" | "),
        TypeExprKind::Record(fields) => {
            let inner = fields
                .iter()
                .map(|(name, ty)| format!("{name}: {}", print_type(ty)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{{{inner}}}")
        }
    }
}

// Precedence levels, loosest to tightest. Constructs that extend greedily to
// the right (if/branch/match/lambda/when) sit at the bottom so they are
// parenthesized inside any operator.
const LVL_WHEN: u8 = 1;
const LVL_COALESCE: u8 = 2;
const LVL_OR: u8 = 3;
const LVL_AND: u8 = 4;
const LVL_NOT: u8 = 5;
const LVL_COMPARE: u8 = 6;
const LVL_MERGE: u8 = 7;
const LVL_POSTFIX: u8 = 8;
const LVL_ATOM: u8 = 9;

fn level(expr: &Expr) -> u8 {
    match &expr.kind {
        ExprKind::When { .. }
        | ExprKind::If { .. }
        | ExprKind::Lambda { .. } => LVL_WHEN,
        ExprKind::Coalesce { .. } => LVL_COALESCE,
        ExprKind::Or { .. } => LVL_OR,
        ExprKind::And { .. } => LVL_AND,
        ExprKind::Not(_) => LVL_NOT,
        ExprKind::Compare { .. } => LVL_COMPARE,
        ExprKind::Merge { .. } => LVL_MERGE,
        ExprKind::FieldAccess { .. } | ExprKind::Project { .. } => LVL_POSTFIX,
        ExprKind::Var(_)
        | ExprKind::Literal(_)
        | ExprKind::StringInterp(_)
        | ExprKind::ListLit(_)
        | ExprKind::RecordLit(_)
        | ExprKind::Call { .. }
        | ExprKind::Branch { .. }
        | ExprKind::Match { .. } => LVL_ATOM,
    }
}

fn write_expr(out: &mut String, expr: &Expr, min_level: u8) {
    let needs_parens = level(expr) < min_level;
    if needs_parens {
        out.push('(');
    }
    match &expr.kind {
        ExprKind::Var(name) => out.push_str(name),
        ExprKind::Literal(lit) => write_literal(out, lit),
        ExprKind::StringInterp(parts) => {
            out.push('"');
            for part in parts {
                match part {
                    InterpPart::Lit(text) => out.push_str(&escape(text)),
                    InterpPart::Expr(inner) => {
                        out.push_str("${");
                        write_expr(out, inner, 0);
                        out.push('}');
                    }
                }
            }
            out.push('"');
        }
        ExprKind::ListLit(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(out, item, 0);
            }
            out.push(']');
        }
        ExprKind::RecordLit(fields) => {
            out.push('{');
            for (i, (name, value)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{name}: ");
                write_expr(out, value, 0);
            }
            out.push('}');
        }
        ExprKind::Call {
            path,
            args,
            options,
        } => {
            out.push_str(&path.join("."));
            out.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                if let Some(name) = &arg.name {
                    let _ = write!(out, "{name}: ");
                }
                write_expr(out, &arg.value, 0);
            }
            out.push(')');
            if !options.is_empty() {
                out.push_str(" with ");
                for (i, option) in options.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{}: ", option.key);
                    write_expr(out, &option.value, 0);
                }
            }
        }
        ExprKind::FieldAccess { base, field } => {
            write_expr(out, base, LVL_POSTFIX);
            let _ = write!(out, ".{field}");
        }
        ExprKind::Project { base, fields } => {
            write_expr(out, base, LVL_POSTFIX);
            let _ = write!(out, "[{}]", fields.join(", "));
        }
        ExprKind::Merge { left, right } => {
            write_expr(out, left, LVL_MERGE);
            out.push_str(" + ");
            write_expr(out, right, LVL_POSTFIX);
        }
        ExprKind::Compare { op, left, right } => {
            write_expr(out, left, LVL_MERGE);
            let _ = write!(out, " {} ", op.symbol());
            write_expr(out, right, LVL_MERGE);
        }
        ExprKind::Not(operand) => {
            out.push_str("not ");
            write_expr(out, operand, LVL_NOT);
        }
        ExprKind::And { left, right } => {
            write_expr(out, left, LVL_AND);
            out.push_str(" and ");
            write_expr(out, right, LVL_NOT);
        }
        ExprKind::Or { left, right } => {
            write_expr(out, left, LVL_OR);
            out.push_str(" or ");
            write_expr(out, right, LVL_AND);
        }
        ExprKind::Coalesce { left, right } => {
            write_expr(out, left, LVL_OR);
            out.push_str(" ?? ");
            write_expr(out, right, LVL_COALESCE);
        }
        ExprKind::When { expr, cond } => {
            write_expr(out, expr, LVL_WHEN);
            out.push_str(" when ");
            write_expr(out, cond, LVL_COALESCE);
        }
        ExprKind::If {
            cond,
            then_expr,
            else_expr,
        } => {
            out.push_str("if ");
            write_expr(out, cond, 0);
            out.push_str(" then ");
            write_expr(out, then_expr, 0);
            out.push_str(" else ");
            write_expr(out, else_expr, 0);
        }
        ExprKind::Branch { arms, otherwise } => {
            out.push_str("branch { ");
            for (cond, body) in arms {
                write_expr(out, cond, 0);
                out.push_str(" -> ");
                write_expr(out, body, 0);
                out.push_str(", ");
            }
            out.push_str("otherwise -> ");
            write_expr(out, otherwise, 0);
            out.push_str(" }");
        }
        ExprKind::Match { scrutinee, arms } => {
            out.push_str("match ");
            write_expr(out, scrutinee, 0);
            out.push_str(" { ");
            for (i, arm) in arms.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}: {} -> ", arm.binding, print_type(&arm.ty));
                write_expr(out, &arm.body, 0);
            }
            out.push_str(" }");
        }
        ExprKind::Lambda { params, body } => {
            out.push('(');
            for (i, (name, ty)) in params.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(name);
                if let Some(ty) = ty {
                    let _ = write!(out, ": {}", print_type(ty));
                }
            }
            out.push_str(") => ");
            write_expr(out, body, 0);
        }
    }
    if needs_parens {
        out.push(')');
    }
}

fn write_literal(out: &mut String, lit: &Literal) {
    match lit {
        Literal::Int(i) => {
            let _ = write!(out, "{i}");
        }
        // Debug formatting keeps the decimal point, so the value re-lexes
        // as a float.
        Literal::Float(x) => {
            let _ = write!(out, "{x:?}");
        }
        Literal::Str(s) => {
            let _ = write!(out, "\"{}\"", escape(s));
        }
        Literal::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Literal::Duration(d) => out.push_str(&print_duration(*d)),
        Literal::Rate { count, per } => {
            let _ = write!(out, "{count}/{}", print_duration(*per));
        }
    }
}

/// Largest unit that renders the duration exactly.
fn print_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0ms".to_string();
    }
    if ms % 86_400_000 == 0 {
        format!("{}d", ms / 86_400_000)
    } else if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}min", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '$' => out.push_str("\\$"),
            other => out.push(other),
        }
    }
    out
}
