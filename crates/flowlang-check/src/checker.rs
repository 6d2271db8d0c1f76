//! Bidirectional type checker.
//!
//! Walks declarations in order, seeding the environment from `in`
//! declarations and extending it per assignment. Types flow down into
//! lambda parameters (from higher-order builtin signatures) and fallback
//! options (from module output types); everywhere else types are
//! synthesized and compared by structural subtyping.
//!
//! The checker collects as many errors as possible in one pass: a failed
//! subexpression yields a `Poison` node of type `Nothing` (the bottom type,
//! compatible everywhere) so its siblings and consumers still check.

use std::collections::HashSet;

use indexmap::IndexMap;

use flowlang_core::module::ModuleRegistry;
use flowlang_core::transform::CompareOp;
use flowlang_core::types::DataType;
use flowlang_core::value::Value;
use flowlang_parser::ast::{
    CmpOp, Decl, Expr, ExprKind, InputDecl, InterpPart, Literal, Pipeline, TypeExpr, TypeExprKind,
};
use flowlang_parser::span::Span;

use crate::diagnostics::{CheckError, CheckWarning};
use crate::typed::{
    Builtin, MergeShape, TypedAnnotation, TypedAssign, TypedExpr, TypedExprKind, TypedInput,
    TypedInterpPart, TypedMatchArm, TypedOutput, TypedPipeline,
};

/// Outcome of checking one compilation unit: a typed pipeline when no
/// errors were found, plus everything collected along the way.
#[derive(Debug)]
pub struct CheckReport {
    pub typed: Option<TypedPipeline>,
    pub errors: Vec<CheckError>,
    pub warnings: Vec<CheckWarning>,
}

/// Checks a parsed pipeline against the module registry.
pub fn check_pipeline(pipeline: &Pipeline, registry: &ModuleRegistry) -> CheckReport {
    let mut checker = Checker {
        registry,
        errors: Vec::new(),
        warnings: Vec::new(),
        types: IndexMap::new(),
        globals: IndexMap::new(),
        locals: Vec::new(),
        used: HashSet::new(),
        imports: Vec::new(),
    };
    let typed = checker.run(pipeline);
    let typed = if checker.errors.is_empty() {
        Some(typed)
    } else {
        None
    };
    CheckReport {
        typed,
        errors: checker.errors,
        warnings: checker.warnings,
    }
}

struct Binding {
    ty: DataType,
    span: Span,
}

pub(crate) struct Checker<'a> {
    pub(crate) registry: &'a ModuleRegistry,
    pub(crate) errors: Vec<CheckError>,
    pub(crate) warnings: Vec<CheckWarning>,
    types: IndexMap<String, DataType>,
    globals: IndexMap<String, Binding>,
    locals: Vec<IndexMap<String, DataType>>,
    used: HashSet<String>,
    imports: Vec<(Vec<String>, Option<String>)>,
}

impl<'a> Checker<'a> {
    fn run(&mut self, pipeline: &Pipeline) -> TypedPipeline {
        let mut inputs = Vec::new();
        let mut assignments = Vec::new();
        let mut outputs: Vec<TypedOutput> = Vec::new();

        for decl in &pipeline.decls {
            match decl {
                Decl::Use { path, alias, span: _ } => {
                    self.imports.push((path.clone(), alias.clone()));
                }
                Decl::TypeDef { name, ty, span } => {
                    let resolved = self.resolve_type(ty);
                    if self.types.insert(name.clone(), resolved).is_some() {
                        self.error(CheckError::DuplicateBinding {
                            name: name.clone(),
                            span: *span,
                        });
                    }
                }
                Decl::Input(input) => {
                    if let Some(typed) = self.check_input(input) {
                        inputs.push(typed);
                    }
                }
                Decl::Assign { name, expr, span } => {
                    let typed = self.infer(expr);
                    if self.globals.contains_key(name) {
                        self.error(CheckError::DuplicateBinding {
                            name: name.clone(),
                            span: *span,
                        });
                    } else {
                        self.globals.insert(
                            name.clone(),
                            Binding {
                                ty: typed.ty.clone(),
                                span: *span,
                            },
                        );
                    }
                    assignments.push(TypedAssign {
                        name: name.clone(),
                        expr: typed,
                        span: *span,
                    });
                }
                Decl::Output { name, span } => {
                    if !self.globals.contains_key(name) {
                        self.error(CheckError::UndefinedVariable {
                            name: name.clone(),
                            span: *span,
                        });
                        continue;
                    }
                    self.used.insert(name.clone());
                    if outputs.iter().any(|o| o.name == *name) {
                        self.error(CheckError::DuplicateBinding {
                            name: name.clone(),
                            span: *span,
                        });
                        continue;
                    }
                    outputs.push(TypedOutput {
                        name: name.clone(),
                        span: *span,
                    });
                }
            }
        }

        for (name, binding) in &self.globals {
            if !self.used.contains(name) {
                self.warnings.push(CheckWarning::UnusedVariable {
                    name: name.clone(),
                    span: binding.span,
                });
            }
        }

        TypedPipeline {
            inputs,
            assignments,
            outputs,
        }
    }

    fn check_input(&mut self, input: &InputDecl) -> Option<TypedInput> {
        let ty = self.resolve_type(&input.ty);
        if self.globals.contains_key(&input.name) {
            self.error(CheckError::DuplicateBinding {
                name: input.name.clone(),
                span: input.span,
            });
            return None;
        }

        let mut annotations = Vec::new();
        let mut example_seen = false;
        for annotation in &input.annotations {
            if annotation.name == "example" {
                if example_seen {
                    self.error(CheckError::DuplicateExampleAnnotation {
                        span: annotation.span,
                    });
                    continue;
                }
                example_seen = true;
            }
            let value = self.infer(&annotation.value);
            annotations.push(TypedAnnotation {
                name: annotation.name.clone(),
                literal: const_value(&value),
                span: annotation.span,
            });
        }

        self.globals.insert(
            input.name.clone(),
            Binding {
                ty: ty.clone(),
                span: input.span,
            },
        );
        let required = !matches!(ty, DataType::Optional(_));
        Some(TypedInput {
            name: input.name.clone(),
            ty,
            required,
            annotations,
            span: input.span,
        })
    }

    // -------------------------------------------------------------------
    // Types
    // -------------------------------------------------------------------

    fn resolve_type(&mut self, ty: &TypeExpr) -> DataType {
        match &ty.kind {
            TypeExprKind::Named(name) => match name.as_str() {
                "String" => DataType::String,
                "Int" => DataType::Int,
                "Float" => DataType::Float,
                "Boolean" => DataType::Boolean,
                other => match self.types.get(other) {
                    Some(resolved) => resolved.clone(),
                    None => {
                        self.error(CheckError::UndefinedType {
                            name: other.to_string(),
                            span: ty.span,
                        });
                        DataType::Nothing
                    }
                },
            },
            TypeExprKind::List(element) => DataType::list(self.resolve_type(element)),
            TypeExprKind::Map(key, value) => DataType::Map(
                Box::new(self.resolve_type(key)),
                Box::new(self.resolve_type(value)),
            ),
            TypeExprKind::Optional(inner) => DataType::optional(self.resolve_type(inner)),
            TypeExprKind::Union(members) => {
                DataType::union(members.iter().map(|m| self.resolve_type(m)))
            }
            TypeExprKind::Record(fields) => DataType::Record(
                fields
                    .iter()
                    .map(|(name, field_ty)| (name.clone(), self.resolve_type(field_ty)))
                    .collect(),
            ),
        }
    }

    // -------------------------------------------------------------------
    // Environment
    // -------------------------------------------------------------------

    fn lookup(&mut self, name: &str) -> Option<DataType> {
        for scope in self.locals.iter().rev() {
            if let Some(ty) = scope.get(name) {
                return Some(ty.clone());
            }
        }
        if let Some(binding) = self.globals.get(name) {
            self.used.insert(name.to_string());
            return Some(binding.ty.clone());
        }
        None
    }

    pub(crate) fn error(&mut self, error: CheckError) {
        self.errors.push(error);
    }

    fn poison(span: Span) -> TypedExpr {
        TypedExpr {
            kind: TypedExprKind::Poison,
            ty: DataType::Nothing,
            span,
        }
    }

    // -------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------

    /// Check mode: synthesize, then require a subtype of `expected`.
    /// `Nothing` (a failed subexpression) passes silently.
    pub(crate) fn check(&mut self, expr: &Expr, expected: &DataType) -> TypedExpr {
        let typed = self.infer(expr);
        if !typed.ty.is_subtype_of(expected) {
            self.error(CheckError::TypeMismatch {
                expected: expected.clone(),
                actual: typed.ty.clone(),
                span: typed.span,
            });
        }
        typed
    }

    /// Infer mode: synthesize the expression's type.
    pub(crate) fn infer(&mut self, expr: &Expr) -> TypedExpr {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Var(name) => match self.lookup(name) {
                Some(ty) => TypedExpr {
                    kind: TypedExprKind::Var(name.clone()),
                    ty,
                    span,
                },
                None => {
                    self.error(CheckError::UndefinedVariable {
                        name: name.clone(),
                        span,
                    });
                    Self::poison(span)
                }
            },
            ExprKind::Literal(lit) => match literal_value(lit) {
                Some(value) => {
                    let ty = value.type_of();
                    TypedExpr {
                        kind: TypedExprKind::Literal(value),
                        ty,
                        span,
                    }
                }
                None => {
                    self.error(CheckError::InvalidLiteral {
                        message: "duration and rate literals are only allowed in option values"
                            .into(),
                        span,
                    });
                    Self::poison(span)
                }
            },
            ExprKind::StringInterp(parts) => {
                let mut typed_parts = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        InterpPart::Lit(text) => typed_parts.push(TypedInterpPart::Lit(text.clone())),
                        InterpPart::Expr(inner) => {
                            typed_parts.push(TypedInterpPart::Expr(self.infer(inner)));
                        }
                    }
                }
                TypedExpr {
                    kind: TypedExprKind::StringInterp(typed_parts),
                    ty: DataType::String,
                    span,
                }
            }
            ExprKind::ListLit(items) => {
                let typed_items: Vec<TypedExpr> = items.iter().map(|i| self.infer(i)).collect();
                let element = typed_items
                    .iter()
                    .fold(DataType::Nothing, |acc, item| acc.lub(&item.ty));
                TypedExpr {
                    kind: TypedExprKind::ListLit(typed_items),
                    ty: DataType::list(element),
                    span,
                }
            }
            ExprKind::RecordLit(fields) => {
                let mut typed_fields = Vec::with_capacity(fields.len());
                let mut field_types = IndexMap::with_capacity(fields.len());
                for (name, value) in fields {
                    let typed = self.infer(value);
                    if field_types.insert(name.clone(), typed.ty.clone()).is_some() {
                        self.error(CheckError::DuplicateBinding {
                            name: name.clone(),
                            span: typed.span,
                        });
                    }
                    typed_fields.push((name.clone(), typed));
                }
                TypedExpr {
                    kind: TypedExprKind::RecordLit(typed_fields),
                    ty: DataType::Record(field_types),
                    span,
                }
            }
            ExprKind::Call {
                path,
                args,
                options,
            } => self.infer_call(path, args, options, span),
            ExprKind::FieldAccess { base, field } => {
                let typed_base = self.infer(base);
                let (ty, broadcast) = match &typed_base.ty {
                    DataType::Record(fields) => match fields.get(field) {
                        Some(field_ty) => (field_ty.clone(), false),
                        None => {
                            self.error(CheckError::InvalidFieldAccess {
                                field: field.clone(),
                                available: fields.keys().cloned().collect(),
                                span,
                            });
                            (DataType::Nothing, false)
                        }
                    },
                    DataType::List(element) => match element.as_ref() {
                        DataType::Record(fields) => match fields.get(field) {
                            Some(field_ty) => (DataType::list(field_ty.clone()), true),
                            None => {
                                self.error(CheckError::InvalidFieldAccess {
                                    field: field.clone(),
                                    available: fields.keys().cloned().collect(),
                                    span,
                                });
                                (DataType::Nothing, true)
                            }
                        },
                        _ => {
                            self.type_error_record(&typed_base);
                            (DataType::Nothing, false)
                        }
                    },
                    DataType::Nothing => (DataType::Nothing, false),
                    _ => {
                        self.type_error_record(&typed_base);
                        (DataType::Nothing, false)
                    }
                };
                TypedExpr {
                    kind: TypedExprKind::FieldAccess {
                        base: Box::new(typed_base),
                        field: field.clone(),
                        broadcast,
                    },
                    ty,
                    span,
                }
            }
            ExprKind::Project { base, fields } => {
                let typed_base = self.infer(base);
                let project_record =
                    |checker: &mut Self, record: &IndexMap<String, DataType>| -> DataType {
                        let mut projected = IndexMap::with_capacity(fields.len());
                        for field in fields {
                            match record.get(field) {
                                Some(ty) => {
                                    projected.insert(field.clone(), ty.clone());
                                }
                                None => checker.error(CheckError::InvalidProjection {
                                    field: field.clone(),
                                    available: record.keys().cloned().collect(),
                                    span,
                                }),
                            }
                        }
                        DataType::Record(projected)
                    };
                let (ty, broadcast) = match &typed_base.ty {
                    DataType::Record(record) => (project_record(self, record), false),
                    DataType::List(element) => match element.as_ref() {
                        DataType::Record(record) => {
                            (DataType::list(project_record(self, record)), true)
                        }
                        _ => {
                            self.type_error_record(&typed_base);
                            (DataType::Nothing, false)
                        }
                    },
                    DataType::Nothing => (DataType::Nothing, false),
                    _ => {
                        self.type_error_record(&typed_base);
                        (DataType::Nothing, false)
                    }
                };
                TypedExpr {
                    kind: TypedExprKind::Project {
                        base: Box::new(typed_base),
                        fields: fields.clone(),
                        broadcast,
                    },
                    ty,
                    span,
                }
            }
            ExprKind::Merge { left, right } => self.infer_merge(left, right, span),
            ExprKind::If {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond = self.check(cond, &DataType::Boolean);
                let then_typed = self.infer(then_expr);
                let else_typed = self.infer(else_expr);
                let ty = then_typed.ty.lub(&else_typed.ty);
                TypedExpr {
                    kind: TypedExprKind::If {
                        cond: Box::new(cond),
                        then_expr: Box::new(then_typed),
                        else_expr: Box::new(else_typed),
                    },
                    ty,
                    span,
                }
            }
            ExprKind::Branch { arms, otherwise } => {
                let mut typed_arms = Vec::with_capacity(arms.len());
                let mut ty = DataType::Nothing;
                for (cond, body) in arms {
                    let cond = self.check(cond, &DataType::Boolean);
                    let body = self.infer(body);
                    ty = ty.lub(&body.ty);
                    typed_arms.push((cond, body));
                }
                let otherwise = self.infer(otherwise);
                ty = ty.lub(&otherwise.ty);
                TypedExpr {
                    kind: TypedExprKind::Branch {
                        arms: typed_arms,
                        otherwise: Box::new(otherwise),
                    },
                    ty,
                    span,
                }
            }
            ExprKind::Match { scrutinee, arms } => self.infer_match(scrutinee, arms, span),
            ExprKind::When { expr, cond } => {
                let typed = self.infer(expr);
                let cond = self.check(cond, &DataType::Boolean);
                let ty = DataType::optional(typed.ty.clone());
                TypedExpr {
                    kind: TypedExprKind::When {
                        expr: Box::new(typed),
                        cond: Box::new(cond),
                    },
                    ty,
                    span,
                }
            }
            ExprKind::Coalesce { left, right } => {
                let typed_left = self.infer(left);
                let typed_right = self.infer(right);
                let ty = match &typed_left.ty {
                    DataType::Optional(inner) => inner.lub(&typed_right.ty),
                    DataType::Nothing => typed_right.ty.clone(),
                    other => {
                        self.error(CheckError::TypeMismatch {
                            expected: DataType::optional(DataType::Nothing),
                            actual: other.clone(),
                            span: typed_left.span,
                        });
                        typed_right.ty.clone()
                    }
                };
                TypedExpr {
                    kind: TypedExprKind::Coalesce {
                        left: Box::new(typed_left),
                        right: Box::new(typed_right),
                    },
                    ty,
                    span,
                }
            }
            ExprKind::And { left, right } => {
                let left = self.check(left, &DataType::Boolean);
                let right = self.check(right, &DataType::Boolean);
                TypedExpr {
                    kind: TypedExprKind::And {
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    ty: DataType::Boolean,
                    span,
                }
            }
            ExprKind::Or { left, right } => {
                let left = self.check(left, &DataType::Boolean);
                let right = self.check(right, &DataType::Boolean);
                TypedExpr {
                    kind: TypedExprKind::Or {
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    ty: DataType::Boolean,
                    span,
                }
            }
            ExprKind::Not(operand) => {
                let operand = self.check(operand, &DataType::Boolean);
                TypedExpr {
                    kind: TypedExprKind::Not(Box::new(operand)),
                    ty: DataType::Boolean,
                    span,
                }
            }
            ExprKind::Compare { op, left, right } => {
                let left = self.infer(left);
                let right = self.infer(right);
                self.check_comparable(*op, &left, &right, span);
                TypedExpr {
                    kind: TypedExprKind::Compare {
                        op: compare_op(*op),
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    ty: DataType::Boolean,
                    span,
                }
            }
            ExprKind::Lambda { .. } => {
                // Lambdas are only meaningful as higher-order builtin
                // arguments, where the parameter type is known.
                self.error(CheckError::AmbiguousLambda { span });
                Self::poison(span)
            }
        }
    }

    fn type_error_record(&mut self, base: &TypedExpr) {
        self.error(CheckError::TypeMismatch {
            expected: DataType::Record(IndexMap::new()),
            actual: base.ty.clone(),
            span: base.span,
        });
    }

    fn check_comparable(&mut self, op: CmpOp, left: &TypedExpr, right: &TypedExpr, span: Span) {
        let lt = &left.ty;
        let rt = &right.ty;
        if matches!(lt, DataType::Nothing) || matches!(rt, DataType::Nothing) {
            return;
        }
        let ok = match op {
            CmpOp::Eq | CmpOp::Ne => lt.is_subtype_of(rt) || rt.is_subtype_of(lt),
            _ => {
                (lt.is_numeric() && rt.is_numeric())
                    || (matches!(lt, DataType::String) && matches!(rt, DataType::String))
            }
        };
        if !ok {
            self.error(CheckError::TypeMismatch {
                expected: lt.clone(),
                actual: rt.clone(),
                span,
            });
        }
    }

    fn infer_merge(&mut self, left: &Expr, right: &Expr, span: Span) -> TypedExpr {
        let typed_left = self.infer(left);
        let typed_right = self.infer(right);

        let merged_fields = |a: &IndexMap<String, DataType>, b: &IndexMap<String, DataType>| {
            let mut merged = a.clone();
            for (name, ty) in b {
                merged.insert(name.clone(), ty.clone());
            }
            DataType::Record(merged)
        };

        let (ty, shape) = match (&typed_left.ty, &typed_right.ty) {
            (DataType::Record(a), DataType::Record(b)) => {
                (merged_fields(a, b), MergeShape::RecordRecord)
            }
            (DataType::List(element), DataType::Record(b)) => match element.as_ref() {
                DataType::Record(a) => {
                    self.warnings
                        .push(CheckWarning::AmbiguousListMerge { span });
                    (DataType::list(merged_fields(a, b)), MergeShape::ListLeft)
                }
                _ => {
                    self.error(CheckError::IncompatibleMerge {
                        left: typed_left.ty.clone(),
                        right: typed_right.ty.clone(),
                        span,
                    });
                    (DataType::Nothing, MergeShape::RecordRecord)
                }
            },
            (DataType::Record(a), DataType::List(element)) => match element.as_ref() {
                DataType::Record(b) => {
                    self.warnings
                        .push(CheckWarning::AmbiguousListMerge { span });
                    (DataType::list(merged_fields(a, b)), MergeShape::ListRight)
                }
                _ => {
                    self.error(CheckError::IncompatibleMerge {
                        left: typed_left.ty.clone(),
                        right: typed_right.ty.clone(),
                        span,
                    });
                    (DataType::Nothing, MergeShape::RecordRecord)
                }
            },
            (DataType::Nothing, _) | (_, DataType::Nothing) => {
                (DataType::Nothing, MergeShape::RecordRecord)
            }
            _ => {
                self.error(CheckError::IncompatibleMerge {
                    left: typed_left.ty.clone(),
                    right: typed_right.ty.clone(),
                    span,
                });
                (DataType::Nothing, MergeShape::RecordRecord)
            }
        };

        TypedExpr {
            kind: TypedExprKind::Merge {
                left: Box::new(typed_left),
                right: Box::new(typed_right),
                shape,
            },
            ty,
            span,
        }
    }

    fn infer_match(
        &mut self,
        scrutinee: &Expr,
        arms: &[flowlang_parser::ast::MatchArm],
        span: Span,
    ) -> TypedExpr {
        let typed_scrutinee = self.infer(scrutinee);
        let members: Vec<DataType> = match &typed_scrutinee.ty {
            DataType::Union(members) => members.clone(),
            other => vec![other.clone()],
        };

        let mut typed_arms = Vec::with_capacity(arms.len());
        let mut ty = DataType::Nothing;
        let mut patterns = Vec::with_capacity(arms.len());
        for arm in arms {
            let pattern = self.resolve_type(&arm.ty);
            patterns.push(pattern.clone());
            self.locals
                .push(IndexMap::from([(arm.binding.clone(), pattern.clone())]));
            let body = self.infer(&arm.body);
            self.locals.pop();
            ty = ty.lub(&body.ty);
            typed_arms.push(TypedMatchArm {
                binding: arm.binding.clone(),
                pattern,
                body,
                span: arm.span,
            });
        }

        if !matches!(typed_scrutinee.ty, DataType::Nothing) {
            let uncovered: Vec<String> = members
                .iter()
                .filter(|member| !patterns.iter().any(|p| member.is_subtype_of(p)))
                .map(ToString::to_string)
                .collect();
            if !uncovered.is_empty() {
                self.error(CheckError::NonExhaustiveMatch { uncovered, span });
            }
        }

        TypedExpr {
            kind: TypedExprKind::Match {
                scrutinee: Box::new(typed_scrutinee),
                arms: typed_arms,
            },
            ty,
            span,
        }
    }

    // -------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------

    fn infer_call(
        &mut self,
        path: &[String],
        args: &[flowlang_parser::ast::CallArg],
        options: &[flowlang_parser::ast::CallOption],
        span: Span,
    ) -> TypedExpr {
        if path.len() == 1 {
            if let Some(builtin) = Builtin::by_name(&path[0]) {
                if !options.is_empty() {
                    self.error(CheckError::InvalidOption {
                        key: options[0].key.clone(),
                        message: "builtins take no options".into(),
                        span: options[0].span,
                    });
                }
                return self.infer_builtin(builtin, &path[0], args, span);
            }
        }

        let Some(module) = self.resolve_module_name(path) else {
            self.error(CheckError::UndefinedFunction {
                name: path.join("."),
                span,
            });
            // Still check argument subexpressions for their own errors.
            for arg in args {
                self.infer(&arg.value);
            }
            return Self::poison(span);
        };
        let signature = self
            .registry
            .signature(&module)
            .expect("resolved name has a signature")
            .clone();

        // Match arguments to parameters, positionally then by name.
        let params: Vec<(String, DataType)> = signature
            .consumes
            .iter()
            .map(|(name, ty)| (name.clone(), ty.clone()))
            .collect();
        if args.len() != params.len() {
            self.error(CheckError::ArityMismatch {
                name: module.clone(),
                expected: params.len(),
                actual: args.len(),
                span,
            });
            for arg in args {
                self.infer(&arg.value);
            }
            return Self::poison(span);
        }

        let mut matched: IndexMap<String, TypedExpr> = IndexMap::new();
        let mut positional = 0usize;
        for arg in args {
            let param = match &arg.name {
                Some(name) => match params.iter().find(|(p, _)| p == name) {
                    Some((p, ty)) => Some((p.clone(), ty.clone())),
                    None => {
                        self.error(CheckError::UnknownParameter {
                            module: module.clone(),
                            param: name.clone(),
                            span: arg.span,
                        });
                        self.infer(&arg.value);
                        None
                    }
                },
                None => {
                    // Next parameter not yet bound by name.
                    let slot = params
                        .iter()
                        .skip(positional)
                        .find(|(p, _)| !matched.contains_key(p))
                        .cloned();
                    positional += 1;
                    slot
                }
            };
            let Some((param_name, param_ty)) = param else {
                continue;
            };
            if matched.contains_key(&param_name) {
                self.error(CheckError::DuplicateBinding {
                    name: param_name.clone(),
                    span: arg.span,
                });
                continue;
            }
            let typed = self.check(&arg.value, &param_ty);
            matched.insert(param_name, typed);
        }

        // The call's value: a single produced field is unwrapped, multiple
        // fields form a record.
        let mut ty = if signature.produces.len() == 1 {
            signature.produces[0].clone()
        } else {
            DataType::Record(signature.produces.clone())
        };

        let typed_options = self.resolve_options(options, &ty);
        if matches!(typed_options.on_error, flowlang_core::dag::OnError::Wrap) {
            // Wrap re-types the single produced value as a result union;
            // multi-output calls have no single value to wrap.
            if signature.produces.len() != 1 {
                if let Some(option) = options.iter().find(|o| o.key == "on_error") {
                    self.error(CheckError::InvalidOption {
                        key: "on_error".into(),
                        message: "wrap requires a single-output module".into(),
                        span: option.span,
                    });
                }
            }
            ty = DataType::union([
                DataType::record([("ok", ty.clone())]),
                DataType::record([("err", DataType::String)]),
            ]);
        }

        let ordered_args: Vec<(String, TypedExpr)> = params
            .iter()
            .filter_map(|(name, _)| matched.shift_remove(name).map(|e| (name.clone(), e)))
            .collect();

        TypedExpr {
            kind: TypedExprKind::ModuleCall {
                module,
                signature,
                args: ordered_args,
                options: typed_options,
            },
            ty,
            span,
        }
    }

    fn infer_builtin(
        &mut self,
        builtin: Builtin,
        name: &str,
        args: &[flowlang_parser::ast::CallArg],
        span: Span,
    ) -> TypedExpr {
        if args.len() != builtin.arity() || args.iter().any(|a| a.name.is_some()) {
            self.error(CheckError::ArityMismatch {
                name: name.to_string(),
                expected: builtin.arity(),
                actual: args.len(),
                span,
            });
            for arg in args {
                if !matches!(arg.value.kind, ExprKind::Lambda { .. }) {
                    self.infer(&arg.value);
                }
            }
            return Self::poison(span);
        }

        if builtin == Builtin::Length {
            let operand = self.infer(&args[0].value);
            let ok = matches!(
                operand.ty,
                DataType::String | DataType::List(_) | DataType::Nothing
            );
            if !ok {
                self.error(CheckError::TypeMismatch {
                    expected: DataType::union([
                        DataType::String,
                        DataType::list(DataType::Nothing),
                    ]),
                    actual: operand.ty.clone(),
                    span: operand.span,
                });
            }
            return TypedExpr {
                kind: TypedExprKind::BuiltinCall {
                    builtin,
                    args: vec![operand],
                },
                ty: DataType::Int,
                span,
            };
        }

        // Higher-order list builtins: map/filter/all/any.
        let list = self.infer(&args[0].value);
        let element = match &list.ty {
            DataType::List(element) => (**element).clone(),
            DataType::Nothing => DataType::Nothing,
            other => {
                self.error(CheckError::TypeMismatch {
                    expected: DataType::list(DataType::Nothing),
                    actual: other.clone(),
                    span: list.span,
                });
                DataType::Nothing
            }
        };

        let lambda = self.check_lambda_arg(&args[1].value, &element);
        let body_ty = match &lambda.kind {
            TypedExprKind::Lambda { body, .. } => body.ty.clone(),
            _ => DataType::Nothing,
        };

        let ty = match builtin {
            Builtin::Map => DataType::list(body_ty.clone()),
            Builtin::Filter => list.ty.clone(),
            Builtin::All | Builtin::Any => DataType::Boolean,
            Builtin::Length => unreachable!(),
        };
        if matches!(builtin, Builtin::Filter | Builtin::All | Builtin::Any)
            && !body_ty.is_subtype_of(&DataType::Boolean)
        {
            self.error(CheckError::TypeMismatch {
                expected: DataType::Boolean,
                actual: body_ty,
                span: lambda.span,
            });
        }

        TypedExpr {
            kind: TypedExprKind::BuiltinCall {
                builtin,
                args: vec![list, lambda],
            },
            ty,
            span,
        }
    }

    /// Checks a lambda argument with the parameter type flowing down from
    /// the builtin's signature.
    fn check_lambda_arg(&mut self, expr: &Expr, element: &DataType) -> TypedExpr {
        let ExprKind::Lambda { params, body } = &expr.kind else {
            self.error(CheckError::AmbiguousLambda { span: expr.span });
            return Self::poison(expr.span);
        };
        if params.len() != 1 {
            self.error(CheckError::ArityMismatch {
                name: "lambda".into(),
                expected: 1,
                actual: params.len(),
                span: expr.span,
            });
            return Self::poison(expr.span);
        }
        let (param_name, annotation) = &params[0];
        let param_ty = match annotation {
            Some(type_expr) => {
                let annotated = self.resolve_type(type_expr);
                if !element.is_subtype_of(&annotated) {
                    self.error(CheckError::TypeMismatch {
                        expected: annotated.clone(),
                        actual: element.clone(),
                        span: type_expr.span,
                    });
                }
                annotated
            }
            None => element.clone(),
        };

        self.locals
            .push(IndexMap::from([(param_name.clone(), param_ty.clone())]));
        let body_typed = self.infer(body);
        self.locals.pop();

        let span = expr.span;
        TypedExpr {
            kind: TypedExprKind::Lambda {
                params: vec![(param_name.clone(), param_ty)],
                body: Box::new(body_typed),
            },
            ty: DataType::Nothing,
            span,
        }
    }

    fn resolve_module_name(&self, path: &[String]) -> Option<String> {
        let joined = path.join(".");
        if self.registry.signature(&joined).is_some() {
            return Some(joined);
        }
        let first = path.first()?;
        for (use_path, alias) in &self.imports {
            let head = alias.as_deref().or(use_path.last().map(String::as_str))?;
            if head == first {
                let mut full = use_path.clone();
                full.extend(path[1..].iter().cloned());
                let name = full.join(".");
                if self.registry.signature(&name).is_some() {
                    return Some(name);
                }
            }
        }
        None
    }
}

fn compare_op(op: CmpOp) -> CompareOp {
    match op {
        CmpOp::Eq => CompareOp::Eq,
        CmpOp::Ne => CompareOp::Ne,
        CmpOp::Lt => CompareOp::Lt,
        CmpOp::Gt => CompareOp::Gt,
        CmpOp::Le => CompareOp::Le,
        CmpOp::Ge => CompareOp::Ge,
    }
}

/// Converts a literal token to its runtime value. Durations and rates have
/// no value-level counterpart.
fn literal_value(lit: &Literal) -> Option<Value> {
    Some(match lit {
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(x) => Value::Float(*x),
        Literal::Str(s) => Value::String(s.clone()),
        Literal::Bool(b) => Value::Boolean(*b),
        Literal::Duration(_) | Literal::Rate { .. } => return None,
    })
}

/// Extracts a constant value from a typed expression, recursing through
/// list and record literals.
fn const_value(expr: &TypedExpr) -> Option<Value> {
    match &expr.kind {
        TypedExprKind::Literal(value) => Some(value.clone()),
        TypedExprKind::ListLit(items) => {
            let values: Option<Vec<Value>> = items.iter().map(const_value).collect();
            Some(Value::List(values?))
        }
        TypedExprKind::RecordLit(fields) => {
            let mut record = IndexMap::with_capacity(fields.len());
            for (name, value) in fields {
                record.insert(name.clone(), const_value(value)?);
            }
            Some(Value::Record(record))
        }
        _ => None,
    }
}
