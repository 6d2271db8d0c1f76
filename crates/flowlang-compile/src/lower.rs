//! Typed AST → IR lowering.
//!
//! Every expression gets a fresh IR node; variable references resolve to
//! the producing node's id. Lambdas flatten here: a lambda body becomes an
//! [`ExprCode`] tree whose slot 0 is the parameter and whose free variables
//! become capture slots, wired as additional transform inputs. Guards whose
//! operand is a module call are recorded as gate candidates so the DAG
//! builder can make the module conditional.

use flowlang_check::typed::{
    Builtin, TypedAssign, TypedExpr, TypedExprKind, TypedInterpPart, TypedOptions, TypedPipeline,
};
use flowlang_core::dag::{AnnotationSpec, Backoff, DagSpec, NodeConfig};
use flowlang_core::transform::{ExprCode, LambdaBody, StringPart, Transform};
use flowlang_core::types::DataType;

use crate::error::CompileError;
use crate::ir::{GateCandidate, IrGraph, IrId, IrNodeKind};

/// Lowers a checked pipeline into the IR graph.
pub fn lower_pipeline(pipeline: &TypedPipeline) -> Result<IrGraph, CompileError> {
    let mut lowerer = Lowerer {
        ir: IrGraph::new(),
    };

    for input in &pipeline.inputs {
        let annotations = input
            .annotations
            .iter()
            .map(|a| AnnotationSpec {
                name: a.name.clone(),
                value: a.literal.clone(),
            })
            .collect();
        let id = lowerer.ir.add(
            IrNodeKind::Input {
                name: input.name.clone(),
                required: input.required,
                annotations,
            },
            input.ty.clone(),
        );
        lowerer.ir.bindings.insert(input.name.clone(), id);
    }

    for TypedAssign { name, expr, .. } in &pipeline.assignments {
        let id = lowerer.lower_expr(expr)?;
        lowerer.ir.nodes[id.0 as usize].name.get_or_insert(name.clone());
        lowerer.ir.bindings.insert(name.clone(), id);
    }

    for output in &pipeline.outputs {
        let id = lowerer.ir.bindings[&output.name];
        lowerer.ir.outputs.insert(output.name.clone(), id);
    }

    Ok(lowerer.ir)
}

struct Lowerer {
    ir: IrGraph,
}

impl Lowerer {
    fn lower_expr(&mut self, expr: &TypedExpr) -> Result<IrId, CompileError> {
        let ty = expr.ty.clone();
        match &expr.kind {
            TypedExprKind::Var(name) => {
                self.ir
                    .bindings
                    .get(name)
                    .copied()
                    .ok_or_else(|| CompileError::UnboundVariable { name: name.clone() })
            }
            TypedExprKind::Literal(value) => Ok(self.transform(
                Transform::Literal(value.clone()),
                Vec::new(),
                ty,
            )),
            TypedExprKind::StringInterp(parts) => {
                let mut string_parts = Vec::with_capacity(parts.len());
                let mut inputs = Vec::new();
                for part in parts {
                    match part {
                        TypedInterpPart::Lit(text) => {
                            string_parts.push(StringPart::Lit(text.clone()));
                        }
                        TypedInterpPart::Expr(inner) => {
                            inputs.push(self.lower_expr(inner)?);
                            string_parts.push(StringPart::Input);
                        }
                    }
                }
                Ok(self.transform(Transform::StringInterp(string_parts), inputs, ty))
            }
            TypedExprKind::ListLit(items) => {
                let inputs = items
                    .iter()
                    .map(|item| self.lower_expr(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.transform(Transform::ListLiteral, inputs, ty))
            }
            TypedExprKind::RecordLit(fields) => {
                let mut names = Vec::with_capacity(fields.len());
                let mut inputs = Vec::with_capacity(fields.len());
                for (name, value) in fields {
                    names.push(name.clone());
                    inputs.push(self.lower_expr(value)?);
                }
                Ok(self.transform(Transform::RecordBuild(names), inputs, ty))
            }
            TypedExprKind::ModuleCall {
                module,
                signature,
                args,
                options,
            } => {
                let mut inputs = Vec::with_capacity(args.len());
                for (param, arg) in args {
                    inputs.push((param.clone(), self.lower_expr(arg)?));
                }
                let config = self.lower_options(signature, options)?;
                Ok(self.ir.add(
                    IrNodeKind::ModuleCall {
                        module: module.clone(),
                        signature: signature.clone(),
                        inputs,
                        config,
                    },
                    ty,
                ))
            }
            TypedExprKind::BuiltinCall { builtin, args } => match builtin {
                Builtin::Length => {
                    let operand = self.lower_expr(&args[0])?;
                    Ok(self.transform(Transform::Length, vec![operand], ty))
                }
                Builtin::Map | Builtin::Filter | Builtin::All | Builtin::Any => {
                    let list = self.lower_expr(&args[0])?;
                    let TypedExprKind::Lambda { params, body } = &args[1].kind else {
                        return Err(unresolved("lambda"));
                    };
                    let mut captures = Vec::new();
                    let code = self.lower_code(body, &params[0].0, &mut captures)?;
                    let lambda = LambdaBody { code };
                    let transform = match builtin {
                        Builtin::Map => Transform::MapList(lambda),
                        Builtin::Filter => Transform::FilterList(lambda),
                        Builtin::All => Transform::AllList(lambda),
                        Builtin::Any => Transform::AnyList(lambda),
                        Builtin::Length => unreachable!(),
                    };
                    let mut inputs = vec![list];
                    inputs.extend(self.resolve_captures(&captures)?);
                    Ok(self.transform(transform, inputs, ty))
                }
            },
            TypedExprKind::FieldAccess { base, field, .. } => {
                let base = self.lower_expr(base)?;
                Ok(self.transform(Transform::FieldAccess(field.clone()), vec![base], ty))
            }
            TypedExprKind::Project { base, fields, .. } => {
                let base = self.lower_expr(base)?;
                Ok(self.transform(Transform::Project(fields.clone()), vec![base], ty))
            }
            TypedExprKind::Merge { left, right, .. } => {
                let left = self.lower_expr(left)?;
                let right = self.lower_expr(right)?;
                Ok(self.transform(Transform::Merge, vec![left, right], ty))
            }
            TypedExprKind::If {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond = self.lower_expr(cond)?;
                let then_id = self.lower_expr(then_expr)?;
                let else_id = self.lower_expr(else_expr)?;
                Ok(self.transform(Transform::Conditional, vec![cond, then_id, else_id], ty))
            }
            TypedExprKind::Branch { arms, otherwise } => {
                let mut inputs = Vec::with_capacity(arms.len() * 2 + 1);
                for (cond, body) in arms {
                    inputs.push(self.lower_expr(cond)?);
                    inputs.push(self.lower_expr(body)?);
                }
                inputs.push(self.lower_expr(otherwise)?);
                Ok(self.transform(
                    Transform::Branch {
                        arm_count: arms.len(),
                    },
                    inputs,
                    ty,
                ))
            }
            TypedExprKind::Match { scrutinee, arms } => {
                let scrutinee_id = self.lower_expr(scrutinee)?;
                let mut captures = Vec::new();
                let mut patterns = Vec::with_capacity(arms.len());
                let mut bodies = Vec::with_capacity(arms.len());
                for arm in arms {
                    patterns.push(arm.pattern.clone());
                    let code = self.lower_code(&arm.body, &arm.binding, &mut captures)?;
                    bodies.push(LambdaBody { code });
                }
                let mut inputs = vec![scrutinee_id];
                inputs.extend(self.resolve_captures(&captures)?);
                Ok(self.transform(Transform::Match { patterns, bodies }, inputs, ty))
            }
            TypedExprKind::When { expr, cond } => {
                let cond_id = self.lower_expr(cond)?;
                let value_id = self.lower_expr(expr)?;
                let guard = self.transform(Transform::Guard, vec![cond_id, value_id], ty);
                if self.ir.node(value_id).is_module_call() {
                    self.ir.gates.push(GateCandidate {
                        module: value_id,
                        condition: cond_id,
                        guard,
                    });
                }
                Ok(guard)
            }
            TypedExprKind::Coalesce { left, right } => {
                let left = self.lower_expr(left)?;
                let right = self.lower_expr(right)?;
                Ok(self.transform(Transform::Coalesce, vec![left, right], ty))
            }
            TypedExprKind::And { left, right } => {
                let left = self.lower_expr(left)?;
                let right = self.lower_expr(right)?;
                Ok(self.transform(Transform::And, vec![left, right], ty))
            }
            TypedExprKind::Or { left, right } => {
                let left = self.lower_expr(left)?;
                let right = self.lower_expr(right)?;
                Ok(self.transform(Transform::Or, vec![left, right], ty))
            }
            TypedExprKind::Not(operand) => {
                let operand = self.lower_expr(operand)?;
                Ok(self.transform(Transform::Not, vec![operand], ty))
            }
            TypedExprKind::Compare { op, left, right } => {
                let left = self.lower_expr(left)?;
                let right = self.lower_expr(right)?;
                Ok(self.transform(Transform::Compare(*op), vec![left, right], ty))
            }
            TypedExprKind::Lambda { .. } => Err(CompileError::Check(
                flowlang_check::diagnostics::CheckError::AmbiguousLambda {
                    span: expr.span,
                },
            )),
            TypedExprKind::Poison => Err(unresolved("poisoned expression")),
        }
    }

    fn transform(&mut self, transform: Transform, inputs: Vec<IrId>, ty: DataType) -> IrId {
        self.ir.add(IrNodeKind::Transform { transform, inputs }, ty)
    }

    fn resolve_captures(&self, captures: &[String]) -> Result<Vec<IrId>, CompileError> {
        captures
            .iter()
            .map(|name| {
                self.ir
                    .bindings
                    .get(name)
                    .copied()
                    .ok_or_else(|| CompileError::UnboundVariable { name: name.clone() })
            })
            .collect()
    }

    // -------------------------------------------------------------------
    // Lambda bodies
    // -------------------------------------------------------------------

    /// Lowers an expression into [`ExprCode`] against a frame where slot 0
    /// is `binding` and free variables append to `captures`.
    fn lower_code(
        &mut self,
        expr: &TypedExpr,
        binding: &str,
        captures: &mut Vec<String>,
    ) -> Result<ExprCode, CompileError> {
        match &expr.kind {
            TypedExprKind::Var(name) => Ok(resolve_slot(name, binding, captures)),
            TypedExprKind::Literal(value) => Ok(apply(Transform::Literal(value.clone()), vec![])),
            TypedExprKind::StringInterp(parts) => {
                let mut string_parts = Vec::with_capacity(parts.len());
                let mut args = Vec::new();
                for part in parts {
                    match part {
                        TypedInterpPart::Lit(text) => {
                            string_parts.push(StringPart::Lit(text.clone()));
                        }
                        TypedInterpPart::Expr(inner) => {
                            args.push(self.lower_code(inner, binding, captures)?);
                            string_parts.push(StringPart::Input);
                        }
                    }
                }
                Ok(apply(Transform::StringInterp(string_parts), args))
            }
            TypedExprKind::ListLit(items) => {
                let args = items
                    .iter()
                    .map(|item| self.lower_code(item, binding, captures))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(apply(Transform::ListLiteral, args))
            }
            TypedExprKind::RecordLit(fields) => {
                let mut names = Vec::with_capacity(fields.len());
                let mut args = Vec::with_capacity(fields.len());
                for (name, value) in fields {
                    names.push(name.clone());
                    args.push(self.lower_code(value, binding, captures)?);
                }
                Ok(apply(Transform::RecordBuild(names), args))
            }
            TypedExprKind::ModuleCall { module, .. } => Err(CompileError::ModuleCallInLambda {
                module: module.clone(),
            }),
            TypedExprKind::BuiltinCall { builtin, args } => match builtin {
                Builtin::Length => {
                    let operand = self.lower_code(&args[0], binding, captures)?;
                    Ok(apply(Transform::Length, vec![operand]))
                }
                Builtin::Map | Builtin::Filter | Builtin::All | Builtin::Any => {
                    let list = self.lower_code(&args[0], binding, captures)?;
                    let TypedExprKind::Lambda { params, body } = &args[1].kind else {
                        return Err(unresolved("lambda"));
                    };
                    let mut inner_captures = Vec::new();
                    let code = self.lower_code(body, &params[0].0, &mut inner_captures)?;
                    let lambda = LambdaBody { code };
                    let transform = match builtin {
                        Builtin::Map => Transform::MapList(lambda),
                        Builtin::Filter => Transform::FilterList(lambda),
                        Builtin::All => Transform::AllList(lambda),
                        Builtin::Any => Transform::AnyList(lambda),
                        Builtin::Length => unreachable!(),
                    };
                    let mut call_args = vec![list];
                    for name in &inner_captures {
                        call_args.push(resolve_slot(name, binding, captures));
                    }
                    Ok(apply(transform, call_args))
                }
            },
            TypedExprKind::FieldAccess { base, field, .. } => {
                let base = self.lower_code(base, binding, captures)?;
                Ok(apply(Transform::FieldAccess(field.clone()), vec![base]))
            }
            TypedExprKind::Project { base, fields, .. } => {
                let base = self.lower_code(base, binding, captures)?;
                Ok(apply(Transform::Project(fields.clone()), vec![base]))
            }
            TypedExprKind::Merge { left, right, .. } => {
                let left = self.lower_code(left, binding, captures)?;
                let right = self.lower_code(right, binding, captures)?;
                Ok(apply(Transform::Merge, vec![left, right]))
            }
            TypedExprKind::If {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond = self.lower_code(cond, binding, captures)?;
                let then_code = self.lower_code(then_expr, binding, captures)?;
                let else_code = self.lower_code(else_expr, binding, captures)?;
                Ok(apply(Transform::Conditional, vec![cond, then_code, else_code]))
            }
            TypedExprKind::Branch { arms, otherwise } => {
                let mut args = Vec::with_capacity(arms.len() * 2 + 1);
                for (cond, body) in arms {
                    args.push(self.lower_code(cond, binding, captures)?);
                    args.push(self.lower_code(body, binding, captures)?);
                }
                args.push(self.lower_code(otherwise, binding, captures)?);
                Ok(apply(
                    Transform::Branch {
                        arm_count: arms.len(),
                    },
                    args,
                ))
            }
            TypedExprKind::Match { scrutinee, arms } => {
                let scrutinee_code = self.lower_code(scrutinee, binding, captures)?;
                let mut inner_captures = Vec::new();
                let mut patterns = Vec::with_capacity(arms.len());
                let mut bodies = Vec::with_capacity(arms.len());
                for arm in arms {
                    patterns.push(arm.pattern.clone());
                    let code = self.lower_code(&arm.body, &arm.binding, &mut inner_captures)?;
                    bodies.push(LambdaBody { code });
                }
                let mut args = vec![scrutinee_code];
                for name in &inner_captures {
                    args.push(resolve_slot(name, binding, captures));
                }
                Ok(apply(Transform::Match { patterns, bodies }, args))
            }
            TypedExprKind::When { expr, cond } => {
                let cond = self.lower_code(cond, binding, captures)?;
                let value = self.lower_code(expr, binding, captures)?;
                Ok(apply(Transform::Guard, vec![cond, value]))
            }
            TypedExprKind::Coalesce { left, right } => {
                let left = self.lower_code(left, binding, captures)?;
                let right = self.lower_code(right, binding, captures)?;
                Ok(apply(Transform::Coalesce, vec![left, right]))
            }
            TypedExprKind::And { left, right } => {
                let left = self.lower_code(left, binding, captures)?;
                let right = self.lower_code(right, binding, captures)?;
                Ok(apply(Transform::And, vec![left, right]))
            }
            TypedExprKind::Or { left, right } => {
                let left = self.lower_code(left, binding, captures)?;
                let right = self.lower_code(right, binding, captures)?;
                Ok(apply(Transform::Or, vec![left, right]))
            }
            TypedExprKind::Not(operand) => {
                let operand = self.lower_code(operand, binding, captures)?;
                Ok(apply(Transform::Not, vec![operand]))
            }
            TypedExprKind::Compare { op, left, right } => {
                let left = self.lower_code(left, binding, captures)?;
                let right = self.lower_code(right, binding, captures)?;
                Ok(apply(Transform::Compare(*op), vec![left, right]))
            }
            TypedExprKind::Lambda { .. } => Err(CompileError::Check(
                flowlang_check::diagnostics::CheckError::AmbiguousLambda {
                    span: expr.span,
                },
            )),
            TypedExprKind::Poison => Err(unresolved("poisoned expression")),
        }
    }

    // -------------------------------------------------------------------
    // Options
    // -------------------------------------------------------------------

    /// Turns resolved options into the node config, compiling the fallback
    /// into a sub-DAG bound to the module's own inputs.
    fn lower_options(
        &mut self,
        signature: &flowlang_core::module::ModuleSignature,
        options: &TypedOptions,
    ) -> Result<NodeConfig, CompileError> {
        let fallback = match &options.fallback {
            Some(expr) => Some(Box::new(compile_fallback(signature, expr)?)),
            None => None,
        };
        Ok(NodeConfig {
            retry: options.retry,
            delay: options.delay,
            backoff: options.backoff.unwrap_or(Backoff::Fixed),
            timeout: options.timeout,
            fallback,
            cache_ttl: options.cache,
            cache_backend: options.cache_backend.clone(),
            throttle: options.throttle,
            concurrency: options.concurrency,
            on_error: options.on_error,
            lazy: options.lazy,
            priority: options.priority,
        })
    }
}

/// Compiles a fallback expression into its own DAG spec. Its declared
/// inputs are the guarded module's parameters; the single output is named
/// `result`.
fn compile_fallback(
    signature: &flowlang_core::module::ModuleSignature,
    expr: &TypedExpr,
) -> Result<DagSpec, CompileError> {
    let mut lowerer = Lowerer { ir: IrGraph::new() };
    for (param, ty) in &signature.consumes {
        let id = lowerer.ir.add(
            IrNodeKind::Input {
                name: param.clone(),
                required: true,
                annotations: Vec::new(),
            },
            ty.clone(),
        );
        lowerer.ir.bindings.insert(param.clone(), id);
    }
    let value = lowerer.lower_expr(expr).map_err(|e| match e {
        CompileError::UnboundVariable { name } => CompileError::FallbackInput { name },
        other => other,
    })?;
    lowerer.ir.outputs.insert("result".to_string(), value);
    let ir = crate::optimize::optimize(lowerer.ir);
    crate::dag_build::build_dag(&ir, false).map(|(dag, _)| dag)
}

fn resolve_slot(name: &str, binding: &str, captures: &mut Vec<String>) -> ExprCode {
    if name == binding {
        return ExprCode::Slot(0);
    }
    let position = match captures.iter().position(|c| c == name) {
        Some(position) => position,
        None => {
            captures.push(name.to_string());
            captures.len() - 1
        }
    };
    ExprCode::Slot(1 + position)
}

fn apply(op: Transform, args: Vec<ExprCode>) -> ExprCode {
    ExprCode::Apply {
        op: Box::new(op),
        args,
    }
}

fn unresolved(name: &str) -> CompileError {
    CompileError::Build(flowlang_core::error::CoreError::InvariantViolation {
        reason: format!("unresolved reference '{name}' during lowering"),
    })
}
