//! Inline transforms: the closed family of pure computations attached to
//! data nodes.
//!
//! Expressions that do not require a user module (merges, projections,
//! conditionals, lambda bodies, …) compile to a [`Transform`] on a data node
//! instead of paying a full module boundary. The apply contract is total and
//! pure: given the transform's positional input values, produce one output
//! value or a [`CoreError`].
//!
//! Lambda-carrying transforms (`MapList`, `FilterList`, match arms, …) hold
//! an [`ExprCode`] tree. Lambdas are flattened at compile time: free
//! variables of the body become additional transform inputs, so `ExprCode`
//! leaves only ever reference frame slots.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::CoreError;
use crate::types::DataType;
use crate::value::Value;

/// Comparison operators usable in expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// One segment of an interpolated string. `Input` consumes the next
/// positional input value, rendered bare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StringPart {
    Lit(String),
    Input,
}

/// A compiled lambda body. Slot 0 holds the lambda parameter; further slots
/// hold captured free variables, supplied as extra transform inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaBody {
    pub code: ExprCode,
}

/// A compact, evaluable expression tree for lambda bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprCode {
    /// Reference to a frame slot.
    Slot(usize),
    /// Apply a transform to argument expressions.
    Apply {
        op: Box<Transform>,
        args: Vec<ExprCode>,
    },
}

/// The closed transform family.
///
/// Input conventions (positional):
/// - `Merge`: `[left, right]`
/// - `Conditional`: `[cond, then, else]`
/// - `Branch`: `[c1, e1, …, cN, eN, otherwise]` with `arm_count = N`
/// - `Match`: `[scrutinee, captures…]`; arm bodies see the scrutinee in
///   slot 0
/// - `Guard`: `[cond, value]`, producing an optional
/// - `Coalesce`: `[optional, fallback]`
/// - list transforms: `[list, captures…]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    Merge,
    Project(Vec<String>),
    FieldAccess(String),
    Conditional,
    Branch {
        arm_count: usize,
    },
    Match {
        patterns: Vec<DataType>,
        bodies: Vec<LambdaBody>,
    },
    And,
    Or,
    Not,
    Guard,
    Coalesce,
    Literal(Value),
    ListLiteral,
    RecordBuild(Vec<String>),
    StringInterp(Vec<StringPart>),
    Compare(CompareOp),
    MapList(LambdaBody),
    FilterList(LambdaBody),
    AllList(LambdaBody),
    AnyList(LambdaBody),
    Length,
}

impl Transform {
    /// Applies the transform to its positional inputs.
    pub fn apply(&self, inputs: &[Value]) -> Result<Value, CoreError> {
        match self {
            Transform::Merge => arg(inputs, 0)?.merge(arg(inputs, 1)?),
            Transform::Project(fields) => arg(inputs, 0)?.project(fields),
            Transform::FieldAccess(field) => arg(inputs, 0)?.access(field),
            Transform::Conditional => {
                if arg(inputs, 0)?.as_boolean()? {
                    Ok(arg(inputs, 1)?.clone())
                } else {
                    Ok(arg(inputs, 2)?.clone())
                }
            }
            Transform::Branch { arm_count } => {
                for i in 0..*arm_count {
                    if arg(inputs, 2 * i)?.as_boolean()? {
                        return Ok(arg(inputs, 2 * i + 1)?.clone());
                    }
                }
                Ok(arg(inputs, 2 * arm_count)?.clone())
            }
            Transform::Match { patterns, bodies } => {
                let scrutinee = arg(inputs, 0)?;
                let captures = &inputs[1..];
                let actual = scrutinee.type_of();
                for (pattern, body) in patterns.iter().zip(bodies) {
                    if actual.is_subtype_of(pattern) {
                        return body.eval(scrutinee, captures);
                    }
                }
                Err(CoreError::NoMatchingArm { actual })
            }
            Transform::And => Ok(Value::Boolean(
                arg(inputs, 0)?.as_boolean()? && arg(inputs, 1)?.as_boolean()?,
            )),
            Transform::Or => Ok(Value::Boolean(
                arg(inputs, 0)?.as_boolean()? || arg(inputs, 1)?.as_boolean()?,
            )),
            Transform::Not => Ok(Value::Boolean(!arg(inputs, 0)?.as_boolean()?)),
            Transform::Guard => {
                if arg(inputs, 0)?.as_boolean()? {
                    Ok(Value::present(arg(inputs, 1)?.clone()))
                } else {
                    Ok(Value::absent())
                }
            }
            Transform::Coalesce => match arg(inputs, 0)? {
                Value::Optional(Some(inner)) => Ok((**inner).clone()),
                Value::Optional(None) => Ok(arg(inputs, 1)?.clone()),
                other => Err(CoreError::type_mismatch("Optional", other.kind_name())),
            },
            Transform::Literal(value) => Ok(value.clone()),
            Transform::ListLiteral => Ok(Value::List(inputs.to_vec()).compact()),
            Transform::RecordBuild(fields) => {
                if fields.len() != inputs.len() {
                    return Err(invariant(format!(
                        "record build expects {} inputs, got {}",
                        fields.len(),
                        inputs.len()
                    )));
                }
                Ok(Value::Record(
                    fields.iter().cloned().zip(inputs.iter().cloned()).collect(),
                ))
            }
            Transform::StringInterp(parts) => {
                let mut out = String::new();
                let mut next_input = 0;
                for part in parts {
                    match part {
                        StringPart::Lit(s) => out.push_str(s),
                        StringPart::Input => {
                            out.push_str(&arg(inputs, next_input)?.render());
                            next_input += 1;
                        }
                    }
                }
                Ok(Value::String(out))
            }
            Transform::Compare(op) => compare(*op, arg(inputs, 0)?, arg(inputs, 1)?),
            Transform::MapList(body) => {
                let items = expect_list(arg(inputs, 0)?)?;
                let captures = &inputs[1..];
                let mapped: Vec<Value> = items
                    .iter()
                    .map(|item| body.eval(item, captures))
                    .collect::<Result<_, _>>()?;
                Ok(Value::List(mapped).compact())
            }
            Transform::FilterList(body) => {
                let items = expect_list(arg(inputs, 0)?)?;
                let captures = &inputs[1..];
                let mut kept = Vec::new();
                for item in items {
                    if body.eval(&item, captures)?.as_boolean()? {
                        kept.push(item);
                    }
                }
                Ok(Value::List(kept).compact())
            }
            Transform::AllList(body) => {
                let items = expect_list(arg(inputs, 0)?)?;
                let captures = &inputs[1..];
                for item in items {
                    if !body.eval(&item, captures)?.as_boolean()? {
                        return Ok(Value::Boolean(false));
                    }
                }
                Ok(Value::Boolean(true))
            }
            Transform::AnyList(body) => {
                let items = expect_list(arg(inputs, 0)?)?;
                let captures = &inputs[1..];
                for item in items {
                    if body.eval(&item, captures)?.as_boolean()? {
                        return Ok(Value::Boolean(true));
                    }
                }
                Ok(Value::Boolean(false))
            }
            Transform::Length => match arg(inputs, 0)? {
                Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                list @ (Value::List(_) | Value::IntBuffer(_) | Value::FloatBuffer(_)) => {
                    let items = expect_list(list)?;
                    Ok(Value::Int(items.len() as i64))
                }
                other => Err(CoreError::type_mismatch(
                    "String or List",
                    other.kind_name(),
                )),
            },
        }
    }

    /// Number of input values the transform consumes, when fixed by its
    /// payload. `None` means the arity is decided by the compiler wiring
    /// (captures, list literal length, …).
    pub fn fixed_arity(&self) -> Option<usize> {
        match self {
            Transform::Merge
            | Transform::And
            | Transform::Or
            | Transform::Guard
            | Transform::Coalesce
            | Transform::Compare(_) => Some(2),
            Transform::Project(_)
            | Transform::FieldAccess(_)
            | Transform::Not
            | Transform::Length => Some(1),
            Transform::Conditional => Some(3),
            Transform::Branch { arm_count } => Some(2 * arm_count + 1),
            Transform::Literal(_) => Some(0),
            Transform::RecordBuild(fields) => Some(fields.len()),
            Transform::Match { .. }
            | Transform::ListLiteral
            | Transform::StringInterp(_)
            | Transform::MapList(_)
            | Transform::FilterList(_)
            | Transform::AllList(_)
            | Transform::AnyList(_) => None,
        }
    }
}

impl LambdaBody {
    /// Evaluates the body with `param` in slot 0 and captures following.
    pub fn eval(&self, param: &Value, captures: &[Value]) -> Result<Value, CoreError> {
        let mut frame: SmallVec<[Value; 4]> = SmallVec::with_capacity(1 + captures.len());
        frame.push(param.clone());
        frame.extend(captures.iter().cloned());
        self.code.eval(&frame)
    }

    /// The frame slots this body can read. See
    /// [`ExprCode::referenced_slots`].
    pub fn referenced_slots(&self) -> BTreeSet<usize> {
        self.code.referenced_slots()
    }
}

impl ExprCode {
    /// The frame slots this expression can read, in order.
    ///
    /// Nested lambda bodies (map/filter/match arms inside the code) run in
    /// their own frames; their captures arrive through `Apply` arguments,
    /// which are walked here. The result is therefore exactly the
    /// outer-frame footprint, letting the executor await only the cells a
    /// taken match arm needs.
    pub fn referenced_slots(&self) -> BTreeSet<usize> {
        let mut slots = BTreeSet::new();
        self.collect_slots(&mut slots);
        slots
    }

    fn collect_slots(&self, slots: &mut BTreeSet<usize>) {
        match self {
            ExprCode::Slot(slot) => {
                slots.insert(*slot);
            }
            ExprCode::Apply { args, .. } => {
                for arg in args {
                    arg.collect_slots(slots);
                }
            }
        }
    }

    /// Evaluates the expression against a frame of slot values.
    ///
    /// Control operators evaluate selectively: the untaken arm of a
    /// conditional, branch, guard, or short-circuit boolean is never
    /// evaluated, so its errors cannot surface.
    pub fn eval(&self, frame: &[Value]) -> Result<Value, CoreError> {
        match self {
            ExprCode::Slot(i) => frame
                .get(*i)
                .cloned()
                .ok_or_else(|| invariant(format!("lambda frame has no slot {i}"))),
            ExprCode::Apply { op, args } => match op.as_ref() {
                Transform::Conditional => {
                    let cond = code_arg(args, 0)?.eval(frame)?.as_boolean()?;
                    let taken = if cond { 1 } else { 2 };
                    code_arg(args, taken)?.eval(frame)
                }
                Transform::Branch { arm_count } => {
                    for i in 0..*arm_count {
                        if code_arg(args, 2 * i)?.eval(frame)?.as_boolean()? {
                            return code_arg(args, 2 * i + 1)?.eval(frame);
                        }
                    }
                    code_arg(args, 2 * arm_count)?.eval(frame)
                }
                Transform::And => {
                    if !code_arg(args, 0)?.eval(frame)?.as_boolean()? {
                        return Ok(Value::Boolean(false));
                    }
                    Ok(Value::Boolean(
                        code_arg(args, 1)?.eval(frame)?.as_boolean()?,
                    ))
                }
                Transform::Or => {
                    if code_arg(args, 0)?.eval(frame)?.as_boolean()? {
                        return Ok(Value::Boolean(true));
                    }
                    Ok(Value::Boolean(
                        code_arg(args, 1)?.eval(frame)?.as_boolean()?,
                    ))
                }
                Transform::Guard => {
                    if code_arg(args, 0)?.eval(frame)?.as_boolean()? {
                        Ok(Value::present(code_arg(args, 1)?.eval(frame)?))
                    } else {
                        Ok(Value::absent())
                    }
                }
                Transform::Coalesce => match code_arg(args, 0)?.eval(frame)? {
                    Value::Optional(Some(inner)) => Ok(*inner),
                    Value::Optional(None) => code_arg(args, 1)?.eval(frame),
                    other => Err(CoreError::type_mismatch("Optional", other.kind_name())),
                },
                op => {
                    let values: Vec<Value> = args
                        .iter()
                        .map(|a| a.eval(frame))
                        .collect::<Result<_, _>>()?;
                    op.apply(&values)
                }
            },
        }
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<Value, CoreError> {
    match op {
        CompareOp::Eq => Ok(Value::Boolean(left == right)),
        CompareOp::Ne => Ok(Value::Boolean(left != right)),
        _ => {
            let ordering = match (left, right) {
                (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
                (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
                (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
                (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return Err(CoreError::type_mismatch(
                    "comparable operands",
                    format!("{} and {}", left.kind_name(), right.kind_name()),
                ));
            };
            let result = match op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Ge => ordering.is_ge(),
                CompareOp::Eq | CompareOp::Ne => unreachable!(),
            };
            Ok(Value::Boolean(result))
        }
    }
}

fn expect_list(value: &Value) -> Result<Vec<Value>, CoreError> {
    value
        .list_items()
        .ok_or_else(|| CoreError::type_mismatch("List", value.kind_name()))
}

fn arg<'a>(inputs: &'a [Value], i: usize) -> Result<&'a Value, CoreError> {
    inputs
        .get(i)
        .ok_or_else(|| invariant(format!("transform expects input {i}, got {}", inputs.len())))
}

fn code_arg(args: &[ExprCode], i: usize) -> Result<&ExprCode, CoreError> {
    args.get(i)
        .ok_or_else(|| invariant(format!("lambda body expects argument {i}")))
}

fn invariant(reason: String) -> CoreError {
    CoreError::InvariantViolation { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(v: Value) -> ExprCode {
        ExprCode::Apply {
            op: Box::new(Transform::Literal(v)),
            args: vec![],
        }
    }

    #[test]
    fn merge_transform() {
        let out = Transform::Merge
            .apply(&[
                Value::record([("a", Value::Int(1))]),
                Value::record([("b", Value::Int(2))]),
            ])
            .unwrap();
        assert_eq!(out, Value::record([("a", Value::Int(1)), ("b", Value::Int(2))]));
    }

    #[test]
    fn conditional_picks_arm() {
        let t = Transform::Conditional;
        assert_eq!(
            t.apply(&[Value::Boolean(true), Value::Int(1), Value::Int(2)])
                .unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            t.apply(&[Value::Boolean(false), Value::Int(1), Value::Int(2)])
                .unwrap(),
            Value::Int(2)
        );
    }

    #[test]
    fn branch_falls_through_to_otherwise() {
        let t = Transform::Branch { arm_count: 2 };
        let inputs = [
            Value::Boolean(false),
            Value::Int(1),
            Value::Boolean(false),
            Value::Int(2),
            Value::Int(99),
        ];
        assert_eq!(t.apply(&inputs).unwrap(), Value::Int(99));
    }

    #[test]
    fn guard_wraps_in_optional() {
        let t = Transform::Guard;
        assert_eq!(
            t.apply(&[Value::Boolean(true), Value::Int(5)]).unwrap(),
            Value::present(Value::Int(5))
        );
        assert_eq!(
            t.apply(&[Value::Boolean(false), Value::Int(5)]).unwrap(),
            Value::absent()
        );
    }

    #[test]
    fn coalesce_unwraps_or_falls_back() {
        let t = Transform::Coalesce;
        assert_eq!(
            t.apply(&[Value::present(Value::Int(5)), Value::Int(0)])
                .unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            t.apply(&[Value::absent(), Value::Int(0)]).unwrap(),
            Value::Int(0)
        );
    }

    #[test]
    fn match_selects_by_runtime_type() {
        let t = Transform::Match {
            patterns: vec![DataType::Int, DataType::String],
            bodies: vec![
                LambdaBody {
                    code: lit(Value::String("int".into())),
                },
                LambdaBody {
                    code: ExprCode::Slot(0),
                },
            ],
        };
        assert_eq!(
            t.apply(&[Value::Int(3)]).unwrap(),
            Value::String("int".into())
        );
        assert_eq!(
            t.apply(&[Value::String("s".into())]).unwrap(),
            Value::String("s".into())
        );
        assert!(matches!(
            t.apply(&[Value::Boolean(true)]),
            Err(CoreError::NoMatchingArm { .. })
        ));
    }

    #[test]
    fn string_interp_renders_bare() {
        let t = Transform::StringInterp(vec![
            StringPart::Lit("hello ".into()),
            StringPart::Input,
            StringPart::Lit("!".into()),
        ]);
        assert_eq!(
            t.apply(&[Value::String("world".into())]).unwrap(),
            Value::String("hello world!".into())
        );
    }

    #[test]
    fn record_build_zips_names_and_inputs() {
        let t = Transform::RecordBuild(vec!["a".into(), "b".into()]);
        assert_eq!(
            t.apply(&[Value::Int(1), Value::Int(2)]).unwrap(),
            Value::record([("a", Value::Int(1)), ("b", Value::Int(2))])
        );
    }

    #[test]
    fn map_filter_all_any() {
        let double = LambdaBody {
            code: ExprCode::Apply {
                op: Box::new(Transform::Merge),
                args: vec![ExprCode::Slot(0), ExprCode::Slot(1)],
            },
        };
        let items = Value::List(vec![
            Value::record([("x", Value::Int(1))]),
            Value::record([("x", Value::Int(2))]),
        ]);
        let extra = Value::record([("tag", Value::Boolean(true))]);
        let mapped = Transform::MapList(double)
            .apply(&[items.clone(), extra])
            .unwrap();
        assert_eq!(
            mapped.list_items().unwrap().len(),
            2,
            "map preserves length"
        );

        let gt_one = LambdaBody {
            code: ExprCode::Apply {
                op: Box::new(Transform::Compare(CompareOp::Gt)),
                args: vec![
                    ExprCode::Apply {
                        op: Box::new(Transform::FieldAccess("x".into())),
                        args: vec![ExprCode::Slot(0)],
                    },
                    lit(Value::Int(1)),
                ],
            },
        };
        let filtered = Transform::FilterList(gt_one.clone())
            .apply(&[items.clone()])
            .unwrap();
        assert_eq!(filtered.list_items().unwrap().len(), 1);
        assert_eq!(
            Transform::AllList(gt_one.clone()).apply(&[items.clone()]).unwrap(),
            Value::Boolean(false)
        );
        assert_eq!(
            Transform::AnyList(gt_one).apply(&[items]).unwrap(),
            Value::Boolean(true)
        );
    }

    #[test]
    fn map_over_buffer_list() {
        let inc = LambdaBody {
            code: ExprCode::Apply {
                op: Box::new(Transform::Compare(CompareOp::Ge)),
                args: vec![ExprCode::Slot(0), lit(Value::Int(2))],
            },
        };
        let buf = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]).compact();
        let out = Transform::MapList(inc).apply(&[buf]).unwrap();
        assert_eq!(
            out,
            Value::List(vec![
                Value::Boolean(false),
                Value::Boolean(true),
                Value::Boolean(true)
            ])
        );
    }

    #[test]
    fn length_counts_chars_and_items() {
        assert_eq!(
            Transform::Length
                .apply(&[Value::String("abcd".into())])
                .unwrap(),
            Value::Int(4)
        );
        assert_eq!(
            Transform::Length
                .apply(&[Value::List(vec![Value::Int(1)])])
                .unwrap(),
            Value::Int(1)
        );
    }

    #[test]
    fn compare_supports_mixed_numerics() {
        assert_eq!(
            Transform::Compare(CompareOp::Lt)
                .apply(&[Value::Int(1), Value::Float(1.5)])
                .unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            Transform::Compare(CompareOp::Eq)
                .apply(&[Value::String("a".into()), Value::String("a".into())])
                .unwrap(),
            Value::Boolean(true)
        );
    }

    #[test]
    fn lambda_untaken_arm_errors_do_not_surface() {
        // (x) => if true then x else x.missing  -- the else arm would fail.
        let body = LambdaBody {
            code: ExprCode::Apply {
                op: Box::new(Transform::Conditional),
                args: vec![
                    lit(Value::Boolean(true)),
                    ExprCode::Slot(0),
                    ExprCode::Apply {
                        op: Box::new(Transform::FieldAccess("missing".into())),
                        args: vec![ExprCode::Slot(0)],
                    },
                ],
            },
        };
        assert_eq!(body.eval(&Value::Int(1), &[]).unwrap(), Value::Int(1));
    }

    #[test]
    fn referenced_slots_walk_args_but_not_nested_frames() {
        // any(Slot(1), (y) => y == <inner Slot(1)>) alongside Slot(2): the
        // inner lambda's slots belong to its own frame and must not leak;
        // its captures show up as the outer Apply arguments.
        let inner = LambdaBody {
            code: ExprCode::Apply {
                op: Box::new(Transform::Compare(CompareOp::Eq)),
                args: vec![ExprCode::Slot(0), ExprCode::Slot(1)],
            },
        };
        let outer = ExprCode::Apply {
            op: Box::new(Transform::ListLiteral),
            args: vec![
                ExprCode::Apply {
                    op: Box::new(Transform::AnyList(inner)),
                    args: vec![ExprCode::Slot(1), ExprCode::Slot(3)],
                },
                ExprCode::Slot(2),
            ],
        };
        let slots: Vec<usize> = outer.referenced_slots().into_iter().collect();
        assert_eq!(slots, vec![1, 2, 3]);
    }

    #[test]
    fn literal_and_list_literal() {
        assert_eq!(
            Transform::Literal(Value::Int(7)).apply(&[]).unwrap(),
            Value::Int(7)
        );
        let list = Transform::ListLiteral
            .apply(&[Value::Int(1), Value::Int(2)])
            .unwrap();
        assert_eq!(list, Value::List(vec![Value::Int(1), Value::Int(2)]));
    }
}
