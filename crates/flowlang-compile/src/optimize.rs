//! IR optimization passes, applied before DAG synthesis:
//!
//! 1. **Constant folding**: a pure transform whose inputs are all literals
//!    is applied at compile time.
//! 2. **Dead-code elimination**: nodes from which no declared output is
//!    reachable are dropped. Input nodes always survive: they are the
//!    pipeline's interface.
//! 3. **Common-subexpression elimination**: structurally identical pure
//!    transforms (same payload, same inputs) collapse to one node, keyed by
//!    content hash. Module calls are never merged.
//!
//! Lowering creates children before parents, so iterating nodes in id order
//! is a topological traversal.

use std::collections::HashMap;

use flowlang_core::transform::Transform;
use flowlang_core::value::Value;

use crate::ir::{IrGraph, IrId, IrNode, IrNodeKind};

/// Runs all passes.
pub fn optimize(ir: IrGraph) -> IrGraph {
    let ir = fold_constants(ir);
    let ir = eliminate_dead_code(ir);
    eliminate_common_subexpressions(ir)
}

fn literal_of(node: &IrNode) -> Option<&Value> {
    match &node.kind {
        IrNodeKind::Transform {
            transform: Transform::Literal(value),
            ..
        } => Some(value),
        _ => None,
    }
}

/// Applies pure transforms over all-literal inputs at compile time.
pub fn fold_constants(mut ir: IrGraph) -> IrGraph {
    for index in 0..ir.nodes.len() {
        let IrNodeKind::Transform { transform, inputs } = &ir.nodes[index].kind else {
            continue;
        };
        if matches!(transform, Transform::Literal(_)) || inputs.is_empty() {
            continue;
        }
        let values: Option<Vec<Value>> = inputs
            .iter()
            .map(|id| literal_of(ir.node(*id)).cloned())
            .collect();
        let Some(values) = values else { continue };
        if let Ok(folded) = transform.apply(&values) {
            ir.nodes[index].kind = IrNodeKind::Transform {
                transform: Transform::Literal(folded),
                inputs: Vec::new(),
            };
        }
    }
    ir
}

/// Drops nodes no declared output reaches. Inputs are kept as interface.
pub fn eliminate_dead_code(ir: IrGraph) -> IrGraph {
    let mut alive = vec![false; ir.nodes.len()];
    let mut stack: Vec<IrId> = ir.outputs.values().copied().collect();
    for node in &ir.nodes {
        if matches!(node.kind, IrNodeKind::Input { .. }) {
            stack.push(node.id);
        }
    }
    while let Some(id) = stack.pop() {
        if alive[id.0 as usize] {
            continue;
        }
        alive[id.0 as usize] = true;
        stack.extend(ir.node(id).input_ids());
    }
    let identity: Vec<IrId> = (0..ir.nodes.len() as u32).map(IrId).collect();
    compact(ir, &alive, &identity)
}

/// Collapses structurally identical pure transforms. The content key is the
/// canonical serialization of the transform payload plus its (already
/// rewritten) input ids.
pub fn eliminate_common_subexpressions(mut ir: IrGraph) -> IrGraph {
    let len = ir.nodes.len();
    let mut replace: Vec<IrId> = (0..len as u32).map(IrId).collect();
    let mut alive = vec![true; len];
    let mut seen: HashMap<blake3::Hash, IrId> = HashMap::new();

    for index in 0..len {
        // Rewrite inputs through earlier replacements first.
        let node = &mut ir.nodes[index];
        match &mut node.kind {
            IrNodeKind::Transform { inputs, .. } => {
                for input in inputs.iter_mut() {
                    *input = replace[input.0 as usize];
                }
            }
            IrNodeKind::ModuleCall { inputs, .. } => {
                for (_, input) in inputs.iter_mut() {
                    *input = replace[input.0 as usize];
                }
            }
            IrNodeKind::Input { .. } => {}
        }

        let node = &ir.nodes[index];
        let IrNodeKind::Transform { transform, inputs } = &node.kind else {
            continue;
        };
        let bytes = serde_json::to_vec(&(transform, inputs)).expect("transforms serialize");
        let key = blake3::hash(&bytes);
        match seen.get(&key) {
            Some(representative) => {
                replace[index] = *representative;
                alive[index] = false;
            }
            None => {
                seen.insert(key, node.id);
            }
        }
    }

    compact(ir, &alive, &replace)
}

/// Rebuilds the graph keeping only `alive` nodes, following `replace`
/// indirections, and renumbering ids densely.
fn compact(ir: IrGraph, alive: &[bool], replace: &[IrId]) -> IrGraph {
    let resolve = |id: IrId| replace[id.0 as usize];

    let mut remap: Vec<Option<IrId>> = vec![None; ir.nodes.len()];
    let mut nodes = Vec::new();
    for node in &ir.nodes {
        if !alive[node.id.0 as usize] {
            continue;
        }
        let new_id = IrId(nodes.len() as u32);
        remap[node.id.0 as usize] = Some(new_id);
        nodes.push(node.clone());
    }

    let map_id = |id: IrId| -> Option<IrId> { remap[resolve(id).0 as usize] };

    for node in &mut nodes {
        node.id = remap[node.id.0 as usize].expect("alive nodes are remapped");
        match &mut node.kind {
            IrNodeKind::Transform { inputs, .. } => {
                for input in inputs.iter_mut() {
                    *input = map_id(*input).expect("inputs of alive nodes stay alive");
                }
            }
            IrNodeKind::ModuleCall { inputs, .. } => {
                for (_, input) in inputs.iter_mut() {
                    *input = map_id(*input).expect("inputs of alive nodes stay alive");
                }
            }
            IrNodeKind::Input { .. } => {}
        }
    }

    let bindings = ir
        .bindings
        .iter()
        .filter_map(|(name, id)| map_id(*id).map(|new| (name.clone(), new)))
        .collect();
    let outputs = ir
        .outputs
        .iter()
        .filter_map(|(name, id)| map_id(*id).map(|new| (name.clone(), new)))
        .collect();
    let gates = ir
        .gates
        .iter()
        .filter_map(|gate| {
            Some(crate::ir::GateCandidate {
                module: map_id(gate.module)?,
                condition: map_id(gate.condition)?,
                guard: map_id(gate.guard)?,
            })
        })
        .collect();

    IrGraph {
        nodes,
        bindings,
        outputs,
        gates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlang_core::transform::CompareOp;
    use flowlang_core::types::DataType;

    fn literal(ir: &mut IrGraph, value: Value) -> IrId {
        let ty = value.type_of();
        ir.add(
            IrNodeKind::Transform {
                transform: Transform::Literal(value),
                inputs: vec![],
            },
            ty,
        )
    }

    #[test]
    fn folds_comparison_of_literals() {
        let mut ir = IrGraph::new();
        let a = literal(&mut ir, Value::Int(2));
        let b = literal(&mut ir, Value::Int(3));
        let cmp = ir.add(
            IrNodeKind::Transform {
                transform: Transform::Compare(CompareOp::Lt),
                inputs: vec![a, b],
            },
            DataType::Boolean,
        );
        ir.outputs.insert("o".into(), cmp);

        let folded = fold_constants(ir);
        assert_eq!(
            literal_of(folded.node(cmp)),
            Some(&Value::Boolean(true))
        );
    }

    #[test]
    fn dce_drops_unreachable_transforms_but_keeps_inputs() {
        let mut ir = IrGraph::new();
        let input = ir.add(
            IrNodeKind::Input {
                name: "x".into(),
                required: true,
                annotations: vec![],
            },
            DataType::Int,
        );
        ir.bindings.insert("x".into(), input);
        let dead = literal(&mut ir, Value::Int(9));
        let _dead_use = ir.add(
            IrNodeKind::Transform {
                transform: Transform::ListLiteral,
                inputs: vec![dead],
            },
            DataType::list(DataType::Int),
        );
        let live = ir.add(
            IrNodeKind::Transform {
                transform: Transform::ListLiteral,
                inputs: vec![input],
            },
            DataType::list(DataType::Int),
        );
        ir.outputs.insert("o".into(), live);

        let out = eliminate_dead_code(ir);
        assert_eq!(out.nodes.len(), 2, "input and live node survive");
        assert!(out
            .nodes
            .iter()
            .any(|n| matches!(n.kind, IrNodeKind::Input { .. })));
    }

    #[test]
    fn cse_merges_identical_transforms() {
        let mut ir = IrGraph::new();
        let input = ir.add(
            IrNodeKind::Input {
                name: "r".into(),
                required: true,
                annotations: vec![],
            },
            DataType::record([("f", DataType::Int)]),
        );
        ir.bindings.insert("r".into(), input);
        let access1 = ir.add(
            IrNodeKind::Transform {
                transform: Transform::FieldAccess("f".into()),
                inputs: vec![input],
            },
            DataType::Int,
        );
        let access2 = ir.add(
            IrNodeKind::Transform {
                transform: Transform::FieldAccess("f".into()),
                inputs: vec![input],
            },
            DataType::Int,
        );
        let pair = ir.add(
            IrNodeKind::Transform {
                transform: Transform::ListLiteral,
                inputs: vec![access1, access2],
            },
            DataType::list(DataType::Int),
        );
        ir.outputs.insert("o".into(), pair);

        let out = eliminate_common_subexpressions(ir);
        assert_eq!(out.nodes.len(), 3, "one field access remains");
        let list_node = out
            .nodes
            .iter()
            .find(|n| matches!(&n.kind, IrNodeKind::Transform { transform: Transform::ListLiteral, .. }))
            .unwrap();
        let inputs = list_node.input_ids();
        assert_eq!(inputs[0], inputs[1], "both uses point at the survivor");
    }

    #[test]
    fn cse_never_merges_module_calls() {
        use flowlang_core::dag::NodeConfig;
        use flowlang_core::module::ModuleSignature;

        let mut ir = IrGraph::new();
        let input = ir.add(
            IrNodeKind::Input {
                name: "s".into(),
                required: true,
                annotations: vec![],
            },
            DataType::String,
        );
        let signature = ModuleSignature::new(
            [("text", DataType::String)],
            [("result", DataType::String)],
        );
        let call = |ir: &mut IrGraph| {
            ir.add(
                IrNodeKind::ModuleCall {
                    module: "Upper".into(),
                    signature: signature.clone(),
                    inputs: vec![("text".into(), input)],
                    config: NodeConfig::default(),
                },
                DataType::String,
            )
        };
        let a = call(&mut ir);
        let b = call(&mut ir);
        ir.outputs.insert("a".into(), a);
        ir.outputs.insert("b".into(), b);

        let out = optimize(ir);
        assert_eq!(
            out.nodes
                .iter()
                .filter(|n| n.is_module_call())
                .count(),
            2
        );
    }
}
