//! IR → DAG spec synthesis.
//!
//! Walks the IR in id order (children precede parents), assigning a module
//! node per module call and a data node per input, per module output field,
//! and per inline-transform result. Multi-output module calls get a derived
//! record-build node so the call expression still maps to one data node.
//! Gate candidates whose module output is consumed only by the guard become
//! conditional modules.

use flowlang_check::diagnostics::CheckWarning;
use flowlang_core::dag::{DagSpec, ModuleNodeSpec, NodeId};
use flowlang_core::transform::Transform;
use flowlang_core::types::DataType;
use flowlang_parser::span::Span;

use crate::error::CompileError;
use crate::ir::{IrGraph, IrNodeKind};

/// Builds and validates the executable DAG spec. Returns compile-stage
/// warnings alongside (currently: `lazy` with no conditional consumer).
pub fn build_dag(ir: &IrGraph, resumable: bool) -> Result<(DagSpec, Vec<CheckWarning>), CompileError> {
    let mut dag = DagSpec::new();
    dag.resumable = resumable;
    let mut warnings = Vec::new();

    // IR id → the data node holding that expression's value.
    let mut value_node: Vec<Option<NodeId>> = vec![None; ir.nodes.len()];
    // IR id → the module node, for module calls.
    let mut module_node: Vec<Option<NodeId>> = vec![None; ir.nodes.len()];

    for node in &ir.nodes {
        let display = node.name.clone();
        match &node.kind {
            IrNodeKind::Input {
                name,
                required,
                annotations,
            } => {
                let id = dag.add_input(name.clone(), node.ty.clone(), *required, annotations.clone());
                value_node[node.id.0 as usize] = Some(id);
            }
            IrNodeKind::ModuleCall {
                module,
                signature,
                inputs,
                config,
            } => {
                let display_name = display.unwrap_or_else(|| module.clone());
                let module_id = dag.add_module(ModuleNodeSpec {
                    module: module.clone(),
                    min_version: None,
                    signature: signature.clone(),
                    config: config.clone(),
                    gate: None,
                    display_name: display_name.clone(),
                });
                module_node[node.id.0 as usize] = Some(module_id);
                for (param, source) in inputs {
                    let source_id = value_node[source.0 as usize]
                        .ok_or_else(|| invariant(format!("module input {source} not built")))?;
                    dag.connect(source_id, module_id, param.clone())?;
                }

                let mut field_nodes = Vec::with_capacity(signature.produces.len());
                for (field, field_ty) in &signature.produces {
                    let data_id = dag.add_module_output(
                        module_id,
                        field.clone(),
                        field_ty.clone(),
                        format!("{display_name}.{field}"),
                    );
                    field_nodes.push((field.clone(), data_id));
                }
                let value_id = if field_nodes.len() == 1 {
                    field_nodes[0].1
                } else {
                    // One data node for the whole call value.
                    let names: Vec<String> =
                        field_nodes.iter().map(|(f, _)| f.clone()).collect();
                    let inputs: Vec<NodeId> = field_nodes.iter().map(|(_, id)| *id).collect();
                    dag.add_derived(
                        display_name,
                        DataType::Record(signature.produces.clone()),
                        Transform::RecordBuild(names),
                        inputs,
                    )
                };
                value_node[node.id.0 as usize] = Some(value_id);
            }
            IrNodeKind::Transform { transform, inputs } => {
                let wired: Vec<NodeId> = inputs
                    .iter()
                    .map(|source| {
                        value_node[source.0 as usize]
                            .ok_or_else(|| invariant(format!("transform input {source} not built")))
                    })
                    .collect::<Result<_, _>>()?;
                let name = display.unwrap_or_else(|| node.id.to_string());
                let id = dag.add_derived(name, node.ty.clone(), transform.clone(), wired);
                value_node[node.id.0 as usize] = Some(id);
            }
        }
    }

    // Gates: a module consumed solely through its guard never fires when the
    // guard condition is false.
    let counts = ir.consumer_counts();
    for gate in &ir.gates {
        let sole_consumer = counts[gate.module.0 as usize] == 1
            && !ir.outputs.values().any(|id| *id == gate.module)
            && ir.consumers(gate.module) == vec![gate.guard];
        if !sole_consumer {
            continue;
        }
        let module_id = module_node[gate.module.0 as usize]
            .ok_or_else(|| invariant("gate candidate is not a module".into()))?;
        let condition_id = value_node[gate.condition.0 as usize]
            .ok_or_else(|| invariant("gate condition not built".into()))?;
        dag.set_gate(module_id, condition_id)?;
    }

    // `lazy: true` asks for gating; warn when nothing conditional consumes
    // the module.
    for node in &ir.nodes {
        let IrNodeKind::ModuleCall { config, .. } = &node.kind else {
            continue;
        };
        if config.lazy {
            let gated = module_node[node.id.0 as usize]
                .and_then(|id| dag.module_node(id).ok())
                .is_some_and(|spec| spec.gate.is_some());
            if !gated {
                warnings.push(CheckWarning::LazyWithoutConditionalConsumer {
                    span: Span::default(),
                });
            }
        }
    }

    for (name, id) in &ir.outputs {
        let data_id = value_node[id.0 as usize]
            .ok_or_else(|| invariant(format!("output '{name}' not built")))?;
        dag.bind_output(name.clone(), data_id);
    }

    dag.topo_order()?;
    dag.validate()?;
    Ok((dag, warnings))
}

fn invariant(reason: String) -> CompileError {
    CompileError::Build(flowlang_core::error::CoreError::InvariantViolation { reason })
}
