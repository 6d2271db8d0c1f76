//! The compilation pipeline: source text → AST → typed AST → IR → DAG spec.
//!
//! [`compile`] chains the phases and returns a content-addressed
//! [`PipelineImage`] plus warnings, or every error collected before the
//! failing phase.

pub mod dag_build;
pub mod error;
pub mod ir;
pub mod lower;
pub mod optimize;

use flowlang_check::check_pipeline;
use flowlang_check::diagnostics::CheckWarning;
use flowlang_core::dag::PipelineImage;
use flowlang_core::module::ModuleRegistry;

pub use error::{CompileError, CompileFailure};
pub use ir::{IrGraph, IrId, IrNode, IrNodeKind};

/// Compilation switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// A resumable pipeline suspends on missing required inputs instead of
    /// failing.
    pub resumable: bool,
}

/// A successful compilation: the image and any warnings.
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub image: PipelineImage,
    pub warnings: Vec<CheckWarning>,
}

/// Compiles pipeline source into an executable image.
pub fn compile(
    source: &str,
    name: &str,
    registry: &ModuleRegistry,
    options: CompileOptions,
) -> Result<CompileResult, CompileFailure> {
    let ast = flowlang_parser::parse(source)
        .map_err(|e| CompileFailure::from_error(CompileError::Parse(e)))?;

    let report = check_pipeline(&ast, registry);
    let mut warnings = report.warnings;
    let Some(typed) = report.typed else {
        return Err(CompileFailure {
            errors: report.errors.into_iter().map(CompileError::Check).collect(),
            warnings,
        });
    };

    let built = lower::lower_pipeline(&typed)
        .map(optimize::optimize)
        .and_then(|ir| dag_build::build_dag(&ir, options.resumable));
    match built {
        Ok((dag, mut build_warnings)) => {
            warnings.append(&mut build_warnings);
            Ok(CompileResult {
                image: PipelineImage::new(name, dag),
                warnings,
            })
        }
        Err(error) => Err(CompileFailure {
            errors: vec![error],
            warnings,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlang_core::dag::{DataRole, OnError};
    use flowlang_core::module::{ModuleDescriptor, ModuleIdentity, ModuleSignature};
    use flowlang_core::transform::Transform;
    use flowlang_core::types::DataType;
    use flowlang_core::value::Value;

    fn echo(name: &str, consumes: Vec<(&str, DataType)>, produces: Vec<(&str, DataType)>) -> ModuleDescriptor {
        ModuleDescriptor::pure(
            ModuleIdentity::new(name, 1, 0),
            ModuleSignature::new(consumes, produces),
            Ok,
        )
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry
            .register(echo(
                "Upper",
                vec![("text", DataType::String)],
                vec![("result", DataType::String)],
            ))
            .unwrap();
        registry
            .register(echo(
                "Trim",
                vec![("text", DataType::String)],
                vec![("result", DataType::String)],
            ))
            .unwrap();
        registry
            .register(echo(
                "Concat",
                vec![("left", DataType::String), ("right", DataType::String)],
                vec![("result", DataType::String)],
            ))
            .unwrap();
        registry
            .register(echo(
                "Stats",
                vec![("items", DataType::list(DataType::Int))],
                vec![("mean", DataType::Float), ("count", DataType::Int)],
            ))
            .unwrap();
        registry
    }

    fn compile_ok(source: &str) -> CompileResult {
        compile(source, "test", &registry(), CompileOptions::default())
            .unwrap_or_else(|f| panic!("compile failed: {:?}", f.errors))
    }

    #[test]
    fn compiles_minimal_pipeline() {
        let result = compile_ok("in text: String\nresult = Upper(text)\nout result\n");
        let dag = &result.image.spec;
        dag.validate().unwrap();
        assert_eq!(dag.module_ids().len(), 1);
        assert_eq!(dag.inputs.len(), 1);
        assert_eq!(dag.outputs.len(), 1);
        // input -> module -> output data node
        let module = dag.module_ids()[0];
        assert_eq!(dag.in_edges(), vec![(dag.inputs["text"], module)]);
        assert_eq!(dag.out_edges(), vec![(module, dag.outputs["result"])]);
    }

    #[test]
    fn type_error_produces_no_dag() {
        let failure = compile(
            "in n: Int\nresult = Upper(n)\nout result\n",
            "bad",
            &registry(),
            CompileOptions::default(),
        )
        .unwrap_err();
        assert!(failure.errors.iter().any(|e| matches!(
            e,
            CompileError::Check(flowlang_check::diagnostics::CheckError::TypeMismatch { .. })
        )));
    }

    #[test]
    fn fan_out_shares_one_input_node() {
        let result = compile_ok(
            "in s: String\na = Trim(s)\nb = Upper(s)\nc = Concat(a, b)\nout c\n",
        );
        let dag = &result.image.spec;
        assert_eq!(dag.module_ids().len(), 3);
        // Both Trim and Upper consume the same input data node.
        let consumers: Vec<_> = dag
            .in_edges()
            .into_iter()
            .filter(|(data, _)| *data == dag.inputs["s"])
            .collect();
        assert_eq!(consumers.len(), 2);
    }

    #[test]
    fn constant_folding_collapses_literal_exprs() {
        let result = compile_ok("x = if true then 1 else 2\nout x\n");
        let dag = &result.image.spec;
        let out = dag.data_node(dag.outputs["x"]).unwrap();
        let transform = &out.transform.as_ref().unwrap().transform;
        assert_eq!(transform, &Transform::Literal(Value::Int(1)));
    }

    #[test]
    fn dead_code_is_eliminated() {
        let result = compile_ok("in s: String\nused = Upper(s)\ndead = [s, s]\nout used\n");
        let dag = &result.image.spec;
        let derived: Vec<_> = dag
            .data_ids()
            .into_iter()
            .filter(|id| {
                matches!(
                    dag.data_node(*id).unwrap().role,
                    DataRole::Derived
                )
            })
            .collect();
        assert!(derived.is_empty(), "unused list literal must be dropped");
    }

    #[test]
    fn cse_deduplicates_repeated_access() {
        let result = compile_ok(
            "in user: {name: String}\na = Upper(user.name)\nb = Trim(user.name)\nout a\nout b\n",
        );
        let dag = &result.image.spec;
        let field_accesses = dag
            .data_ids()
            .into_iter()
            .filter(|id| {
                dag.data_node(*id)
                    .unwrap()
                    .transform
                    .as_ref()
                    .is_some_and(|t| matches!(t.transform, Transform::FieldAccess(_)))
            })
            .count();
        assert_eq!(field_accesses, 1);
    }

    #[test]
    fn guarded_module_is_gated() {
        let result = compile_ok(
            "in s: String\nx = Upper(s) when length(s) > 3\ny = x ?? \"default\"\nout y\n",
        );
        let dag = &result.image.spec;
        let module = dag.module_ids()[0];
        let spec = dag.module_node(module).unwrap();
        let gate = spec.gate.expect("module must be gated by its guard");
        assert!(dag
            .data_node(gate)
            .unwrap()
            .ty
            .is_subtype_of(&DataType::Boolean));
    }

    #[test]
    fn module_with_other_consumers_is_not_gated() {
        let result = compile_ok(
            "in s: String\nu = Upper(s)\nx = u when length(s) > 3\ny = x ?? u\nout y\n",
        );
        let dag = &result.image.spec;
        let spec = dag.module_node(dag.module_ids()[0]).unwrap();
        assert!(spec.gate.is_none());
    }

    #[test]
    fn options_land_in_node_config() {
        let result = compile_ok(
            "in s: String\nx = Upper(s) with retry: 3, delay: 1ms, backoff: exponential, timeout: 5s, concurrency: 2, on_error: skip, priority: high\nout x\n",
        );
        let dag = &result.image.spec;
        let config = &dag.module_node(dag.module_ids()[0]).unwrap().config;
        assert_eq!(config.retry, Some(3));
        assert_eq!(config.delay, Some(std::time::Duration::from_millis(1)));
        assert_eq!(
            config.backoff,
            flowlang_core::dag::Backoff::Exponential
        );
        assert_eq!(config.timeout, Some(std::time::Duration::from_secs(5)));
        assert_eq!(config.concurrency, Some(2));
        assert_eq!(config.on_error, OnError::Skip);
        assert_eq!(config.priority, flowlang_core::dag::Priority::High);
    }

    #[test]
    fn fallback_compiles_to_sub_dag() {
        let result = compile_ok(
            "in s: String\nx = Upper(s) with retry: 1, fallback: \"default\"\nout x\n",
        );
        let dag = &result.image.spec;
        let config = &dag.module_node(dag.module_ids()[0]).unwrap().config;
        let fallback = config.fallback.as_ref().expect("fallback sub-dag");
        assert_eq!(fallback.inputs.len(), 1, "bound to the module's inputs");
        assert!(fallback.outputs.contains_key("result"));
        fallback.validate().unwrap();
    }

    #[test]
    fn fallback_may_use_module_inputs_only() {
        let failure = compile(
            "in s: String\nin t: String\nx = Upper(s) with fallback: t\nout x\n",
            "bad",
            &registry(),
            CompileOptions::default(),
        )
        .unwrap_err();
        assert!(failure
            .errors
            .iter()
            .any(|e| matches!(e, CompileError::FallbackInput { name } if name == "t")));
    }

    #[test]
    fn module_call_in_lambda_is_rejected() {
        let failure = compile(
            "in xs: [String]\nys = map(xs, (x) => Upper(x))\nout ys\n",
            "bad",
            &registry(),
            CompileOptions::default(),
        )
        .unwrap_err();
        assert!(failure
            .errors
            .iter()
            .any(|e| matches!(e, CompileError::ModuleCallInLambda { module } if module == "Upper")));
    }

    #[test]
    fn multi_output_module_builds_record_value() {
        let result = compile_ok(
            "in items: [Int]\ns = Stats(items)\nm = s.mean\nout m\n",
        );
        let dag = &result.image.spec;
        let module = dag.module_ids()[0];
        assert_eq!(dag.module_outputs(module).len(), 2);
    }

    #[test]
    fn structural_hash_is_reproducible_and_sensitive() {
        let source = "in text: String\nresult = Upper(text)\nout result\n";
        let a = compile_ok(source);
        let b = compile_ok(source);
        assert_eq!(a.image.hash, b.image.hash);

        let c = compile_ok("in text: String\nresult = Trim(text)\nout result\n");
        assert_ne!(a.image.hash, c.image.hash);
    }

    #[test]
    fn lambda_captures_become_transform_inputs() {
        let result = compile_ok(
            "in xs: [{score: Int}]\nin threshold: Int\nbig = filter(xs, (x) => x.score > threshold)\nout big\n",
        );
        let dag = &result.image.spec;
        let filter_node = dag
            .data_ids()
            .into_iter()
            .find(|id| {
                dag.data_node(*id)
                    .unwrap()
                    .transform
                    .as_ref()
                    .is_some_and(|t| matches!(t.transform, Transform::FilterList(_)))
            })
            .expect("filter transform present");
        let spec = dag.data_node(filter_node).unwrap();
        let inputs = &spec.transform.as_ref().unwrap().inputs;
        assert_eq!(inputs.len(), 2, "list plus one capture");
        assert_eq!(inputs[1], dag.inputs["threshold"]);
    }

    #[test]
    fn every_compiled_dag_satisfies_invariants() {
        for source in [
            "in text: String\nresult = Upper(text)\nout result\n",
            "in s: String\na = Trim(s)\nb = Upper(s)\nc = Concat(a, b)\nout c\n",
            "in s: String\nx = Upper(s) when length(s) > 3\ny = x ?? \"d\"\nout y\n",
            "in u: {name: String, age: Int}\nv = u[name] + {tag: \"x\"}\nout v\n",
        ] {
            let result = compile_ok(source);
            result.image.spec.validate().unwrap();
            let order = result.image.spec.topo_order().unwrap();
            assert_eq!(order.len(), result.image.spec.node_ids().len());
        }
    }
}
