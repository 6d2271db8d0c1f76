pub mod checker;
pub mod diagnostics;
mod options;
pub mod typed;

// Re-export commonly used types
pub use checker::{check_pipeline, CheckReport};
pub use diagnostics::{CheckError, CheckWarning};
pub use typed::{
    Builtin, MergeShape, TypedAnnotation, TypedAssign, TypedExpr, TypedExprKind, TypedInput,
    TypedInterpPart, TypedMatchArm, TypedOptions, TypedOutput, TypedPipeline,
};

#[cfg(test)]
mod tests {
    use super::*;
    use flowlang_core::dag::OnError;
    use flowlang_core::module::{
        ModuleDescriptor, ModuleError, ModuleIdentity, ModuleRegistry, ModuleSignature,
    };
    use flowlang_core::types::DataType;
    use flowlang_core::value::Value;
    use flowlang_parser::parse;

    fn echo_module(name: &str, consumes: Vec<(&str, DataType)>, produces: Vec<(&str, DataType)>) -> ModuleDescriptor {
        ModuleDescriptor::pure(
            ModuleIdentity::new(name, 1, 0),
            ModuleSignature::new(consumes, produces),
            |inputs| Ok(inputs),
        )
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry
            .register(echo_module(
                "Upper",
                vec![("text", DataType::String)],
                vec![("result", DataType::String)],
            ))
            .unwrap();
        registry
            .register(echo_module(
                "Concat",
                vec![("left", DataType::String), ("right", DataType::String)],
                vec![("result", DataType::String)],
            ))
            .unwrap();
        registry
            .register(echo_module(
                "Score",
                vec![("user", DataType::record([("name", DataType::String)]))],
                vec![
                    ("score", DataType::Float),
                    ("rank", DataType::Int),
                ],
            ))
            .unwrap();
        registry
            .register(echo_module(
                "text.Trim",
                vec![("text", DataType::String)],
                vec![("result", DataType::String)],
            ))
            .unwrap();
        registry
            .register({
                let mut desc = echo_module(
                    "Parse",
                    vec![("raw", DataType::String)],
                    vec![("value", DataType::union([DataType::Int, DataType::String]))],
                );
                desc.implementation = std::sync::Arc::new(NeverRun);
                desc
            })
            .unwrap();
        registry
    }

    struct NeverRun;

    #[async_trait::async_trait]
    impl flowlang_core::module::ModuleImpl for NeverRun {
        async fn invoke(&self, _inputs: Value) -> Result<Value, ModuleError> {
            Err(ModuleError::Fatal("not runnable in checker tests".into()))
        }
    }

    fn check_source(source: &str) -> CheckReport {
        let pipeline = parse(source).unwrap();
        check_pipeline(&pipeline, &registry())
    }

    fn typed(source: &str) -> TypedPipeline {
        let report = check_source(source);
        assert!(
            report.errors.is_empty(),
            "unexpected errors: {:?}",
            report.errors
        );
        report.typed.unwrap()
    }

    fn binding_type(pipeline: &TypedPipeline, name: &str) -> DataType {
        pipeline
            .assignments
            .iter()
            .find(|a| a.name == name)
            .unwrap_or_else(|| panic!("no binding '{name}'"))
            .expr
            .ty
            .clone()
    }

    #[test]
    fn checks_minimal_pipeline() {
        let pipeline = typed("in text: String\nresult = Upper(text)\nout result\n");
        assert_eq!(binding_type(&pipeline, "result"), DataType::String);
        assert_eq!(pipeline.outputs.len(), 1);
    }

    #[test]
    fn argument_type_mismatch_reports_argument_span() {
        let source = "in n: Int\nresult = Upper(n)\nout result\n";
        let report = check_source(source);
        assert!(report.typed.is_none());
        let err = report
            .errors
            .iter()
            .find_map(|e| match e {
                CheckError::TypeMismatch {
                    expected,
                    actual,
                    span,
                } => Some((expected.clone(), actual.clone(), *span)),
                _ => None,
            })
            .expect("expected a type mismatch");
        assert_eq!(err.0, DataType::String);
        assert_eq!(err.1, DataType::Int);
        assert_eq!(&source[err.2.start..err.2.end], "n");
    }

    #[test]
    fn undefined_names_are_reported_and_checking_continues() {
        let report = check_source("a = missing\nb = Nope(a)\nout b\n");
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::UndefinedVariable { name, .. } if name == "missing")));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::UndefinedFunction { name, .. } if name == "Nope")));
    }

    #[test]
    fn merge_field_set_is_union_with_right_wins() {
        let pipeline = typed(
            "in a: {x: Int, y: String}\nin b: {y: Float, z: Boolean}\nm = a + b\nout m\n",
        );
        assert_eq!(
            binding_type(&pipeline, "m"),
            DataType::record([
                ("x", DataType::Int),
                ("y", DataType::Float),
                ("z", DataType::Boolean),
            ])
        );
    }

    #[test]
    fn list_merge_broadcasts_and_warns() {
        let source = "in items: [{id: Int}]\nin extra: {tag: String}\nm = items + extra\nout m\n";
        let report = check_source(source);
        assert!(report.errors.is_empty());
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, CheckWarning::AmbiguousListMerge { .. })));
        let pipeline = report.typed.unwrap();
        assert_eq!(
            binding_type(&pipeline, "m"),
            DataType::list(DataType::record([
                ("id", DataType::Int),
                ("tag", DataType::String),
            ]))
        );
    }

    #[test]
    fn merge_of_primitives_is_incompatible() {
        let report = check_source("in a: Int\nin b: Int\nm = a + b\nout m\n");
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::IncompatibleMerge { .. })));
    }

    #[test]
    fn field_access_and_projection_broadcast() {
        let pipeline = typed(
            "in users: [{name: String, age: Int}]\nnames = users.name\nslim = users[name]\nout names\nout slim\n",
        );
        assert_eq!(
            binding_type(&pipeline, "names"),
            DataType::list(DataType::String)
        );
        assert_eq!(
            binding_type(&pipeline, "slim"),
            DataType::list(DataType::record([("name", DataType::String)]))
        );
    }

    #[test]
    fn when_yields_optional_and_coalesce_unwraps() {
        let pipeline = typed(
            "in s: String\nx = Upper(s) when length(s) > 3\ny = x ?? \"default\"\nout y\n",
        );
        assert_eq!(
            binding_type(&pipeline, "x"),
            DataType::optional(DataType::String)
        );
        assert_eq!(binding_type(&pipeline, "y"), DataType::String);
    }

    #[test]
    fn coalesce_requires_optional_left() {
        let report = check_source("in s: String\ny = s ?? \"d\"\nout y\n");
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::TypeMismatch { .. })));
    }

    #[test]
    fn if_yields_lub_union_when_branches_disagree() {
        let pipeline = typed("in c: Boolean\nx = if c then 1 else \"s\"\nout x\n");
        assert_eq!(
            binding_type(&pipeline, "x"),
            DataType::union([DataType::Int, DataType::String])
        );
    }

    #[test]
    fn match_must_be_exhaustive() {
        let source = "in s: String\nv = Parse(s)\nr = match v { n: Int -> \"i\" }\nout r\n";
        let report = check_source(source);
        let uncovered = report
            .errors
            .iter()
            .find_map(|e| match e {
                CheckError::NonExhaustiveMatch { uncovered, .. } => Some(uncovered.clone()),
                _ => None,
            })
            .expect("expected non-exhaustive match");
        assert_eq!(uncovered, vec!["String".to_string()]);
    }

    #[test]
    fn exhaustive_match_narrows_bindings() {
        let pipeline = typed(
            "in s: String\nv = Parse(s)\nr = match v { n: Int -> \"int\", t: String -> t }\nout r\n",
        );
        assert_eq!(binding_type(&pipeline, "r"), DataType::String);
    }

    #[test]
    fn multi_output_module_yields_record() {
        let pipeline = typed("in user: {name: String}\ns = Score(user)\nf = s.score\nout f\n");
        assert_eq!(
            binding_type(&pipeline, "s"),
            DataType::record([("score", DataType::Float), ("rank", DataType::Int)])
        );
        assert_eq!(binding_type(&pipeline, "f"), DataType::Float);
    }

    #[test]
    fn named_and_positional_arguments() {
        let pipeline =
            typed("in a: String\nin b: String\nc = Concat(right: b, left: a)\nout c\n");
        let TypedExprKind::ModuleCall { args, .. } = &pipeline.assignments[0].expr.kind else {
            panic!("expected module call");
        };
        // Ordered by signature regardless of call order.
        assert_eq!(args[0].0, "left");
        assert_eq!(args[1].0, "right");
    }

    #[test]
    fn arity_mismatch() {
        let report = check_source("in a: String\nc = Concat(a)\nout c\n");
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::ArityMismatch { expected: 2, actual: 1, .. })));
    }

    #[test]
    fn qualified_and_imported_module_names() {
        typed("in s: String\nt = text.Trim(s)\nout t\n");
        typed("use text.Trim\nin s: String\nt = Trim(s)\nout t\n");
        typed("use text.Trim as T\nin s: String\nt = T(s)\nout t\n");
    }

    #[test]
    fn lambda_parameter_inferred_from_builtin() {
        let pipeline = typed(
            "in users: [{name: String, age: Int}]\nadults = filter(users, (u) => u.age >= 18)\nnames = map(adults, (u) => u.name)\nok = all(users, (u) => length(u.name) > 0)\nout names\nout ok\n",
        );
        assert_eq!(
            binding_type(&pipeline, "names"),
            DataType::list(DataType::String)
        );
        assert_eq!(binding_type(&pipeline, "ok"), DataType::Boolean);
    }

    #[test]
    fn standalone_lambda_is_ambiguous() {
        let report = check_source("f = (x) => x\nout f\n");
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::AmbiguousLambda { .. })));
    }

    #[test]
    fn duplicate_bindings_are_rejected() {
        let report = check_source("in a: Int\na = 1\nout a\n");
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::DuplicateBinding { name, .. } if name == "a")));
    }

    #[test]
    fn duplicate_example_annotation_is_an_error() {
        let source = "@example(\"a\")\n@example(\"b\")\nin s: String\nout s\n";
        let report = check_source(source);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::DuplicateExampleAnnotation { .. })));
    }

    #[test]
    fn annotation_literals_are_captured() {
        let pipeline = typed("@example(\"hi\")\n@weight(3)\nin s: String\nout s\n");
        let annotations = &pipeline.inputs[0].annotations;
        assert_eq!(annotations[0].literal, Some(Value::String("hi".into())));
        assert_eq!(annotations[1].literal, Some(Value::Int(3)));
    }

    #[test]
    fn optional_inputs_are_not_required() {
        let pipeline = typed("in s: String?\nx = s ?? \"d\"\nout x\n");
        assert!(!pipeline.inputs[0].required);
    }

    #[test]
    fn unused_variable_warns() {
        let report = check_source("in s: String\nx = Upper(s)\ny = \"unused\"\nout x\n");
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, CheckWarning::UnusedVariable { name, .. } if name == "y")));
    }

    #[test]
    fn option_validation_and_consistency_warnings() {
        let source =
            "in s: String\nx = Upper(s) with delay: 1s, cache_backend: \"memory\"\nout x\n";
        let report = check_source(source);
        assert!(report.errors.is_empty());
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, CheckWarning::DelayWithoutRetry { .. })));
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, CheckWarning::CacheBackendWithoutCache { .. })));
    }

    #[test]
    fn negative_retry_is_an_error() {
        let report = check_source("in s: String\nx = Upper(s) with retry: -1\nout x\n");
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::InvalidOption { key, .. } if key == "retry")));
    }

    #[test]
    fn fallback_must_match_output_type() {
        let ok = check_source("in s: String\nx = Upper(s) with fallback: \"d\"\nout x\n");
        assert!(ok.errors.is_empty());

        let bad = check_source("in s: String\nx = Upper(s) with fallback: 3\nout x\n");
        assert!(bad
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::TypeMismatch { .. })));
    }

    #[test]
    fn wrap_changes_call_type_to_result_union() {
        let pipeline = typed("in s: String\nx = Upper(s) with on_error: wrap\nout x\n");
        assert_eq!(
            binding_type(&pipeline, "x"),
            DataType::union([
                DataType::record([("ok", DataType::String)]),
                DataType::record([("err", DataType::String)]),
            ])
        );
        let TypedExprKind::ModuleCall { options, .. } = &pipeline.assignments[0].expr.kind else {
            panic!("expected module call");
        };
        assert_eq!(options.on_error, OnError::Wrap);
    }

    #[test]
    fn unknown_option_is_an_error() {
        let report = check_source("in s: String\nx = Upper(s) with warp: 9\nout x\n");
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::InvalidOption { key, .. } if key == "warp")));
    }

    #[test]
    fn output_of_unknown_binding_is_an_error() {
        let report = check_source("in s: String\nout t\n");
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, CheckError::UndefinedVariable { name, .. } if name == "t")));
    }

    #[test]
    fn errors_render_with_caret() {
        let source = "in n: Int\nresult = Upper(n)\nout result\n";
        let report = check_source(source);
        let rendered = report.errors[0].render(source);
        assert!(rendered.contains("line 2"));
        assert!(rendered.contains('^'));
    }
}
