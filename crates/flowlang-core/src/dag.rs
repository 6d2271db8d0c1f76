//! The executable DAG spec: the immutable compilation artifact a pipeline
//! runs from.
//!
//! Two node kinds live in one [`StableGraph`]: module nodes (invoke a
//! registered module) and data nodes (hold one typed value, produced by user
//! input, a module output, or an inline transform). Edges carry the wiring:
//! `In` edges feed data into module parameters, `Out` edges connect modules
//! to their output data nodes, and `Uses` edges record transform input
//! dependencies so ordering and cycle detection see the whole dependency
//! structure.
//!
//! All mutations go through [`DagSpec`] builder methods; [`DagSpec::validate`]
//! checks every structural invariant the compiler guarantees.

use std::fmt;

use indexmap::IndexMap;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::EdgeRef;
use petgraph::visit::IntoEdgeReferences;
use petgraph::Directed;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hash::{hash_dag, ContentHash};
use crate::module::ModuleSignature;
use crate::transform::Transform;
use crate::types::DataType;
use crate::value::Value;

/// Stable node identifier. Maps to a petgraph `NodeIndex<u32>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl From<NodeIndex<u32>> for NodeId {
    fn from(idx: NodeIndex<u32>) -> Self {
        NodeId(idx.index() as u32)
    }
}

impl From<NodeId> for NodeIndex<u32> {
    fn from(id: NodeId) -> Self {
        NodeIndex::new(id.0 as usize)
    }
}

/// Scheduling priority attached to a node. Integer levels with custom
/// values supported; larger is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Priority {
    Background,
    Low,
    #[default]
    Normal,
    High,
    Critical,
    Custom(i32),
}

impl Priority {
    /// Numeric admission level.
    pub fn level(self) -> i32 {
        match self {
            Priority::Background => 0,
            Priority::Low => 10,
            Priority::Normal => 20,
            Priority::High => 30,
            Priority::Critical => 40,
            Priority::Custom(level) => level,
        }
    }
}

/// A throttle rate: `count` admissions per `per` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    pub count: u32,
    pub per: std::time::Duration,
}

/// Retry delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Backoff {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// What to do when a node fails after exhausting retries and fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OnError {
    #[default]
    Propagate,
    Skip,
    Log,
    Wrap,
}

/// Per-call options from the `with` clause, resolved at compile time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    pub retry: Option<u32>,
    pub delay: Option<std::time::Duration>,
    pub backoff: Backoff,
    pub timeout: Option<std::time::Duration>,
    /// Compiled fallback sub-DAG, bound to the same inputs.
    pub fallback: Option<Box<DagSpec>>,
    pub cache_ttl: Option<std::time::Duration>,
    pub cache_backend: Option<String>,
    pub throttle: Option<Rate>,
    pub concurrency: Option<u32>,
    pub on_error: OnError,
    pub lazy: bool,
    pub priority: Priority,
}

/// A literal annotation carried from an `@name(expr)` line. Non-literal
/// annotation values compile but do not serialize a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationSpec {
    pub name: String,
    pub value: Option<Value>,
}

/// How a data node gets its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataRole {
    /// Supplied externally at run start.
    Input {
        required: bool,
        annotations: Vec<AnnotationSpec>,
    },
    /// Written by its producing module's `Out` edge.
    ModuleOutput { field: String },
    /// Computed by the attached inline transform.
    Derived,
}

/// An inline transform and the data nodes it reads, in positional order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    pub transform: Transform,
    pub inputs: Vec<NodeId>,
}

/// A node invoking a registered module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleNodeSpec {
    /// Registered module name; resolution happens at execution start.
    pub module: String,
    pub min_version: Option<(u32, u32)>,
    /// The signature the pipeline was compiled against.
    pub signature: ModuleSignature,
    pub config: NodeConfig,
    /// Condition data node gating execution: when it evaluates false the
    /// module never fires.
    pub gate: Option<NodeId>,
    /// Human name for diagnostics (the assignment target, usually).
    pub display_name: String,
}

/// A node holding one typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNodeSpec {
    pub name: String,
    pub ty: DataType,
    /// Consumer module id → the parameter name this node feeds there.
    pub nicknames: Vec<(NodeId, String)>,
    pub transform: Option<TransformSpec>,
    pub role: DataRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DagNode {
    Module(ModuleNodeSpec),
    Data(DataNodeSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DagEdge {
    /// Data node → module parameter.
    In { param: String },
    /// Module → output data node.
    Out { field: String },
    /// Data node → derived data node (transform input at `slot`).
    Uses { slot: usize },
}

/// The immutable executable graph produced by compilation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DagSpec {
    graph: StableGraph<DagNode, DagEdge, Directed, u32>,
    /// Declared pipeline inputs: name → input data node.
    pub inputs: IndexMap<String, NodeId>,
    /// Declared outputs: output name → data node.
    pub outputs: IndexMap<String, NodeId>,
    /// Whether a run missing required inputs suspends instead of failing.
    pub resumable: bool,
}

impl DagSpec {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------
    // Builders (used by the compiler)
    // -------------------------------------------------------------------

    /// Adds a user-input data node and binds its name.
    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        ty: DataType,
        required: bool,
        annotations: Vec<AnnotationSpec>,
    ) -> NodeId {
        let name = name.into();
        let id: NodeId = self
            .graph
            .add_node(DagNode::Data(DataNodeSpec {
                name: name.clone(),
                ty,
                nicknames: Vec::new(),
                transform: None,
                role: DataRole::Input {
                    required,
                    annotations,
                },
            }))
            .into();
        self.inputs.insert(name, id);
        id
    }

    /// Adds a module node.
    pub fn add_module(&mut self, spec: ModuleNodeSpec) -> NodeId {
        self.graph.add_node(DagNode::Module(spec)).into()
    }

    /// Adds the data node for one module output field, wired with an `Out`
    /// edge from its producer.
    pub fn add_module_output(
        &mut self,
        producer: NodeId,
        field: impl Into<String>,
        ty: DataType,
        name: impl Into<String>,
    ) -> NodeId {
        let field = field.into();
        let id: NodeId = self
            .graph
            .add_node(DagNode::Data(DataNodeSpec {
                name: name.into(),
                ty,
                nicknames: Vec::new(),
                transform: None,
                role: DataRole::ModuleOutput {
                    field: field.clone(),
                },
            }))
            .into();
        self.graph
            .add_edge(producer.into(), id.into(), DagEdge::Out { field });
        id
    }

    /// Adds a derived data node computed by an inline transform, wiring
    /// `Uses` edges for each transform input.
    pub fn add_derived(
        &mut self,
        name: impl Into<String>,
        ty: DataType,
        transform: Transform,
        inputs: Vec<NodeId>,
    ) -> NodeId {
        let id: NodeId = self
            .graph
            .add_node(DagNode::Data(DataNodeSpec {
                name: name.into(),
                ty,
                nicknames: Vec::new(),
                transform: Some(TransformSpec {
                    transform,
                    inputs: inputs.clone(),
                }),
                role: DataRole::Derived,
            }))
            .into();
        for (slot, input) in inputs.into_iter().enumerate() {
            self.graph
                .add_edge(input.into(), id.into(), DagEdge::Uses { slot });
        }
        id
    }

    /// Feeds a data node into a module parameter: adds the `In` edge and
    /// registers the nickname on the data node.
    pub fn connect(
        &mut self,
        data: NodeId,
        module: NodeId,
        param: impl Into<String>,
    ) -> Result<(), CoreError> {
        let param = param.into();
        match self.graph.node_weight_mut(data.into()) {
            Some(DagNode::Data(spec)) => spec.nicknames.push((module, param.clone())),
            _ => return Err(CoreError::NodeNotFound { id: data }),
        }
        if !matches!(self.graph.node_weight(module.into()), Some(DagNode::Module(_))) {
            return Err(CoreError::NodeNotFound { id: module });
        }
        self.graph
            .add_edge(data.into(), module.into(), DagEdge::In { param });
        Ok(())
    }

    /// Gates a module node on a Boolean condition data node. The gate is
    /// recorded as a `Uses` dependency so ordering sees it.
    pub fn set_gate(&mut self, module: NodeId, condition: NodeId) -> Result<(), CoreError> {
        match self.graph.node_weight_mut(module.into()) {
            Some(DagNode::Module(spec)) => spec.gate = Some(condition),
            _ => return Err(CoreError::NodeNotFound { id: module }),
        }
        self.graph
            .add_edge(condition.into(), module.into(), DagEdge::Uses { slot: 0 });
        Ok(())
    }

    /// Binds an output name to a data node.
    pub fn bind_output(&mut self, name: impl Into<String>, id: NodeId) {
        self.outputs.insert(name.into(), id);
    }

    // -------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&DagNode> {
        self.graph.node_weight(id.into())
    }

    pub fn data_node(&self, id: NodeId) -> Result<&DataNodeSpec, CoreError> {
        match self.node(id) {
            Some(DagNode::Data(spec)) => Ok(spec),
            _ => Err(CoreError::NodeNotFound { id }),
        }
    }

    pub fn module_node(&self, id: NodeId) -> Result<&ModuleNodeSpec, CoreError> {
        match self.node(id) {
            Some(DagNode::Module(spec)) => Ok(spec),
            _ => Err(CoreError::NodeNotFound { id }),
        }
    }

    /// All node ids, in index order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.graph.node_indices().map(NodeId::from).collect()
    }

    pub fn module_ids(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|idx| matches!(self.graph[*idx], DagNode::Module(_)))
            .map(NodeId::from)
            .collect()
    }

    pub fn data_ids(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|idx| matches!(self.graph[*idx], DagNode::Data(_)))
            .map(NodeId::from)
            .collect()
    }

    /// A module's parameter wiring: `(param name, source data node)`.
    pub fn module_params(&self, module: NodeId) -> Vec<(String, NodeId)> {
        self.graph
            .edges_directed(module.into(), petgraph::Direction::Incoming)
            .filter_map(|edge| match edge.weight() {
                DagEdge::In { param } => Some((param.clone(), NodeId::from(edge.source()))),
                _ => None,
            })
            .collect()
    }

    /// A module's output wiring: `(field name, data node)`.
    pub fn module_outputs(&self, module: NodeId) -> Vec<(String, NodeId)> {
        self.graph
            .edges_directed(module.into(), petgraph::Direction::Outgoing)
            .filter_map(|edge| match edge.weight() {
                DagEdge::Out { field } => Some((field.clone(), NodeId::from(edge.target()))),
                _ => None,
            })
            .collect()
    }

    /// The `inEdges` set: `(data node, module node)` pairs.
    pub fn in_edges(&self) -> Vec<(NodeId, NodeId)> {
        self.edge_pairs(|e| matches!(e, DagEdge::In { .. }))
    }

    /// The `outEdges` set: `(module node, data node)` pairs.
    pub fn out_edges(&self) -> Vec<(NodeId, NodeId)> {
        self.edge_pairs(|e| matches!(e, DagEdge::Out { .. }))
    }

    fn edge_pairs(&self, keep: impl Fn(&DagEdge) -> bool) -> Vec<(NodeId, NodeId)> {
        self.graph
            .edge_references()
            .filter(|e| keep(e.weight()))
            .map(|e| (NodeId::from(e.source()), NodeId::from(e.target())))
            .collect()
    }

    /// Human-readable name for a node, for diagnostics.
    pub fn display_name(&self, id: NodeId) -> String {
        match self.node(id) {
            Some(DagNode::Module(m)) => m.display_name.clone(),
            Some(DagNode::Data(d)) => d.name.clone(),
            None => id.to_string(),
        }
    }

    /// Total order over all nodes respecting every edge. Fails with
    /// [`CoreError::DagCycle`] if the graph is cyclic.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, CoreError> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|order| order.into_iter().map(NodeId::from).collect())
            .map_err(|cycle| CoreError::DagCycle {
                nodes: vec![NodeId::from(cycle.node_id())],
            })
    }

    /// Structural hash: the spec's identity.
    pub fn structural_hash(&self) -> ContentHash {
        hash_dag(self)
    }

    // -------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------

    /// Checks every compile-time invariant: acyclicity, single producers,
    /// parameter coverage, edge subtyping, output bindings, gate types.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.topo_order()?;

        for idx in self.graph.node_indices() {
            let id = NodeId::from(idx);
            match &self.graph[idx] {
                DagNode::Data(spec) => {
                    let producers: Vec<&DagEdge> = self
                        .graph
                        .edges_directed(idx, petgraph::Direction::Incoming)
                        .map(|e| e.weight())
                        .collect();
                    match &spec.role {
                        DataRole::Input { .. } => {
                            if !producers.is_empty() {
                                return Err(violation(format!(
                                    "input node {id} must have no producer"
                                )));
                            }
                            if spec.transform.is_some() {
                                return Err(violation(format!(
                                    "input node {id} cannot carry a transform"
                                )));
                            }
                        }
                        DataRole::ModuleOutput { field } => {
                            let out_edges: Vec<_> = producers
                                .iter()
                                .filter(|e| matches!(e, DagEdge::Out { .. }))
                                .collect();
                            if out_edges.len() != 1 {
                                return Err(violation(format!(
                                    "module-output node {id} must have exactly one producer, found {}",
                                    out_edges.len()
                                )));
                            }
                            if !matches!(out_edges[0], DagEdge::Out { field: f } if f == field) {
                                return Err(violation(format!(
                                    "module-output node {id} producer field mismatch"
                                )));
                            }
                        }
                        DataRole::Derived => {
                            let Some(transform) = &spec.transform else {
                                return Err(violation(format!(
                                    "derived node {id} is missing its transform"
                                )));
                            };
                            if producers.iter().any(|e| matches!(e, DagEdge::Out { .. })) {
                                return Err(violation(format!(
                                    "derived node {id} cannot also be a module output"
                                )));
                            }
                            if let Some(arity) = transform.transform.fixed_arity() {
                                if transform.inputs.len() != arity {
                                    return Err(violation(format!(
                                        "derived node {id} transform expects {arity} inputs, wired {}",
                                        transform.inputs.len()
                                    )));
                                }
                            }
                            for input in &transform.inputs {
                                self.data_node(*input)?;
                            }
                        }
                    }
                }
                DagNode::Module(spec) => {
                    let params = self.module_params(id);
                    for (name, expected) in &spec.signature.consumes {
                        let sources: Vec<&NodeId> = params
                            .iter()
                            .filter(|(p, _)| p == name)
                            .map(|(_, src)| src)
                            .collect();
                        if sources.len() != 1 {
                            return Err(violation(format!(
                                "module {id} parameter '{name}' has {} sources, needs exactly 1",
                                sources.len()
                            )));
                        }
                        let source_ty = &self.data_node(*sources[0])?.ty;
                        if !source_ty.is_subtype_of(expected) {
                            return Err(CoreError::TypeMismatch {
                                expected: expected.to_string(),
                                actual: source_ty.to_string(),
                            });
                        }
                    }
                    if let Some(gate) = spec.gate {
                        let gate_ty = &self.data_node(gate)?.ty;
                        if !gate_ty.is_subtype_of(&DataType::Boolean) {
                            return Err(CoreError::TypeMismatch {
                                expected: DataType::Boolean.to_string(),
                                actual: gate_ty.to_string(),
                            });
                        }
                    }
                    for (field, out) in self.module_outputs(id) {
                        let Some(produced) = spec.signature.produces.get(&field) else {
                            return Err(violation(format!(
                                "module {id} has no output field '{field}'"
                            )));
                        };
                        let out_ty = &self.data_node(out)?.ty;
                        if !produced.is_subtype_of(out_ty) {
                            return Err(CoreError::TypeMismatch {
                                expected: out_ty.to_string(),
                                actual: produced.to_string(),
                            });
                        }
                    }
                }
            }
        }

        for (name, id) in &self.outputs {
            if self.data_node(*id).is_err() {
                return Err(violation(format!(
                    "output '{name}' is bound to missing data node {id}"
                )));
            }
        }
        for (name, id) in &self.inputs {
            let spec = self.data_node(*id)?;
            if !matches!(spec.role, DataRole::Input { .. }) {
                return Err(violation(format!(
                    "declared input '{name}' is not an input node"
                )));
            }
        }

        Ok(())
    }
}

fn violation(reason: String) -> CoreError {
    CoreError::InvariantViolation { reason }
}

/// A compiled pipeline ready for storage and execution: the spec plus its
/// content-addressed identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineImage {
    pub name: String,
    pub hash: ContentHash,
    pub spec: DagSpec,
}

impl PipelineImage {
    pub fn new(name: impl Into<String>, spec: DagSpec) -> Self {
        let hash = spec.structural_hash();
        PipelineImage {
            name: name.into(),
            hash,
            spec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleSignature;

    fn uppercase_signature() -> ModuleSignature {
        ModuleSignature::new(
            [("text", DataType::String)],
            [("result", DataType::String)],
        )
    }

    /// `in text: String; result = Uppercase(text); out result`
    fn uppercase_dag() -> DagSpec {
        let mut dag = DagSpec::new();
        let text = dag.add_input("text", DataType::String, true, vec![]);
        let module = dag.add_module(ModuleNodeSpec {
            module: "Uppercase".into(),
            min_version: None,
            signature: uppercase_signature(),
            config: NodeConfig::default(),
            gate: None,
            display_name: "result".into(),
        });
        dag.connect(text, module, "text").unwrap();
        let result = dag.add_module_output(module, "result", DataType::String, "result");
        dag.bind_output("result", result);
        dag
    }

    #[test]
    fn well_formed_dag_validates() {
        uppercase_dag().validate().unwrap();
    }

    #[test]
    fn topo_order_respects_edges() {
        let dag = uppercase_dag();
        let order = dag.topo_order().unwrap();
        assert_eq!(order.len(), 3);
        let pos = |id: NodeId| order.iter().position(|n| *n == id).unwrap();
        let text = dag.inputs["text"];
        let result = dag.outputs["result"];
        let module = dag.module_ids()[0];
        assert!(pos(text) < pos(module));
        assert!(pos(module) < pos(result));
    }

    #[test]
    fn cycle_is_detected() {
        let mut dag = DagSpec::new();
        let a = dag.add_derived("a", DataType::Int, Transform::Coalesce, vec![]);
        let b = dag.add_derived(
            "b",
            DataType::Int,
            Transform::FieldAccess("x".into()),
            vec![a],
        );
        // Manually wire a back-edge to create a cycle.
        dag.graph
            .add_edge(b.into(), a.into(), DagEdge::Uses { slot: 0 });
        assert!(matches!(
            dag.topo_order(),
            Err(CoreError::DagCycle { .. })
        ));
    }

    #[test]
    fn missing_parameter_source_fails_validation() {
        let mut dag = DagSpec::new();
        dag.add_module(ModuleNodeSpec {
            module: "Uppercase".into(),
            min_version: None,
            signature: uppercase_signature(),
            config: NodeConfig::default(),
            gate: None,
            display_name: "u".into(),
        });
        assert!(dag.validate().is_err());
    }

    #[test]
    fn edge_subtyping_is_enforced() {
        let mut dag = DagSpec::new();
        let n = dag.add_input("n", DataType::Int, true, vec![]);
        let module = dag.add_module(ModuleNodeSpec {
            module: "Uppercase".into(),
            min_version: None,
            signature: uppercase_signature(),
            config: NodeConfig::default(),
            gate: None,
            display_name: "u".into(),
        });
        dag.connect(n, module, "text").unwrap();
        assert!(matches!(
            dag.validate(),
            Err(CoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn nicknames_record_consumer_parameters() {
        let dag = uppercase_dag();
        let text = dag.inputs["text"];
        let module = dag.module_ids()[0];
        let spec = dag.data_node(text).unwrap();
        assert_eq!(spec.nicknames, vec![(module, "text".to_string())]);
    }

    #[test]
    fn in_and_out_edge_sets() {
        let dag = uppercase_dag();
        let module = dag.module_ids()[0];
        assert_eq!(dag.in_edges(), vec![(dag.inputs["text"], module)]);
        assert_eq!(dag.out_edges(), vec![(module, dag.outputs["result"])]);
    }

    #[test]
    fn structural_hash_is_stable_and_discriminating() {
        let a = uppercase_dag();
        let b = uppercase_dag();
        assert_eq!(a.structural_hash(), b.structural_hash());

        let mut c = uppercase_dag();
        c.add_input("extra", DataType::Int, false, vec![]);
        assert_ne!(a.structural_hash(), c.structural_hash());
    }

    #[test]
    fn serde_roundtrip_preserves_hash() {
        let dag = uppercase_dag();
        let json = serde_json::to_string(&dag).unwrap();
        let back: DagSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(dag.structural_hash(), back.structural_hash());
        back.validate().unwrap();
    }

    #[test]
    fn image_carries_spec_hash() {
        let dag = uppercase_dag();
        let expected = dag.structural_hash();
        let image = PipelineImage::new("upper", dag);
        assert_eq!(image.hash, expected);
    }
}
