//! The intermediate representation between the typed AST and the DAG spec.
//!
//! A flat graph of nodes with stable fresh ids. Three node kinds: pipeline
//! inputs, module calls, and inline transforms. Variable bindings and
//! declared outputs reference node ids; transform inputs are ordered id
//! lists. Lambdas have already been flattened into [`ExprCode`] bodies by
//! the time they appear here.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use flowlang_core::dag::{AnnotationSpec, NodeConfig};
use flowlang_core::module::ModuleSignature;
use flowlang_core::transform::Transform;
use flowlang_core::types::DataType;

/// Stable IR node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IrId(pub u32);

impl fmt::Display for IrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ir{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IrNodeKind {
    Input {
        name: String,
        required: bool,
        annotations: Vec<AnnotationSpec>,
    },
    ModuleCall {
        module: String,
        signature: ModuleSignature,
        /// `(parameter name, source node)` in signature order.
        inputs: Vec<(String, IrId)>,
        config: NodeConfig,
    },
    Transform {
        transform: Transform,
        inputs: Vec<IrId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrNode {
    pub id: IrId,
    pub kind: IrNodeKind,
    pub ty: DataType,
    /// Binding name, when the node is the value of an assignment.
    pub name: Option<String>,
}

impl IrNode {
    /// Ordered ids of every node this node reads.
    pub fn input_ids(&self) -> Vec<IrId> {
        match &self.kind {
            IrNodeKind::Input { .. } => Vec::new(),
            IrNodeKind::ModuleCall { inputs, .. } => inputs.iter().map(|(_, id)| *id).collect(),
            IrNodeKind::Transform { inputs, .. } => inputs.clone(),
        }
    }

    pub fn is_module_call(&self) -> bool {
        matches!(self.kind, IrNodeKind::ModuleCall { .. })
    }
}

/// A module node gated behind a guard condition: the module only fires when
/// the condition holds and its sole consumer is the guard node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateCandidate {
    pub module: IrId,
    pub condition: IrId,
    pub guard: IrId,
}

/// The IR graph: nodes in creation order, variable bindings, declared
/// outputs, and gate candidates discovered during lowering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IrGraph {
    pub nodes: Vec<IrNode>,
    pub bindings: IndexMap<String, IrId>,
    pub outputs: IndexMap<String, IrId>,
    pub gates: Vec<GateCandidate>,
}

impl IrGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: IrNodeKind, ty: DataType) -> IrId {
        let id = IrId(self.nodes.len() as u32);
        self.nodes.push(IrNode {
            id,
            kind,
            ty,
            name: None,
        });
        id
    }

    pub fn node(&self, id: IrId) -> &IrNode {
        &self.nodes[id.0 as usize]
    }

    /// How many nodes (plus outputs) consume each node.
    pub fn consumer_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            for input in node.input_ids() {
                counts[input.0 as usize] += 1;
            }
        }
        for id in self.outputs.values() {
            counts[id.0 as usize] += 1;
        }
        counts
    }

    /// The consumers of `id`, excluding output bindings.
    pub fn consumers(&self, id: IrId) -> Vec<IrId> {
        self.nodes
            .iter()
            .filter(|n| n.input_ids().contains(&id))
            .map(|n| n.id)
            .collect()
    }
}
