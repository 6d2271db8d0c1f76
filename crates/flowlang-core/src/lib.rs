pub mod dag;
pub mod error;
pub mod hash;
pub mod module;
pub mod transform;
pub mod types;
pub mod value;

// Re-export commonly used types
pub use dag::{
    AnnotationSpec, Backoff, DagEdge, DagNode, DagSpec, DataNodeSpec, DataRole, ModuleNodeSpec,
    NodeConfig, NodeId, OnError, PipelineImage, Priority, Rate, TransformSpec,
};
pub use error::CoreError;
pub use hash::{hash_named_inputs, hash_value, ContentHash};
pub use module::{
    ModuleConfig, ModuleDescriptor, ModuleError, ModuleIdentity, ModuleImpl, ModuleKind,
    ModuleRegistry, ModuleSignature,
};
pub use transform::{CompareOp, ExprCode, LambdaBody, StringPart, Transform};
pub use types::DataType;
pub use value::Value;
