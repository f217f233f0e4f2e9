//! Process definitions: the authoring model, validation, the compiled
//! runtime graph and the repository the runtime resolves them from.

pub mod graph;
pub mod model;
pub mod repository;
pub mod validate;
pub mod yaml;

pub use graph::{Activity, ActivityKind, ProcessDefinition, SequenceFlow};
pub use model::{
    ConditionOp, ConditionValue, EdgeDto, GatewayDirection, NodeDto, ProcessModel,
    VariableCondition,
};
pub use repository::{DefinitionResolver, MemoryDefinitionRepository};
pub use validate::{validate_model, ValidationError};
pub use yaml::parse_process_yaml;
