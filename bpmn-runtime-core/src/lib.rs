//! Runtime execution core for BPMN-style process instances.
//!
//! The crate keeps each process instance as an arena of executions with
//! scoped variables and event subscriptions. Every mutation runs inside a
//! [`store::UnitOfWork`] that holds the instance's lock until it commits or
//! is dropped. [`runtime::RuntimeService`] is the façade callers use.

pub mod config;
pub mod correlation;
pub mod definition;
pub mod error;
pub mod events;
pub mod executor;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod store_memory;
pub mod subscriptions;
pub mod tree;
pub mod types;
pub mod value;
pub mod variables;

pub use config::{BroadcastPolicy, EngineConfig};
pub use correlation::CorrelationDispatcher;
pub use error::{EngineError, EngineResult, ObjectKind};
pub use runtime::RuntimeService;
pub use types::{Execution, ProcessInstance, StartProcess};
pub use value::{FromVariable, VariableType, VariableValue};
