use crate::value::VariableType;
use std::fmt;

/// Which kind of object a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    ProcessDefinition,
    ProcessInstance,
    Execution,
    Job,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::ProcessDefinition => "process definition",
            ObjectKind::ProcessInstance => "process instance",
            ObjectKind::Execution => "execution",
            ObjectKind::Job => "job",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by engine operations.
///
/// Absent variables and already-removed subscriptions are not errors; the
/// operations that touch them report absence through `Option` or a count.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A required identifier was empty or a request was incomplete.
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{message}")]
    NotFound { kind: ObjectKind, message: String },

    #[error("variable '{name}' is of type {actual} and cannot be read as {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: VariableType,
    },

    /// The operation is not allowed in the current lifecycle state
    /// (suspended instance, ended execution, no wait state to resume).
    #[error("{0}")]
    InvalidState(String),

    /// A signal or message had no matching subscription on the target.
    #[error("{0}")]
    CorrelationFailure(String),

    /// Failure reported by a collaborator (store, resolver, scheduler).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        EngineError::InvalidArgument(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        EngineError::InvalidState(message.into())
    }

    pub fn not_found(kind: ObjectKind, message: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            message: message.into(),
        }
    }

    pub fn execution_not_found(execution_id: &str) -> Self {
        Self::not_found(
            ObjectKind::Execution,
            format!("execution {} doesn't exist", execution_id),
        )
    }

    pub fn instance_not_found(process_instance_id: &str) -> Self {
        Self::not_found(
            ObjectKind::ProcessInstance,
            format!("No process instance found for id '{}'", process_instance_id),
        )
    }

    /// A broken internal invariant. Panics in debug builds; release builds
    /// log it and report `InvalidState`.
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "engine invariant violated");
        debug_assert!(false, "engine invariant violated: {}", message);
        EngineError::InvalidState(message)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

/// Rejects a missing identifier with the engine's "<field> is null" message.
pub fn require_id(value: &str, field: &str) -> EngineResult<()> {
    if value.trim().is_empty() {
        return Err(EngineError::invalid_argument(format!("{} is null", field)));
    }
    Ok(())
}
