use thiserror::Error;

/// Core error type for the Conflux engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Execution not found
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Process definition not found
    #[error("Process definition not found: {0}")]
    ProcessDefinitionNotFound(String),

    /// Activity (node) not found in a process definition
    #[error("Activity not found: {0}")]
    ActivityNotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Invalid deployment or handler configuration; never retried
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// An activity behavior failed while executing
    #[error("Behavior error: {0}")]
    BehaviorError(String),

    /// A BPMN error thrown by an error end event or a delegate
    #[error("Unhandled BPMN error: {error_code}")]
    BpmnError {
        /// Error code matched against error boundary events
        error_code: String,
    },

    /// The operation is not allowed in the current state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A write carried a revision that no longer matches the stored one
    #[error("Optimistic locking failure on {entity} {id}")]
    OptimisticLockingFailure {
        /// Entity kind
        entity: String,
        /// Entity id
        id: String,
    },

    /// Expression evaluation error
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether the caller may retry the failed unit of work as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::OptimisticLockingFailure { .. })
    }

    /// Whether this is a configuration problem that retrying cannot fix
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, CoreError::ConfigurationError(_))
    }

    /// Shorthand for a BPMN error with the given code
    pub fn bpmn(error_code: impl Into<String>) -> Self {
        CoreError::BpmnError {
            error_code: error_code.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
