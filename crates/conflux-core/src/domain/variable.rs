use serde::{Deserialize, Serialize};

use crate::types::{ExecutionId, TaskId};

/// A runtime variable owned by one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInstance {
    /// Variable id; the historic mirror shares it
    pub id: String,
    /// Optimistic locking revision
    pub revision: u32,
    /// Variable name, unique per owning execution
    pub name: String,
    /// Owning execution
    pub execution_id: ExecutionId,
    /// Process instance of the owning execution
    pub process_instance_id: ExecutionId,
    /// Task the variable was set through, if any
    pub task_id: Option<TaskId>,
    /// Current value
    pub value: serde_json::Value,
}

impl VariableInstance {
    /// Create a new variable on `execution_id`
    pub fn new(
        name: impl Into<String>,
        execution_id: ExecutionId,
        process_instance_id: ExecutionId,
        value: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            revision: 1,
            name: name.into(),
            execution_id,
            process_instance_id,
            task_id: None,
            value,
        }
    }
}
