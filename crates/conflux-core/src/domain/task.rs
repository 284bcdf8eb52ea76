use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExecutionId, ProcessDefinitionId, TaskId};

/// An open user task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntity {
    /// Task id
    pub id: TaskId,
    /// Optimistic locking revision
    pub revision: u32,
    /// Display name
    pub name: Option<String>,
    /// Execution waiting on this task
    pub execution_id: ExecutionId,
    /// Process instance of that execution
    pub process_instance_id: ExecutionId,
    /// Definition the task belongs to
    pub process_definition_id: ProcessDefinitionId,
    /// Id of the user task node
    pub task_definition_key: String,
    /// Current assignee
    pub assignee: Option<String>,
    /// Users allowed to claim the task
    pub candidate_users: Vec<String>,
    /// Groups allowed to claim the task
    pub candidate_groups: Vec<String>,
    /// Priority
    pub priority: i32,
    /// Creation time
    pub create_time: DateTime<Utc>,
    /// Due date
    pub due_date: Option<DateTime<Utc>>,
    /// Whether the owning process instance is suspended
    pub suspended: bool,
    /// Owning tenant
    pub tenant_id: Option<String>,
}

impl TaskEntity {
    /// Whether `user` may claim this task
    pub fn is_candidate(&self, user: &str, groups: &[String]) -> bool {
        self.candidate_users.iter().any(|u| u == user)
            || self.candidate_groups.iter().any(|g| groups.contains(g))
    }
}
