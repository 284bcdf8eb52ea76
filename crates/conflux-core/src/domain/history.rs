//! Historic mirrors of runtime entities. Closed by setting an end time; never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExecutionId, ProcessDefinitionId, TaskId};

/// Audit record of a process instance; shares the instance id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricProcessInstance {
    /// Same id as the process instance
    pub id: String,
    /// Optimistic locking revision
    pub revision: u32,
    /// Definition that was run
    pub process_definition_id: ProcessDefinitionId,
    /// Business key
    pub business_key: Option<String>,
    /// Calling process instance, when started by a call activity
    pub super_process_instance_id: Option<ExecutionId>,
    /// Node the instance started at
    pub start_activity_id: Option<String>,
    /// Node the instance ended at
    pub end_activity_id: Option<String>,
    /// Start time
    pub start_time: DateTime<Utc>,
    /// End time; `None` while running
    pub end_time: Option<DateTime<Utc>>,
    /// Elapsed milliseconds once ended
    pub duration_ms: Option<i64>,
    /// Why the instance was removed early
    pub delete_reason: Option<String>,
    /// Owning tenant
    pub tenant_id: Option<String>,
}

/// Audit record of one pass of an execution through a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricActivityInstance {
    /// Own id
    pub id: String,
    /// Optimistic locking revision
    pub revision: u32,
    /// Process instance
    pub process_instance_id: ExecutionId,
    /// Execution that passed the node
    pub execution_id: ExecutionId,
    /// Definition
    pub process_definition_id: ProcessDefinitionId,
    /// Node id
    pub activity_id: String,
    /// Node name
    pub activity_name: Option<String>,
    /// Node type tag
    pub activity_type: String,
    /// Task created by the node, if any
    pub task_id: Option<TaskId>,
    /// Process instance started by the node, if any
    pub called_process_instance_id: Option<ExecutionId>,
    /// Entry time
    pub start_time: DateTime<Utc>,
    /// Exit time; `None` while unfinished
    pub end_time: Option<DateTime<Utc>>,
    /// Elapsed milliseconds once finished
    pub duration_ms: Option<i64>,
    /// Why the node was left without completing
    pub delete_reason: Option<String>,
    /// Owning tenant
    pub tenant_id: Option<String>,
}

/// Audit record of a user task; shares the task id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricTaskInstance {
    /// Same id as the task
    pub id: String,
    /// Optimistic locking revision
    pub revision: u32,
    /// Process instance
    pub process_instance_id: ExecutionId,
    /// Execution
    pub execution_id: ExecutionId,
    /// Definition
    pub process_definition_id: ProcessDefinitionId,
    /// User task node id
    pub task_definition_key: String,
    /// Display name
    pub name: Option<String>,
    /// Last assignee
    pub assignee: Option<String>,
    /// Priority
    pub priority: i32,
    /// Creation time
    pub start_time: DateTime<Utc>,
    /// Last claim time
    pub claim_time: Option<DateTime<Utc>>,
    /// Completion or removal time
    pub end_time: Option<DateTime<Utc>>,
    /// Elapsed milliseconds once ended
    pub duration_ms: Option<i64>,
    /// `completed`, or why the task was removed
    pub delete_reason: Option<String>,
    /// Owning tenant
    pub tenant_id: Option<String>,
}

/// Current-value mirror of a runtime variable; shares the variable id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricVariableInstance {
    /// Same id as the runtime variable
    pub id: String,
    /// Optimistic locking revision
    pub revision: u32,
    /// Variable name
    pub name: String,
    /// Process instance
    pub process_instance_id: ExecutionId,
    /// Owning execution
    pub execution_id: ExecutionId,
    /// Task the variable was set through
    pub task_id: Option<TaskId>,
    /// Latest value
    pub value: serde_json::Value,
    /// First write
    pub create_time: DateTime<Utc>,
    /// Latest write
    pub last_updated_time: DateTime<Utc>,
}

/// One variable update in the detail trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricDetail {
    /// Own id
    pub id: String,
    /// Optimistic locking revision
    pub revision: u32,
    /// Process instance
    pub process_instance_id: ExecutionId,
    /// Execution the update happened on
    pub execution_id: ExecutionId,
    /// Historic activity instance active at the time, if any
    pub activity_instance_id: Option<String>,
    /// Updated variable id
    pub variable_instance_id: String,
    /// Variable name
    pub name: String,
    /// Value written
    pub value: serde_json::Value,
    /// Revision of the runtime variable after the write
    pub variable_revision: u32,
    /// Time of the write
    pub time: DateTime<Utc>,
}

/// Kind of identity link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityLinkType {
    /// The assignee
    Assignee,
    /// A candidate user or group
    Candidate,
}

/// Audit record of a task assignment or candidacy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricIdentityLink {
    /// Own id
    pub id: String,
    /// Optimistic locking revision
    pub revision: u32,
    /// Task
    pub task_id: TaskId,
    /// Process instance
    pub process_instance_id: ExecutionId,
    /// Link kind
    pub link_type: IdentityLinkType,
    /// User, for user links
    pub user_id: Option<String>,
    /// Group, for group links
    pub group_id: Option<String>,
    /// Creation time
    pub create_time: DateTime<Utc>,
}

/// Milliseconds between two instants, never negative
pub(crate) fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0)
}
