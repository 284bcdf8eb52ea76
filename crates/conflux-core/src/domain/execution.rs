use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExecutionId, ProcessDefinitionId};

/// What kind of scope an execution owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Root of a process instance
    ProcessInstance,
    /// Body of an embedded sub-process or transaction
    SubProcess,
    /// An activity carrying boundary events or multi-instance characteristics
    Activity,
}

/// Suspension state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionState {
    /// Running normally
    #[default]
    Active,
    /// Suspended together with its process instance
    Suspended,
}

/// A node of the execution tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEntity {
    /// Execution id
    pub id: ExecutionId,
    /// Optimistic locking revision
    pub revision: u32,
    /// Id of the root execution of this process instance
    pub process_instance_id: ExecutionId,
    /// Parent execution; `None` for a process instance
    pub parent_id: Option<ExecutionId>,
    /// Calling execution when this process instance was started by a call activity
    pub super_execution_id: Option<ExecutionId>,
    /// Root of the whole call hierarchy
    pub root_process_instance_id: ExecutionId,
    /// Definition this execution runs
    pub process_definition_id: ProcessDefinitionId,
    /// Current node
    pub activity_id: Option<String>,
    /// Sequence flow currently being taken; `activity_id` still names its source meanwhile
    #[serde(default)]
    pub current_flow: Option<String>,
    /// Whether this execution carries a token
    pub is_active: bool,
    /// Whether this execution is one branch of a fork
    pub is_concurrent: bool,
    /// Scope owned by this execution, if any
    pub scope: Option<ScopeKind>,
    /// Whether this execution is the root of a multi-instance activity
    #[serde(default)]
    pub is_multi_instance_root: bool,
    /// Whether this execution only remains to keep an event scope alive
    #[serde(default)]
    pub is_event_scope: bool,
    /// Suspension state
    #[serde(default)]
    pub suspension_state: SuspensionState,
    /// Business key; only set on process instances
    pub business_key: Option<String>,
    /// Owning tenant
    pub tenant_id: Option<String>,
    /// Creation time
    pub start_time: DateTime<Utc>,
    /// Why the execution was removed
    pub delete_reason: Option<String>,
    /// Ids of the direct children, in creation order
    #[serde(default)]
    pub child_ids: Vec<ExecutionId>,
}

impl ExecutionEntity {
    /// Create the root execution of a new process instance
    pub fn new_process_instance(
        process_definition_id: ProcessDefinitionId,
        activity_id: impl Into<String>,
        business_key: Option<String>,
        tenant_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = ExecutionId::generate();
        Self {
            process_instance_id: id.clone(),
            root_process_instance_id: id.clone(),
            id,
            revision: 1,
            parent_id: None,
            super_execution_id: None,
            process_definition_id,
            activity_id: Some(activity_id.into()),
            current_flow: None,
            is_active: true,
            is_concurrent: false,
            scope: Some(ScopeKind::ProcessInstance),
            is_multi_instance_root: false,
            is_event_scope: false,
            suspension_state: SuspensionState::Active,
            business_key,
            tenant_id,
            start_time: now,
            delete_reason: None,
            child_ids: Vec::new(),
        }
    }

    /// Create a child of `parent` positioned at `activity_id`
    pub fn new_child(
        parent: &ExecutionEntity,
        activity_id: Option<String>,
        scope: Option<ScopeKind>,
        is_concurrent: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::generate(),
            revision: 1,
            process_instance_id: parent.process_instance_id.clone(),
            parent_id: Some(parent.id.clone()),
            super_execution_id: None,
            root_process_instance_id: parent.root_process_instance_id.clone(),
            process_definition_id: parent.process_definition_id.clone(),
            activity_id,
            current_flow: None,
            is_active: true,
            is_concurrent,
            scope,
            is_multi_instance_root: false,
            is_event_scope: false,
            suspension_state: parent.suspension_state,
            business_key: None,
            tenant_id: parent.tenant_id.clone(),
            start_time: now,
            delete_reason: None,
            child_ids: Vec::new(),
        }
    }

    /// Whether this execution owns a variable scope
    pub fn is_scope(&self) -> bool {
        self.scope.is_some()
    }

    /// Whether this is the root of a process instance
    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether this execution is suspended
    pub fn is_suspended(&self) -> bool {
        self.suspension_state == SuspensionState::Suspended
    }

    /// Current node, or an error naming the execution when it has none
    pub fn current_activity(&self) -> Result<&str, crate::CoreError> {
        self.activity_id.as_deref().ok_or_else(|| {
            crate::CoreError::IllegalState(format!("Execution {} is not at any activity", self.id))
        })
    }

    /// Add a child id, keeping creation order
    pub fn add_child(&mut self, child: ExecutionId) {
        if !self.child_ids.contains(&child) {
            self.child_ids.push(child);
        }
    }

    /// Remove a child id
    pub fn remove_child(&mut self, child: &ExecutionId) {
        self.child_ids.retain(|id| id != child);
    }
}
