use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{ActivityBehavior, ActivityExecution};
use crate::domain::events::EngineEvent;
use crate::domain::subscription::EventType;
use crate::domain::task::TaskEntity;
use crate::types::{ExecutionId, TaskId, VariableMap};
use crate::CoreError;

/// What a delegate receives when its task runs
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateInput {
    /// Process instance of the running task
    pub process_instance_id: ExecutionId,
    /// Execution running the task
    pub execution_id: ExecutionId,
    /// Task node id
    pub activity_id: String,
    /// Variables visible from the execution
    pub variables: VariableMap,
    /// Fixed field values from the node configuration
    pub fields: HashMap<String, Value>,
}

/// User code run by service and send tasks
///
/// The returned variables are written back to the process. Returning
/// [`CoreError::BpmnError`] throws a BPMN error that error boundary events
/// can catch; any other error fails the unit of work.
#[async_trait]
pub trait ServiceTaskDelegate: Send + Sync {
    /// Run the task
    async fn execute(&self, input: DelegateInput) -> Result<VariableMap, CoreError>;
}

/// Creates a task and waits for it to be completed
pub struct UserTaskBehavior {
    assignee: Option<String>,
    candidate_users: Vec<String>,
    candidate_groups: Vec<String>,
    priority: i32,
}

impl UserTaskBehavior {
    /// Behavior creating tasks with the given assignment
    pub fn new(
        assignee: Option<String>,
        candidate_users: Vec<String>,
        candidate_groups: Vec<String>,
        priority: i32,
    ) -> Self {
        Self {
            assignee,
            candidate_users,
            candidate_groups,
            priority,
        }
    }
}

#[async_trait]
impl ActivityBehavior for UserTaskBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let entity = execution.execution().await?;
        let name = execution.node()?.name.clone();
        let task_definition_key = execution.node_id().to_string();
        let history = execution.engine().history();
        let ctx = execution.context();
        let now = ctx.now();
        let task = TaskEntity {
            id: TaskId::generate(),
            revision: 1,
            name,
            execution_id: entity.id.clone(),
            process_instance_id: entity.process_instance_id.clone(),
            process_definition_id: entity.process_definition_id.clone(),
            task_definition_key,
            assignee: self.assignee.clone(),
            candidate_users: self.candidate_users.clone(),
            candidate_groups: self.candidate_groups.clone(),
            priority: self.priority,
            create_time: now,
            due_date: None,
            suspended: entity.is_suspended(),
            tenant_id: entity.tenant_id.clone(),
        };
        debug!(task_id = %task.id, execution_id = %entity.id, "Creating user task");

        ctx.insert(task.clone());
        history.record_task_created(ctx, &task);
        history.record_task_id(ctx, &entity, &task.id).await?;
        ctx.record_event(EngineEvent::TaskCreated {
            process_instance_id: entity.process_instance_id.clone(),
            task_id: task.id,
            timestamp: now,
        });
        Ok(())
    }

    async fn trigger(
        &self,
        execution: &mut ActivityExecution<'_>,
        _signal: Option<&str>,
    ) -> Result<(), CoreError> {
        execution.leave();
        Ok(())
    }
}

/// Calls a registered delegate and continues; also backs send tasks
pub struct ServiceTaskBehavior {
    delegate: Arc<dyn ServiceTaskDelegate>,
    fields: HashMap<String, Value>,
}

impl ServiceTaskBehavior {
    /// Behavior calling `delegate` with the node's fixed fields
    pub fn new(delegate: Arc<dyn ServiceTaskDelegate>, fields: HashMap<String, Value>) -> Self {
        Self { delegate, fields }
    }
}

#[async_trait]
impl ActivityBehavior for ServiceTaskBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let entity = execution.execution().await?;
        let input = DelegateInput {
            process_instance_id: entity.process_instance_id.clone(),
            execution_id: entity.id.clone(),
            activity_id: execution.node_id().to_string(),
            variables: execution.variables().await?,
            fields: self.fields.clone(),
        };

        match self.delegate.execute(input).await {
            Ok(output) => {
                for (name, value) in output {
                    execution.set_variable(&name, value).await?;
                }
                execution.leave();
                Ok(())
            }
            Err(CoreError::BpmnError { error_code }) => {
                debug!(
                    execution_id = %entity.id,
                    error_code = %error_code,
                    "Delegate threw a BPMN error"
                );
                execution.propagate_error(error_code);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Evaluates a JMESPath expression and stores the result
pub struct ScriptTaskBehavior {
    script: String,
    result_variable: Option<String>,
}

impl ScriptTaskBehavior {
    /// Behavior evaluating `script`
    pub fn new(script: impl Into<String>, result_variable: Option<String>) -> Self {
        Self {
            script: script.into(),
            result_variable,
        }
    }
}

#[async_trait]
impl ActivityBehavior for ScriptTaskBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let result = execution.evaluate(&self.script).await?;
        if let Some(name) = &self.result_variable {
            execution.set_variable(name, result).await?;
        }
        execution.leave();
        Ok(())
    }
}

/// Passes straight through; backs manual tasks, start events and fired boundary events
pub struct PassThroughBehavior;

#[async_trait]
impl ActivityBehavior for PassThroughBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        execution.leave();
        Ok(())
    }
}

/// Waits for a named message
pub struct ReceiveTaskBehavior {
    message: String,
}

impl ReceiveTaskBehavior {
    /// Behavior waiting for `message`
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl ActivityBehavior for ReceiveTaskBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let node_id = execution.node_id().to_string();
        execution
            .subscribe(EventType::Message, &self.message, &node_id)
            .await?;
        Ok(())
    }

    async fn trigger(
        &self,
        execution: &mut ActivityExecution<'_>,
        _signal: Option<&str>,
    ) -> Result<(), CoreError> {
        execution.leave();
        Ok(())
    }
}
