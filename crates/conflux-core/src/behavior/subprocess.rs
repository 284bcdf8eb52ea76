use async_trait::async_trait;
use tracing::debug;

use super::{ActivityBehavior, ActivityExecution};
use crate::domain::execution::{ExecutionEntity, ScopeKind};
use crate::engine::agenda::Operation;
use crate::types::VariableMap;
use crate::CoreError;

/// Embedded sub-process and transaction: runs the body in a child scope execution
pub struct SubProcessBehavior;

#[async_trait]
impl ActivityBehavior for SubProcessBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let process = execution.process().clone();
        let start = process.graph().start_node_of(Some(execution.node_id()))?;
        let mut parent = execution.execution().await?;
        let ctx = execution.context();
        let scope = ExecutionEntity::new_child(
            &parent,
            Some(start.id.clone()),
            Some(ScopeKind::SubProcess),
            false,
            ctx.now(),
        );
        debug!(
            execution_id = %parent.id,
            scope_execution_id = %scope.id,
            "Entering sub-process"
        );
        parent.is_active = false;
        parent.add_child(scope.id.clone());
        ctx.update(parent);
        ctx.insert(scope.clone());
        ctx.push_operation(Operation::ExecuteActivity {
            execution_id: scope.id,
            skip_async: false,
        });
        Ok(())
    }
}

/// Starts the latest version of another process and waits for it to complete
pub struct CallActivityBehavior {
    called_element: String,
    in_variables: Vec<String>,
}

impl CallActivityBehavior {
    /// Behavior calling `called_element`, passing `in_variables` along
    pub fn new(called_element: impl Into<String>, in_variables: Vec<String>) -> Self {
        Self {
            called_element: called_element.into(),
            in_variables,
        }
    }
}

#[async_trait]
impl ActivityBehavior for CallActivityBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let engine = execution.engine();
        let caller = execution.execution().await?;
        let called = engine
            .deployments()
            .latest(&self.called_element, caller.tenant_id.as_deref())?;

        let mut variables = VariableMap::new();
        if !self.in_variables.is_empty() {
            let visible = execution.variables().await?;
            for name in &self.in_variables {
                if let Some(value) = visible.get(name) {
                    variables.insert(name.clone(), value.clone());
                }
            }
        }

        let ctx = execution.context();
        let sub_instance = engine
            .start_process_instance_in(ctx, &called, None, None, variables, Some(&caller))
            .await?;
        engine
            .history()
            .record_called_process_instance(ctx, &caller, &sub_instance.id)
            .await?;
        debug!(
            execution_id = %caller.id,
            called_process_instance_id = %sub_instance.id,
            "Called process started"
        );
        Ok(())
    }
}
