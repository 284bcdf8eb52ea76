use serde_json::Value;

use super::ExecutionEngine;
use crate::context::CommandContext;
use crate::domain::execution::ExecutionEntity;
use crate::domain::variable::VariableInstance;
use crate::store::Query;
use crate::types::{ExecutionId, VariableMap};
use crate::CoreError;

impl ExecutionEngine {
    async fn variable_instance(
        &self,
        ctx: &mut CommandContext,
        execution_id: &ExecutionId,
        name: &str,
    ) -> Result<Option<VariableInstance>, CoreError> {
        ctx.query_one(Query::VariableByName {
            execution_id: execution_id.clone(),
            name: name.to_string(),
        })
        .await
    }

    /// `id` and its ancestors, innermost first, up to the process instance
    async fn scope_chain(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
    ) -> Result<Vec<ExecutionEntity>, CoreError> {
        let mut chain = Vec::new();
        let mut current = Some(self.execution(ctx, id).await?);
        while let Some(execution) = current {
            current = match &execution.parent_id {
                Some(parent_id) => ctx.get::<ExecutionEntity>(parent_id.as_str()).await?,
                None => None,
            };
            chain.push(execution);
        }
        Ok(chain)
    }

    /// Variable visible from `id`: its own, or the nearest ancestor's
    pub async fn variable(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        name: &str,
    ) -> Result<Option<Value>, CoreError> {
        for execution in self.scope_chain(ctx, id).await? {
            if let Some(variable) = self.variable_instance(ctx, &execution.id, name).await? {
                return Ok(Some(variable.value));
            }
        }
        Ok(None)
    }

    /// Every variable visible from `id`; inner scopes shadow outer ones
    pub async fn variables(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
    ) -> Result<VariableMap, CoreError> {
        let mut visible = VariableMap::new();
        for execution in self.scope_chain(ctx, id).await? {
            for (name, value) in self.local_variables(ctx, &execution.id).await? {
                visible.entry(name).or_insert(value);
            }
        }
        Ok(visible)
    }

    /// Variable owned by `id` itself
    pub async fn local_variable(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        name: &str,
    ) -> Result<Option<Value>, CoreError> {
        Ok(self
            .variable_instance(ctx, id, name)
            .await?
            .map(|variable| variable.value))
    }

    /// Variables owned by `id` itself
    pub async fn local_variables(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
    ) -> Result<VariableMap, CoreError> {
        let variables: Vec<VariableInstance> = ctx
            .query(Query::VariablesByExecution(id.clone()))
            .await?;
        Ok(variables
            .into_iter()
            .map(|variable| (variable.name, variable.value))
            .collect())
    }

    /// Overwrite the variable where it is visible from, or create it on the process instance
    pub async fn set_variable(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        name: &str,
        value: Value,
    ) -> Result<(), CoreError> {
        let chain = self.scope_chain(ctx, id).await?;
        for execution in &chain {
            if let Some(variable) = self.variable_instance(ctx, &execution.id, name).await? {
                return self.write_variable(ctx, variable, value).await;
            }
        }
        let root = chain.last().ok_or_else(|| CoreError::ExecutionNotFound(id.to_string()))?;
        self.create_variable(ctx, root, name, value);
        Ok(())
    }

    /// [`ExecutionEngine::set_variable`] for several variables
    pub async fn set_variables(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        variables: VariableMap,
    ) -> Result<(), CoreError> {
        for (name, value) in variables {
            self.set_variable(ctx, id, &name, value).await?;
        }
        Ok(())
    }

    /// Create or overwrite a variable owned by `id` itself
    pub async fn set_variable_local(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        name: &str,
        value: Value,
    ) -> Result<(), CoreError> {
        match self.variable_instance(ctx, id, name).await? {
            Some(variable) => self.write_variable(ctx, variable, value).await,
            None => {
                let execution = self.execution(ctx, id).await?;
                self.create_variable(ctx, &execution, name, value);
                Ok(())
            }
        }
    }

    fn create_variable(
        &self,
        ctx: &mut CommandContext,
        owner: &ExecutionEntity,
        name: &str,
        value: Value,
    ) {
        let variable = VariableInstance::new(
            name,
            owner.id.clone(),
            owner.process_instance_id.clone(),
            value,
        );
        self.history.record_variable_create(ctx, &variable);
        ctx.insert(variable);
    }

    async fn write_variable(
        &self,
        ctx: &mut CommandContext,
        mut variable: VariableInstance,
        value: Value,
    ) -> Result<(), CoreError> {
        if variable.value == value {
            return Ok(());
        }
        variable.value = value;
        self.history.record_variable_update(ctx, &variable).await?;
        ctx.update(variable);
        Ok(())
    }

    /// Delete every variable owned by `id`
    pub async fn delete_variables_of(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
    ) -> Result<(), CoreError> {
        let variables: Vec<VariableInstance> = ctx
            .query(Query::VariablesByExecution(id.clone()))
            .await?;
        for variable in variables {
            ctx.delete(variable);
        }
        Ok(())
    }
}
