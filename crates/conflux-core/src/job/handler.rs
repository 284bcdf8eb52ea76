use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::CommandContext;
use crate::domain::job::JobEntity;
use crate::engine::agenda::Operation;
use crate::engine::ExecutionEngine;
use crate::types::{ExecutionId, VariableMap};
use crate::CoreError;

/// Intermediate timer catch event, or a timer behind an event-based gateway
pub const TIMER_TRANSITION: &str = "timer-transition";
/// Timer boundary event; the configuration names the boundary event
pub const TIMER_BOUNDARY: &str = "timer-boundary";
/// Timer start event; the configuration names the start event
pub const TIMER_START_EVENT: &str = "timer-start-event";
/// Deferred execution of an asynchronous activity
pub const ASYNC_CONTINUATION: &str = "async-continuation";

/// Resolves a job of one handler type inside the job's unit of work
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handler type stored in `JobEntity::handler_type`
    fn handler_type(&self) -> &str;

    /// Run the job; the caller commits `ctx` on success
    async fn execute(
        &self,
        job: &JobEntity,
        engine: &ExecutionEngine,
        ctx: &mut CommandContext,
    ) -> Result<(), CoreError>;
}

/// Handlers by type
#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JobHandlerRegistry {
    /// Registry with the four built-in handlers
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(TimerTransitionHandler));
        registry.register(Arc::new(TimerBoundaryHandler));
        registry.register(Arc::new(TimerStartEventHandler));
        registry.register(Arc::new(AsyncContinuationHandler));
        registry
    }

    /// Add or replace a handler
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers
            .insert(handler.handler_type().to_string(), handler);
    }

    /// Handler for `handler_type`
    pub fn get(&self, handler_type: &str) -> Result<Arc<dyn JobHandler>, CoreError> {
        self.handlers.get(handler_type).cloned().ok_or_else(|| {
            CoreError::ConfigurationError(format!("No job handler for type {}", handler_type))
        })
    }
}

fn execution_of(job: &JobEntity) -> Result<ExecutionId, CoreError> {
    job.execution_id.clone().ok_or_else(|| {
        CoreError::ConfigurationError(format!("Job {} is not bound to an execution", job.id))
    })
}

fn configuration_of(job: &JobEntity) -> Result<String, CoreError> {
    job.handler_configuration.clone().ok_or_else(|| {
        CoreError::ConfigurationError(format!("Job {} has no handler configuration", job.id))
    })
}

/// Triggers the waiting execution
pub struct TimerTransitionHandler;

#[async_trait]
impl JobHandler for TimerTransitionHandler {
    fn handler_type(&self) -> &str {
        TIMER_TRANSITION
    }

    async fn execute(
        &self,
        job: &JobEntity,
        engine: &ExecutionEngine,
        ctx: &mut CommandContext,
    ) -> Result<(), CoreError> {
        ctx.push_operation(Operation::Trigger {
            execution_id: execution_of(job)?,
            signal: job.handler_configuration.clone(),
            payload: None,
        });
        engine.run_agenda(ctx).await
    }
}

/// Fires the boundary event named by the configuration
pub struct TimerBoundaryHandler;

#[async_trait]
impl JobHandler for TimerBoundaryHandler {
    fn handler_type(&self) -> &str {
        TIMER_BOUNDARY
    }

    async fn execute(
        &self,
        job: &JobEntity,
        engine: &ExecutionEngine,
        ctx: &mut CommandContext,
    ) -> Result<(), CoreError> {
        ctx.push_operation(Operation::FireBoundaryEvent {
            scope_execution_id: execution_of(job)?,
            boundary_id: configuration_of(job)?,
            payload: None,
        });
        engine.run_agenda(ctx).await
    }
}

/// Starts a process instance at the timer start event named by the configuration
pub struct TimerStartEventHandler;

#[async_trait]
impl JobHandler for TimerStartEventHandler {
    fn handler_type(&self) -> &str {
        TIMER_START_EVENT
    }

    async fn execute(
        &self,
        job: &JobEntity,
        engine: &ExecutionEngine,
        ctx: &mut CommandContext,
    ) -> Result<(), CoreError> {
        let definition_id = job.process_definition_id.as_ref().ok_or_else(|| {
            CoreError::ConfigurationError(format!("Start timer {} has no definition", job.id))
        })?;
        let process = engine.deployments().get(definition_id)?;
        let start_event = configuration_of(job)?;
        engine
            .start_process_instance_in(
                ctx,
                &process,
                Some(&start_event),
                None,
                VariableMap::new(),
                None,
            )
            .await?;
        engine.run_agenda(ctx).await
    }
}

/// Runs the deferred activity
pub struct AsyncContinuationHandler;

#[async_trait]
impl JobHandler for AsyncContinuationHandler {
    fn handler_type(&self) -> &str {
        ASYNC_CONTINUATION
    }

    async fn execute(
        &self,
        job: &JobEntity,
        engine: &ExecutionEngine,
        ctx: &mut CommandContext,
    ) -> Result<(), CoreError> {
        ctx.push_operation(Operation::ExecuteActivity {
            execution_id: execution_of(job)?,
            skip_async: true,
        });
        engine.run_agenda(ctx).await
    }
}
