//! Execution engine
//!
//! Interprets deployed process graphs as a tree of executions. Every change
//! to the tree happens inside a [`CommandContext`]: API calls and job handlers
//! queue [`agenda::Operation`]s, and [`ExecutionEngine::run_agenda`] pops and
//! performs them until the agenda is empty. Behaviors queue further
//! operations instead of calling back into the engine, so a whole cascade of
//! synchronous steps runs without recursion.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::behavior::{BehaviorRegistry, ConditionEvaluator};
use crate::config::EngineConfig;
use crate::context::CommandContext;
use crate::domain::events::{EngineEvent, EngineEventListener};
use crate::domain::execution::ExecutionEntity;
use crate::history::HistoryManager;
use crate::job::JobManager;
use crate::store::EntityStore;
use crate::types::{Clock, ExecutionId};
use crate::CoreError;

/// Operation stack
pub mod agenda;
/// Deployed definitions
pub mod deployment;
/// Agenda operations
mod operations;
/// Tree construction and teardown
pub mod tree;
/// Variable scopes
mod variables;

use agenda::Operation;
use deployment::DeploymentCache;

/// The tree interpreter shared by the API facade and the job executor
pub struct ExecutionEngine {
    config: EngineConfig,
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    history: HistoryManager,
    jobs: JobManager,
    deployments: DeploymentCache,
    registry: BehaviorRegistry,
    evaluator: Arc<dyn ConditionEvaluator>,
    listeners: Vec<Arc<dyn EngineEventListener>>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", &self.config)
            .field("history", &self.history)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ExecutionEngine {
    /// Assemble an engine
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn EntityStore>,
        clock: Arc<dyn Clock>,
        registry: BehaviorRegistry,
        evaluator: Arc<dyn ConditionEvaluator>,
        jobs: JobManager,
        listeners: Vec<Arc<dyn EngineEventListener>>,
    ) -> Self {
        Self {
            history: HistoryManager::new(config.history_level),
            config,
            store,
            clock,
            jobs,
            deployments: DeploymentCache::default(),
            registry,
            evaluator,
            listeners,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Entity store
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Engine clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// History manager
    pub fn history(&self) -> HistoryManager {
        self.history
    }

    /// Job manager
    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    /// Deployed definitions
    pub fn deployments(&self) -> &DeploymentCache {
        &self.deployments
    }

    /// Behavior registry used for deployments
    pub fn registry(&self) -> &BehaviorRegistry {
        &self.registry
    }

    /// Expression evaluator
    pub fn evaluator(&self) -> &Arc<dyn ConditionEvaluator> {
        &self.evaluator
    }

    /// Open a unit of work
    pub fn new_context(&self) -> CommandContext {
        CommandContext::new(self.store.clone(), self.clock.clone())
    }

    /// Flush a unit of work and hand its events to the listeners, in order
    pub async fn commit(&self, ctx: CommandContext) -> Result<Vec<EngineEvent>, CoreError> {
        let events = ctx.commit().await?;
        self.dispatch_events(&events).await;
        Ok(events)
    }

    async fn dispatch_events(&self, events: &[EngineEvent]) {
        for event in events {
            for listener in &self.listeners {
                if let Err(e) = listener.handle_event(event).await {
                    warn!(
                        event_type = event.event_type(),
                        error = %e,
                        "Event listener failed"
                    );
                }
            }
        }
    }

    /// Perform queued operations until the agenda is empty
    pub async fn run_agenda(&self, ctx: &mut CommandContext) -> Result<(), CoreError> {
        while let Some(operation) = ctx.next_operation() {
            self.perform(ctx, operation).await?;
        }
        Ok(())
    }

    async fn perform(&self, ctx: &mut CommandContext, operation: Operation) -> Result<(), CoreError> {
        debug!(operation = ?operation, "Performing operation");
        match operation {
            Operation::ExecuteActivity {
                execution_id,
                skip_async,
            } => self.execute_activity(ctx, &execution_id, skip_async).await,
            Operation::LeaveActivity { execution_id } => {
                self.leave_activity(ctx, &execution_id).await
            }
            Operation::TakeFlows {
                execution_id,
                flow_ids,
            } => self.take_flows(ctx, &execution_id, flow_ids).await,
            Operation::EndExecution { execution_id } => {
                self.end_execution(ctx, &execution_id).await
            }
            Operation::Trigger {
                execution_id,
                signal,
                payload,
            } => self.trigger(ctx, &execution_id, signal, payload).await,
            Operation::FireBoundaryEvent {
                scope_execution_id,
                boundary_id,
                payload,
            } => {
                self.fire_boundary_event(ctx, &scope_execution_id, &boundary_id, payload)
                    .await
            }
            Operation::PropagateError {
                execution_id,
                error_code,
            } => self.propagate_error(ctx, &execution_id, &error_code).await,
        }
    }

    /// Load an execution that must exist
    pub async fn execution(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
    ) -> Result<ExecutionEntity, CoreError> {
        ctx.get_required::<ExecutionEntity>(id.as_str(), CoreError::ExecutionNotFound)
            .await
    }
}
