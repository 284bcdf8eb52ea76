use std::sync::Arc;
use tracing::{debug, info};

use crate::behavior::{
    BehaviorFactory, BehaviorRegistry, ConditionEvaluator, JmesPathEvaluator, ServiceTaskDelegate,
};
use crate::config::EngineConfig;
use crate::context::CommandContext;
use crate::domain::definition::{NodeKind, ProcessDefinition, ProcessGraph};
use crate::domain::events::{EngineEvent, EngineEventListener};
use crate::domain::execution::ExecutionEntity;
use crate::domain::history::{
    HistoricActivityInstance, HistoricDetail, HistoricIdentityLink, HistoricProcessInstance,
    HistoricTaskInstance, HistoricVariableInstance,
};
use crate::domain::job::{JobEntity, JobState};
use crate::domain::subscription::EventSubscription;
use crate::domain::task::TaskEntity;
use crate::engine::agenda::Operation;
use crate::engine::deployment::DeployedProcess;
use crate::engine::ExecutionEngine;
use crate::history::HistoryLevel;
use crate::job::duration::resolve_timer;
use crate::job::executor::{AsyncJobExecutor, ExecutorHandle};
use crate::job::handler::{JobHandler, ASYNC_CONTINUATION, TIMER_START_EVENT};
use crate::job::{JobManager, JobOutcome};
use crate::store::{EntityStore, Query};
use crate::types::{
    Clock, ExecutionId, JobId, ProcessDefinitionId, SystemClock, TaskId, VariableMap,
};
use crate::CoreError;

/// Assembles a [`ProcessEngine`]
pub struct ProcessEngineBuilder {
    store: Arc<dyn EntityStore>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    evaluator: Arc<dyn ConditionEvaluator>,
    registry: BehaviorRegistry,
    handlers: Vec<Arc<dyn JobHandler>>,
    listeners: Vec<Arc<dyn EngineEventListener>>,
}

impl ProcessEngineBuilder {
    /// Builder over `store` with default configuration, the system clock and JMESPath conditions
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            evaluator: Arc::new(JmesPathEvaluator),
            registry: BehaviorRegistry::new(),
            handlers: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Replace the configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the history level only
    pub fn with_history_level(mut self, level: HistoryLevel) -> Self {
        self.config.history_level = level;
        self
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the expression evaluator
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Register a service task delegate
    pub fn with_delegate(
        mut self,
        name: impl Into<String>,
        delegate: Arc<dyn ServiceTaskDelegate>,
    ) -> Self {
        self.registry.register_delegate(name, delegate);
        self
    }

    /// Register the behavior factory of a custom node type
    pub fn with_custom_behavior(mut self, type_name: impl Into<String>, factory: BehaviorFactory) -> Self {
        self.registry.register_custom(type_name, factory);
        self
    }

    /// Register an additional job handler
    pub fn with_job_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Append an event listener; listeners run in registration order
    pub fn with_listener(mut self, listener: Arc<dyn EngineEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validate the configuration and build the engine
    pub fn build(self) -> Result<ProcessEngine, CoreError> {
        self.config.validate()?;
        let mut jobs = JobManager::from_config(&self.config)?;
        for handler in self.handlers {
            jobs.register_handler(handler);
        }
        let engine = ExecutionEngine::new(
            self.config,
            self.store,
            self.clock,
            self.registry,
            self.evaluator,
            jobs,
            self.listeners,
        );
        Ok(ProcessEngine {
            engine: Arc::new(engine),
        })
    }
}

/// The engine API. Every call runs as one unit of work: it either commits
/// completely or leaves the store untouched.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    engine: Arc<ExecutionEngine>,
}

impl ProcessEngine {
    /// Start building an engine over `store`
    pub fn builder(store: Arc<dyn EntityStore>) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(store)
    }

    /// The underlying interpreter
    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Run queued operations and commit
    async fn finish(&self, mut ctx: CommandContext) -> Result<(), CoreError> {
        self.engine.run_agenda(&mut ctx).await?;
        self.engine.commit(ctx).await?;
        Ok(())
    }

    // Deployment

    /// Deploy a new version of a definition. Start timers of the version it
    /// replaces are removed and the new version's start timers scheduled.
    pub async fn deploy(&self, definition: ProcessDefinition) -> Result<ProcessDefinitionId, CoreError> {
        let graph = ProcessGraph::build(definition)?;
        let tenant_id = graph.definition().tenant_id.clone();
        let deployments = self.engine.deployments();
        let version = deployments.next_version(graph.key(), tenant_id.as_deref());
        let process = Arc::new(self.engine.registry().build(version, graph)?);

        let mut ctx = self.engine.new_context();
        if let Ok(previous) = deployments.latest(process.key(), tenant_id.as_deref()) {
            if previous.tenant_id() == process.tenant_id() {
                self.remove_start_timers(&mut ctx, previous.id()).await?;
            }
        }
        self.schedule_start_timers(&mut ctx, &process)?;
        let timestamp = ctx.now();
        ctx.record_event(EngineEvent::ProcessDeployed {
            process_definition_id: process.id().clone(),
            timestamp,
        });
        self.engine.commit(ctx).await?;

        deployments.add(process.clone());
        info!(
            process_definition_id = %process.id(),
            version = process.version(),
            "Process definition deployed"
        );
        Ok(process.id().clone())
    }

    async fn remove_start_timers(
        &self,
        ctx: &mut CommandContext,
        definition_id: &ProcessDefinitionId,
    ) -> Result<(), CoreError> {
        let jobs: Vec<JobEntity> = ctx
            .query(Query::JobsByProcessDefinition(definition_id.clone()))
            .await?;
        for job in jobs {
            if job.handler_type == TIMER_START_EVENT {
                debug!(job_id = %job.id, "Removing start timer of replaced version");
                ctx.delete(job);
            }
        }
        Ok(())
    }

    fn schedule_start_timers(
        &self,
        ctx: &mut CommandContext,
        process: &DeployedProcess,
    ) -> Result<(), CoreError> {
        let now = ctx.now();
        for node in process.graph().timer_start_events() {
            if let NodeKind::TimerStartEvent { timer } = &node.kind {
                let resolved = resolve_timer(timer, now)?;
                self.engine
                    .jobs()
                    .schedule_start_timer(ctx, process, &node.id, resolved);
            }
        }
        Ok(())
    }

    /// Deployed definition by id
    pub fn process_definition(
        &self,
        id: &ProcessDefinitionId,
    ) -> Result<Arc<DeployedProcess>, CoreError> {
        self.engine.deployments().get(id)
    }

    // Process instances

    /// Start the latest shared version of `key`
    pub async fn start_process_instance(
        &self,
        key: &str,
        variables: VariableMap,
    ) -> Result<ExecutionId, CoreError> {
        let process = self.engine.deployments().latest(key, None)?;
        self.start(&process, None, None, variables).await
    }

    /// Start the latest version of `key` visible to `tenant_id`, with a business key
    pub async fn start_process_instance_for_tenant(
        &self,
        key: &str,
        tenant_id: Option<&str>,
        business_key: Option<String>,
        variables: VariableMap,
    ) -> Result<ExecutionId, CoreError> {
        let process = self.engine.deployments().latest(key, tenant_id)?;
        self.start(&process, None, business_key, variables).await
    }

    /// Start a specific definition version
    pub async fn start_process_instance_by_id(
        &self,
        definition_id: &ProcessDefinitionId,
        business_key: Option<String>,
        variables: VariableMap,
    ) -> Result<ExecutionId, CoreError> {
        let process = self.engine.deployments().get(definition_id)?;
        self.start(&process, None, business_key, variables).await
    }

    /// Start the definition whose message start event listens for `message`
    pub async fn start_process_instance_by_message(
        &self,
        message: &str,
        variables: VariableMap,
    ) -> Result<ExecutionId, CoreError> {
        let candidates = self.engine.deployments().by_start_message(message);
        let process = match candidates.as_slice() {
            [process] => process.clone(),
            [] => {
                return Err(CoreError::ProcessDefinitionNotFound(format!(
                    "no definition starts on message {}",
                    message
                )))
            }
            _ => {
                return Err(CoreError::IllegalState(format!(
                    "{} definitions start on message {}",
                    candidates.len(),
                    message
                )))
            }
        };
        let start_event = process
            .graph()
            .message_start_event(message)
            .map(|node| node.id.clone());
        self.start(&process, start_event.as_deref(), None, variables)
            .await
    }

    async fn start(
        &self,
        process: &Arc<DeployedProcess>,
        start_event: Option<&str>,
        business_key: Option<String>,
        variables: VariableMap,
    ) -> Result<ExecutionId, CoreError> {
        let mut ctx = self.engine.new_context();
        let instance = self
            .engine
            .start_process_instance_in(&mut ctx, process, start_event, business_key, variables, None)
            .await?;
        self.finish(ctx).await?;
        Ok(instance.id)
    }

    /// Resume an execution waiting at its current node
    pub async fn signal(
        &self,
        execution_id: &ExecutionId,
        signal: Option<&str>,
        payload: Option<VariableMap>,
    ) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        self.engine.execution(&mut ctx, execution_id).await?;
        ctx.push_operation(Operation::Trigger {
            execution_id: execution_id.clone(),
            signal: signal.map(str::to_string),
            payload,
        });
        self.finish(ctx).await
    }

    /// Run the behavior of the execution's current node now, ignoring `async_before`.
    /// A pending async continuation of that node is consumed.
    pub async fn advance(&self, execution_id: &ExecutionId) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        let execution = self.engine.execution(&mut ctx, execution_id).await?;
        if execution.is_suspended() {
            return Err(CoreError::IllegalState(format!(
                "Execution {} is suspended",
                execution_id
            )));
        }
        let pending: Vec<JobEntity> = ctx
            .query(Query::JobsByExecution(execution_id.clone()))
            .await?;
        for job in pending {
            if job.handler_type == ASYNC_CONTINUATION
                && job.handler_configuration == execution.activity_id
            {
                debug!(job_id = %job.id, execution_id = %execution_id, "Advancing past async continuation");
                ctx.delete(job);
            }
        }
        ctx.push_operation(Operation::ExecuteActivity {
            execution_id: execution_id.clone(),
            skip_async: true,
        });
        self.finish(ctx).await
    }

    /// Deliver a message to a waiting execution, or to `execution_id` specifically
    pub async fn message_event_received(
        &self,
        name: &str,
        execution_id: Option<&ExecutionId>,
        payload: Option<VariableMap>,
    ) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        if !self
            .engine
            .deliver_message(&mut ctx, name, execution_id, payload)
            .await?
        {
            return Err(CoreError::ExecutionNotFound(match execution_id {
                Some(id) => format!("{} waiting for message {}", id, name),
                None => format!("no execution waiting for message {}", name),
            }));
        }
        self.finish(ctx).await
    }

    /// Broadcast a signal; returns the number of executions it reached
    pub async fn signal_event_received(
        &self,
        name: &str,
        payload: Option<VariableMap>,
    ) -> Result<usize, CoreError> {
        let mut ctx = self.engine.new_context();
        let delivered = self.engine.deliver_signal(&mut ctx, name, payload).await?;
        self.finish(ctx).await?;
        debug!(signal = name, delivered, "Signal broadcast");
        Ok(delivered)
    }

    /// Remove a running process instance
    pub async fn delete_process_instance(
        &self,
        process_instance_id: &ExecutionId,
        reason: &str,
    ) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        self.engine
            .delete_process_instance(&mut ctx, process_instance_id, reason)
            .await?;
        self.finish(ctx).await
    }

    /// Suspend a process instance with its tasks and jobs
    pub async fn suspend_process_instance(
        &self,
        process_instance_id: &ExecutionId,
    ) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        self.engine
            .suspend_process_instance(&mut ctx, process_instance_id)
            .await?;
        self.finish(ctx).await
    }

    /// Reactivate a suspended process instance
    pub async fn activate_process_instance(
        &self,
        process_instance_id: &ExecutionId,
    ) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        self.engine
            .activate_process_instance(&mut ctx, process_instance_id)
            .await?;
        self.finish(ctx).await
    }

    // Tasks

    async fn open_task(ctx: &mut CommandContext, task_id: &TaskId) -> Result<TaskEntity, CoreError> {
        let task = ctx
            .get_required::<TaskEntity>(task_id.as_str(), CoreError::TaskNotFound)
            .await?;
        if task.suspended {
            return Err(CoreError::IllegalState(format!("Task {} is suspended", task_id)));
        }
        Ok(task)
    }

    /// Complete a user task; `variables` are set before the process continues
    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        variables: VariableMap,
    ) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        let task = Self::open_task(&mut ctx, task_id).await?;
        self.engine
            .history()
            .record_task_end(&mut ctx, task_id, "completed")
            .await?;
        let timestamp = ctx.now();
        ctx.record_event(EngineEvent::TaskCompleted {
            process_instance_id: task.process_instance_id.clone(),
            task_id: task.id.clone(),
            timestamp,
        });
        let execution_id = task.execution_id.clone();
        ctx.delete(task);
        ctx.push_operation(Operation::Trigger {
            execution_id,
            signal: None,
            payload: (!variables.is_empty()).then_some(variables),
        });
        self.finish(ctx).await?;
        debug!(task_id = %task_id, "Task completed");
        Ok(())
    }

    /// Assign a task to `user_id`; a task claimed by someone else is refused
    pub async fn claim_task(&self, task_id: &TaskId, user_id: &str) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        let mut task = Self::open_task(&mut ctx, task_id).await?;
        match task.assignee.as_deref() {
            Some(current) if current == user_id => return Ok(()),
            Some(current) => {
                return Err(CoreError::IllegalState(format!(
                    "Task {} is already claimed by {}",
                    task_id, current
                )))
            }
            None => {}
        }
        task.assignee = Some(user_id.to_string());
        self.engine
            .history()
            .record_task_assignment(&mut ctx, &task)
            .await?;
        ctx.update(task);
        self.engine.commit(ctx).await?;
        Ok(())
    }

    /// Open task by id
    pub async fn task(&self, task_id: &TaskId) -> Result<Option<TaskEntity>, CoreError> {
        let mut ctx = self.engine.new_context();
        ctx.get::<TaskEntity>(task_id.as_str()).await
    }

    /// Open tasks of a process instance
    pub async fn tasks(&self, process_instance_id: &ExecutionId) -> Result<Vec<TaskEntity>, CoreError> {
        self.select(Query::TasksByProcessInstance(process_instance_id.clone()))
            .await
    }

    /// Open tasks assigned to `user_id`
    pub async fn tasks_for_assignee(&self, user_id: &str) -> Result<Vec<TaskEntity>, CoreError> {
        self.select(Query::TasksByAssignee(user_id.to_string())).await
    }

    // Variables

    /// Set variables where they are visible from `execution_id`; new names land on the process instance
    pub async fn set_variables(
        &self,
        execution_id: &ExecutionId,
        variables: VariableMap,
    ) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        self.engine
            .set_variables(&mut ctx, execution_id, variables)
            .await?;
        self.engine.commit(ctx).await?;
        Ok(())
    }

    /// Set a variable owned by `execution_id` itself
    pub async fn set_variable_local(
        &self,
        execution_id: &ExecutionId,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        self.engine
            .set_variable_local(&mut ctx, execution_id, name, value)
            .await?;
        self.engine.commit(ctx).await?;
        Ok(())
    }

    /// Variable visible from `execution_id`
    pub async fn get_variable(
        &self,
        execution_id: &ExecutionId,
        name: &str,
    ) -> Result<Option<serde_json::Value>, CoreError> {
        let mut ctx = self.engine.new_context();
        self.engine.variable(&mut ctx, execution_id, name).await
    }

    /// Every variable visible from `execution_id`
    pub async fn get_variables(&self, execution_id: &ExecutionId) -> Result<VariableMap, CoreError> {
        let mut ctx = self.engine.new_context();
        self.engine.variables(&mut ctx, execution_id).await
    }

    // Runtime queries

    async fn select<T>(&self, query: Query) -> Result<Vec<T>, CoreError>
    where
        T: crate::domain::entity::PersistentEntity,
    {
        let mut ctx = self.engine.new_context();
        ctx.query(query).await
    }

    /// Root execution of a running process instance
    pub async fn process_instance(
        &self,
        process_instance_id: &ExecutionId,
    ) -> Result<Option<ExecutionEntity>, CoreError> {
        let mut ctx = self.engine.new_context();
        Ok(ctx
            .get::<ExecutionEntity>(process_instance_id.as_str())
            .await?
            .filter(ExecutionEntity::is_process_instance))
    }

    /// Running process instances, optionally of one definition
    pub async fn process_instances(
        &self,
        definition_id: Option<&ProcessDefinitionId>,
    ) -> Result<Vec<ExecutionEntity>, CoreError> {
        self.select(Query::ProcessInstances(definition_id.cloned()))
            .await
    }

    /// Every execution of a process instance, the root included
    pub async fn executions(
        &self,
        process_instance_id: &ExecutionId,
    ) -> Result<Vec<ExecutionEntity>, CoreError> {
        self.select(Query::ExecutionsByProcessInstance(process_instance_id.clone()))
            .await
    }

    /// Message and signal subscriptions of an execution
    pub async fn event_subscriptions(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<EventSubscription>, CoreError> {
        self.select(Query::EventSubscriptionsByExecution(execution_id.clone()))
            .await
    }

    // Jobs

    /// Job in any state
    pub async fn job(&self, job_id: &JobId) -> Result<Option<JobEntity>, CoreError> {
        let mut ctx = self.engine.new_context();
        ctx.get::<JobEntity>(job_id.as_str()).await
    }

    /// Jobs of a process instance, in any state
    pub async fn jobs(&self, process_instance_id: &ExecutionId) -> Result<Vec<JobEntity>, CoreError> {
        self.select(Query::JobsByProcessInstance(process_instance_id.clone()))
            .await
    }

    /// Jobs in one state
    pub async fn jobs_in_state(&self, state: JobState) -> Result<Vec<JobEntity>, CoreError> {
        self.select(Query::JobsInState(state)).await
    }

    /// Overwrite the retries of a job that is not dead-lettered
    pub async fn set_job_retries(&self, job_id: &JobId, retries: u32) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        self.engine
            .jobs()
            .set_job_retries(&mut ctx, job_id, retries)
            .await?;
        self.engine.commit(ctx).await?;
        Ok(())
    }

    /// Make a dead-letter job executable again with `retries` attempts
    pub async fn move_dead_letter_job_to_executable(
        &self,
        job_id: &JobId,
        retries: u32,
    ) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        self.engine
            .jobs()
            .move_dead_letter_job_to_executable(&mut ctx, job_id, retries)
            .await?;
        self.engine.commit(ctx).await?;
        Ok(())
    }

    /// Delete a job in any state
    pub async fn delete_job(&self, job_id: &JobId) -> Result<(), CoreError> {
        let mut ctx = self.engine.new_context();
        self.engine.jobs().delete_job(&mut ctx, job_id).await?;
        self.engine.commit(ctx).await?;
        Ok(())
    }

    /// Reassign the jobs of a definition to another tenant; returns the number changed
    pub async fn change_deployment_tenant(
        &self,
        definition_id: &ProcessDefinitionId,
        tenant_id: Option<String>,
    ) -> Result<usize, CoreError> {
        self.engine
            .jobs()
            .change_deployment_tenant(self.engine.store(), definition_id, tenant_id)
            .await
    }

    /// Lock due jobs using the configured executor settings
    pub async fn acquire_due_jobs(&self) -> Result<Vec<JobEntity>, CoreError> {
        let now = self.engine.clock().now();
        self.engine
            .jobs()
            .acquire_due_jobs(self.engine.store(), now, &self.engine.config().async_executor)
            .await
    }

    /// Run an acquired job
    pub async fn execute_job(&self, job: &JobEntity) -> Result<JobOutcome, CoreError> {
        self.engine.jobs().execute(&self.engine, job).await
    }

    /// One acquisition cycle: acquire due jobs and run them
    pub async fn run_due_jobs(&self) -> Result<Vec<JobOutcome>, CoreError> {
        self.executor().run_once().await
    }

    /// Job executor bound to this engine
    pub fn executor(&self) -> AsyncJobExecutor {
        AsyncJobExecutor::new(self.engine.clone())
    }

    /// Start polling for due jobs in the background
    pub fn start_executor(&self) -> ExecutorHandle {
        self.executor().start()
    }

    // History

    fn history_at_least(&self, level: HistoryLevel) -> bool {
        self.engine.history().is_at_least(level)
    }

    /// Audit record of a process instance, running or ended
    pub async fn historic_process_instance(
        &self,
        process_instance_id: &ExecutionId,
    ) -> Result<Option<HistoricProcessInstance>, CoreError> {
        if !self.history_at_least(HistoryLevel::Activity) {
            return Ok(None);
        }
        let mut ctx = self.engine.new_context();
        ctx.get::<HistoricProcessInstance>(process_instance_id.as_str())
            .await
    }

    /// Node passes of a process instance
    pub async fn historic_activity_instances(
        &self,
        process_instance_id: &ExecutionId,
    ) -> Result<Vec<HistoricActivityInstance>, CoreError> {
        if !self.history_at_least(HistoryLevel::Activity) {
            return Ok(Vec::new());
        }
        self.select(Query::HistoricActivityInstancesByProcessInstance(
            process_instance_id.clone(),
        ))
        .await
    }

    /// Current values of the variables of a process instance
    pub async fn historic_variable_instances(
        &self,
        process_instance_id: &ExecutionId,
    ) -> Result<Vec<HistoricVariableInstance>, CoreError> {
        if !self.history_at_least(HistoryLevel::Activity) {
            return Ok(Vec::new());
        }
        self.select(Query::HistoricVariableInstancesByProcessInstance(
            process_instance_id.clone(),
        ))
        .await
    }

    /// Variable update trail of a process instance
    pub async fn historic_details(
        &self,
        process_instance_id: &ExecutionId,
    ) -> Result<Vec<HistoricDetail>, CoreError> {
        if !self.history_at_least(HistoryLevel::Full) {
            return Ok(Vec::new());
        }
        self.select(Query::HistoricDetailsByProcessInstance(
            process_instance_id.clone(),
        ))
        .await
    }

    /// User tasks of a process instance, open and closed
    pub async fn historic_task_instances(
        &self,
        process_instance_id: &ExecutionId,
    ) -> Result<Vec<HistoricTaskInstance>, CoreError> {
        if !self.history_at_least(HistoryLevel::Audit) {
            return Ok(Vec::new());
        }
        self.select(Query::HistoricTaskInstancesByProcessInstance(
            process_instance_id.clone(),
        ))
        .await
    }

    /// Assignment and candidate trail of a task
    pub async fn historic_identity_links(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<HistoricIdentityLink>, CoreError> {
        if !self.history_at_least(HistoryLevel::Audit) {
            return Ok(Vec::new());
        }
        self.select(Query::HistoricIdentityLinksByTask(task_id.clone()))
            .await
    }
}
