//! Activity behaviors
//!
//! Every node of a deployed process is backed by an [`ActivityBehavior`]. A
//! behavior never calls back into the engine recursively: it inspects and
//! mutates the execution tree through the [`ActivityExecution`] handle and
//! queues follow-up operations on the agenda.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::context::CommandContext;
use crate::domain::definition::{Node, TimerDefinition};
use crate::domain::execution::ExecutionEntity;
use crate::domain::job::JobEntity;
use crate::domain::subscription::{EventSubscription, EventType};
use crate::engine::agenda::Operation;
use crate::engine::deployment::DeployedProcess;
use crate::engine::ExecutionEngine;
use crate::job::duration::resolve_timer;
use crate::types::{ExecutionId, VariableMap};
use crate::CoreError;

/// Condition evaluation
pub mod condition;
/// Start, end, intermediate and boundary events
pub mod events;
/// Exclusive, parallel, inclusive and event-based gateways
pub mod gateways;
/// Multi-instance wrapper
pub mod multi_instance;
/// Node kind to behavior factory
pub mod registry;
/// Embedded sub-processes, transactions and call activities
pub mod subprocess;
/// User, service, script, manual, receive and send tasks
pub mod tasks;

pub use condition::{ConditionEvaluator, JmesPathEvaluator};
pub use registry::{BehaviorFactory, BehaviorRegistry};
pub use tasks::{DelegateInput, ServiceTaskDelegate};

/// The step a node performs when a token enters, is triggered at, or leaves it
#[async_trait]
pub trait ActivityBehavior: Send + Sync {
    /// Run when an execution arrives at the node
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError>;

    /// Run when a waiting execution is resumed
    async fn trigger(
        &self,
        execution: &mut ActivityExecution<'_>,
        signal: Option<&str>,
    ) -> Result<(), CoreError> {
        let _ = signal;
        Err(CoreError::ConfigurationError(format!(
            "Activity {} does not accept signals",
            execution.node_id()
        )))
    }

    /// Run when the node is completed; takes the outgoing flows by default
    async fn leave(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        execution.take_outgoing_flows().await
    }
}

/// Handle through which a behavior acts on one execution within a unit of work
pub struct ActivityExecution<'a> {
    engine: &'a ExecutionEngine,
    ctx: &'a mut CommandContext,
    process: Arc<DeployedProcess>,
    execution_id: ExecutionId,
    node_id: String,
}

impl<'a> ActivityExecution<'a> {
    pub(crate) fn new(
        engine: &'a ExecutionEngine,
        ctx: &'a mut CommandContext,
        process: Arc<DeployedProcess>,
        execution_id: ExecutionId,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            ctx,
            process,
            execution_id,
            node_id: node_id.into(),
        }
    }

    /// Id of the execution being advanced
    pub fn id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Id of the node being run
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The node being run
    pub fn node(&self) -> Result<&Node, CoreError> {
        self.process.graph().node(&self.node_id)
    }

    /// Deployed process the node belongs to
    pub fn process(&self) -> &Arc<DeployedProcess> {
        &self.process
    }

    /// The engine
    pub fn engine(&self) -> &'a ExecutionEngine {
        self.engine
    }

    /// The current unit of work
    pub fn context(&mut self) -> &mut CommandContext {
        &mut *self.ctx
    }

    /// Point the handle at another execution, e.g. the parent after a scope is left
    pub(crate) fn switch_to(&mut self, execution_id: ExecutionId) {
        self.execution_id = execution_id;
    }

    /// Load the execution
    pub async fn execution(&mut self) -> Result<ExecutionEntity, CoreError> {
        self.engine.execution(self.ctx, &self.execution_id).await
    }

    // ---- agenda ----

    /// Complete the node
    pub fn leave(&mut self) {
        self.ctx.push_operation(Operation::LeaveActivity {
            execution_id: self.execution_id.clone(),
        });
    }

    /// Move along the given flows; several flows fork
    pub fn take(&mut self, flow_ids: Vec<String>) {
        self.ctx.push_operation(Operation::TakeFlows {
            execution_id: self.execution_id.clone(),
            flow_ids,
        });
    }

    /// Destroy the token
    pub fn end(&mut self) {
        self.ctx.push_operation(Operation::EndExecution {
            execution_id: self.execution_id.clone(),
        });
    }

    /// Throw a BPMN error from this execution
    pub fn propagate_error(&mut self, error_code: impl Into<String>) {
        self.ctx.push_operation(Operation::PropagateError {
            execution_id: self.execution_id.clone(),
            error_code: error_code.into(),
        });
    }

    /// Leave the activity scope, if any, and take every outgoing flow whose
    /// condition holds, falling back to the default flow. A node without
    /// outgoing flows ends the token.
    pub async fn take_outgoing_flows(&mut self) -> Result<(), CoreError> {
        self.exit_scope().await?;
        let process = self.process.clone();
        let node = process.graph().node(&self.node_id)?;
        if process.graph().outgoing(&node.id).is_empty() {
            self.end();
            return Ok(());
        }
        let flows = self.select_flows(node, false).await?;
        self.take(flows);
        Ok(())
    }

    /// Leave the activity scope, if any, and continue on the execution that carries on
    pub async fn exit_scope(&mut self) -> Result<(), CoreError> {
        let continuing = self
            .engine
            .exit_activity_scope(self.ctx, &self.execution_id)
            .await?;
        self.switch_to(continuing);
        Ok(())
    }

    /// Outgoing flows of `node` whose condition holds, in definition order.
    /// The default flow is only chosen when nothing else matches.
    pub async fn select_flows(&mut self, node: &Node, first_only: bool) -> Result<Vec<String>, CoreError> {
        let process = self.process.clone();
        let graph = process.graph();
        let context = self.variables_as_json().await?;
        let evaluator = self.engine.evaluator();

        let mut selected = Vec::new();
        for flow_id in graph.outgoing(&node.id) {
            if node.default_flow.as_ref() == Some(flow_id) {
                continue;
            }
            let flow = graph.flow(flow_id)?;
            let taken = match &flow.condition {
                Some(condition) => evaluator.evaluate_condition(condition, &context)?,
                None => true,
            };
            if taken {
                selected.push(flow_id.clone());
                if first_only {
                    break;
                }
            }
        }

        if selected.is_empty() {
            if let Some(default_flow) = &node.default_flow {
                selected.push(default_flow.clone());
            }
        }
        if selected.is_empty() {
            return Err(CoreError::BehaviorError(format!(
                "No outgoing sequence flow of {} could be selected",
                node.id
            )));
        }
        Ok(selected)
    }

    // ---- variables ----

    /// Variables visible from the execution
    pub async fn variables(&mut self) -> Result<VariableMap, CoreError> {
        self.engine.variables(self.ctx, &self.execution_id).await
    }

    /// Visible variables as a JSON object, the evaluation context of expressions
    pub async fn variables_as_json(&mut self) -> Result<Value, CoreError> {
        Ok(Value::Object(self.variables().await?.into_iter().collect()))
    }

    /// Look up one visible variable
    pub async fn variable(&mut self, name: &str) -> Result<Option<Value>, CoreError> {
        self.engine.variable(self.ctx, &self.execution_id, name).await
    }

    /// Set a variable where it is defined, or on the process instance
    pub async fn set_variable(&mut self, name: &str, value: Value) -> Result<(), CoreError> {
        self.engine
            .set_variable(self.ctx, &self.execution_id, name, value)
            .await
    }

    /// Set a variable on this execution only
    pub async fn set_variable_local(&mut self, name: &str, value: Value) -> Result<(), CoreError> {
        self.engine
            .set_variable_local(self.ctx, &self.execution_id, name, value)
            .await
    }

    /// Evaluate an expression over the visible variables
    pub async fn evaluate(&mut self, expression: &str) -> Result<Value, CoreError> {
        let context = self.variables_as_json().await?;
        self.engine.evaluator().evaluate(expression, &context)
    }

    /// Evaluate a condition over the visible variables
    pub async fn evaluate_condition(&mut self, expression: &str) -> Result<bool, CoreError> {
        let context = self.variables_as_json().await?;
        self.engine.evaluator().evaluate_condition(expression, &context)
    }

    // ---- waiting ----

    /// Schedule a timer job on the execution
    pub async fn schedule_timer(
        &mut self,
        timer: &TimerDefinition,
        handler_type: &str,
        configuration: Option<String>,
    ) -> Result<JobEntity, CoreError> {
        let execution = self.execution().await?;
        let exclusive = self.node()?.exclusive;
        let resolved = resolve_timer(timer, self.ctx.now())?;
        Ok(self.engine.jobs().schedule_timer(
            self.ctx,
            &execution,
            resolved,
            handler_type,
            configuration,
            exclusive,
        ))
    }

    /// Subscribe the execution to a message or signal; `activity_id` reacts when it arrives
    pub async fn subscribe(
        &mut self,
        event_type: EventType,
        event_name: &str,
        activity_id: &str,
    ) -> Result<EventSubscription, CoreError> {
        let execution = self.execution().await?;
        Ok(self
            .engine
            .subscribe(self.ctx, &execution, event_type, event_name, activity_id))
    }

    // ---- history ----

    /// Close the historic activity instance of the execution's current node
    pub async fn record_activity_end(&mut self) -> Result<(), CoreError> {
        let execution = self.execution().await?;
        self.engine
            .history()
            .record_activity_end(self.ctx, &execution, None)
            .await
    }
}
