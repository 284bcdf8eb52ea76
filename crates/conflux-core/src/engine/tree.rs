use std::sync::Arc;
use tracing::{debug, info};

use super::agenda::Operation;
use super::deployment::DeployedProcess;
use super::ExecutionEngine;
use crate::context::CommandContext;
use crate::domain::definition::{BoundaryEventDefinition, Node, NodeKind};
use crate::domain::events::EngineEvent;
use crate::domain::execution::{ExecutionEntity, ScopeKind, SuspensionState};
use crate::domain::subscription::{EventSubscription, EventType};
use crate::domain::task::TaskEntity;
use crate::job::duration::resolve_timer;
use crate::job::handler::TIMER_BOUNDARY;
use crate::store::Query;
use crate::types::{ExecutionId, VariableMap};
use crate::CoreError;

/// How a converging gateway decides that every expected branch has arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// One arrival per incoming flow
    Parallel,
    /// No other branch can still reach the gateway
    Inclusive,
}

impl ExecutionEngine {
    // ---- scopes ----

    /// Create the activity scope execution for `node` below `parent` and
    /// register the boundary events attached to the node
    pub(crate) async fn create_activity_scope(
        &self,
        ctx: &mut CommandContext,
        mut parent: ExecutionEntity,
        node: &Node,
        process: &DeployedProcess,
    ) -> Result<ExecutionEntity, CoreError> {
        let now = ctx.now();
        let mut scope = ExecutionEntity::new_child(
            &parent,
            Some(node.id.clone()),
            Some(ScopeKind::Activity),
            false,
            now,
        );
        scope.is_multi_instance_root = node.multi_instance.is_some();
        parent.is_active = false;
        parent.add_child(scope.id.clone());
        ctx.update(parent);
        ctx.insert(scope.clone());

        let graph = process.graph();
        for boundary_id in graph.boundary_events(&node.id) {
            let boundary = graph.node(boundary_id)?;
            let NodeKind::BoundaryEvent { event, .. } = &boundary.kind else {
                continue;
            };
            match event {
                BoundaryEventDefinition::Timer(timer) => {
                    let resolved = resolve_timer(timer, now)?;
                    self.jobs.schedule_timer(
                        ctx,
                        &scope,
                        resolved,
                        TIMER_BOUNDARY,
                        Some(boundary_id.clone()),
                        boundary.exclusive,
                    );
                }
                BoundaryEventDefinition::Message(name) => {
                    self.subscribe(ctx, &scope, EventType::Message, name, boundary_id);
                }
                BoundaryEventDefinition::Signal(name) => {
                    self.subscribe(ctx, &scope, EventType::Signal, name, boundary_id);
                }
                BoundaryEventDefinition::Error(_) | BoundaryEventDefinition::Cancel => {}
            }
        }

        debug!(
            execution_id = %scope.id,
            activity_id = %node.id,
            multi_instance = scope.is_multi_instance_root,
            "Created activity scope"
        );
        Ok(scope)
    }

    /// Leave the activity scope execution `id`, if it is one. Returns the
    /// execution that carries on: the parent for a plain scope, the execution
    /// itself for a concurrent one or when there is no activity scope.
    pub async fn exit_activity_scope(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
    ) -> Result<ExecutionId, CoreError> {
        let mut scope = self.execution(ctx, id).await?;
        if scope.scope != Some(ScopeKind::Activity) {
            return Ok(id.clone());
        }
        self.jobs.cancel_jobs_for(ctx, id).await?;
        self.delete_subscriptions_of(ctx, id).await?;
        self.delete_variables_of(ctx, id).await?;

        if scope.is_concurrent {
            scope.scope = None;
            scope.is_multi_instance_root = false;
            ctx.update(scope);
            return Ok(id.clone());
        }

        let parent_id = scope.parent_id.clone().ok_or_else(|| {
            CoreError::IllegalState(format!("Activity scope {} has no parent", id))
        })?;
        let activity_id = scope.activity_id.clone();
        self.remove_execution(ctx, &scope, None).await?;
        let mut parent = self.execution(ctx, &parent_id).await?;
        parent.activity_id = activity_id;
        parent.is_active = true;
        ctx.update(parent);
        Ok(parent_id)
    }

    /// Add a concurrent child at `activity_id` below `parent_id`; the parent stops carrying a token
    pub async fn create_concurrent_child(
        &self,
        ctx: &mut CommandContext,
        parent_id: &ExecutionId,
        activity_id: &str,
    ) -> Result<ExecutionEntity, CoreError> {
        let mut parent = self.execution(ctx, parent_id).await?;
        let child = ExecutionEntity::new_child(
            &parent,
            Some(activity_id.to_string()),
            None,
            true,
            ctx.now(),
        );
        parent.is_active = false;
        parent.add_child(child.id.clone());
        ctx.update(parent);
        ctx.insert(child.clone());
        Ok(child)
    }

    // ---- teardown ----

    async fn delete_subscriptions_of(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
    ) -> Result<(), CoreError> {
        let subscriptions: Vec<EventSubscription> = ctx
            .query(Query::EventSubscriptionsByExecution(id.clone()))
            .await?;
        for subscription in subscriptions {
            ctx.delete(subscription);
        }
        Ok(())
    }

    /// Remove everything owned by one execution: jobs, subscriptions, tasks
    /// and variables. With a reason, the open historic activity instance is
    /// closed with it.
    pub(crate) async fn clear_execution_state(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        reason: Option<&str>,
    ) -> Result<(), CoreError> {
        self.jobs.cancel_jobs_for(ctx, &execution.id).await?;
        self.jobs.delete_dead_letter_jobs_for(ctx, &execution.id).await?;
        self.delete_subscriptions_of(ctx, &execution.id).await?;

        let tasks: Vec<TaskEntity> = ctx
            .query(Query::TasksByExecution(execution.id.clone()))
            .await?;
        for task in tasks {
            self.history
                .record_task_end(ctx, &task.id, reason.unwrap_or("deleted"))
                .await?;
            ctx.delete(task);
        }

        self.delete_variables_of(ctx, &execution.id).await?;
        if let Some(reason) = reason {
            self.history
                .record_activity_end(ctx, execution, Some(reason))
                .await?;
        }
        Ok(())
    }

    /// Delete one execution after clearing its state and detaching it from its parent
    pub async fn remove_execution(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        reason: Option<&str>,
    ) -> Result<(), CoreError> {
        self.clear_execution_state(ctx, execution, reason).await?;
        if let Some(parent_id) = &execution.parent_id {
            if let Some(mut parent) = ctx.get::<ExecutionEntity>(parent_id.as_str()).await? {
                parent.remove_child(&execution.id);
                ctx.update(parent);
            }
        }

        let mut removed = execution.clone();
        removed.delete_reason = reason.map(str::to_string);
        ctx.delete(removed);

        if execution.is_process_instance() {
            let reason = reason.unwrap_or("deleted").to_string();
            self.history
                .record_process_instance_end(
                    ctx,
                    &execution.id,
                    execution.activity_id.clone(),
                    Some(reason.clone()),
                )
                .await?;
            info!(
                process_instance_id = %execution.id,
                reason = %reason,
                "Process instance cancelled"
            );
            let timestamp = ctx.now();
            ctx.record_event(EngineEvent::ProcessCancelled {
                process_instance_id: execution.id.clone(),
                reason,
                timestamp,
            });
        }
        Ok(())
    }

    /// Remove every descendant of `id`, including process instances started
    /// by call activities below it, deepest first
    pub async fn destroy_children(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        reason: &str,
    ) -> Result<(), CoreError> {
        let mut ordered: Vec<ExecutionEntity> = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current_id) = stack.pop() {
            let Some(current) = ctx.get::<ExecutionEntity>(current_id.as_str()).await? else {
                continue;
            };
            for child_id in current.child_ids.iter().rev() {
                stack.push(child_id.clone());
            }
            let called: Vec<ExecutionEntity> = ctx
                .query(Query::SubProcessInstance(current_id.clone()))
                .await?;
            for instance in called {
                stack.push(instance.id.clone());
            }
            if &current_id != id {
                ordered.push(current);
            }
        }

        debug!(execution_id = %id, descendants = ordered.len(), reason, "Destroying subtree");
        for execution in ordered.into_iter().rev() {
            // re-read: removing a child rewrote the parent's child list
            let Some(execution) = ctx.get::<ExecutionEntity>(execution.id.as_str()).await? else {
                continue;
            };
            self.remove_execution(ctx, &execution, Some(reason)).await?;
        }
        Ok(())
    }

    // ---- joins ----

    /// Park the execution `id` at the converging gateway `node_id` and decide
    /// whether the join fires. Returns the execution that continues past the
    /// gateway, or `None` while branches are still outstanding.
    pub async fn join(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        node_id: &str,
        kind: JoinKind,
    ) -> Result<Option<ExecutionId>, CoreError> {
        let mut arrival = self.execution(ctx, id).await?;
        let process = self.deployments.get(&arrival.process_definition_id)?;
        let graph = process.graph();
        let expected = graph.incoming(node_id).len();

        if !arrival.is_concurrent {
            if kind == JoinKind::Inclusive {
                return Ok(Some(id.clone()));
            }
            arrival.is_active = false;
            ctx.update(arrival);
            return Ok(None);
        }

        arrival.is_active = false;
        ctx.update(arrival.clone());
        let parent_id = arrival.parent_id.clone().ok_or_else(|| {
            CoreError::IllegalState(format!("Concurrent execution {} has no parent", id))
        })?;
        // touch the parent so that two units of work joining at once conflict on it
        let parent = self.execution(ctx, &parent_id).await?;
        ctx.update(parent.clone());

        let mut siblings = Vec::with_capacity(parent.child_ids.len());
        for child_id in &parent.child_ids {
            if let Some(child) = ctx.get::<ExecutionEntity>(child_id.as_str()).await? {
                siblings.push(child);
            }
        }
        let is_parked = |e: &ExecutionEntity| {
            !e.is_active && e.child_ids.is_empty() && e.activity_id.as_deref() == Some(node_id)
        };
        let parked: Vec<ExecutionEntity> = siblings.iter().filter(|e| is_parked(e)).cloned().collect();

        let fires = match kind {
            JoinKind::Parallel => parked.len() >= expected,
            JoinKind::Inclusive => siblings.iter().filter(|e| !is_parked(e)).all(|e| {
                match e.activity_id.as_deref() {
                    Some(activity) => {
                        activity != node_id && !graph.reachable_from(activity).contains(node_id)
                    }
                    None => true,
                }
            }),
        };
        debug!(
            execution_id = %id,
            activity_id = node_id,
            arrived = parked.len(),
            expected,
            fires,
            "Join"
        );
        if !fires {
            return Ok(None);
        }

        for execution in &parked {
            self.history.record_activity_end(ctx, execution, None).await?;
        }

        if parked.len() == siblings.len() {
            for execution in &parked {
                self.remove_execution(ctx, execution, None).await?;
            }
            let mut parent = self.execution(ctx, &parent_id).await?;
            parent.activity_id = Some(node_id.to_string());
            parent.is_active = true;
            ctx.update(parent);
            return Ok(Some(parent_id));
        }

        for execution in parked.iter().filter(|e| &e.id != id) {
            self.remove_execution(ctx, execution, None).await?;
        }
        let mut arrival = self.execution(ctx, id).await?;
        arrival.is_active = true;
        ctx.update(arrival);
        Ok(Some(id.clone()))
    }

    // ---- process instances ----

    /// Create a process instance of `process` and queue its first step.
    /// `super_execution` is the call activity execution starting it, if any.
    pub async fn start_process_instance_in(
        &self,
        ctx: &mut CommandContext,
        process: &Arc<DeployedProcess>,
        start_node: Option<&str>,
        business_key: Option<String>,
        variables: VariableMap,
        super_execution: Option<&ExecutionEntity>,
    ) -> Result<ExecutionEntity, CoreError> {
        let graph = process.graph();
        let start = match start_node {
            Some(node_id) => graph.node(node_id)?,
            None => graph.initial()?,
        };
        let tenant_id = super_execution
            .and_then(|e| e.tenant_id.clone())
            .or_else(|| process.tenant_id().map(str::to_string));

        let mut instance = ExecutionEntity::new_process_instance(
            process.id().clone(),
            start.id.clone(),
            business_key,
            tenant_id,
            ctx.now(),
        );
        if let Some(caller) = super_execution {
            instance.super_execution_id = Some(caller.id.clone());
            instance.root_process_instance_id = caller.root_process_instance_id.clone();
        }
        ctx.insert(instance.clone());
        self.history.record_process_instance_start(
            ctx,
            &instance,
            super_execution.map(|e| e.process_instance_id.clone()),
        );
        for (name, value) in variables {
            self.set_variable_local(ctx, &instance.id, &name, value).await?;
        }

        info!(
            process_instance_id = %instance.id,
            process_definition_id = %instance.process_definition_id,
            start_activity_id = %start.id,
            "Process instance started"
        );
        let timestamp = ctx.now();
        ctx.record_event(EngineEvent::ProcessStarted {
            process_instance_id: instance.id.clone(),
            process_definition_id: instance.process_definition_id.clone(),
            timestamp,
        });
        ctx.push_operation(Operation::ExecuteActivity {
            execution_id: instance.id.clone(),
            skip_async: false,
        });
        Ok(instance)
    }

    /// Finish a process instance whose last token ended; a called instance
    /// hands its output variables back and resumes the calling execution
    pub(crate) async fn complete_process_instance(
        &self,
        ctx: &mut CommandContext,
        instance: ExecutionEntity,
    ) -> Result<(), CoreError> {
        let mut output = VariableMap::new();
        let caller = match &instance.super_execution_id {
            Some(super_id) => ctx.get::<ExecutionEntity>(super_id.as_str()).await?,
            None => None,
        };
        if let Some(caller) = &caller {
            let calling_process = self.deployments.get(&caller.process_definition_id)?;
            let call_activity = calling_process.graph().node(caller.current_activity()?)?;
            if let NodeKind::CallActivity { out_variables, .. } = &call_activity.kind {
                let locals = self.local_variables(ctx, &instance.id).await?;
                for name in out_variables {
                    if let Some(value) = locals.get(name) {
                        output.insert(name.clone(), value.clone());
                    }
                }
            }
        }

        self.clear_execution_state(ctx, &instance, None).await?;
        self.history
            .record_process_instance_end(ctx, &instance.id, instance.activity_id.clone(), None)
            .await?;
        ctx.delete(instance.clone());

        info!(process_instance_id = %instance.id, "Process instance completed");
        let timestamp = ctx.now();
        ctx.record_event(EngineEvent::ProcessCompleted {
            process_instance_id: instance.id.clone(),
            timestamp,
        });

        if let Some(caller) = caller {
            for (name, value) in output {
                self.set_variable(ctx, &caller.id, &name, value).await?;
            }
            ctx.push_operation(Operation::LeaveActivity {
                execution_id: caller.id,
            });
        }
        Ok(())
    }

    /// End every token of the scope enclosing `id`; the scope then completes normally
    pub async fn terminate(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        node_id: &str,
    ) -> Result<(), CoreError> {
        let mut scope = self.execution(ctx, id).await?;
        while !matches!(
            scope.scope,
            Some(ScopeKind::ProcessInstance) | Some(ScopeKind::SubProcess)
        ) {
            let parent_id = scope.parent_id.clone().ok_or_else(|| {
                CoreError::IllegalState(format!("Execution {} has no enclosing scope", id))
            })?;
            scope = self.execution(ctx, &parent_id).await?;
        }
        debug!(execution_id = %id, scope_execution_id = %scope.id, "Terminating scope");
        self.destroy_children(ctx, &scope.id, "terminated").await?;

        let mut scope = self.execution(ctx, &scope.id).await?;
        if &scope.id != id {
            scope.activity_id = Some(node_id.to_string());
            scope.is_active = true;
            ctx.update(scope.clone());
        }
        ctx.push_operation(Operation::EndExecution {
            execution_id: scope.id,
        });
        Ok(())
    }

    /// Cancel the transaction enclosing `id` through its cancel boundary event
    pub async fn cancel_transaction(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
    ) -> Result<(), CoreError> {
        let mut body = self.execution(ctx, id).await?;
        while body.scope != Some(ScopeKind::SubProcess) {
            let parent_id = body.parent_id.clone().ok_or_else(|| {
                CoreError::BehaviorError(format!("Execution {} is not inside a transaction", id))
            })?;
            body = self.execution(ctx, &parent_id).await?;
        }
        let transaction_id = body.parent_id.clone().ok_or_else(|| {
            CoreError::IllegalState(format!("Transaction body {} has no parent", body.id))
        })?;
        let transaction = self.execution(ctx, &transaction_id).await?;
        let process = self.deployments.get(&transaction.process_definition_id)?;
        let graph = process.graph();
        let activity_id = transaction.current_activity()?;

        let cancel_boundary = graph.boundary_events(activity_id).iter().find(|b| {
            graph
                .node(b)
                .map(|n| {
                    matches!(
                        n.kind,
                        NodeKind::BoundaryEvent {
                            event: BoundaryEventDefinition::Cancel,
                            ..
                        }
                    )
                })
                .unwrap_or(false)
        });
        match cancel_boundary {
            Some(boundary_id) if transaction.scope == Some(ScopeKind::Activity) => {
                ctx.push_operation(Operation::FireBoundaryEvent {
                    scope_execution_id: transaction.id.clone(),
                    boundary_id: boundary_id.clone(),
                    payload: None,
                });
                Ok(())
            }
            _ => Err(CoreError::BehaviorError(format!(
                "Transaction {} has no cancel boundary event",
                activity_id
            ))),
        }
    }

    // ---- events ----

    /// Register `execution` as waiting for a message or signal
    pub fn subscribe(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        event_type: EventType,
        event_name: &str,
        activity_id: &str,
    ) -> EventSubscription {
        let subscription = EventSubscription {
            id: uuid::Uuid::new_v4().to_string(),
            revision: 1,
            event_type,
            event_name: event_name.to_string(),
            execution_id: execution.id.clone(),
            process_instance_id: execution.process_instance_id.clone(),
            activity_id: activity_id.to_string(),
            configuration: None,
            tenant_id: execution.tenant_id.clone(),
            created: ctx.now(),
        };
        debug!(
            execution_id = %execution.id,
            event_type = ?event_type,
            event_name,
            "Subscribed"
        );
        ctx.insert(subscription.clone());
        subscription
    }

    fn delivery(
        &self,
        subscription: &EventSubscription,
        process: &DeployedProcess,
        payload: Option<VariableMap>,
    ) -> Operation {
        let is_boundary = process
            .graph()
            .node(&subscription.activity_id)
            .map(|n| matches!(n.kind, NodeKind::BoundaryEvent { .. }))
            .unwrap_or(false);
        if is_boundary {
            Operation::FireBoundaryEvent {
                scope_execution_id: subscription.execution_id.clone(),
                boundary_id: subscription.activity_id.clone(),
                payload,
            }
        } else {
            Operation::Trigger {
                execution_id: subscription.execution_id.clone(),
                signal: Some(subscription.activity_id.clone()),
                payload,
            }
        }
    }

    /// Queue delivery of a signal to every subscribed, non-suspended execution.
    /// Returns the number of deliveries.
    pub async fn deliver_signal(
        &self,
        ctx: &mut CommandContext,
        name: &str,
        payload: Option<VariableMap>,
    ) -> Result<usize, CoreError> {
        let subscriptions: Vec<EventSubscription> = ctx
            .query(Query::EventSubscriptionsByName {
                event_type: EventType::Signal,
                event_name: name.to_string(),
            })
            .await?;
        let mut operations = Vec::with_capacity(subscriptions.len());
        for subscription in &subscriptions {
            let Some(execution) = ctx
                .get::<ExecutionEntity>(subscription.execution_id.as_str())
                .await?
            else {
                continue;
            };
            if execution.is_suspended() {
                continue;
            }
            let process = self.deployments.get(&execution.process_definition_id)?;
            operations.push(self.delivery(subscription, &process, payload.clone()));
        }
        debug!(signal = name, deliveries = operations.len(), "Signal thrown");
        let delivered = operations.len();
        ctx.push_operations_in_order(operations);
        Ok(delivered)
    }

    /// Queue delivery of a message to one subscribed execution, optionally a
    /// specific one. Returns whether a subscriber was found.
    pub async fn deliver_message(
        &self,
        ctx: &mut CommandContext,
        name: &str,
        execution_id: Option<&ExecutionId>,
        payload: Option<VariableMap>,
    ) -> Result<bool, CoreError> {
        let subscriptions: Vec<EventSubscription> = ctx
            .query(Query::EventSubscriptionsByName {
                event_type: EventType::Message,
                event_name: name.to_string(),
            })
            .await?;
        let Some(subscription) = subscriptions
            .into_iter()
            .find(|s| execution_id.map(|id| &s.execution_id == id).unwrap_or(true))
        else {
            return Ok(false);
        };
        let execution = self.execution(ctx, &subscription.execution_id).await?;
        if execution.is_suspended() {
            return Err(CoreError::IllegalState(format!(
                "Execution {} is suspended",
                execution.id
            )));
        }
        let process = self.deployments.get(&execution.process_definition_id)?;
        let operation = self.delivery(&subscription, &process, payload);
        ctx.push_operation(operation);
        Ok(true)
    }

    // ---- suspension and deletion ----

    async fn set_suspension_state(
        &self,
        ctx: &mut CommandContext,
        process_instance_id: &ExecutionId,
        state: SuspensionState,
    ) -> Result<(), CoreError> {
        let instance = self.execution(ctx, process_instance_id).await?;
        if !instance.is_process_instance() {
            return Err(CoreError::IllegalState(format!(
                "Execution {} is not a process instance",
                process_instance_id
            )));
        }
        let executions: Vec<ExecutionEntity> = ctx
            .query(Query::ExecutionsByProcessInstance(process_instance_id.clone()))
            .await?;
        for mut execution in executions {
            execution.suspension_state = state;
            ctx.update(execution);
        }
        let tasks: Vec<TaskEntity> = ctx
            .query(Query::TasksByProcessInstance(process_instance_id.clone()))
            .await?;
        for mut task in tasks {
            task.suspended = state == SuspensionState::Suspended;
            ctx.update(task);
        }
        Ok(())
    }

    /// Suspend every execution, task and job of a process instance
    pub async fn suspend_process_instance(
        &self,
        ctx: &mut CommandContext,
        process_instance_id: &ExecutionId,
    ) -> Result<(), CoreError> {
        self.set_suspension_state(ctx, process_instance_id, SuspensionState::Suspended)
            .await?;
        self.jobs.suspend_jobs_for(ctx, process_instance_id).await?;
        info!(process_instance_id = %process_instance_id, "Process instance suspended");
        let timestamp = ctx.now();
        ctx.record_event(EngineEvent::ProcessSuspended {
            process_instance_id: process_instance_id.clone(),
            timestamp,
        });
        Ok(())
    }

    /// Undo [`ExecutionEngine::suspend_process_instance`]
    pub async fn activate_process_instance(
        &self,
        ctx: &mut CommandContext,
        process_instance_id: &ExecutionId,
    ) -> Result<(), CoreError> {
        self.set_suspension_state(ctx, process_instance_id, SuspensionState::Active)
            .await?;
        self.jobs.activate_jobs_for(ctx, process_instance_id).await?;
        info!(process_instance_id = %process_instance_id, "Process instance activated");
        let timestamp = ctx.now();
        ctx.record_event(EngineEvent::ProcessActivated {
            process_instance_id: process_instance_id.clone(),
            timestamp,
        });
        Ok(())
    }

    /// Remove a running process instance together with everything it owns
    pub async fn delete_process_instance(
        &self,
        ctx: &mut CommandContext,
        process_instance_id: &ExecutionId,
        reason: &str,
    ) -> Result<(), CoreError> {
        let instance = self.execution(ctx, process_instance_id).await?;
        if !instance.is_process_instance() {
            return Err(CoreError::IllegalState(format!(
                "Execution {} is not a process instance",
                process_instance_id
            )));
        }
        self.destroy_children(ctx, process_instance_id, reason).await?;
        let instance = self.execution(ctx, process_instance_id).await?;
        self.remove_execution(ctx, &instance, Some(reason)).await
    }
}
