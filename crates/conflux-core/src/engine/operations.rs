use std::sync::Arc;
use tracing::debug;

use super::agenda::Operation;
use super::deployment::DeployedProcess;
use super::ExecutionEngine;
use crate::behavior::{ActivityBehavior, ActivityExecution};
use crate::context::CommandContext;
use crate::domain::definition::{BoundaryEventDefinition, Node, NodeKind};
use crate::domain::events::EngineEvent;
use crate::domain::execution::{ExecutionEntity, ScopeKind};
use crate::domain::job::JobEntity;
use crate::domain::subscription::EventSubscription;
use crate::job::handler::{ASYNC_CONTINUATION, TIMER_TRANSITION};
use crate::store::Query;
use crate::types::{ExecutionId, VariableMap};
use crate::CoreError;

impl ExecutionEngine {
    /// Run the behavior of the execution's current node
    pub(crate) async fn execute_activity(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        skip_async: bool,
    ) -> Result<(), CoreError> {
        let Some(mut execution) = ctx.get::<ExecutionEntity>(id.as_str()).await? else {
            debug!(execution_id = %id, "Execution removed before it could run");
            return Ok(());
        };
        let process = self.deployments.get(&execution.process_definition_id)?;

        if let Some(flow_id) = execution.current_flow.take() {
            let target = process.graph().flow(&flow_id)?.target.clone();
            execution.activity_id = Some(target);
            execution.is_active = true;
            ctx.update(execution.clone());
        }

        let node_id = execution.current_activity()?.to_string();
        let node = process.graph().node(&node_id)?;

        if node.async_before && !skip_async {
            let job = self.jobs.schedule_async(
                ctx,
                &execution,
                ASYNC_CONTINUATION,
                Some(node_id.clone()),
                node.exclusive,
            );
            debug!(
                execution_id = %execution.id,
                activity_id = %node_id,
                job_id = %job.id,
                "Deferred activity to an async continuation"
            );
            return Ok(());
        }

        let (execution, behavior, record): (ExecutionEntity, Arc<dyn ActivityBehavior>, bool) =
            if self.is_multi_instance_instance(ctx, &execution, node).await? {
                (execution, process.behavior(&node_id)?, true)
            } else if process.graph().needs_activity_scope(node) {
                let scope = self
                    .create_activity_scope(ctx, execution, node, &process)
                    .await?;
                match process.multi_instance(&node_id) {
                    Some(wrapper) => (scope, wrapper, false),
                    None => (scope, process.behavior(&node_id)?, true),
                }
            } else {
                (execution, process.behavior(&node_id)?, true)
            };

        debug!(
            execution_id = %execution.id,
            activity_id = %node_id,
            activity_type = node.type_name(),
            "Executing activity"
        );
        if record {
            self.history
                .record_activity_start(ctx, &execution, node)
                .await?;
            ctx.record_event(EngineEvent::ActivityStarted {
                process_instance_id: execution.process_instance_id.clone(),
                execution_id: execution.id.clone(),
                activity_id: node_id.clone(),
                timestamp: ctx.now(),
            });
        }

        let mut handle =
            ActivityExecution::new(self, ctx, process.clone(), execution.id.clone(), node_id);
        behavior.execute(&mut handle).await
    }

    /// Whether `execution` is one instance of a parallel multi-instance activity
    pub(crate) async fn is_multi_instance_instance(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        node: &Node,
    ) -> Result<bool, CoreError> {
        if node.multi_instance.is_none() || !execution.is_concurrent {
            return Ok(false);
        }
        let Some(parent_id) = &execution.parent_id else {
            return Ok(false);
        };
        let parent = self.execution(ctx, parent_id).await?;
        Ok(parent.is_multi_instance_root && parent.activity_id.as_deref() == Some(node.id.as_str()))
    }

    /// Complete the execution's current node and hand over to its behavior's leave step
    pub(crate) async fn leave_activity(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
    ) -> Result<(), CoreError> {
        let Some(execution) = ctx.get::<ExecutionEntity>(id.as_str()).await? else {
            debug!(execution_id = %id, "Execution removed before it could leave");
            return Ok(());
        };
        let process = self.deployments.get(&execution.process_definition_id)?;
        let node_id = execution.current_activity()?.to_string();
        let node = process.graph().node(&node_id)?;

        self.history.record_activity_end(ctx, &execution, None).await?;
        ctx.record_event(EngineEvent::ActivityCompleted {
            process_instance_id: execution.process_instance_id.clone(),
            execution_id: execution.id.clone(),
            activity_id: node_id.clone(),
            timestamp: ctx.now(),
        });

        let wrapper = match process.multi_instance(&node_id) {
            Some(wrapper)
                if execution.is_multi_instance_root
                    || self.is_multi_instance_instance(ctx, &execution, node).await? =>
            {
                Some(wrapper)
            }
            _ => None,
        };
        let behavior: Arc<dyn ActivityBehavior> = match wrapper {
            Some(wrapper) => wrapper,
            None => process.behavior(&node_id)?,
        };

        let mut handle =
            ActivityExecution::new(self, ctx, process.clone(), execution.id.clone(), node_id);
        behavior.leave(&mut handle).await
    }

    /// Move an execution along one flow, or fork it along several
    pub(crate) async fn take_flows(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        flow_ids: Vec<String>,
    ) -> Result<(), CoreError> {
        let Some(mut execution) = ctx.get::<ExecutionEntity>(id.as_str()).await? else {
            debug!(execution_id = %id, "Execution removed before it could move on");
            return Ok(());
        };
        let mut flows = flow_ids.into_iter();
        let Some(first) = flows.next() else {
            return Ok(());
        };
        let rest: Vec<String> = flows.collect();

        if rest.is_empty() {
            execution.current_flow = Some(first);
            ctx.update(execution);
            ctx.push_operation(Operation::ExecuteActivity {
                execution_id: id.clone(),
                skip_async: false,
            });
            return Ok(());
        }

        let now = ctx.now();
        let mut operations = Vec::with_capacity(rest.len() + 1);
        if execution.is_concurrent {
            let parent_id = execution.parent_id.clone().ok_or_else(|| {
                CoreError::IllegalState(format!("Concurrent execution {} has no parent", id))
            })?;
            let mut parent = self.execution(ctx, &parent_id).await?;
            execution.current_flow = Some(first);
            ctx.update(execution.clone());
            operations.push(id.clone());
            for flow_id in rest {
                let mut sibling =
                    ExecutionEntity::new_child(&parent, execution.activity_id.clone(), None, true, now);
                sibling.current_flow = Some(flow_id);
                parent.add_child(sibling.id.clone());
                operations.push(sibling.id.clone());
                ctx.insert(sibling);
            }
            ctx.update(parent);
        } else {
            execution.is_active = false;
            for flow_id in std::iter::once(first).chain(rest) {
                let mut child = ExecutionEntity::new_child(
                    &execution,
                    execution.activity_id.clone(),
                    None,
                    true,
                    now,
                );
                child.current_flow = Some(flow_id);
                execution.add_child(child.id.clone());
                operations.push(child.id.clone());
                ctx.insert(child);
            }
            ctx.update(execution);
        }

        debug!(execution_id = %id, branches = operations.len(), "Forking");
        ctx.push_operations_in_order(
            operations
                .into_iter()
                .map(|execution_id| Operation::ExecuteActivity {
                    execution_id,
                    skip_async: false,
                })
                .collect(),
        );
        Ok(())
    }

    /// Destroy a token and propagate completion upwards
    pub(crate) async fn end_execution(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
    ) -> Result<(), CoreError> {
        let Some(execution) = ctx.get::<ExecutionEntity>(id.as_str()).await? else {
            debug!(execution_id = %id, "Execution already removed");
            return Ok(());
        };
        self.history.record_activity_end(ctx, &execution, None).await?;

        let Some(parent_id) = execution.parent_id.clone() else {
            return self.complete_process_instance(ctx, execution).await;
        };

        if execution.scope == Some(ScopeKind::SubProcess) && !execution.is_concurrent {
            self.remove_execution(ctx, &execution, None).await?;
            let mut parent = self.execution(ctx, &parent_id).await?;
            parent.is_active = true;
            ctx.update(parent);
            debug!(execution_id = %parent_id, "Sub-process completed");
            ctx.push_operation(Operation::LeaveActivity {
                execution_id: parent_id,
            });
            return Ok(());
        }

        self.remove_execution(ctx, &execution, None).await?;
        let parent = self.execution(ctx, &parent_id).await?;
        if parent.child_ids.is_empty() {
            ctx.push_operation(Operation::EndExecution {
                execution_id: parent_id,
            });
            return Ok(());
        }

        // a finished branch may be the last one an inclusive join was waiting for
        let process = self.deployments.get(&parent.process_definition_id)?;
        for child_id in &parent.child_ids {
            let Some(child) = ctx.get::<ExecutionEntity>(child_id.as_str()).await? else {
                continue;
            };
            let waiting_at_inclusive_join = !child.is_active
                && child.child_ids.is_empty()
                && child
                    .activity_id
                    .as_deref()
                    .and_then(|a| process.graph().node(a).ok())
                    .map(|n| matches!(n.kind, NodeKind::InclusiveGateway))
                    .unwrap_or(false);
            if waiting_at_inclusive_join {
                ctx.push_operation(Operation::ExecuteActivity {
                    execution_id: child.id.clone(),
                    skip_async: true,
                });
                break;
            }
        }
        Ok(())
    }

    /// Resume a waiting execution
    pub(crate) async fn trigger(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        signal: Option<String>,
        payload: Option<VariableMap>,
    ) -> Result<(), CoreError> {
        let Some(execution) = ctx.get::<ExecutionEntity>(id.as_str()).await? else {
            debug!(execution_id = %id, "Execution removed before it could be triggered");
            return Ok(());
        };
        if execution.is_suspended() {
            return Err(CoreError::IllegalState(format!(
                "Execution {} is suspended",
                id
            )));
        }
        let process = self.deployments.get(&execution.process_definition_id)?;
        let node_id = execution.current_activity()?.to_string();

        self.clear_wait_state(ctx, &execution, &process).await?;
        if let Some(payload) = payload {
            self.set_variables(ctx, id, payload).await?;
        }

        debug!(execution_id = %id, activity_id = %node_id, signal = ?signal, "Triggering execution");
        let behavior = process.behavior(&node_id)?;
        let mut handle = ActivityExecution::new(self, ctx, process.clone(), id.clone(), node_id);
        behavior.trigger(&mut handle, signal.as_deref()).await
    }

    /// Drop the subscriptions and timers an execution waits on, keeping those of boundary events
    async fn clear_wait_state(
        &self,
        ctx: &mut CommandContext,
        execution: &ExecutionEntity,
        process: &DeployedProcess,
    ) -> Result<(), CoreError> {
        let subscriptions: Vec<EventSubscription> = ctx
            .query(Query::EventSubscriptionsByExecution(execution.id.clone()))
            .await?;
        for subscription in subscriptions {
            let is_boundary = process
                .graph()
                .node(&subscription.activity_id)
                .map(|n| matches!(n.kind, NodeKind::BoundaryEvent { .. }))
                .unwrap_or(false);
            if !is_boundary {
                ctx.delete(subscription);
            }
        }
        let jobs: Vec<JobEntity> = ctx
            .query(Query::JobsByExecution(execution.id.clone()))
            .await?;
        for job in jobs {
            if job.handler_type == TIMER_TRANSITION {
                ctx.delete(job);
            }
        }
        Ok(())
    }

    /// Fire a boundary event attached to the activity of `scope_id`
    pub(crate) async fn fire_boundary_event(
        &self,
        ctx: &mut CommandContext,
        scope_id: &ExecutionId,
        boundary_id: &str,
        payload: Option<VariableMap>,
    ) -> Result<(), CoreError> {
        let Some(scope) = ctx.get::<ExecutionEntity>(scope_id.as_str()).await? else {
            debug!(execution_id = %scope_id, "Boundary scope already removed");
            return Ok(());
        };
        if scope.is_suspended() {
            return Err(CoreError::IllegalState(format!(
                "Execution {} is suspended",
                scope_id
            )));
        }
        let process = self.deployments.get(&scope.process_definition_id)?;
        let boundary = process.graph().node(boundary_id)?;
        let NodeKind::BoundaryEvent {
            cancel_activity, ..
        } = &boundary.kind
        else {
            return Err(CoreError::ConfigurationError(format!(
                "{} is not a boundary event",
                boundary_id
            )));
        };
        if let Some(payload) = payload {
            self.set_variables(ctx, scope_id, payload).await?;
        }

        debug!(
            execution_id = %scope_id,
            boundary_id,
            interrupting = *cancel_activity,
            "Firing boundary event"
        );

        if *cancel_activity {
            let reason = format!("boundary event ({}) interrupted", boundary_id);
            self.destroy_children(ctx, scope_id, &reason).await?;
            let mut scope = self.execution(ctx, scope_id).await?;
            self.clear_execution_state(ctx, &scope, Some(&reason)).await?;

            let continuing = if scope.is_concurrent {
                scope.scope = None;
                scope.is_multi_instance_root = false;
                scope.activity_id = Some(boundary_id.to_string());
                scope.is_active = true;
                ctx.update(scope);
                scope_id.clone()
            } else {
                let parent_id = scope.parent_id.clone().ok_or_else(|| {
                    CoreError::IllegalState(format!("Activity scope {} has no parent", scope_id))
                })?;
                self.remove_execution(ctx, &scope, None).await?;
                let mut parent = self.execution(ctx, &parent_id).await?;
                parent.activity_id = Some(boundary_id.to_string());
                parent.is_active = true;
                ctx.update(parent);
                parent_id
            };
            ctx.push_operation(Operation::ExecuteActivity {
                execution_id: continuing,
                skip_async: true,
            });
            return Ok(());
        }

        let mut scope = scope;
        let branch_parent_id = if scope.is_concurrent {
            scope.parent_id.clone()
        } else {
            let parent_id = scope.parent_id.clone().ok_or_else(|| {
                CoreError::IllegalState(format!("Activity scope {} has no parent", scope_id))
            })?;
            let parent = self.execution(ctx, &parent_id).await?;
            if parent.is_concurrent {
                parent.parent_id.clone()
            } else {
                scope.is_concurrent = true;
                ctx.update(scope.clone());
                Some(parent_id)
            }
        };
        let branch_parent_id = branch_parent_id.ok_or_else(|| {
            CoreError::IllegalState(format!("No execution can carry boundary event {}", boundary_id))
        })?;
        let branch = self
            .create_concurrent_child(ctx, &branch_parent_id, boundary_id)
            .await?;
        ctx.push_operation(Operation::ExecuteActivity {
            execution_id: branch.id,
            skip_async: true,
        });
        Ok(())
    }

    /// Route a BPMN error to the nearest matching error boundary event,
    /// crossing into calling processes
    pub(crate) async fn propagate_error(
        &self,
        ctx: &mut CommandContext,
        id: &ExecutionId,
        error_code: &str,
    ) -> Result<(), CoreError> {
        let mut current = ctx.get::<ExecutionEntity>(id.as_str()).await?;
        while let Some(execution) = current {
            if execution.scope == Some(ScopeKind::Activity) {
                let process = self.deployments.get(&execution.process_definition_id)?;
                let activity_id = execution.current_activity()?;
                let graph = process.graph();
                let handler = graph.boundary_events(activity_id).iter().find(|b| {
                    graph
                        .node(b)
                        .map(|n| match &n.kind {
                            NodeKind::BoundaryEvent {
                                event: BoundaryEventDefinition::Error(code),
                                ..
                            } => code.as_deref().map(|c| c == error_code).unwrap_or(true),
                            _ => false,
                        })
                        .unwrap_or(false)
                });
                if let Some(boundary_id) = handler {
                    debug!(
                        execution_id = %execution.id,
                        boundary_id = %boundary_id,
                        error_code,
                        "BPMN error caught"
                    );
                    let boundary_id = boundary_id.clone();
                    return self
                        .fire_boundary_event(ctx, &execution.id, &boundary_id, None)
                        .await;
                }
            }
            let next = execution
                .parent_id
                .clone()
                .or_else(|| execution.super_execution_id.clone());
            current = match next {
                Some(next) => ctx.get::<ExecutionEntity>(next.as_str()).await?,
                None => None,
            };
        }
        Err(CoreError::bpmn(error_code))
    }
}
