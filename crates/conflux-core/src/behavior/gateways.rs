use async_trait::async_trait;

use super::{ActivityBehavior, ActivityExecution};
use crate::domain::definition::{CatchEventDefinition, NodeKind};
use crate::domain::events::EngineEvent;
use crate::domain::subscription::EventType;
use crate::engine::tree::JoinKind;
use crate::job::handler::TIMER_TRANSITION;
use crate::CoreError;

/// XOR: takes the first outgoing flow whose condition holds
pub struct ExclusiveGatewayBehavior;

#[async_trait]
impl ActivityBehavior for ExclusiveGatewayBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        execution.leave();
        Ok(())
    }

    async fn leave(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let process = execution.process().clone();
        let node = process.graph().node(execution.node_id())?;
        if process.graph().outgoing(&node.id).is_empty() {
            execution.end();
            return Ok(());
        }
        let flows = execution.select_flows(node, true).await?;
        execution.take(flows);
        Ok(())
    }
}

/// AND: joins every incoming branch, then forks on every outgoing flow
pub struct ParallelGatewayBehavior;

impl ParallelGatewayBehavior {
    fn take_all(execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let process = execution.process().clone();
        let outgoing = process.graph().outgoing(execution.node_id()).to_vec();
        if outgoing.is_empty() {
            execution.end();
        } else {
            execution.take(outgoing);
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityBehavior for ParallelGatewayBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let process = execution.process().clone();
        if process.graph().incoming(execution.node_id()).len() <= 1 {
            execution.leave();
            return Ok(());
        }
        let engine = execution.engine();
        let id = execution.id().clone();
        let node_id = execution.node_id().to_string();
        if let Some(continuing) = engine
            .join(execution.context(), &id, &node_id, JoinKind::Parallel)
            .await?
        {
            execution.switch_to(continuing);
            Self::take_all(execution)?;
        }
        Ok(())
    }

    async fn leave(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        Self::take_all(execution)
    }
}

/// OR: joins once no other branch can still arrive, then takes every flow whose condition holds
pub struct InclusiveGatewayBehavior;

#[async_trait]
impl ActivityBehavior for InclusiveGatewayBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let process = execution.process().clone();
        if process.graph().incoming(execution.node_id()).len() <= 1 {
            execution.leave();
            return Ok(());
        }
        let engine = execution.engine();
        let id = execution.id().clone();
        let node_id = execution.node_id().to_string();
        if let Some(continuing) = engine
            .join(execution.context(), &id, &node_id, JoinKind::Inclusive)
            .await?
        {
            execution.switch_to(continuing);
            let node = process.graph().node(&node_id)?;
            if process.graph().outgoing(&node_id).is_empty() {
                execution.end();
            } else {
                let flows = execution.select_flows(node, false).await?;
                execution.take(flows);
            }
        }
        Ok(())
    }
}

/// Waits on the catch events behind its outgoing flows and follows the first to fire
pub struct EventBasedGatewayBehavior;

#[async_trait]
impl ActivityBehavior for EventBasedGatewayBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let process = execution.process().clone();
        let graph = process.graph();
        for flow_id in graph.outgoing(execution.node_id()) {
            let target = graph.node(&graph.flow(flow_id)?.target)?;
            match &target.kind {
                NodeKind::IntermediateCatchEvent { event } => match event {
                    CatchEventDefinition::Timer(timer) => {
                        execution
                            .schedule_timer(timer, TIMER_TRANSITION, Some(target.id.clone()))
                            .await?;
                    }
                    CatchEventDefinition::Message(name) => {
                        execution
                            .subscribe(EventType::Message, name, &target.id)
                            .await?;
                    }
                    CatchEventDefinition::Signal(name) => {
                        execution
                            .subscribe(EventType::Signal, name, &target.id)
                            .await?;
                    }
                },
                _ => {
                    return Err(CoreError::ConfigurationError(format!(
                        "Event-based gateway {} must only lead to intermediate catch events",
                        execution.node_id()
                    )))
                }
            }
        }
        Ok(())
    }

    async fn trigger(
        &self,
        execution: &mut ActivityExecution<'_>,
        signal: Option<&str>,
    ) -> Result<(), CoreError> {
        let process = execution.process().clone();
        let graph = process.graph();
        let target_id = signal.ok_or_else(|| {
            CoreError::BehaviorError(format!(
                "Event-based gateway {} was triggered without naming the event",
                execution.node_id()
            ))
        })?;
        let leads_to_target = graph
            .outgoing(execution.node_id())
            .iter()
            .filter_map(|flow_id| graph.flow(flow_id).ok())
            .any(|flow| flow.target == target_id);
        if !leads_to_target {
            return Err(CoreError::BehaviorError(format!(
                "{} does not follow event-based gateway {}",
                target_id,
                execution.node_id()
            )));
        }
        let target = graph.node(target_id)?;

        execution.record_activity_end().await?;
        let mut entity = execution.execution().await?;
        entity.activity_id = Some(target.id.clone());
        let history = execution.engine().history();
        let ctx = execution.context();
        ctx.update(entity.clone());
        history.record_activity_start(ctx, &entity, target).await?;
        let timestamp = ctx.now();
        ctx.record_event(EngineEvent::ActivityStarted {
            process_instance_id: entity.process_instance_id.clone(),
            execution_id: entity.id.clone(),
            activity_id: target.id.clone(),
            timestamp,
        });
        execution.leave();
        Ok(())
    }
}
