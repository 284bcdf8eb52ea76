use async_trait::async_trait;

use super::{ActivityBehavior, ActivityExecution};
use crate::domain::definition::CatchEventDefinition;
use crate::domain::subscription::EventType;
use crate::job::handler::TIMER_TRANSITION;
use crate::CoreError;

/// Plain end event: destroys the token
pub struct NoneEndEventBehavior;

#[async_trait]
impl ActivityBehavior for NoneEndEventBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        execution.end();
        Ok(())
    }
}

/// Throws a BPMN error towards the nearest matching error boundary event
pub struct ErrorEndEventBehavior {
    error_code: String,
}

impl ErrorEndEventBehavior {
    /// Behavior throwing `error_code`
    pub fn new(error_code: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
        }
    }
}

#[async_trait]
impl ActivityBehavior for ErrorEndEventBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        execution.record_activity_end().await?;
        execution.propagate_error(self.error_code.clone());
        Ok(())
    }
}

/// Cancels the enclosing transaction through its cancel boundary event
pub struct CancelEndEventBehavior;

#[async_trait]
impl ActivityBehavior for CancelEndEventBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        execution.record_activity_end().await?;
        let engine = execution.engine();
        let id = execution.id().clone();
        engine.cancel_transaction(execution.context(), &id).await
    }
}

/// Ends every token of the enclosing process instance or sub-process
pub struct TerminateEndEventBehavior;

#[async_trait]
impl ActivityBehavior for TerminateEndEventBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        execution.record_activity_end().await?;
        let engine = execution.engine();
        let id = execution.id().clone();
        let node_id = execution.node_id().to_string();
        engine.terminate(execution.context(), &id, &node_id).await
    }
}

/// Waits for a timer, message or signal in the middle of a flow
pub struct IntermediateCatchEventBehavior {
    event: CatchEventDefinition,
}

impl IntermediateCatchEventBehavior {
    /// Behavior waiting for `event`
    pub fn new(event: CatchEventDefinition) -> Self {
        Self { event }
    }
}

#[async_trait]
impl ActivityBehavior for IntermediateCatchEventBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let node_id = execution.node_id().to_string();
        match &self.event {
            CatchEventDefinition::Timer(timer) => {
                execution
                    .schedule_timer(timer, TIMER_TRANSITION, Some(node_id))
                    .await?;
            }
            CatchEventDefinition::Message(name) => {
                execution
                    .subscribe(EventType::Message, name, &node_id)
                    .await?;
            }
            CatchEventDefinition::Signal(name) => {
                execution.subscribe(EventType::Signal, name, &node_id).await?;
            }
        }
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

/// Passes through, broadcasting a signal first when one is configured
pub struct IntermediateThrowEventBehavior {
    signal: Option<String>,
}

impl IntermediateThrowEventBehavior {
    /// Behavior throwing `signal`, if any
    pub fn new(signal: Option<String>) -> Self {
        Self { signal }
    }
}

#[async_trait]
impl ActivityBehavior for IntermediateThrowEventBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        execution.leave();
        if let Some(signal) = &self.signal {
            let engine = execution.engine();
            engine
                .deliver_signal(execution.context(), signal, None)
                .await?;
        }
        Ok(())
    }
}
