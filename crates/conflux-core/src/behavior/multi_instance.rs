use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::{ActivityBehavior, ActivityExecution};
use crate::domain::definition::MultiInstanceConfig;
use crate::domain::events::EngineEvent;
use crate::engine::agenda::Operation;
use crate::CoreError;

/// Total number of instances
pub const NR_OF_INSTANCES: &str = "nrOfInstances";
/// Instances completed so far
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
/// Instances currently running
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
/// Zero-based index of an instance
pub const LOOP_COUNTER: &str = "loopCounter";

/// Runs the decorated behavior once per element, one after another or all at once.
///
/// The wrapper executes on the multi-instance root, an activity scope
/// execution holding the counters as local variables. Sequential loops run
/// every instance on the root itself; parallel loops run each instance on its
/// own concurrent child of the root.
pub struct MultiInstanceBehavior {
    inner: Arc<dyn ActivityBehavior>,
    config: MultiInstanceConfig,
}

impl MultiInstanceBehavior {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn ActivityBehavior>, config: MultiInstanceConfig) -> Self {
        Self { inner, config }
    }

    /// The decorated behavior
    pub fn inner(&self) -> &Arc<dyn ActivityBehavior> {
        &self.inner
    }

    async fn elements(
        &self,
        execution: &mut ActivityExecution<'_>,
    ) -> Result<(usize, Option<Vec<Value>>), CoreError> {
        if let Some(collection) = &self.config.collection {
            return match execution.evaluate(collection).await? {
                Value::Array(items) => Ok((items.len(), Some(items))),
                Value::Null => Ok((0, Some(Vec::new()))),
                other => Err(CoreError::BehaviorError(format!(
                    "Collection of multi-instance activity {} is not an array: {}",
                    execution.node_id(),
                    other
                ))),
            };
        }
        let cardinality = self.config.cardinality.unwrap_or(0);
        let count = usize::try_from(cardinality).map_err(|_| {
            CoreError::BehaviorError(format!(
                "Cardinality {} of multi-instance activity {} is too large",
                cardinality,
                execution.node_id()
            ))
        })?;
        Ok((count, None))
    }

    async fn counter(
        &self,
        execution: &mut ActivityExecution<'_>,
        name: &str,
    ) -> Result<usize, CoreError> {
        let engine = execution.engine();
        let id = execution.id().clone();
        let Some(value) = engine.local_variable(execution.context(), &id, name).await? else {
            return Ok(0);
        };
        value
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| {
                CoreError::BehaviorError(format!(
                    "{} of execution {} is not a non-negative count: {}",
                    name, id, value
                ))
            })
    }

    async fn set_element(
        &self,
        execution: &mut ActivityExecution<'_>,
        index: usize,
        elements: Option<&[Value]>,
    ) -> Result<(), CoreError> {
        execution.set_variable_local(LOOP_COUNTER, json!(index)).await?;
        if let (Some(name), Some(elements)) = (&self.config.element_variable, elements) {
            let element = elements.get(index).cloned().unwrap_or(Value::Null);
            execution.set_variable_local(name, element).await?;
        }
        Ok(())
    }

    async fn completion_reached(
        &self,
        execution: &mut ActivityExecution<'_>,
        completed: usize,
        total: usize,
    ) -> Result<bool, CoreError> {
        if completed >= total {
            return Ok(true);
        }
        match &self.config.completion_condition {
            Some(condition) => execution.evaluate_condition(condition).await,
            None => Ok(false),
        }
    }

    async fn run_instance(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let process = execution.process().clone();
        let node = process.graph().node(execution.node_id())?;
        let entity = execution.execution().await?;
        let history = execution.engine().history();
        let ctx = execution.context();
        history.record_activity_start(ctx, &entity, node).await?;
        let timestamp = ctx.now();
        ctx.record_event(EngineEvent::ActivityStarted {
            process_instance_id: entity.process_instance_id.clone(),
            execution_id: entity.id.clone(),
            activity_id: node.id.clone(),
            timestamp,
        });
        self.inner.execute(execution).await
    }
}

#[async_trait]
impl ActivityBehavior for MultiInstanceBehavior {
    async fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        let (total, elements) = self.elements(execution).await?;
        debug!(
            execution_id = %execution.id(),
            activity_id = %execution.node_id(),
            instances = total,
            sequential = self.config.sequential,
            "Starting multi-instance activity"
        );
        if total == 0 {
            return execution.take_outgoing_flows().await;
        }

        execution.set_variable_local(NR_OF_INSTANCES, json!(total)).await?;
        execution
            .set_variable_local(NR_OF_COMPLETED_INSTANCES, json!(0))
            .await?;

        if self.config.sequential {
            execution
                .set_variable_local(NR_OF_ACTIVE_INSTANCES, json!(1))
                .await?;
            self.set_element(execution, 0, elements.as_deref()).await?;
            return self.run_instance(execution).await;
        }

        execution
            .set_variable_local(NR_OF_ACTIVE_INSTANCES, json!(total))
            .await?;
        let engine = execution.engine();
        let root_id = execution.id().clone();
        let node_id = execution.node_id().to_string();
        let mut operations = Vec::with_capacity(total);
        for index in 0..total {
            let child = engine
                .create_concurrent_child(execution.context(), &root_id, &node_id)
                .await?;
            execution.switch_to(child.id.clone());
            self.set_element(execution, index, elements.as_deref()).await?;
            operations.push(Operation::ExecuteActivity {
                execution_id: child.id,
                skip_async: true,
            });
        }
        execution.switch_to(root_id);
        execution.context().push_operations_in_order(operations);
        Ok(())
    }

    async fn trigger(
        &self,
        execution: &mut ActivityExecution<'_>,
        signal: Option<&str>,
    ) -> Result<(), CoreError> {
        self.inner.trigger(execution, signal).await
    }

    async fn leave(&self, execution: &mut ActivityExecution<'_>) -> Result<(), CoreError> {
        if self.config.sequential {
            let completed = self.counter(execution, NR_OF_COMPLETED_INSTANCES).await? + 1;
            let next = self.counter(execution, LOOP_COUNTER).await? + 1;
            let total = self.counter(execution, NR_OF_INSTANCES).await?;
            execution
                .set_variable_local(NR_OF_COMPLETED_INSTANCES, json!(completed))
                .await?;
            if self.completion_reached(execution, completed, total).await? || next >= total {
                execution
                    .set_variable_local(NR_OF_ACTIVE_INSTANCES, json!(0))
                    .await?;
                return execution.take_outgoing_flows().await;
            }
            let (_, elements) = self.elements(execution).await?;
            self.set_element(execution, next, elements.as_deref()).await?;
            return self.run_instance(execution).await;
        }

        let engine = execution.engine();
        let instance = execution.execution().await?;
        let root_id = instance.parent_id.clone().ok_or_else(|| {
            CoreError::IllegalState(format!(
                "Multi-instance execution {} has no root",
                instance.id
            ))
        })?;
        engine
            .remove_execution(execution.context(), &instance, None)
            .await?;
        execution.switch_to(root_id.clone());

        let completed = self.counter(execution, NR_OF_COMPLETED_INSTANCES).await? + 1;
        let active = self
            .counter(execution, NR_OF_ACTIVE_INSTANCES)
            .await?
            .saturating_sub(1);
        let total = self.counter(execution, NR_OF_INSTANCES).await?;
        execution
            .set_variable_local(NR_OF_COMPLETED_INSTANCES, json!(completed))
            .await?;
        execution
            .set_variable_local(NR_OF_ACTIVE_INSTANCES, json!(active))
            .await?;

        if self.completion_reached(execution, completed, total).await? {
            debug!(
                execution_id = %root_id,
                completed,
                total,
                "Multi-instance activity completed"
            );
            engine
                .destroy_children(execution.context(), &root_id, "multi-instance completed")
                .await?;
            return execution.take_outgoing_flows().await;
        }
        Ok(())
    }
}
