use std::collections::HashMap;
use std::sync::Arc;

use super::events::{
    CancelEndEventBehavior, ErrorEndEventBehavior, IntermediateCatchEventBehavior,
    IntermediateThrowEventBehavior, NoneEndEventBehavior, TerminateEndEventBehavior,
};
use super::gateways::{
    EventBasedGatewayBehavior, ExclusiveGatewayBehavior, InclusiveGatewayBehavior,
    ParallelGatewayBehavior,
};
use super::multi_instance::MultiInstanceBehavior;
use super::subprocess::{CallActivityBehavior, SubProcessBehavior};
use super::tasks::{
    PassThroughBehavior, ReceiveTaskBehavior, ScriptTaskBehavior, ServiceTaskBehavior,
    ServiceTaskDelegate, UserTaskBehavior,
};
use super::ActivityBehavior;
use crate::domain::definition::{Node, NodeKind, ProcessGraph};
use crate::engine::deployment::DeployedProcess;
use crate::CoreError;

/// Factory creating the behavior of a custom node type from its node
pub type BehaviorFactory =
    Arc<dyn Fn(&Node) -> Result<Arc<dyn ActivityBehavior>, CoreError> + Send + Sync>;

/// Creates the behavior of every node of a definition at deploy time
#[derive(Clone, Default)]
pub struct BehaviorRegistry {
    delegates: HashMap<String, Arc<dyn ServiceTaskDelegate>>,
    custom: HashMap<String, BehaviorFactory>,
}

impl std::fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorRegistry")
            .field("delegates", &self.delegates.keys().collect::<Vec<_>>())
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BehaviorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delegate used by service and send tasks
    pub fn register_delegate(&mut self, name: impl Into<String>, delegate: Arc<dyn ServiceTaskDelegate>) {
        self.delegates.insert(name.into(), delegate);
    }

    /// Register a factory for a custom node type
    pub fn register_custom(&mut self, type_name: impl Into<String>, factory: BehaviorFactory) {
        self.custom.insert(type_name.into(), factory);
    }

    fn delegate(&self, node: &Node, name: &str) -> Result<Arc<dyn ServiceTaskDelegate>, CoreError> {
        self.delegates.get(name).cloned().ok_or_else(|| {
            CoreError::ConfigurationError(format!(
                "Unknown delegate {} referenced by {}",
                name, node.id
            ))
        })
    }

    /// Behavior for one node, without multi-instance decoration
    pub fn create(&self, node: &Node) -> Result<Arc<dyn ActivityBehavior>, CoreError> {
        let behavior: Arc<dyn ActivityBehavior> = match &node.kind {
            NodeKind::NoneStartEvent
            | NodeKind::TimerStartEvent { .. }
            | NodeKind::MessageStartEvent { .. }
            | NodeKind::ManualTask
            | NodeKind::BoundaryEvent { .. } => Arc::new(PassThroughBehavior),
            NodeKind::NoneEndEvent => Arc::new(NoneEndEventBehavior),
            NodeKind::ErrorEndEvent { error_code } => {
                Arc::new(ErrorEndEventBehavior::new(error_code.clone()))
            }
            NodeKind::CancelEndEvent => Arc::new(CancelEndEventBehavior),
            NodeKind::TerminateEndEvent => Arc::new(TerminateEndEventBehavior),
            NodeKind::UserTask {
                assignee,
                candidate_users,
                candidate_groups,
                priority,
            } => Arc::new(UserTaskBehavior::new(
                assignee.clone(),
                candidate_users.clone(),
                candidate_groups.clone(),
                *priority,
            )),
            NodeKind::ServiceTask { delegate, fields } | NodeKind::SendTask { delegate, fields } => {
                Arc::new(ServiceTaskBehavior::new(
                    self.delegate(node, delegate)?,
                    fields.clone(),
                ))
            }
            NodeKind::ScriptTask {
                script,
                result_variable,
            } => {
                jmespath::compile(script.strip_prefix("$.").unwrap_or(script)).map_err(|e| {
                    CoreError::ConfigurationError(format!(
                        "Invalid script of {}: {}",
                        node.id, e
                    ))
                })?;
                Arc::new(ScriptTaskBehavior::new(script.clone(), result_variable.clone()))
            }
            NodeKind::ReceiveTask { message } => Arc::new(ReceiveTaskBehavior::new(message.clone())),
            NodeKind::ExclusiveGateway => Arc::new(ExclusiveGatewayBehavior),
            NodeKind::ParallelGateway => Arc::new(ParallelGatewayBehavior),
            NodeKind::InclusiveGateway => Arc::new(InclusiveGatewayBehavior),
            NodeKind::EventBasedGateway => Arc::new(EventBasedGatewayBehavior),
            NodeKind::SubProcess | NodeKind::Transaction => Arc::new(SubProcessBehavior),
            NodeKind::CallActivity {
                called_element,
                in_variables,
                ..
            } => Arc::new(CallActivityBehavior::new(
                called_element.clone(),
                in_variables.clone(),
            )),
            NodeKind::IntermediateCatchEvent { event } => {
                Arc::new(IntermediateCatchEventBehavior::new(event.clone()))
            }
            NodeKind::IntermediateThrowEvent { signal } => {
                Arc::new(IntermediateThrowEventBehavior::new(signal.clone()))
            }
            NodeKind::Custom { type_name, .. } => {
                let factory = self.custom.get(type_name).ok_or_else(|| {
                    CoreError::ConfigurationError(format!(
                        "Unknown node type {} of {}",
                        type_name, node.id
                    ))
                })?;
                factory(node)?
            }
        };
        Ok(behavior)
    }

    fn validate(graph: &ProcessGraph, node: &Node) -> Result<(), CoreError> {
        if matches!(node.kind, NodeKind::EventBasedGateway) {
            for flow_id in graph.outgoing(&node.id) {
                let target = graph.node(&graph.flow(flow_id)?.target)?;
                if !matches!(target.kind, NodeKind::IntermediateCatchEvent { .. }) {
                    return Err(CoreError::ConfigurationError(format!(
                        "Event-based gateway {} leads to {} which is not an intermediate catch event",
                        node.id, target.id
                    )));
                }
            }
        }
        if let Some(mi) = &node.multi_instance {
            for expression in mi.collection.iter().chain(mi.completion_condition.iter()) {
                jmespath::compile(expression.strip_prefix("$.").unwrap_or(expression)).map_err(
                    |e| {
                        CoreError::ConfigurationError(format!(
                            "Invalid multi-instance expression of {}: {}",
                            node.id, e
                        ))
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Create every behavior of `graph`; any unknown kind or delegate fails the deployment
    pub fn build(&self, version: u32, graph: ProcessGraph) -> Result<DeployedProcess, CoreError> {
        let mut behaviors = HashMap::new();
        let mut multi_instance = HashMap::new();
        for node in graph.nodes() {
            Self::validate(&graph, node)?;
            let behavior = self.create(node)?;
            if let Some(config) = &node.multi_instance {
                multi_instance.insert(
                    node.id.clone(),
                    Arc::new(MultiInstanceBehavior::new(behavior.clone(), config.clone())),
                );
            }
            behaviors.insert(node.id.clone(), behavior);
        }
        Ok(DeployedProcess::new(version, graph, behaviors, multi_instance))
    }
}
