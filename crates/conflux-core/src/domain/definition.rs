use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::CoreError;

/// A process graph as handed over by the definition compiler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Process key; versions of the same key share it
    pub key: String,

    /// Human-readable name of the process
    #[serde(default)]
    pub name: Option<String>,

    /// Owning tenant
    #[serde(default)]
    pub tenant_id: Option<String>,

    /// Activities, gateways and events
    pub nodes: Vec<Node>,

    /// Sequence flows between nodes
    #[serde(default)]
    pub flows: Vec<SequenceFlow>,
}

/// One element of the process graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node id, unique within the definition
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Node type and type-specific configuration
    #[serde(flatten)]
    pub kind: NodeKind,

    /// Id of the containing sub-process, `None` for top-level nodes
    #[serde(default)]
    pub parent: Option<String>,

    /// Defer execution of this node to an async job
    #[serde(default)]
    pub async_before: bool,

    /// Whether jobs created for this node are exclusive
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,

    /// Multi-instance loop characteristics
    #[serde(default)]
    pub multi_instance: Option<MultiInstanceConfig>,

    /// Flow taken by exclusive/inclusive gateways when no condition matches
    #[serde(default)]
    pub default_flow: Option<String>,
}

fn default_exclusive() -> bool {
    true
}

fn default_true() -> bool {
    true
}

/// The construct a node stands for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Plain start event
    NoneStartEvent,
    /// Start event that instantiates the process on a timer
    TimerStartEvent {
        /// When to start
        timer: TimerDefinition,
    },
    /// Start event that instantiates the process when a message arrives
    MessageStartEvent {
        /// Message name
        message: String,
    },
    /// Plain end event
    NoneEndEvent,
    /// End event throwing a BPMN error
    ErrorEndEvent {
        /// Error code
        error_code: String,
    },
    /// End event cancelling the enclosing transaction
    CancelEndEvent,
    /// End event terminating the enclosing scope
    TerminateEndEvent,
    /// Human task
    UserTask {
        /// Assignee, if any
        #[serde(default)]
        assignee: Option<String>,
        /// Candidate users
        #[serde(default)]
        candidate_users: Vec<String>,
        /// Candidate groups
        #[serde(default)]
        candidate_groups: Vec<String>,
        /// Task priority
        #[serde(default = "default_priority")]
        priority: i32,
    },
    /// Task calling a registered delegate
    ServiceTask {
        /// Delegate name
        delegate: String,
        /// Fixed field values injected into the delegate
        #[serde(default)]
        fields: HashMap<String, serde_json::Value>,
    },
    /// Task evaluating a JMESPath expression over the visible variables
    ScriptTask {
        /// Expression
        script: String,
        /// Variable receiving the result
        #[serde(default)]
        result_variable: Option<String>,
    },
    /// Task performed outside the engine; passes through
    ManualTask,
    /// Task waiting for a message
    ReceiveTask {
        /// Message name
        message: String,
    },
    /// Task sending a message through a delegate
    SendTask {
        /// Delegate name
        delegate: String,
        /// Fixed field values injected into the delegate
        #[serde(default)]
        fields: HashMap<String, serde_json::Value>,
    },
    /// XOR gateway
    ExclusiveGateway,
    /// AND gateway
    ParallelGateway,
    /// OR gateway
    InclusiveGateway,
    /// Gateway routing on the first catch event to fire
    EventBasedGateway,
    /// Embedded sub-process
    SubProcess,
    /// Transaction sub-process
    Transaction,
    /// Call to another process definition
    CallActivity {
        /// Key of the called process
        called_element: String,
        /// Variables copied into the called instance; empty copies none
        #[serde(default)]
        in_variables: Vec<String>,
        /// Variables copied back on completion; empty copies none
        #[serde(default)]
        out_variables: Vec<String>,
    },
    /// Catch event in the middle of a flow
    IntermediateCatchEvent {
        /// What is awaited
        event: CatchEventDefinition,
    },
    /// Throw event in the middle of a flow
    IntermediateThrowEvent {
        /// Signal broadcast when passed, if any
        #[serde(default)]
        signal: Option<String>,
    },
    /// Event attached to an activity
    BoundaryEvent {
        /// Activity the event is attached to
        attached_to: String,
        /// Whether firing cancels the activity
        #[serde(default = "default_true")]
        cancel_activity: bool,
        /// Trigger
        event: BoundaryEventDefinition,
    },
    /// Node type resolved through a custom behavior factory
    Custom {
        /// Registered type name
        type_name: String,
        /// Opaque configuration
        #[serde(default)]
        config: serde_json::Value,
    },
}

fn default_priority() -> i32 {
    50
}

/// When a timer fires
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TimerDefinition {
    /// ISO-8601 duration from now, e.g. `PT5M`
    Duration(String),
    /// Fixed point in time
    Date(DateTime<Utc>),
    /// ISO-8601 repeating interval, e.g. `R3/PT10M`
    Cycle {
        /// Repeat expression
        expression: String,
        /// No repetition is scheduled after this instant
        #[serde(default)]
        end_date: Option<DateTime<Utc>>,
    },
}

/// What an intermediate catch event waits for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CatchEventDefinition {
    /// A timer
    Timer(TimerDefinition),
    /// A named message
    Message(String),
    /// A named signal
    Signal(String),
}

/// What triggers a boundary event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryEventDefinition {
    /// A timer
    Timer(TimerDefinition),
    /// A named message
    Message(String),
    /// A named signal
    Signal(String),
    /// A BPMN error; `None` catches every code
    Error(Option<String>),
    /// Cancellation of the attached transaction
    Cancel,
}

/// Multi-instance loop characteristics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiInstanceConfig {
    /// One instance after another instead of all at once
    #[serde(default)]
    pub sequential: bool,
    /// Fixed number of instances
    #[serde(default)]
    pub cardinality: Option<u32>,
    /// JMESPath expression yielding the collection to iterate
    #[serde(default)]
    pub collection: Option<String>,
    /// Local variable receiving the current element
    #[serde(default)]
    pub element_variable: Option<String>,
    /// JMESPath expression ending the loop early when truthy
    #[serde(default)]
    pub completion_condition: Option<String>,
}

/// Directed edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceFlow {
    /// Flow id
    pub id: String,
    /// Source node id
    pub source: String,
    /// Target node id
    pub target: String,
    /// JMESPath condition; unconditional when absent
    #[serde(default)]
    pub condition: Option<String>,
}

impl Node {
    /// Create a node with the given kind and defaults elsewhere
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            parent: None,
            async_before: false,
            exclusive: true,
            multi_instance: None,
            default_flow: None,
        }
    }

    /// Set the containing sub-process
    pub fn in_sub_process(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Mark the node as asynchronous
    pub fn async_before(mut self) -> Self {
        self.async_before = true;
        self
    }

    /// Set whether the node's jobs are exclusive
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Attach multi-instance characteristics
    pub fn multi_instance(mut self, config: MultiInstanceConfig) -> Self {
        self.multi_instance = Some(config);
        self
    }

    /// Set the default flow
    pub fn default_flow(mut self, flow_id: impl Into<String>) -> Self {
        self.default_flow = Some(flow_id.into());
        self
    }

    /// Set the display name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Short type tag used in history records and events
    pub fn type_name(&self) -> &str {
        match &self.kind {
            NodeKind::NoneStartEvent => "startEvent",
            NodeKind::TimerStartEvent { .. } => "timerStartEvent",
            NodeKind::MessageStartEvent { .. } => "messageStartEvent",
            NodeKind::NoneEndEvent => "endEvent",
            NodeKind::ErrorEndEvent { .. } => "errorEndEvent",
            NodeKind::CancelEndEvent => "cancelEndEvent",
            NodeKind::TerminateEndEvent => "terminateEndEvent",
            NodeKind::UserTask { .. } => "userTask",
            NodeKind::ServiceTask { .. } => "serviceTask",
            NodeKind::ScriptTask { .. } => "scriptTask",
            NodeKind::ManualTask => "manualTask",
            NodeKind::ReceiveTask { .. } => "receiveTask",
            NodeKind::SendTask { .. } => "sendTask",
            NodeKind::ExclusiveGateway => "exclusiveGateway",
            NodeKind::ParallelGateway => "parallelGateway",
            NodeKind::InclusiveGateway => "inclusiveGateway",
            NodeKind::EventBasedGateway => "eventBasedGateway",
            NodeKind::SubProcess => "subProcess",
            NodeKind::Transaction => "transaction",
            NodeKind::CallActivity { .. } => "callActivity",
            NodeKind::IntermediateCatchEvent { .. } => "intermediateCatchEvent",
            NodeKind::IntermediateThrowEvent { .. } => "intermediateThrowEvent",
            NodeKind::BoundaryEvent { .. } => "boundaryEvent",
            NodeKind::Custom { type_name, .. } => type_name,
        }
    }

    /// Whether this node is a start event of any kind
    pub fn is_start_event(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::NoneStartEvent
                | NodeKind::TimerStartEvent { .. }
                | NodeKind::MessageStartEvent { .. }
        )
    }

    /// Whether this node contains other nodes
    pub fn is_container(&self) -> bool {
        matches!(self.kind, NodeKind::SubProcess | NodeKind::Transaction)
    }
}

impl ProcessDefinition {
    /// Create an empty definition
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            tenant_id: None,
            nodes: Vec::new(),
            flows: Vec::new(),
        }
    }

    /// Add a node
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an unconditional flow
    pub fn flow(
        mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.flows.push(SequenceFlow {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        });
        self
    }

    /// Add a conditional flow
    pub fn conditional_flow(
        mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        self.flows.push(SequenceFlow {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: Some(condition.into()),
        });
        self
    }

    /// Set the owning tenant
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Parse a definition from JSON
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Validated, indexed view over a [`ProcessDefinition`]
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    definition: ProcessDefinition,
    nodes: HashMap<String, usize>,
    flows: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<String>>,
    incoming: HashMap<String, Vec<String>>,
    boundary_events: HashMap<String, Vec<String>>,
}

const NO_FLOWS: &[String] = &[];

impl ProcessGraph {
    /// Index and validate a definition
    pub fn build(definition: ProcessDefinition) -> Result<Self, CoreError> {
        if definition.key.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "Process key must not be empty".to_string(),
            ));
        }

        let mut nodes = HashMap::with_capacity(definition.nodes.len());
        for (idx, node) in definition.nodes.iter().enumerate() {
            if nodes.insert(node.id.clone(), idx).is_some() {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate node ID: {}",
                    node.id
                )));
            }
        }

        let mut flows = HashMap::with_capacity(definition.flows.len());
        let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
        for (idx, flow) in definition.flows.iter().enumerate() {
            if nodes.contains_key(&flow.id) || flows.insert(flow.id.clone(), idx).is_some() {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate flow ID: {}",
                    flow.id
                )));
            }
            let source = nodes.get(&flow.source).ok_or_else(|| {
                CoreError::ValidationError(format!(
                    "Flow {} references non-existent source: {}",
                    flow.id, flow.source
                ))
            })?;
            let target = nodes.get(&flow.target).ok_or_else(|| {
                CoreError::ValidationError(format!(
                    "Flow {} references non-existent target: {}",
                    flow.id, flow.target
                ))
            })?;
            if definition.nodes[*source].parent != definition.nodes[*target].parent {
                return Err(CoreError::ValidationError(format!(
                    "Flow {} crosses a sub-process boundary",
                    flow.id
                )));
            }
            outgoing
                .entry(flow.source.clone())
                .or_default()
                .push(flow.id.clone());
            incoming
                .entry(flow.target.clone())
                .or_default()
                .push(flow.id.clone());
        }

        let mut boundary_events: HashMap<String, Vec<String>> = HashMap::new();
        for node in &definition.nodes {
            if let Some(parent) = &node.parent {
                let container = nodes.get(parent).map(|idx| &definition.nodes[*idx]);
                if !container.map(Node::is_container).unwrap_or(false) {
                    return Err(CoreError::ValidationError(format!(
                        "Node {} is nested in {} which is not a sub-process",
                        node.id, parent
                    )));
                }
            }

            if let NodeKind::BoundaryEvent { attached_to, .. } = &node.kind {
                let host = nodes.get(attached_to).ok_or_else(|| {
                    CoreError::ValidationError(format!(
                        "Boundary event {} is attached to non-existent activity {}",
                        node.id, attached_to
                    ))
                })?;
                if definition.nodes[*host].parent != node.parent {
                    return Err(CoreError::ValidationError(format!(
                        "Boundary event {} must live in the scope of {}",
                        node.id, attached_to
                    )));
                }
                boundary_events
                    .entry(attached_to.clone())
                    .or_default()
                    .push(node.id.clone());
            }

            if let Some(default_flow) = &node.default_flow {
                let owned = outgoing
                    .get(&node.id)
                    .map(|flows| flows.contains(default_flow))
                    .unwrap_or(false);
                if !owned {
                    return Err(CoreError::ValidationError(format!(
                        "Default flow {} is not an outgoing flow of {}",
                        default_flow, node.id
                    )));
                }
            }

            if let Some(mi) = &node.multi_instance {
                if mi.cardinality.is_none() && mi.collection.is_none() {
                    return Err(CoreError::ValidationError(format!(
                        "Multi-instance activity {} needs a cardinality or a collection",
                        node.id
                    )));
                }
            }
        }

        let graph = Self {
            definition,
            nodes,
            flows,
            outgoing,
            incoming,
            boundary_events,
        };

        graph.initial()?;
        for node in &graph.definition.nodes {
            if node.is_container() {
                graph.start_node_of(Some(&node.id))?;
            }
        }

        Ok(graph)
    }

    /// The underlying definition
    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    /// Process key
    pub fn key(&self) -> &str {
        &self.definition.key
    }

    /// Look up a node
    pub fn node(&self, id: &str) -> Result<&Node, CoreError> {
        self.nodes
            .get(id)
            .map(|idx| &self.definition.nodes[*idx])
            .ok_or_else(|| CoreError::ActivityNotFound(id.to_string()))
    }

    /// Look up a flow
    pub fn flow(&self, id: &str) -> Result<&SequenceFlow, CoreError> {
        self.flows
            .get(id)
            .map(|idx| &self.definition.flows[*idx])
            .ok_or_else(|| CoreError::ActivityNotFound(id.to_string()))
    }

    /// All nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.definition.nodes.iter()
    }

    /// Ids of the flows leaving a node
    pub fn outgoing(&self, node_id: &str) -> &[String] {
        self.outgoing
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(NO_FLOWS)
    }

    /// Ids of the flows entering a node
    pub fn incoming(&self, node_id: &str) -> &[String] {
        self.incoming
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(NO_FLOWS)
    }

    /// Ids of the boundary events attached to an activity
    pub fn boundary_events(&self, node_id: &str) -> &[String] {
        self.boundary_events
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(NO_FLOWS)
    }

    /// Whether entering this node creates an activity scope execution
    pub fn needs_activity_scope(&self, node: &Node) -> bool {
        node.multi_instance.is_some() || !self.boundary_events(&node.id).is_empty()
    }

    /// The node a plain process start begins at: the top-level none start event,
    /// or the only top-level start event
    pub fn initial(&self) -> Result<&Node, CoreError> {
        self.start_node_of(None)
    }

    /// The start event of a container (`None` for the process level)
    pub fn start_node_of(&self, container: Option<&str>) -> Result<&Node, CoreError> {
        let starts: Vec<&Node> = self
            .definition
            .nodes
            .iter()
            .filter(|n| n.is_start_event() && n.parent.as_deref() == container)
            .collect();
        let none_start = starts
            .iter()
            .find(|n| matches!(n.kind, NodeKind::NoneStartEvent));
        match (none_start, starts.as_slice()) {
            (Some(node), _) => Ok(node),
            (None, [only]) => Ok(only),
            _ => Err(CoreError::ValidationError(format!(
                "{} must have exactly one start event",
                container.unwrap_or("Process")
            ))),
        }
    }

    /// Top-level start events carrying a timer
    pub fn timer_start_events(&self) -> Vec<&Node> {
        self.definition
            .nodes
            .iter()
            .filter(|n| n.parent.is_none() && matches!(n.kind, NodeKind::TimerStartEvent { .. }))
            .collect()
    }

    /// Top-level message start event for a message name
    pub fn message_start_event(&self, message: &str) -> Option<&Node> {
        self.definition.nodes.iter().find(|n| {
            n.parent.is_none()
                && matches!(&n.kind, NodeKind::MessageStartEvent { message: m } if m == message)
        })
    }

    /// Nodes reachable from `from` along sequence flows, within the same container
    pub fn reachable_from(&self, from: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![from.to_string()];
        while let Some(current) = stack.pop() {
            for flow_id in self.outgoing(&current) {
                if let Ok(flow) = self.flow(flow_id) {
                    if seen.insert(flow.target.clone()) {
                        stack.push(flow.target.clone());
                    }
                }
            }
        }
        seen
    }
}
