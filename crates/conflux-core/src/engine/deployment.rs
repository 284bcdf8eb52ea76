use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::behavior::multi_instance::MultiInstanceBehavior;
use crate::behavior::ActivityBehavior;
use crate::domain::definition::ProcessGraph;
use crate::types::ProcessDefinitionId;
use crate::CoreError;

/// A deployed definition version together with the behaviors of its nodes
pub struct DeployedProcess {
    id: ProcessDefinitionId,
    version: u32,
    graph: ProcessGraph,
    behaviors: HashMap<String, Arc<dyn ActivityBehavior>>,
    multi_instance: HashMap<String, Arc<MultiInstanceBehavior>>,
}

impl std::fmt::Debug for DeployedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployedProcess")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("nodes", &self.behaviors.len())
            .finish()
    }
}

impl DeployedProcess {
    pub(crate) fn new(
        version: u32,
        graph: ProcessGraph,
        behaviors: HashMap<String, Arc<dyn ActivityBehavior>>,
        multi_instance: HashMap<String, Arc<MultiInstanceBehavior>>,
    ) -> Self {
        let id = definition_id(graph.key(), version, graph.definition().tenant_id.as_deref());
        Self {
            id,
            version,
            graph,
            behaviors,
            multi_instance,
        }
    }

    /// Definition id
    pub fn id(&self) -> &ProcessDefinitionId {
        &self.id
    }

    /// Process key
    pub fn key(&self) -> &str {
        self.graph.key()
    }

    /// Version number, starting at 1 per key and tenant
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Owning tenant
    pub fn tenant_id(&self) -> Option<&str> {
        self.graph.definition().tenant_id.as_deref()
    }

    /// Validated graph
    pub fn graph(&self) -> &ProcessGraph {
        &self.graph
    }

    /// Behavior of a node
    pub fn behavior(&self, node_id: &str) -> Result<Arc<dyn ActivityBehavior>, CoreError> {
        self.behaviors
            .get(node_id)
            .cloned()
            .ok_or_else(|| CoreError::ActivityNotFound(node_id.to_string()))
    }

    /// Multi-instance wrapper of a node, if it has loop characteristics
    pub fn multi_instance(&self, node_id: &str) -> Option<Arc<MultiInstanceBehavior>> {
        self.multi_instance.get(node_id).cloned()
    }
}

/// `key:version`, prefixed by the tenant when there is one
pub fn definition_id(key: &str, version: u32, tenant_id: Option<&str>) -> ProcessDefinitionId {
    match tenant_id {
        Some(tenant) => ProcessDefinitionId(format!("{}:{}:{}", tenant, key, version)),
        None => ProcessDefinitionId(format!("{}:{}", key, version)),
    }
}

type LatestKey = (Option<String>, String);

/// Deployed definitions by id, plus the latest version per key and tenant
#[derive(Debug, Default)]
pub struct DeploymentCache {
    by_id: DashMap<ProcessDefinitionId, Arc<DeployedProcess>>,
    latest: DashMap<LatestKey, Arc<DeployedProcess>>,
}

impl DeploymentCache {
    /// Version the next deployment of `key` receives
    pub fn next_version(&self, key: &str, tenant_id: Option<&str>) -> u32 {
        self.latest
            .get(&(tenant_id.map(str::to_string), key.to_string()))
            .map(|p| p.version() + 1)
            .unwrap_or(1)
    }

    /// Register a deployed process; returns the version it replaces as latest
    pub fn add(&self, process: Arc<DeployedProcess>) -> Option<Arc<DeployedProcess>> {
        self.by_id.insert(process.id().clone(), process.clone());
        let key = (
            process.tenant_id().map(str::to_string),
            process.key().to_string(),
        );
        self.latest.insert(key, process)
    }

    /// Look up a definition by id
    pub fn get(&self, id: &ProcessDefinitionId) -> Result<Arc<DeployedProcess>, CoreError> {
        self.by_id
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| CoreError::ProcessDefinitionNotFound(id.to_string()))
    }

    /// Latest version of `key`; a tenant falls back to the shared definition
    pub fn latest(&self, key: &str, tenant_id: Option<&str>) -> Result<Arc<DeployedProcess>, CoreError> {
        let own = self
            .latest
            .get(&(tenant_id.map(str::to_string), key.to_string()))
            .map(|p| p.value().clone());
        let shared = || {
            self.latest
                .get(&(None, key.to_string()))
                .map(|p| p.value().clone())
        };
        own.or_else(shared)
            .ok_or_else(|| CoreError::ProcessDefinitionNotFound(key.to_string()))
    }

    /// Latest versions whose top-level message start event listens for `message`
    pub fn by_start_message(&self, message: &str) -> Vec<Arc<DeployedProcess>> {
        self.latest
            .iter()
            .filter(|p| p.graph().message_start_event(message).is_some())
            .map(|p| p.value().clone())
            .collect()
    }

    /// Every deployed definition
    pub fn all(&self) -> Vec<Arc<DeployedProcess>> {
        self.by_id.iter().map(|p| p.value().clone()).collect()
    }
}
