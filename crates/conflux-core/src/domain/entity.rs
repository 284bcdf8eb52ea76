use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::execution::ExecutionEntity;
use crate::domain::history::{
    HistoricActivityInstance, HistoricDetail, HistoricIdentityLink, HistoricProcessInstance,
    HistoricTaskInstance, HistoricVariableInstance,
};
use crate::domain::job::JobEntity;
use crate::domain::subscription::EventSubscription;
use crate::domain::task::TaskEntity;
use crate::domain::variable::VariableInstance;

/// Store partition an entity lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// Executions
    Execution,
    /// Jobs waiting for their due date
    TimerJob,
    /// Executable jobs
    Job,
    /// Jobs of suspended process instances
    SuspendedJob,
    /// Jobs with exhausted retries
    DeadLetterJob,
    /// User tasks
    Task,
    /// Runtime variables
    VariableInstance,
    /// Message and signal subscriptions
    EventSubscription,
    /// Historic process instances
    HistoricProcessInstance,
    /// Historic activity instances
    HistoricActivityInstance,
    /// Historic tasks
    HistoricTaskInstance,
    /// Historic variables
    HistoricVariableInstance,
    /// Variable update trail
    HistoricDetail,
    /// Historic identity links
    HistoricIdentityLink,
}

impl EntityKind {
    /// The four job partitions
    pub const JOB_KINDS: [EntityKind; 4] = [
        EntityKind::TimerJob,
        EntityKind::Job,
        EntityKind::SuspendedJob,
        EntityKind::DeadLetterJob,
    ];

    /// Kind used to key the entity by id; all job partitions share one family
    pub fn family(self) -> EntityKind {
        match self {
            EntityKind::TimerJob
            | EntityKind::Job
            | EntityKind::SuspendedJob
            | EntityKind::DeadLetterJob => EntityKind::Job,
            other => other,
        }
    }

    /// Whether this is one of the job partitions
    pub fn is_job(self) -> bool {
        self.family() == EntityKind::Job
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Any persistent entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Entity {
    /// Execution
    Execution(ExecutionEntity),
    /// Job in any partition
    Job(JobEntity),
    /// User task
    Task(TaskEntity),
    /// Runtime variable
    Variable(VariableInstance),
    /// Event subscription
    EventSubscription(EventSubscription),
    /// Historic process instance
    HistoricProcessInstance(HistoricProcessInstance),
    /// Historic activity instance
    HistoricActivityInstance(HistoricActivityInstance),
    /// Historic task
    HistoricTaskInstance(HistoricTaskInstance),
    /// Historic variable
    HistoricVariableInstance(HistoricVariableInstance),
    /// Variable update detail
    HistoricDetail(HistoricDetail),
    /// Historic identity link
    HistoricIdentityLink(HistoricIdentityLink),
}

/// Typed access to one variant of [`Entity`]
pub trait PersistentEntity: Clone + Send + Sync + 'static {
    /// Family kind of this entity type
    const KIND: EntityKind;

    /// Entity id
    fn entity_id(&self) -> &str;

    /// Wrap into an [`Entity`]
    fn into_entity(self) -> Entity;

    /// Unwrap from an [`Entity`] of the matching variant
    fn from_entity(entity: Entity) -> Option<Self>;

    /// Borrow from an [`Entity`] of the matching variant
    fn from_entity_ref(entity: &Entity) -> Option<&Self>;
}

macro_rules! persistent_entity {
    ($ty:ty, $variant:ident, $kind:expr, |$e:ident| $id:expr) => {
        impl PersistentEntity for $ty {
            const KIND: EntityKind = $kind;

            fn entity_id(&self) -> &str {
                let $e = self;
                $id
            }

            fn into_entity(self) -> Entity {
                Entity::$variant(self)
            }

            fn from_entity(entity: Entity) -> Option<Self> {
                match entity {
                    Entity::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn from_entity_ref(entity: &Entity) -> Option<&Self> {
                match entity {
                    Entity::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

persistent_entity!(ExecutionEntity, Execution, EntityKind::Execution, |e| e.id.as_str());
persistent_entity!(JobEntity, Job, EntityKind::Job, |e| e.id.as_str());
persistent_entity!(TaskEntity, Task, EntityKind::Task, |e| e.id.as_str());
persistent_entity!(VariableInstance, Variable, EntityKind::VariableInstance, |e| &e.id);
persistent_entity!(EventSubscription, EventSubscription, EntityKind::EventSubscription, |e| &e.id);
persistent_entity!(
    HistoricProcessInstance,
    HistoricProcessInstance,
    EntityKind::HistoricProcessInstance,
    |e| &e.id
);
persistent_entity!(
    HistoricActivityInstance,
    HistoricActivityInstance,
    EntityKind::HistoricActivityInstance,
    |e| &e.id
);
persistent_entity!(
    HistoricTaskInstance,
    HistoricTaskInstance,
    EntityKind::HistoricTaskInstance,
    |e| &e.id
);
persistent_entity!(
    HistoricVariableInstance,
    HistoricVariableInstance,
    EntityKind::HistoricVariableInstance,
    |e| &e.id
);
persistent_entity!(HistoricDetail, HistoricDetail, EntityKind::HistoricDetail, |e| &e.id);
persistent_entity!(
    HistoricIdentityLink,
    HistoricIdentityLink,
    EntityKind::HistoricIdentityLink,
    |e| &e.id
);

impl Entity {
    /// Partition the entity belongs in
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Execution(_) => EntityKind::Execution,
            Entity::Job(job) => job.state.entity_kind(),
            Entity::Task(_) => EntityKind::Task,
            Entity::Variable(_) => EntityKind::VariableInstance,
            Entity::EventSubscription(_) => EntityKind::EventSubscription,
            Entity::HistoricProcessInstance(_) => EntityKind::HistoricProcessInstance,
            Entity::HistoricActivityInstance(_) => EntityKind::HistoricActivityInstance,
            Entity::HistoricTaskInstance(_) => EntityKind::HistoricTaskInstance,
            Entity::HistoricVariableInstance(_) => EntityKind::HistoricVariableInstance,
            Entity::HistoricDetail(_) => EntityKind::HistoricDetail,
            Entity::HistoricIdentityLink(_) => EntityKind::HistoricIdentityLink,
        }
    }

    /// Entity id
    pub fn id(&self) -> &str {
        match self {
            Entity::Execution(e) => e.entity_id(),
            Entity::Job(e) => e.entity_id(),
            Entity::Task(e) => e.entity_id(),
            Entity::Variable(e) => e.entity_id(),
            Entity::EventSubscription(e) => e.entity_id(),
            Entity::HistoricProcessInstance(e) => e.entity_id(),
            Entity::HistoricActivityInstance(e) => e.entity_id(),
            Entity::HistoricTaskInstance(e) => e.entity_id(),
            Entity::HistoricVariableInstance(e) => e.entity_id(),
            Entity::HistoricDetail(e) => e.entity_id(),
            Entity::HistoricIdentityLink(e) => e.entity_id(),
        }
    }

    /// Optimistic locking revision
    pub fn revision(&self) -> u32 {
        match self {
            Entity::Execution(e) => e.revision,
            Entity::Job(e) => e.revision,
            Entity::Task(e) => e.revision,
            Entity::Variable(e) => e.revision,
            Entity::EventSubscription(e) => e.revision,
            Entity::HistoricProcessInstance(e) => e.revision,
            Entity::HistoricActivityInstance(e) => e.revision,
            Entity::HistoricTaskInstance(e) => e.revision,
            Entity::HistoricVariableInstance(e) => e.revision,
            Entity::HistoricDetail(e) => e.revision,
            Entity::HistoricIdentityLink(e) => e.revision,
        }
    }

    /// Overwrite the revision
    pub fn set_revision(&mut self, revision: u32) {
        match self {
            Entity::Execution(e) => e.revision = revision,
            Entity::Job(e) => e.revision = revision,
            Entity::Task(e) => e.revision = revision,
            Entity::Variable(e) => e.revision = revision,
            Entity::EventSubscription(e) => e.revision = revision,
            Entity::HistoricProcessInstance(e) => e.revision = revision,
            Entity::HistoricActivityInstance(e) => e.revision = revision,
            Entity::HistoricTaskInstance(e) => e.revision = revision,
            Entity::HistoricVariableInstance(e) => e.revision = revision,
            Entity::HistoricDetail(e) => e.revision = revision,
            Entity::HistoricIdentityLink(e) => e.revision = revision,
        }
    }
}
